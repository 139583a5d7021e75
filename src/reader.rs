use crate::channel::ChannelReply;
use crate::connection::{ConnectionBlockedNotification, ConnectionEvent, ConnectionInner, ConnectionStatus};
use crate::content::{CollectedContent, ContentCollector, ContentStart};
use crate::errors::*;
use crate::frames::OutputBuffer;
use crate::recovery;
use crate::transport::{FrameReader, Transport};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{CloseOk as ChannelCloseOk, FlowOk};
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use amq_protocol::protocol::AMQPClass;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

/// Spawn the connection's reader thread: the only place frames are read, and
/// the single demultiplexer routing them to channels.
pub(crate) fn spawn(
    connection: Arc<ConnectionInner>,
    reader: FrameReader,
    transport: Arc<Transport>,
) -> JoinHandle<()> {
    Builder::new()
        .name("burrow-reader".to_string())
        .spawn(move || run(connection, reader, transport))
        .expect("failed to spawn reader thread")
}

fn run(connection: Arc<ConnectionInner>, mut reader: FrameReader, transport: Arc<Transport>) {
    let mut collectors: HashMap<u16, ContentCollector> = HashMap::new();
    let recovery_epoch = connection.recovery_epoch();

    let result = loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => break Err(err),
        };
        transport.record_rx_activity();
        if let Err(err) = dispatch(
            &connection,
            &transport,
            &mut collectors,
            recovery_epoch,
            frame,
        ) {
            break Err(err);
        }
        if connection.status() == ConnectionStatus::Closed {
            break Ok(());
        }
    };

    match result {
        Ok(()) => debug!("reader thread exiting after clean close"),
        Err(err) => handle_stream_error(&connection, err),
    }
}

/// Classify a dead or misbehaving stream. During a client-initiated close the
/// socket going away is expected and swallowed; otherwise this is a network
/// failure that either starts the recovery protocol (on this same thread) or
/// terminates the session. Either way no thread is ever interrupted: waiters
/// get errors through their continuation queues and observers get an event.
fn handle_stream_error(connection: &Arc<ConnectionInner>, err: Error) {
    match connection.status() {
        ConnectionStatus::Closing | ConnectionStatus::Closed => {
            debug!("ignoring stream error during shutdown: {}", err);
            return;
        }
        _ => (),
    }

    warn!("network failure on connection: {}", err);
    connection.events.broadcast(ConnectionEvent::NetworkFailure {
        message: format!("{}", err),
    });

    let recoverable = connection.connector.is_some()
        && connection.tuning.automatic_recovery
        && match &err {
            Error::ServerClosedConnection { .. } => {
                connection.tuning.recover_from_connection_close
            }
            _ => true,
        };

    if !recoverable {
        connection.terminate(&err);
        return;
    }

    if connection
        .recovery_in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("recovery already in progress; reader exiting");
        return;
    }

    connection.set_status(ConnectionStatus::Disconnected);
    // unblock everything currently waiting on the dead transport
    connection.continuation.push_error(err.fanout());
    for chan in connection.channels_snapshot() {
        chan.continuation.push_error(err.fanout());
        chan.confirms.abort(&err);
    }

    recovery::run(connection, &err);
    connection.recovery_in_progress.store(false, Ordering::SeqCst);
}

fn dispatch(
    connection: &Arc<ConnectionInner>,
    transport: &Transport,
    collectors: &mut HashMap<u16, ContentCollector>,
    recovery_epoch: u64,
    frame: AMQPFrame,
) -> Result<()> {
    match frame {
        AMQPFrame::Heartbeat(_) => {
            trace!("received heartbeat");
            Ok(())
        }
        AMQPFrame::Method(0, class) => handle_connection_method(connection, transport, class),
        AMQPFrame::Method(channel_id, class) => handle_channel_method(
            connection,
            transport,
            collectors,
            recovery_epoch,
            channel_id,
            class,
        ),
        AMQPFrame::Header(channel_id, _class_id, header) => {
            let done = collectors
                .entry(channel_id)
                .or_insert_with(|| ContentCollector::new(recovery_epoch))
                .collect_header(*header)?;
            match done {
                Some(content) => route_content(connection, channel_id, content),
                None => Ok(()),
            }
        }
        AMQPFrame::Body(channel_id, payload) => {
            let done = collectors
                .entry(channel_id)
                .or_insert_with(|| ContentCollector::new(recovery_epoch))
                .collect_body(payload)?;
            match done {
                Some(content) => route_content(connection, channel_id, content),
                None => Ok(()),
            }
        }
        other => {
            error!("received unexpected frame {:?}", other);
            FrameUnexpectedSnafu.fail()
        }
    }
}

fn handle_connection_method(
    connection: &Arc<ConnectionInner>,
    transport: &Transport,
    class: AMQPClass,
) -> Result<()> {
    match class {
        AMQPClass::Connection(AmqpConnection::Close(close)) => {
            // acknowledge, then treat as a connection-level failure
            let mut buf = OutputBuffer::empty();
            buf.push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
            let _ = transport.write(&buf);
            ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail()
        }
        AMQPClass::Connection(AmqpConnection::CloseOk(close_ok)) => {
            connection
                .continuation
                .push(ChannelReply::Method(AMQPClass::Connection(
                    AmqpConnection::CloseOk(close_ok),
                )));
            Ok(())
        }
        AMQPClass::Connection(AmqpConnection::Blocked(blocked)) => {
            warn!("server blocked connection: {}", blocked.reason);
            connection
                .blocked
                .broadcast(ConnectionBlockedNotification::Blocked(blocked.reason));
            Ok(())
        }
        AMQPClass::Connection(AmqpConnection::Unblocked(_)) => {
            debug!("server unblocked connection");
            connection
                .blocked
                .broadcast(ConnectionBlockedNotification::Unblocked);
            Ok(())
        }
        other => {
            error!("do not know how to handle channel 0 method {:?}", other);
            FrameUnexpectedSnafu.fail()
        }
    }
}

fn handle_channel_method(
    connection: &Arc<ConnectionInner>,
    transport: &Transport,
    collectors: &mut HashMap<u16, ContentCollector>,
    recovery_epoch: u64,
    channel_id: u16,
    class: AMQPClass,
) -> Result<()> {
    let chan = match connection.channel_by_id(channel_id) {
        Some(chan) => chan,
        None => {
            // can happen briefly after a local close or server-side teardown
            warn!("dropping frame for unknown channel {}", channel_id);
            return Ok(());
        }
    };

    match class {
        AMQPClass::Channel(AmqpChannel::Close(close)) => {
            let mut buf = OutputBuffer::empty();
            buf.push_method(channel_id, AmqpChannel::CloseOk(ChannelCloseOk {}))?;
            let _ = transport.write(&buf);

            let err = Error::from_channel_close(channel_id, close.reply_code, close.reply_text);
            warn!("server closed channel {}: {}", channel_id, err);
            chan.fail(&err);
            connection
                .topology()
                .delete_recorded_consumers_on_channel(channel_id);
            connection.forget_channel(channel_id);
            collectors.remove(&channel_id);
            Ok(())
        }
        AMQPClass::Channel(AmqpChannel::Flow(flow)) => {
            // rare with RabbitMQ (it prefers TCP backpressure); acknowledge
            // without actually pausing publishers
            warn!(
                "server requested channel {} flow active={} - acknowledging only",
                channel_id, flow.active
            );
            let mut buf = OutputBuffer::empty();
            buf.push_method(
                channel_id,
                AmqpChannel::FlowOk(FlowOk {
                    active: flow.active,
                }),
            )?;
            let _ = transport.write(&buf);
            Ok(())
        }
        AMQPClass::Basic(AmqpBasic::Deliver(deliver)) => collectors
            .entry(channel_id)
            .or_insert_with(|| ContentCollector::new(recovery_epoch))
            .collect_method(ContentStart::Deliver(deliver)),
        AMQPClass::Basic(AmqpBasic::Return(ret)) => collectors
            .entry(channel_id)
            .or_insert_with(|| ContentCollector::new(recovery_epoch))
            .collect_method(ContentStart::Return(ret)),
        AMQPClass::Basic(AmqpBasic::GetOk(get_ok)) => collectors
            .entry(channel_id)
            .or_insert_with(|| ContentCollector::new(recovery_epoch))
            .collect_method(ContentStart::GetOk(get_ok)),
        AMQPClass::Basic(AmqpBasic::GetEmpty(_)) => {
            chan.continuation.push(ChannelReply::Get(Box::new(None)));
            Ok(())
        }
        AMQPClass::Basic(AmqpBasic::Ack(ack)) => {
            chan.confirms
                .handle_ack_or_nack(ack.delivery_tag, ack.multiple, false);
            Ok(())
        }
        AMQPClass::Basic(AmqpBasic::Nack(nack)) => {
            chan.confirms
                .handle_ack_or_nack(nack.delivery_tag, nack.multiple, true);
            Ok(())
        }
        AMQPClass::Basic(AmqpBasic::Cancel(cancel)) => {
            chan.handle_server_cancel(&cancel.consumer_tag);
            connection
                .topology()
                .delete_recorded_consumer(channel_id, &cancel.consumer_tag);
            Ok(())
        }
        // everything else is the synchronous reply some caller is blocked on
        other => {
            chan.continuation.push(ChannelReply::Method(other));
            Ok(())
        }
    }
}

fn route_content(
    connection: &Arc<ConnectionInner>,
    channel_id: u16,
    content: CollectedContent,
) -> Result<()> {
    let chan = match connection.channel_by_id(channel_id) {
        Some(chan) => chan,
        None => {
            warn!("dropping content for unknown channel {}", channel_id);
            return Ok(());
        }
    };
    match content {
        CollectedContent::Delivery {
            consumer_tag,
            delivery,
        } => chan.deliver(&consumer_tag, delivery),
        CollectedContent::Return(ret) => chan.handle_return(ret),
        CollectedContent::Get(get) => {
            chan.continuation.push(ChannelReply::Get(Box::new(Some(get))));
        }
    }
    Ok(())
}

use crate::channel::{ChannelInner, ChannelStatus};
use crate::connection::{ConnectionEvent, ConnectionInner, ConnectionStatus};
use crate::errors::*;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{Consume, ConsumeOk, Qos, QosOk};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{Open as ChannelOpen, OpenOk as ChannelOpenOk};
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::confirm::{Select as ConfirmSelect, SelectOk as ConfirmSelectOk};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    Bind as ExchangeBind, BindOk as ExchangeBindOk, Declare as ExchangeDeclare,
    DeclareOk as ExchangeDeclareOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    Bind as QueueBind, BindOk as QueueBindOk, Declare as QueueDeclare,
    DeclareOk as QueueDeclareOk,
};
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::tx::{Select as TxSelect, SelectOk as TxSelectOk};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;

/// Drive the recovery protocol until the connection is usable again or the
/// configured attempts run out. Runs on the thread that detected the failure
/// (the old reader thread); the replacement reader spawned mid-attempt serves
/// the replay rpcs.
pub(crate) fn run(connection: &Arc<ConnectionInner>, cause: &Error) {
    debug!("beginning automatic connection recovery: {}", cause);
    connection.events.broadcast(ConnectionEvent::RecoveryStarted);

    let mut attempts = 0u32;
    loop {
        if let Some(max) = connection.tuning.recovery_attempts {
            if attempts >= max {
                warn!("giving up on connection recovery after {} attempts", max);
                connection.terminate(&Error::RecoveryAttemptsExhausted { attempts: max });
                return;
            }
        }
        attempts += 1;
        thread::sleep(connection.tuning.network_recovery_interval);

        // the user may have closed the connection while we slept
        match connection.status() {
            ConnectionStatus::Closing | ConnectionStatus::Closed => return,
            _ => (),
        }

        match attempt(connection) {
            Ok(()) => {
                connection.set_status(ConnectionStatus::Open);
                info!("connection recovered after {} attempt(s)", attempts);
                connection
                    .events
                    .broadcast(ConnectionEvent::RecoveryCompleted);
                return;
            }
            Err(err) => {
                warn!("recovery attempt {} failed: {}", attempts, err);
                connection
                    .events
                    .broadcast(ConnectionEvent::RecoveryAttemptFailed {
                        message: format!("{}", err),
                    });
            }
        }
    }
}

fn attempt(connection: &Arc<ConnectionInner>) -> Result<()> {
    let connector = connection
        .connector
        .as_ref()
        .expect("recovery requires a redialable connection");
    let fresh = connector()?;

    // quiesce channel-local state before frames start flowing again; consumer
    // delegates survive in the topology registry
    let channels = connection.channels_snapshot();
    for chan in &channels {
        chan.prepare_for_recovery();
    }
    connection.install_transport(fresh);

    recover_channels(connection, &channels)?;
    replay_topology(connection)
}

/// Reopen every channel under its old id and reapply channel-level settings.
fn recover_channels(
    connection: &Arc<ConnectionInner>,
    channels: &[Arc<ChannelInner>],
) -> Result<()> {
    for chan in channels {
        debug!("recovering channel {}", chan.id);
        let _: ChannelOpenOk = connection.channel_rpc(
            chan,
            AmqpChannel::Open(ChannelOpen {
                out_of_band: String::new(),
            }),
        )?;
        chan.set_status(ChannelStatus::Open);

        let qos = *chan.qos.lock().unwrap();
        if let Some(qos) = qos {
            let _: QosOk = connection.channel_rpc(
                chan,
                AmqpBasic::Qos(Qos {
                    prefetch_size: qos.prefetch_size,
                    prefetch_count: qos.prefetch_count,
                    global: qos.global,
                }),
            )?;
        }
        if chan.confirms.is_enabled() {
            let _: ConfirmSelectOk =
                connection.channel_rpc(chan, AmqpConfirm::Select(ConfirmSelect { nowait: false }))?;
        }
        if *chan.tx_selected.lock().unwrap() {
            let _: TxSelectOk = connection.channel_rpc(chan, AmqpTx::Select(TxSelect {}))?;
        }
    }
    Ok(())
}

/// Replay the recorded topology in dependency order: exchanges, queues
/// (rewriting server-named queues to their fresh names), queue bindings,
/// exchange bindings, consumers.
fn replay_topology(connection: &Arc<ConnectionInner>) -> Result<()> {
    let filter = connection.recovery_filter();
    let topology = connection.topology();
    let replay_chan = replay_channel(connection)?;

    for exchange in topology.recorded_exchanges() {
        if !filter.accept_exchange(&exchange) {
            continue;
        }
        debug!("redeclaring exchange {}", exchange.name);
        let _: ExchangeDeclareOk = connection.channel_rpc(
            &replay_chan,
            AmqpExchange::Declare(ExchangeDeclare {
                ticket: 0,
                exchange: exchange.name.clone(),
                type_: exchange.type_.clone(),
                passive: false,
                durable: exchange.durable,
                auto_delete: exchange.auto_delete,
                internal: exchange.internal,
                nowait: false,
                arguments: exchange.arguments.clone(),
            }),
        )?;
    }

    for queue in topology.recorded_queues() {
        if !filter.accept_queue(&queue) {
            continue;
        }
        let declared_name = if queue.server_named {
            String::new()
        } else {
            queue.name.clone()
        };
        let ok: QueueDeclareOk = connection.channel_rpc(
            &replay_chan,
            AmqpQueue::Declare(QueueDeclare {
                ticket: 0,
                queue: declared_name,
                passive: false,
                durable: queue.durable,
                exclusive: queue.exclusive,
                auto_delete: queue.auto_delete,
                nowait: false,
                arguments: queue.arguments.clone(),
            }),
        )?;
        if queue.server_named && ok.queue != queue.name {
            debug!(
                "server-named queue {} came back as {}",
                queue.name, ok.queue
            );
            topology.update_queue_name(&queue.name, &ok.queue);
        } else {
            debug!("redeclared queue {}", ok.queue);
        }
    }

    // bindings are fetched after the queue renames above so they already
    // reference the new names
    for binding in topology.recorded_queue_bindings() {
        if !filter.accept_queue_binding(&binding) {
            continue;
        }
        debug!(
            "rebinding queue {} to exchange {}",
            binding.queue, binding.exchange
        );
        let _: QueueBindOk = connection.channel_rpc(
            &replay_chan,
            AmqpQueue::Bind(QueueBind {
                ticket: 0,
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                nowait: false,
                arguments: binding.arguments.clone(),
            }),
        )?;
    }

    for binding in topology.recorded_exchange_bindings() {
        if !filter.accept_exchange_binding(&binding) {
            continue;
        }
        debug!(
            "rebinding exchange {} to exchange {}",
            binding.destination, binding.source
        );
        let _: ExchangeBindOk = connection.channel_rpc(
            &replay_chan,
            AmqpExchange::Bind(ExchangeBind {
                ticket: 0,
                destination: binding.destination.clone(),
                source: binding.source.clone(),
                routing_key: binding.routing_key.clone(),
                nowait: false,
                arguments: binding.arguments.clone(),
            }),
        )?;
    }

    for consumer in topology.recorded_consumers() {
        if !filter.accept_consumer(&consumer) {
            continue;
        }
        let chan = match connection.channel_by_id(consumer.channel_id) {
            Some(chan) => chan,
            None => {
                warn!(
                    "skipping consumer {} - its channel {} no longer exists",
                    consumer.consumer_tag, consumer.channel_id
                );
                continue;
            }
        };
        let requested_tag = if consumer.server_tagged {
            String::new()
        } else {
            consumer.consumer_tag.clone()
        };
        let ok: ConsumeOk = connection.channel_rpc(
            &chan,
            AmqpBasic::Consume(Consume {
                ticket: 0,
                queue: consumer.queue.clone(),
                consumer_tag: requested_tag,
                no_local: consumer.no_local,
                no_ack: consumer.no_ack,
                exclusive: consumer.exclusive,
                nowait: false,
                arguments: consumer.arguments.clone(),
            }),
        )?;
        debug!(
            "resubscribed consumer {} (was {}) on queue {}",
            ok.consumer_tag, consumer.consumer_tag, consumer.queue
        );
        chan.register_consumer(&ok.consumer_tag, Arc::clone(&consumer.delegate))?;
        if ok.consumer_tag != consumer.consumer_tag {
            topology.update_consumer_tag(
                consumer.channel_id,
                &consumer.consumer_tag,
                &ok.consumer_tag,
            );
        }
    }

    Ok(())
}

fn replay_channel(connection: &Arc<ConnectionInner>) -> Result<Arc<ChannelInner>> {
    if let Some(chan) = connection.default_channel_inner() {
        return Ok(chan);
    }
    if let Some(chan) = connection.channels_snapshot().into_iter().next() {
        return Ok(chan);
    }
    // every channel was closed before the failure; topology replay still
    // needs one
    connection.open_channel_inner(None)
}

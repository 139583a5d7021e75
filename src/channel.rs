use crate::confirms::ConfirmTracker;
use crate::connection::ConnectionInner;
use crate::consumer::{ConsumerDelegate, ConsumerOptions, ForwardingDelegate};
use crate::continuation::ContinuationQueue;
use crate::errors::*;
use crate::frames::OutputBuffer;
use crate::notifications::{NotificationBroadcaster, NotificationListener};
use crate::topology::{
    RecordedConsumer, RecordedExchange, RecordedExchangeBinding, RecordedQueue,
    RecordedQueueBinding,
};
use crate::work_pool::ConsumerWorkPool;
use crate::{
    AmqpProperties, Consumer, Delivery, DeliveryTag, ExchangeDeclareOptions, ExchangeType,
    FieldTable, Get, QueueDeclareOk, QueueDeclareOptions, QueueDeleteOptions, Return,
};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    Ack, Cancel, CancelOk, Consume, ConsumeOk, Get as AmqpGet, Nack, Publish, Qos, QosOk,
    Reject,
};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{Close as ChannelClose, CloseOk as ChannelCloseOk};
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::confirm::{Select as ConfirmSelect, SelectOk as ConfirmSelectOk};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    Bind as ExchangeBind, BindOk as ExchangeBindOk, Declare as ExchangeDeclare,
    DeclareOk as ExchangeDeclareOk, Delete as ExchangeDelete, DeleteOk as ExchangeDeleteOk,
    Unbind as ExchangeUnbind, UnbindOk as ExchangeUnbindOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    Bind as QueueBind, BindOk as QueueBindOk, DeclareOk as AmqpQueueDeclareOk,
    DeleteOk as QueueDeleteOk, Purge as QueuePurge, PurgeOk as QueuePurgeOk,
    Unbind as QueueUnbind, UnbindOk as QueueUnbindOk,
};
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::tx::{
    Commit as TxCommit, CommitOk as TxCommitOk, Rollback as TxRollback,
    RollbackOk as TxRollbackOk, Select as TxSelect, SelectOk as TxSelectOk,
};
use amq_protocol::protocol::AMQPClass;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// Each frame has 8 bytes of overhead (7 byte header, 1 byte frame-end), so
// message bodies are chunked into frame_max - 8 byte body frames.
const FRAME_OVERHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ChannelStatus {
    Opening,
    Open,
    Closed,
}

/// A reply routed from the reader thread to a caller blocked on the channel's
/// continuation queue.
pub(crate) enum ChannelReply {
    Method(AMQPClass),
    Get(Box<Option<Get>>),
}

/// Channel-level prefetch settings, remembered so recovery can reapply them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QosSettings {
    pub(crate) prefetch_size: u32,
    pub(crate) prefetch_count: u16,
    pub(crate) global: bool,
}

/// The state of one logical channel, shared between the application's
/// [`Channel`] handles, the reader thread, and the recovery driver.
pub(crate) struct ChannelInner {
    pub(crate) id: u16,
    status: Mutex<ChannelStatus>,
    pub(crate) continuation: ContinuationQueue<ChannelReply>,
    pub(crate) confirms: ConfirmTracker,
    consumers: Mutex<HashMap<String, Arc<dyn ConsumerDelegate>>>,
    work_pool: ConsumerWorkPool,
    // held across an entire publish frameset so the confirm sequence number
    // order matches wire order
    publish_lock: Mutex<()>,
    return_listeners: NotificationBroadcaster<Return>,
    pub(crate) qos: Mutex<Option<QosSettings>>,
    pub(crate) tx_selected: Mutex<bool>,
}

impl ChannelInner {
    pub(crate) fn new(id: u16, consumer_workers: usize) -> ChannelInner {
        ChannelInner {
            id,
            status: Mutex::new(ChannelStatus::Opening),
            continuation: ContinuationQueue::new(),
            confirms: ConfirmTracker::new(),
            consumers: Mutex::new(HashMap::new()),
            work_pool: ConsumerWorkPool::new(id, consumer_workers),
            publish_lock: Mutex::new(()),
            return_listeners: NotificationBroadcaster::new(),
            qos: Mutex::new(None),
            tx_selected: Mutex::new(false),
        }
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match self.status() {
            ChannelStatus::Open => Ok(()),
            ChannelStatus::Opening | ChannelStatus::Closed => ChannelAlreadyClosedSnafu.fail(),
        }
    }

    /// Dispatch a reassembled delivery onto the worker pool.
    pub(crate) fn deliver(&self, consumer_tag: &str, delivery: Delivery) {
        let delegate = self.consumers.lock().unwrap().get(consumer_tag).cloned();
        match delegate {
            Some(delegate) => {
                self.work_pool
                    .submit(move || delegate.on_delivery(delivery));
            }
            None => {
                // legitimate right after a cancel races an in-flight delivery
                warn!(
                    "dropping delivery for unknown consumer tag {} on channel {}",
                    consumer_tag, self.id
                );
            }
        }
    }

    /// The server cancelled a consumer (queue deleted, node shutdown, ...).
    pub(crate) fn handle_server_cancel(&self, consumer_tag: &str) {
        let delegate = self.consumers.lock().unwrap().remove(consumer_tag);
        match delegate {
            Some(delegate) => {
                debug!(
                    "server cancelled consumer {} on channel {}",
                    consumer_tag, self.id
                );
                self.work_pool.submit(move || delegate.on_cancellation());
            }
            None => warn!(
                "server cancelled unknown consumer tag {} on channel {}",
                consumer_tag, self.id
            ),
        }
    }

    pub(crate) fn handle_return(&self, ret: Return) {
        if self.return_listeners.has_listeners() {
            self.return_listeners.broadcast(ret);
        } else {
            debug!(
                "discarding returned message on channel {} (no listener registered): {}",
                self.id, ret.reply_text
            );
        }
    }

    pub(crate) fn register_consumer(
        &self,
        consumer_tag: &str,
        delegate: Arc<dyn ConsumerDelegate>,
    ) -> Result<()> {
        let mut consumers = self.consumers.lock().unwrap();
        if consumers.contains_key(consumer_tag) {
            return DuplicateConsumerTagSnafu {
                channel_id: self.id,
                consumer_tag,
            }
            .fail();
        }
        consumers.insert(consumer_tag.to_string(), delegate);
        Ok(())
    }

    pub(crate) fn deregister_consumer(&self, consumer_tag: &str) {
        self.consumers.lock().unwrap().remove(consumer_tag);
    }

    /// Tear the channel down after a server `channel.close` or a
    /// connection-level failure. Every waiter observes `err`.
    pub(crate) fn fail(&self, err: &Error) {
        self.set_status(ChannelStatus::Closed);
        self.continuation.push_error(err.fanout());
        self.confirms.abort(err);
        // dropping the delegates disconnects crossbeam-backed consumers
        self.consumers.lock().unwrap().clear();
        self.work_pool.shutdown();
    }

    /// Quiesce local state before the recovery driver reopens this channel.
    /// Consumer delegates survive in the topology registry and are
    /// re-registered as resubscriptions complete.
    pub(crate) fn prepare_for_recovery(&self) {
        self.set_status(ChannelStatus::Opening);
        self.continuation.drain();
        self.confirms.reset_for_recovery();
        self.consumers.lock().unwrap().clear();
    }

    /// Final teardown on clean close.
    pub(crate) fn finalize(&self) {
        self.set_status(ChannelStatus::Closed);
        self.consumers.lock().unwrap().clear();
        self.work_pool.shutdown();
        self.work_pool.join();
    }
}

/// A logical sub-connection multiplexed over the parent [`Connection`].
///
/// `Channel` handles are cheap clones sharing one underlying channel;
/// [`close`](Channel::close) consumes a handle but closes the channel for all
/// of them. All synchronous operations block the calling thread until the
/// server replies, bounded by the connection's continuation timeout.
///
/// [`Connection`]: crate::Connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    connection: Arc<ConnectionInner>,
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>, connection: Arc<ConnectionInner>) -> Channel {
        Channel { inner, connection }
    }

    /// The channel number on the wire.
    pub fn channel_id(&self) -> u16 {
        self.inner.id
    }

    fn rpc<M, T>(&self, method: M) -> Result<T>
    where
        M: crate::frames::IntoAmqpClass,
        T: crate::frames::TryFromAmqpClass,
    {
        self.inner.check_open()?;
        self.connection.channel_rpc(&self.inner, method)
    }

    fn send_nowait<M: crate::frames::IntoAmqpClass>(&self, method: M) -> Result<()> {
        self.inner.check_open()?;
        let mut buf = OutputBuffer::empty();
        buf.push_method(self.inner.id, method)?;
        self.connection.write(&buf)
    }

    /// Declare a queue. An empty `queue` name asks the server to generate
    /// one; the generated name comes back in the reply and is recorded as
    /// server-named for recovery.
    pub fn queue_declare<S: Into<String>>(
        &self,
        queue: S,
        options: QueueDeclareOptions,
    ) -> Result<QueueDeclareOk> {
        let queue = queue.into();
        let server_named = queue.is_empty();
        let recorded = options.clone();
        let declare = options.into_declare(queue, false);
        let ok: AmqpQueueDeclareOk = self.rpc(AmqpQueue::Declare(declare))?;
        self.connection.topology().record_queue(RecordedQueue {
            name: ok.queue.clone(),
            durable: recorded.durable,
            exclusive: recorded.exclusive,
            auto_delete: recorded.auto_delete,
            server_named,
            arguments: recorded.arguments,
        });
        Ok(QueueDeclareOk {
            queue: ok.queue,
            message_count: ok.message_count,
            consumer_count: ok.consumer_count,
        })
    }

    /// Passively declare a queue: succeeds only if it already exists. Not
    /// recorded for recovery.
    pub fn queue_declare_passive<S: Into<String>>(&self, queue: S) -> Result<QueueDeclareOk> {
        let declare = QueueDeclareOptions::default().into_declare(queue.into(), true);
        let ok: AmqpQueueDeclareOk = self.rpc(AmqpQueue::Declare(declare))?;
        Ok(QueueDeclareOk {
            queue: ok.queue,
            message_count: ok.message_count,
            consumer_count: ok.consumer_count,
        })
    }

    pub fn queue_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let binding = RecordedQueueBinding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: arguments.clone(),
        };
        let _: QueueBindOk = self.rpc(AmqpQueue::Bind(QueueBind {
            ticket: 0,
            queue: binding.queue.clone(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
            nowait: false,
            arguments,
        }))?;
        self.connection.topology().record_queue_binding(binding);
        Ok(())
    }

    pub fn queue_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let binding = RecordedQueueBinding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: arguments.clone(),
        };
        let _: QueueUnbindOk = self.rpc(AmqpQueue::Unbind(QueueUnbind {
            ticket: 0,
            queue: binding.queue.clone(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
            arguments,
        }))?;
        self.connection
            .topology()
            .delete_recorded_queue_binding(&binding);
        Ok(())
    }

    /// Purge all messages from a queue; returns the number purged.
    pub fn queue_purge<S: Into<String>>(&self, queue: S) -> Result<u32> {
        let ok: QueuePurgeOk = self.rpc(AmqpQueue::Purge(QueuePurge {
            ticket: 0,
            queue: queue.into(),
            nowait: false,
        }))?;
        Ok(ok.message_count)
    }

    /// Delete a queue; returns the number of messages deleted with it.
    pub fn queue_delete<S: Into<String>>(
        &self,
        queue: S,
        options: QueueDeleteOptions,
    ) -> Result<u32> {
        let queue = queue.into();
        let ok: QueueDeleteOk = self.rpc(AmqpQueue::Delete(options.into_delete(queue.clone())))?;
        self.connection.topology().delete_recorded_queue(&queue);
        Ok(ok.message_count)
    }

    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        exchange: S,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let exchange = exchange.into();
        let recorded = options.clone();
        let declare = options.into_declare(type_.as_ref(), exchange.clone(), false);
        let _: ExchangeDeclareOk = self.rpc(AmqpExchange::Declare(declare))?;
        self.connection.topology().record_exchange(RecordedExchange {
            name: exchange,
            type_: type_.as_ref().to_string(),
            durable: recorded.durable,
            auto_delete: recorded.auto_delete,
            internal: recorded.internal,
            arguments: recorded.arguments,
        });
        Ok(())
    }

    /// Passively declare an exchange: succeeds only if it already exists. Not
    /// recorded for recovery.
    pub fn exchange_declare_passive<S: Into<String>>(&self, exchange: S) -> Result<()> {
        let _: ExchangeDeclareOk = self.rpc(AmqpExchange::Declare(ExchangeDeclare {
            ticket: 0,
            exchange: exchange.into(),
            type_: "direct".to_string(),
            passive: true,
            durable: false,
            auto_delete: false,
            internal: false,
            nowait: false,
            arguments: FieldTable::new(),
        }))?;
        Ok(())
    }

    pub fn exchange_delete<S: Into<String>>(&self, exchange: S, if_unused: bool) -> Result<()> {
        let exchange = exchange.into();
        let _: ExchangeDeleteOk = self.rpc(AmqpExchange::Delete(ExchangeDelete {
            ticket: 0,
            exchange: exchange.clone(),
            if_unused,
            nowait: false,
        }))?;
        self.connection.topology().delete_recorded_exchange(&exchange);
        Ok(())
    }

    pub fn exchange_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let binding = RecordedExchangeBinding {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            arguments: arguments.clone(),
        };
        let _: ExchangeBindOk = self.rpc(AmqpExchange::Bind(ExchangeBind {
            ticket: 0,
            destination: binding.destination.clone(),
            source: binding.source.clone(),
            routing_key: binding.routing_key.clone(),
            nowait: false,
            arguments,
        }))?;
        self.connection.topology().record_exchange_binding(binding);
        Ok(())
    }

    pub fn exchange_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let binding = RecordedExchangeBinding {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            arguments: arguments.clone(),
        };
        let _: ExchangeUnbindOk = self.rpc(AmqpExchange::Unbind(ExchangeUnbind {
            ticket: 0,
            destination: binding.destination.clone(),
            source: binding.source.clone(),
            routing_key: binding.routing_key.clone(),
            nowait: false,
            arguments,
        }))?;
        self.connection
            .topology()
            .delete_recorded_exchange_binding(&binding);
        Ok(())
    }

    /// Publish a message. Never round-trips to the server; failures surface
    /// either through publisher confirms or through a returned message when
    /// `mandatory` is set.
    pub fn basic_publish<T: AsRef<[u8]>, S0: Into<String>, S1: Into<String>>(
        &self,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        immediate: bool,
        properties: &AmqpProperties,
        content: T,
    ) -> Result<()> {
        self.inner.check_open()?;
        let buf = build_publish_frameset(
            self.inner.id,
            self.connection.frame_max(),
            exchange.into(),
            routing_key.into(),
            mandatory,
            immediate,
            properties,
            content.as_ref(),
        )?;
        // sequence number assignment and the write happen under one lock so a
        // confirm racing in from the server can never precede its publish
        let _ordering = self.inner.publish_lock.lock().unwrap();
        self.inner.confirms.register_publish();
        self.connection.write(&buf)
    }

    /// Synchronously fetch a single message; `None` if the queue is empty.
    pub fn basic_get<S: Into<String>>(&self, queue: S, no_ack: bool) -> Result<Option<Get>> {
        self.inner.check_open()?;
        self.inner.continuation.drain();
        let mut buf = OutputBuffer::empty();
        buf.push_method(
            self.inner.id,
            AmqpBasic::Get(AmqpGet {
                ticket: 0,
                queue: queue.into(),
                no_ack,
            }),
        )?;
        self.connection.write(&buf)?;
        match self
            .inner
            .continuation
            .wait(Some(self.connection.continuation_timeout()))?
        {
            ChannelReply::Get(get) => Ok(*get),
            ChannelReply::Method(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    /// Start a consumer backed by a crossbeam channel of messages.
    pub fn basic_consume<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let (delegate, rx) = ForwardingDelegate::new();
        let tag = self.basic_consume_with(queue, options, Arc::new(delegate))?;
        Ok(Consumer::new(tag, rx))
    }

    /// Start a consumer dispatching into the given delegate. Returns the
    /// consumer tag (server-generated when `options.consumer_tag` is empty).
    pub fn basic_consume_with<S: Into<String>>(
        &self,
        queue: S,
        options: ConsumerOptions,
        delegate: Arc<dyn ConsumerDelegate>,
    ) -> Result<String> {
        let queue = queue.into();
        let server_tagged = options.consumer_tag.is_empty();
        let ok: ConsumeOk = self.rpc(AmqpBasic::Consume(Consume {
            ticket: 0,
            queue: queue.clone(),
            consumer_tag: options.consumer_tag.clone(),
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
            arguments: options.arguments.clone(),
        }))?;
        self.inner
            .register_consumer(&ok.consumer_tag, Arc::clone(&delegate))?;
        self.connection.topology().record_consumer(RecordedConsumer {
            channel_id: self.inner.id,
            consumer_tag: ok.consumer_tag.clone(),
            queue,
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            server_tagged,
            arguments: options.arguments,
            delegate,
        });
        Ok(ok.consumer_tag)
    }

    /// Cancel a consumer. In-flight deliveries racing the cancel are dropped
    /// with a warning when they arrive.
    pub fn basic_cancel<S: Into<String>>(&self, consumer_tag: S) -> Result<()> {
        let consumer_tag = consumer_tag.into();
        let _: CancelOk = self.rpc(AmqpBasic::Cancel(Cancel {
            consumer_tag: consumer_tag.clone(),
            nowait: false,
        }))?;
        self.inner.deregister_consumer(&consumer_tag);
        self.connection
            .topology()
            .delete_recorded_consumer(self.inner.id, &consumer_tag);
        Ok(())
    }

    /// Acknowledge a delivery. Tags minted before the most recent recovery
    /// are stale and are dropped with a warning instead of acknowledging an
    /// unrelated delivery on the new transport.
    pub fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        if self.is_stale(&delivery_tag, "ack") {
            return Ok(());
        }
        self.send_nowait(AmqpBasic::Ack(Ack {
            delivery_tag: delivery_tag.value(),
            multiple,
        }))
    }

    /// Negatively acknowledge a delivery, optionally requeueing it.
    pub fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<()> {
        if self.is_stale(&delivery_tag, "nack") {
            return Ok(());
        }
        self.send_nowait(AmqpBasic::Nack(Nack {
            delivery_tag: delivery_tag.value(),
            multiple,
            requeue,
        }))
    }

    /// Reject a delivery, optionally requeueing it.
    pub fn basic_reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        if self.is_stale(&delivery_tag, "reject") {
            return Ok(());
        }
        self.send_nowait(AmqpBasic::Reject(Reject {
            delivery_tag: delivery_tag.value(),
            requeue,
        }))
    }

    fn is_stale(&self, delivery_tag: &DeliveryTag, what: &str) -> bool {
        if delivery_tag.is_stale(self.connection.recovery_epoch()) {
            warn!(
                "dropping {} for stale delivery tag {} on channel {}",
                what,
                delivery_tag.value(),
                self.inner.id
            );
            true
        } else {
            false
        }
    }

    /// Set the prefetch window. `prefetch_count` is a 16-bit protocol field;
    /// larger requests fail locally without touching the server.
    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u32, global: bool) -> Result<()> {
        if prefetch_count > u32::from(u16::max_value()) {
            return PrefetchCountOutOfRangeSnafu {
                requested: prefetch_count,
            }
            .fail();
        }
        let settings = QosSettings {
            prefetch_size,
            prefetch_count: prefetch_count as u16,
            global,
        };
        let _: QosOk = self.rpc(AmqpBasic::Qos(Qos {
            prefetch_size: settings.prefetch_size,
            prefetch_count: settings.prefetch_count,
            global: settings.global,
        }))?;
        *self.inner.qos.lock().unwrap() = Some(settings);
        Ok(())
    }

    /// Put the channel in publisher-confirm mode. Idempotent after the first
    /// call.
    pub fn confirm_select(&self) -> Result<()> {
        if self.inner.confirms.is_enabled() {
            return Ok(());
        }
        let _: ConfirmSelectOk =
            self.rpc(AmqpConfirm::Select(ConfirmSelect { nowait: false }))?;
        self.inner.confirms.enable();
        Ok(())
    }

    /// Block until every publish since the last call has been confirmed.
    /// Returns false if any of them was nacked.
    pub fn wait_for_confirms(&self) -> Result<bool> {
        self.inner.check_open()?;
        self.inner.confirms.wait_for_confirms()
    }

    /// The sequence number the next publish will use; 0 until
    /// [`confirm_select`](Channel::confirm_select).
    pub fn next_publish_seq_no(&self) -> u64 {
        self.inner.confirms.next_publish_seq_no()
    }

    pub fn tx_select(&self) -> Result<()> {
        let _: TxSelectOk = self.rpc(AmqpTx::Select(TxSelect {}))?;
        *self.inner.tx_selected.lock().unwrap() = true;
        Ok(())
    }

    pub fn tx_commit(&self) -> Result<()> {
        let _: TxCommitOk = self.rpc(AmqpTx::Commit(TxCommit {}))?;
        Ok(())
    }

    pub fn tx_rollback(&self) -> Result<()> {
        let _: TxRollbackOk = self.rpc(AmqpTx::Rollback(TxRollback {}))?;
        Ok(())
    }

    /// Receive messages the server returns as unroutable (mandatory
    /// publishes).
    pub fn listen_for_returns(&self) -> NotificationListener<Return> {
        self.inner.return_listeners.register_listener()
    }

    /// Close the channel. Other clones of this handle observe
    /// `ChannelAlreadyClosed` afterwards.
    pub fn close(self) -> Result<()> {
        self.inner.check_open()?;
        let result: Result<ChannelCloseOk> =
            self.connection.channel_rpc(
                &self.inner,
                AmqpChannel::Close(ChannelClose {
                    reply_code: 0,
                    reply_text: String::new(),
                    class_id: 0,
                    method_id: 0,
                }),
            );
        self.inner.finalize();
        self.connection
            .topology()
            .delete_recorded_consumers_on_channel(self.inner.id);
        self.connection.forget_channel(self.inner.id);
        result.map(|_| ())
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_publish_frameset(
    channel_id: u16,
    frame_max: u32,
    exchange: String,
    routing_key: String,
    mandatory: bool,
    immediate: bool,
    properties: &AmqpProperties,
    content: &[u8],
) -> Result<OutputBuffer> {
    let mut buf = OutputBuffer::empty();
    buf.push_method(
        channel_id,
        AmqpBasic::Publish(Publish {
            ticket: 0,
            exchange,
            routing_key,
            mandatory,
            immediate,
        }),
    )?;
    buf.push_content_header(
        channel_id,
        Publish::get_class_id(),
        content.len(),
        properties,
    )?;
    let max_chunk = if frame_max == 0 {
        usize::max_value()
    } else {
        frame_max as usize - FRAME_OVERHEAD
    };
    for chunk in content.chunks(max_chunk) {
        buf.push_content_body(channel_id, chunk)?;
    }
    Ok(buf)
}

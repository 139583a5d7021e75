use crate::consumer::ConsumerDelegate;
use crate::FieldTable;
use indexmap::IndexMap;
use log::trace;
use std::fmt;
use std::sync::{Arc, Mutex};

/// An exchange declaration captured as replayable intent.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedExchange {
    pub name: String,
    pub type_: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

/// A queue declaration captured as replayable intent.
///
/// `server_named` queues were declared with an empty name; on replay they are
/// redeclared with an empty name again, and every binding and consumer that
/// referenced the old server-assigned name is rewritten to the new one.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedQueue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub server_named: bool,
    pub arguments: FieldTable,
}

/// A queue-to-exchange binding captured as replayable intent.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedQueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// An exchange-to-exchange binding captured as replayable intent.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedExchangeBinding {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// A consumer subscription captured as replayable intent, including the
/// delegate to re-attach on resubscribe.
#[derive(Clone)]
pub struct RecordedConsumer {
    pub channel_id: u16,
    pub consumer_tag: String,
    pub queue: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    /// The tag was assigned by the server; resubscription requests a fresh one.
    pub server_tagged: bool,
    pub arguments: FieldTable,
    pub(crate) delegate: Arc<dyn ConsumerDelegate>,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("channel_id", &self.channel_id)
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue)
            .field("no_local", &self.no_local)
            .field("no_ack", &self.no_ack)
            .field("exclusive", &self.exclusive)
            .field("server_tagged", &self.server_tagged)
            .finish()
    }
}

impl PartialEq for RecordedConsumer {
    fn eq(&self, other: &RecordedConsumer) -> bool {
        self.channel_id == other.channel_id
            && self.consumer_tag == other.consumer_tag
            && self.queue == other.queue
            && self.no_local == other.no_local
            && self.no_ack == other.no_ack
            && self.exclusive == other.exclusive
            && self.server_tagged == other.server_tagged
            && self.arguments == other.arguments
    }
}

/// Hook to exclude entities from replay without mutating the registry.
///
/// The default implementation passes everything through unchanged.
pub trait TopologyRecoveryFilter: Send + Sync {
    fn accept_exchange(&self, _exchange: &RecordedExchange) -> bool {
        true
    }
    fn accept_queue(&self, _queue: &RecordedQueue) -> bool {
        true
    }
    fn accept_queue_binding(&self, _binding: &RecordedQueueBinding) -> bool {
        true
    }
    fn accept_exchange_binding(&self, _binding: &RecordedExchangeBinding) -> bool {
        true
    }
    fn accept_consumer(&self, _consumer: &RecordedConsumer) -> bool {
        true
    }
}

/// The default filter: replay the entire recorded topology.
pub struct RecoverEverything;

impl TopologyRecoveryFilter for RecoverEverything {}

/// Everything the client has declared on the current connection, recorded as
/// intent so recovery can replay it in dependency order.
///
/// Each map has its own lock; declaring a queue never contends with another
/// channel canceling a consumer. Insertion order is preserved (`IndexMap` /
/// `Vec`), which makes replay deterministic.
pub(crate) struct TopologyRegistry {
    exchanges: Mutex<IndexMap<String, RecordedExchange>>,
    queues: Mutex<IndexMap<String, RecordedQueue>>,
    queue_bindings: Mutex<Vec<RecordedQueueBinding>>,
    exchange_bindings: Mutex<Vec<RecordedExchangeBinding>>,
    consumers: Mutex<IndexMap<(u16, String), RecordedConsumer>>,
}

impl TopologyRegistry {
    pub(crate) fn new() -> TopologyRegistry {
        TopologyRegistry {
            exchanges: Mutex::new(IndexMap::new()),
            queues: Mutex::new(IndexMap::new()),
            queue_bindings: Mutex::new(Vec::new()),
            exchange_bindings: Mutex::new(Vec::new()),
            consumers: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) fn record_exchange(&self, exchange: RecordedExchange) {
        trace!("recording exchange {:?}", exchange);
        self.exchanges
            .lock()
            .unwrap()
            .insert(exchange.name.clone(), exchange);
    }

    pub(crate) fn record_queue(&self, queue: RecordedQueue) {
        trace!("recording queue {:?}", queue);
        self.queues.lock().unwrap().insert(queue.name.clone(), queue);
    }

    pub(crate) fn record_queue_binding(&self, binding: RecordedQueueBinding) {
        let mut bindings = self.queue_bindings.lock().unwrap();
        if !bindings.contains(&binding) {
            trace!("recording queue binding {:?}", binding);
            bindings.push(binding);
        }
    }

    pub(crate) fn record_exchange_binding(&self, binding: RecordedExchangeBinding) {
        let mut bindings = self.exchange_bindings.lock().unwrap();
        if !bindings.contains(&binding) {
            trace!("recording exchange binding {:?}", binding);
            bindings.push(binding);
        }
    }

    pub(crate) fn record_consumer(&self, consumer: RecordedConsumer) {
        trace!("recording consumer {:?}", consumer);
        self.consumers.lock().unwrap().insert(
            (consumer.channel_id, consumer.consumer_tag.clone()),
            consumer,
        );
    }

    /// Forget an exchange and every binding that involves it, then re-check
    /// auto-delete exchanges those bindings were feeding.
    pub(crate) fn delete_recorded_exchange(&self, name: &str) {
        self.exchanges.lock().unwrap().shift_remove(name);
        let removed_sources: Vec<String> = {
            let mut bindings = self.exchange_bindings.lock().unwrap();
            let removed = bindings
                .iter()
                .filter(|b| b.source == name || b.destination == name)
                .map(|b| b.source.clone())
                .collect();
            bindings.retain(|b| b.source != name && b.destination != name);
            removed
        };
        self.queue_bindings
            .lock()
            .unwrap()
            .retain(|b| b.exchange != name);
        for source in removed_sources {
            if source != name {
                self.maybe_delete_recorded_auto_delete_exchange(&source);
            }
        }
    }

    /// Forget a queue and its bindings; the exchanges those bindings pointed
    /// at may now qualify for auto-delete removal.
    pub(crate) fn delete_recorded_queue(&self, name: &str) {
        self.queues.lock().unwrap().shift_remove(name);
        let sources: Vec<String> = {
            let mut bindings = self.queue_bindings.lock().unwrap();
            let sources = bindings
                .iter()
                .filter(|b| b.queue == name)
                .map(|b| b.exchange.clone())
                .collect();
            bindings.retain(|b| b.queue != name);
            sources
        };
        for source in sources {
            self.maybe_delete_recorded_auto_delete_exchange(&source);
        }
    }

    pub(crate) fn delete_recorded_queue_binding(&self, binding: &RecordedQueueBinding) {
        self.queue_bindings
            .lock()
            .unwrap()
            .retain(|b| b != binding);
        self.maybe_delete_recorded_auto_delete_exchange(&binding.exchange);
    }

    pub(crate) fn delete_recorded_exchange_binding(&self, binding: &RecordedExchangeBinding) {
        self.exchange_bindings
            .lock()
            .unwrap()
            .retain(|b| b != binding);
        self.maybe_delete_recorded_auto_delete_exchange(&binding.source);
    }

    pub(crate) fn delete_recorded_consumer(
        &self,
        channel_id: u16,
        consumer_tag: &str,
    ) -> Option<RecordedConsumer> {
        let removed = self
            .consumers
            .lock()
            .unwrap()
            .shift_remove(&(channel_id, consumer_tag.to_string()));
        if let Some(consumer) = &removed {
            self.maybe_delete_recorded_auto_delete_queue(&consumer.queue);
        }
        removed
    }

    /// Forget every consumer recorded on a channel the server closed.
    pub(crate) fn delete_recorded_consumers_on_channel(&self, channel_id: u16) {
        let queues: Vec<String> = {
            let mut consumers = self.consumers.lock().unwrap();
            let queues = consumers
                .values()
                .filter(|c| c.channel_id == channel_id)
                .map(|c| c.queue.clone())
                .collect();
            consumers.retain(|(id, _), _| *id != channel_id);
            queues
        };
        for queue in queues {
            self.maybe_delete_recorded_auto_delete_queue(&queue);
        }
    }

    /// An auto-delete queue disappears from the broker once its last consumer
    /// is gone; mirror that in the registry so replay does not resurrect it.
    pub(crate) fn maybe_delete_recorded_auto_delete_queue(&self, name: &str) {
        {
            let queues = self.queues.lock().unwrap();
            match queues.get(name) {
                Some(queue) if queue.auto_delete => (),
                _ => return,
            }
            let consumers = self.consumers.lock().unwrap();
            if consumers.values().any(|c| c.queue == name) {
                return;
            }
        }
        trace!("dropping auto-delete queue {} from recorded topology", name);
        self.delete_recorded_queue(name);
    }

    /// An auto-delete exchange disappears once no binding names it as source.
    pub(crate) fn maybe_delete_recorded_auto_delete_exchange(&self, name: &str) {
        {
            let exchanges = self.exchanges.lock().unwrap();
            match exchanges.get(name) {
                Some(exchange) if exchange.auto_delete => (),
                _ => return,
            }
            if self
                .queue_bindings
                .lock()
                .unwrap()
                .iter()
                .any(|b| b.exchange == name)
            {
                return;
            }
            if self
                .exchange_bindings
                .lock()
                .unwrap()
                .iter()
                .any(|b| b.source == name)
            {
                return;
            }
        }
        trace!(
            "dropping auto-delete exchange {} from recorded topology",
            name
        );
        self.delete_recorded_exchange(name);
    }

    /// Rewrite a server-named queue to the fresh name the server assigned on
    /// replay, updating every dependent binding and consumer first.
    pub(crate) fn update_queue_name(&self, old_name: &str, new_name: &str) {
        if old_name == new_name {
            return;
        }
        trace!("renaming recorded queue {} -> {}", old_name, new_name);
        {
            let mut queues = self.queues.lock().unwrap();
            if let Some(mut queue) = queues.shift_remove(old_name) {
                queue.name = new_name.to_string();
                queues.insert(new_name.to_string(), queue);
            }
        }
        for binding in self.queue_bindings.lock().unwrap().iter_mut() {
            if binding.queue == old_name {
                binding.queue = new_name.to_string();
            }
        }
        for consumer in self.consumers.lock().unwrap().values_mut() {
            if consumer.queue == old_name {
                consumer.queue = new_name.to_string();
            }
        }
    }

    /// Rekey a consumer whose resubscription got a fresh server tag.
    pub(crate) fn update_consumer_tag(&self, channel_id: u16, old_tag: &str, new_tag: &str) {
        if old_tag == new_tag {
            return;
        }
        let mut consumers = self.consumers.lock().unwrap();
        if let Some(mut consumer) =
            consumers.shift_remove(&(channel_id, old_tag.to_string()))
        {
            consumer.consumer_tag = new_tag.to_string();
            consumers.insert((channel_id, new_tag.to_string()), consumer);
        }
    }

    pub(crate) fn recorded_exchanges(&self) -> Vec<RecordedExchange> {
        self.exchanges.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn recorded_queues(&self) -> Vec<RecordedQueue> {
        self.queues.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn recorded_queue_bindings(&self) -> Vec<RecordedQueueBinding> {
        self.queue_bindings.lock().unwrap().clone()
    }

    pub(crate) fn recorded_exchange_bindings(&self) -> Vec<RecordedExchangeBinding> {
        self.exchange_bindings.lock().unwrap().clone()
    }

    pub(crate) fn recorded_consumers(&self) -> Vec<RecordedConsumer> {
        self.consumers.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.exchanges.lock().unwrap().clear();
        self.queues.lock().unwrap().clear();
        self.queue_bindings.lock().unwrap().clear();
        self.exchange_bindings.lock().unwrap().clear();
        self.consumers.lock().unwrap().clear();
    }
}

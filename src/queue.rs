use crate::FieldTable;
use amq_protocol::protocol::queue::{Declare, Delete};

/// The decoded reply to [`queue_declare`](crate::Channel::queue_declare).
#[derive(Clone, Debug)]
pub struct QueueDeclareOk {
    /// The declared queue's name; server-generated if the declaration left
    /// the name empty.
    pub queue: String,

    /// Messages currently in the queue.
    pub message_count: u32,

    /// Consumers currently subscribed to the queue.
    pub consumer_count: u32,
}

/// Options passed to [`queue_declare`](crate::Channel::queue_declare).
///
/// The `default` implementation declares a nondurable, nonexclusive,
/// non-auto-delete queue with no extra arguments.
#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    /// If true, the queue survives a broker restart.
    pub durable: bool,

    /// If true, the queue belongs to this connection and is deleted when the
    /// connection closes.
    pub exclusive: bool,

    /// If true, the broker deletes the queue once its last consumer goes
    /// away.
    pub auto_delete: bool,

    /// Extra broker-specific arguments (e.g. `x-message-ttl`).
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn into_declare(self, queue: String, passive: bool) -> Declare {
        Declare {
            ticket: 0,
            queue,
            passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
            arguments: self.arguments,
        }
    }
}

/// Options passed to [`queue_delete`](crate::Channel::queue_delete).
#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOptions {
    /// Only delete if the queue has no consumers.
    pub if_unused: bool,

    /// Only delete if the queue is empty.
    pub if_empty: bool,
}

impl QueueDeleteOptions {
    pub(crate) fn into_delete(self, queue: String) -> Delete {
        Delete {
            ticket: 0,
            queue,
            if_unused: self.if_unused,
            if_empty: self.if_empty,
            nowait: false,
        }
    }
}

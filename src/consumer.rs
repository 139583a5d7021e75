use crate::{Delivery, FieldTable};
use crossbeam_channel::{Receiver, Sender};

/// Options passed to [`basic_consume`](crate::Channel::basic_consume).
///
/// The `default` implementation requests a server-generated consumer tag for
/// a non-exclusive consumer with manual acknowledgements.
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// Tag identifying the consumer on this channel. Empty asks the server to
    /// generate one.
    pub consumer_tag: String,

    /// Do not deliver messages this same connection published.
    pub no_local: bool,

    /// If true, the server considers messages acknowledged once delivered
    /// (no explicit acks).
    pub no_ack: bool,

    /// Request exclusive consumer access to the queue.
    pub exclusive: bool,

    /// Extra broker-specific arguments.
    pub arguments: FieldTable,
}

/// The capability interface a consumer implements to receive deliveries.
///
/// Callbacks run on the owning channel's worker pool, never on the reader
/// thread, so they may block without stalling the connection. Implementations
/// are shared between the channel and the recovery machinery, which re-uses
/// the same delegate when it resubscribes consumers after a reconnect.
pub trait ConsumerDelegate: Send + Sync + 'static {
    /// Called once per delivery, in arrival order when the channel uses a
    /// single worker.
    fn on_delivery(&self, delivery: Delivery);

    /// Called when the *server* cancels the consumer (e.g. its queue was
    /// deleted). Not called for client-initiated cancels.
    fn on_cancellation(&self) {}
}

impl<F> ConsumerDelegate for F
where
    F: Fn(Delivery) + Send + Sync + 'static,
{
    fn on_delivery(&self, delivery: Delivery) {
        self(delivery)
    }
}

/// Messages arriving on the crossbeam-backed convenience consumer returned by
/// [`basic_consume`](crate::Channel::basic_consume).
#[derive(Clone, Debug)]
pub enum ConsumerMessage {
    /// A delivery for this consumer.
    Delivery(Delivery),

    /// The server cancelled this consumer.
    Cancelled,
}

/// A consumer subscription backed by a channel of [`ConsumerMessage`]s.
///
/// When the subscription ends for any other reason (client-side cancel,
/// channel or connection teardown) the sending side is dropped and
/// [`receiver`](Self::receiver) disconnects.
pub struct Consumer {
    consumer_tag: String,
    rx: Receiver<ConsumerMessage>,
}

impl Consumer {
    pub(crate) fn new(consumer_tag: String, rx: Receiver<ConsumerMessage>) -> Consumer {
        Consumer { consumer_tag, rx }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn receiver(&self) -> &Receiver<ConsumerMessage> {
        &self.rx
    }
}

/// The delegate behind [`Consumer`]: forwards callbacks into the message
/// channel.
pub(crate) struct ForwardingDelegate {
    tx: Sender<ConsumerMessage>,
}

impl ForwardingDelegate {
    pub(crate) fn new() -> (ForwardingDelegate, Receiver<ConsumerMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ForwardingDelegate { tx }, rx)
    }
}

impl ConsumerDelegate for ForwardingDelegate {
    fn on_delivery(&self, delivery: Delivery) {
        let _ = self.tx.send(ConsumerMessage::Delivery(delivery));
    }

    fn on_cancellation(&self) {
        let _ = self.tx.send(ConsumerMessage::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AmqpProperties;
    use amq_protocol::protocol::basic::Deliver;

    fn delivery() -> Delivery {
        let deliver = Deliver {
            consumer_tag: "ctag".to_string(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "".to_string(),
            routing_key: "q".to_string(),
        };
        Delivery::new(deliver, b"x".to_vec(), AmqpProperties::default(), 0).1
    }

    #[test]
    fn forwarding_delegate_feeds_receiver() {
        let (delegate, rx) = ForwardingDelegate::new();
        delegate.on_delivery(delivery());
        delegate.on_cancellation();
        assert!(matches!(rx.recv().unwrap(), ConsumerMessage::Delivery(_)));
        assert!(matches!(rx.recv().unwrap(), ConsumerMessage::Cancelled));
    }

    #[test]
    fn dropping_delegate_disconnects_receiver() {
        let (delegate, rx) = ForwardingDelegate::new();
        drop(delegate);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn closures_are_delegates() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let delegate = move |d: Delivery| {
            let _ = tx.send(d.into_content());
        };
        delegate.on_delivery(delivery());
        assert_eq!(rx.recv().unwrap(), b"x".to_vec());
    }
}

use crate::AmqpProperties;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// A message the server handed back because it could not be routed.
///
/// Returns happen only for publishes with the `mandatory` flag set. Register a
/// listener with [`Channel::listen_for_returns`](crate::Channel::listen_for_returns)
/// to receive them; without a listener they are logged and dropped.
#[derive(Clone, Debug)]
pub struct Return {
    /// AMQP reply code explaining the return (e.g. 312 for no-route).
    pub reply_code: u16,

    /// Human-readable reason.
    pub reply_text: String,

    /// The exchange the message was originally published to.
    pub exchange: String,

    /// The routing key that failed to match.
    pub routing_key: String,

    /// The message body.
    pub content: Vec<u8>,

    /// The properties the message was published with.
    pub properties: AmqpProperties,
}

impl Return {
    pub(crate) fn new(ret: AmqpReturn, content: Vec<u8>, properties: AmqpProperties) -> Return {
        Return {
            reply_code: ret.reply_code,
            reply_text: ret.reply_text,
            exchange: ret.exchange,
            routing_key: ret.routing_key,
            content,
            properties,
        }
    }
}

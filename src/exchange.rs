use crate::FieldTable;
use amq_protocol::protocol::exchange::Declare;

/// Routing behavior of a declared exchange.
pub enum ExchangeType {
    /// Route to queues whose binding key equals the routing key.
    Direct,

    /// Route to all bound queues, ignoring the routing key.
    Fanout,

    /// Route on dot-separated pattern matching of the routing key.
    Topic,

    /// Route on message header values.
    Headers,

    /// A broker-specific exchange type plugin.
    Custom(String),
}

impl AsRef<str> for ExchangeType {
    fn as_ref(&self) -> &str {
        use self::ExchangeType::*;
        match self {
            Direct => "direct",
            Fanout => "fanout",
            Topic => "topic",
            Headers => "headers",
            Custom(s) => s,
        }
    }
}

/// Options passed to [`exchange_declare`](crate::Channel::exchange_declare).
#[derive(Clone, Debug, Default)]
pub struct ExchangeDeclareOptions {
    /// If true, the exchange survives a broker restart.
    pub durable: bool,

    /// If true, the broker deletes the exchange once nothing is bound to it.
    pub auto_delete: bool,

    /// If true, the exchange only accepts messages from other exchanges.
    pub internal: bool,

    /// Extra broker-specific arguments.
    pub arguments: FieldTable,
}

impl ExchangeDeclareOptions {
    pub(crate) fn into_declare(
        self,
        type_: &str,
        exchange: String,
        passive: bool,
    ) -> Declare {
        Declare {
            ticket: 0,
            exchange,
            type_: type_.to_string(),
            passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: false,
            arguments: self.arguments,
        }
    }
}

//! A resilient, synchronous RabbitMQ (AMQP 0.9.1) client.
//!
//! One TCP connection carries many logical [`Channel`]s. Synchronous protocol
//! operations block the calling thread until the server replies; deliveries
//! run asynchronously on per-channel worker pools. Connections opened from a
//! URL transparently reconnect after a network failure and replay every
//! recorded queue, exchange, binding, and consumer.

mod auth;
mod channel;
mod confirms;
mod connection;
mod connection_options;
mod consumer;
mod content;
mod continuation;
mod delivery;
mod errors;
mod exchange;
mod frames;
mod get;
mod handshake;
mod heartbeat;
mod ids;
mod notifications;
mod queue;
mod reader;
mod recovery;
mod return_;
mod stream;
mod topology;
mod transport;
mod work_pool;

#[cfg(test)]
mod integration_tests;

pub use auth::{Auth, Sasl};
pub use channel::Channel;
pub use connection::{
    Connection, ConnectionBlockedNotification, ConnectionEvent, ConnectionStatus,
    ConnectionTuning,
};
pub use connection_options::{ConnectionOptions, Heartbeat};
pub use consumer::{Consumer, ConsumerDelegate, ConsumerMessage, ConsumerOptions};
pub use delivery::{Delivery, DeliveryTag};
pub use errors::{Error, Result};
pub use exchange::{ExchangeDeclareOptions, ExchangeType};
pub use get::Get;
pub use notifications::NotificationListener;
pub use queue::{QueueDeclareOk, QueueDeclareOptions, QueueDeleteOptions};
pub use return_::Return;
pub use stream::{IoStream, SplitStream};
pub use topology::{
    RecordedConsumer, RecordedExchange, RecordedExchangeBinding, RecordedQueue,
    RecordedQueueBinding, RecoverEverything, TopologyRecoveryFilter,
};

#[cfg(feature = "native-tls")]
pub use stream::TlsConnector;

pub use amq_protocol::protocol::basic::AMQPProperties as AmqpProperties;
pub use amq_protocol::types::AMQPValue as AmqpValue;
pub use amq_protocol::types::FieldTable;

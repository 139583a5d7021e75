use crate::AmqpProperties;
use amq_protocol::protocol::basic::Deliver;
use amq_protocol::protocol::basic::GetOk;

/// A delivery tag bound to the recovery epoch it was issued under.
///
/// Delivery tags are only meaningful relative to the transport that produced
/// them. After a connection recovers, the server numbers deliveries from 1
/// again, so a tag minted before the recovery must never be acknowledged
/// against the new transport. The epoch captured here makes that staleness
/// detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag {
    value: u64,
    recovery_epoch: u64,
}

impl DeliveryTag {
    pub(crate) fn new(value: u64, recovery_epoch: u64) -> DeliveryTag {
        DeliveryTag {
            value,
            recovery_epoch,
        }
    }

    /// The raw protocol tag.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// True when this tag predates the given recovery epoch and therefore no
    /// longer refers to any live delivery.
    pub fn is_stale(&self, current_epoch: u64) -> bool {
        self.recovery_epoch < current_epoch
    }
}

/// A message delivered to a consumer or returned by `basic.get`.
#[derive(Clone, Debug)]
pub struct Delivery {
    delivery_tag: DeliveryTag,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    content: Vec<u8>,
    properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(
        deliver: Deliver,
        content: Vec<u8>,
        properties: AmqpProperties,
        recovery_epoch: u64,
    ) -> (String, Delivery) {
        (
            deliver.consumer_tag,
            Delivery {
                delivery_tag: DeliveryTag::new(deliver.delivery_tag, recovery_epoch),
                redelivered: deliver.redelivered,
                exchange: deliver.exchange,
                routing_key: deliver.routing_key,
                content,
                properties,
            },
        )
    }

    pub(crate) fn new_get_ok(
        get_ok: GetOk,
        content: Vec<u8>,
        properties: AmqpProperties,
        recovery_epoch: u64,
    ) -> Delivery {
        Delivery {
            delivery_tag: DeliveryTag::new(get_ok.delivery_tag, recovery_epoch),
            redelivered: get_ok.redelivered,
            exchange: get_ok.exchange,
            routing_key: get_ok.routing_key,
            content,
            properties,
        }
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn properties(&self) -> &AmqpProperties {
        &self.properties
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }
}

use crate::Delivery;

/// A message pulled with [`basic_get`](crate::Channel::basic_get).
#[derive(Clone, Debug)]
pub struct Get {
    /// The message.
    pub delivery: Delivery,

    /// The number of messages still in the queue when the get was serviced.
    pub message_count: u32,
}

//! Message types for the consumer.

/// One message pulled from the broker, paired with its acknowledgment handle.
///
/// The delivery tag is scoped to the channel the message arrived on and is
/// meaningless on any other channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned acknowledgment handle.
    pub delivery_tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            payload: payload.into(),
        }
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            payload: delivery.data,
        }
    }
}

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Session events delivered by a broker client, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Subscribed,
    Unsubscribed,
    Published,
    Data { topic: String, payload: Vec<u8> },
    Error(String),
}

/// One MQTT session. Calls only queue requests, outcomes arrive as
/// [`BrokerEvent`]s.
pub trait BrokerClient: Send + Sync {
    fn connect(&self) -> Result<(), BrokerError>;

    fn disconnect(&self) -> Result<(), BrokerError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Queue a publish without waiting for room in the outgoing queue.
    fn try_publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), BrokerError>;
}

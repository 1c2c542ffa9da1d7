use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::lock;
use crate::bridge::{BrokerClient, BrokerEvent, QoS};
use crate::error::BrokerError;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
struct Session {
    up: bool,
    connects: usize,
    disconnects: usize,
    subscriptions: Vec<(String, QoS)>,
    unsubscriptions: Vec<String>,
    published: Vec<Published>,
}

/// Broker that accepts every request and records it. `connect` answers with
/// [`BrokerEvent::Connected`] right away.
pub struct SimBroker {
    session: Mutex<Session>,
    events: mpsc::Sender<BrokerEvent>,
}

impl SimBroker {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<BrokerEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let broker = Arc::new(Self {
            session: Mutex::default(),
            events,
        });
        (broker, events_rx)
    }

    /// Deliver `event` as if it came from the broker.
    pub fn inject(&self, event: BrokerEvent) {
        match &event {
            BrokerEvent::Connected => lock(&self.session).up = true,
            BrokerEvent::Disconnected => lock(&self.session).up = false,
            _ => {}
        }
        if self.events.try_send(event).is_err() {
            warn!("sim::broker: event queue full, event lost");
        }
    }

    /// Operator publishing on `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.inject(BrokerEvent::Data {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn is_up(&self) -> bool {
        lock(&self.session).up
    }

    pub fn connects(&self) -> usize {
        lock(&self.session).connects
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.session).disconnects
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.session).subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.session).unsubscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.session).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        lock(&self.session)
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }
}

impl BrokerClient for SimBroker {
    fn connect(&self) -> Result<(), BrokerError> {
        lock(&self.session).connects += 1;
        self.inject(BrokerEvent::Connected);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        lock(&self.session).disconnects += 1;
        self.inject(BrokerEvent::Disconnected);
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        lock(&self.session)
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        lock(&self.session).unsubscriptions.push(topic.to_string());
        Ok(())
    }

    fn try_publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), BrokerError> {
        let mut session = lock(&self.session);
        if !session.up {
            return Err(BrokerError::SessionDown);
        }
        session.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }
}

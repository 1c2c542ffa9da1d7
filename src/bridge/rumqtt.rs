use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, watch};

use super::broker::{BrokerClient, BrokerEvent, QoS};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::supervisor::Supervisor;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 20;
const EVENT_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// [`BrokerClient`] backed by `rumqttc`.
///
/// The event loop is polled by a supervised pump task only while the session
/// is enabled, so nothing dials the broker before the root has an upstream
/// address.
pub struct RumqttBroker {
    client: AsyncClient,
    enabled: watch::Sender<bool>,
}

/// Host and port of an `mqtt://host[:port]` url.
pub fn broker_address(url: &str) -> Result<(String, u16), BrokerError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| BrokerError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| BrokerError::InvalidUrl(url.to_string()))?;
    Ok((host.to_string(), parsed.port().unwrap_or(DEFAULT_PORT)))
}

impl RumqttBroker {
    pub fn new(
        config: &BrokerConfig,
        supervisor: &Supervisor,
    ) -> Result<(Arc<Self>, mpsc::Receiver<BrokerEvent>), BrokerError> {
        let (host, port) = broker_address(&config.url)?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (enabled, enabled_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        supervisor.spawn("bridge/mqtt_pump", pump(eventloop, enabled_rx, events_tx));

        Ok((Arc::new(Self { client, enabled }), events_rx))
    }
}

impl BrokerClient for RumqttBroker {
    fn connect(&self) -> Result<(), BrokerError> {
        self.enabled.send_replace(true);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.enabled.send_replace(false);
        self.client
            .try_disconnect()
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn try_publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, qos.into(), retain, payload.to_vec())
            .map_err(|e| BrokerError::Client(e.to_string()))
    }
}

async fn pump(
    mut eventloop: EventLoop,
    mut enabled: watch::Receiver<bool>,
    events: mpsc::Sender<BrokerEvent>,
) -> anyhow::Result<()> {
    let mut online = false;

    loop {
        // Keep polling while disabled until the disconnect is flushed.
        if !*enabled.borrow_and_update() && !online {
            if enabled.changed().await.is_err() {
                return Ok(());
            }
            continue;
        }

        let polled = tokio::select! {
            changed = enabled.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("bridge::rumqtt: connected");
                online = true;
                Some(BrokerEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BrokerEvent::Data {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::SubAck(_))) => Some(BrokerEvent::Subscribed),
            Ok(Event::Incoming(Packet::UnsubAck(_))) => Some(BrokerEvent::Unsubscribed),
            Ok(Event::Incoming(Packet::PubAck(_))) => Some(BrokerEvent::Published),
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                online = false;
                Some(BrokerEvent::Disconnected)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("bridge::rumqtt: <{}> connection", e);
                let was_online = std::mem::replace(&mut online, false);
                if was_online && events.send(BrokerEvent::Disconnected).await.is_err() {
                    return Ok(());
                }
                if events.send(BrokerEvent::Error(e.to_string())).await.is_err() {
                    return Ok(());
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("bridge::rumqtt: event receiver gone, pump exits");
                return Ok(());
            }
        }
    }
}

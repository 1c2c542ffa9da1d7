//! MQTT side of the root: command intake, status reports and telemetry
//! publishing over a single broker session.

pub mod broker;
pub mod rumqtt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub use broker::{BrokerClient, BrokerEvent, QoS};
pub use rumqtt::RumqttBroker;

use crate::config::BrokerConfig;
use crate::error::Error;
use crate::mesh::TelemetrySink;
use crate::ota::{parse_ota_endpoint, CycleOutcome, Orchestrator};
use crate::role::DeviceState;
use crate::supervisor::{Supervisor, TaskHandle};

pub struct MqttBridge {
    broker: Arc<dyn BrokerClient>,
    config: BrokerConfig,
    state: DeviceState,
    orchestrator: Arc<Orchestrator>,
    supervisor: Supervisor,
    session_up: AtomicBool,
    subscribed: AtomicBool,
}

impl MqttBridge {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: BrokerConfig,
        state: DeviceState,
        orchestrator: Arc<Orchestrator>,
        supervisor: Supervisor,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            state,
            orchestrator,
            supervisor,
            session_up: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn is_session_up(&self) -> bool {
        self.session_up.load(Ordering::SeqCst)
    }

    pub fn connect(&self) {
        info!("bridge: connecting to {}", self.config.url);
        if let Err(e) = self.broker.connect() {
            error!("bridge: <{}> connect", e);
        }
    }

    pub fn disconnect(&self) {
        info!("bridge: disconnecting");
        self.session_up.store(false, Ordering::SeqCst);
        self.unsubscribe_commands();
        if let Err(e) = self.broker.disconnect() {
            error!("bridge: <{}> disconnect", e);
        }
    }

    /// Consume broker events until the client goes away, following the
    /// connectivity flag alongside.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BrokerEvent>) -> anyhow::Result<()> {
        let mut connected = self.state.watch_connected();
        let mut watching = true;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                changed = connected.changed(), if watching => match changed {
                    Ok(()) => {
                        let up = *connected.borrow_and_update();
                        self.handle_connectivity(up);
                    }
                    Err(_) => {
                        debug!("bridge: connectivity flag dropped");
                        watching = false;
                    }
                },
            }
        }
        warn!("bridge: broker event stream closed");
        Ok(())
    }

    /// Follow the root's upstream connectivity. Commands are only taken
    /// while it holds.
    pub fn handle_connectivity(&self, connected: bool) {
        if connected {
            info!("bridge: upstream connectivity up");
            self.subscribe_commands();
        } else {
            warn!("bridge: upstream connectivity lost");
            self.unsubscribe_commands();
        }
    }

    fn subscribe_commands(&self) {
        if !self.is_session_up() || !self.state.is_connected() {
            return;
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .broker
            .subscribe(&self.config.command_topic, QoS::AtMostOnce)
        {
            error!("bridge: <{}> subscribe {}", e, self.config.command_topic);
            self.subscribed.store(false, Ordering::SeqCst);
        }
    }

    fn unsubscribe_commands(&self) {
        if !self.subscribed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.broker.unsubscribe(&self.config.command_topic) {
            debug!("bridge: <{}> unsubscribe", e);
        }
    }

    pub fn handle(self: &Arc<Self>, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!("bridge: session up");
                self.session_up.store(true, Ordering::SeqCst);
                self.subscribe_commands();
            }
            BrokerEvent::Disconnected => {
                warn!("bridge: session down");
                self.session_up.store(false, Ordering::SeqCst);
                self.unsubscribe_commands();
            }
            BrokerEvent::Subscribed => debug!("bridge: subscribed"),
            BrokerEvent::Unsubscribed => debug!("bridge: unsubscribed"),
            BrokerEvent::Published => trace!("bridge: publish acknowledged"),
            BrokerEvent::Data { topic, payload } => {
                if topic == self.config.command_topic {
                    self.handle_command(payload);
                } else {
                    info!("bridge: {} bytes on unhandled topic {}", payload.len(), topic);
                }
            }
            BrokerEvent::Error(reason) => error!("bridge: broker error: {}", reason),
        }
    }

    /// Run the command in its own supervised worker so the event stream
    /// keeps flowing while the cycle is in flight.
    pub fn handle_command(self: &Arc<Self>, payload: Vec<u8>) -> TaskHandle {
        let bridge = Arc::clone(self);
        self.supervisor.spawn("ota/command", async move {
            if !bridge.state.is_connected() {
                warn!("bridge: upstream connectivity down, command dropped");
                return Ok(());
            }
            let endpoint = parse_ota_endpoint(&payload);
            if endpoint.is_empty() {
                warn!("bridge: command without ota endpoint ignored");
                return Ok(());
            }
            info!("bridge: ota endpoint {}", endpoint.url());

            match bridge.orchestrator.run_cycle(endpoint).await {
                Ok(outcome) => bridge.publish_status(&outcome),
                Err(Error::Busy) => warn!("bridge: distribution in flight, command dropped"),
                Err(e) => warn!("bridge: <{}> command dropped", e),
            }
            Ok(())
        })
    }

    fn publish_status(&self, outcome: &CycleOutcome) {
        let payload = match serde_json::to_vec(outcome) {
            Ok(payload) => payload,
            Err(e) => {
                error!("bridge: <{}> encoding status", e);
                return;
            }
        };
        if let Err(e) = self.broker.try_publish(
            &self.config.status_topic,
            &payload,
            QoS::AtLeastOnce,
            false,
        ) {
            error!("bridge: <{}> publishing status", e);
        }
    }

    /// Publish a forwarded telemetry document unchanged. Returns whether it
    /// was handed to the broker client.
    pub fn publish_telemetry(&self, payload: &[u8]) -> bool {
        if !self.is_session_up() || !self.state.is_connected() {
            debug!("bridge: offline, telemetry of {} bytes skipped", payload.len());
            return false;
        }

        match self.broker.try_publish(
            &self.config.telemetry_topic,
            payload,
            QoS::AtLeastOnce,
            self.config.retain_telemetry,
        ) {
            Ok(()) => true,
            Err(e) => {
                error!("bridge: <{}> publishing telemetry", e);
                false
            }
        }
    }
}

impl TelemetrySink for MqttBridge {
    fn forward(&self, payload: Vec<u8>) {
        self.publish_telemetry(&payload);
    }
}

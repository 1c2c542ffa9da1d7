use std::sync::Arc;

use anyhow::Context;
use common::MeshAddress;
use tokio::sync::mpsc;

use crate::bridge::{BrokerClient, BrokerEvent, MqttBridge};
use crate::config::Config;
use crate::ota::{FirmwareSource, Orchestrator};
use crate::role::{self, Collaborators, DeviceState, LifecycleEvent, RoleMonitor};
use crate::supervisor::Supervisor;

const EVENT_QUEUE: usize = 32;

/// Broker session handed to a device that may become root.
pub struct BrokerLink {
    pub client: Arc<dyn BrokerClient>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

pub struct NodeParts {
    pub collaborators: Collaborators,
    pub source: Arc<dyn FirmwareSource>,
    pub broker: Option<BrokerLink>,
}

/// One device running the control plane.
pub struct MeshNode {
    address: MeshAddress,
    events: mpsc::Sender<LifecycleEvent>,
    state: DeviceState,
    orchestrator: Arc<Orchestrator>,
    bridge: Option<Arc<MqttBridge>>,
    supervisor: Supervisor,
}

impl MeshNode {
    /// Wire the components together and start the role monitor.
    pub fn start(config: Arc<Config>, parts: NodeParts, supervisor: Supervisor) -> anyhow::Result<Self> {
        let NodeParts {
            collaborators,
            source,
            broker,
        } = parts;
        let address = collaborators.transport.address();
        let (writer, state) = role::state::channel();

        let orchestrator = Arc::new(
            Orchestrator::new(
                source,
                Arc::clone(&collaborators.distributor),
                Arc::clone(&collaborators.transport),
                state.clone(),
                &config.ota,
            )
            .context("configuring ota orchestrator")?,
        );

        let bridge = broker.map(|BrokerLink { client, events }| {
            let bridge = MqttBridge::new(
                client,
                config.broker.clone(),
                state.clone(),
                Arc::clone(&orchestrator),
                supervisor.clone(),
            );
            supervisor.spawn("bridge/events", Arc::clone(&bridge).run(events));
            bridge
        });

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let monitor = RoleMonitor::new(
            config,
            collaborators,
            writer,
            state.clone(),
            bridge.clone(),
            supervisor.clone(),
        );
        supervisor.spawn("role/monitor", monitor.run(events_rx));
        info!("node: {} started", address);

        Ok(Self {
            address,
            events,
            state,
            orchestrator,
            bridge,
            supervisor,
        })
    }

    pub fn address(&self) -> MeshAddress {
        self.address
    }

    /// Deliver a mesh lifecycle event to the role monitor.
    pub async fn notify(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .context("role monitor is gone")
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn bridge(&self) -> Option<&Arc<MqttBridge>> {
        self.bridge.as_ref()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn shutdown(&self) {
        for (name, status) in self.supervisor.snapshot() {
            if !status.is_terminal() {
                debug!("node: stopping {} ({:?})", name, status);
            }
        }
        let aborted = self.supervisor.abort_all();
        info!("node: {} shut down, {} task(s) aborted", self.address, aborted);
    }
}

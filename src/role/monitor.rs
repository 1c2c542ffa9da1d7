use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::dispatch::{dispatch, Action, DispatchConfig, LifecycleEvent, MonitorState};
use super::state::{DeviceState, StateWriter};
use crate::bridge::MqttBridge;
use crate::config::Config;
use crate::device::{Device, Indicator, TimeSync};
use crate::mesh::{MeshTransport, NodeLoop, RootLoop, TelemetrySink};
use crate::ota::FirmwareDistributor;
use crate::supervisor::Supervisor;
use crate::telemetry::{PowerSampler, TelemetryReporter};

const TIME_SYNC_ATTEMPTS: u32 = 10;
const TIME_SYNC_POLL: Duration = Duration::from_secs(2);

/// Adapters the monitor hands to the tasks it starts.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn MeshTransport>,
    pub distributor: Arc<dyn FirmwareDistributor>,
    pub device: Arc<dyn Device>,
    pub indicator: Arc<dyn Indicator>,
    pub time_sync: Arc<dyn TimeSync>,
    /// Present on devices fitted with a power monitor.
    pub sampler: Option<Arc<dyn PowerSampler>>,
}

/// Actor that owns the device flags.
///
/// Lifecycle events arrive on one channel and are handled strictly in order,
/// so no other task ever writes role, link or connectivity.
pub struct RoleMonitor {
    current: MonitorState,
    writer: StateWriter,
    state: DeviceState,
    dispatch_config: DispatchConfig,
    config: Arc<Config>,
    parts: Collaborators,
    bridge: Option<Arc<MqttBridge>>,
    supervisor: Supervisor,
}

impl RoleMonitor {
    pub fn new(
        config: Arc<Config>,
        parts: Collaborators,
        writer: StateWriter,
        state: DeviceState,
        bridge: Option<Arc<MqttBridge>>,
        supervisor: Supervisor,
    ) -> Self {
        let dispatch_config = DispatchConfig {
            root_layer: config.mesh.root_layer,
            telemetry: config.telemetry.enabled && parts.sampler.is_some(),
        };
        Self {
            current: MonitorState::default(),
            writer,
            state,
            dispatch_config,
            config,
            parts,
            bridge,
            supervisor,
        }
    }

    pub fn current(&self) -> MonitorState {
        self.current
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>) -> anyhow::Result<()> {
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        debug!("role::monitor: event channel closed");
        Ok(())
    }

    /// Handle one event: fold it, publish the flags, then run the actions.
    pub fn apply(&mut self, event: LifecycleEvent) -> Vec<Action> {
        self.log_event(&event);

        let transition = dispatch(&self.current, &event, &self.dispatch_config);
        if let Some(reason) = transition.ignored {
            warn!("role::monitor: {:?} ignored: {}", event, reason);
            return Vec::new();
        }

        self.current = transition.next;
        self.writer.set_role(self.current.role);
        self.writer.set_linked(self.current.linked);
        self.writer.set_connected(self.current.connected);

        for action in &transition.actions {
            self.execute(action);
        }
        transition.actions
    }

    fn log_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Started => info!("role::monitor: mesh started"),
            LifecycleEvent::Stopped => info!("role::monitor: mesh stopped"),
            LifecycleEvent::ParentConnected { layer } => {
                info!("role::monitor: parent connected, layer: {}", layer)
            }
            LifecycleEvent::ParentDisconnected => warn!("role::monitor: parent disconnected"),
            LifecycleEvent::ChildConnected { child } => {
                info!("role::monitor: child {} connected", child)
            }
            LifecycleEvent::ChildDisconnected { child } => {
                info!("role::monitor: child {} disconnected", child)
            }
            LifecycleEvent::RootGotAddress => info!("role::monitor: root got upstream address"),
            LifecycleEvent::RootLostAddress => warn!("role::monitor: root lost upstream address"),
            LifecycleEvent::UpgradeStarted { name, size } => {
                info!("role::monitor: receiving firmware {} ({} bytes)", name, size)
            }
        }
    }

    fn execute(&self, action: &Action) {
        debug!("role::monitor: {:?}", action);
        match action {
            Action::IndicatorOn => self.parts.indicator.set(true),
            Action::IndicatorOff => self.parts.indicator.set(false),
            Action::StartNodeLoop => {
                let node_loop = NodeLoop {
                    transport: Arc::clone(&self.parts.transport),
                    distributor: Arc::clone(&self.parts.distributor),
                    device: Arc::clone(&self.parts.device),
                    state: self.state.clone(),
                    restart_delay: self.config.mesh.restart_delay(),
                };
                self.supervisor.spawn("mesh/node_loop", node_loop.run());
            }
            Action::StartRootLoop => {
                let sink = self
                    .bridge
                    .as_ref()
                    .map(|bridge| Arc::clone(bridge) as Arc<dyn TelemetrySink>);
                let root_loop = RootLoop {
                    transport: Arc::clone(&self.parts.transport),
                    distributor: Arc::clone(&self.parts.distributor),
                    sink,
                    state: self.state.clone(),
                };
                self.supervisor.spawn("mesh/root_loop", root_loop.run());
            }
            Action::StartTelemetry => {
                let Some(sampler) = self.parts.sampler.as_ref() else {
                    return;
                };
                let reporter = TelemetryReporter {
                    transport: Arc::clone(&self.parts.transport),
                    sampler: Arc::clone(sampler),
                    state: self.state.clone(),
                    config: self.config.telemetry.clone(),
                };
                self.supervisor.spawn("telemetry/reporter", reporter.run());
            }
            Action::StopLoops => {
                let stopped = self.supervisor.abort_matching("mesh/")
                    + self.supervisor.abort_matching("telemetry/");
                debug!("role::monitor: stopped {} task(s)", stopped);
            }
            Action::StartTimeSync => {
                self.parts.time_sync.start();
                let time_sync = Arc::clone(&self.parts.time_sync);
                self.supervisor.spawn("time_sync", wait_for_time(time_sync));
            }
            Action::ConnectBroker => match &self.bridge {
                Some(bridge) => bridge.connect(),
                None => warn!("role::monitor: root without a broker bridge"),
            },
            Action::DisconnectBroker => {
                if let Some(bridge) = &self.bridge {
                    bridge.disconnect();
                }
            }
        }
    }
}

async fn wait_for_time(time_sync: Arc<dyn TimeSync>) -> anyhow::Result<()> {
    for attempt in 1..=TIME_SYNC_ATTEMPTS {
        if time_sync.is_synced() {
            info!("role::monitor: time synchronised");
            return Ok(());
        }
        debug!(
            "role::monitor: waiting for time sync ({}/{})",
            attempt, TIME_SYNC_ATTEMPTS
        );
        tokio::time::sleep(TIME_SYNC_POLL).await;
    }
    warn!("role::monitor: time not synchronised, timestamps may be off");
    Ok(())
}

use common::MeshAddress;

use super::state::NodeRole;

/// Notifications delivered by the mesh stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started,
    Stopped,
    /// Joined a parent at `layer` (the root sits at the root layer).
    ParentConnected { layer: i32 },
    ParentDisconnected,
    ChildConnected { child: MeshAddress },
    ChildDisconnected { child: MeshAddress },
    /// The root obtained an address on the upstream network.
    RootGotAddress,
    RootLostAddress,
    /// The distribution library began receiving a firmware image.
    UpgradeStarted { name: String, size: u64 },
}

/// Side effects requested by [`dispatch`], executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    IndicatorOn,
    IndicatorOff,
    StartNodeLoop,
    StartRootLoop,
    StartTelemetry,
    StopLoops,
    StartTimeSync,
    ConnectBroker,
    DisconnectBroker,
}

/// Everything the monitor knows about this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorState {
    pub role: Option<NodeRole>,
    pub linked: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub root_layer: i32,
    /// Whether this device samples telemetry when it is not the root.
    pub telemetry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: MonitorState,
    pub actions: Vec<Action>,
    /// Set when the event was deliberately ignored.
    pub ignored: Option<&'static str>,
}

impl Transition {
    fn to(next: MonitorState, actions: Vec<Action>) -> Self {
        Self {
            next,
            actions,
            ignored: None,
        }
    }

    fn ignore(state: &MonitorState, reason: &'static str) -> Self {
        Self {
            next: *state,
            actions: Vec::new(),
            ignored: Some(reason),
        }
    }
}

/// Fold one lifecycle event into the monitor state.
///
/// Role changes happen only on parent connect/disconnect, and a second
/// connect without an intervening disconnect is ignored, so the loops start
/// once per connection lifetime.
pub fn dispatch(state: &MonitorState, event: &LifecycleEvent, config: &DispatchConfig) -> Transition {
    match event {
        LifecycleEvent::Started => Transition::to(*state, vec![Action::IndicatorOn]),
        LifecycleEvent::Stopped => {
            if state.linked {
                let mut actions = Vec::new();
                if state.role == Some(NodeRole::Root) {
                    actions.push(Action::DisconnectBroker);
                }
                actions.push(Action::StopLoops);
                actions.push(Action::IndicatorOff);
                Transition::to(MonitorState::default(), actions)
            } else {
                Transition::to(*state, vec![Action::IndicatorOff])
            }
        }
        LifecycleEvent::ParentConnected { layer } => {
            if state.linked {
                return Transition::ignore(state, "parent connected twice without a disconnect");
            }
            let role = NodeRole::from_layer(*layer, config.root_layer);
            let mut actions = vec![Action::StartNodeLoop];
            match role {
                NodeRole::Root => actions.push(Action::StartRootLoop),
                NodeRole::Node if config.telemetry => actions.push(Action::StartTelemetry),
                NodeRole::Node => {}
            }
            Transition::to(
                MonitorState {
                    role: Some(role),
                    linked: true,
                    connected: false,
                },
                actions,
            )
        }
        LifecycleEvent::ParentDisconnected => {
            if !state.linked {
                return Transition::ignore(state, "parent disconnected while not linked");
            }
            let mut actions = Vec::new();
            if state.role == Some(NodeRole::Root) {
                actions.push(Action::DisconnectBroker);
            }
            actions.push(Action::StopLoops);
            Transition::to(MonitorState::default(), actions)
        }
        LifecycleEvent::RootGotAddress => {
            if state.role != Some(NodeRole::Root) {
                return Transition::ignore(state, "address event on a non-root device");
            }
            if state.connected {
                return Transition::ignore(state, "root already bridged");
            }
            Transition::to(
                MonitorState {
                    connected: true,
                    ..*state
                },
                vec![Action::StartTimeSync, Action::ConnectBroker],
            )
        }
        LifecycleEvent::RootLostAddress => {
            if !state.connected {
                return Transition::ignore(state, "root was not bridged");
            }
            Transition::to(
                MonitorState {
                    connected: false,
                    ..*state
                },
                Vec::new(),
            )
        }
        LifecycleEvent::ChildConnected { .. }
        | LifecycleEvent::ChildDisconnected { .. }
        | LifecycleEvent::UpgradeStarted { .. } => Transition::to(*state, Vec::new()),
    }
}

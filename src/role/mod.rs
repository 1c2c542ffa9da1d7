//! Role determination.
//!
//! Mesh lifecycle events are folded by the pure [`dispatch`] function into a
//! new [`MonitorState`] plus a list of [`Action`]s. The [`RoleMonitor`] actor
//! owns that state, executes the actions and publishes role, link and broker
//! connectivity through the read-only [`DeviceState`] handle.

pub mod dispatch;
pub mod monitor;
pub mod state;

pub use dispatch::{dispatch, Action, DispatchConfig, LifecycleEvent, MonitorState, Transition};
pub use monitor::{Collaborators, RoleMonitor};
pub use state::{DeviceState, NodeRole, StateWriter};

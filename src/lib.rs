//! Control plane for a self-forming mesh of devices: root election, the mesh
//! receive loops, MQTT-triggered firmware distribution and telemetry
//! bridging.
//!
//! The radio, flash, HTTP and MQTT layers are reached through the traits in
//! [`mesh`], [`ota`], [`bridge`] and [`device`], so the same control plane
//! runs against real adapters or the in-memory [`sim`] network.

#[macro_use]
mod logging;

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod mesh;
pub mod node;
pub mod ota;
pub mod role;
pub mod sim;
pub mod supervisor;
pub mod telemetry;

pub use logging::init as init_logging;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the collaborator traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod prelude {
    pub use crate::{
        bridge::*, config::*, device::*, error::*, mesh::*, node::*, ota::*, role::*,
        supervisor::*, telemetry::*,
    };
    pub use common::{
        CustomSubtype, MeshAddress, MessageKind, OtaCommand, MAX_PAYLOAD_LEN, RESTART_PAYLOAD,
    };
}

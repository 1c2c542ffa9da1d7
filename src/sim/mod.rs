//! In-memory stand-ins for the radio, flash, HTTP origin, broker and board.
//!
//! They let the control plane run on a host: the binary drives a small
//! simulated mesh with them and the tests use them to observe every call.

mod broker;
mod distributor;
mod firmware;
mod mesh;
mod peripherals;

use std::sync::{Mutex, MutexGuard};

pub use broker::{Published, SimBroker};
pub use distributor::SimDistributor;
pub use firmware::SimFirmwareServer;
pub use mesh::{Delivery, SimMesh, SimTransport};
pub use peripherals::{SimClock, SimDevice, SimIndicator, SimPowerSampler};

/// A panicked test thread must not hide the recorded state from the others.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

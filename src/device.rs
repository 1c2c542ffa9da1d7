//! Board-level collaborators that carry no coordination logic of their own.

/// The device this control plane runs on.
pub trait Device: Send + Sync {
    /// Reboot into the staged firmware. On hardware this does not return.
    fn restart(&self);
}

/// Status LED.
pub trait Indicator: Send + Sync {
    fn set(&self, on: bool);
}

/// Wall-clock synchronisation (SNTP on hardware).
pub trait TimeSync: Send + Sync {
    /// Begin polling the time server.
    fn start(&self);

    fn is_synced(&self) -> bool;
}

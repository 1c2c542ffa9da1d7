use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::lock;
use crate::device::{Device, Indicator, TimeSync};
use crate::telemetry::{PowerReading, PowerSampler};

/// Counts restarts instead of rebooting.
#[derive(Default)]
pub struct SimDevice {
    restarts: AtomicUsize,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Device for SimDevice {
    fn restart(&self) {
        warn!("sim::device: restarting");
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct SimIndicator {
    on: AtomicBool,
}

impl SimIndicator {
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl Indicator for SimIndicator {
    fn set(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
    }
}

/// Host clock, synchronised as soon as it is started.
#[derive(Default)]
pub struct SimClock {
    started: AtomicBool,
}

impl TimeSync for SimClock {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn is_synced(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Replays a fixed reading, optionally failing.
pub struct SimPowerSampler {
    reading: Mutex<PowerReading>,
    failing: AtomicBool,
    samples: AtomicUsize,
}

impl SimPowerSampler {
    pub fn new(reading: PowerReading) -> Self {
        Self {
            reading: Mutex::new(reading),
            failing: AtomicBool::new(false),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set_reading(&self, reading: PowerReading) {
        *lock(&self.reading) = reading;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl Default for SimPowerSampler {
    fn default() -> Self {
        Self::new(PowerReading {
            bus_voltage: 5.02,
            shunt_voltage: 1.2,
            current: 120.0,
            power: 602.4,
        })
    }
}

impl PowerSampler for SimPowerSampler {
    fn sample(&self) -> anyhow::Result<PowerReading> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("power monitor did not answer");
        }
        Ok(*lock(&self.reading))
    }
}

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest payload a single mesh frame can carry (bytes).
pub const MAX_PAYLOAD_LEN: usize = 1456;

/// Length of a hardware address.
pub const ADDR_LEN: usize = 6;

/// Literal payload that tells a node to reboot into freshly staged firmware.
pub const RESTART_PAYLOAD: &[u8] = b"restart";

/// Hardware (MAC) address of a mesh device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshAddress(pub [u8; ADDR_LEN]);

impl MeshAddress {
    /// Addresses every node of the mesh.
    pub const BROADCAST: MeshAddress = MeshAddress([0xFF; ADDR_LEN]);

    pub const fn new(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshAddress({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseAddressError;

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected six colon-separated hex octets")
    }
}

impl FromStr for MeshAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; ADDR_LEN];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or(ParseAddressError)?;
            if part.is_empty() || part.len() > 2 {
                return Err(ParseAddressError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseAddressError)?;
        }
        if parts.next().is_some() {
            return Err(ParseAddressError);
        }
        Ok(Self(bytes))
    }
}

/// Application tag carried by custom mesh frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomSubtype {
    /// Node telemetry that the root forwards to the broker untouched.
    TelemetryForward,
    Other(u8),
}

/// How the transport classified an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Plain,
    /// Firmware fragment owned by the distribution library.
    UpgradeFragment,
    Custom(CustomSubtype),
}

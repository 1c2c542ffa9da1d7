//! Mesh transport seam and the per-role receive loops.

pub mod node_loop;
pub mod root_loop;

use common::{MeshAddress, MessageKind};

use crate::error::TransportError;
use crate::BoxFuture;

pub use node_loop::NodeLoop;
pub use root_loop::{RootLoop, TelemetrySink};

/// One frame handed over by the transport. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    pub source: MeshAddress,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl MeshMessage {
    pub fn new(source: MeshAddress, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            kind,
            payload: payload.into(),
        }
    }

    /// Payload as text, up to the first NUL.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end])
    }
}

/// The mesh routing and transport layer.
pub trait MeshTransport: Send + Sync {
    /// This device's own address.
    fn address(&self) -> MeshAddress;

    /// Whether the device is attached to the mesh.
    fn is_connected(&self) -> bool;

    /// Current depth in the mesh tree, `-1` when detached.
    fn layer(&self) -> i32;

    /// Next frame addressed to this device.
    fn recv_node(&self) -> BoxFuture<'_, Result<MeshMessage, TransportError>>;

    /// Next frame addressed to the root (upstream traffic). Root only.
    fn recv_root(&self) -> BoxFuture<'_, Result<MeshMessage, TransportError>>;

    /// Send `payload` to every address in `targets`. With `ack` set the call
    /// resolves once every target acknowledged delivery.
    fn write<'a>(
        &'a self,
        targets: &'a [MeshAddress],
        kind: MessageKind,
        payload: &'a [u8],
        ack: bool,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Send `payload` upstream to the root.
    fn write_to_root<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_stops_at_nul() {
        let msg = MeshMessage::new(
            MeshAddress::new([1; 6]),
            MessageKind::Plain,
            b"restart\0\0\0".to_vec(),
        );
        assert_eq!(msg.text(), "restart");

        let msg = MeshMessage::new(MeshAddress::new([1; 6]), MessageKind::Plain, b"hello".to_vec());
        assert_eq!(msg.text(), "hello");
    }
}

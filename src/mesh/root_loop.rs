use std::sync::Arc;

use common::{CustomSubtype, MessageKind};

use super::{MeshMessage, MeshTransport};
use crate::error::TransportError;
use crate::ota::FirmwareDistributor;
use crate::role::DeviceState;

/// Where the root hands telemetry that a node forwarded upstream.
pub trait TelemetrySink: Send + Sync {
    /// Forward `payload` unchanged. Delivery is best effort.
    fn forward(&self, payload: Vec<u8>);
}

/// Receive loop for traffic addressed to the root.
pub struct RootLoop {
    pub transport: Arc<dyn MeshTransport>,
    pub distributor: Arc<dyn FirmwareDistributor>,
    pub sink: Option<Arc<dyn TelemetrySink>>,
    pub state: DeviceState,
}

impl RootLoop {
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("mesh::root_loop: running");

        while self.state.is_linked() && self.transport.is_connected() {
            let received = tokio::select! {
                _ = self.state.link_lost() => break,
                received = self.transport.recv_root() => received,
            };

            match received {
                Ok(message) => self.handle(message),
                Err(TransportError::Closed) => break,
                Err(e) => warn!("mesh::root_loop: <{}> receive", e),
            }
        }

        warn!("mesh::root_loop: exited");
        Ok(())
    }

    fn handle(&self, message: MeshMessage) {
        match message.kind {
            MessageKind::UpgradeFragment => {
                if let Err(e) = self
                    .distributor
                    .handle_root_fragment(message.source, &message.payload)
                {
                    warn!("mesh::root_loop: <{}> upgrade fragment from {}", e, message.source);
                }
            }
            MessageKind::Custom(CustomSubtype::TelemetryForward) => {
                if !self.state.is_connected() {
                    debug!(
                        "mesh::root_loop: broker down, dropping telemetry from {}",
                        message.source
                    );
                    return;
                }
                match &self.sink {
                    Some(sink) => sink.forward(message.payload),
                    None => debug!("mesh::root_loop: no telemetry sink, dropping"),
                }
            }
            kind => {
                warn!(
                    "mesh::root_loop: unknown {:?} from {} ({} bytes), dropped",
                    kind,
                    message.source,
                    message.payload.len()
                );
            }
        }
    }
}

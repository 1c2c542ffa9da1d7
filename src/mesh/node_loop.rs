use std::sync::Arc;
use std::time::Duration;

use common::{MessageKind, RESTART_PAYLOAD};

use super::{MeshMessage, MeshTransport};
use crate::device::Device;
use crate::error::TransportError;
use crate::ota::FirmwareDistributor;
use crate::role::DeviceState;

/// Receive loop every linked device runs.
pub struct NodeLoop {
    pub transport: Arc<dyn MeshTransport>,
    pub distributor: Arc<dyn FirmwareDistributor>,
    pub device: Arc<dyn Device>,
    pub state: DeviceState,
    pub restart_delay: Duration,
}

enum Flow {
    Continue,
    Restart,
}

impl NodeLoop {
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("mesh::node_loop: running");

        while self.state.is_linked() && self.transport.is_connected() {
            let received = tokio::select! {
                _ = self.state.link_lost() => break,
                received = self.transport.recv_node() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!("mesh::node_loop: <{}> receive", e);
                    continue;
                }
            };

            if let Flow::Restart = self.handle(message).await {
                return Ok(());
            }
        }

        warn!("mesh::node_loop: exited");
        Ok(())
    }

    async fn handle(&self, message: MeshMessage) -> Flow {
        if message.kind == MessageKind::UpgradeFragment {
            if let Err(e) = self
                .distributor
                .handle_node_fragment(message.source, &message.payload)
            {
                warn!("mesh::node_loop: <{}> upgrade fragment from {}", e, message.source);
            }
            return Flow::Continue;
        }

        let text = message.text();
        info!(
            "mesh::node_loop: from {} size: {} data: {}",
            message.source,
            message.payload.len(),
            text
        );

        if text.as_bytes() == RESTART_PAYLOAD {
            info!("mesh::node_loop: restart requested to switch firmware");
            warn!(
                "mesh::node_loop: device restarts in {} ms",
                self.restart_delay.as_millis()
            );
            // Outside the link_lost select: once requested, a restart goes
            // ahead even if the parent link drops during the delay.
            tokio::time::sleep(self.restart_delay).await;
            self.device.restart();
            return Flow::Restart;
        }

        Flow::Continue
    }
}

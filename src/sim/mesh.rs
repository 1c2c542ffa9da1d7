use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use common::{MeshAddress, MessageKind, MAX_PAYLOAD_LEN};
use tokio::sync::mpsc;

use super::lock;
use crate::config::ROOT_LAYER;
use crate::error::TransportError;
use crate::mesh::{MeshMessage, MeshTransport};
use crate::BoxFuture;

/// A frame that left a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: MeshAddress,
    pub to: MeshAddress,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    /// Sent upstream to the root rather than to a node.
    pub upstream: bool,
}

struct Endpoint {
    node_tx: mpsc::UnboundedSender<MeshMessage>,
    root_tx: mpsc::UnboundedSender<MeshMessage>,
    layer: Arc<AtomicI32>,
}

#[derive(Default)]
struct MeshInner {
    endpoints: BTreeMap<MeshAddress, Endpoint>,
    unreachable: BTreeSet<MeshAddress>,
    deliveries: Vec<Delivery>,
}

/// Shared medium every [`SimTransport`] is attached to.
#[derive(Clone, Default)]
pub struct SimMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl SimMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device at `layer`. The device at the root layer receives
    /// upstream traffic.
    pub fn join(&self, address: MeshAddress, layer: i32) -> Arc<SimTransport> {
        let (node_tx, node_rx) = mpsc::unbounded_channel();
        let (root_tx, root_rx) = mpsc::unbounded_channel();
        let layer = Arc::new(AtomicI32::new(layer));

        lock(&self.inner).endpoints.insert(
            address,
            Endpoint {
                node_tx,
                root_tx,
                layer: Arc::clone(&layer),
            },
        );

        Arc::new(SimTransport {
            address,
            mesh: self.clone(),
            node_rx: tokio::sync::Mutex::new(node_rx),
            root_rx: tokio::sync::Mutex::new(root_rx),
            connected: AtomicBool::new(true),
            layer,
            recv_errors: Mutex::default(),
        })
    }

    /// Frames to `address` are lost and acknowledged writes to it fail.
    pub fn set_unreachable(&self, address: MeshAddress, unreachable: bool) {
        let mut inner = lock(&self.inner);
        if unreachable {
            inner.unreachable.insert(address);
        } else {
            inner.unreachable.remove(&address);
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.inner).deliveries.clone()
    }

    /// Addresses that received `payload` as a plain frame.
    pub fn plain_recipients(&self, payload: &[u8]) -> Vec<MeshAddress> {
        lock(&self.inner)
            .deliveries
            .iter()
            .filter(|d| d.kind == MessageKind::Plain && d.payload == payload)
            .map(|d| d.to)
            .collect()
    }

    fn send(
        &self,
        from: MeshAddress,
        targets: &[MeshAddress],
        kind: MessageKind,
        payload: &[u8],
        ack: bool,
    ) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);

        let recipients: Vec<MeshAddress> = if targets.iter().any(MeshAddress::is_broadcast) {
            inner
                .endpoints
                .keys()
                .copied()
                .filter(|address| *address != from)
                .collect()
        } else {
            targets.to_vec()
        };

        let mut failed = None;
        for to in recipients {
            let delivered = !inner.unreachable.contains(&to)
                && inner
                    .endpoints
                    .get(&to)
                    .map(|endpoint| {
                        endpoint
                            .node_tx
                            .send(MeshMessage::new(from, kind, payload.to_vec()))
                            .is_ok()
                    })
                    .unwrap_or(false);

            if delivered {
                inner.deliveries.push(Delivery {
                    from,
                    to,
                    kind,
                    payload: payload.to_vec(),
                    upstream: false,
                });
            } else if failed.is_none() {
                failed = Some(to);
            }
        }

        match failed {
            Some(to) if ack => Err(TransportError::Unreachable(to)),
            _ => Ok(()),
        }
    }

    fn send_upstream(&self, from: MeshAddress, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        let root = inner
            .endpoints
            .iter()
            .find(|(_, endpoint)| endpoint.layer.load(Ordering::SeqCst) == ROOT_LAYER)
            .map(|(address, endpoint)| (*address, endpoint.root_tx.clone()));

        let (to, root_tx) = root.ok_or(TransportError::Disconnected)?;
        root_tx
            .send(MeshMessage::new(from, kind, payload.to_vec()))
            .map_err(|_| TransportError::Unreachable(to))?;
        inner.deliveries.push(Delivery {
            from,
            to,
            kind,
            payload: payload.to_vec(),
            upstream: true,
        });
        Ok(())
    }
}

/// One device's view of the [`SimMesh`].
pub struct SimTransport {
    address: MeshAddress,
    mesh: SimMesh,
    node_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MeshMessage>>,
    root_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MeshMessage>>,
    connected: AtomicBool,
    layer: Arc<AtomicI32>,
    recv_errors: Mutex<VecDeque<TransportError>>,
}

impl SimTransport {
    /// Make the next receive, on either queue, fail with `error` before any
    /// queued frame is handed out.
    pub fn inject_recv_error(&self, error: TransportError) {
        lock(&self.recv_errors).push_back(error);
    }

    fn pending_recv_error(&self) -> Result<(), TransportError> {
        match lock(&self.recv_errors).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_layer(&self, layer: i32) {
        self.layer.store(layer, Ordering::SeqCst);
    }

    pub fn mesh(&self) -> &SimMesh {
        &self.mesh
    }

    fn check_outgoing(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TransportError::TooLarge(payload.len()));
        }
        Ok(())
    }
}

impl MeshTransport for SimTransport {
    fn address(&self) -> MeshAddress {
        self.address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn layer(&self) -> i32 {
        self.layer.load(Ordering::SeqCst)
    }

    fn recv_node(&self) -> BoxFuture<'_, Result<MeshMessage, TransportError>> {
        Box::pin(async move {
            self.pending_recv_error()?;
            self.node_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(TransportError::Closed)
        })
    }

    fn recv_root(&self) -> BoxFuture<'_, Result<MeshMessage, TransportError>> {
        Box::pin(async move {
            self.pending_recv_error()?;
            self.root_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(TransportError::Closed)
        })
    }

    fn write<'a>(
        &'a self,
        targets: &'a [MeshAddress],
        kind: MessageKind,
        payload: &'a [u8],
        ack: bool,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.check_outgoing(payload)?;
            self.mesh.send(self.address, targets, kind, payload, ack)
        })
    }

    fn write_to_root<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.check_outgoing(payload)?;
            self.mesh.send_upstream(self.address, kind, payload)
        })
    }
}

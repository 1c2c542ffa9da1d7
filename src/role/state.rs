use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Bridges the mesh to the broker and the firmware server.
    Root,
    Node,
}

impl NodeRole {
    pub fn from_layer(layer: i32, root_layer: i32) -> Self {
        if layer == root_layer {
            NodeRole::Root
        } else {
            NodeRole::Node
        }
    }
}

/// Write side of the device flags. Only the role monitor holds one.
pub struct StateWriter {
    role: watch::Sender<Option<NodeRole>>,
    linked: watch::Sender<bool>,
    connected: watch::Sender<bool>,
}

/// Read-only view of the device flags, cheap to clone into every task.
#[derive(Clone)]
pub struct DeviceState {
    role: watch::Receiver<Option<NodeRole>>,
    linked: watch::Receiver<bool>,
    connected: watch::Receiver<bool>,
}

/// Fresh flags: no role, no parent link, not bridged.
pub fn channel() -> (StateWriter, DeviceState) {
    let (role_tx, role_rx) = watch::channel(None);
    let (linked_tx, linked_rx) = watch::channel(false);
    let (connected_tx, connected_rx) = watch::channel(false);
    (
        StateWriter {
            role: role_tx,
            linked: linked_tx,
            connected: connected_tx,
        },
        DeviceState {
            role: role_rx,
            linked: linked_rx,
            connected: connected_rx,
        },
    )
}

impl StateWriter {
    pub fn set_role(&self, role: Option<NodeRole>) {
        self.role.send_if_modified(|current| replace_if_changed(current, role));
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.send_if_modified(|current| replace_if_changed(current, linked));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected
            .send_if_modified(|current| replace_if_changed(current, connected));
    }
}

fn replace_if_changed<T: PartialEq>(current: &mut T, next: T) -> bool {
    if *current == next {
        false
    } else {
        *current = next;
        true
    }
}

impl DeviceState {
    pub fn role(&self) -> Option<NodeRole> {
        *self.role.borrow()
    }

    pub fn is_root(&self) -> bool {
        self.role() == Some(NodeRole::Root)
    }

    /// Whether the device currently has a parent link.
    pub fn is_linked(&self) -> bool {
        *self.linked.borrow()
    }

    /// Whether the root is bridged to the broker.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolves once the parent link is down (immediately if it already is).
    pub async fn link_lost(&mut self) {
        loop {
            if !*self.linked.borrow_and_update() {
                return;
            }
            if self.linked.changed().await.is_err() {
                return;
            }
        }
    }

    /// Watch the broker connectivity flag. The bridge follows its edges.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

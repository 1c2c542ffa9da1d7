use std::collections::BTreeSet;

use common::MeshAddress;

use crate::error::{DistributionError, StagingError};
use crate::BoxFuture;

/// Outcome of one fan-out, read once by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeResult {
    /// Devices that received and validated the whole image.
    pub succeeded: BTreeSet<MeshAddress>,
    /// Devices that were targeted but never finished.
    pub unfinished: usize,
}

impl UpgradeResult {
    pub fn new(succeeded: impl IntoIterator<Item = MeshAddress>, unfinished: usize) -> Self {
        Self {
            succeeded: succeeded.into_iter().collect(),
            unfinished,
        }
    }

    pub fn succeeded_addresses(&self) -> Vec<MeshAddress> {
        self.succeeded.iter().copied().collect()
    }
}

/// The firmware distribution library: flash staging on the root, fragment
/// handling on every device, and the reliable mesh fan-out.
pub trait FirmwareDistributor: Send + Sync {
    /// Prepare the staging area for an image of `size` bytes.
    fn init_staging(&self, name: &str, size: u64) -> Result<(), StagingError>;

    fn write_chunk(&self, chunk: &[u8]) -> Result<(), StagingError>;

    /// Push the staged image to `targets` and wait for per-device results or
    /// the library's own timeout.
    fn distribute<'a>(
        &'a self,
        targets: &'a [MeshAddress],
    ) -> BoxFuture<'a, Result<UpgradeResult, DistributionError>>;

    /// Upgrade frame that arrived at the root (status from a node).
    fn handle_root_fragment(&self, source: MeshAddress, payload: &[u8]) -> Result<(), StagingError>;

    /// Upgrade frame that arrived at a node (image data from the root).
    fn handle_node_fragment(&self, source: MeshAddress, payload: &[u8]) -> Result<(), StagingError>;

    /// Drop whatever the current cycle staged. Must tolerate repeated calls.
    fn release(&self);
}

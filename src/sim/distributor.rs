use std::sync::{Arc, Mutex};

use common::{MeshAddress, MessageKind, MAX_PAYLOAD_LEN};
use tokio::sync::watch;

use super::lock;
use crate::error::{DistributionError, StagingError};
use crate::mesh::MeshTransport;
use crate::ota::{FirmwareDistributor, UpgradeResult};
use crate::BoxFuture;

#[derive(Default)]
struct Recorded {
    staged: Option<(String, u64)>,
    staging_history: Vec<(String, u64)>,
    image: Vec<u8>,
    init_calls: usize,
    chunks: usize,
    releases: usize,
    distributions: Vec<Vec<MeshAddress>>,
    root_fragments: Vec<(MeshAddress, Vec<u8>)>,
    node_fragments: Vec<(MeshAddress, Vec<u8>)>,
    result: Option<UpgradeResult>,
    fail_init: bool,
    fail_write_after: Option<usize>,
    rejected_fragments: usize,
}

impl Recorded {
    /// Consume one pending fragment rejection, if any.
    fn reject_fragment(&mut self) -> Result<(), StagingError> {
        if self.rejected_fragments == 0 {
            return Ok(());
        }
        self.rejected_fragments -= 1;
        Err(StagingError::Write("corrupt upgrade fragment".to_string()))
    }
}

/// Records every call and answers `distribute` with a configured result.
///
/// With a transport attached the staged image is also pushed to the targets
/// as upgrade fragments.
pub struct SimDistributor {
    recorded: Mutex<Recorded>,
    gate: watch::Sender<bool>,
    transport: Mutex<Option<Arc<dyn MeshTransport>>>,
}

impl Default for SimDistributor {
    fn default() -> Self {
        Self {
            recorded: Mutex::default(),
            gate: watch::channel(true).0,
            transport: Mutex::new(None),
        }
    }
}

impl SimDistributor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, transport: Arc<dyn MeshTransport>) {
        *lock(&self.transport) = Some(transport);
    }

    /// Result of the next distributions. Unset means every explicit target
    /// succeeded.
    pub fn set_result(&self, result: UpgradeResult) {
        lock(&self.recorded).result = Some(result);
    }

    pub fn fail_init(&self) {
        lock(&self.recorded).fail_init = true;
    }

    /// Let `chunks` writes succeed, then fail every following one.
    pub fn fail_write_after(&self, chunks: usize) {
        lock(&self.recorded).fail_write_after = Some(chunks);
    }

    /// Reject the next `count` inbound upgrade fragments, root or node side.
    /// Rejected fragments are not recorded.
    pub fn fail_fragments(&self, count: usize) {
        lock(&self.recorded).rejected_fragments += count;
    }

    /// Park `distribute` until [`SimDistributor::resume`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Staging currently held, `None` once released.
    pub fn staged(&self) -> Option<(String, u64)> {
        lock(&self.recorded).staged.clone()
    }

    /// Every `(name, size)` staging was initialised with, oldest first.
    pub fn staging_history(&self) -> Vec<(String, u64)> {
        lock(&self.recorded).staging_history.clone()
    }

    /// Bytes written since the last successful `init_staging`.
    pub fn image(&self) -> Vec<u8> {
        lock(&self.recorded).image.clone()
    }

    pub fn init_calls(&self) -> usize {
        lock(&self.recorded).init_calls
    }

    pub fn chunks(&self) -> usize {
        lock(&self.recorded).chunks
    }

    pub fn releases(&self) -> usize {
        lock(&self.recorded).releases
    }

    pub fn distributions(&self) -> Vec<Vec<MeshAddress>> {
        lock(&self.recorded).distributions.clone()
    }

    pub fn root_fragments(&self) -> Vec<(MeshAddress, Vec<u8>)> {
        lock(&self.recorded).root_fragments.clone()
    }

    pub fn node_fragments(&self) -> Vec<(MeshAddress, Vec<u8>)> {
        lock(&self.recorded).node_fragments.clone()
    }
}

impl FirmwareDistributor for SimDistributor {
    fn init_staging(&self, name: &str, size: u64) -> Result<(), StagingError> {
        let mut recorded = lock(&self.recorded);
        recorded.init_calls += 1;
        if recorded.fail_init {
            return Err(StagingError::Init {
                name: name.to_string(),
                size,
                reason: "no free partition".to_string(),
            });
        }
        recorded.staged = Some((name.to_string(), size));
        recorded.staging_history.push((name.to_string(), size));
        recorded.image.clear();
        recorded.chunks = 0;
        Ok(())
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<(), StagingError> {
        let mut recorded = lock(&self.recorded);
        if recorded.staged.is_none() {
            return Err(StagingError::NotInitialised);
        }
        if let Some(limit) = recorded.fail_write_after {
            if recorded.chunks >= limit {
                return Err(StagingError::Write("flash write failed".to_string()));
            }
        }
        recorded.chunks += 1;
        recorded.image.extend_from_slice(chunk);
        Ok(())
    }

    fn distribute<'a>(
        &'a self,
        targets: &'a [MeshAddress],
    ) -> BoxFuture<'a, Result<UpgradeResult, DistributionError>> {
        Box::pin(async move {
            let mut gate = self.gate.subscribe();
            if gate.wait_for(|open| *open).await.is_err() {
                return Err(DistributionError::Failed("distributor dropped".to_string()));
            }

            let (image, result) = {
                let mut recorded = lock(&self.recorded);
                if recorded.staged.is_none() {
                    return Err(DistributionError::NothingStaged);
                }
                recorded.distributions.push(targets.to_vec());
                let result = recorded.result.clone().unwrap_or_else(|| {
                    UpgradeResult::new(targets.iter().copied().filter(|t| !t.is_broadcast()), 0)
                });
                (recorded.image.clone(), result)
            };

            let transport = lock(&self.transport).clone();
            if let Some(transport) = transport {
                for fragment in image.chunks(MAX_PAYLOAD_LEN) {
                    if let Err(e) = transport
                        .write(targets, MessageKind::UpgradeFragment, fragment, false)
                        .await
                    {
                        warn!("sim::distributor: <{}> pushing fragment", e);
                        break;
                    }
                }
            }

            Ok(result)
        })
    }

    fn handle_root_fragment(&self, source: MeshAddress, payload: &[u8]) -> Result<(), StagingError> {
        let mut recorded = lock(&self.recorded);
        recorded.reject_fragment()?;
        recorded.root_fragments.push((source, payload.to_vec()));
        Ok(())
    }

    fn handle_node_fragment(&self, source: MeshAddress, payload: &[u8]) -> Result<(), StagingError> {
        let mut recorded = lock(&self.recorded);
        recorded.reject_fragment()?;
        recorded.node_fragments.push((source, payload.to_vec()));
        Ok(())
    }

    fn release(&self) {
        let mut recorded = lock(&self.recorded);
        recorded.releases += 1;
        recorded.staged = None;
    }
}

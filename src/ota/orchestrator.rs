//! Fetch, stage, distribute and notify: one firmware distribution cycle.
//!
//! ```text
//! Idle ──> Fetching ──> Staged ──> Distributing ──> Notifying ──> Idle
//!   ^         │           │             │
//!   │         └───────────┴─────────────┴──> Failed
//!   └────────────────────────────────────────────┘ (next command)
//! ```
//!
//! At most one cycle runs per device. A command arriving while a cycle is in
//! flight is rejected with [`Error::Busy`].

use std::sync::Arc;
use std::time::Duration;

use common::{MeshAddress, MessageKind, MAX_PAYLOAD_LEN, RESTART_PAYLOAD};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Serialize, Serializer};
use tokio::sync::watch;

use super::{FirmwareDistributor, FirmwareDownload, FirmwareSource, OtaEndpoint};
use crate::config::OtaConfig;
use crate::error::Error;
use crate::mesh::MeshTransport;
use crate::role::DeviceState;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Longest staging name the distribution library accepts.
pub const MAX_STAGING_NAME: usize = 31;

const FALLBACK_STAGING_NAME: &str = "firmware";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Fetching { url: String },
    Staged { name: String, size: u64 },
    Distributing,
    Notifying { targets: Vec<MeshAddress> },
    /// Terminal for the cycle, a new command may start the next one.
    Failed { stage: CycleStage, reason: String },
}

impl OtaPhase {
    pub fn is_busy(&self) -> bool {
        !matches!(self, OtaPhase::Idle | OtaPhase::Failed { .. })
    }

    fn stage(&self) -> Option<CycleStage> {
        match self {
            OtaPhase::Fetching { .. } => Some(CycleStage::Fetch),
            OtaPhase::Staged { .. } => Some(CycleStage::Stage),
            OtaPhase::Distributing => Some(CycleStage::Distribute),
            OtaPhase::Notifying { .. } => Some(CycleStage::Notify),
            OtaPhase::Idle | OtaPhase::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Fetch,
    Stage,
    Distribute,
    Notify,
}

/// Report of one finished cycle, published to the operator as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed {
        url: String,
        #[serde(serialize_with = "addresses_as_text")]
        succeeded: Vec<MeshAddress>,
        unfinished: usize,
        image_size: u64,
        image_crc32: u32,
        restart_delivered: bool,
    },
    Failed {
        url: String,
        stage: CycleStage,
        reason: String,
    },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            CycleOutcome::Completed { url, .. } | CycleOutcome::Failed { url, .. } => url,
        }
    }
}

fn addresses_as_text<S: Serializer>(addresses: &[MeshAddress], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(addresses.iter().map(MeshAddress::to_string))
}

/// Name the image is staged under: the last url path segment up to `.bin`.
pub fn staging_name(url: &str) -> String {
    let segment = reqwest::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();

    let stem = match segment.find(".bin") {
        Some(end) => &segment[..end],
        None => segment.as_str(),
    };

    let name: String = stem.chars().take(MAX_STAGING_NAME).collect();
    if name.is_empty() {
        FALLBACK_STAGING_NAME.to_string()
    } else {
        name
    }
}

struct StageFailure {
    stage: CycleStage,
    reason: String,
}

impl StageFailure {
    fn new(stage: CycleStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

struct Delivered {
    succeeded: Vec<MeshAddress>,
    unfinished: usize,
    image_size: u64,
    image_crc32: u32,
    restart_delivered: bool,
}

/// Marks the cycle failed if it is dropped before reaching a resting phase.
struct PhaseGuard<'a> {
    phase: &'a watch::Sender<OtaPhase>,
    armed: bool,
}

impl PhaseGuard<'_> {
    fn settle(mut self, next: OtaPhase) {
        self.armed = false;
        self.phase.send_replace(next);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let stage = self.phase.borrow().stage().unwrap_or(CycleStage::Fetch);
        warn!("ota::orchestrator: cycle cancelled during {:?}", stage);
        self.phase.send_replace(OtaPhase::Failed {
            stage,
            reason: "cancelled".to_string(),
        });
    }
}

/// Releases the staging area on every exit path.
struct StagingGuard<'a> {
    distributor: &'a dyn FirmwareDistributor,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        self.distributor.release();
    }
}

pub struct Orchestrator {
    source: Arc<dyn FirmwareSource>,
    distributor: Arc<dyn FirmwareDistributor>,
    transport: Arc<dyn MeshTransport>,
    state: DeviceState,
    open_retry_limit: Option<u32>,
    open_retry_backoff: Duration,
    targets: Vec<MeshAddress>,
    phase: watch::Sender<OtaPhase>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn FirmwareSource>,
        distributor: Arc<dyn FirmwareDistributor>,
        transport: Arc<dyn MeshTransport>,
        state: DeviceState,
        config: &OtaConfig,
    ) -> anyhow::Result<Self> {
        let (phase, _) = watch::channel(OtaPhase::Idle);
        Ok(Self {
            source,
            distributor,
            transport,
            state,
            open_retry_limit: config.open_retry_limit,
            open_retry_backoff: config.open_retry_backoff(),
            targets: config.target_addresses()?,
            phase,
        })
    }

    pub fn phase(&self) -> OtaPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OtaPhase> {
        self.phase.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.phase.borrow().is_busy()
    }

    pub fn targets(&self) -> &[MeshAddress] {
        &self.targets
    }

    /// Run one full cycle for `endpoint`.
    ///
    /// Stage failures are not errors here, they come back as
    /// [`CycleOutcome::Failed`] with the phase left at [`OtaPhase::Failed`].
    pub async fn run_cycle(&self, endpoint: OtaEndpoint) -> Result<CycleOutcome, Error> {
        if endpoint.is_empty() {
            return Err(Error::EmptyEndpoint);
        }
        let url = endpoint.url().to_string();

        let claimed = self.phase.send_if_modified(|phase| {
            if phase.is_busy() {
                return false;
            }
            *phase = OtaPhase::Fetching { url: url.clone() };
            true
        });
        if !claimed {
            warn!("ota::orchestrator: busy, dropping command for {}", url);
            return Err(Error::Busy);
        }

        info!("ota::orchestrator: cycle started for {}", url);
        let guard = PhaseGuard {
            phase: &self.phase,
            armed: true,
        };

        match self.drive(&url).await {
            Ok(delivered) => {
                info!(
                    "ota::orchestrator: cycle completed, {} upgraded, {} unfinished",
                    delivered.succeeded.len(),
                    delivered.unfinished
                );
                guard.settle(OtaPhase::Idle);
                Ok(CycleOutcome::Completed {
                    url,
                    succeeded: delivered.succeeded,
                    unfinished: delivered.unfinished,
                    image_size: delivered.image_size,
                    image_crc32: delivered.image_crc32,
                    restart_delivered: delivered.restart_delivered,
                })
            }
            Err(failure) => {
                error!(
                    "ota::orchestrator: cycle failed during {:?}: {}",
                    failure.stage, failure.reason
                );
                guard.settle(OtaPhase::Failed {
                    stage: failure.stage,
                    reason: failure.reason.clone(),
                });
                Ok(CycleOutcome::Failed {
                    url,
                    stage: failure.stage,
                    reason: failure.reason,
                })
            }
        }
    }

    async fn drive(&self, url: &str) -> Result<Delivered, StageFailure> {
        let mut download = self.open(url).await?;

        let size = match download.content_length() {
            Some(size) if size > 0 => size,
            _ => {
                self.log_diagnostic(download.as_mut()).await;
                return Err(StageFailure::new(
                    CycleStage::Fetch,
                    "origin declared no content length",
                ));
            }
        };

        let name = staging_name(url);
        info!("ota::orchestrator: staging {} ({} bytes)", name, size);
        let _staging = StagingGuard {
            distributor: self.distributor.as_ref(),
        };
        self.distributor
            .init_staging(&name, size)
            .map_err(|e| StageFailure::new(CycleStage::Stage, e.to_string()))?;
        self.phase.send_replace(OtaPhase::Staged {
            name: name.clone(),
            size,
        });

        let image_crc32 = self.stream(download.as_mut(), size).await?;
        drop(download);
        info!(
            "ota::orchestrator: staged {} bytes of {}, crc32: {:08x}",
            size, name, image_crc32
        );

        self.phase.send_replace(OtaPhase::Distributing);
        info!(
            "ota::orchestrator: distributing to {} target(s)",
            self.targets.len()
        );
        let result = self
            .distributor
            .distribute(&self.targets)
            .await
            .map_err(|e| StageFailure::new(CycleStage::Distribute, e.to_string()))?;

        if result.succeeded.is_empty() {
            return Err(StageFailure::new(
                CycleStage::Distribute,
                format!("no device upgraded, {} unfinished", result.unfinished),
            ));
        }

        let succeeded = result.succeeded_addresses();
        if result.unfinished > 0 {
            warn!(
                "ota::orchestrator: {} device(s) did not finish the upgrade",
                result.unfinished
            );
        }

        self.phase.send_replace(OtaPhase::Notifying {
            targets: succeeded.clone(),
        });
        let restart_delivered = match self
            .transport
            .write(&succeeded, MessageKind::Plain, RESTART_PAYLOAD, true)
            .await
        {
            Ok(()) => {
                info!("ota::orchestrator: restart sent to {} device(s)", succeeded.len());
                true
            }
            Err(e) => {
                error!("ota::orchestrator: <{}> sending restart", e);
                false
            }
        };

        Ok(Delivered {
            succeeded,
            unfinished: result.unfinished,
            image_size: size,
            image_crc32,
            restart_delivered,
        })
    }

    /// Open the image url. Only the root retries, and only while it stays root.
    async fn open(&self, url: &str) -> Result<Box<dyn FirmwareDownload>, StageFailure> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let e = match self.source.open(url).await {
                Ok(download) => return Ok(download),
                Err(e) => e,
            };

            if !self.state.is_root() {
                error!("ota::orchestrator: <{}> not root, giving up", e);
                return Err(StageFailure::new(CycleStage::Fetch, e.to_string()));
            }
            if let Some(limit) = self.open_retry_limit {
                if attempts >= limit {
                    error!("ota::orchestrator: <{}> after {} attempt(s)", e, attempts);
                    return Err(StageFailure::new(
                        CycleStage::Fetch,
                        format!("{e} (after {attempts} attempts)"),
                    ));
                }
            }

            warn!(
                "ota::orchestrator: <{}> attempt {}, retrying in {} ms",
                e,
                attempts,
                self.open_retry_backoff.as_millis()
            );
            tokio::time::sleep(self.open_retry_backoff).await;

            if !self.state.is_root() {
                return Err(StageFailure::new(
                    CycleStage::Fetch,
                    "device stopped being root while retrying",
                ));
            }
        }
    }

    /// Copy exactly `size` body bytes into staging, returning their CRC-32.
    async fn stream(&self, download: &mut dyn FirmwareDownload, size: u64) -> Result<u32, StageFailure> {
        let mut digest = CRC32.digest();
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        let mut written: u64 = 0;

        while written < size {
            let want = (size - written).min(buf.len() as u64) as usize;
            let n = download
                .read_chunk(&mut buf[..want])
                .await
                .map_err(|e| StageFailure::new(CycleStage::Fetch, e.to_string()))?;
            if n == 0 {
                return Err(StageFailure::new(
                    CycleStage::Fetch,
                    format!("body ended after {written} of {size} bytes"),
                ));
            }

            self.distributor
                .write_chunk(&buf[..n])
                .map_err(|e| StageFailure::new(CycleStage::Stage, e.to_string()))?;
            digest.update(&buf[..n]);
            written += n as u64;
            trace!("ota::orchestrator: staged {}/{}", written, size);
        }

        Ok(digest.finalize())
    }

    async fn log_diagnostic(&self, download: &mut dyn FirmwareDownload) {
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        match download.read_chunk(&mut buf).await {
            Ok(n) => error!(
                "ota::orchestrator: no firmware length, origin said: {}",
                String::from_utf8_lossy(&buf[..n])
            ),
            Err(e) => error!("ota::orchestrator: no firmware length, <{}> reading body", e),
        }
    }
}

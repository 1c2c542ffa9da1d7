//! Over-the-air firmware distribution: command parsing, firmware download,
//! staging and the mesh fan-out state machine.

pub mod command;
pub mod distributor;
pub mod orchestrator;
pub mod source;

pub use command::{parse_ota_endpoint, OtaEndpoint, MAX_URL_LEN, TOKEN_BUDGET};
pub use distributor::{FirmwareDistributor, UpgradeResult};
pub use orchestrator::{staging_name, CycleOutcome, CycleStage, Orchestrator, OtaPhase};
pub use source::{FirmwareDownload, FirmwareSource, HttpFirmwareSource};

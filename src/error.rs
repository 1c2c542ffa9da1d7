use common::MeshAddress;

/// Mesh send/receive failures. The message is lost, nothing above the
/// transport redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("mesh link is down")]
    Disconnected,
    #[error("no route to {0}")]
    Unreachable(MeshAddress),
    #[error("payload of {0} bytes does not fit a mesh frame")]
    TooLarge(usize),
    #[error("mesh receive queue closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to open {url}: {reason}")]
    Open { url: String, reason: String },
    #[error("failed to read firmware body: {0}")]
    Read(String),
}

/// Flash staging failures. Fatal to the current cycle only.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("failed to initialise staging for {name} ({size} bytes): {reason}")]
    Init {
        name: String,
        size: u64,
        reason: String,
    },
    #[error("failed to write firmware chunk: {0}")]
    Write(String),
    #[error("staging area is not initialised")]
    NotInitialised,
}

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("no staged firmware to distribute")]
    NothingStaged,
    #[error("firmware distribution failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid broker url {0}")]
    InvalidUrl(String),
    #[error("broker session is down")]
    SessionDown,
    #[error("broker client: {0}")]
    Client(String),
}

/// Reasons an OTA command never turned into a distribution cycle.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("a distribution cycle is already in flight")]
    Busy,
    #[error("command carried no ota endpoint")]
    EmptyEndpoint,
}

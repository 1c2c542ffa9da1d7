use alloc::string::String;

use serde::{Deserialize, Serialize};

/// Command accepted on the OTA command topic. Extra fields are ignored by the
/// gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaCommand {
    pub ota_endpoint: String,
}

impl OtaCommand {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            ota_endpoint: url.into(),
        }
    }

    /// Payload as a command producer would publish it.
    #[cfg(feature = "std")]
    pub fn to_payload(&self) -> alloc::vec::Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

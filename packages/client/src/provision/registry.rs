//! Device registration seam
//!
//! The provisioning workflow hands the extracted CSR to an external
//! collaborator and gets a compressed certificate back. The collaborator is
//! a trait so embedders can plug in their own backend; the CLI ships an
//! HTTP implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// The compressed certificate produced by device registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedCertificate {
    /// RFC 3339 validity start.
    pub not_before: String,
    /// RFC 3339 validity end.
    pub not_after: String,
    pub serial: String,
    pub signature: String,
}

/// Registration reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredDevice {
    pub compressed: CompressedCertificate,
}

/// External device-registration collaborator.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Register a device from its CSR, returning the certificate bundle to
    /// store on the board.
    async fn register_device(&self, csr: &str) -> Result<RegisteredDevice, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_reply_deserializes() {
        let reply: RegisteredDevice = serde_json::from_str(
            r#"{
                "compressed": {
                    "not_before": "2024-03-05T14:00:00Z",
                    "not_after": "2029-03-05T14:00:00Z",
                    "serial": "01ABCD",
                    "signature": "30450221"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(reply.compressed.serial, "01ABCD");
    }
}

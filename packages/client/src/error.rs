//! Error types
//!
//! One enum per protocol boundary. Network and agent-reported failures are
//! converted into terminal state emissions at the boundary where they occur;
//! these types also travel back to direct async callers.

use thiserror::Error;

/// Failures while locating or version-gating the agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No probed port on the candidate address answered with a 200.
    #[error("BoardLink Agent cannot be found at {0}")]
    NotFound(String),

    /// The agent answered but its `/info` payload lacks endpoint addresses.
    #[error("agent info is missing endpoint addresses")]
    IncompleteInfo,

    /// The agent stayed below the minimum version through all update attempts.
    #[error("agent version incompatible")]
    IncompatibleVersion,

    /// An update was requested; the agent is assumed to be restarting.
    #[error("agent is restarting after update")]
    AgentRestarting,
}

/// Transport-level channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("websocket send failed: {0}")]
    Send(String),
}

/// Failures initiating an upload. Agent-reported flashing failures arrive
/// as `UploadState::Error` emissions instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("You need at least one file to upload")]
    NoFiles,

    #[error("no agent endpoint available")]
    NoEndpoint,

    #[error("upload request failed: {0}")]
    Request(String),
}

/// Serial monitor handshake failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerialError {
    #[error("Can't find board at {0}")]
    UnknownPort(String),

    #[error("Failed to open serial monitor at {0}")]
    OpenFailed(String),

    #[error("Failed to close serial monitor at {0}")]
    CloseFailed(String),

    /// The inbound event stream ended before the handshake settled.
    #[error("channel closed before the serial handshake settled")]
    HandshakeInterrupted,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Device-registration collaborator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device registration request failed: {0}")]
    Request(String),

    #[error("device registration rejected: {0}")]
    Rejected(String),
}

/// Terminal failures of the board provisioning sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("cannot find agent")]
    ChannelNotOpen,

    #[error("upload in progress")]
    UploadInProgress,

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error("We couldn't find the Crypto Chip")]
    CryptoChipMissing,

    #[error("already configured")]
    AlreadyConfigured,

    #[error("We were not able to generate the CSR.")]
    CsrGeneration,

    /// Unrecognized firmware error text, surfaced verbatim.
    #[error("{0}")]
    SerialDialog(String),

    #[error("serial stream ended during the provisioning dialog")]
    SerialStreamEnded,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("certificate storage failed: {0}")]
    CertificateStore(String),

    #[error("invalid certificate timestamps: {0}")]
    InvalidCertificate(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

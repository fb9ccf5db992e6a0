//! BoardLink client library
//!
//! Locates the locally-running BoardLink flashing agent, keeps a persistent
//! websocket channel to it, and drives the workflows built on that channel:
//! firmware and tool upload, tool download, serial-port monitoring, and the
//! cryptographic board-provisioning sequence.
//!
//! Consumers observe outcomes by subscribing to state channels; network and
//! protocol failures are converted into terminal emissions at the boundary
//! where they occur.

pub mod agent;
pub mod connection;
pub mod error;
pub mod provision;
pub mod state;

// Re-exports for convenience
pub use agent::daemon::{AgentDaemon, ChannelStatus, DaemonConfig};
pub use agent::discovery::{AgentEndpoint, AgentLocator, Scheme, MIN_VERSION};
pub use agent::download::DownloadState;
pub use agent::serial::SerialMonitorState;
pub use agent::upload::{UploadData, UploadFile, UploadOptions, UploadState, UploadTarget};
pub use connection::protocol::{AgentEvent, Command, DeviceList, FlagValue, PortInfo};
pub use connection::transport::{Transport, TransportEvent, WsTransport};
pub use error::{
    ChannelError, DiscoveryError, ProvisioningError, RegistryError, SerialError, UploadError,
};
pub use provision::registry::{CompressedCertificate, DeviceRegistry, RegisteredDevice};
pub use provision::sketch::{provisioning_sketch, ProvisioningSketch, PROVISIONING_BAUDRATE};
pub use provision::workflow::{
    BoardProvisioner, BoardUploadSpec, ConfigureState, ProvisionBoard,
};

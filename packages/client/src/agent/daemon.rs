//! Agent daemon facade
//!
//! `AgentDaemon` owns the one live channel to the agent and everything that
//! hangs off it: the discovery loop, the inbound dispatcher fanning frames
//! out into state channels, and the outbound command primitives the
//! higher-level workflows are built on.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::agent::discovery::{AgentEndpoint, AgentLocator, LOOPBACK_ADDRESS, LOOPBACK_HOST};
use crate::agent::download::{self, DownloadState};
use crate::agent::serial::SerialMonitorState;
use crate::agent::upload::{self, UploadData, UploadState, UploadTarget};
use crate::connection::protocol::{
    ports_equal, AgentEvent, Command, DeviceList, PortInfo, SerialAck,
};
use crate::connection::transport::{Transport, TransportEvent, WsTransport};
use crate::error::{ChannelError, SerialError, UploadError};
use crate::state::StateChannel;

const INBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;
// The CSR dialog must observe every chunk; size the serial stream generously.
const SERIAL_BUFFER: usize = 1024;
const ERROR_BUFFER: usize = 32;

/// Agent-side error text marking a port that is going down.
const PORT_CLOSING_MARKER: &str = "trying to close";

/// Tool package the bootstrap downloads come from.
const TOOL_PACKAGE: &str = "boardlink";
const DEFAULT_REPLACEMENT_STRATEGY: &str = "keep";

/// Tri-state channel status: `Pending` until the first discovery scan
/// settles, then `Closed`/`Open` tracking the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Pending,
    Closed,
    Open,
}

/// Daemon construction parameters.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Candidate agent base addresses, in priority order. Fixed for the
    /// lifetime of the daemon.
    pub candidate_addresses: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            candidate_addresses: vec![LOOPBACK_ADDRESS.to_string(), LOOPBACK_HOST.to_string()],
        }
    }
}

impl DaemonConfig {
    /// Probe the secure loopback host before the plain one, for embedding
    /// environments that resolve `https://localhost` more reliably.
    pub fn secure_host_first() -> Self {
        Self {
            candidate_addresses: vec![LOOPBACK_HOST.to_string(), LOOPBACK_ADDRESS.to_string()],
        }
    }
}

/// Fans inbound transport events out into the daemon's state channels.
/// Runs as a single task: all state mutation happens on this one timeline.
struct Dispatcher {
    devices: StateChannel<DeviceList>,
    uploading: StateChannel<UploadState>,
    downloading: StateChannel<DownloadState>,
    serial_monitor: StateChannel<SerialMonitorState>,
    channel_status: StateChannel<ChannelStatus>,
    serial_data: broadcast::Sender<String>,
    events: broadcast::Sender<AgentEvent>,
    errors: broadcast::Sender<String>,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(frame) => {
                    for event in frame.events() {
                        let _ = self.events.send(event.clone());
                        self.handle_event(event);
                    }
                }
                TransportEvent::Error(err) => {
                    warn!(error = %err, "channel transport error");
                    let _ = self.errors.send(err);
                }
                TransportEvent::Closed => {
                    info!("channel disconnected");
                    self.channel_status.set(ChannelStatus::Closed);
                }
            }
        }
    }

    fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::DeviceList { network, ports } => self.update_devices(network, ports),
            AgentEvent::SerialData(chunk) => {
                let _ = self.serial_data.send(chunk);
            }
            AgentEvent::Programmer(report) => {
                upload::apply_programmer_status(&self.uploading, &report)
            }
            AgentEvent::Download { status, msg } => {
                download::apply_download_status(&self.downloading, &status, msg)
            }
            AgentEvent::UploadFatal(err) => self.uploading.set(UploadState::Error(err)),
            AgentEvent::Error(text) => {
                if text.contains(PORT_CLOSING_MARKER) {
                    self.serial_monitor.set(SerialMonitorState::Closed);
                }
                let _ = self.errors.send(text);
            }
            // Settled by whichever open/close watcher is pending.
            AgentEvent::SerialAck(_) => {}
        }
    }

    /// Replace one half of the device list, but only when it differs
    /// structurally from the cached value; identical repeats do not emit.
    fn update_devices(&self, network: bool, ports: Vec<PortInfo>) {
        let current = self.devices.get();
        if network {
            if !ports_equal(&current.network, &ports) {
                self.devices.set(DeviceList {
                    serial: current.serial,
                    network: ports,
                });
            }
        } else if !ports_equal(&current.serial, &ports) {
            self.devices.set(DeviceList {
                serial: ports,
                network: current.network,
            });
        }
    }
}

pub struct AgentDaemon {
    transport: Arc<dyn Transport>,
    http: reqwest::Client,
    locator: AgentLocator,
    pub agent_found: StateChannel<bool>,
    pub channel_status: StateChannel<ChannelStatus>,
    pub devices: StateChannel<DeviceList>,
    pub uploading: StateChannel<UploadState>,
    pub downloading: StateChannel<DownloadState>,
    pub serial_monitor: StateChannel<SerialMonitorState>,
    serial_data: broadcast::Sender<String>,
    events: broadcast::Sender<AgentEvent>,
    errors: broadcast::Sender<String>,
    endpoint: RwLock<Option<AgentEndpoint>>,
    /// At most one serial open/close handshake may be pending at a time.
    serial_handshake: Mutex<()>,
}

impl AgentDaemon {
    /// Build a daemon over the websocket transport.
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        Self::with_transport(Arc::new(WsTransport::new(tx)), rx, config)
    }

    /// Build a daemon over a caller-supplied transport. This is the seam the
    /// tests use; `inbound` must carry the transport's events.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<TransportEvent>,
        config: DaemonConfig,
    ) -> Arc<Self> {
        let devices = StateChannel::new(DeviceList::default());
        let uploading = StateChannel::new(UploadState::Idle);
        let downloading = StateChannel::new(DownloadState::Idle);
        let serial_monitor = StateChannel::new(SerialMonitorState::Closed);
        let channel_status = StateChannel::new(ChannelStatus::Pending);
        let agent_found = StateChannel::new(false);
        let (serial_data, _) = broadcast::channel(SERIAL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (errors, _) = broadcast::channel(ERROR_BUFFER);

        let locator = AgentLocator::new(
            config.candidate_addresses,
            errors.clone(),
            channel_status.clone(),
        );

        let dispatcher = Dispatcher {
            devices: devices.clone(),
            uploading: uploading.clone(),
            downloading: downloading.clone(),
            serial_monitor: serial_monitor.clone(),
            channel_status: channel_status.clone(),
            serial_data: serial_data.clone(),
            events: events.clone(),
            errors: errors.clone(),
        };
        tokio::spawn(dispatcher.run(inbound));

        Arc::new(Self {
            transport,
            http: reqwest::Client::new(),
            locator,
            agent_found,
            channel_status,
            devices,
            uploading,
            downloading,
            serial_monitor,
            serial_data,
            events,
            errors,
            endpoint: RwLock::new(None),
            serial_handshake: Mutex::new(()),
        })
    }

    /// Discover-and-connect loop: find an agent, open the channel, and when
    /// the channel drops go back to discovery. Runs until the daemon is
    /// dropped.
    pub async fn run(&self) {
        loop {
            let endpoint = self.locator.discover().await;
            *self.endpoint.write() = Some(endpoint.clone());
            self.agent_found.set(true);

            match self.open_channel(&endpoint).await {
                Ok(()) => {
                    self.channel_status
                        .wait_for(|s| *s == ChannelStatus::Closed)
                        .await;
                    info!("channel closed; rediscovering agent");
                }
                Err(err) => {
                    warn!(error = %err, "channel connect failed");
                    let _ = self.errors.send(err.to_string());
                }
            }
            self.agent_found.set(false);
        }
    }

    async fn open_channel(&self, endpoint: &AgentEndpoint) -> Result<(), ChannelError> {
        self.transport.connect(&endpoint.socket).await?;
        // Windows drivers and bossac are needed before boards can be
        // detected at all; request them on every fresh channel.
        self.download_tool(
            "windows-drivers",
            "latest",
            TOOL_PACKAGE,
            DEFAULT_REPLACEMENT_STRATEGY,
        )
        .await?;
        self.download_tool("bossac", "1.7.0", TOOL_PACKAGE, DEFAULT_REPLACEMENT_STRATEGY)
            .await?;
        self.send(Command::List).await?;
        self.channel_status.set(ChannelStatus::Open);
        Ok(())
    }

    /// Send one raw command on the channel.
    pub async fn send(&self, command: Command) -> Result<(), ChannelError> {
        self.transport.send(command).await
    }

    /// Write text to an open serial port.
    pub async fn write_serial(&self, port: &str, message: &str) -> Result<(), ChannelError> {
        self.send(Command::Send {
            port: port.to_string(),
            message: message.to_string(),
        })
        .await
    }

    /// Request every known serial port to close.
    pub async fn close_all_ports(&self) -> Result<(), ChannelError> {
        for port in self.devices.get().serial {
            self.send(Command::Close { port: port.name }).await?;
        }
        Ok(())
    }

    /// Ask the agent to download a tool; progress arrives on the download
    /// state channel.
    pub async fn download_tool(
        &self,
        name: &str,
        version: &str,
        package: &str,
        strategy: &str,
    ) -> Result<(), ChannelError> {
        self.downloading.set(DownloadState::InProgress(None));
        self.send(Command::DownloadTool {
            name: name.to_string(),
            version: version.to_string(),
            package: package.to_string(),
            strategy: strategy.to_string(),
        })
        .await
    }

    /// Reset the upload state ahead of a new upload, releasing the previous
    /// terminal Done/Error value.
    pub fn init_upload(&self) {
        self.uploading.set(UploadState::Idle);
    }

    /// Flash `data` onto `target`. The outcome beyond request submission
    /// arrives as programmer-status frames on the upload state channel.
    pub async fn upload(&self, target: &UploadTarget, data: &UploadData) -> Result<(), UploadError> {
        self.uploading.set(UploadState::InProgress(None));

        if data.files.is_empty() {
            let err = UploadError::NoFiles;
            self.uploading.set(UploadState::Error(err.to_string()));
            return Err(err);
        }

        if !target.network {
            // Flashing and monitoring are mutually exclusive on one port;
            // the request only goes out once the monitor reports not-open.
            let _ = self.close_serial_monitor(&target.port).await;
            self.serial_monitor.wait_for(|s| !s.is_open()).await;
        }

        let base = match self.endpoint.read().as_ref() {
            Some(endpoint) => endpoint.base.clone(),
            None => {
                let err = UploadError::NoEndpoint;
                self.uploading.set(UploadState::Error(err.to_string()));
                return Err(err);
            }
        };

        let payload = upload::build_upload_payload(target, data);
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(err) => {
                let err = UploadError::Request(err.to_string());
                self.uploading.set(UploadState::Error(err.to_string()));
                return Err(err);
            }
        };

        debug!(board = %payload.board, port = %payload.port, "posting upload request");
        if let Err(err) = self
            .http
            .post(format!("{}/upload", base))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
        {
            // A network-level failure of the request itself is terminal;
            // agent-reported failures arrive later as status frames.
            self.uploading.set(UploadState::Error(err.to_string()));
            return Err(UploadError::Request(err.to_string()));
        }
        Ok(())
    }

    /// Interrupt a running upload. The error state is published immediately,
    /// without waiting for the agent's acknowledgement.
    pub async fn stop_upload(&self) -> Result<(), ChannelError> {
        self.uploading
            .set(UploadState::Error("upload stopped".to_string()));
        self.send(Command::KillUpload).await
    }

    /// Open the serial monitor on `port`. No-ops when an upload is running
    /// or the port is already open; unknown ports fail immediately.
    pub async fn open_serial_monitor(&self, port: &str, baudrate: u32) -> Result<(), SerialError> {
        let devices = self.devices.get();
        let Some(device) = devices.serial.iter().find(|p| p.name == port) else {
            let err = SerialError::UnknownPort(port.to_string());
            self.serial_monitor
                .set(SerialMonitorState::Failed(err.to_string()));
            return Err(err);
        };
        if self.uploading.get().in_progress() || device.is_open {
            return Ok(());
        }

        let _guard = self.serial_handshake.lock().await;
        // Subscribe before sending so the acknowledgement cannot be missed;
        // the watcher is dropped as soon as either outcome settles.
        let mut events = self.events.subscribe();
        self.send(Command::Open {
            port: port.to_string(),
            baudrate,
        })
        .await?;

        loop {
            match events.recv().await {
                Ok(AgentEvent::SerialAck(SerialAck::Opened)) => {
                    self.serial_monitor.set(SerialMonitorState::Open);
                    return Ok(());
                }
                Ok(AgentEvent::SerialAck(SerialAck::OpenFailed)) => {
                    let err = SerialError::OpenFailed(port.to_string());
                    self.serial_monitor
                        .set(SerialMonitorState::Failed(err.to_string()));
                    return Err(err);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SerialError::HandshakeInterrupted)
                }
            }
        }
    }

    /// Close the serial monitor on `port`. No-ops when the port is already
    /// closed; unknown ports fail immediately.
    pub async fn close_serial_monitor(&self, port: &str) -> Result<(), SerialError> {
        let devices = self.devices.get();
        let Some(device) = devices.serial.iter().find(|p| p.name == port) else {
            let err = SerialError::UnknownPort(port.to_string());
            self.serial_monitor
                .set(SerialMonitorState::Failed(err.to_string()));
            return Err(err);
        };
        if !device.is_open {
            return Ok(());
        }

        let _guard = self.serial_handshake.lock().await;
        let mut events = self.events.subscribe();
        self.send(Command::Close {
            port: port.to_string(),
        })
        .await?;

        loop {
            match events.recv().await {
                Ok(AgentEvent::SerialAck(SerialAck::Closed)) => {
                    self.serial_monitor.set(SerialMonitorState::Closed);
                    return Ok(());
                }
                Ok(AgentEvent::SerialAck(SerialAck::CloseFailed)) => {
                    let err = SerialError::CloseFailed(port.to_string());
                    self.serial_monitor
                        .set(SerialMonitorState::Failed(err.to_string()));
                    return Err(err);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SerialError::HandshakeInterrupted)
                }
            }
        }
    }

    /// Ask a found agent to pause itself. No-op before discovery.
    pub async fn stop_agent(&self) -> Result<(), reqwest::Error> {
        if !self.agent_found.get() {
            return Ok(());
        }
        let base = match self.endpoint.read().as_ref() {
            Some(endpoint) => endpoint.base.clone(),
            None => return Ok(()),
        };
        self.http.post(format!("{}/pause", base)).send().await?;
        Ok(())
    }

    /// The endpoint selected by the last successful discovery.
    pub fn endpoint(&self) -> Option<AgentEndpoint> {
        self.endpoint.read().clone()
    }

    /// Serial monitor data chunks, in arrival order.
    pub fn serial_data_stream(&self) -> broadcast::Receiver<String> {
        self.serial_data.subscribe()
    }

    /// Every typed event decoded from the channel.
    pub fn event_stream(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Non-fatal notices and transport errors.
    pub fn error_stream(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }
}

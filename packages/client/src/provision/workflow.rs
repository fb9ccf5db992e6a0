//! Board provisioning workflow
//!
//! Chains sketch upload, serial monitor open, the CSR dialog, the external
//! registration call, and certificate storage into one cancellable sequence.
//! Progress and the single terminal outcome are published on the
//! `configuring` state channel; any step failure short-circuits with
//! step-specific context.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::daemon::{AgentDaemon, ChannelStatus};
use crate::agent::upload::{UploadData, UploadFile, UploadOptions, UploadState, UploadTarget};
use crate::connection::protocol::FlagValue;
use crate::error::ProvisioningError;
use crate::provision::registry::{CompressedCertificate, DeviceRegistry};
use crate::provision::sketch::{provisioning_sketch, PROVISIONING_BAUDRATE};
use crate::state::StateChannel;

/// The sketch keeps using the port briefly after the dialog ends; the
/// monitor is closed only after this grace period.
const TEARDOWN_GRACE: Duration = Duration::from_secs(3);

const NO_CHIP_MARKER: &str = "No ECCX08 present";
const LOCK_FAILED_MARKER: &str = "Locking ECCX08 configuration failed!";
const WRITE_CONFIG_FAILED_MARKER: &str = "Writing ECCX08 configuration failed";
const CSR_FAILED_MARKER: &str = "Error generating CSR!";
const GENERIC_ERROR_MARKER: &str = "Error";
const NEW_KEY_PROMPT: &str = "Would you like to generate a new private key and CSR (y/N):";
const UNLOCK_PROMPT: &str = "Your ECCX08 is unlocked, would you like to lock it (y/N):";
const CSR_BEGIN: &str = "-----BEGIN CERTIFICATE REQUEST-----";
const CSR_END: &str = "-----END CERTIFICATE REQUEST-----";
const CERT_STORED_MARKER: &str = "Compressed cert";

const PROMPT_ANSWER: &str = "y\n";

/// Configuration lifecycle. `Done` and `Error` are mutually exclusive and
/// single-fire for one `configure()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureState {
    Idle,
    InProgress(String),
    Done,
    Error { err: String, msg: String },
}

/// A board to provision.
#[derive(Debug, Clone)]
pub struct ProvisionBoard {
    pub fqbn: String,
    pub port: String,
    /// Device id assigned by the registration backend.
    pub device_id: String,
    pub upload: BoardUploadSpec,
}

/// Board-specific upload parameters for the provisioning sketch.
#[derive(Debug, Clone)]
pub struct BoardUploadSpec {
    /// Image extension, e.g. ".bin".
    pub ext: String,
    pub commandline: String,
    pub signature: String,
    pub wait_for_upload_port: bool,
    pub use_1200bps_touch: bool,
}

/// One step of the serial CSR dialog.
#[derive(Debug)]
enum DialogStep {
    Pending,
    /// A confirmation prompt was consumed; answer `y` and keep listening.
    Answer,
    Csr(String),
    Rejected(ProvisioningError),
}

/// Advance the CSR dialog with one inbound chunk. The buffer accumulates
/// across chunks and is cleared whenever a prompt is consumed, so chunked
/// and single-shot delivery extract the identical CSR.
fn scan_csr_dialog(buffer: &mut String, chunk: &str) -> DialogStep {
    buffer.push_str(chunk);

    if buffer.contains(NO_CHIP_MARKER) {
        return DialogStep::Rejected(ProvisioningError::CryptoChipMissing);
    }
    if buffer.contains(LOCK_FAILED_MARKER) || buffer.contains(WRITE_CONFIG_FAILED_MARKER) {
        return DialogStep::Rejected(ProvisioningError::AlreadyConfigured);
    }
    if buffer.contains(CSR_FAILED_MARKER) {
        return DialogStep::Rejected(ProvisioningError::CsrGeneration);
    }
    if buffer.contains(GENERIC_ERROR_MARKER) {
        return DialogStep::Rejected(ProvisioningError::SerialDialog(chunk.to_string()));
    }
    if buffer.contains(NEW_KEY_PROMPT) || buffer.contains(UNLOCK_PROMPT) {
        buffer.clear();
        return DialogStep::Answer;
    }
    if let (Some(begin), Some(end)) = (buffer.find(CSR_BEGIN), buffer.find(CSR_END)) {
        // Inclusive of both delimiters.
        return DialogStep::Csr(buffer[begin..end + CSR_END.len()].to_string());
    }
    DialogStep::Pending
}

#[derive(Debug)]
enum StoreStep {
    Pending,
    Stored,
    Rejected(String),
}

fn scan_store_dialog(buffer: &mut String, chunk: &str) -> StoreStep {
    buffer.push_str(chunk);
    if buffer.contains(CERT_STORED_MARKER) {
        return StoreStep::Stored;
    }
    if buffer.contains(GENERIC_ERROR_MARKER) {
        return StoreStep::Rejected(chunk.to_string());
    }
    StoreStep::Pending
}

/// The ordered plaintext answer sequence the storage dialog expects:
/// device id, not-before year / month (1-based) / day / hour, the year
/// difference to not-after, serial, signature, each newline-terminated.
fn certificate_answers(
    cert: &CompressedCertificate,
    device_id: &str,
) -> Result<String, ProvisioningError> {
    let not_before = parse_utc(&cert.not_before)?;
    let not_after = parse_utc(&cert.not_after)?;
    Ok(format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        device_id,
        not_before.year(),
        not_before.month(),
        not_before.day(),
        not_before.hour(),
        not_after.year() - not_before.year(),
        cert.serial,
        cert.signature
    ))
}

fn parse_utc(value: &str) -> Result<DateTime<Utc>, ProvisioningError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProvisioningError::InvalidCertificate(format!("{}: {}", value, e)))
}

/// Drives board provisioning on top of an [`AgentDaemon`].
pub struct BoardProvisioner {
    daemon: Arc<AgentDaemon>,
    pub configuring: StateChannel<ConfigureState>,
    /// Everything the serial monitor has said since the last configuration
    /// attempt started.
    transcript: Arc<Mutex<String>>,
    mirror: JoinHandle<()>,
}

impl BoardProvisioner {
    pub fn new(daemon: Arc<AgentDaemon>) -> Self {
        let transcript = Arc::new(Mutex::new(String::new()));
        let mirror = {
            let transcript = Arc::clone(&transcript);
            let mut serial = daemon.serial_data_stream();
            tokio::spawn(async move {
                loop {
                    match serial.recv().await {
                        Ok(chunk) => transcript.lock().push_str(&chunk),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        Self {
            daemon,
            configuring: StateChannel::new(ConfigureState::Idle),
            transcript,
            mirror,
        }
    }

    /// Announce that a configuration attempt is being prepared.
    pub fn begin(&self) {
        self.configuring.set(ConfigureState::InProgress(
            "Starting board configuration...".to_string(),
        ));
    }

    /// The accumulated serial transcript of the current attempt.
    pub fn transcript(&self) -> String {
        self.transcript.lock().clone()
    }

    /// Run the full provisioning sequence for `board`. Every transition is
    /// published on `configuring`; the first terminal outcome wins and the
    /// other branch's watcher is torn down.
    pub async fn configure(
        &self,
        board: &ProvisionBoard,
        registry: &dyn DeviceRegistry,
    ) -> Result<(), ProvisioningError> {
        self.configuring.set(ConfigureState::InProgress(
            "Uploading provisioning sketch...".to_string(),
        ));

        if self.daemon.channel_status.get() != ChannelStatus::Open {
            let err = ProvisioningError::ChannelNotOpen;
            self.fail(
                &err,
                format!(
                    "Couldn't configure board at port {}: there is no open channel to the agent.",
                    board.port
                ),
            );
            return Err(err);
        }

        self.transcript.lock().clear();

        if self.daemon.uploading.get().in_progress() {
            let err = ProvisioningError::UploadInProgress;
            self.fail(
                &err,
                format!(
                    "Couldn't configure board at port {}. There is already an upload in progress.",
                    board.port
                ),
            );
            return Err(err);
        }

        // Release any previous terminal upload state, then stand up both
        // outcome listeners before the upload goes out so a fast completion
        // cannot be missed.
        self.daemon.init_upload();
        let uploads = self.daemon.uploading.clone();
        let mut done = tokio::spawn({
            let uploads = uploads.clone();
            async move {
                uploads
                    .wait_for(|s| matches!(s, UploadState::Done(_)))
                    .await;
            }
        });
        let mut failed = tokio::spawn({
            let uploads = uploads.clone();
            async move {
                match uploads
                    .wait_for(|s| matches!(s, UploadState::Error(_)))
                    .await
                {
                    UploadState::Error(err) => err,
                    _ => String::new(),
                }
            }
        });

        let sketch = provisioning_sketch(&board.fqbn);
        debug!(fqbn = %sketch.fqbn, "uploading provisioning sketch");
        let target = UploadTarget {
            board: board.fqbn.clone(),
            port: board.port.clone(),
            ..Default::default()
        };
        let data = UploadData {
            files: vec![UploadFile {
                name: format!("{}{}", sketch.name, board.upload.ext),
                data: sketch.encoded.clone(),
            }],
            commandline: board.upload.commandline.clone(),
            signature: board.upload.signature.clone(),
            extrafiles: Vec::new(),
            options: UploadOptions {
                wait_for_upload_port: Some(FlagValue::Bool(board.upload.wait_for_upload_port)),
                use_1200bps_touch: Some(FlagValue::Bool(board.upload.use_1200bps_touch)),
                params_verbose: Some("-v".to_string()),
                ..Default::default()
            },
        };
        // Failures surface through the state listeners below either way.
        let _ = self.daemon.upload(&target, &data).await;

        let upload_error = tokio::select! {
            _ = &mut done => {
                failed.abort();
                None
            }
            res = &mut failed => {
                done.abort();
                Some(res.unwrap_or_default())
            }
        };
        if let Some(err_text) = upload_error {
            let err = ProvisioningError::UploadFailed(err_text.clone());
            self.fail(
                &err,
                format!(
                    "Couldn't configure board at port {}. Upload failed with error: {}",
                    board.port, err_text
                ),
            );
            return Err(err);
        }

        self.configuring.set(ConfigureState::InProgress(
            "Provisioning sketch uploaded successfully. Opening serial monitor...".to_string(),
        ));
        if let Err(serial_err) = self
            .daemon
            .open_serial_monitor(&board.port, PROVISIONING_BAUDRATE)
            .await
        {
            let err = ProvisioningError::Serial(serial_err);
            self.fail(
                &err,
                format!(
                    "Couldn't configure board at port {}. Configuration failed with error: {}",
                    board.port, err
                ),
            );
            return Err(err);
        }

        self.configuring.set(ConfigureState::InProgress(
            "Serial monitor opened. Generating CSR...".to_string(),
        ));
        let outcome = self.run_dialog(board, registry).await;
        match &outcome {
            Ok(()) => {
                info!(port = %board.port, "board configured");
                self.configuring.set(ConfigureState::Done);
            }
            Err(err) => self.fail(
                err,
                format!(
                    "Couldn't configure board at port {}. Configuration failed with error: {}",
                    board.port, err
                ),
            ),
        }

        // The sketch needs a moment to finish with the port before the
        // monitor goes down.
        tokio::time::sleep(TEARDOWN_GRACE).await;
        let _ = self.daemon.close_serial_monitor(&board.port).await;
        outcome
    }

    async fn run_dialog(
        &self,
        board: &ProvisionBoard,
        registry: &dyn DeviceRegistry,
    ) -> Result<(), ProvisioningError> {
        let csr = self.acquire_csr(&board.port).await?;
        self.configuring.set(ConfigureState::InProgress(
            "CSR generated. Creating device...".to_string(),
        ));
        let device = registry.register_device(&csr).await?;
        self.configuring.set(ConfigureState::InProgress(
            "Device created. Storing certificate...".to_string(),
        ));
        self.store_certificate(&device.compressed, board).await
    }

    /// Run the CSR dialog: answer the confirmation prompts and collect the
    /// delimited request. The serial subscription is dropped on settlement.
    async fn acquire_csr(&self, port: &str) -> Result<String, ProvisioningError> {
        let mut serial = self.daemon.serial_data_stream();
        let mut buffer = String::new();
        loop {
            let chunk = match serial.recv().await {
                Ok(chunk) => chunk,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProvisioningError::SerialStreamEnded)
                }
            };
            match scan_csr_dialog(&mut buffer, &chunk) {
                DialogStep::Pending => {}
                DialogStep::Answer => {
                    self.daemon.write_serial(port, PROMPT_ANSWER).await?;
                }
                DialogStep::Csr(csr) => return Ok(csr),
                DialogStep::Rejected(err) => return Err(err),
            }
        }
    }

    /// Feed the certificate answers to the sketch and wait for the stored
    /// confirmation.
    async fn store_certificate(
        &self,
        cert: &CompressedCertificate,
        board: &ProvisionBoard,
    ) -> Result<(), ProvisioningError> {
        // Subscribe before writing so the confirmation cannot race the
        // answers.
        let mut serial = self.daemon.serial_data_stream();
        let answers = certificate_answers(cert, &board.device_id)?;
        self.daemon.write_serial(&board.port, &answers).await?;

        let mut buffer = String::new();
        loop {
            let chunk = match serial.recv().await {
                Ok(chunk) => chunk,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProvisioningError::SerialStreamEnded)
                }
            };
            match scan_store_dialog(&mut buffer, &chunk) {
                StoreStep::Pending => {}
                StoreStep::Stored => return Ok(()),
                StoreStep::Rejected(text) => {
                    return Err(ProvisioningError::CertificateStore(text))
                }
            }
        }
    }

    fn fail(&self, err: &ProvisioningError, msg: String) {
        self.configuring.set(ConfigureState::Error {
            err: err.to_string(),
            msg,
        });
    }
}

impl Drop for BoardProvisioner {
    fn drop(&mut self) {
        self.mirror.abort();
    }
}

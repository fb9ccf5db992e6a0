//! Upload coordination
//!
//! Translates agent programmer-status frames into the upload lifecycle and
//! builds the `/upload` request body. The state machine only ever moves
//! Idle → InProgress → Done/Error; Done and Error are terminal until the
//! next explicit upload initiation.

use std::time::Duration;

use crate::connection::protocol::{
    AuthOptions, ExtraFile, ExtraOptions, FlagValue, ProgrammerReport, UploadPayload,
};
use crate::state::StateChannel;

/// After a successful flash the port re-enumerates; Done is delayed this
/// long so callers do not touch the port while it is down.
pub(crate) const UPLOAD_SETTLE_DELAY: Duration = Duration::from_secs(5);

const TERMINATED_BY_USER: &str = "terminated by user";

/// Upload lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    InProgress(Option<String>),
    Done(String),
    Error(String),
}

impl UploadState {
    pub fn in_progress(&self) -> bool {
        matches!(self, UploadState::InProgress(_))
    }
}

/// Apply one programmer-status frame to the upload state.
pub(crate) fn apply_programmer_status(state: &StateChannel<UploadState>, report: &ProgrammerReport) {
    if report.flash.as_deref() == Some("Ok") && report.status == "Done" {
        let state = state.clone();
        let msg = report.flash.clone().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(UPLOAD_SETTLE_DELAY).await;
            state.set(UploadState::Done(msg));
        });
        return;
    }
    match report.status.as_str() {
        "Starting" => state.set(UploadState::InProgress(Some(format!(
            "Programming with: {}",
            report.cmd.clone().unwrap_or_default()
        )))),
        "Busy" => state.set(UploadState::InProgress(report.msg.clone())),
        "Error" | "Error 404 Not Found" => {
            state.set(UploadState::Error(report.msg.clone().unwrap_or_default()))
        }
        "Killed" => {
            state.set(UploadState::InProgress(Some(TERMINATED_BY_USER.to_string())));
            state.set(UploadState::Error(TERMINATED_BY_USER.to_string()));
        }
        _ => state.set(UploadState::InProgress(report.msg.clone())),
    }
}

/// A flashing target. `network` targets are uploaded over the LAN and may
/// carry remote credentials; everything else goes through a serial port.
#[derive(Debug, Clone, Default)]
pub struct UploadTarget {
    pub board: String,
    pub port: String,
    pub network: bool,
    pub ssh: bool,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub auth_key: Option<String>,
    pub auth_port: Option<u16>,
}

/// One file of an upload; `data` is the base64-encoded content.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub wait_for_upload_port: Option<FlagValue>,
    pub use_1200bps_touch: Option<FlagValue>,
    pub params_verbose: Option<String>,
    pub params_quiet: Option<String>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadData {
    pub files: Vec<UploadFile>,
    pub commandline: String,
    pub signature: String,
    pub extrafiles: Vec<ExtraFile>,
    pub options: UploadOptions,
}

/// Build the `/upload` body: the first file is the primary image (name
/// trimmed to its basename), the rest travel as extra files.
///
/// Callers must have checked that `data.files` is non-empty.
pub(crate) fn build_upload_payload(target: &UploadTarget, data: &UploadData) -> UploadPayload {
    let main = &data.files[0];
    let filename = main
        .name
        .rsplit('/')
        .next()
        .unwrap_or(main.name.as_str())
        .to_string();

    let mut extrafiles = data.extrafiles.clone();
    extrafiles.extend(data.files.iter().skip(1).map(|f| ExtraFile {
        filename: f.name.clone(),
        hex: f.data.clone(),
    }));

    UploadPayload {
        board: target.board.clone(),
        port: target.port.clone(),
        commandline: data.commandline.clone(),
        signature: data.signature.clone(),
        hex: main.data.clone(),
        filename,
        extra: ExtraOptions {
            auth: AuthOptions {
                username: target.auth_user.clone(),
                password: target.auth_pass.clone(),
                private_key: target.auth_key.clone(),
                port: target.auth_port,
            },
            wait_for_upload_port: data
                .options
                .wait_for_upload_port
                .as_ref()
                .is_some_and(FlagValue::is_set),
            use_1200bps_touch: data
                .options
                .use_1200bps_touch
                .as_ref()
                .is_some_and(FlagValue::is_set),
            network: target.network,
            ssh: target.ssh,
            params_verbose: data.options.params_verbose.clone(),
            params_quiet: data.options.params_quiet.clone(),
            verbose: data.options.verbose,
        },
        extrafiles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn report(status: &str) -> ProgrammerReport {
        ProgrammerReport {
            status: status.to_string(),
            flash: None,
            msg: Some(format!("{} message", status)),
            cmd: None,
        }
    }

    #[tokio::test]
    async fn starting_and_busy_report_progress() {
        let state = StateChannel::new(UploadState::Idle);

        apply_programmer_status(
            &state,
            &ProgrammerReport {
                status: "Starting".into(),
                flash: None,
                msg: None,
                cmd: Some("bossac -i -d".into()),
            },
        );
        assert_eq!(
            state.get(),
            UploadState::InProgress(Some("Programming with: bossac -i -d".into()))
        );

        apply_programmer_status(&state, &report("Busy"));
        assert_eq!(
            state.get(),
            UploadState::InProgress(Some("Busy message".into()))
        );
    }

    #[tokio::test]
    async fn error_statuses_are_terminal() {
        let state = StateChannel::new(UploadState::Idle);
        apply_programmer_status(&state, &report("Error"));
        assert_eq!(state.get(), UploadState::Error("Error message".into()));

        let state = StateChannel::new(UploadState::Idle);
        apply_programmer_status(&state, &report("Error 404 Not Found"));
        assert_eq!(
            state.get(),
            UploadState::Error("Error 404 Not Found message".into())
        );
    }

    #[tokio::test]
    async fn unknown_status_reports_progress_with_the_message() {
        let state = StateChannel::new(UploadState::Idle);
        apply_programmer_status(&state, &report("Flashing"));
        assert_eq!(
            state.get(),
            UploadState::InProgress(Some("Flashing message".into()))
        );
    }

    #[tokio::test]
    async fn killed_emits_progress_then_error_in_order() {
        let state = StateChannel::new(UploadState::Idle);
        let mut rx = state.subscribe();

        apply_programmer_status(&state, &report("Killed"));

        assert_eq!(
            rx.recv().await.unwrap(),
            UploadState::InProgress(Some("terminated by user".into()))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            UploadState::Error("terminated by user".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flash_success_settles_before_exactly_one_done() {
        let state = StateChannel::new(UploadState::InProgress(None));
        let mut rx = state.subscribe();
        let started = Instant::now();

        apply_programmer_status(
            &state,
            &ProgrammerReport {
                status: "Done".into(),
                flash: Some("Ok".into()),
                msg: None,
                cmd: None,
            },
        );

        // Nothing emitted synchronously; the settle timer is still running.
        assert!(state.get().in_progress());

        let done = rx.recv().await.unwrap();
        assert_eq!(done, UploadState::Done("Ok".into()));
        assert!(started.elapsed() >= UPLOAD_SETTLE_DELAY);

        // Exactly one Done: no further emissions are pending.
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn payload_trims_the_primary_filename_and_carries_extras() {
        let target = UploadTarget {
            board: "samd:mkr1000".into(),
            port: "/dev/ttyACM0".into(),
            ..Default::default()
        };
        let data = UploadData {
            files: vec![
                UploadFile {
                    name: "build/out/sketch.bin".into(),
                    data: "QUFBQQ==".into(),
                },
                UploadFile {
                    name: "sketch.map".into(),
                    data: "QkJCQg==".into(),
                },
            ],
            commandline: "bossac -p {port}".into(),
            signature: "sig".into(),
            extrafiles: vec![],
            options: UploadOptions {
                wait_for_upload_port: Some(FlagValue::Text("true".into())),
                use_1200bps_touch: Some(FlagValue::Bool(false)),
                ..Default::default()
            },
        };

        let payload = build_upload_payload(&target, &data);
        assert_eq!(payload.filename, "sketch.bin");
        assert_eq!(payload.hex, "QUFBQQ==");
        assert_eq!(payload.extrafiles.len(), 1);
        assert_eq!(payload.extrafiles[0].filename, "sketch.map");
        assert!(payload.extra.wait_for_upload_port);
        assert!(!payload.extra.use_1200bps_touch);
        assert!(!payload.extra.network);
    }
}

//! `boardlink upload`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use boardlink_client::{FlagValue, UploadData, UploadFile, UploadOptions, UploadState, UploadTarget};
use colored::Colorize;
use indicatif::ProgressBar;

use crate::config::Config;

pub async fn run(
    config: &Config,
    board: String,
    port: String,
    commandline: String,
    signature: String,
    files: Vec<PathBuf>,
) -> Result<()> {
    let daemon = super::connect(config).await?;

    let mut upload_files = Vec::new();
    for path in &files {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        upload_files.push(UploadFile {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            data: STANDARD.encode(raw),
        });
    }

    let target = UploadTarget {
        board,
        port,
        ..Default::default()
    };
    let data = UploadData {
        files: upload_files,
        commandline,
        signature,
        extrafiles: Vec::new(),
        options: UploadOptions {
            wait_for_upload_port: Some(FlagValue::Bool(true)),
            use_1200bps_touch: Some(FlagValue::Bool(true)),
            params_verbose: Some("-v".to_string()),
            ..Default::default()
        },
    };

    daemon.init_upload();
    let mut states = daemon.uploading.subscribe();
    daemon.upload(&target, &data).await?;

    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(120));
    loop {
        match states.recv().await? {
            UploadState::Idle => {}
            UploadState::InProgress(msg) => {
                if let Some(msg) = msg {
                    bar.set_message(msg);
                }
            }
            UploadState::Done(msg) => {
                bar.finish_and_clear();
                println!("{} {}", "Upload complete:".green().bold(), msg);
                break;
            }
            UploadState::Error(err) => {
                bar.finish_and_clear();
                bail!("upload failed: {}", err);
            }
        }
    }
    Ok(())
}

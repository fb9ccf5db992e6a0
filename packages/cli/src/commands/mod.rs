//! CLI subcommands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boardlink_client::{AgentDaemon, ChannelStatus};
use indicatif::ProgressBar;

use crate::config::Config;

pub mod discover;
pub mod list;
pub mod monitor;
pub mod provision;
pub mod upload;

/// Start a daemon and wait until the channel to the agent is open.
/// Discovery is unbounded by design; ctrl-c is the way out when no agent is
/// running.
pub(crate) async fn connect(config: &Config) -> Result<Arc<AgentDaemon>> {
    let daemon = AgentDaemon::new(config.daemon_config());
    {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run().await });
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_message("Looking for the BoardLink agent...");
    spinner.enable_steady_tick(Duration::from_millis(120));
    daemon
        .channel_status
        .wait_for(|s| *s == ChannelStatus::Open)
        .await;
    spinner.finish_and_clear();

    Ok(daemon)
}

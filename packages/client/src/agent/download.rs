//! Tool-download coordination
//!
//! Downloads are requested over the channel (`downloadtool ...`) and their
//! lifecycle arrives back as download-status frames.

use crate::state::StateChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    InProgress(Option<String>),
    Done(String),
    Error(String),
}

/// Apply one download-status frame to the download state. Anything the agent
/// reports besides the three known statuses counts as progress.
pub(crate) fn apply_download_status(
    state: &StateChannel<DownloadState>,
    status: &str,
    msg: Option<String>,
) {
    match status {
        "Pending" => state.set(DownloadState::InProgress(msg)),
        "Success" => state.set(DownloadState::Done(msg.unwrap_or_default())),
        "Error" => state.set(DownloadState::Error(msg.unwrap_or_default())),
        _ => state.set(DownloadState::InProgress(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_download_lifecycle() {
        let state = StateChannel::new(DownloadState::Idle);

        apply_download_status(&state, "Pending", Some("fetching".into()));
        assert_eq!(state.get(), DownloadState::InProgress(Some("fetching".into())));

        apply_download_status(&state, "Unpacking", Some("34%".into()));
        assert_eq!(state.get(), DownloadState::InProgress(Some("34%".into())));

        apply_download_status(&state, "Success", Some("bossac 1.7.0".into()));
        assert_eq!(state.get(), DownloadState::Done("bossac 1.7.0".into()));

        apply_download_status(&state, "Error", Some("no such tool".into()));
        assert_eq!(state.get(), DownloadState::Error("no such tool".into()));
    }
}

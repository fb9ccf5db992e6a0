//! Serial monitor state
//!
//! From this crate's perspective a port is either fully open or fully
//! closed; a failed open or close attempt surfaces as a one-shot `Failed`
//! emission on the same stream before the state settles back.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialMonitorState {
    Closed,
    Open,
    /// A failed open/close handshake, carrying the failure text.
    Failed(String),
}

impl SerialMonitorState {
    pub fn is_open(&self) -> bool {
        matches!(self, SerialMonitorState::Open)
    }
}

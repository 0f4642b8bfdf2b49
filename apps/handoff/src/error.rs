use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

/// Failure of a single transfer attempt. None of these are fatal to the
/// process; the attempt can always be restarted from `Idle`.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("malformed handshake payload: {0}")]
    MalformedPayload(String),
    #[error("platform negotiation failure: {0}")]
    PlatformNegotiationFailure(String),
    #[error("bootstrap timed out after {0:?}")]
    BootstrapTimeout(Duration),
    #[error("channel is not open")]
    ChannelNotReady,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame received after transfer completed")]
    UnexpectedFrameAfterCompletion,
    #[error("cancelled by user")]
    UserCancelled,
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },
    #[error("failed to render optical code: {0}")]
    Render(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandoffError {
    /// Frame-level corruption is dropped locally; everything else ends the attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HandoffError::MalformedFrame(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            HandoffError::MalformedPayload(_) => {
                "The scanned code is not a valid connection code. Scan it again.".into()
            }
            HandoffError::PlatformNegotiationFailure(reason) => {
                format!("The devices could not negotiate a connection ({reason}).")
            }
            HandoffError::BootstrapTimeout(after) => format!(
                "Connection setup did not finish within {}s.",
                after.as_secs()
            ),
            HandoffError::ChannelNotReady => "There is no active connection.".into(),
            HandoffError::MalformedFrame(_) => "A damaged message was skipped.".into(),
            HandoffError::UnexpectedFrameAfterCompletion => {
                "The other device kept sending after the transfer finished.".into()
            }
            HandoffError::UserCancelled => "The transfer was cancelled.".into(),
            HandoffError::InvalidState { .. } => {
                "That step is not available right now.".into()
            }
            HandoffError::Render(_) => "The connection code could not be displayed.".into(),
            HandoffError::Io(err) => format!("Could not save the received file: {err}"),
        }
    }
}

impl From<TransportError> for HandoffError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Setup(reason) => HandoffError::PlatformNegotiationFailure(reason),
            TransportError::ChannelClosed => HandoffError::ChannelNotReady,
            TransportError::Timeout(after) => HandoffError::BootstrapTimeout(after),
        }
    }
}

use crate::window::WinId;

/// Errors surfaced by the RMA engine.
///
/// Protocol violations, payload mismatches and codec failures are fatal (see [RmaError::is_fatal]).
/// A `TargetFailed` error only poisons the (window, rank) pair it was raised for.
#[derive(Debug, Clone, PartialEq)]
pub enum RmaError {
    /// A synchronization or operation call was made while the target was in an incompatible state
    InvalidState {
        rank: Option<usize>,
        reason: &'static str,
    },
    /// The origin, target or result description of an operation is malformed
    InvalidArgument(String),
    UnknownWindow(WinId),
    /// Both the window and the global pool are exhausted
    OutOfResources(&'static str),
    /// The transport reported a send failure or connection loss for this rank
    TargetFailed { rank: usize, reason: String },
    /// More (or less) payload arrived than the packet header declared
    PayloadMismatch { expected: usize, received: usize },
    Codec(String),
}

impl RmaError {
    pub(crate) fn invalid_state(rank: usize, reason: &'static str) -> RmaError {
        RmaError::InvalidState {
            rank: Some(rank),
            reason,
        }
    }

    pub(crate) fn internal(reason: &'static str) -> RmaError {
        RmaError::InvalidState { rank: None, reason }
    }

    /// Returns true if the error indicates a protocol bug or wire corruption rather than a per-target failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RmaError::InvalidState { .. } | RmaError::PayloadMismatch { .. } | RmaError::Codec(_)
        )
    }
}

impl std::fmt::Display for RmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RmaError::InvalidState {
                rank: Some(rank),
                reason,
            } => write!(f, "invalid state for target {}: {}", rank, reason),
            RmaError::InvalidState { rank: None, reason } => {
                write!(f, "invalid state: {}", reason)
            }
            RmaError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            RmaError::UnknownWindow(win) => write!(f, "window {} is not registered", win),
            RmaError::OutOfResources(what) => {
                write!(f, "no free {} records in the window or global pool", what)
            }
            RmaError::TargetFailed { rank, reason } => {
                write!(f, "target {} failed: {}", rank, reason)
            }
            RmaError::PayloadMismatch { expected, received } => write!(
                f,
                "payload mismatch: expected {} bytes but received {}",
                expected, received
            ),
            RmaError::Codec(msg) => write!(f, "wire codec error: {}", msg),
        }
    }
}

impl std::error::Error for RmaError {}

impl From<anyhow::Error> for RmaError {
    fn from(err: anyhow::Error) -> Self {
        RmaError::Codec(err.to_string())
    }
}

pub type RmaResult<T> = Result<T, RmaError>;

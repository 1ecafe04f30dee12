//! Error taxonomy shared by every stage of the camera-to-texture bridge

use std::time::Duration;

use crate::lifecycle::StreamState;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the capture, conversion and lifecycle layers.
///
/// Capture-thread failures never cross into host render-loop calls; they are
/// marshaled to the lifecycle controller as [`crate::capture::SourceEvent`]s.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The host has not granted camera access. The caller may re-request and retry.
    #[error("camera permission denied")]
    PermissionDenied,

    /// Camera busy, absent or disconnected. Retry after a delay.
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Format negotiation or conversion failed. Fatal to the session.
    #[error("unsupported frame format: {0}")]
    FormatUnsupported(String),

    /// Transient sequence gap. Only counted, never propagated to the host.
    #[error("frame dropped: expected sequence {expected}, got {got}")]
    FrameDropped { expected: u64, got: u64 },

    /// `stop()` exceeded its drain budget and force-released resources.
    #[error("teardown exceeded drain budget of {0:?}; resources force-released")]
    ForcedTeardownTimeout(Duration),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: StreamState },

    #[error("texture backend error: {0}")]
    Texture(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the host may retry `start()` after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::PermissionDenied
                | BridgeError::DeviceUnavailable(_)
                | BridgeError::FrameDropped { .. }
                | BridgeError::ForcedTeardownTimeout(_)
        )
    }

    /// Whether this error ends the running session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            BridgeError::DeviceUnavailable(_) | BridgeError::FormatUnsupported(_)
        )
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

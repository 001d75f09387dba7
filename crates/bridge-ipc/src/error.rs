//! Error types for bridge IPC.
//!
//! Every failure a host or client can hit maps onto one variant here. Peer
//! and transport conditions are returned, never raised as panics, so callers
//! can fall back to a degraded mode when the other process is gone.

use thiserror::Error;

/// Main error type for the bridge IPC library.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Another instance already owns the endpoint address.
    #[error("Address already in use: {address}")]
    AddressInUse { address: String },

    /// The peer is not listening, or went away mid-call.
    #[error("Peer {tag} unavailable: {reason}")]
    PeerUnavailable { tag: String, reason: String },

    /// Buffered bytes did not form a well-formed message.
    #[error("Protocol decode failure: {message}")]
    Decode { message: String },

    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A second call was issued while one is still awaiting acknowledgment.
    #[error("Call to {requested} issued while {pending} is still in flight")]
    CallInFlight { pending: String, requested: String },

    #[error("A wait on this event is already outstanding")]
    OverlappingWait,

    /// A call carries a value the wire format cannot represent.
    #[error("Cannot encode {operation}: {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("Connection is closed")]
    Closed,
}

/// Result type alias for bridge IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IpcError {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        IpcError::Decode {
            message: message.into(),
        }
    }

    pub(crate) fn peer_unavailable(tag: &str, reason: impl std::fmt::Display) -> Self {
        IpcError::PeerUnavailable {
            tag: tag.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the caller should proceed as if the peer isn't listening.
    pub fn is_peer_unavailable(&self) -> bool {
        matches!(self, IpcError::PeerUnavailable { .. } | IpcError::Closed)
    }

    /// True when a host failed to start because another instance runs.
    pub fn is_already_running(&self) -> bool {
        matches!(self, IpcError::AddressInUse { .. })
    }

    /// True for caller mistakes that are rejected at the call site.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            IpcError::CallInFlight { .. }
                | IpcError::OverlappingWait
                | IpcError::InvalidArgument { .. }
        )
    }
}

//! # Domain Errors
//!
//! Error types for the retrieval core, one enum per concern.
//!
//! Only [`RetrieveError`] crosses the boundary to ODR callers. Dispatch and
//! transport errors are transient and are absorbed by the retrieve manager.

use thiserror::Error;

use super::value_objects::{NodeId, ServerAddr};

/// Peer registry usage errors. Surfaced immediately, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A peer with the same node id is already registered.
    #[error("Peer {0} is already registered")]
    DuplicateIdentity(NodeId),

    /// No peer with this node id is registered.
    #[error("Peer {0} is not registered")]
    NotFound(NodeId),
}

/// Transient dispatch failures reported by the request distributor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No connected, capable, non-excluded peer has a free slot.
    #[error("No peer available")]
    NoPeerAvailable,

    /// The chosen peer refused the send. Its slot has already been released.
    #[error("Send to peer {peer} failed: {reason}")]
    SendFailed {
        /// Peer the send was attempted on
        peer: NodeId,
        /// Server address of that peer
        address: ServerAddr,
        /// Transport-level reason
        reason: String,
    },
}

/// Terminal outcome errors delivered to retrieval callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrieveError {
    /// Retry budget or overall deadline exhausted without a valid response.
    #[error("Retrieval exhausted after {attempts} attempts")]
    Exhausted {
        /// Dispatch attempts made
        attempts: u32,
    },

    /// The caller (or every caller) canceled the request.
    #[error("Retrieval canceled")]
    Canceled,

    /// The caller's own wait bound elapsed before resolution.
    #[error("Retrieval timed out")]
    Timeout,

    /// The request was malformed before it ever reached a peer.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The retrieval layer has been stopped.
    #[error("Retrieval layer stopped")]
    Stopped,
}

impl RetrieveError {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            RetrieveError::Exhausted { .. } => "exhausted",
            RetrieveError::Canceled => "canceled",
            RetrieveError::Timeout => "timeout",
            RetrieveError::MalformedRequest(_) => "malformed",
            RetrieveError::Stopped => "stopped",
        }
    }
}

/// Peer transport errors returned by [`crate::ports::PeerConnection::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is already closed.
    #[error("Peer disconnected")]
    Disconnected,

    /// The peer refused the message (flow control, queue full).
    #[error("Peer rejected message: {0}")]
    Rejected(String),

    /// Underlying I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Server pool persistence errors.
#[derive(Debug, Error)]
pub enum ServerPoolError {
    /// Reading or writing the backing file failed.
    #[error("Server pool storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted records could not be decoded or encoded.
    #[error("Server pool codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why the value is rejected
        reason: String,
    },
}

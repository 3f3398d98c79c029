//! Error types for the relay core.
//!
//! Delivery-path failures are never errors: they are recorded and surfaced as
//! result values (`false`, zero summaries, `Failed` envelopes). Only creation
//! failures, validation failures and storage failures travel through
//! [`MeshError`].

use thiserror::Error;

/// Errors raised by the crypto collaborator.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("invalid mesh key: {0}")]
    InvalidKey(String),
}

/// Errors raised by a transport when a send does not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {peer_id} unreachable")]
    Unreachable { peer_id: String },

    #[error("send to {peer_id} timed out after {timeout_ms} ms")]
    Timeout { peer_id: String, timeout_ms: u64 },
}

/// Errors surfaced to callers of the core.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Sealing or signing failed; the message was not enqueued.
    #[error("message creation failed: {0}")]
    Creation(#[from] CryptoError),

    /// The request was rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result type for core operations.
pub type MeshResult<T> = Result<T, MeshError>;

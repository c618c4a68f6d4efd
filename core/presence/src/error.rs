//! Error types for the presence core.
//!
//! Configuration problems are terminal until the user reconfigures;
//! discovery and transport problems are transient and owned by the
//! session's own retry machinery. Only the diagnostics surface
//! (`run_connection_test`) hands them to a caller directly.

use std::path::PathBuf;

use overtone_presence_wire::{EncodeError, ProtocolError};

/// All errors that can occur in presence operations.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No Discord client id configured")]
    MissingClientId,

    // ─────────────────────────────────────────────────────────────────────
    // Discovery & Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No reachable IPC socket (is the Discord client running?)")]
    RemoteUnavailable,

    #[error("Handshake rejected on {path}: {reason}")]
    HandshakeRejected { path: PathBuf, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Frame encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using PresenceError.
pub type Result<T> = std::result::Result<T, PresenceError>;

//! Error types for secs-transport.

use thiserror::Error;

use crate::session::{ConnectionState, Transition};

/// Main error type for all transport and session operations.
#[derive(Debug, Error)]
pub enum SecsError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or holds invalid values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framing error (invalid length, checksum, mixed system ids).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A state transition was fired from a state outside its source set.
    ///
    /// This is caller misuse, never a wire condition.
    #[error("Transition {transition} is not allowed from state {state}")]
    InvalidTransition {
        /// The transition that was fired.
        transition: Transition,
        /// The state the machine was in.
        state: ConnectionState,
    },

    /// Transition name that is not part of the transition table.
    #[error("Unknown transition: {0}")]
    UnknownTransition(String),

    /// Data messages require a selected session.
    #[error("Session is not selected")]
    NotSelected,

    /// The transport refused or failed to deliver the bytes.
    #[error("Send failed")]
    SendFailed,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No handler registered for the given stream/function.
    #[error("Handler not found for S{0}F{1}")]
    HandlerNotFound(u8, u8),

    /// Handler registration rejected.
    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),

    /// A peer with this name is already managed.
    #[error("Peer already exists: {0}")]
    DuplicatePeer(String),

    /// No peer with this name is managed.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Serial port error.
    #[cfg(feature = "serial")]
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

impl From<toml::de::Error> for SecsError {
    fn from(e: toml::de::Error) -> Self {
        SecsError::Config(e.to_string())
    }
}

/// Result type alias using SecsError.
pub type Result<T> = std::result::Result<T, SecsError>;

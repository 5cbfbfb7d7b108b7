//! Error types for the Vocals client.
//!
//! A single enum covers every failure the client can report. Values are
//! `Clone` because the same error is often both returned to the caller and
//! dispatched to registered error handlers.

use std::fmt;

use thiserror::Error;

/// Errors that can occur while using the client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VocalsError {
    /// Token fetch or refresh failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport open or write failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Operation requires an open transport
    #[error("Not connected")]
    NotConnected,

    /// Reconnection budget used up after a transport loss
    #[error("Connection lost after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Input or output device unavailable or failed mid-stream
    #[error("Audio device error: {0}")]
    Device(String),

    /// Operation invoked in a state that does not allow it
    #[error("Invalid state: {0}")]
    State(String),

    /// A registered event handler panicked
    #[error("Event handler failed: {0}")]
    Handler(String),

    /// Error frame sent by the streaming service
    #[error("Service error{}: {message}", code_suffix(.code))]
    Service {
        code: Option<String>,
        message: String,
    },

    /// Inbound frame could not be parsed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Segment payload could not be decoded
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

/// Coarse classification of a [`VocalsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Connection,
    Device,
    State,
    Handler,
    Service,
    Protocol,
    Decode,
    Config,
}

impl VocalsError {
    /// Classify the error without inspecting its message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VocalsError::Auth(_) => ErrorKind::Auth,
            VocalsError::Connection(_)
            | VocalsError::NotConnected
            | VocalsError::ReconnectExhausted { .. } => ErrorKind::Connection,
            VocalsError::Device(_) => ErrorKind::Device,
            VocalsError::State(_) => ErrorKind::State,
            VocalsError::Handler(_) => ErrorKind::Handler,
            VocalsError::Service { .. } => ErrorKind::Service,
            VocalsError::Protocol(_) => ErrorKind::Protocol,
            VocalsError::Decode(_) => ErrorKind::Decode,
            VocalsError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the error reflects a misuse of the API rather than a runtime condition.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, VocalsError::State(_) | VocalsError::Config(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Connection => "connection",
            ErrorKind::Device => "device",
            ErrorKind::State => "state",
            ErrorKind::Handler => "handler",
            ErrorKind::Service => "service",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Decode => "decode",
            ErrorKind::Config => "config",
        };
        write!(f, "{name}")
    }
}

/// Result type for client operations.
pub type VocalsResult<T> = Result<T, VocalsError>;

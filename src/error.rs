//! Error types for the WebSocket engine
//!
//! Every failure the engine can report falls into one of the categories of
//! [`ErrorKind`]. Fatal categories tear the connection down; `InvalidState`
//! and `Config` are local to the call that produced them.

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Transport reached end of stream without a closing handshake
    #[error("Connection closed by transport")]
    ConnectionClosed,
    /// Malformed frame or illegal frame sequence
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Frame larger than the configured maximum
    #[error("Frame too large")]
    FrameTooLarge,
    /// Reassembled message larger than the configured maximum
    #[error("Message too large")]
    MessageTooLarge,
    /// Malformed HTTP during the opening handshake
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Opening handshake rejected
    #[error("Handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Opening handshake did not finish before the deadline
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
    /// Peer certificate chain rejected
    #[error("TLS trust evaluation failed: {0}")]
    Trust(&'static str),
    /// Operation not legal in the current ready state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// Close code that may not be sent on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Caller supplied argument outside protocol limits
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Inconsistent configuration
    #[error("Invalid configuration: {0}")]
    Config(&'static str),
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame, illegal opcode sequence, invalid UTF-8, bad masking
    Protocol,
    /// Bad status, header mismatch, accept-key mismatch, timeout
    Handshake,
    /// Trust hook rejected or default trust failed
    Trust,
    /// Underlying stream failure
    Transport,
    /// Operation attempted in the wrong state, or with bad arguments
    InvalidState,
    /// Configuration rejected before opening
    Config,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ConnectionClosed => ErrorKind::Transport,
            Error::Protocol(_)
            | Error::InvalidUtf8
            | Error::FrameTooLarge
            | Error::MessageTooLarge => ErrorKind::Protocol,
            Error::InvalidHttp(_) | Error::HandshakeFailed(_) | Error::HandshakeTimeout(_) => {
                ErrorKind::Handshake
            }
            Error::Trust(_) => ErrorKind::Trust,
            Error::InvalidState(_) | Error::InvalidCloseCode(_) | Error::InvalidArgument(_) => {
                ErrorKind::InvalidState
            }
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error tears down the connection
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::InvalidState | ErrorKind::Config)
    }

    /// Close code reported when this error ends the connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::FrameTooLarge | Error::MessageTooLarge => CloseReason::TOO_BIG,
            Error::Protocol(_) | Error::InvalidUtf8 => CloseReason::PROTOCOL_ERROR,
            Error::Trust(_) => CloseReason::TLS_HANDSHAKE,
            _ => CloseReason::ABNORMAL,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;
    /// TLS handshake failure (never sent on the wire)
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Longest reason that fits a control frame after the 2-byte code
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if a received close code is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Check if a close code may be sent by this endpoint
    ///
    /// Same as [`is_valid_code`](Self::is_valid_code); 1005, 1006 and 1015
    /// are reserved for local reporting only.
    pub fn is_sendable_code(code: u16) -> bool {
        Self::is_valid_code(code)
    }
}

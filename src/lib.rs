//! # pocket-ws: symmetric RFC 6455 WebSocket engine
//!
//! One engine drives either end of a WebSocket connection over any
//! `AsyncRead + AsyncWrite` transport (TCP, TLS, in-memory pipes).
//!
//! ## Features
//!
//! - **Both roles**: client and server handshakes, masking direction enforced
//! - **Incremental framing**: frames decode from partial buffers, never block
//! - **Fragmentation**: messages reassemble with control frames interleaved
//! - **Closing handshake**: automatic echo, clean/unclean closure reporting
//! - **Ping/Pong**: automatic pong replies, per-ping completions
//! - **Byte counters**: overflow-aware totals of bytes on the wire
//! - **Trust hook**: override the transport's certificate decision
//!
//! ## Example
//!
//! ```ignore
//! use pocket_ws::{Config, Event, Message, WebSocket};
//!
//! let request = http::Request::builder()
//!     .uri("ws://localhost:9001/chat")
//!     .body(())?;
//! let stream = tokio::net::TcpStream::connect("localhost:9001").await?;
//!
//! let mut ws = WebSocket::client(stream, request, Config::default())?;
//! ws.open().await?;
//! ws.send(Message::text("hello"))?;
//!
//! while let Some(event) = ws.next_event().await {
//!     match event {
//!         Event::Message(msg) => println!("{msg:?}"),
//!         Event::Closed { code, .. } => println!("closed: {code}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::time::Duration;

pub mod assembler;
pub mod counter;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pipe;
pub mod protocol;
pub mod stream;
pub mod trust;
pub mod utf8;

pub use counter::ByteCount;
pub use error::{CloseReason, Error, ErrorKind, Result};
pub use frame::{Frame, OpCode};
pub use handshake::{HandshakeTimeout, is_websocket_request};
pub use protocol::{Event, Message, ReadyState, Role};
pub use stream::{WebSocket, WebSocketHandle};
pub use trust::{PeerTrust, TlsOptions, TlsVersion, TrustEvaluator, TrustHook};

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Small message threshold (< 126 bytes uses 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default opening handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for the peer's close frame
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for WebSocket connections
///
/// Immutable once handed to a connection; see [`WebSocket::reconfigure`] for
/// the pre-open escape hatch.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pocket_ws::Config;
///
/// let config = Config::builder()
///     .max_message_size(1024 * 1024)
///     .handshake_timeout(Duration::from_secs(10))
///     .protocol("chat")
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Opening handshake deadline (default: 60s)
    pub handshake_timeout: Duration,
    /// How long to wait for the peer's close frame (default: 5s)
    pub close_timeout: Duration,
    /// Bytes requested from the transport per read (default: 64KB)
    pub read_buffer_size: usize,
    /// Subprotocols, in preference order
    ///
    /// Clients offer these; servers accept the first one the client offers
    /// that appears here.
    pub protocols: Vec<String>,
    /// Origin header sent by clients
    pub origin: Option<String>,
    /// Options for the secured transport
    pub tls: TlsOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            read_buffer_size: RECV_BUFFER_SIZE,
            protocols: Vec::new(),
            origin: None,
            tls: TlsOptions::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be non-zero"));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be non-zero"));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake_timeout must be non-zero"));
        }
        if self
            .protocols
            .iter()
            .any(|p| p.is_empty() || p.contains(|c: char| c == ',' || c.is_whitespace()))
        {
            return Err(Error::Config("invalid subprotocol token"));
        }
        self.tls.validate()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the opening handshake deadline
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set how long to wait for the peer's close frame
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the per-read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Add a subprotocol
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.protocols.push(protocol.into());
        self
    }

    /// Replace the subprotocol list
    pub fn protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.config.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the client Origin header
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = Some(origin.into());
        self
    }

    /// Set TLS options
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = tls;
        self
    }

    /// Install a trust hook
    pub fn trust_hook(mut self, hook: impl TrustEvaluator) -> Self {
        self.config.tls.trust_hook = Some(TrustHook::new(hook));
        self
    }

    /// Consult the trust hook even when default evaluation succeeds
    pub fn strict_trust(mut self, strict: bool) -> Self {
        self.config.tls.strict_trust = strict;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::protocol::{Event, Message, ReadyState, Role};
    pub use crate::stream::{WebSocket, WebSocketHandle};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .max_frame_size(1024)
            .protocols(["chat", "superchat"])
            .origin("http://example.com")
            .strict_trust(true)
            .trust_hook(|_: &PeerTrust| true)
            .build();
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.protocols, vec!["chat", "superchat"]);
        assert!(config.tls.strict_trust);
        assert!(config.tls.trust_hook.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::builder().max_frame_size(0).build().validate().is_err());
        assert!(Config::builder().protocol("a b").build().validate().is_err());
        let tls = TlsOptions {
            min_version: Some(TlsVersion::Tls13),
            max_version: Some(TlsVersion::Tls10),
            ..Default::default()
        };
        assert!(matches!(
            Config::builder().tls(tls).build().validate(),
            Err(Error::Config(_))
        ));
    }
}

//! Protocol-level types shared by the connection layers
//!
//! - endpoint [`Role`] and connection [`ReadyState`]
//! - application [`Message`]s
//! - [`Event`] notifications handed to the caller
//! - [`PingTracker`] correlating pongs with outstanding pings

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

/// Connection lifecycle state
///
/// Transitions only ever move forward:
/// `Connecting -> Open -> Closing -> Closed`, with `Connecting -> Closed`
/// on a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    /// Opening handshake not yet finished
    Connecting = 0,
    /// Messages may be sent and received
    Open = 1,
    /// Closing handshake in progress
    Closing = 2,
    /// Transport torn down
    Closed = 3,
}

impl ReadyState {
    /// Decode from the `repr(u8)` value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_advance_to(self, next: ReadyState) -> bool {
        matches!(
            (self, next),
            (ReadyState::Connecting, ReadyState::Open)
                | (ReadyState::Connecting, ReadyState::Closing)
                | (ReadyState::Connecting, ReadyState::Closed)
                | (ReadyState::Open, ReadyState::Closing)
                | (ReadyState::Open, ReadyState::Closed)
                | (ReadyState::Closing, ReadyState::Closed)
        )
    }
}

/// Complete application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text
    Text(String),
    /// Arbitrary bytes
    Binary(Bytes),
}

impl Message {
    /// Create a text message
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(s.into())
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Get message as text (returns None for binary messages)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }

    /// Get message payload bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(s) => s.as_bytes(),
            Message::Binary(b) => b,
        }
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into payload bytes
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(s) => Bytes::from(s),
            Message::Binary(b) => b,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

impl From<&[u8]> for Message {
    fn from(b: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(b))
    }
}

/// Lifecycle notification delivered to the caller
#[derive(Debug)]
pub enum Event {
    /// Opening handshake finished
    Open {
        /// Negotiated subprotocol, if any
        protocol: Option<String>,
    },
    /// A complete message arrived
    Message(Message),
    /// The connection failed; always followed by [`Event::Closed`]
    Failed(Error),
    /// The connection is closed; always the last event
    Closed {
        /// Close code
        code: u16,
        /// Close reason text
        reason: String,
        /// Whether close frames were exchanged in both directions
        was_clean: bool,
    },
}

impl Event {
    /// Check if this is the terminal close notification
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Event::Closed { .. })
    }
}

/// Outstanding ping awaiting its pong
#[derive(Debug)]
pub struct PendingPing {
    payload: Bytes,
    completion: oneshot::Sender<Bytes>,
}

/// FIFO of outstanding pings
///
/// A pong resolves the oldest ping carrying the same payload. Pings whose
/// pong never arrives stay queued until the tracker is dropped, at which
/// point their receivers observe a closed channel.
#[derive(Debug, Default)]
pub struct PingTracker {
    pending: VecDeque<PendingPing>,
}

impl PingTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ping and get its completion
    pub fn register(&mut self, payload: Bytes) -> oneshot::Receiver<Bytes> {
        let (completion, rx) = oneshot::channel();
        self.pending.push_back(PendingPing {
            payload,
            completion,
        });
        rx
    }

    /// Resolve the oldest ping matching `payload`
    ///
    /// Returns `false` for unsolicited or non-matching pongs.
    pub fn resolve(&mut self, payload: &Bytes) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.payload == *payload) else {
            return false;
        };
        if let Some(ping) = self.pending.remove(index) {
            // Receiver may have been dropped; nothing to report then
            let _ = ping.completion.send(payload.clone());
        }
        true
    }

    /// Number of outstanding pings
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no pings are outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every outstanding ping
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

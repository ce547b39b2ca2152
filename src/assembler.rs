//! Message reassembly
//!
//! Turns decoded frames into complete messages and surfaces control frames
//! separately. Control frames may arrive between the fragments of a data
//! message without disturbing it; a new data message may not start until the
//! current one has seen its final fragment.

use bytes::{Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, OpCode};
use crate::protocol::Message;
use crate::utf8::validate_utf8;

/// Control frame surfaced to the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Ping with its payload
    Ping(Bytes),
    /// Pong with its payload
    Pong(Bytes),
    /// Close with optional code and reason
    Close(Option<CloseReason>),
}

/// Output of feeding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A data message is complete
    Message(Message),
    /// A control frame must be handled now
    Control(Control),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

/// Reassembles fragmented data frames
#[derive(Debug)]
pub struct MessageAssembler {
    /// Kind of the message in progress
    kind: Option<MessageKind>,
    /// Fragments received so far
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageAssembler {
    /// Create an assembler enforcing `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            kind: None,
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Whether a fragmented message is in progress
    #[inline]
    pub fn is_fragmenting(&self) -> bool {
        self.kind.is_some()
    }

    /// Discard any partial message
    pub fn reset(&mut self) {
        self.kind = None;
        self.buf = BytesMut::new();
    }

    /// Feed one frame in arrival order
    ///
    /// Returns `Ok(None)` for a non-final data fragment. Any error leaves the
    /// assembler reset; the connection is expected to fail.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        let result = self.handle_frame(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Lazily assemble a sequence of frames
    ///
    /// The iterator yields each completed message or control frame and stops
    /// after the first error.
    pub fn feed<I>(&mut self, frames: I) -> Feed<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Frame>,
    {
        Feed {
            assembler: self,
            frames: frames.into_iter(),
            failed: false,
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        match frame.header.opcode {
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Text => self.handle_data(frame, MessageKind::Text),
            OpCode::Binary => self.handle_data(frame, MessageKind::Binary),
            OpCode::Close => {
                let reason = parse_close_payload(&frame.payload)?;
                Ok(Some(Assembled::Control(Control::Close(reason))))
            }
            OpCode::Ping => Ok(Some(Assembled::Control(Control::Ping(frame.payload)))),
            OpCode::Pong => Ok(Some(Assembled::Control(Control::Pong(frame.payload)))),
            OpCode::ReservedData(_) | OpCode::ReservedControl(_) => {
                Err(Error::Protocol("reserved opcode"))
            }
        }
    }

    fn handle_data(&mut self, frame: Frame, kind: MessageKind) -> Result<Option<Assembled>> {
        if self.kind.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }

        if frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        if frame.header.fin {
            // Unfragmented message
            return complete(kind, frame.payload).map(|m| Some(Assembled::Message(m)));
        }

        self.kind = Some(kind);
        self.buf.clear();
        self.buf.extend_from_slice(&frame.payload);
        Ok(None)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        let kind = self
            .kind
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        if self.buf.len() + frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        self.buf.extend_from_slice(&frame.payload);

        if !frame.header.fin {
            return Ok(None);
        }

        self.kind = None;
        let data = self.buf.split().freeze();
        complete(kind, data).map(|m| Some(Assembled::Message(m)))
    }
}

/// Iterator returned by [`MessageAssembler::feed`]
pub struct Feed<'a, I> {
    assembler: &'a mut MessageAssembler,
    frames: I,
    failed: bool,
}

impl<I> Iterator for Feed<'_, I>
where
    I: Iterator<Item = Frame>,
{
    type Item = Result<Assembled>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        for frame in self.frames.by_ref() {
            match self.assembler.push(frame) {
                Ok(Some(out)) => return Some(Ok(out)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Build the finished message, validating text as a whole
///
/// Validation waits for the final fragment because a code point may straddle
/// a fragment boundary.
fn complete(kind: MessageKind, data: Bytes) -> Result<Message> {
    match kind {
        MessageKind::Binary => Ok(Message::Binary(data)),
        MessageKind::Text => {
            if !validate_utf8(&data) {
                return Err(Error::InvalidUtf8);
            }
            // SAFETY: validated as UTF-8 just above
            let text = unsafe { String::from_utf8_unchecked(Vec::from(data)) };
            Ok(Message::Text(text))
        }
    }
}

/// Parse a close frame payload
///
/// An empty payload carries no status. A single byte, a code outside the
/// receivable range, or a non-UTF-8 reason is a protocol error.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("invalid close frame payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(Error::Protocol("invalid close code"));
            }
            let text = &payload[2..];
            if !validate_utf8(text) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseReason::new(
                code,
                String::from_utf8_lossy(text).into_owned(),
            )))
        }
    }
}

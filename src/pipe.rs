//! Transport pipe
//!
//! Owns the stream plus both directions of buffering:
//! - inbound bytes accumulate until a whole frame can be decoded
//! - outbound frames queue in FIFO order; partial writes resume where they
//!   stopped
//!
//! Byte counters advance only on bytes the transport actually returned or
//! accepted.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::counter::Traffic;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameCodec};

/// Most chunks handed to one vectored write
const MAX_WRITE_SLICES: usize = 64;

/// FIFO of encoded outbound bytes
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    pending: usize,
}

impl WriteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the back of the queue
    #[inline]
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.pending += data.len();
        self.chunks.push_back(data);
    }

    /// Check if there's any pending data
    #[inline]
    pub fn has_data(&self) -> bool {
        self.pending > 0
    }

    /// Get total pending bytes
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// Get queued data as IoSlices (for vectored I/O)
    pub fn write_slices(&self) -> Vec<IoSlice<'_>> {
        self.chunks
            .iter()
            .take(MAX_WRITE_SLICES)
            .map(|chunk| IoSlice::new(chunk))
            .collect()
    }

    /// Consume bytes the transport accepted
    pub fn consume(&mut self, mut n: usize) {
        n = n.min(self.pending);
        self.pending -= n;

        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.chunks.pop_front();
            } else {
                // Partial write; resume mid-chunk next time
                front.advance(n);
                break;
            }
        }
    }

    /// Drop everything still queued
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.pending = 0;
    }
}

/// Buffered transport shared by the handshake and framing layers
#[derive(Debug)]
pub struct IoPipe<S> {
    stream: S,
    read_buf: BytesMut,
    write_queue: WriteQueue,
    read_chunk: usize,
    traffic: Arc<Mutex<Traffic>>,
}

impl<S> IoPipe<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream
    pub fn new(stream: S, read_chunk: usize, traffic: Arc<Mutex<Traffic>>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(read_chunk),
            write_queue: WriteQueue::new(),
            read_chunk: read_chunk.max(1),
            traffic,
        }
    }

    /// Change how many bytes each read asks for
    pub fn set_read_chunk(&mut self, read_chunk: usize) {
        self.read_chunk = read_chunk.max(1);
    }

    /// Inbound bytes not yet consumed
    #[inline]
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Whether outbound bytes are still queued
    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        self.write_queue.has_data()
    }

    /// Queue raw bytes (handshake text)
    pub fn queue(&mut self, data: Bytes) {
        self.write_queue.push(data);
    }

    /// Encode and queue one frame
    pub fn queue_frame(&mut self, codec: &FrameCodec, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.header.header_size() + frame.payload.len());
        codec.encode(frame, &mut buf)?;
        self.write_queue.push(buf.freeze());
        Ok(())
    }

    /// Drop queued output
    pub fn discard_writes(&mut self) {
        self.write_queue.clear();
    }

    /// Decode the next complete frame from the inbound buffer
    #[inline]
    pub fn next_frame(&mut self, codec: &FrameCodec) -> Result<Option<Frame>> {
        codec.decode_from(&mut self.read_buf)
    }

    /// Read more bytes from the transport into the inbound buffer
    ///
    /// Returns 0 at end of stream.
    pub fn poll_read_more(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize>> {
        if self.read_buf.capacity() - self.read_buf.len() < self.read_chunk / 2 {
            self.read_buf.reserve(self.read_chunk);
        }

        let len = self.read_buf.len();
        let n = {
            let mut read_buf = ReadBuf::uninit(self.read_buf.spare_capacity_mut());
            ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))?;
            read_buf.filled().len()
        };

        // SAFETY: the transport initialized `n` bytes of spare capacity
        unsafe {
            self.read_buf.set_len(len + n);
        }

        if n > 0 {
            self.traffic.lock().received.add(n as u64);
        }
        Poll::Ready(Ok(n))
    }

    /// Write queued bytes in order, then flush the transport
    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while self.write_queue.has_data() {
            let n = {
                let slices = self.write_queue.write_slices();
                ready!(Pin::new(&mut self.stream).poll_write_vectored(cx, &slices))?
            };

            if n == 0 {
                return Poll::Ready(Err(Error::Io(io::ErrorKind::WriteZero.into())));
            }

            self.write_queue.consume(n);
            self.traffic.lock().sent.add(n as u64);
        }

        ready!(Pin::new(&mut self.stream).poll_flush(cx))?;
        Poll::Ready(Ok(()))
    }

    /// Shut down the write half of the transport
    pub fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        ready!(Pin::new(&mut self.stream).poll_shutdown(cx))?;
        Poll::Ready(Ok(()))
    }

    /// Read more bytes; 0 at end of stream
    pub async fn read_more(&mut self) -> Result<usize> {
        poll_fn(|cx| self.poll_read_more(cx)).await
    }

    /// Drain the write queue
    pub async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the pipe, returning the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

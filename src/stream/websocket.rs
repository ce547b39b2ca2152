//! WebSocket connection state machine
//!
//! This module provides [`WebSocket`], which owns the transport and drives a
//! single connection from the opening handshake to teardown.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_core::Stream;
use futures_sink::Sink;
use http::Request;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, Sleep};
use tracing::{debug, trace, warn};

use crate::Config;
use crate::assembler::{Assembled, Control, MessageAssembler};
use crate::counter::{ByteCount, Traffic};
use crate::error::{CloseReason, Error, ErrorKind, Result};
use crate::frame::{Frame, FrameCodec, MAX_CONTROL_PAYLOAD};
use crate::handshake::{
    ClientHandshake, HandshakeTimeout, ServerHandshake, parse_request, parse_response,
};
use crate::pipe::IoPipe;
use crate::protocol::{Event, Message, PingTracker, ReadyState, Role};
use crate::trust::{PeerTrust, evaluate_trust};

/// Handshake inputs held until `open`
#[derive(Debug)]
enum Setup {
    /// Request template for the upgrade request
    Client(Request<()>),
    /// Upgrade request already parsed by the caller, or `None` to read it
    Server(Option<Request<()>>),
}

/// Opening handshake in progress
enum Negotiation {
    /// Upgrade request queued; waiting for the response
    Client(ClientHandshake),
    /// Waiting for (or holding) the upgrade request
    Server(Option<Request<()>>),
    /// 101 response queued; done once it is written
    Responding(Option<String>),
}

/// A WebSocket connection over an async transport
///
/// Nothing happens on the wire until [`open`](Self::open) runs the opening
/// handshake (or the event stream runs it implicitly). After that, the
/// connection is driven by polling it as a [`Stream`] of [`Event`]s, or
/// through [`next_event`](Self::next_event): each poll writes queued frames
/// and reads incoming ones independently, answers pings, echoes close frames
/// and yields events in order. [`Event::Closed`] is always the last event.
///
/// Outbound messages go through [`send`](Self::send) or the [`Sink`] impl.
///
/// # Example
///
/// ```ignore
/// use futures_util::StreamExt;
///
/// let mut ws = WebSocket::server(stream, Config::default())?;
/// ws.open().await?;
///
/// while let Some(event) = ws.next().await {
///     if let Event::Message(msg) = event {
///         ws.send(msg)?;
///     }
/// }
/// ```
pub struct WebSocket<S> {
    pipe: IoPipe<S>,
    codec: FrameCodec,
    assembler: MessageAssembler,
    config: Config,
    setup: Option<Setup>,
    negotiation: Option<Negotiation>,
    handshake_timer: Option<(Duration, Pin<Box<Sleep>>)>,
    peer_trust: Option<PeerTrust>,
    state: Arc<AtomicU8>,
    traffic: Arc<Mutex<Traffic>>,
    pings: PingTracker,
    events: VecDeque<Event>,
    protocol: Option<String>,
    /// Close requested locally
    local_close: Option<CloseReason>,
    /// Close frame received from the peer (inner `None`: no status code)
    peer_close: Option<Option<CloseReason>>,
    close_sent: bool,
    close_deadline: Option<Instant>,
    close_timer: Option<Pin<Box<Sleep>>>,
    /// Grace period for flushing and shutting down after `Closed`
    teardown: Option<Pin<Box<Sleep>>>,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, role: Role, setup: Setup, config: Config) -> Result<Self> {
        config.validate()?;

        let traffic = Arc::new(Mutex::new(Traffic::default()));
        Ok(Self {
            pipe: IoPipe::new(stream, config.read_buffer_size, traffic.clone()),
            codec: FrameCodec::new(role, config.max_frame_size),
            assembler: MessageAssembler::new(config.max_message_size),
            config,
            setup: Some(setup),
            negotiation: None,
            handshake_timer: None,
            peer_trust: None,
            state: Arc::new(AtomicU8::new(ReadyState::Connecting as u8)),
            traffic,
            pings: PingTracker::new(),
            events: VecDeque::new(),
            protocol: None,
            local_close: None,
            peer_close: None,
            close_sent: false,
            close_deadline: None,
            close_timer: None,
            teardown: None,
        })
    }
    /// Create a client connection
    ///
    /// `request` is the upgrade request template: its URI, extra headers and
    /// an optional [`HandshakeTimeout`] extension are honored.
    pub fn client(stream: S, request: Request<()>, config: Config) -> Result<Self> {
        Self::new(stream, Role::Client, Setup::Client(request), config)
    }

    /// Create a server connection that reads the upgrade request itself
    pub fn server(stream: S, config: Config) -> Result<Self> {
        Self::new(stream, Role::Server, Setup::Server(None), config)
    }

    /// Create a server connection for an upgrade request already parsed
    ///
    /// Use [`is_websocket_request`](crate::is_websocket_request) first to
    /// decide whether to hand the request over at all.
    pub fn server_with_request(stream: S, request: Request<()>, config: Config) -> Result<Self> {
        Self::new(stream, Role::Server, Setup::Server(Some(request)), config)
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.codec.role()
    }

    /// Current ready state
    #[inline]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Negotiated subprotocol, once open
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration before opening
    pub fn reconfigure(&mut self, config: Config) -> Result<()> {
        self.ensure_unopened()?;
        config.validate()?;

        self.codec = FrameCodec::new(self.codec.role(), config.max_frame_size);
        self.assembler = MessageAssembler::new(config.max_message_size);
        self.pipe.set_read_chunk(config.read_buffer_size);
        self.config = config;
        Ok(())
    }

    /// Record the transport's certificate evaluation
    ///
    /// Evaluated against the configured trust settings when the connection
    /// opens.
    pub fn set_peer_trust(&mut self, peer: PeerTrust) -> Result<()> {
        self.ensure_unopened()?;
        self.peer_trust = Some(peer);
        Ok(())
    }

    fn ensure_unopened(&self) -> Result<()> {
        if self.setup.is_none() || self.ready_state() != ReadyState::Connecting {
            return Err(Error::InvalidState("connection already opened"));
        }
        Ok(())
    }

    /// Bytes written to the transport
    pub fn bytes_sent(&self) -> ByteCount {
        self.traffic.lock().sent
    }

    /// Bytes read from the transport
    pub fn bytes_received(&self) -> ByteCount {
        self.traffic.lock().received
    }

    /// Zero both byte counters
    pub fn reset_byte_counts(&self) {
        self.traffic.lock().reset();
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        self.pipe.get_ref()
    }

    /// Get a mutable reference to the underlying stream
    ///
    /// Reading or writing through it corrupts the framing.
    pub fn get_mut(&mut self) -> &mut S {
        self.pipe.get_mut()
    }

    /// Consume the connection, returning the underlying stream
    pub fn into_inner(self) -> S {
        self.pipe.into_inner()
    }

    pub(crate) fn shared_state(&self) -> Arc<AtomicU8> {
        self.state.clone()
    }

    pub(crate) fn shared_traffic(&self) -> Arc<Mutex<Traffic>> {
        self.traffic.clone()
    }

    // ========================================================================
    // Opening handshake
    // ========================================================================

    /// Run the opening handshake
    ///
    /// On success the state is `Open`, an [`Event::Open`] is queued and the
    /// negotiated subprotocol returned. On failure the error is returned here
    /// and the connection is closed; the queued [`Event::Closed`] is the only
    /// event that follows. Cancelling the future keeps the handshake's
    /// progress; calling `open` again resumes it.
    pub async fn open(&mut self) -> Result<Option<String>> {
        let result = poll_fn(|cx| self.poll_open(cx)).await;
        if result.is_err() {
            poll_fn(|cx| self.poll_teardown(cx)).await;
        }
        result
    }

    fn poll_open(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<String>>> {
        if self.ready_state() != ReadyState::Connecting {
            return Poll::Ready(Err(Error::InvalidState("connection is not connecting")));
        }

        if self.negotiation.is_none() {
            let setup = self
                .setup
                .take()
                .ok_or(Error::InvalidState("open may only be called once"))?;
            if let Err(e) = self.start_handshake(setup) {
                return Poll::Ready(Err(self.abort_open(e)));
            }
        }

        let result = ready!(self.poll_handshake(cx));
        self.negotiation = None;
        self.handshake_timer = None;

        match result {
            Ok(protocol) => {
                self.set_state(ReadyState::Open);
                debug!(role = ?self.role(), protocol = ?protocol, "WebSocket opened");
                self.protocol = protocol.clone();
                self.events.push_back(Event::Open {
                    protocol: protocol.clone(),
                });
                Poll::Ready(Ok(protocol))
            }
            Err(e) => Poll::Ready(Err(self.abort_open(e))),
        }
    }

    /// Check trust, queue the client request and arm the deadline
    fn start_handshake(&mut self, setup: Setup) -> Result<()> {
        if let Some(peer) = &self.peer_trust {
            evaluate_trust(&self.config.tls, peer)?;
        }

        let (negotiation, timeout) = match setup {
            Setup::Client(request) => {
                let handshake = ClientHandshake::new(
                    request,
                    &self.config.protocols,
                    self.config.origin.as_deref(),
                )?;
                let timeout = handshake
                    .timeout()
                    .unwrap_or(self.config.handshake_timeout);
                self.pipe.queue(handshake.to_bytes());
                (Negotiation::Client(handshake), timeout)
            }
            Setup::Server(request) => {
                let timeout = request
                    .as_ref()
                    .and_then(|r| r.extensions().get::<HandshakeTimeout>())
                    .map_or(self.config.handshake_timeout, |t| t.0);
                (Negotiation::Server(request), timeout)
            }
        };

        self.negotiation = Some(negotiation);
        self.handshake_timer = Some((timeout, Box::pin(time::sleep(timeout))));
        Ok(())
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<String>>> {
        if let Poll::Ready(result) = self.poll_negotiate(cx) {
            return Poll::Ready(result);
        }
        if let Some((timeout, timer)) = self.handshake_timer.as_mut()
            && timer.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(Err(Error::HandshakeTimeout(*timeout)));
        }
        Poll::Pending
    }

    fn poll_negotiate(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<String>>> {
        loop {
            let next = match self.negotiation.as_mut() {
                None => return Poll::Ready(Err(Error::InvalidState("handshake not started"))),
                Some(Negotiation::Client(handshake)) => {
                    ready!(self.pipe.poll_flush(cx))?;
                    if let Some((response, len)) = parse_response(self.pipe.read_buf())? {
                        // Bytes past the headers are already frames
                        self.pipe.read_buf().advance(len);
                        return Poll::Ready(handshake.finish(&response));
                    }
                    if ready!(self.pipe.poll_read_more(cx))? == 0 {
                        return Poll::Ready(Err(Error::ConnectionClosed));
                    }
                    continue;
                }
                Some(Negotiation::Server(request)) => {
                    let request = match request.take() {
                        Some(request) => request,
                        None => match parse_request(self.pipe.read_buf())? {
                            Some((request, len)) => {
                                self.pipe.read_buf().advance(len);
                                request
                            }
                            None => {
                                if ready!(self.pipe.poll_read_more(cx))? == 0 {
                                    return Poll::Ready(Err(Error::ConnectionClosed));
                                }
                                continue;
                            }
                        },
                    };

                    let handshake = ServerHandshake::new(&request, &self.config.protocols)?;
                    self.pipe.queue(handshake.response());
                    Negotiation::Responding(handshake.protocol().map(str::to_owned))
                }
                Some(Negotiation::Responding(protocol)) => {
                    ready!(self.pipe.poll_flush(cx))?;
                    return Poll::Ready(Ok(protocol.take()));
                }
            };
            self.negotiation = Some(next);
        }
    }

    /// Close after a failed handshake, handing the error back
    fn abort_open(&mut self, err: Error) -> Error {
        warn!(role = ?self.role(), error = %err, "Opening handshake failed");
        self.negotiation = None;
        self.handshake_timer = None;
        self.terminate(err.close_code(), err.to_string(), false);
        err
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue a message
    ///
    /// Only legal while `Open`. The frame is written by the next
    /// [`flush`](Self::flush) or poll of the event stream.
    pub fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::InvalidState("send requires an open connection"));
        }

        let frame = match message.into() {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        };
        trace!(opcode = ?frame.opcode(), len = frame.payload.len(), "Queued message");
        self.pipe.queue_frame(&self.codec, &frame)
    }

    /// Queue a ping
    ///
    /// The returned receiver resolves with the payload of the matching pong.
    /// It reports a closed channel if the connection ends first.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<oneshot::Receiver<Bytes>> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::InvalidState("ping requires an open connection"));
        }
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidArgument("ping payload exceeds 125 bytes"));
        }

        self.pipe
            .queue_frame(&self.codec, &Frame::ping(payload.clone()))?;
        Ok(self.pings.register(payload))
    }

    /// Start the closing handshake
    ///
    /// Legal while `Connecting` or `Open`. `code` must be one an endpoint may
    /// send and `reason` at most 123 bytes. Closing before the handshake
    /// completes abandons it; no close frame is sent.
    ///
    /// The peer has `close_timeout` to answer, counted from this call and
    /// covering any output still queued ahead of the close frame.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_sendable_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if reason.len() > CloseReason::MAX_REASON_LEN {
            return Err(Error::InvalidArgument("close reason exceeds 123 bytes"));
        }

        match self.ready_state() {
            ReadyState::Connecting => {
                self.local_close = Some(CloseReason::new(code, reason));
                self.set_state(ReadyState::Closing);
                Ok(())
            }
            ReadyState::Open => {
                self.pipe
                    .queue_frame(&self.codec, &Frame::close(code, reason))?;
                self.local_close = Some(CloseReason::new(code, reason));
                self.close_sent = true;
                self.close_deadline = Some(Instant::now() + self.config.close_timeout);
                self.set_state(ReadyState::Closing);
                debug!(code, reason, "Close frame queued");
                Ok(())
            }
            ReadyState::Closing | ReadyState::Closed => {
                Err(Error::InvalidState("close already in progress"))
            }
        }
    }

    /// Close with 1000 (normal closure) and no reason
    pub fn close_normal(&mut self) -> Result<()> {
        self.close(CloseReason::NORMAL, "")
    }

    /// Write every queued frame to the transport
    ///
    /// Nothing is read meanwhile; if the peer may be writing too, drive the
    /// event stream instead. A transport failure here closes the connection;
    /// the error is returned and only [`Event::Closed`] is queued.
    pub async fn flush(&mut self) -> Result<()> {
        if self.ready_state() == ReadyState::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }
        let result = poll_fn(|cx| self.poll_write_queue(cx)).await;
        if result.is_err() {
            poll_fn(|cx| self.poll_teardown(cx)).await;
        }
        result
    }

    fn poll_write_queue(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.ready_state() == ReadyState::Closed {
            return Poll::Ready(Ok(()));
        }
        match ready!(self.pipe.poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => {
                self.terminate(e.close_code(), e.to_string(), false);
                Poll::Ready(Err(e))
            }
        }
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Drive the connection until the next event
    ///
    /// Returns `None` once [`Event::Closed`] has been delivered and the
    /// transport released. Cancelling the returned future loses nothing.
    pub async fn next_event(&mut self) -> Option<Event> {
        poll_fn(|cx| self.poll_next_event(cx)).await
    }

    fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        loop {
            ready!(self.poll_teardown(cx));

            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.ready_state() == ReadyState::Closed {
                return Poll::Ready(None);
            }

            ready!(self.poll_drive(cx));
        }
    }

    /// Make progress; `Ready` means state changed or events may be queued
    fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.ready_state() {
            ReadyState::Connecting => {
                if let Err(e) = ready!(self.poll_open(cx)) {
                    if self.ready_state() == ReadyState::Closed {
                        // Closed is already queued; the failure goes first
                        self.events.push_front(Event::Failed(e));
                    } else {
                        self.fail(e);
                    }
                }
            }
            ReadyState::Closing if self.setup.is_some() || self.negotiation.is_some() => {
                // Closed before the handshake finished
                self.setup = None;
                self.negotiation = None;
                self.handshake_timer = None;
                self.pipe.discard_writes();
                let (code, reason) = self
                    .local_close
                    .take()
                    .map_or((CloseReason::NORMAL, String::new()), |c| (c.code, c.reason));
                self.terminate(code, reason, false);
            }
            ReadyState::Open | ReadyState::Closing => {
                if let Err(e) = ready!(self.poll_step(cx)) {
                    self.fail(e);
                }
            }
            ReadyState::Closed => {}
        }
        Poll::Ready(())
    }

    /// One round of I/O
    ///
    /// Buffered frames are handled first. Then queued output and inbound
    /// bytes are polled side by side, so a peer that is itself blocked on
    /// writing still gets read. The close deadline bounds all of it.
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(deadline) = self.close_deadline {
            let timer = self
                .close_timer
                .get_or_insert_with(|| Box::pin(time::sleep_until(deadline)));
            if timer.as_mut().poll(cx).is_ready() {
                warn!(
                    pending = self.pipe.has_pending_writes(),
                    "Timed out waiting for close frame"
                );
                self.pipe.discard_writes();
                self.terminate(CloseReason::ABNORMAL, String::new(), false);
                return Poll::Ready(Ok(()));
            }
        }

        if self.close_exchanged() {
            self.finish_close();
            return Poll::Ready(Ok(()));
        }

        while let Some(frame) = self.pipe.next_frame(&self.codec)? {
            trace!(opcode = ?frame.opcode(), fin = frame.is_final(), len = frame.payload.len(), "Frame received");
            self.handle_frame(frame)?;

            if self.close_exchanged() {
                self.finish_close();
                return Poll::Ready(Ok(()));
            }
            if !self.events.is_empty() {
                return Poll::Ready(Ok(()));
            }
        }

        let flushed =
            self.pipe.has_pending_writes() && self.pipe.poll_flush(cx)?.is_ready();

        match self.pipe.poll_read_more(cx)? {
            Poll::Ready(0) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Ready(_) => Poll::Ready(Ok(())),
            Poll::Pending if flushed => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let Some(assembled) = self.assembler.push(frame)? else {
            return Ok(());
        };

        if self.peer_close.is_some() {
            // Nothing may follow the peer's close frame
            trace!("Ignoring frame after close");
            return Ok(());
        }

        match assembled {
            Assembled::Message(message) => {
                self.events.push_back(Event::Message(message));
            }
            Assembled::Control(Control::Ping(payload)) => {
                if !self.close_sent {
                    self.pipe.queue_frame(&self.codec, &Frame::pong(payload))?;
                }
            }
            Assembled::Control(Control::Pong(payload)) => {
                if !self.pings.resolve(&payload) {
                    trace!(len = payload.len(), "Unsolicited pong");
                }
            }
            Assembled::Control(Control::Close(reason)) => {
                debug!(code = ?reason.as_ref().map(|r| r.code), "Close frame received");
                if !self.close_sent {
                    let echo = match &reason {
                        Some(r) => Frame::close(r.code, ""),
                        None => Frame::close_empty(),
                    };
                    self.pipe.queue_frame(&self.codec, &echo)?;
                    self.close_sent = true;
                    self.set_state(ReadyState::Closing);
                }
                self.peer_close = Some(reason);
            }
        }
        Ok(())
    }

    #[inline]
    fn close_exchanged(&self) -> bool {
        self.close_sent && self.peer_close.is_some()
    }

    /// Both close frames exchanged
    fn finish_close(&mut self) {
        let (code, reason) = match (&self.local_close, &self.peer_close) {
            (Some(local), _) => (local.code, local.reason.clone()),
            (None, Some(Some(peer))) => (peer.code, peer.reason.clone()),
            (None, _) => (CloseReason::NO_STATUS, String::new()),
        };
        self.terminate(code, reason, true);
    }

    /// Report a fatal error, then close
    fn fail(&mut self, err: Error) {
        warn!(role = ?self.role(), error = %err, "WebSocket failed");

        let code = err.close_code();
        if err.kind() == ErrorKind::Protocol
            && !self.close_sent
            && self.ready_state() != ReadyState::Connecting
        {
            // Best effort; the transport may be unusable
            let frame = Frame::close(code, "");
            if self.pipe.queue_frame(&self.codec, &frame).is_ok() {
                self.close_sent = true;
            }
        }

        let reason = err.to_string();
        self.events.push_back(Event::Failed(err));
        self.terminate(code, reason, false);
    }

    /// Move to `Closed` and queue the final event
    ///
    /// Queued output is flushed and the transport shut down by the next
    /// polls, within `close_timeout`.
    fn terminate(&mut self, code: u16, reason: String, was_clean: bool) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }

        self.set_state(ReadyState::Closed);
        self.assembler.reset();
        self.pings.clear();
        self.close_deadline = None;
        self.close_timer = None;
        debug!(code, reason = %reason, was_clean, "WebSocket closed");
        self.events.push_back(Event::Closed {
            code,
            reason,
            was_clean,
        });
        self.teardown = Some(Box::pin(time::sleep(self.config.close_timeout)));
    }

    /// Best-effort flush and shutdown after `Closed`
    fn poll_teardown(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(grace) = self.teardown.as_mut() else {
            return Poll::Ready(());
        };

        let progress = match self.pipe.poll_flush(cx) {
            Poll::Ready(Ok(())) => self.pipe.poll_shutdown(cx),
            other => other,
        };
        match progress {
            Poll::Ready(Ok(())) => trace!("Transport shut down"),
            Poll::Ready(Err(e)) => debug!(error = %e, "Transport teardown failed"),
            Poll::Pending => {
                if grace.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                debug!(
                    pending = self.pipe.has_pending_writes(),
                    "Transport teardown timed out"
                );
            }
        }

        self.teardown = None;
        self.pipe.discard_writes();
        Poll::Ready(())
    }

    fn set_state(&self, next: ReadyState) {
        let current = self.ready_state();
        if current == next {
            return;
        }
        debug_assert!(current.can_advance_to(next), "{current:?} -> {next:?}");
        if current.can_advance_to(next) {
            trace!(from = ?current, to = ?next, "State transition");
            self.state.store(next as u8, Ordering::Release);
        }
    }
}

impl<S> Stream for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_event(cx)
    }
}

impl<S> Sink<Message> for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.ready_state() != ReadyState::Open {
            return Poll::Ready(Err(Error::InvalidState("send requires an open connection")));
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<()> {
        self.get_mut().send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.get_mut().poll_write_queue(cx)
    }

    /// Queue a normal close if still open and write it out
    ///
    /// The peer's answer arrives on the event stream.
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.ready_state() == ReadyState::Open {
            this.close_normal()?;
        }
        this.poll_write_queue(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    async fn opened_server() -> (WebSocket<DuplexStream>, DuplexStream) {
        let (mut peer, local) = tokio::io::duplex(4096);
        peer.write_all(UPGRADE).await.unwrap();
        let mut ws = WebSocket::server(local, Config::default()).unwrap();
        ws.open().await.unwrap();

        let mut response = vec![0u8; 4096];
        let n = peer.read(&mut response).await.unwrap();
        assert!(response[..n].starts_with(b"HTTP/1.1 101"));
        (ws, peer)
    }

    fn client_frame(frame: &Frame) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        FrameCodec::new(Role::Client, usize::MAX)
            .encode(frame, &mut buf)
            .unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_server_open_counts_bytes() {
        let (mut ws, _peer) = opened_server().await;
        assert_eq!(ws.ready_state(), ReadyState::Open);
        assert_eq!(ws.bytes_received().bytes, UPGRADE.len() as u64);
        assert!(ws.bytes_sent().bytes > 0);
        assert!(matches!(
            ws.next_event().await,
            Some(Event::Open { protocol: None })
        ));

        ws.reset_byte_counts();
        assert_eq!(ws.bytes_sent(), ByteCount::new());
    }

    #[tokio::test]
    async fn test_open_twice_is_invalid_state() {
        let (mut ws, _peer) = opened_server().await;
        assert!(matches!(ws.open().await, Err(Error::InvalidState(_))));
        assert!(matches!(
            ws.reconfigure(Config::default()),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(ws.ready_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_send_before_open_is_invalid_state() {
        let (_peer, local) = tokio::io::duplex(64);
        let mut ws = WebSocket::server(local, Config::default()).unwrap();
        assert!(matches!(
            ws.send("hello"),
            Err(Error::InvalidState(_))
        ));
        assert!(ws.ping("x").is_err());
        assert_eq!(ws.ready_state(), ReadyState::Connecting);
        assert!(ws.reconfigure(Config::default()).is_ok());
    }

    #[tokio::test]
    async fn test_leftover_bytes_decoded_as_frames() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let mut wire = UPGRADE.to_vec();
        wire.extend(client_frame(&Frame::text("early")));
        peer.write_all(&wire).await.unwrap();

        let mut ws = WebSocket::server(local, Config::default()).unwrap();
        ws.open().await.unwrap();
        assert!(matches!(ws.next_event().await, Some(Event::Open { .. })));
        match ws.next_event().await {
            Some(Event::Message(msg)) => assert_eq!(msg.as_text(), Some("early")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_pong() {
        let (mut ws, mut peer) = opened_server().await;
        peer.write_all(&client_frame(&Frame::ping("are you there")))
            .await
            .unwrap();
        peer.write_all(&client_frame(&Frame::text("after")))
            .await
            .unwrap();

        let _open = ws.next_event().await;
        match ws.next_event().await {
            Some(Event::Message(msg)) => assert_eq!(msg.as_text(), Some("after")),
            other => panic!("unexpected event: {other:?}"),
        }
        ws.flush().await.unwrap();
        assert_eq!(ws.ready_state(), ReadyState::Open);

        let mut buf = [0u8; 15];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x8A);
        assert_eq!(buf[1], 13);
        assert_eq!(&buf[2..], b"are you there");
    }

    #[tokio::test]
    async fn test_close_validation() {
        let (mut ws, _peer) = opened_server().await;
        assert!(matches!(ws.close(1005, ""), Err(Error::InvalidCloseCode(1005))));
        assert!(matches!(
            ws.close(1000, &"x".repeat(124)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(ws.ping(vec![0u8; 126]), Err(Error::InvalidArgument(_))));

        ws.close_normal().unwrap();
        assert_eq!(ws.ready_state(), ReadyState::Closing);
        assert!(matches!(ws.send("late"), Err(Error::InvalidState(_))));
        assert!(matches!(ws.close_normal(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_close_timeout_is_unclean() {
        let (peer, local) = tokio::io::duplex(4096);
        let config = Config::builder()
            .close_timeout(Duration::from_millis(50))
            .build();
        let mut ws = WebSocket::server(local, config).unwrap();
        let mut peer = peer;
        peer.write_all(UPGRADE).await.unwrap();
        ws.open().await.unwrap();

        ws.close(1000, "bye").unwrap();
        let _open = ws.next_event().await;
        match ws.next_event().await {
            Some(Event::Closed {
                code, was_clean, ..
            }) => {
                assert_eq!(code, CloseReason::ABNORMAL);
                assert!(!was_clean);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(ws.next_event().await.is_none());
        drop(peer);
    }

    #[tokio::test]
    async fn test_teardown_gives_up_on_stalled_peer() {
        let (mut peer, local) = tokio::io::duplex(4096);
        peer.write_all(UPGRADE).await.unwrap();
        let config = Config::builder()
            .close_timeout(Duration::from_millis(50))
            .build();
        let mut ws = WebSocket::server(local, config).unwrap();
        ws.open().await.unwrap();

        // More than the transport holds; the peer never reads
        ws.send(vec![0u8; 16 * 1024]).unwrap();
        // Unmasked frame from a client
        peer.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        let events = time::timeout(Duration::from_secs(3), async {
            let mut events = Vec::new();
            while let Some(event) = ws.next_event().await {
                events.push(event);
            }
            events
        })
        .await
        .unwrap();

        match events.as_slice() {
            [
                Event::Open { .. },
                Event::Failed(Error::Protocol(_)),
                Event::Closed {
                    code, was_clean, ..
                },
            ] => {
                assert_eq!(*code, CloseReason::PROTOCOL_ERROR);
                assert!(!*was_clean);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_open_resumes_after_cancel() {
        let (mut peer, local) = tokio::io::duplex(4096);
        let mut ws = WebSocket::server(local, Config::default()).unwrap();

        // Nothing to read yet; give up on the first attempt
        let first = time::timeout(Duration::from_millis(20), ws.open()).await;
        assert!(first.is_err());
        assert_eq!(ws.ready_state(), ReadyState::Connecting);

        peer.write_all(UPGRADE).await.unwrap();
        assert_eq!(ws.open().await.unwrap(), None);
        assert_eq!(ws.ready_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_close_while_connecting() {
        let (_peer, local) = tokio::io::duplex(64);
        let mut ws = WebSocket::server(local, Config::default()).unwrap();
        ws.close(4000, "never mind").unwrap();
        assert_eq!(ws.ready_state(), ReadyState::Closing);
        assert!(matches!(ws.open().await, Err(Error::InvalidState(_))));

        match ws.next_event().await {
            Some(Event::Closed {
                code,
                reason,
                was_clean,
            }) => {
                assert_eq!(code, 4000);
                assert_eq!(reason, "never mind");
                assert!(!was_clean);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(ws.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (_peer, local) = tokio::io::duplex(64);
        let config = Config::builder()
            .handshake_timeout(Duration::from_millis(20))
            .build();
        let mut ws = WebSocket::server(local, config).unwrap();

        let err = ws.open().await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
        assert_eq!(ws.ready_state(), ReadyState::Closed);
        // Only the close notification follows a failed open()
        assert!(matches!(
            ws.next_event().await,
            Some(Event::Closed { was_clean: false, .. })
        ));
        assert!(ws.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_trust_rejection_before_open() {
        let (_peer, local) = tokio::io::duplex(64);
        let request = Request::builder()
            .uri("wss://example.com/")
            .body(())
            .unwrap();
        let mut ws = WebSocket::client(local, request, Config::default()).unwrap();
        ws.set_peer_trust(PeerTrust::new(false)).unwrap();

        // Implicit open through the driver reports the failure as an event
        assert!(matches!(
            ws.next_event().await,
            Some(Event::Failed(Error::Trust(_)))
        ));
        match ws.next_event().await {
            Some(Event::Closed { code, .. }) => assert_eq!(code, CloseReason::TLS_HANDSHAKE),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(ws.bytes_sent().bytes, 0);
    }
}

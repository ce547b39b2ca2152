//! Task-driven connections
//!
//! [`WebSocket::spawn`] moves a connection onto its own tokio task. Events
//! arrive on an unbounded channel so the connection never waits on the
//! consumer; [`WebSocketHandle`] sends commands back to the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::WebSocket;
use crate::counter::{ByteCount, Traffic};
use crate::error::{CloseReason, Error, Result};
use crate::protocol::{Event, Message, ReadyState};

/// Internal commands for the connection task
enum Command {
    /// Queue a message
    Send {
        message: Message,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Queue a ping and hand back its completion
    Ping {
        payload: Bytes,
        reply: oneshot::Sender<Result<oneshot::Receiver<Bytes>>>,
    },
    /// Start the closing handshake
    Close {
        code: u16,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a spawned connection
#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicU8>,
    traffic: Arc<Mutex<Traffic>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send { message, .. } => f.debug_tuple("Send").field(message).finish(),
            Command::Ping { payload, .. } => f.debug_tuple("Ping").field(payload).finish(),
            Command::Close { code, reason, .. } => {
                f.debug_tuple("Close").field(code).field(reason).finish()
            }
        }
    }
}

impl WebSocketHandle {
    /// Current ready state
    #[inline]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queue a message
    ///
    /// Fails immediately with `InvalidState` unless the connection is open.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::InvalidState("send requires an open connection"));
        }
        let message = message.into();
        self.request(|reply| Command::Send { message, reply }).await
    }

    /// Queue a ping; the receiver resolves with the matching pong payload
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<oneshot::Receiver<Bytes>> {
        let payload = payload.into();
        self.request(|reply| Command::Ping { payload, reply }).await
    }

    /// Start the closing handshake
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let reason = reason.to_owned();
        self.request(|reply| Command::Close {
            code,
            reason,
            reply,
        })
        .await
    }

    /// Close with 1000 (normal closure) and no reason
    pub async fn close_normal(&self) -> Result<()> {
        self.close(CloseReason::NORMAL, "").await
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

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::InvalidState("connection is closed"))?;
        response
            .await
            .map_err(|_| Error::InvalidState("connection is closed"))?
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the connection on a tokio task
    ///
    /// The opening handshake runs first if it has not already; commands sent
    /// meanwhile wait for it. Every [`Event`] is delivered on the returned
    /// channel, ending with [`Event::Closed`]. The task exits after that.
    pub fn spawn(self) -> (WebSocketHandle, mpsc::UnboundedReceiver<Event>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handle = WebSocketHandle {
            commands: command_tx,
            state: self.shared_state(),
            traffic: self.shared_traffic(),
        };

        tokio::spawn(run_loop(self, command_rx, event_tx));
        (handle, event_rx)
    }
}

async fn run_loop<S>(
    mut ws: WebSocket<S>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if ws.ready_state() == ReadyState::Connecting
        && let Err(e) = ws.open().await
        && ws.ready_state() == ReadyState::Closed
    {
        let _ = event_tx.send(Event::Failed(e));
    }

    let mut commands_open = true;
    loop {
        tokio::select! {
            command = command_rx.recv(), if commands_open => match command {
                Some(command) => apply(&mut ws, command),
                None => commands_open = false,
            },
            event = ws.next_event() => match event {
                Some(event) => {
                    // Receiver may be gone; keep driving to a clean close
                    let _ = event_tx.send(event);
                }
                None => break,
            },
        }
    }

    debug!("Connection task finished");
}

fn apply<S>(ws: &mut WebSocket<S>, command: Command)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match command {
        Command::Send { message, reply } => {
            let _ = reply.send(ws.send(message));
        }
        Command::Ping { payload, reply } => {
            let _ = reply.send(ws.ping(payload));
        }
        Command::Close {
            code,
            reason,
            reply,
        } => {
            let _ = reply.send(ws.close(code, &reason));
        }
    }
}

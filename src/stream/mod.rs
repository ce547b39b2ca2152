//! Connection layer
//!
//! [`WebSocket`] is the connection state machine. It is a
//! `Stream<Item = Event>` and a `Sink<Message>`, so it can be driven directly
//! with `StreamExt::next` (or `next_event`), or handed to a task with `spawn`
//! and talked to through a [`WebSocketHandle`]:
//!
//! ```ignore
//! let (handle, mut events) = ws.spawn();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! handle.send("hello").await?;
//! handle.close_normal().await?;
//! ```

mod handle;
mod websocket;

pub use handle::WebSocketHandle;
pub use websocket::WebSocket;

//! Echo server
//!
//! Accepts WebSocket upgrades on 127.0.0.1:9001 and echoes every message.
//! Run with: RUST_LOG=debug cargo run --example echo

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use pocket_ws::error::Result;
use pocket_ws::{Config, Event, WebSocket};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = SocketAddr::from(([127, 0, 0, 1], 9001));
    let listener = TcpListener::bind(addr).await?;

    println!("Echo server listening on ws://{}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                eprintln!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream) -> Result<()> {
    let config = Config::builder().protocol("echo").build();
    let mut ws = WebSocket::server(stream, config)?;
    ws.open().await?;

    while let Some(event) = ws.next_event().await {
        match event {
            Event::Message(msg) => ws.send(msg)?,
            Event::Closed {
                code,
                reason,
                was_clean,
            } => {
                println!("Closed: {} {:?} (clean: {})", code, reason, was_clean);
            }
            _ => {}
        }
    }

    println!(
        "Sent {} bytes, received {} bytes",
        ws.bytes_sent().total(),
        ws.bytes_received().total()
    );
    Ok(())
}

//! The message channel: two unidirectional TCP links carrying one JSON
//! envelope per line. Delivery is best-effort; a failed send is logged and
//! dropped, never retried.

pub mod hub;

pub use hub::{DownLink, Hub};

use crate::protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::io;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{error, warn};

/// Agent-side sender for the up (agent -> orchestrator) link.
#[derive(Clone)]
pub struct UpLink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl UpLink {
    pub fn send(&self, env: Envelope) {
        let cmd = env.name();
        if self.tx.send(env).is_err() {
            warn!(cmd, "up link closed, dropping command");
        }
    }

    /// In-process loopback, for driving an agent without a socket.
    pub fn channel() -> (UpLink, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UpLink { tx }, rx)
    }
}

/// Connect both links to the orchestrator. Returns the up-link sender and
/// the stream of inbound down-link envelopes; the receiver ends when the
/// orchestrator closes its hub.
pub async fn connect(
    host: &str,
    down_port: u16,
    up_port: u16,
) -> io::Result<(UpLink, mpsc::UnboundedReceiver<Envelope>)> {
    let down = TcpStream::connect((host, down_port)).await?;
    let up = TcpStream::connect((host, up_port)).await?;

    let (down_tx, down_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_envelopes(down, down_tx));

    let (up_tx, mut up_rx) = mpsc::unbounded_channel::<Envelope>();
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(up, LinesCodec::new());
        while let Some(env) = up_rx.recv().await {
            let line = match serde_json::to_string(&env) {
                Ok(line) => line,
                Err(e) => {
                    error!("failed to encode {} envelope: {}", env.name(), e);
                    continue;
                }
            };
            if let Err(e) = framed.send(line).await {
                warn!("up link write failed: {}", e);
                break;
            }
        }
    });

    Ok((UpLink { tx: up_tx }, down_rx))
}

/// Decode line-framed envelopes off a socket until EOF, dropping anything
/// undecodable.
pub(crate) async fn read_envelopes(stream: TcpStream, tx: mpsc::UnboundedSender<Envelope>) {
    let mut framed = FramedRead::new(stream, LinesCodec::new());
    while let Some(item) = framed.next().await {
        match item {
            Ok(line) => match serde_json::from_str::<Envelope>(&line) {
                Ok(env) => {
                    if tx.send(env).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping undecodable envelope: {}", e),
            },
            Err(e) => {
                warn!("link read failed: {}", e);
                break;
            }
        }
    }
}

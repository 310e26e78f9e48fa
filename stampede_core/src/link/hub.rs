//! Orchestrator-side owner of the two bound TCP listeners.

use crate::error::LoadError;
use crate::protocol::Envelope;
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum DownCmd {
    Broadcast(Envelope),
    Distribute(Envelope),
}

/// Handle for the orchestrator -> agents link. `broadcast` reaches every
/// connection, `distribute` picks one round-robin per call.
#[derive(Clone)]
pub struct DownLink {
    tx: mpsc::UnboundedSender<DownCmd>,
}

impl DownLink {
    pub fn broadcast(&self, env: Envelope) {
        let cmd = env.name();
        if self.tx.send(DownCmd::Broadcast(env)).is_err() {
            warn!(cmd, "down link closed, dropping broadcast");
        }
    }

    pub fn distribute(&self, env: Envelope) {
        let cmd = env.name();
        if self.tx.send(DownCmd::Distribute(env)).is_err() {
            warn!(cmd, "down link closed, dropping command");
        }
    }
}

pub struct Hub {
    cancel: CancellationToken,
    down: DownLink,
}

impl Hub {
    /// Bind both listeners and return the hub handle plus the fan-in stream
    /// of agent envelopes.
    pub async fn bind(
        down_port: u16,
        up_port: u16,
    ) -> Result<(Hub, mpsc::UnboundedReceiver<Envelope>), LoadError> {
        let down_listener = TcpListener::bind(("0.0.0.0", down_port))
            .await
            .map_err(|e| LoadError::Bind {
                port: down_port,
                source: e,
            })?;
        let up_listener = TcpListener::bind(("0.0.0.0", up_port))
            .await
            .map_err(|e| LoadError::Bind {
                port: up_port,
                source: e,
            })?;

        info!("downstream agent hub open on {}", down_port);
        info!("upstream agent results open on {}", up_port);

        let cancel = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_down(down_listener, cmd_rx, cancel.clone()));

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_up(up_listener, in_tx, cancel.clone()));

        Ok((
            Hub {
                cancel,
                down: DownLink { tx: cmd_tx },
            },
            in_rx,
        ))
    }

    pub fn down(&self) -> DownLink {
        self.down.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_down(
    listener: TcpListener,
    mut rx: mpsc::UnboundedReceiver<DownCmd>,
    cancel: CancellationToken,
) {
    let mut conns: Vec<mpsc::UnboundedSender<String>> = Vec::new();
    let mut cursor = 0usize;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("agent connected to down link from {}", peer);
                    conns.push(spawn_writer(stream, cancel.clone()));
                }
                Err(e) => warn!("down link accept failed: {}", e),
            },
            cmd = rx.recv() => match cmd {
                Some(cmd) => dispatch(cmd, &mut conns, &mut cursor),
                None => break,
            },
        }
    }
}

fn spawn_writer(stream: TcpStream, cancel: CancellationToken) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(stream, LinesCodec::new());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => {
                        if let Err(e) = framed.send(line).await {
                            warn!("down link write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    tx
}

fn dispatch(cmd: DownCmd, conns: &mut Vec<mpsc::UnboundedSender<String>>, cursor: &mut usize) {
    let (env, broadcast) = match cmd {
        DownCmd::Broadcast(env) => (env, true),
        DownCmd::Distribute(env) => (env, false),
    };

    let line = match serde_json::to_string(&env) {
        Ok(line) => line,
        Err(e) => {
            error!("failed to encode {} envelope: {}", env.name(), e);
            return;
        }
    };

    if broadcast {
        conns.retain(|tx| tx.send(line.clone()).is_ok());
        return;
    }

    while !conns.is_empty() {
        let i = *cursor % conns.len();
        if conns[i].send(line.clone()).is_ok() {
            *cursor = i + 1;
            return;
        }
        conns.remove(i);
    }
    warn!(cmd = env.name(), "no agent connections on down link, dropping command");
}

async fn run_up(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("agent connected to up link from {}", peer);
                    tokio::spawn(super::read_envelopes(stream, tx.clone()));
                }
                Err(e) => warn!("up link accept failed: {}", e),
            },
        }
    }
}

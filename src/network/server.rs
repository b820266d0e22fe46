use futures::SinkExt;
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::NetworkConfig;
use super::message::{InvType, Message};
use super::session::run_session;
use crate::node::{BlockOrigin, Node, NodeEvent};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Shared by every task of a running network.
pub(crate) struct NetContext {
    pub(crate) node: Node,
    pub(crate) config: NetworkConfig,
    /// Address put in our HELLO.
    pub(crate) advertised: String,
    /// Cancelled once on shutdown; every task and session watches it.
    pub(crate) shutdown: CancellationToken,
}

/// Doubling reconnect delay with up to 50% random jitter on top.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::random::<u64>() % (delay.as_millis() as u64 / 2 + 1);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Running peer-to-peer layer: one acceptor, one connector per known peer,
/// and a relay turning ledger events into INV announcements.
pub struct Network {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Network {
    /// Bind the acceptor, start the background tasks, and dial the
    /// bootstrap peers.
    pub async fn start(node: Node, config: NetworkConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        info!(
            "P2P listening on {local_addr} as node {} (network '{}')",
            config.node_id, config.network_id
        );

        let bootstrap = config.bootstrap_peers.clone();
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(NetContext {
            node: node.clone(),
            config,
            advertised: advertised.clone(),
            shutdown: shutdown.clone(),
        });

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let events = node.subscribe();
        node.peers().attach_dialer(dial_tx, advertised);

        let tasks = vec![
            tokio::spawn(accept_loop(listener, ctx.clone())),
            tokio::spawn(dial_loop(dial_rx, ctx.clone())),
            tokio::spawn(relay_loop(events, ctx)),
        ];

        for peer in bootstrap {
            if let Err(e) = node.add_peer(&peer) {
                warn!("Skipping bootstrap peer {peer}: {e}");
            }
        }

        Ok(Self {
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, dialing and relaying, and close every live session.
    /// Connectors stop without redialing.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Network task ended abnormally: {e}");
            }
        }
        info!("P2P on {} stopped", self.local_addr);
    }
}

/// Tell an inbound peer we are full, then hang up.
async fn refuse(stream: TcpStream, reason: String) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    if let Ok(line) = Message::error(reason).encode() {
        let _ = framed.send(line).await;
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<NetContext>) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let sessions = ctx.node.peers().session_count();
                if sessions >= ctx.config.max_peers {
                    warn!("Refusing inbound {addr}: {sessions} sessions open");
                    tokio::spawn(refuse(
                        stream,
                        format!("session limit of {} reached", ctx.config.max_peers),
                    ));
                    continue;
                }
                debug!("Inbound connection from {addr}");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    run_session(stream, ctx, None).await;
                });
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn dial_loop(mut requests: mpsc::UnboundedReceiver<(String, u64)>, ctx: Arc<NetContext>) {
    loop {
        let request = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            request = requests.recv() => request,
        };
        let Some((addr, generation)) = request else {
            return;
        };
        tokio::spawn(connector(addr, generation, ctx.clone()));
    }
}

/// Keep a connection to `addr` alive until the peer is removed or the
/// network shuts down.
async fn connector(addr: String, generation: u64, ctx: Arc<NetContext>) {
    let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);

    while ctx.node.peers().is_current(&addr, generation) {
        let attempt = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            attempt = timeout(ctx.config.connect_timeout, TcpStream::connect(&addr)) => attempt,
        };
        match attempt {
            Ok(Ok(stream)) => {
                info!("Connected to peer {addr}");
                let report = run_session(stream, ctx.clone(), Some(addr.clone())).await;
                if report.handshake_completed {
                    backoff.reset();
                }
            }
            Ok(Err(e)) => debug!("Connect to {addr} failed: {e}"),
            Err(_) => warn!("Connect to {addr} timed out"),
        }

        if !ctx.node.peers().is_current(&addr, generation) {
            break;
        }
        let delay = backoff.next_delay();
        debug!("Reconnecting to {addr} in {delay:?}");
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    debug!("Connector for {addr} stopped");
}

/// Announce every appended block to all sessions but the one it came from.
async fn relay_loop(mut events: broadcast::Receiver<NodeEvent>, ctx: Arc<NetContext>) {
    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(NodeEvent::BlockAppended {
                index,
                hash,
                origin,
            }) => {
                let except = match origin {
                    BlockOrigin::Local => None,
                    BlockOrigin::Peer(session) => Some(session),
                };
                let inv = Message::Inv {
                    obj_type: InvType::Block,
                    hashes: vec![hash],
                };
                let sent = ctx.node.peers().broadcast(&inv, except);
                debug!("Announced block #{index} to {sent} peers");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Relay lagged, {skipped} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

//! One task per TCP connection, inbound or outbound.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::blockchain::{Block, LedgerError};

use super::message::{InvType, Message, ProtocolError};
use super::peer_book::SessionCommand;
use super::server::NetContext;
use super::sync::SyncState;
use super::{MAX_FRAME_BYTES, PROTOCOL_VERSION};

type PeerStream = Framed<TcpStream, LinesCodec>;

const OUTBOX_CAPACITY: usize = 256;

/// What the connector needs to know once a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub handshake_completed: bool,
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    id: u64,
    ctx: Arc<NetContext>,
    peer: String,
    dialed: Option<String>,
    remote_node: Option<String>,
    remote_listen: Option<String>,
    sync: SyncState,
}

async fn send(stream: &mut PeerStream, msg: &Message) -> io::Result<()> {
    let line = msg
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    })
}

/// Drive a connection until either side closes it, it goes silent, or
/// the peer book asks it to stop.
pub(crate) async fn run_session(
    stream: TcpStream,
    ctx: Arc<NetContext>,
    dialed: Option<String>,
) -> SessionReport {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let id = ctx.node.peers().next_session_id();
    let (outbox, mut commands) = mpsc::channel(OUTBOX_CAPACITY);
    ctx.node.peers().register_session(id, dialed.clone(), outbox);

    let mut stream = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut session = Session {
        id,
        ctx: ctx.clone(),
        peer,
        dialed,
        remote_node: None,
        remote_listen: None,
        sync: SyncState::new(ctx.config.sync_batch),
    };

    if let Err(e) = session.run(&mut stream, &mut commands).await {
        debug!("[{}] session ended with error: {e}", session.peer);
    }
    ctx.node.peers().unregister_session(id);
    info!("[{}] disconnected", session.peer);

    SessionReport {
        handshake_completed: session.remote_node.is_some(),
    }
}

impl Session {
    async fn run(
        &mut self,
        stream: &mut PeerStream,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> io::Result<()> {
        send(stream, &self.hello()).await?;

        let mut heartbeat = interval(self.ctx.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick completes immediately
        let mut last_seen = Instant::now();
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    None => return Ok(()),
                    Some(Ok(line)) => {
                        last_seen = Instant::now();
                        if let Flow::Close = self.on_line(stream, &line).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("[{}] oversized frame dropped", self.peer);
                        send(stream, &Message::error("frame too large")).await?;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                },
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Send(msg)) => send(stream, &msg).await?,
                    Some(SessionCommand::Close) | None => return Ok(()),
                },
                _ = shutdown.cancelled() => return Ok(()),
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.ctx.config.liveness_timeout {
                        warn!("[{}] no traffic for {:?}, dropping", self.peer, last_seen.elapsed());
                        return Ok(());
                    }
                    send(stream, &Message::Ping { ts: Utc::now().timestamp_millis() }).await?;
                }
            }
        }
    }

    fn hello(&self) -> Message {
        Message::Hello {
            node_id: self.ctx.config.node_id.clone(),
            network_id: self.ctx.config.network_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            listen_addr: Some(self.ctx.advertised.clone()),
        }
    }

    fn chain_summary(&self) -> Message {
        Message::ChainSummary {
            height: self.ctx.node.height(),
            tip_hash: self.ctx.node.tip_hash(),
        }
    }

    async fn on_line(&mut self, stream: &mut PeerStream, line: &str) -> io::Result<Flow> {
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        let msg = match Message::decode(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] {e}", self.peer);
                send(stream, &Message::error(e.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!("[{}] <- {}", self.peer, msg.kind());

        if self.remote_node.is_none() && !matches!(msg, Message::Hello { .. }) {
            let e = ProtocolError::HandshakeRequired(msg.kind());
            send(stream, &Message::error(e.to_string())).await?;
            return Ok(Flow::Continue);
        }

        match msg {
            Message::Hello {
                node_id,
                network_id,
                protocol_version,
                listen_addr,
            } => {
                self.on_hello(stream, node_id, network_id, protocol_version, listen_addr)
                    .await
            }
            Message::Ping { ts } => {
                send(stream, &Message::Pong { ts }).await?;
                Ok(Flow::Continue)
            }
            Message::Pong { .. } => Ok(Flow::Continue),
            Message::Peers { peers } => {
                self.on_peers(peers);
                Ok(Flow::Continue)
            }
            Message::ChainSummary { height, tip_hash } => {
                debug!("[{}] remote height {height} tip {tip_hash}", self.peer);
                let local = self.ctx.node.height();
                if let Some(req) = self.sync.on_chain_summary(height, local) {
                    send(stream, &req).await?;
                }
                Ok(Flow::Continue)
            }
            Message::Inv { obj_type, hashes } => {
                match obj_type {
                    InvType::Block => {
                        let unknown = hashes
                            .iter()
                            .filter(|h| !self.ctx.node.contains_block(h))
                            .count();
                        let local = self.ctx.node.height();
                        if let Some(req) = self.sync.on_inv(unknown, local) {
                            send(stream, &req).await?;
                        }
                    }
                }
                Ok(Flow::Continue)
            }
            Message::GetBlocks { from_height, max } => {
                let max = max.min(self.ctx.config.sync_batch) as usize;
                let blocks = self.ctx.node.blocks_from(from_height, max);
                debug!(
                    "[{}] serving {} blocks from #{from_height}",
                    self.peer,
                    blocks.len()
                );
                for block in blocks {
                    send(stream, &Message::Block { block: Box::new(block) }).await?;
                }
                // closes the batch on the requesting side
                send(stream, &self.chain_summary()).await?;
                Ok(Flow::Continue)
            }
            Message::Block { block } => {
                self.on_block(stream, *block).await?;
                Ok(Flow::Continue)
            }
            Message::Error { message } => {
                warn!("[{}] peer reported error: {message}", self.peer);
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_hello(
        &mut self,
        stream: &mut PeerStream,
        node_id: String,
        network_id: String,
        protocol_version: u32,
        listen_addr: Option<String>,
    ) -> io::Result<Flow> {
        if self.remote_node.is_some() {
            debug!("[{}] duplicate HELLO ignored", self.peer);
            return Ok(Flow::Continue);
        }

        let config = &self.ctx.config;
        let mismatch = if network_id != config.network_id {
            Some(ProtocolError::NetworkMismatch {
                expected: config.network_id.clone(),
                got: network_id,
            })
        } else if protocol_version != PROTOCOL_VERSION {
            Some(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            })
        } else {
            None
        };
        if let Some(e) = mismatch {
            warn!("[{}] rejecting handshake: {e}", self.peer);
            send(stream, &Message::error(e.to_string())).await?;
            self.forget_dialed();
            return Ok(Flow::Close);
        }

        if node_id == config.node_id {
            debug!("[{}] connected to ourselves, closing", self.peer);
            self.forget_dialed();
            return Ok(Flow::Close);
        }

        self.ctx
            .node
            .peers()
            .identify_session(self.id, &node_id, listen_addr.clone());
        info!("[{}] handshake complete with node {node_id}", self.peer);
        self.remote_node = Some(node_id);
        self.remote_listen = listen_addr;

        let peers = self.ctx.node.peers();
        let sample = peers.sample(peers.max_peers(), self.remote_listen.as_deref());
        send(stream, &Message::Peers { peers: sample }).await?;
        send(stream, &self.chain_summary()).await?;
        Ok(Flow::Continue)
    }

    /// Stop redialing an address that turned out to be unusable.
    fn forget_dialed(&self) {
        if let Some(addr) = &self.dialed {
            self.ctx.node.peers().remove(addr);
        }
    }

    fn on_peers(&self, peers: Vec<String>) {
        let book = self.ctx.node.peers();
        for addr in peers.iter().take(book.max_peers()) {
            if Some(addr) == self.remote_listen.as_ref() || *addr == self.ctx.advertised {
                continue;
            }
            if book.learn(addr) {
                debug!("[{}] learned peer {addr}", self.peer);
            }
        }
    }

    async fn on_block(&mut self, stream: &mut PeerStream, block: Block) -> io::Result<()> {
        let index = block.index;
        // validation failures stay inside the session
        let result = self.ctx.node.accept_peer_block(block, self.id);
        match &result {
            Ok(()) => debug!("[{}] accepted block #{index}", self.peer),
            Err(LedgerError::StaleBlock { .. }) => {
                debug!("[{}] already have block #{index}", self.peer)
            }
            Err(e) => warn!("[{}] block #{index} not accepted: {e}", self.peer),
        }
        let local = self.ctx.node.height();
        if let Some(req) = self.sync.on_block_result(index, &result, local) {
            send(stream, &req).await?;
        }
        Ok(())
    }
}

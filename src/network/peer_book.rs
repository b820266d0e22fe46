use log::debug;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use super::message::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("invalid peer address '{0}', expected host:port")]
    InvalidAddress(String),
    #[error("peer limit of {0} reached")]
    LimitReached(usize),
}

/// Instructions for a live session task.
#[derive(Debug)]
pub enum SessionCommand {
    Send(Message),
    Close,
}

#[derive(Debug)]
struct SessionEntry {
    /// Address we dialed, for outbound sessions.
    dialed: Option<String>,
    /// Address the remote advertised in HELLO.
    listen_addr: Option<String>,
    node_id: Option<String>,
    outbox: mpsc::Sender<SessionCommand>,
}

#[derive(Debug, Default)]
struct BookState {
    /// Configured or learned peers, each with the generation of its connector.
    known: HashMap<String, u64>,
    sessions: HashMap<u64, SessionEntry>,
    dialer: Option<mpsc::UnboundedSender<(String, u64)>>,
    own_addr: Option<String>,
    generation: u64,
}

/// Known peer addresses plus the registry of live sessions.
#[derive(Debug)]
pub struct PeerBook {
    max_peers: usize,
    state: Mutex<BookState>,
    next_session: AtomicU64,
}

fn is_peer_address(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0),
        None => false,
    }
}

impl PeerBook {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            state: Mutex::new(BookState::default()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Hook up the network's dial queue. Peers added before this are dialed
    /// right away.
    pub fn attach_dialer(&self, dialer: mpsc::UnboundedSender<(String, u64)>, own_addr: String) {
        let mut state = self.state.lock();
        for (addr, generation) in &state.known {
            let _ = dialer.send((addr.clone(), *generation));
        }
        state.dialer = Some(dialer);
        state.own_addr = Some(own_addr);
    }

    /// Add a peer and start dialing it. `Ok(false)` when already known.
    pub fn add(&self, addr: &str) -> Result<bool, PeerError> {
        let addr = addr.trim();
        if !is_peer_address(addr) {
            return Err(PeerError::InvalidAddress(addr.to_string()));
        }
        let mut state = self.state.lock();
        if state.own_addr.as_deref() == Some(addr) || state.known.contains_key(addr) {
            return Ok(false);
        }
        if state.known.len() >= self.max_peers {
            return Err(PeerError::LimitReached(self.max_peers));
        }
        state.generation += 1;
        let generation = state.generation;
        state.known.insert(addr.to_string(), generation);
        if let Some(dialer) = &state.dialer {
            let _ = dialer.send((addr.to_string(), generation));
        }
        debug!("Peer {addr} added (known: {})", state.known.len());
        Ok(true)
    }

    /// Opportunistic add for addresses gossiped in PEERS; never errors.
    pub fn learn(&self, addr: &str) -> bool {
        self.add(addr).unwrap_or(false)
    }

    /// Forget a peer and close every session tied to its address.
    pub fn remove(&self, addr: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.known.remove(addr).is_some();
        for entry in state.sessions.values() {
            let matches = entry.dialed.as_deref() == Some(addr)
                || entry.listen_addr.as_deref() == Some(addr);
            if matches {
                let _ = entry.outbox.try_send(SessionCommand::Close);
            }
        }
        removed
    }

    pub fn list(&self) -> Vec<String> {
        let state = self.state.lock();
        let sorted: BTreeSet<&String> = state.known.keys().collect();
        sorted.into_iter().cloned().collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.state.lock().known.contains_key(addr)
    }

    /// True while the connector started for `generation` should keep going.
    pub fn is_current(&self, addr: &str, generation: u64) -> bool {
        self.state.lock().known.get(addr) == Some(&generation)
    }

    /// Random sample of dialable addresses, known peers and advertised
    /// listen addresses of live sessions alike.
    pub fn sample(&self, n: usize, exclude: Option<&str>) -> Vec<String> {
        let state = self.state.lock();
        let candidates: BTreeSet<&String> = state
            .known
            .keys()
            .chain(state.sessions.values().filter_map(|s| s.listen_addr.as_ref()))
            .filter(|a| Some(a.as_str()) != exclude)
            .collect();
        candidates
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), n)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_session(
        &self,
        id: u64,
        dialed: Option<String>,
        outbox: mpsc::Sender<SessionCommand>,
    ) {
        self.state.lock().sessions.insert(
            id,
            SessionEntry {
                dialed,
                listen_addr: None,
                node_id: None,
                outbox,
            },
        );
    }

    /// Record who the remote said it was, after a successful HELLO.
    pub fn identify_session(&self, id: u64, node_id: &str, listen_addr: Option<String>) {
        if let Some(entry) = self.state.lock().sessions.get_mut(&id) {
            entry.node_id = Some(node_id.to_string());
            entry.listen_addr = listen_addr;
        }
    }

    /// Node ids of sessions that completed the handshake.
    pub fn connected_nodes(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .sessions
            .values()
            .filter_map(|s| s.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn unregister_session(&self, id: u64) {
        self.state.lock().sessions.remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Queue `msg` on every identified session except `except`. Full
    /// outboxes drop the message.
    pub fn broadcast(&self, msg: &Message, except: Option<u64>) -> usize {
        let state = self.state.lock();
        let mut sent = 0;
        for (id, entry) in &state.sessions {
            if Some(*id) == except || entry.node_id.is_none() {
                continue;
            }
            if entry
                .outbox
                .try_send(SessionCommand::Send(msg.clone()))
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }
}

//! The sync manager actor
//!
//! One thread owns the chain and the pending pool. Everything else (peer
//! reader threads, the miner, the ticker, the listener and the node handle)
//! talks to it through a single `SyncEvent` channel, so no lock ever guards
//! consensus state. After every change the manager publishes a fresh snapshot
//! to the `ChainView`, persists the chain and tells its peers about the new
//! tip.

use crate::config::Config;
use crate::core::{
    Block, CancelToken, Chain, ChainView, ForkChoice, ForkDecision, MiningOutcome, PageRecord,
    Reorg, Validator,
};
use crate::error::{LedgerError, Result};
use crate::mining::{MiningBackend, MiningJob};
use crate::network::connection::{dial, spawn_connection};
use crate::network::message::{Handshake, Message};
use crate::network::peer::{ConnectionState, Direction, PeerHandle, PeerId, PeerInfo, PeerSummary};
use crate::network::protocol::{MAX_BLOCKS_PER_RESPONSE, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use crate::storage::{ChainStore, PeerStore, PendingPool};
use crate::utils::{current_timestamp, Hash};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Message tag plus the vector length prefix of a `ChainResponse`.
const RESPONSE_OVERHEAD: usize = 16;

/// Everything the sync manager reacts to.
#[derive(Debug)]
pub enum SyncEvent {
    /// A TCP connection was accepted or a dial succeeded.
    Connected {
        stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    },
    DialFailed {
        addr: SocketAddr,
        error: String,
    },
    PeerMessage {
        peer: PeerId,
        message: Message,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: String,
    },
    MiningResult {
        job_id: u64,
        outcome: MiningOutcome,
    },
    SubmitPages {
        records: Vec<PageRecord>,
    },
    Connect {
        addr: SocketAddr,
    },
    Tick,
    Status {
        reply: Sender<NodeStatus>,
    },
    Shutdown,
}

/// The part of the node configuration the sync manager needs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub node_id: String,
    pub listen_addr: SocketAddr,
    pub mining_enabled: bool,
    pub max_records_per_block: usize,
    pub max_peers: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub socket_timeout: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Result<SyncSettings> {
        Ok(SyncSettings {
            node_id: config.node_id.clone(),
            listen_addr: config.listen_socket_addr()?,
            mining_enabled: config.mining_enabled,
            max_records_per_block: config.max_records_per_block,
            max_peers: config.max_peers,
            chunk_size: config.chunk_size,
            max_retries: config.max_retries,
            socket_timeout: config.socket_timeout(),
        })
    }
}

/// Point-in-time report of a running node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub listen_addr: String,
    pub chain_height: u64,
    pub tip_hash: String,
    pub pending_records: usize,
    pub mining: bool,
    pub syncing: bool,
    pub peers: Vec<PeerSummary>,
}

/// The job currently handed to the miner.
#[derive(Debug)]
struct InFlightJob {
    job_id: u64,
    parent: Hash,
    records: Vec<PageRecord>,
    cancel: CancelToken,
}

/// Blocks being pulled from one peer that claims a higher chain.
#[derive(Debug)]
struct BackfillSession {
    peer: PeerId,
    target_height: u64,
    /// Index the buffered blocks start at; everything below comes from the
    /// local chain.
    start_index: u64,
    step_back: u64,
    blocks: Vec<Block>,
    last_activity: Instant,
}

pub struct SyncManager {
    settings: SyncSettings,
    chain: Arc<Chain>,
    pool: PendingPool,
    validator: Validator,
    view: ChainView,
    events: Sender<SyncEvent>,
    peers: HashMap<PeerId, PeerInfo>,
    next_peer_id: PeerId,
    miner: Box<dyn MiningBackend>,
    in_flight: Option<InFlightJob>,
    next_job_id: u64,
    backfill: Option<BackfillSession>,
    store: Option<Box<dyn ChainStore>>,
    peer_store: Option<PeerStore>,
    threads: Vec<JoinHandle<()>>,
    pending_dials: HashSet<SocketAddr>,
}

impl SyncManager {
    pub fn new(
        settings: SyncSettings,
        chain: Arc<Chain>,
        validator: Validator,
        view: ChainView,
        events: Sender<SyncEvent>,
        miner: Box<dyn MiningBackend>,
    ) -> SyncManager {
        SyncManager {
            settings,
            chain,
            pool: PendingPool::new(),
            validator,
            view,
            events,
            peers: HashMap::new(),
            next_peer_id: 1,
            miner,
            in_flight: None,
            next_job_id: 1,
            backfill: None,
            store: None,
            peer_store: None,
            threads: Vec::new(),
            pending_dials: HashSet::new(),
        }
    }

    pub fn with_chain_store(mut self, store: Box<dyn ChainStore>) -> SyncManager {
        self.store = Some(store);
        self
    }

    pub fn with_peer_store(mut self, peer_store: PeerStore) -> SyncManager {
        self.peer_store = Some(peer_store);
        self
    }

    /// Processes events until a `Shutdown` arrives, then tears everything down
    /// and hands back the final chain.
    pub fn run(mut self, inbox: Receiver<SyncEvent>) -> Chain {
        info!(
            "Sync manager for node {} started at height {}",
            self.settings.node_id,
            self.chain.height()
        );
        while let Ok(event) = inbox.recv() {
            if !self.handle_event(event) {
                break;
            }
        }
        self.shutdown()
    }

    /// Handles one event. Returns false once the manager should stop.
    pub fn handle_event(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::Connected {
                stream,
                addr,
                direction,
            } => self.on_connected(stream, addr, direction),
            SyncEvent::DialFailed { addr, error } => self.on_dial_failed(addr, &error),
            SyncEvent::PeerMessage { peer, message } => self.on_peer_message(peer, message),
            SyncEvent::PeerDisconnected { peer, reason } => self.drop_peer(peer, &reason),
            SyncEvent::MiningResult { job_id, outcome } => self.on_mining_result(job_id, outcome),
            SyncEvent::SubmitPages { records } => self.submit_pages(records),
            SyncEvent::Connect { addr } => self.connect(addr),
            SyncEvent::Tick => self.on_tick(),
            SyncEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SyncEvent::Shutdown => return false,
        }
        true
    }

    pub fn status(&self) -> NodeStatus {
        let mut peers: Vec<PeerSummary> = self.peers.values().map(PeerInfo::summary).collect();
        peers.sort_by_key(|peer| peer.id);
        NodeStatus {
            node_id: self.settings.node_id.clone(),
            listen_addr: self.settings.listen_addr.to_string(),
            chain_height: self.chain.height(),
            tip_hash: self.chain.tip_hash().to_hex(),
            pending_records: self.pool.len(),
            mining: self.in_flight.is_some(),
            syncing: self.backfill.is_some(),
            peers,
        }
    }

    /// Adds a peer whose connection threads are already running and sends it
    /// our handshake.
    pub fn register_peer(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        handle: PeerHandle,
    ) -> PeerId {
        let id = self.allocate_peer_id();
        self.insert_peer(id, addr, direction, handle);
        id
    }

    fn allocate_peer_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        id
    }

    fn insert_peer(&mut self, id: PeerId, addr: SocketAddr, direction: Direction, handle: PeerHandle) {
        let mut peer = PeerInfo::new(id, addr, direction, handle);
        if !peer.send(self.handshake()) {
            warn!("Peer {id} ({addr}) went away before the handshake");
        }
        if let Err(e) = peer.transition(ConnectionState::Handshaking) {
            warn!("{e}");
        }
        self.peers.insert(id, peer);
    }

    fn handshake(&self) -> Message {
        Message::Handshake(Handshake {
            node_id: self.settings.node_id.clone(),
            chain_height: self.chain.height(),
            tip_hash: self.chain.tip_hash(),
            protocol_version: PROTOCOL_VERSION,
            listen_port: self.settings.listen_addr.port(),
        })
    }

    fn on_connected(&mut self, stream: TcpStream, addr: SocketAddr, direction: Direction) {
        if direction == Direction::Outbound {
            self.pending_dials.remove(&addr);
        }
        if self.peers.len() >= self.settings.max_peers {
            info!("Refusing connection with {addr}: peer limit reached");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let id = self.allocate_peer_id();
        match spawn_connection(id, stream, self.events.clone(), self.settings.socket_timeout) {
            Ok((handle, threads)) => {
                self.threads.extend(threads);
                self.insert_peer(id, addr, direction, handle);
                info!("Peer {id} connected ({addr}, {direction:?})");
            }
            Err(e) => warn!("Could not start connection with {addr}: {e}"),
        }
    }

    fn on_dial_failed(&mut self, addr: SocketAddr, error: &str) {
        self.pending_dials.remove(&addr);
        warn!("Failed to connect to {addr}: {error}");
        if let Some(store) = &self.peer_store {
            match store.record_failure(&addr) {
                Ok(failures) => debug!("{addr} has failed {failures} times"),
                Err(e) => warn!("Peer store: {e}"),
            }
        }
    }

    fn drop_peer(&mut self, id: PeerId, reason: &str) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        let _ = peer.transition(ConnectionState::Disconnected);
        peer.close();
        info!("Peer {id} ({}) disconnected: {reason}", peer.addr);

        if self.backfill.as_ref().is_some_and(|session| session.peer == id) {
            info!("Abandoning chain download from peer {id}");
            self.backfill = None;
            self.maybe_start_mining();
        }
    }

    fn on_peer_message(&mut self, id: PeerId, message: Message) {
        let Some(peer) = self.peers.get(&id) else {
            debug!("Dropping {} from unknown peer {id}", message.kind());
            return;
        };
        debug!("Peer {id}: received {}", message.kind());

        let result = match peer.state() {
            ConnectionState::Handshaking => match message {
                Message::Handshake(handshake) => self.on_handshake(id, handshake),
                other => Err(LedgerError::Protocol(format!(
                    "Expected handshake, got {}",
                    other.kind()
                ))),
            },
            _ => self.dispatch(id, message),
        };

        if let Err(e) = result {
            if e.is_protocol() {
                warn!("Peer {id}: {e}");
                self.drop_peer(id, &e.to_string());
            } else {
                error!("Peer {id}: {e}");
            }
        }
    }

    fn dispatch(&mut self, id: PeerId, message: Message) -> Result<()> {
        match message {
            Message::Handshake(_) => Err(LedgerError::Protocol(
                "Unexpected second handshake".to_string(),
            )),
            Message::PeerListRequest => {
                let addresses = self
                    .peers
                    .values()
                    .filter(|peer| peer.id != id && peer.state().is_active())
                    .filter_map(PeerInfo::listen_addr)
                    .map(|addr| addr.to_string())
                    .collect();
                self.send_to(id, Message::PeerListResponse { addresses });
                Ok(())
            }
            Message::PeerListResponse { addresses } => {
                self.on_peer_list(addresses);
                Ok(())
            }
            Message::ChainHeightQuery => {
                self.send_to(
                    id,
                    Message::ChainHeightResponse {
                        height: self.chain.height(),
                        tip_hash: self.chain.tip_hash(),
                    },
                );
                Ok(())
            }
            Message::ChainHeightResponse { height, tip_hash } => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.awaiting_height = false;
                    peer.height = height;
                    peer.tip_hash = tip_hash;
                }
                self.compare_heights(id, height, tip_hash);
                Ok(())
            }
            Message::BlockAnnounce { block } => {
                self.on_block_announce(id, block);
                Ok(())
            }
            Message::ChainRequest { from_index } => {
                let blocks = self.response_chunk(from_index)?;
                debug!("Serving {} blocks from {from_index} to peer {id}", blocks.len());
                self.send_to(id, Message::ChainResponse { blocks });
                Ok(())
            }
            Message::ChainResponse { blocks } => self.on_chain_response(id, blocks),
        }
    }

    /// Up to `chunk_size` blocks from `from_index` that fit in one frame
    /// together. The requester asks again from where the chunk ends.
    fn response_chunk(&self, from_index: u64) -> Result<Vec<Block>> {
        let budget = MAX_PAYLOAD_LEN - RESPONSE_OVERHEAD;
        let mut used = 0;
        let mut blocks = Vec::new();
        for block in self.chain.blocks_from(from_index).iter().take(self.settings.chunk_size) {
            let size = block.serialize()?.len();
            if used + size > budget {
                if blocks.is_empty() {
                    warn!("Block {} does not fit in a frame", block.get_index());
                }
                break;
            }
            used += size;
            blocks.push(block.clone());
        }
        Ok(blocks)
    }

    fn send_to(&self, id: PeerId, message: Message) {
        if let Some(peer) = self.peers.get(&id) {
            if !peer.send(message) {
                debug!("Peer {id}: writer already gone");
            }
        }
    }

    fn on_handshake(&mut self, id: PeerId, handshake: Handshake) -> Result<()> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(LedgerError::Protocol(format!(
                "Protocol version {} is not supported (expected {PROTOCOL_VERSION})",
                handshake.protocol_version
            )));
        }
        let (direction, addr) = match self.peers.get(&id) {
            Some(peer) => (peer.direction, peer.addr),
            None => return Ok(()),
        };

        if handshake.node_id == self.settings.node_id {
            if direction == Direction::Outbound {
                if let Some(store) = &self.peer_store {
                    let _ = store.remove(&addr);
                }
            }
            return Err(LedgerError::Protocol("Connected to ourselves".to_string()));
        }

        let existing = self
            .peers
            .values()
            .find(|peer| peer.id != id && peer.node_id.as_deref() == Some(handshake.node_id.as_str()))
            .map(|peer| peer.id);
        if let Some(existing) = existing {
            // Both ends keep the connection dialed by the lower node id.
            let preferred = if self.settings.node_id < handshake.node_id {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            if direction != preferred {
                return Err(LedgerError::Protocol(format!(
                    "Already connected to node {}",
                    handshake.node_id
                )));
            }
            self.drop_peer(existing, "replaced by a duplicate connection");
        }

        let listen_addr = match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.node_id = Some(handshake.node_id.clone());
                peer.listen_port = Some(handshake.listen_port);
                peer.height = handshake.chain_height;
                peer.tip_hash = handshake.tip_hash;
                peer.transition(ConnectionState::Synced)?;
                peer.send(Message::PeerListRequest);
                peer.listen_addr()
            }
            None => return Ok(()),
        };
        info!(
            "Handshake with peer {id} done: node {} at height {}",
            handshake.node_id, handshake.chain_height
        );

        if let (Some(store), Some(listen_addr)) = (&self.peer_store, listen_addr) {
            if let Err(e) = store.add(&listen_addr).and_then(|_| store.record_success(&listen_addr)) {
                warn!("Peer store: {e}");
            }
        }

        self.compare_heights(id, handshake.chain_height, handshake.tip_hash);
        Ok(())
    }

    fn compare_heights(&mut self, id: PeerId, height: u64, tip_hash: Hash) {
        let local_height = self.chain.height();
        if height > local_height {
            self.start_backfill(id, height);
            return;
        }
        self.set_peer_state(id, ConnectionState::Synced);
        if height == local_height && tip_hash != self.chain.tip_hash() {
            info!(
                "Peer {id} is on a competing fork at height {height} ({} vs our {})",
                tip_hash.short(),
                self.chain.tip_hash().short()
            );
        }
    }

    /// Moves an active peer between `Synced` and `Stale`.
    fn set_peer_state(&mut self, id: PeerId, state: ConnectionState) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if peer.state().is_active() && peer.state() != state {
                debug!("Peer {id}: {} -> {state}", peer.state());
                let _ = peer.transition(state);
            }
        }
    }

    /// Stale peers whose height we have reached are in sync again.
    fn resync_caught_up_peers(&mut self) {
        let height = self.chain.height();
        for peer in self.peers.values_mut() {
            if peer.state() == ConnectionState::Stale && peer.height <= height {
                let _ = peer.transition(ConnectionState::Synced);
            }
        }
    }

    fn on_peer_list(&mut self, addresses: Vec<String>) {
        for address in addresses {
            let addr: SocketAddr = match address.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    debug!("Ignoring unparsable peer address {address}");
                    continue;
                }
            };
            if let Some(store) = &self.peer_store {
                if let Err(e) = store.add(&addr) {
                    warn!("Peer store: {e}");
                }
            }
            self.connect(addr);
        }
    }

    fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.peers
            .values()
            .any(|peer| peer.addr == *addr || peer.listen_addr().as_ref() == Some(addr))
    }

    fn connect(&mut self, addr: SocketAddr) {
        if addr == self.settings.listen_addr
            || self.pending_dials.contains(&addr)
            || self.is_connected_to(&addr)
        {
            return;
        }
        if self.peers.len() + self.pending_dials.len() >= self.settings.max_peers {
            debug!("Not dialing {addr}: peer limit reached");
            return;
        }
        if let Some(store) = &self.peer_store {
            if let Err(e) = store.add(&addr) {
                warn!("Peer store: {e}");
            }
        }

        match dial(addr, self.events.clone(), self.settings.socket_timeout) {
            Ok(handle) => {
                debug!("Dialing {addr}");
                self.pending_dials.insert(addr);
                self.threads.push(handle);
            }
            Err(e) => warn!("Could not dial {addr}: {e}"),
        }
    }

    fn on_block_announce(&mut self, id: PeerId, block: Block) {
        let hash = block.hash();
        if self.chain.contains_hash(&hash) {
            debug!("Block {} from peer {id} already known", hash.short());
            return;
        }

        let index = block.get_index();
        if let Some(peer) = self.peers.get_mut(&id) {
            if index > peer.height {
                peer.height = index;
                peer.tip_hash = hash;
            }
        }

        let height = self.chain.height();
        if index == height + 1 && block.get_previous_hash() == self.chain.tip_hash() {
            match self.validator.validate_extension(&self.chain, &block) {
                Ok(()) => {
                    info!("Accepted block {index} ({}) from peer {id}", hash.short());
                    self.accept_block(block, Some(id));
                }
                Err(e) => warn!("Rejecting block announced by peer {id}: {e}"),
            }
        } else if index > height {
            self.start_backfill(id, index);
        } else {
            debug!("Ignoring block {index} from peer {id}: does not extend height {height}");
        }
    }

    /// Appends a validated block onto the tip.
    fn accept_block(&mut self, block: Block, source: Option<PeerId>) {
        self.cancel_mining("the tip moved");

        let records = block.get_records().to_vec();
        if let Err(e) = Arc::make_mut(&mut self.chain).append(block) {
            error!("Could not append validated block: {e}");
            return;
        }
        self.pool.remove_mined(&records);
        self.chain_changed();
        self.resync_caught_up_peers();
        self.broadcast_tip(source);
        self.maybe_start_mining();
    }

    fn apply_reorg(&mut self, reorg: Reorg, source: PeerId) {
        let Reorg {
            chain,
            orphaned,
            common_ancestor,
        } = reorg;
        self.cancel_mining("the chain was reorganised");

        let adopted: Vec<PageRecord> = chain
            .blocks_from(common_ancestor + 1)
            .iter()
            .flat_map(|block| block.get_records())
            .cloned()
            .collect();
        info!(
            "Switched to chain of height {} from peer {source}, {} records back in the pool",
            chain.height(),
            orphaned.len()
        );

        self.chain = Arc::new(chain);
        self.pool.requeue_front(orphaned);
        self.pool.remove_mined(&adopted);
        self.chain_changed();
        self.resync_caught_up_peers();
        self.broadcast_tip(Some(source));
    }

    /// Publishes the current chain and saves it.
    fn chain_changed(&self) {
        self.view.publish(Arc::clone(&self.chain));
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.chain) {
                error!("Failed to save chain: {e}");
            }
        }
    }

    fn broadcast_tip(&self, except: Option<PeerId>) {
        let block = self.chain.tip().clone();
        for peer in self.peers.values() {
            if Some(peer.id) == except || !peer.state().is_active() {
                continue;
            }
            peer.send(Message::BlockAnnounce {
                block: block.clone(),
            });
        }
    }

    fn start_backfill(&mut self, id: PeerId, target_height: u64) {
        self.set_peer_state(id, ConnectionState::Stale);
        if let Some(session) = self.backfill.as_mut() {
            if session.peer == id && target_height > session.target_height {
                session.target_height = target_height;
            }
            return;
        }

        self.cancel_mining("downloading a longer chain");
        let start_index = self.chain.height() + 1;
        info!("Peer {id} is at height {target_height}, requesting blocks from {start_index}");
        self.backfill = Some(BackfillSession {
            peer: id,
            target_height,
            start_index,
            step_back: 0,
            blocks: Vec::new(),
            last_activity: Instant::now(),
        });
        self.send_to(
            id,
            Message::ChainRequest {
                from_index: start_index,
            },
        );
    }

    fn on_chain_response(&mut self, id: PeerId, blocks: Vec<Block>) -> Result<()> {
        if blocks.len() > MAX_BLOCKS_PER_RESPONSE {
            return Err(LedgerError::Protocol(format!(
                "Chain response with {} blocks exceeds {MAX_BLOCKS_PER_RESPONSE}",
                blocks.len()
            )));
        }
        let Some(session) = self.backfill.as_mut() else {
            debug!("Unsolicited chain response from peer {id}");
            return Ok(());
        };
        if session.peer != id {
            debug!("Chain response from peer {id} while syncing with {}", session.peer);
            return Ok(());
        }
        session.last_activity = Instant::now();

        let Some(first) = blocks.first() else {
            self.finish_backfill();
            return Ok(());
        };

        if let Some(last) = session.blocks.last() {
            if first.get_index() != last.get_index() + 1
                || first.get_previous_hash() != last.hash()
            {
                return Err(LedgerError::Protocol(format!(
                    "Chain response does not continue at block {}",
                    last.get_index() + 1
                )));
            }
        } else {
            let attaches = first.get_index() == session.start_index
                && self
                    .chain
                    .get(session.start_index - 1)
                    .is_some_and(|parent| parent.hash() == first.get_previous_hash());
            if !attaches {
                if session.start_index <= 1 {
                    warn!("Peer {id} does not share our genesis block, giving up");
                    self.backfill = None;
                    self.maybe_start_mining();
                    return Ok(());
                }
                session.step_back = (session.step_back * 2).max(1);
                session.start_index = session.start_index.saturating_sub(session.step_back).max(1);
                let from_index = session.start_index;
                debug!("Blocks from peer {id} do not attach, stepping back to {from_index}");
                self.send_to(id, Message::ChainRequest { from_index });
                return Ok(());
            }
        }

        session.blocks.extend(blocks);
        let reached = session
            .blocks
            .last()
            .map_or(0, Block::get_index);
        if reached >= session.target_height {
            self.finish_backfill();
        } else {
            self.send_to(
                id,
                Message::ChainRequest {
                    from_index: reached + 1,
                },
            );
        }
        Ok(())
    }

    fn finish_backfill(&mut self) {
        let Some(session) = self.backfill.take() else {
            return;
        };

        if !session.blocks.is_empty() {
            let keep = (session.start_index as usize).min(self.chain.len());
            let mut blocks = self.chain.blocks()[..keep].to_vec();
            blocks.extend(session.blocks);

            match Chain::from_blocks(blocks) {
                Ok(candidate) => match ForkChoice::resolve(&self.chain, candidate, &self.validator) {
                    ForkDecision::Adopt(reorg) => self.apply_reorg(reorg, session.peer),
                    ForkDecision::KeepLocal => {
                        debug!("Keeping local chain after sync with peer {}", session.peer)
                    }
                },
                Err(e) => warn!("Chain from peer {} rejected: {e}", session.peer),
            }
        }

        self.set_peer_state(session.peer, ConnectionState::Synced);
        self.maybe_start_mining();
    }

    fn submit_pages(&mut self, records: Vec<PageRecord>) {
        let mut queued = 0;
        for record in records {
            let (title, page) = record.page_key();
            if !self.validator.check_record(&record) {
                warn!("Rejecting page {page} of '{title}': bad signature or content hash");
                continue;
            }
            if self.chain.contains_page(title, page) {
                info!("Page {page} of '{title}' is already recorded");
                continue;
            }
            if self.pool.add(record) {
                queued += 1;
            }
        }
        info!("Queued {queued} page records, {} pending", self.pool.len());
        self.maybe_start_mining();
    }

    /// Hands the next batch of pending records to the miner, unless it is
    /// busy or a chain download is running.
    fn maybe_start_mining(&mut self) {
        if !self.settings.mining_enabled
            || self.in_flight.is_some()
            || self.backfill.is_some()
            || self.pool.is_empty()
        {
            return;
        }

        let mut records = Vec::new();
        let mut deferred = Vec::new();
        let mut pages = HashSet::new();
        for record in self.pool.take(self.settings.max_records_per_block) {
            let (title, page) = record.page_key();
            if self.chain.contains_page(title, page) {
                debug!("Dropping page {page} of '{title}': already on chain");
            } else if !pages.insert((title.to_string(), page)) {
                // same page twice in one block is invalid, try it next round
                deferred.push(record);
            } else {
                records.push(record);
            }
        }
        self.pool.requeue_front(deferred);
        if records.is_empty() {
            return;
        }

        let difficulty = self.validator.next_difficulty(&self.chain);
        let template = current_timestamp()
            .and_then(|now| Block::new_template(self.chain.tip(), records.clone(), difficulty, now));
        let template = match template {
            Ok(template) => template,
            Err(e) => {
                error!("Could not build block template: {e}");
                self.pool.requeue_front(records);
                return;
            }
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;
        let cancel = CancelToken::new();
        let job = MiningJob {
            job_id,
            template,
            cancel: cancel.clone(),
        };
        match self.miner.submit(job) {
            Ok(()) => {
                debug!("Submitted mining job {job_id} with {} records", records.len());
                self.in_flight = Some(InFlightJob {
                    job_id,
                    parent: self.chain.tip_hash(),
                    records,
                    cancel,
                });
            }
            Err(e) => {
                error!("Miner refused job {job_id}: {e}");
                self.pool.requeue_front(records);
            }
        }
    }

    /// Stops the running job and puts its records back at the front of the
    /// pool.
    fn cancel_mining(&mut self, reason: &str) {
        if let Some(job) = self.in_flight.take() {
            info!("Cancelling mining job {}: {reason}", job.job_id);
            job.cancel.cancel();
            self.pool.requeue_front(job.records);
        }
    }

    fn on_mining_result(&mut self, job_id: u64, outcome: MiningOutcome) {
        let job = match self.in_flight.take() {
            Some(job) if job.job_id == job_id => job,
            other => {
                self.in_flight = other;
                debug!("Discarding result of stale mining job {job_id}");
                return;
            }
        };

        match outcome {
            MiningOutcome::Found(block) => {
                if job.parent != self.chain.tip_hash() {
                    self.pool.requeue_front(job.records);
                } else {
                    match self.validator.validate_extension(&self.chain, &block) {
                        Ok(()) => {
                            info!(
                                "Mined block {} ({}) with {} records",
                                block.get_index(),
                                block.hash().short(),
                                block.get_records().len()
                            );
                            self.accept_block(block, None);
                        }
                        Err(e) => warn!(
                            "Mined block failed validation, dropping {} records: {e}",
                            job.records.len()
                        ),
                    }
                }
            }
            MiningOutcome::Cancelled => self.pool.requeue_front(job.records),
        }
        self.maybe_start_mining();
    }

    fn on_tick(&mut self) {
        let expired = self.backfill.as_ref().is_some_and(|session| {
            session.last_activity.elapsed() > self.settings.socket_timeout
        });
        if expired {
            warn!("Chain download timed out");
            self.backfill = None;
            self.maybe_start_mining();
        }

        for peer in self.peers.values_mut() {
            if !peer.state().is_active() {
                continue;
            }
            if peer.awaiting_height {
                debug!("Peer {} did not answer the last height query", peer.id);
            }
            if peer.send(Message::ChainHeightQuery) {
                peer.awaiting_height = true;
            }
        }

        let retry = match &self.peer_store {
            Some(store) => store.retryable(self.settings.max_retries),
            None => Ok(Vec::new()),
        };
        match retry {
            Ok(addrs) => {
                for addr in addrs {
                    self.connect(addr);
                }
            }
            Err(e) => warn!("Peer store: {e}"),
        }

        self.threads.retain(|handle| !handle.is_finished());
    }

    fn shutdown(mut self) -> Chain {
        info!("Sync manager shutting down");
        self.cancel_mining("shutting down");
        self.miner.shutdown();

        for (_, mut peer) in self.peers.drain() {
            let _ = peer.transition(ConnectionState::Disconnected);
            peer.close();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("A connection thread panicked");
            }
        }

        self.chain_changed();
        if let Some(store) = &self.peer_store {
            if let Err(e) = store.flush() {
                warn!("Peer store: {e}");
            }
        }

        Arc::try_unwrap(self.chain).unwrap_or_else(|shared| (*shared).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{build_chain, mined_child, record};
    use crate::core::{genesis_block, DifficultyPolicy, ProofOfWork};
    use std::sync::mpsc;
    use std::sync::Mutex;

    const DIFFICULTY: u32 = 8;

    #[derive(Clone, Default)]
    struct FakeMiner {
        jobs: Arc<Mutex<Vec<MiningJob>>>,
    }

    impl FakeMiner {
        fn jobs(&self) -> Vec<MiningJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl MiningBackend for FakeMiner {
        fn submit(&mut self, job: MiningJob) -> Result<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            node_id: "local".to_string(),
            listen_addr: "127.0.0.1:2001".parse().unwrap(),
            mining_enabled: true,
            max_records_per_block: 10,
            max_peers: 8,
            chunk_size: 50,
            max_retries: 3,
            socket_timeout: Duration::from_secs(5),
        }
    }

    fn manager_with(chain: Chain) -> (SyncManager, FakeMiner) {
        let miner = FakeMiner::default();
        let (events, _inbox) = mpsc::channel();
        let chain = Arc::new(chain);
        let view = ChainView::new(Arc::clone(&chain));
        let manager = SyncManager::new(
            settings(),
            chain,
            Validator::structural(DifficultyPolicy::Fixed(DIFFICULTY)),
            view,
            events,
            Box::new(miner.clone()),
        );
        (manager, miner)
    }

    fn handshaked_peer(
        manager: &mut SyncManager,
        node_id: &str,
        port: u16,
        height: u64,
        tip_hash: Hash,
    ) -> (PeerId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let id = manager.register_peer(addr, Direction::Inbound, PeerHandle::detached(tx));
        manager.handle_event(SyncEvent::PeerMessage {
            peer: id,
            message: Message::Handshake(Handshake {
                node_id: node_id.to_string(),
                chain_height: height,
                tip_hash,
                protocol_version: PROTOCOL_VERSION,
                listen_port: port,
            }),
        });
        (id, rx)
    }

    fn drain(rx: &mpsc::Receiver<Message>) -> Vec<Message> {
        rx.try_iter().collect()
    }

    fn announce(manager: &mut SyncManager, peer: PeerId, block: &Block) {
        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::BlockAnnounce {
                block: block.clone(),
            },
        });
    }

    #[test]
    fn test_handshake_moves_peer_to_synced() {
        let (mut manager, _miner) = manager_with(Chain::new());
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 0, genesis_block().hash());

        let sent = drain(&rx);
        assert!(matches!(sent[0], Message::Handshake(ref h) if h.node_id == "local"));
        assert!(sent.contains(&Message::PeerListRequest));
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Synced);
        assert_eq!(manager.status().peers.len(), 1);
    }

    #[test]
    fn test_message_before_handshake_drops_peer() {
        let (mut manager, _miner) = manager_with(Chain::new());
        let (tx, _rx) = mpsc::channel();
        let addr = "127.0.0.1:4000".parse().unwrap();
        let peer = manager.register_peer(addr, Direction::Inbound, PeerHandle::detached(tx));

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainHeightQuery,
        });
        assert!(manager.peers.is_empty());
    }

    #[test]
    fn test_self_connection_is_dropped() {
        let (mut manager, _miner) = manager_with(Chain::new());
        handshaked_peer(&mut manager, "local", 2001, 0, genesis_block().hash());
        assert!(manager.peers.is_empty());
    }

    #[test]
    fn test_announce_during_mining_requeues_and_restarts_on_new_tip() {
        let base = build_chain(1, DIFFICULTY);
        let (mut manager, miner) = manager_with(base.clone());
        let (peer, _rx) = handshaked_peer(&mut manager, "remote", 4000, 1, base.tip_hash());

        let p1 = record("Pending", 1);
        let p2 = record("Pending", 2);
        manager.handle_event(SyncEvent::SubmitPages {
            records: vec![p1.clone(), p2.clone()],
        });
        let first = miner.jobs().remove(0);
        assert_eq!(first.template.get_previous_hash(), base.tip_hash());
        assert_eq!(first.template.get_records(), &[p1.clone(), p2.clone()]);

        let announced = mined_child(base.tip(), vec![record("Elsewhere", 0)], DIFFICULTY);
        announce(&mut manager, peer, &announced);

        assert!(first.cancel.is_cancelled());
        assert_eq!(manager.chain.tip_hash(), announced.hash());
        assert_eq!(manager.view.height(), 2);

        let jobs = miner.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].template.get_previous_hash(), announced.hash());
        assert_eq!(jobs[1].template.get_records(), &[p1, p2]);

        // the cancelled job finishing late must not touch the chain
        let late = ProofOfWork::solve(first.template.clone());
        manager.handle_event(SyncEvent::MiningResult {
            job_id: first.job_id,
            outcome: MiningOutcome::Found(late),
        });
        assert_eq!(manager.chain.height(), 2);
        assert_eq!(manager.chain.tip_hash(), announced.hash());
        assert_eq!(manager.in_flight.as_ref().map(|job| job.job_id), Some(jobs[1].job_id));
    }

    #[test]
    fn test_mined_block_is_appended_and_announced() {
        let (mut manager, miner) = manager_with(Chain::new());
        let (_peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 0, genesis_block().hash());
        drain(&rx);

        manager.handle_event(SyncEvent::SubmitPages {
            records: vec![record("Mined", 0)],
        });
        let job = miner.jobs().remove(0);
        let block = ProofOfWork::solve(job.template.clone());
        manager.handle_event(SyncEvent::MiningResult {
            job_id: job.job_id,
            outcome: MiningOutcome::Found(block.clone()),
        });

        assert_eq!(manager.chain.tip_hash(), block.hash());
        assert!(manager.pool.is_empty());
        assert!(manager.in_flight.is_none());
        assert!(drain(&rx).contains(&Message::BlockAnnounce { block }));
    }

    #[test]
    fn test_reannounced_block_is_a_noop() {
        let base = build_chain(1, DIFFICULTY);
        let (mut manager, _miner) = manager_with(base.clone());
        let (source, _rx) = handshaked_peer(&mut manager, "source", 4000, 1, base.tip_hash());
        let (_other, other_rx) = handshaked_peer(&mut manager, "other", 4001, 1, base.tip_hash());
        drain(&other_rx);

        let block = mined_child(base.tip(), vec![record("Once", 0)], DIFFICULTY);
        announce(&mut manager, source, &block);
        let after_first = (*manager.chain).clone();
        assert_eq!(drain(&other_rx), vec![Message::BlockAnnounce { block: block.clone() }]);

        announce(&mut manager, source, &block);
        assert_eq!(*manager.chain, after_first);
        assert!(drain(&other_rx).is_empty());
    }

    #[test]
    fn test_equal_height_and_stale_announce_do_not_reorg() {
        let local = build_chain(2, DIFFICULTY);
        let (mut manager, _miner) = manager_with(local.clone());

        let fork_tip = mined_child(genesis_block(), vec![record("Rival", 0)], DIFFICULTY);
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 2, fork_tip.hash());
        announce(&mut manager, peer, &fork_tip);

        assert_eq!(*manager.chain, local);
        assert!(manager.backfill.is_none());
        assert!(!drain(&rx)
            .iter()
            .any(|message| matches!(message, Message::ChainRequest { .. })));
    }

    #[test]
    fn test_invalid_announce_is_dropped() {
        let base = build_chain(1, DIFFICULTY);
        let (mut manager, _miner) = manager_with(base.clone());
        let (peer, _rx) = handshaked_peer(&mut manager, "remote", 4000, 1, base.tip_hash());

        // already-recorded page in an otherwise valid block
        let block = mined_child(base.tip(), vec![record("Doc 1", 0)], DIFFICULTY);
        announce(&mut manager, peer, &block);
        assert_eq!(*manager.chain, base);
        assert!(manager.peers.contains_key(&peer));
    }

    #[test]
    fn test_backfill_steps_back_and_adopts_longer_fork() {
        let local = build_chain(2, DIFFICULTY);
        let mut remote = Chain::from_blocks(local.blocks()[..2].to_vec()).unwrap();
        for i in 2..=4 {
            let block = mined_child(remote.tip(), vec![record(&format!("Fork {i}"), 0)], DIFFICULTY);
            remote.append(block).unwrap();
        }

        let (mut manager, miner) = manager_with(local.clone());
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 4, remote.tip_hash());
        assert!(drain(&rx).contains(&Message::ChainRequest { from_index: 3 }));
        assert!(manager.status().syncing);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainResponse {
                blocks: remote.blocks_from(3).to_vec(),
            },
        });
        assert_eq!(drain(&rx), vec![Message::ChainRequest { from_index: 2 }]);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainResponse {
                blocks: remote.blocks_from(2).to_vec(),
            },
        });

        assert_eq!(*manager.chain, remote);
        assert_eq!(manager.view.snapshot().tip_hash(), remote.tip_hash());
        assert!(manager.backfill.is_none());

        // "Doc 2" only lived on the abandoned branch, so it is mined again
        let jobs = miner.jobs();
        let restarted = jobs.last().unwrap();
        assert_eq!(restarted.template.get_previous_hash(), remote.tip_hash());
        assert_eq!(restarted.template.get_records(), &[record("Doc 2", 0)]);
    }

    #[test]
    fn test_oversized_chain_response_drops_peer() {
        let (mut manager, _miner) = manager_with(Chain::new());
        let (peer, _rx) = handshaked_peer(&mut manager, "remote", 4000, 0, genesis_block().hash());

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainResponse {
                blocks: vec![genesis_block().clone(); MAX_BLOCKS_PER_RESPONSE + 1],
            },
        });
        assert!(!manager.peers.contains_key(&peer));
    }

    #[test]
    fn test_submit_rejects_tampered_and_recorded_pages() {
        let base = build_chain(1, DIFFICULTY);
        let (mut manager, miner) = manager_with(base);

        manager.handle_event(SyncEvent::SubmitPages {
            records: vec![
                record("Doc 1", 0),
                record("Tampered", 0).with_text("Something else entirely."),
            ],
        });
        assert!(manager.pool.is_empty());
        assert!(miner.jobs().is_empty());
    }

    #[test]
    fn test_unanswered_height_query_keeps_peer_synced() {
        let (mut manager, _miner) = manager_with(Chain::new());
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 0, genesis_block().hash());
        drain(&rx);

        manager.handle_event(SyncEvent::Tick);
        assert_eq!(drain(&rx), vec![Message::ChainHeightQuery]);
        manager.handle_event(SyncEvent::Tick);
        assert!(manager.peers[&peer].awaiting_height);
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Synced);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainHeightResponse {
                height: 0,
                tip_hash: genesis_block().hash(),
            },
        });
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Synced);
        assert!(!manager.peers[&peer].awaiting_height);
    }

    #[test]
    fn test_higher_peer_is_stale_until_its_chain_is_adopted() {
        let remote = build_chain(3, DIFFICULTY);
        let (mut manager, _miner) = manager_with(Chain::new());
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 0, genesis_block().hash());
        drain(&rx);
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Synced);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainHeightResponse {
                height: 3,
                tip_hash: remote.tip_hash(),
            },
        });
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Stale);
        assert_eq!(drain(&rx), vec![Message::ChainRequest { from_index: 1 }]);

        // a Stale peer is still served
        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainHeightQuery,
        });
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Stale);
        drain(&rx);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainResponse {
                blocks: remote.blocks_from(1).to_vec(),
            },
        });
        assert_eq!(*manager.chain, remote);
        assert_eq!(manager.peers[&peer].state(), ConnectionState::Synced);
    }

    #[test]
    fn test_higher_handshake_marks_peer_stale() {
        let remote = build_chain(2, DIFFICULTY);
        let (mut manager, _miner) = manager_with(Chain::new());
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 2, remote.tip_hash());

        assert_eq!(manager.peers[&peer].state(), ConnectionState::Stale);
        assert!(drain(&rx).contains(&Message::ChainRequest { from_index: 1 }));
        assert!(manager.status().syncing);
    }

    #[test]
    fn test_chain_response_stays_within_one_frame() {
        use crate::core::chained_content_hash;

        // Three blocks of about 4 MiB each; only two fit under the frame limit.
        let mut chain = Chain::new();
        for i in 1..=3u32 {
            let text = "x".repeat(4 * 1024 * 1024);
            let title = format!("Scan {i}");
            let big = PageRecord::from_parts(
                title.clone(),
                0,
                text.clone(),
                chained_content_hash(&title, 0, &text),
                b"test-signature".to_vec(),
                record("Scan", 0).get_signer().clone(),
                0,
            );
            let block = mined_child(chain.tip(), vec![big], DIFFICULTY);
            chain.append(block).unwrap();
        }
        let tip = chain.tip_hash();
        let (mut manager, _miner) = manager_with(chain);
        let (peer, rx) = handshaked_peer(&mut manager, "remote", 4000, 3, tip);
        drain(&rx);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainRequest { from_index: 1 },
        });
        let sent = drain(&rx);
        let Message::ChainResponse { blocks } = &sent[0] else {
            panic!("expected a chain response, got {sent:?}");
        };
        assert_eq!(blocks.len(), 2);
        assert!(sent[0].encode().unwrap().len() <= MAX_PAYLOAD_LEN);

        manager.handle_event(SyncEvent::PeerMessage {
            peer,
            message: Message::ChainRequest { from_index: 3 },
        });
        assert!(matches!(&drain(&rx)[..], [Message::ChainResponse { blocks }] if blocks.len() == 1));
    }
}

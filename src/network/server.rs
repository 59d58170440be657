use crate::config::Config;
use crate::core::{Chain, ChainView, PageRecord, SignatureVerifier, Validator};
use crate::error::{LedgerError, Result};
use crate::mining::MiningWorker;
use crate::network::peer::Direction;
use crate::network::sync::{NodeStatus, SyncEvent, SyncManager, SyncSettings};
use crate::storage::{ChainStore, FileChainStore, PeerStore};
use log::{error, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to bring a node up. `start` spawns the threads and
/// returns the handle that controls them.
pub struct Server {
    config: Config,
    chain: Chain,
    validator: Validator,
    store: Option<Box<dyn ChainStore>>,
    peer_store: Option<PeerStore>,
}

impl Server {
    pub fn new(config: Config, chain: Chain, validator: Validator) -> Server {
        Server {
            config,
            chain,
            validator,
            store: None,
            peer_store: None,
        }
    }

    /// Opens the stores under `data_dir` (when configured) and loads the saved
    /// chain. A chain file that is corrupt or fails validation is fatal.
    pub fn open(config: Config, verifier: Arc<dyn SignatureVerifier>) -> Result<Server> {
        let validator = Validator::new(verifier, config.difficulty_policy());
        let mut chain = Chain::new();
        let mut store: Option<Box<dyn ChainStore>> = None;
        let mut peer_store = None;

        if let Some(dir) = &config.data_dir {
            fs::create_dir_all(dir)?;
        }
        if let Some(path) = config.chain_file() {
            let file_store = FileChainStore::new(path);
            if let Some(loaded) = file_store.load_validated(&validator)? {
                info!(
                    "Loaded chain of height {} from {}",
                    loaded.height(),
                    file_store.get_path().display()
                );
                chain = loaded;
            }
            store = Some(Box::new(file_store));
        }
        if let Some(path) = config.peer_db_dir() {
            peer_store = Some(PeerStore::open(&path)?);
        }

        let mut server = Server::new(config, chain, validator);
        server.store = store;
        server.peer_store = peer_store;
        Ok(server)
    }

    pub fn with_chain_store(mut self, store: Box<dyn ChainStore>) -> Server {
        self.store = Some(store);
        self
    }

    pub fn with_peer_store(mut self, peer_store: PeerStore) -> Server {
        self.peer_store = Some(peer_store);
        self
    }

    /// Binds the listener and starts the listener, ticker, miner and sync
    /// manager threads, then dials the bootstrap peers.
    pub fn start(self) -> Result<NodeHandle> {
        let Server {
            config,
            chain,
            validator,
            store,
            peer_store,
        } = self;
        let bootstrap = config.bootstrap_addrs()?;

        let listener = TcpListener::bind(&config.listen_addr).map_err(|e| {
            LedgerError::Network(format!("Failed to bind to {}: {e}", config.listen_addr))
        })?;
        listener.set_nonblocking(true)?;
        let listen_addr = listener.local_addr()?;

        let mut settings = SyncSettings::from_config(&config)?;
        settings.listen_addr = listen_addr;

        let (events, inbox) = mpsc::channel();
        let chain = Arc::new(chain);
        let view = ChainView::new(Arc::clone(&chain));

        let mining_events = events.clone();
        let miner = MiningWorker::spawn(move |job_id, outcome| {
            mining_events
                .send(SyncEvent::MiningResult { job_id, outcome })
                .is_ok()
        })?;

        let mut manager = SyncManager::new(
            settings,
            chain,
            validator,
            view.clone(),
            events.clone(),
            Box::new(miner),
        );
        if let Some(store) = store {
            manager = manager.with_chain_store(store);
        }
        if let Some(peer_store) = peer_store {
            manager = manager.with_peer_store(peer_store);
        }
        let sync = thread::Builder::new()
            .name("sync-manager".to_string())
            .spawn(move || manager.run(inbox))
            .map_err(|e| LedgerError::Io(format!("Failed to spawn sync manager: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let listener_thread = spawn_listener(listener, events.clone(), Arc::clone(&stop))?;
        let (ticker_stop, ticker) = spawn_ticker(events.clone(), config.height_query_interval())?;

        for addr in bootstrap {
            let _ = events.send(SyncEvent::Connect { addr });
        }
        info!("Node {} listening on {listen_addr}", config.node_id);

        Ok(NodeHandle {
            node_id: config.node_id,
            listen_addr,
            events,
            view,
            stop,
            ticker_stop: Some(ticker_stop),
            threads: vec![listener_thread, ticker],
            sync: Some(sync),
        })
    }
}

fn spawn_listener(
    listener: TcpListener,
    events: Sender<SyncEvent>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("listener".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nonblocking(false) {
                            warn!("Dropping connection from {addr}: {e}");
                            continue;
                        }
                        let event = SyncEvent::Connected {
                            stream,
                            addr,
                            direction: Direction::Inbound,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL)
                    }
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                }
            }
            info!("Listener stopped");
        })
        .map_err(|e| LedgerError::Io(format!("Failed to spawn listener: {e}")))
}

// Ticks until the returned sender is dropped.
fn spawn_ticker(
    events: Sender<SyncEvent>,
    interval: Duration,
) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("ticker".to_string())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if events.send(SyncEvent::Tick).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        })
        .map_err(|e| LedgerError::Io(format!("Failed to spawn ticker: {e}")))?;
    Ok((stop, handle))
}

/// Control handle of a running node. Dropping it shuts the node down.
pub struct NodeHandle {
    node_id: String,
    listen_addr: SocketAddr,
    events: Sender<SyncEvent>,
    view: ChainView,
    stop: Arc<AtomicBool>,
    ticker_stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    sync: Option<JoinHandle<Chain>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Address the listener is bound to, with the real port when the
    /// configuration asked for port 0.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn chain_view(&self) -> ChainView {
        self.view.clone()
    }

    /// Latest published chain.
    pub fn chain(&self) -> Arc<Chain> {
        self.view.snapshot()
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.send(SyncEvent::Connect { addr })
    }

    /// Queues signed page records for mining.
    pub fn submit_pages(&self, records: Vec<PageRecord>) -> Result<()> {
        self.send(SyncEvent::SubmitPages { records })
    }

    pub fn status(&self) -> Result<NodeStatus> {
        let (reply, answer) = mpsc::channel();
        self.send(SyncEvent::Status { reply })?;
        answer
            .recv_timeout(STATUS_TIMEOUT)
            .map_err(|e| LedgerError::Network(format!("No status from the sync manager: {e}")))
    }

    fn send(&self, event: SyncEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| LedgerError::Network("Node is not running".to_string()))
    }

    /// Stops every thread and returns the final chain. Calling it again just
    /// returns the last published chain.
    pub fn shutdown(&mut self) -> Result<Chain> {
        let Some(sync) = self.sync.take() else {
            return Ok((*self.view.snapshot()).clone());
        };

        self.stop.store(true, Ordering::Relaxed);
        self.ticker_stop.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("A node thread panicked");
            }
        }

        let _ = self.events.send(SyncEvent::Shutdown);
        let chain = sync
            .join()
            .map_err(|_| LedgerError::Io("Sync manager thread panicked".to_string()))?;
        info!("Node {} stopped at height {}", self.node_id, chain.height());
        Ok(chain)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Shutdown failed: {e}");
        }
    }
}

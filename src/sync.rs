//! Chain synchronization manager
//!
//! Tracks connected peers and their reported heights, imports blocks they
//! deliver, and owns the accept-transactions gate that lets remote
//! transactions into the pool once the node has caught up. A background loop
//! syncs with the best peer whenever one connects and on a fixed cycle.

use crate::blockchain::{Block, BlockChain};
use crate::config::SyncMode;
use crate::error::ChainError;
use crate::event::{Event, EventMux};
use crate::p2p::Protocol;
use crate::txpool::{Transaction, TxPool};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ETH62: u32 = 62;
pub const ETH63: u32 = 63;

/// Default interval at which a sync with the best peer is forced.
pub const FORCE_SYNC_CYCLE: Duration = Duration::from_secs(10);

/// Peer sync information
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub id: String,
    pub height: u64,
    pub last_seen: Instant,
    pub blocks_received: u64,
    pub sync_failures: u32,
    pub is_syncing: bool,
}

impl PeerSyncInfo {
    pub fn new(id: String, height: u64) -> Self {
        Self {
            id,
            height,
            last_seen: Instant::now(),
            blocks_received: 0,
            sync_failures: 0,
            is_syncing: false,
        }
    }

    /// Check if peer should be considered unreliable
    pub fn is_unreliable(&self) -> bool {
        self.sync_failures >= 3
    }

    /// Check if peer is stale (not seen in 5 minutes)
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > Duration::from_secs(300)
    }
}

/// Sync state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

pub struct SyncManager {
    mode: SyncMode,
    network_id: u64,
    chain: Arc<BlockChain>,
    txpool: Arc<TxPool>,
    mux: Arc<EventMux>,
    accept_txs: Arc<AtomicBool>,
    max_peers: AtomicUsize,
    peers: RwLock<HashMap<String, PeerSyncInfo>>,
    /// Blocks delivered by peers, waiting for import.
    pending_blocks: Mutex<VecDeque<Block>>,
    state: RwLock<SyncState>,
    progress: RwLock<SyncProgress>,
    sync_cycle: Mutex<Duration>,
    new_peer_tx: Sender<()>,
    new_peer_rx: Receiver<()>,
    quit: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        mode: SyncMode,
        network_id: u64,
        chain: Arc<BlockChain>,
        txpool: Arc<TxPool>,
        mux: Arc<EventMux>,
    ) -> Result<Arc<Self>, ChainError> {
        let mode = match mode {
            SyncMode::Light => {
                return Err(ChainError::Configuration(
                    "light sync is served by the light client, not the full node".to_string(),
                ))
            }
            SyncMode::Fast if chain.current_block().number() > 0 => {
                warn!("Blockchain not empty, fast sync disabled");
                SyncMode::Full
            }
            other => other,
        };
        let (new_peer_tx, new_peer_rx) = unbounded();
        Ok(Arc::new(SyncManager {
            mode,
            network_id,
            chain,
            txpool,
            mux,
            accept_txs: Arc::new(AtomicBool::new(false)),
            max_peers: AtomicUsize::new(0),
            peers: RwLock::new(HashMap::new()),
            pending_blocks: Mutex::new(VecDeque::new()),
            state: RwLock::new(SyncState::Idle),
            progress: RwLock::new(SyncProgress::default()),
            sync_cycle: Mutex::new(FORCE_SYNC_CYCLE),
            new_peer_tx,
            new_peer_rx,
            quit: Mutex::new(None),
            handle: Mutex::new(None),
        }))
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    /// Sub-protocols advertised to peers, newest first.
    pub fn protocols(&self) -> Vec<Protocol> {
        let versions: &[(u32, u64)] = match self.mode {
            SyncMode::Fast => &[(ETH63, 17)],
            _ => &[(ETH63, 17), (ETH62, 8)],
        };
        versions
            .iter()
            .map(|(version, length)| Protocol {
                name: "eth".to_string(),
                version: *version,
                length: *length,
            })
            .collect()
    }

    /// Takes effect on the next `start`.
    pub fn set_sync_cycle(&self, cycle: Duration) {
        *self.sync_cycle.lock() = cycle;
    }

    /// Gate shared with anyone allowed to open it.
    pub fn accept_txs(&self) -> Arc<AtomicBool> {
        self.accept_txs.clone()
    }

    pub fn set_accept_txs(&self, accept: bool) {
        self.accept_txs.store(accept, Ordering::SeqCst);
    }

    pub fn is_accepting_txs(&self) -> bool {
        self.accept_txs.load(Ordering::SeqCst)
    }

    /// Starts the background sync loop with room for `max_peers` peers.
    pub fn start(self: &Arc<Self>, max_peers: usize) -> Result<(), ChainError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(ChainError::Lifecycle("sync manager already started".to_string()));
        }
        self.max_peers.store(max_peers, Ordering::SeqCst);
        let (quit_tx, quit_rx) = bounded::<()>(0);
        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name("syncer".to_string())
            .spawn(move || manager.sync_loop(quit_rx))?;
        *self.quit.lock() = Some(quit_tx);
        *handle = Some(spawned);
        info!("Starting chain sync: mode {:?} max peers {}", self.mode, max_peers);
        Ok(())
    }

    fn sync_loop(&self, quit: Receiver<()>) {
        let force = tick(*self.sync_cycle.lock());
        loop {
            select! {
                recv(self.new_peer_rx) -> _ => self.synchronise(),
                recv(force) -> _ => self.synchronise(),
                recv(quit) -> _ => return,
            }
        }
    }

    pub fn stop(&self) {
        self.quit.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Sync loop panicked");
            }
            info!("Chain sync stopped");
        }
        self.peers.write().clear();
        self.pending_blocks.lock().clear();
    }

    /// Register a peer for synchronization
    pub fn register_peer(&self, id: &str, height: u64) -> Result<(), ChainError> {
        let mut peers = self.peers.write();
        let limit = self.max_peers.load(Ordering::SeqCst);
        if peers.len() >= limit {
            return Err(ChainError::Lifecycle(format!("too many peers ({})", limit)));
        }
        if let std::collections::hash_map::Entry::Vacant(e) = peers.entry(id.to_string()) {
            e.insert(PeerSyncInfo::new(id.to_string(), height));
        } else {
            return Err(ChainError::Lifecycle("Peer already registered".to_string()));
        }
        drop(peers);
        debug!("Peer connected: {} height {}", id, height);
        let _ = self.new_peer_tx.send(());
        Ok(())
    }

    /// Update peer height information
    pub fn update_peer_height(&self, id: &str, height: u64) -> Result<(), ChainError> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| ChainError::Lifecycle("Peer not found".to_string()))?;
        peer.height = height;
        peer.last_seen = Instant::now();
        Ok(())
    }

    pub fn remove_peer(&self, id: &str) -> Result<(), ChainError> {
        self.peers
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ChainError::Lifecycle("Peer not found".to_string()))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_info(&self, id: &str) -> Option<PeerSyncInfo> {
        self.peers.read().get(id).cloned()
    }

    /// Get the best peer to sync from (highest height, no failures)
    pub fn best_peer(&self) -> Option<PeerSyncInfo> {
        self.peers
            .read()
            .values()
            .filter(|p| !p.is_unreliable() && !p.is_stale() && !p.is_syncing)
            .max_by_key(|p| p.height)
            .cloned()
    }

    /// Drops peers not seen for a while.
    pub fn cleanup_stale_peers(&self) {
        self.peers.write().retain(|id, p| {
            let keep = !p.is_stale();
            if !keep {
                debug!("Removing stale peer: {}", id);
            }
            keep
        });
    }

    /// Accepts blocks announced by `id` for the next sync cycle.
    pub fn deliver_blocks(&self, id: &str, blocks: Vec<Block>) -> Result<(), ChainError> {
        let announced = blocks.iter().map(Block::number).max().unwrap_or(0);
        let known = self.peer_info(id).map(|p| p.height).unwrap_or(0);
        self.update_peer_height(id, announced.max(known))?;
        self.pending_blocks.lock().extend(blocks);
        Ok(())
    }

    /// Remote transactions are dropped until the node has synced.
    pub fn handle_transactions(&self, txs: Vec<Transaction>) -> usize {
        if !self.is_accepting_txs() {
            debug!("Dropping {} remote transactions, not yet synced", txs.len());
            return 0;
        }
        txs.into_iter()
            .filter(|tx| match self.txpool.add_remote(tx.clone()) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Rejected remote transaction: {}", e);
                    false
                }
            })
            .count()
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn is_syncing(&self) -> bool {
        self.state() == SyncState::Syncing
    }

    pub fn progress(&self) -> SyncProgress {
        let mut progress = *self.progress.read();
        progress.current_block = self.chain.current_block().number();
        progress
    }

    /// Imports pending blocks from the best peer if it is ahead of us.
    pub fn synchronise(&self) {
        let peer = match self.best_peer() {
            Some(peer) => peer,
            None => return,
        };
        let local = self.chain.current_block().number();
        if peer.height <= local {
            self.pending_blocks.lock().clear();
            return;
        }

        *self.state.write() = SyncState::Syncing;
        *self.progress.write() = SyncProgress {
            starting_block: local,
            current_block: local,
            highest_block: peer.height,
        };
        let _ = self.mux.post(Event::StartSync);
        if let Some(p) = self.peers.write().get_mut(&peer.id) {
            p.is_syncing = true;
        }

        let mut blocks: Vec<Block> = self.pending_blocks.lock().drain(..).collect();
        blocks.sort_by_key(|b| b.number());
        blocks.retain(|b| b.number() > local);

        let result = self.chain.insert_chain(blocks);
        let mut peers = self.peers.write();
        match result {
            Ok(imported) => {
                if let Some(p) = peers.get_mut(&peer.id) {
                    p.blocks_received += imported as u64;
                    p.is_syncing = false;
                    p.last_seen = Instant::now();
                }
                drop(peers);
                *self.state.write() = SyncState::Synced;
                self.set_accept_txs(true);
                info!("Synchronisation completed: imported {} blocks from {}", imported, peer.id);
                let _ = self.mux.post(Event::DoneSync);
            }
            Err(e) => {
                if let Some(p) = peers.get_mut(&peer.id) {
                    p.sync_failures += 1;
                    p.is_syncing = false;
                    if p.is_unreliable() {
                        warn!("Peer {} marked as unreliable", peer.id);
                    }
                }
                drop(peers);
                *self.state.write() = SyncState::Failed;
                warn!("Synchronisation failed: {}", e);
                let _ = self.mux.post(Event::FailedSync(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Header;
    use crate::consensus::{ethash::Ethash, Engine};
    use crate::crypto::Address;
    use crate::genesis::Genesis;
    use crate::persistence::MemoryDatabase;
    use crate::txpool::TxPoolConfig;

    fn manager(mode: SyncMode) -> (Arc<BlockChain>, Arc<EventMux>, Arc<SyncManager>) {
        let db = Arc::new(MemoryDatabase::new());
        let genesis = Genesis::developer_pow();
        genesis.commit(db.as_ref()).unwrap();
        let engine: Arc<dyn Engine> = Arc::new(Ethash::new_faker());
        let chain = Arc::new(BlockChain::new(db, genesis.config, engine).unwrap());
        let pool = Arc::new(TxPool::new(
            TxPoolConfig {
                journal: None,
                ..TxPoolConfig::default()
            },
            1,
        ));
        let mux = Arc::new(EventMux::new());
        let sync = SyncManager::new(mode, 1, chain.clone(), pool, mux.clone()).unwrap();
        (chain, mux, sync)
    }

    fn next_blocks(chain: &BlockChain, count: u64) -> Vec<Block> {
        let mut parent = chain.current_block();
        let mut out = Vec::new();
        for _ in 0..count {
            let block = Block::new(
                Header {
                    parent_hash: parent.hash(),
                    number: parent.number() + 1,
                    timestamp: parent.header.timestamp + 1,
                    ..Header::default()
                },
                vec![],
            );
            out.push(block.clone());
            parent = block;
        }
        out
    }

    fn tx() -> Transaction {
        Transaction {
            nonce: 0,
            gas_price: 10,
            gas: 21_000,
            from: Address([1u8; 20]),
            to: None,
            value: 0,
            data: vec![],
        }
    }

    #[test]
    fn test_register_and_best_peer() {
        let (_chain, _mux, sync) = manager(SyncMode::Full);
        sync.max_peers.store(2, Ordering::SeqCst);
        sync.register_peer("a", 100).unwrap();
        sync.register_peer("b", 200).unwrap();
        assert!(sync.register_peer("a", 1).is_err());
        assert!(sync.register_peer("c", 300).is_err());
        assert_eq!(sync.best_peer().unwrap().id, "b");
    }

    #[test]
    fn test_synchronise_imports_and_opens_gate() {
        let (chain, mux, sync) = manager(SyncMode::Full);
        let events = mux.subscribe();
        sync.max_peers.store(5, Ordering::SeqCst);
        sync.register_peer("a", 0).unwrap();
        assert_eq!(sync.handle_transactions(vec![tx()]), 0);

        sync.deliver_blocks("a", next_blocks(&chain, 3)).unwrap();
        sync.synchronise();

        assert_eq!(chain.current_block().number(), 3);
        assert_eq!(sync.state(), SyncState::Synced);
        assert!(sync.is_accepting_txs());
        assert_eq!(sync.handle_transactions(vec![tx()]), 1);
        assert!(matches!(events.recv().unwrap(), Event::StartSync));
        assert!(matches!(events.recv().unwrap(), Event::DoneSync));
        assert_eq!(sync.progress().highest_block, 3);
    }

    #[test]
    fn test_failed_import_counts_against_peer() {
        let (chain, _mux, sync) = manager(SyncMode::Full);
        sync.max_peers.store(5, Ordering::SeqCst);
        sync.register_peer("bad", 0).unwrap();
        let mut blocks = next_blocks(&chain, 2);
        blocks.remove(0);
        sync.deliver_blocks("bad", blocks).unwrap();
        sync.synchronise();

        assert_eq!(sync.state(), SyncState::Failed);
        assert_eq!(sync.peer_info("bad").unwrap().sync_failures, 1);
        assert!(!sync.is_accepting_txs());
    }

    #[test]
    fn test_light_mode_rejected() {
        let db = Arc::new(MemoryDatabase::new());
        let genesis = Genesis::developer_pow();
        genesis.commit(db.as_ref()).unwrap();
        let chain = Arc::new(BlockChain::new(db, genesis.config, Arc::new(Ethash::new_faker())).unwrap());
        let pool = Arc::new(TxPool::new(
            TxPoolConfig {
                journal: None,
                ..TxPoolConfig::default()
            },
            1,
        ));
        let result = SyncManager::new(SyncMode::Light, 1, chain, pool, Arc::new(EventMux::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_fast_protocols_and_loop_lifecycle() {
        let (_chain, _mux, sync) = manager(SyncMode::Fast);
        assert_eq!(sync.protocols().len(), 1);
        sync.start(10).unwrap();
        assert!(sync.start(10).is_err());
        sync.stop();
        sync.stop();
    }
}

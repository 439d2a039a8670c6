//! Block production
//!
//! A single sealing thread repeatedly builds a block template on the current
//! head, hands it to the consensus engine and imports the sealed result. The
//! miner pauses itself while the node is syncing.

use crate::blockchain::{Block, BlockChain, Header};
use crate::consensus::Engine;
use crate::crypto::{hash_to_hex, Address};
use crate::error::ChainError;
use crate::event::{Event, EventMux};
use crate::params::MAXIMUM_EXTRA_DATA_SIZE;
use crate::txpool::TxPool;
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_millis(250);
const POLL_STEP: Duration = Duration::from_millis(20);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Session {
    abort: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Shared {
    chain: Arc<BlockChain>,
    engine: Arc<dyn Engine>,
    txpool: Arc<TxPool>,
    mux: Arc<EventMux>,
    coinbase: RwLock<Address>,
    extra: RwLock<Vec<u8>>,
}

pub struct Miner {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
    /// Cleared while a sync is in progress.
    can_start: AtomicBool,
    /// Set when `start` was requested during a sync.
    should_start: AtomicBool,
    quit: Mutex<Option<Sender<()>>>,
    update: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(
        chain: Arc<BlockChain>,
        engine: Arc<dyn Engine>,
        txpool: Arc<TxPool>,
        mux: Arc<EventMux>,
    ) -> Arc<Self> {
        let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(0);
        let miner = Arc::new(Miner {
            shared: Arc::new(Shared {
                chain,
                engine,
                txpool,
                mux: mux.clone(),
                coinbase: RwLock::new(Address::zero()),
                extra: RwLock::new(Vec::new()),
            }),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
            can_start: AtomicBool::new(true),
            should_start: AtomicBool::new(false),
            quit: Mutex::new(Some(quit_tx)),
            update: Mutex::new(None),
        });

        let events = mux.subscribe();
        let weak = Arc::downgrade(&miner);
        let handle = thread::Builder::new()
            .name("miner-update".to_string())
            .spawn(move || Self::update_loop(weak, events, quit_rx));
        match handle {
            Ok(handle) => *miner.update.lock() = Some(handle),
            Err(e) => warn!("Failed to spawn miner update loop: {}", e),
        }
        miner
    }

    // Pauses sealing for the duration of the first sync cycle.
    fn update_loop(miner: std::sync::Weak<Miner>, events: Receiver<Event>, quit: Receiver<()>) {
        loop {
            select! {
                recv(events) -> event => {
                    let (event, this) = match (event, miner.upgrade()) {
                        (Ok(event), Some(this)) => (event, this),
                        _ => return,
                    };
                    match event {
                        Event::StartSync => {
                            let was_mining = this.mining();
                            this.can_start.store(false, Ordering::SeqCst);
                            this.stop();
                            if was_mining {
                                this.should_start.store(true, Ordering::SeqCst);
                                info!("Mining aborted due to sync");
                            }
                        }
                        Event::DoneSync | Event::FailedSync(_) => {
                            this.can_start.store(true, Ordering::SeqCst);
                            if this.should_start.swap(false, Ordering::SeqCst) {
                                let coinbase = *this.shared.coinbase.read();
                                this.start(coinbase);
                            }
                            return;
                        }
                        Event::NewMinedBlock(_) => {}
                    }
                }
                recv(quit) -> _ => return,
            }
        }
    }

    /// Starts sealing on top of the current head, crediting `coinbase`.
    pub fn start(&self, coinbase: Address) {
        *self.shared.coinbase.write() = coinbase;
        let mut session = self.session.lock();
        if self.closed.load(Ordering::SeqCst) {
            warn!("Miner is closed, ignoring start request");
            return;
        }
        if !self.can_start.load(Ordering::SeqCst) {
            self.should_start.store(true, Ordering::SeqCst);
            info!("Network syncing, will start miner afterwards");
            return;
        }
        if session.is_some() {
            return;
        }

        let abort = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let flag = abort.clone();
        let spawned = thread::Builder::new()
            .name("miner-seal".to_string())
            .spawn(move || seal_loop(shared, flag));
        match spawned {
            Ok(handle) => {
                info!("Starting mining operation: coinbase {}", coinbase);
                *session = Some(Session { abort, handle });
            }
            Err(e) => warn!("Failed to spawn sealing thread: {}", e),
        }
    }

    /// Stops the sealing thread and waits for it. Idempotent.
    pub fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.abort.store(true, Ordering::SeqCst);
            if session.handle.join().is_err() {
                warn!("Sealing thread panicked");
            }
            info!("Mining stopped");
        }
    }

    /// Stops sealing for good. Later `start` calls are ignored.
    pub fn close(&self) {
        {
            let _session = self.session.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.stop();
        self.quit.lock().take();
        if let Some(handle) = self.update.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn mining(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn coinbase(&self) -> Address {
        *self.shared.coinbase.read()
    }

    pub fn set_etherbase(&self, address: Address) {
        *self.shared.coinbase.write() = address;
    }

    pub fn extra(&self) -> Vec<u8> {
        self.shared.extra.read().clone()
    }

    pub fn set_extra(&self, extra: Vec<u8>) -> Result<(), ChainError> {
        if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(ChainError::Configuration(format!(
                "extra exceeds max length. {} > {}",
                extra.len(),
                MAXIMUM_EXTRA_DATA_SIZE
            )));
        }
        *self.shared.extra.write() = extra;
        Ok(())
    }
}

fn pause(abort: &AtomicBool, duration: Duration) {
    let mut waited = Duration::ZERO;
    while waited < duration && !abort.load(Ordering::SeqCst) {
        thread::sleep(POLL_STEP);
        waited += POLL_STEP;
    }
}

fn seal_loop(shared: Arc<Shared>, abort: Arc<AtomicBool>) {
    while !abort.load(Ordering::SeqCst) {
        let parent = shared.chain.current_block();
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            timestamp: now_secs().max(parent.header.timestamp + 1),
            coinbase: *shared.coinbase.read(),
            gas_limit: parent.header.gas_limit,
            extra: shared.extra.read().clone(),
            ..Header::default()
        };
        if let Err(e) = shared.engine.prepare(shared.chain.as_ref(), &mut header) {
            warn!("Failed to prepare header for mining: {}", e);
            pause(&abort, RETRY_DELAY);
            continue;
        }

        let block = Block::new(header, shared.txpool.pending());
        match shared.engine.seal(shared.chain.as_ref(), block, &abort) {
            Ok(Some(sealed)) => {
                let hash = sealed.hash();
                let number = sealed.number();
                let timestamp = sealed.header.timestamp;
                match shared.chain.insert_chain(vec![sealed.clone()]) {
                    Ok(_) => {
                        info!("Successfully sealed new block: number {} hash {}", number, hash_to_hex(&hash));
                        shared.txpool.remove_included(&sealed);
                        if let Err(e) = shared.mux.post(Event::NewMinedBlock(sealed)) {
                            debug!("Mined block not broadcast: {}", e);
                        }
                        // Never run ahead of the wall clock.
                        let ahead = timestamp.saturating_sub(now_secs());
                        pause(&abort, Duration::from_secs(ahead));
                    }
                    Err(e) => {
                        warn!("Failed writing block to chain: {}", e);
                        pause(&abort, RETRY_DELAY);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Block sealing failed: {}", e);
                pause(&abort, RETRY_DELAY);
            }
        }
    }
}

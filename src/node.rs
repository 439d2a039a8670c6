//! Full node service
//!
//! [`NodeService`] owns every chain subsystem: it reconciles the genesis with
//! the database, picks the consensus engine, wires the blockchain, pool,
//! sync manager, miner and bloom index together, and tears them down again
//! in dependency order.

use crate::accounts::AccountManager;
use crate::api::{self, PublicNetApi, RpcApi};
use crate::blockchain::{Block, BlockChain};
use crate::bloombits::{BloomDispatcher, BloomIndexer};
use crate::config::NodeConfig;
use crate::consensus::{create_consensus_engine, Engine, SignerFn};
use crate::crypto::{hash_to_hex, Address, Hash};
use crate::error::ChainError;
use crate::event::EventMux;
use crate::genesis::{setup_genesis_block, CompatibilityOutcome, Genesis};
use crate::miner::Miner;
use crate::p2p::{Protocol, Server};
use crate::params::{
    version_string, BLOCKCHAIN_VERSION, MAXIMUM_EXTRA_DATA_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::persistence::{ChainDb, Database, MemoryDatabase};
use crate::rawdb;
use crate::sync::SyncManager;
use crate::txpool::TxPool;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Resources a service borrows from the hosting process.
#[derive(Clone)]
pub struct ServiceContext {
    data_dir: Option<PathBuf>,
    event_mux: Arc<EventMux>,
    account_manager: Arc<AccountManager>,
}

impl ServiceContext {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self::with_accounts(data_dir, Arc::new(AccountManager::new()))
    }

    pub fn with_accounts(data_dir: Option<PathBuf>, account_manager: Arc<AccountManager>) -> Self {
        ServiceContext {
            data_dir,
            event_mux: Arc::new(EventMux::new()),
            account_manager,
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn event_mux(&self) -> Arc<EventMux> {
        self.event_mux.clone()
    }

    pub fn account_manager(&self) -> Arc<AccountManager> {
        self.account_manager.clone()
    }

    /// Absolute paths pass through; relative ones live under the data dir.
    /// Ephemeral contexts resolve relative paths to an empty path.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.data_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::new(),
        }
    }
}

/// Opens the named chain database under the data dir, or an in-memory one
/// for ephemeral nodes.
pub fn create_db(ctx: &ServiceContext, config: &NodeConfig, name: &str) -> Result<Arc<dyn ChainDb>, ChainError> {
    match ctx.data_dir() {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.db", name));
            info!("Allocated database: {} cache {}MB", path.display(), config.database_cache);
            Ok(Arc::new(Database::open(path)?))
        }
        None => Ok(Arc::new(MemoryDatabase::new())),
    }
}

/// Miner extra data: the caller's bytes, or a version stamp when empty.
/// Oversized data is dropped with a warning.
pub fn make_extra_data(extra: &[u8]) -> Vec<u8> {
    let extra = if extra.is_empty() {
        let version = VERSION_MAJOR << 16 | VERSION_MINOR << 8 | VERSION_PATCH;
        bincode::serialize(&(version, "vsc", std::env::consts::OS)).unwrap_or_default()
    } else {
        extra.to_vec()
    };
    if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
        warn!(
            "Miner extra data exceed limit: extra 0x{} limit {}",
            hex::encode(&extra),
            MAXIMUM_EXTRA_DATA_SIZE
        );
        return Vec::new();
    }
    extra
}

/// Server for light clients, attached after construction.
pub trait LightServer: Send + Sync {
    fn protocols(&self) -> Vec<Protocol>;
    fn set_bloom_indexer(&self, indexer: Arc<BloomIndexer>);
    fn start(&self, server: &Server) -> Result<(), ChainError>;
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
}

struct MiningIdentity {
    etherbase: Address,
    gas_price: u128,
}

pub struct NodeService {
    config: NodeConfig,
    network_id: u64,
    chain_db: Arc<dyn ChainDb>,
    engine: Arc<dyn Engine>,
    event_mux: Arc<EventMux>,
    account_manager: Arc<AccountManager>,
    blockchain: Arc<BlockChain>,
    txpool: Arc<TxPool>,
    sync: Arc<SyncManager>,
    miner: Arc<Miner>,
    bloom_indexer: Arc<BloomIndexer>,
    bloom_dispatcher: Arc<BloomDispatcher>,
    genesis_outcome: CompatibilityOutcome,
    identity: RwLock<MiningIdentity>,
    light_server: RwLock<Option<Arc<dyn LightServer>>>,
    net_api: RwLock<Option<Arc<PublicNetApi>>>,
    state: Mutex<LifecycleState>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl NodeService {
    pub fn new(ctx: &ServiceContext, config: NodeConfig, chain_db: Arc<dyn ChainDb>) -> Result<Arc<Self>, ChainError> {
        config.validate()?;
        let genesis = config.genesis.as_deref().map(Genesis::load).transpose()?;

        let setup = setup_genesis_block(chain_db.as_ref(), genesis.as_ref())?;
        if let CompatibilityOutcome::IncompatibleFatal { stored, new } = &setup.outcome {
            return Err(ChainError::GenesisIncompatible(format!(
                "database already contains an incompatible genesis block (have {}, new {})",
                hash_to_hex(stored),
                hash_to_hex(new)
            )));
        }
        info!("Initialised chain configuration: {}", setup.config);

        let engine = create_consensus_engine(ctx, &config.ethash, &setup.config, chain_db.clone());
        info!(
            "Initialising chain protocol: versions {:?} network {}",
            [crate::sync::ETH63, crate::sync::ETH62],
            config.network_id
        );

        if !config.skip_bc_version_check {
            let stored = rawdb::read_database_version(chain_db.as_ref())?;
            if stored != BLOCKCHAIN_VERSION && stored != 0 {
                return Err(ChainError::SchemaVersionMismatch {
                    stored,
                    expected: BLOCKCHAIN_VERSION,
                });
            }
            rawdb::write_database_version(chain_db.as_ref(), BLOCKCHAIN_VERSION)?;
        }

        let blockchain = Arc::new(BlockChain::new(chain_db.clone(), setup.config.clone(), engine.clone())?);
        if let CompatibilityOutcome::IncompatibleWithRewind { rewind_to, error } = &setup.outcome {
            warn!("Rewinding chain to upgrade configuration: {}", error);
            blockchain.set_head(*rewind_to)?;
            rawdb::write_chain_config(chain_db.as_ref(), &setup.genesis_hash, &setup.config)?;
        }

        let bloom_indexer = BloomIndexer::new(chain_db.clone(), config.bloom_section_size, config.bloom_confirms)?;
        bloom_indexer.start(&blockchain)?;

        let built = Self::wire(ctx, &config, &blockchain, &engine);
        let (txpool, sync, miner) = match built {
            Ok(parts) => parts,
            Err(e) => {
                bloom_indexer.close();
                blockchain.stop();
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let node = Arc::new(NodeService {
            network_id: config.network_id,
            chain_db: chain_db.clone(),
            engine,
            event_mux: ctx.event_mux(),
            account_manager: ctx.account_manager(),
            blockchain,
            txpool,
            sync,
            miner,
            bloom_indexer,
            bloom_dispatcher: Arc::new(BloomDispatcher::new(chain_db)),
            genesis_outcome: setup.outcome,
            identity: RwLock::new(MiningIdentity {
                etherbase: config.etherbase,
                gas_price: config.gas_price as u128,
            }),
            light_server: RwLock::new(None),
            net_api: RwLock::new(None),
            state: Mutex::new(LifecycleState::Created),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            config,
        });
        info!(
            "Node service initialised: version {} head #{}",
            version_string(),
            node.blockchain.current_block().number()
        );
        Ok(node)
    }

    // Pool, sync manager and miner, in that order.
    fn wire(
        ctx: &ServiceContext,
        config: &NodeConfig,
        blockchain: &Arc<BlockChain>,
        engine: &Arc<dyn Engine>,
    ) -> Result<(Arc<TxPool>, Arc<SyncManager>, Arc<Miner>), ChainError> {
        let mut pool_config = config.tx_pool.clone();
        pool_config.journal = pool_config
            .journal
            .map(|journal| ctx.resolve_path(&journal))
            .filter(|journal| !journal.as_os_str().is_empty());
        let txpool = Arc::new(TxPool::new(pool_config, config.gas_price as u128));

        let sync = SyncManager::new(
            config.sync_mode,
            config.network_id,
            blockchain.clone(),
            txpool.clone(),
            ctx.event_mux(),
        )?;
        sync.set_sync_cycle(config.sync_cycle);

        let miner = Miner::new(blockchain.clone(), engine.clone(), txpool.clone(), ctx.event_mux());
        let extra = config.extra_data.as_deref().unwrap_or_default().as_bytes();
        miner.set_extra(make_extra_data(extra))?;
        miner.set_etherbase(config.etherbase);
        Ok((txpool, sync, miner))
    }

    /// Starts background workers and the sync loop. Only valid once, from `Created`.
    pub fn start(&self, server: Arc<Server>) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            return Err(ChainError::Lifecycle(format!("cannot start node in state {:?}", *state)));
        }

        self.bloom_dispatcher.start()?;
        *self.net_api.write() = Some(Arc::new(PublicNetApi::new(
            server.clone(),
            self.sync.clone(),
            self.network_id,
        )));

        let mut max_peers = server.max_peers();
        if self.config.light_serv > 0 {
            if self.config.light_peers >= max_peers {
                return Err(ChainError::PeerBudgetInvalid {
                    light_peers: self.config.light_peers,
                    max_peers,
                });
            }
            max_peers -= self.config.light_peers;
        }

        self.sync.start(max_peers)?;
        if let Some(light) = self.light_server.read().as_ref() {
            light.start(&server)?;
        }
        *state = LifecycleState::Running;
        info!("Node service started: network {} peers {}", self.network_id, max_peers);
        Ok(())
    }

    /// Tears every subsystem down in dependency order and fires the shutdown
    /// signal. Later calls do nothing.
    pub fn stop(&self) -> Result<(), ChainError> {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Stopped {
                return Ok(());
            }
            *state = LifecycleState::Stopped;
        }

        self.bloom_indexer.close();
        self.blockchain.stop();
        self.sync.stop();
        if let Some(light) = self.light_server.read().as_ref() {
            light.stop();
        }
        self.txpool.stop();
        self.miner.close();
        self.event_mux.stop();

        self.bloom_dispatcher.close();
        self.chain_db.close();
        if let Err(e) = self.engine.close() {
            warn!("Failed to close consensus engine: {}", e);
        }
        self.shutdown_tx.lock().take();
        info!("Node service stopped");
        Ok(())
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Disconnects once the node has stopped.
    pub fn shutdown_signal(&self) -> Receiver<()> {
        self.shutdown_rx.clone()
    }

    /// The configured mining address, falling back to the first local account.
    pub fn etherbase(&self) -> Result<Address, ChainError> {
        let etherbase = self.identity.read().etherbase;
        if !etherbase.is_zero() {
            return Ok(etherbase);
        }
        let first = self
            .account_manager
            .wallets()
            .first()
            .and_then(|wallet| wallet.accounts().first().copied());
        let Some(address) = first else {
            return Err(ChainError::MiningAddressUnconfigured);
        };

        // A set_etherbase that raced the account lookup wins.
        let mut identity = self.identity.write();
        if !identity.etherbase.is_zero() {
            return Ok(identity.etherbase);
        }
        identity.etherbase = address;
        info!("Etherbase automatically configured: {}", address);
        Ok(address)
    }

    pub fn set_etherbase(&self, etherbase: Address) {
        self.identity.write().etherbase = etherbase;
        self.miner.set_etherbase(etherbase);
    }

    pub fn gas_price(&self) -> u128 {
        self.identity.read().gas_price
    }

    pub fn set_gas_price(&self, price: u128) {
        self.identity.write().gas_price = price;
        self.txpool.set_gas_price(price);
    }

    /// Starts sealing for the etherbase. Proof-of-authority engines are first
    /// authorized with the wallet holding it. `local` also opens the
    /// transaction gate so single-node networks accept transactions.
    pub fn start_mining(&self, local: bool) -> Result<(), ChainError> {
        let etherbase = self.etherbase().map_err(|e| {
            error!("Cannot start mining without etherbase: {}", e);
            e
        })?;

        if let Some(authorizer) = self.engine.authorizer() {
            let wallet = self.account_manager.find(&etherbase).map_err(|e| {
                error!("Etherbase account unavailable locally: {}", e);
                ChainError::SignerUnavailable(e.to_string())
            })?;
            if wallet.is_locked() {
                error!("Etherbase account {} is locked", etherbase);
                return Err(ChainError::SignerUnavailable(format!(
                    "account {} is locked",
                    etherbase
                )));
            }
            let sign_fn: SignerFn = Arc::new(move |address: &Address, digest: &Hash| wallet.sign_hash(address, digest));
            authorizer.authorize(etherbase, sign_fn);
        }
        if local {
            if let Some(threader) = self.engine.threader() {
                if threader.threads() < 0 {
                    threader.set_threads(self.config.miner_threads.max(0));
                }
            }
            self.sync.set_accept_txs(true);
        }
        self.miner.start(etherbase);
        Ok(())
    }

    pub fn stop_mining(&self) {
        self.miner.stop();
    }

    pub fn is_mining(&self) -> bool {
        self.miner.mining()
    }

    /// Attaches a light server; it shares the bloom index with the node.
    pub fn add_light_server(&self, server: Arc<dyn LightServer>) {
        server.set_bloom_indexer(self.bloom_indexer.clone());
        *self.light_server.write() = Some(server);
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = self.sync.protocols();
        if let Some(light) = self.light_server.read().as_ref() {
            protocols.extend(light.protocols());
        }
        protocols
    }

    pub fn apis(self: &Arc<Self>) -> Vec<RpcApi> {
        api::node_apis(self)
    }

    pub fn reset_with_genesis_block(&self, genesis: Block) -> Result<(), ChainError> {
        self.blockchain.reset_with_genesis_block(genesis)
    }

    pub fn genesis_outcome(&self) -> &CompatibilityOutcome {
        &self.genesis_outcome
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn blockchain(&self) -> Arc<BlockChain> {
        self.blockchain.clone()
    }

    pub fn txpool(&self) -> Arc<TxPool> {
        self.txpool.clone()
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    pub fn chain_db(&self) -> Arc<dyn ChainDb> {
        self.chain_db.clone()
    }

    pub fn event_mux(&self) -> Arc<EventMux> {
        self.event_mux.clone()
    }

    pub fn account_manager(&self) -> Arc<AccountManager> {
        self.account_manager.clone()
    }

    pub fn miner(&self) -> Arc<Miner> {
        self.miner.clone()
    }

    pub fn downloader(&self) -> Arc<SyncManager> {
        self.sync.clone()
    }

    pub fn bloom_indexer(&self) -> Arc<BloomIndexer> {
        self.bloom_indexer.clone()
    }

    pub fn bloom_dispatcher(&self) -> Arc<BloomDispatcher> {
        self.bloom_dispatcher.clone()
    }

    pub(crate) fn net_api(&self) -> Option<Arc<PublicNetApi>> {
        self.net_api.read().clone()
    }

    pub fn net_version(&self) -> u64 {
        self.network_id
    }

    pub fn eth_version(&self) -> u32 {
        self.sync.protocols().first().map(|p| p.version).unwrap_or_default()
    }

    pub fn is_listening(&self) -> bool {
        true
    }
}

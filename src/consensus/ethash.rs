//! Proof-of-work engine
//!
//! Sealing searches for a nonce whose hash, mixed with one item of the
//! per-epoch dataset, falls under `u64::MAX / difficulty`. Datasets are
//! derived by chaining SHA-256 from the epoch seed and are cached in memory,
//! and for [`PowMode::Normal`] also on disk.

use crate::api::{param, RpcApi, RpcService};
use crate::blockchain::{Block, ChainReader, Header};
use crate::consensus::{Engine, Threader};
use crate::crypto::{sha256, Address, Hash};
use crate::error::ChainError;
use crate::params::MAXIMUM_EXTRA_DATA_SIZE;
use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Blocks per dataset epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

pub const MINIMUM_DIFFICULTY: u64 = 131_072;

const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;
const ALLOWED_FUTURE_BLOCK_TIME: u64 = 15;
const DATASET_ITEMS: usize = 16_384;
const TEST_DATASET_ITEMS: usize = 1024;
const CACHE_REVISION: u32 = 1;
// Nonces tried between checks of the abort flag and the chain head.
const SEAL_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowMode {
    #[default]
    Normal,
    Shared,
    Test,
    Fake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthashConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_caches_in_mem")]
    pub caches_in_mem: usize,
    #[serde(default = "default_caches_on_disk")]
    pub caches_on_disk: usize,
    #[serde(default)]
    pub pow_mode: PowMode,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("ethash")
}

fn default_caches_in_mem() -> usize {
    2
}

fn default_caches_on_disk() -> usize {
    3
}

impl EthashConfig {
    /// An empty cache dir keeps every dataset in memory.
    fn disk_caching(&self) -> bool {
        self.pow_mode == PowMode::Normal && self.caches_on_disk > 0 && !self.cache_dir.as_os_str().is_empty()
    }
}

impl Default for EthashConfig {
    fn default() -> Self {
        EthashConfig {
            cache_dir: default_cache_dir(),
            caches_in_mem: default_caches_in_mem(),
            caches_on_disk: default_caches_on_disk(),
            pow_mode: PowMode::Normal,
        }
    }
}

/// Lookup table for one epoch.
#[derive(Debug)]
pub struct Dataset {
    pub epoch: u64,
    items: Vec<Hash>,
}

impl Dataset {
    fn generate(epoch: u64, size: usize) -> Self {
        let seed = seed_hash(epoch);
        let mut items = Vec::with_capacity(size);
        let mut item = sha256(&seed);
        for _ in 0..size {
            items.push(item);
            item = sha256(&item);
        }
        Dataset { epoch, items }
    }

    fn from_bytes(epoch: u64, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 32 != 0 {
            return None;
        }
        let items = bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut item = [0u8; 32];
                item.copy_from_slice(chunk);
                item
            })
            .collect();
        Some(Dataset { epoch, items })
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.items.iter().flat_map(|item| item.iter().copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `(mix digest, pow result)` for a seal hash and nonce.
    pub fn hashimoto(&self, seal_hash: &Hash, nonce: u64) -> (Hash, Hash) {
        let mut hasher = Sha256::new();
        hasher.update(seal_hash);
        hasher.update(nonce.to_le_bytes());
        let seed: Hash = hasher.finalize().into();

        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&seed[..8]);
        let index = (u64::from_be_bytes(index_bytes) % self.items.len() as u64) as usize;

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(self.items[index]);
        let mix: Hash = hasher.finalize().into();

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(mix);
        (mix, hasher.finalize().into())
    }
}

/// Seed of an epoch: SHA-256 applied `epoch` times to the zero hash.
pub fn seed_hash(epoch: u64) -> Hash {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = sha256(&seed);
    }
    seed
}

fn meets_target(result: &Hash, difficulty: u64) -> bool {
    if difficulty == 0 {
        return false;
    }
    let mut head = [0u8; 8];
    head.copy_from_slice(&result[..8]);
    u64::from_be_bytes(head) <= u64::MAX / difficulty
}

fn new_cache(size: usize) -> Mutex<LruCache<u64, Arc<Dataset>>> {
    Mutex::new(LruCache::new(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)))
}

// Process-wide cache backing every shared-mode instance.
static SHARED_DATASETS: Lazy<Mutex<LruCache<u64, Arc<Dataset>>>> = Lazy::new(|| new_cache(3));

pub struct Ethash {
    config: EthashConfig,
    caches: Mutex<LruCache<u64, Arc<Dataset>>>,
    threads: Arc<AtomicI32>,
    hashrate: Arc<AtomicU64>,
}

impl Ethash {
    pub fn new(config: EthashConfig) -> Self {
        if config.disk_caching() {
            info!(
                "Disk storage enabled for ethash caches: dir {} count {}",
                config.cache_dir.display(),
                config.caches_on_disk
            );
        }
        Ethash {
            caches: new_cache(config.caches_in_mem),
            config,
            threads: Arc::new(AtomicI32::new(0)),
            hashrate: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Accepts every seal and seals instantly.
    pub fn new_faker() -> Self {
        Self::with_mode(PowMode::Fake)
    }

    /// Small dataset and fixed difficulty of one.
    pub fn new_tester() -> Self {
        Self::with_mode(PowMode::Test)
    }

    /// Full verification backed by one process-wide dataset cache.
    pub fn new_shared() -> Self {
        Self::with_mode(PowMode::Shared)
    }

    fn with_mode(pow_mode: PowMode) -> Self {
        Self::new(EthashConfig {
            pow_mode,
            caches_on_disk: 0,
            ..EthashConfig::default()
        })
    }

    pub fn mode(&self) -> PowMode {
        self.config.pow_mode
    }

    /// Last measured local hash rate in hashes per second.
    pub fn hashrate(&self) -> u64 {
        self.hashrate.load(Ordering::Relaxed)
    }

    /// Dataset for the epoch containing `number`.
    pub fn dataset(&self, number: u64) -> Arc<Dataset> {
        let epoch = number / EPOCH_LENGTH;
        let cache = match self.config.pow_mode {
            PowMode::Shared => &*SHARED_DATASETS,
            _ => &self.caches,
        };
        let mut cache = cache.lock();
        if let Some(dataset) = cache.get(&epoch) {
            return dataset.clone();
        }
        let dataset = Arc::new(self.load_or_generate(epoch));
        cache.put(epoch, dataset.clone());
        dataset
    }

    fn load_or_generate(&self, epoch: u64) -> Dataset {
        let size = match self.config.pow_mode {
            PowMode::Test => TEST_DATASET_ITEMS,
            _ => DATASET_ITEMS,
        };
        if !self.config.disk_caching() {
            return Dataset::generate(epoch, size);
        }

        let path = cache_path(&self.config.cache_dir, epoch);
        if let Ok(bytes) = fs::read(&path) {
            if let Some(dataset) = Dataset::from_bytes(epoch, &bytes) {
                debug!("Loaded ethash cache from disk: epoch {}", epoch);
                return dataset;
            }
            warn!("Discarding corrupt ethash cache {}", path.display());
        }

        let start = Instant::now();
        let dataset = Dataset::generate(epoch, size);
        info!("Generated ethash cache: epoch {} elapsed {:?}", epoch, start.elapsed());
        if let Err(e) = self.store(&path, &dataset) {
            warn!("Failed to store ethash cache {}: {}", path.display(), e);
        }
        dataset
    }

    fn store(&self, path: &Path, dataset: &Dataset) -> Result<(), ChainError> {
        fs::create_dir_all(&self.config.cache_dir)?;
        fs::write(path, dataset.to_bytes())?;

        let limit = self.config.caches_on_disk as u64;
        if dataset.epoch >= limit {
            let stale = cache_path(&self.config.cache_dir, dataset.epoch - limit);
            if stale.exists() {
                fs::remove_file(&stale)?;
                debug!("Pruned ethash cache {}", stale.display());
            }
        }
        Ok(())
    }

    fn search(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        threads: usize,
        stop: &AtomicBool,
    ) -> Option<(u64, Hash)> {
        let dataset = self.dataset(header.number);
        let seal_hash = header.seal_hash();
        let found = AtomicBool::new(false);
        let result: Mutex<Option<(u64, Hash)>> = Mutex::new(None);
        let attempts = AtomicU64::new(0);
        let seed: u64 = rand::thread_rng().gen();
        let start = Instant::now();

        std::thread::scope(|scope| {
            for id in 0..threads {
                let (dataset, found, result, attempts) = (&dataset, &found, &result, &attempts);
                scope.spawn(move || {
                    let mut nonce = seed.wrapping_add(id as u64);
                    let mut tried = 0u64;
                    loop {
                        if tried % SEAL_CHECK_INTERVAL == 0
                            && (found.load(Ordering::SeqCst)
                                || stop.load(Ordering::SeqCst)
                                || chain.current_header().hash() != header.parent_hash)
                        {
                            break;
                        }
                        let (mix, pow) = dataset.hashimoto(&seal_hash, nonce);
                        tried += 1;
                        if meets_target(&pow, header.difficulty) {
                            if !found.swap(true, Ordering::SeqCst) {
                                *result.lock() = Some((nonce, mix));
                            }
                            break;
                        }
                        nonce = nonce.wrapping_add(threads as u64);
                    }
                    attempts.fetch_add(tried, Ordering::Relaxed);
                });
            }
        });

        let secs = start.elapsed().as_secs_f64().max(1e-3);
        self.hashrate
            .store((attempts.load(Ordering::Relaxed) as f64 / secs) as u64, Ordering::Relaxed);
        result.into_inner()
    }
}

fn cache_path(dir: &Path, epoch: u64) -> PathBuf {
    let seed = seed_hash(epoch);
    dir.join(format!("cache-R{}-{}", CACHE_REVISION, hex::encode(&seed[..8])))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Engine for Ethash {
    fn name(&self) -> &'static str {
        "ethash"
    }

    fn author(&self, header: &Header) -> Result<Address, ChainError> {
        Ok(header.coinbase)
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), ChainError> {
        if self.config.pow_mode == PowMode::Fake {
            return Ok(());
        }
        let parent = chain
            .get_header(&header.parent_hash, header.number.wrapping_sub(1))
            .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;

        if header.extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(ChainError::ConsensusError(format!(
                "extra-data too long: {} > {}",
                header.extra.len(),
                MAXIMUM_EXTRA_DATA_SIZE
            )));
        }
        if header.timestamp > now_secs() + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ChainError::ConsensusError("block in the future".to_string()));
        }
        if header.timestamp <= parent.timestamp {
            return Err(ChainError::ConsensusError("timestamp equals parent's".to_string()));
        }
        let expected = self.calc_difficulty(chain, header.timestamp, &parent)?;
        if header.difficulty != expected {
            return Err(ChainError::ConsensusError(format!(
                "invalid difficulty: have {}, want {}",
                header.difficulty, expected
            )));
        }
        if seal {
            self.verify_seal(chain, header)?;
        }
        Ok(())
    }

    fn verify_seal(&self, _chain: &dyn ChainReader, header: &Header) -> Result<(), ChainError> {
        if self.config.pow_mode == PowMode::Fake {
            return Ok(());
        }
        if header.difficulty == 0 {
            return Err(ChainError::ConsensusError("non-positive difficulty".to_string()));
        }
        let (mix, pow) = self.dataset(header.number).hashimoto(&header.seal_hash(), header.nonce);
        if mix != header.mix_digest {
            return Err(ChainError::ConsensusError("invalid mix digest".to_string()));
        }
        if !meets_target(&pow, header.difficulty) {
            return Err(ChainError::ConsensusError("invalid proof-of-work".to_string()));
        }
        Ok(())
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ChainError> {
        let parent = chain
            .get_header(&header.parent_hash, header.number.wrapping_sub(1))
            .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;
        header.difficulty = self.calc_difficulty(chain, header.timestamp, &parent)?;
        Ok(())
    }

    fn seal(&self, chain: &dyn ChainReader, block: Block, stop: &AtomicBool) -> Result<Option<Block>, ChainError> {
        if self.config.pow_mode == PowMode::Fake {
            let mut header = block.header.clone();
            header.nonce = 0;
            header.mix_digest = [0u8; 32];
            return Ok(Some(block.with_seal(header)));
        }

        let threads = self.threads();
        if threads < 0 {
            return Err(ChainError::ConsensusError("local sealing is disabled".to_string()));
        }
        let threads = if threads == 0 { num_cpus::get() } else { threads as usize };

        let mut header = block.header.clone();
        match self.search(chain, &header, threads, stop) {
            Some((nonce, mix)) => {
                header.nonce = nonce;
                header.mix_digest = mix;
                debug!("Ethash nonce found: number {} nonce {}", header.number, nonce);
                Ok(Some(block.with_seal(header)))
            }
            None => Ok(None),
        }
    }

    fn calc_difficulty(&self, _chain: &dyn ChainReader, time: u64, parent: &Header) -> Result<u64, ChainError> {
        if self.config.pow_mode == PowMode::Test {
            return Ok(1);
        }
        let elapsed = time.saturating_sub(parent.timestamp) as i128;
        let adjustment = (1 - elapsed / 9).max(-99);
        let step = (parent.difficulty / DIFFICULTY_BOUND_DIVISOR) as i128;
        let next = parent.difficulty as i128 + step * adjustment;
        Ok((next.max(MINIMUM_DIFFICULTY as i128)).min(u64::MAX as i128) as u64)
    }

    fn apis(&self, chain: Arc<dyn ChainReader>) -> Vec<RpcApi> {
        vec![RpcApi {
            namespace: "ethash".to_string(),
            version: "1.0".to_string(),
            service: Arc::new(EthashApi {
                chain,
                hashrate: self.hashrate.clone(),
                threads: self.threads.clone(),
            }),
            public: true,
        }]
    }

    fn close(&self) -> Result<(), ChainError> {
        self.caches.lock().clear();
        Ok(())
    }

    fn threader(&self) -> Option<&dyn Threader> {
        Some(self)
    }
}

impl Threader for Ethash {
    fn threads(&self) -> i32 {
        self.threads.load(Ordering::SeqCst)
    }

    fn set_threads(&self, threads: i32) {
        self.threads.store(threads, Ordering::SeqCst);
    }
}

struct EthashApi {
    chain: Arc<dyn ChainReader>,
    hashrate: Arc<AtomicU64>,
    threads: Arc<AtomicI32>,
}

impl RpcService for EthashApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "getHashrate" => Ok(json!(self.hashrate.load(Ordering::Relaxed))),
            "getThreads" => Ok(json!(self.threads.load(Ordering::SeqCst))),
            "seedHash" => {
                let number: u64 = param(&params, 0)?;
                // Seeds are only served up to the epoch after the head's.
                let limit = self.chain.current_header().number / EPOCH_LENGTH + 1;
                let epoch = number / EPOCH_LENGTH;
                if epoch > limit {
                    return Err(ChainError::Rpc(format!(
                        "block {} is beyond the next epoch (limit {})",
                        number, limit
                    )));
                }
                Ok(json!(format!("0x{}", hex::encode(seed_hash(epoch)))))
            }
            _ => Err(ChainError::Rpc(format!("method ethash_{} not found", method))),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["getHashrate", "getThreads", "seedHash"]
    }
}

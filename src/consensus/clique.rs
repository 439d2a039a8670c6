//! Proof-of-authority engine
//!
//! A fixed, vote-managed set of signers takes turns sealing blocks. The seal
//! is a [`SignedDigest`] appended to the header's extra-data; checkpoint
//! blocks additionally list the full signer set between the vanity prefix and
//! the seal. Voting snapshots are cached in memory and checkpointed to the
//! chain database.

use crate::api::{param, RpcApi, RpcService};
use crate::blockchain::{Block, ChainReader, Header};
use crate::consensus::{Authorizer, Engine, SignerFn};
use crate::crypto::{hash_to_hex, Address, Hash, SignedDigest, ADDRESS_LENGTH, SIGNED_DIGEST_LENGTH};
use crate::error::ChainError;
use crate::params::CliqueConfig;
use crate::persistence::ChainDb;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// Bytes reserved for signer vanity at the start of extra-data.
pub const EXTRA_VANITY: usize = 32;
/// Bytes reserved for the seal at the end of extra-data.
pub const EXTRA_SEAL: usize = SIGNED_DIGEST_LENGTH;

pub const NONCE_AUTH_VOTE: u64 = u64::MAX;
pub const NONCE_DROP_VOTE: u64 = 0;

pub const DIFF_IN_TURN: u64 = 2;
pub const DIFF_NO_TURN: u64 = 1;

const CHECKPOINT_INTERVAL: u64 = 1024;
const INMEMORY_SNAPSHOTS: usize = 128;
const WIGGLE_TIME_MS: u64 = 500;
const SNAPSHOT_PREFIX: &[u8] = b"clique-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub signer: Address,
    pub block: u64,
    pub address: Address,
    pub authorize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub authorize: bool,
    pub votes: usize,
}

/// Authorization state at a given block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub number: u64,
    pub hash: Hash,
    pub signers: BTreeSet<Address>,
    /// Recent signers keyed by the block they sealed.
    pub recents: BTreeMap<u64, Address>,
    pub votes: Vec<Vote>,
    pub tally: BTreeMap<Address, Tally>,
}

impl Snapshot {
    pub fn new(number: u64, hash: Hash, signers: impl IntoIterator<Item = Address>) -> Self {
        Snapshot {
            number,
            hash,
            signers: signers.into_iter().collect(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tally: BTreeMap::new(),
        }
    }

    fn load(db: &dyn ChainDb, hash: &Hash) -> Result<Option<Snapshot>, ChainError> {
        match db.get(&snapshot_key(hash))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, db: &dyn ChainDb) -> Result<(), ChainError> {
        db.put(&snapshot_key(&self.hash), &serde_json::to_vec(self)?)
    }

    /// Number of blocks a signer must wait before sealing again.
    pub fn signer_limit(&self) -> u64 {
        (self.signers.len() / 2 + 1) as u64
    }

    pub fn inturn(&self, number: u64, signer: &Address) -> bool {
        match self.signers.iter().position(|s| s == signer) {
            Some(offset) => number % self.signers.len() as u64 == offset as u64,
            None => false,
        }
    }

    fn recently_signed(&self, number: u64, signer: &Address) -> bool {
        let limit = self.signer_limit();
        self.recents
            .iter()
            .any(|(seen, recent)| recent == signer && (number < limit || *seen > number - limit))
    }

    fn valid_vote(&self, address: &Address, authorize: bool) -> bool {
        self.signers.contains(address) != authorize
    }

    fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.valid_vote(&address, authorize) {
            return false;
        }
        self.tally
            .entry(address)
            .and_modify(|t| t.votes += 1)
            .or_insert(Tally { authorize, votes: 1 });
        true
    }

    fn uncast(&mut self, address: &Address, authorize: bool) {
        if let Some(tally) = self.tally.get_mut(address) {
            if tally.authorize != authorize {
                return;
            }
            if tally.votes > 1 {
                tally.votes -= 1;
            } else {
                self.tally.remove(address);
            }
        }
    }

    /// Applies a contiguous run of headers on top of this snapshot.
    pub fn apply(&self, headers: &[Header], epoch: u64) -> Result<Snapshot, ChainError> {
        if headers.is_empty() {
            return Ok(self.clone());
        }
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(ChainError::ConsensusError("invalid voting chain".to_string()));
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(ChainError::ConsensusError("invalid voting chain".to_string()));
        }

        let mut snap = self.clone();
        for header in headers {
            let number = header.number;
            if number % epoch == 0 {
                snap.votes.clear();
                snap.tally.clear();
            }
            let limit = snap.signer_limit();
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            let signer = ecrecover(header)?;
            if !snap.signers.contains(&signer) {
                return Err(ChainError::ConsensusError(format!("unauthorized signer {}", signer)));
            }
            if snap.recents.values().any(|recent| *recent == signer) {
                return Err(ChainError::ConsensusError(format!("{} signed recently", signer)));
            }
            snap.recents.insert(number, signer);

            if let Some(pos) = snap
                .votes
                .iter()
                .position(|v| v.signer == signer && v.address == header.coinbase)
            {
                let old = snap.votes.remove(pos);
                snap.uncast(&old.address, old.authorize);
            }

            let authorize = match header.nonce {
                NONCE_AUTH_VOTE => true,
                NONCE_DROP_VOTE => false,
                _ => return Err(ChainError::ConsensusError("invalid vote nonce".to_string())),
            };
            if snap.cast(header.coinbase, authorize) {
                snap.votes.push(Vote {
                    signer,
                    block: number,
                    address: header.coinbase,
                    authorize,
                });
            }

            let passed = snap
                .tally
                .get(&header.coinbase)
                .filter(|t| t.votes > snap.signers.len() / 2)
                .copied();
            if let Some(tally) = passed {
                if tally.authorize {
                    snap.signers.insert(header.coinbase);
                } else {
                    snap.signers.remove(&header.coinbase);

                    let limit = snap.signer_limit();
                    if number >= limit {
                        snap.recents.remove(&(number - limit));
                    }
                    let dropped: Vec<Vote> = snap
                        .votes
                        .iter()
                        .filter(|v| v.signer == header.coinbase)
                        .cloned()
                        .collect();
                    for vote in dropped {
                        snap.uncast(&vote.address, vote.authorize);
                    }
                    snap.votes.retain(|v| v.signer != header.coinbase);
                }
                snap.votes.retain(|v| v.address != header.coinbase);
                snap.tally.remove(&header.coinbase);
            }
        }

        let last = &headers[headers.len() - 1];
        snap.number = last.number;
        snap.hash = last.hash();
        Ok(snap)
    }
}

fn snapshot_key(hash: &Hash) -> Vec<u8> {
    let mut key = SNAPSHOT_PREFIX.to_vec();
    key.extend_from_slice(hash);
    key
}

/// Hash signed by the sealer: the header with the seal stripped from extra-data.
pub fn sig_hash(header: &Header) -> Hash {
    let end = header.extra.len().saturating_sub(EXTRA_SEAL);
    header.hash_with_extra(&header.extra[..end])
}

/// Address of the account that sealed `header`.
pub fn ecrecover(header: &Header) -> Result<Address, ChainError> {
    if header.extra.len() < EXTRA_SEAL {
        return Err(ChainError::ConsensusError("extra-data 97 byte signature suffix missing".to_string()));
    }
    let seal = SignedDigest::from_bytes(&header.extra[header.extra.len() - EXTRA_SEAL..])?;
    seal.verify(&sig_hash(header))
}

/// Signer list stored in a checkpoint header's extra-data.
pub fn extract_signers(header: &Header) -> Result<Vec<Address>, ChainError> {
    if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(ChainError::ConsensusError("extra-data too short".to_string()));
    }
    let list = &header.extra[EXTRA_VANITY..header.extra.len() - EXTRA_SEAL];
    if list.len() % ADDRESS_LENGTH != 0 {
        return Err(ChainError::ConsensusError("invalid signer list on checkpoint block".to_string()));
    }
    Ok(list
        .chunks_exact(ADDRESS_LENGTH)
        .map(|chunk| {
            let mut addr = [0u8; ADDRESS_LENGTH];
            addr.copy_from_slice(chunk);
            Address(addr)
        })
        .collect())
}

/// Extra-data for a genesis block authorizing `signers`.
pub fn genesis_extra(vanity: &[u8], signers: &[Address]) -> Vec<u8> {
    let mut extra = vec![0u8; EXTRA_VANITY];
    let n = vanity.len().min(EXTRA_VANITY);
    extra[..n].copy_from_slice(&vanity[..n]);
    for signer in signers {
        extra.extend_from_slice(signer.as_bytes());
    }
    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
    extra
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Inner {
    config: CliqueConfig,
    db: Arc<dyn ChainDb>,
    recents: Mutex<LruCache<Hash, Snapshot>>,
    proposals: RwLock<HashMap<Address, bool>>,
    signer: RwLock<Option<(Address, SignerFn)>>,
}

#[derive(Clone)]
pub struct Clique {
    inner: Arc<Inner>,
}

impl Clique {
    pub fn new(mut config: CliqueConfig, db: Arc<dyn ChainDb>) -> Self {
        if config.epoch == 0 {
            config.epoch = 30_000;
        }
        Clique {
            inner: Arc::new(Inner {
                config,
                db,
                recents: Mutex::new(LruCache::new(
                    NonZeroUsize::new(INMEMORY_SNAPSHOTS).unwrap_or(NonZeroUsize::MIN),
                )),
                proposals: RwLock::new(HashMap::new()),
                signer: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> CliqueConfig {
        self.inner.config
    }

    pub fn signer(&self) -> Option<Address> {
        self.inner.signer.read().as_ref().map(|(addr, _)| *addr)
    }

    /// Queues a vote to add (`authorize`) or remove a signer in blocks we seal.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.inner.proposals.write().insert(address, authorize);
    }

    pub fn discard(&self, address: &Address) {
        self.inner.proposals.write().remove(address);
    }

    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.inner.proposals.read().clone()
    }

    /// Retrieves the authorization snapshot at a given point in time.
    pub fn snapshot(&self, chain: &dyn ChainReader, mut number: u64, mut hash: Hash) -> Result<Snapshot, ChainError> {
        let mut headers = Vec::new();
        let base = loop {
            if let Some(snap) = self.inner.recents.lock().get(&hash) {
                break snap.clone();
            }
            if number % CHECKPOINT_INTERVAL == 0 {
                if let Some(snap) = Snapshot::load(self.inner.db.as_ref(), &hash)? {
                    trace!("Loaded voting snapshot from disk: number {} hash {}", number, hash_to_hex(&hash));
                    break snap;
                }
            }
            if number == 0 {
                let genesis = chain
                    .get_header_by_number(0)
                    .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;
                let snap = Snapshot::new(0, genesis.hash(), extract_signers(&genesis)?);
                snap.store(self.inner.db.as_ref())?;
                trace!("Stored genesis voting snapshot");
                break snap;
            }
            let header = chain
                .get_header(&hash, number)
                .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;
            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        };

        headers.reverse();
        let snap = base.apply(&headers, self.inner.config.epoch)?;
        self.inner.recents.lock().put(snap.hash, snap.clone());

        if snap.number % CHECKPOINT_INTERVAL == 0 && !headers.is_empty() {
            snap.store(self.inner.db.as_ref())?;
            trace!("Stored voting snapshot to disk: number {}", snap.number);
        }
        Ok(snap)
    }

    /// Signers authorized at the current head.
    pub fn get_signers(&self, chain: &dyn ChainReader) -> Result<Vec<Address>, ChainError> {
        let head = chain.current_header();
        let snap = self.snapshot(chain, head.number, head.hash())?;
        Ok(snap.signers.into_iter().collect())
    }

    fn parent_snapshot(&self, chain: &dyn ChainReader, header: &Header) -> Result<Snapshot, ChainError> {
        if header.number == 0 {
            return Err(ChainError::ConsensusError("unknown block".to_string()));
        }
        self.snapshot(chain, header.number - 1, header.parent_hash)
    }

    // Sleeps for `delay`. False when aborted or the head moved meanwhile.
    fn wait(chain: &dyn ChainReader, parent: &Hash, stop: &AtomicBool, delay: Duration) -> bool {
        let step = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        while waited < delay {
            if stop.load(Ordering::SeqCst) || chain.current_header().hash() != *parent {
                return false;
            }
            thread::sleep(step);
            waited += step;
        }
        !stop.load(Ordering::SeqCst)
    }
}

impl Engine for Clique {
    fn name(&self) -> &'static str {
        "clique"
    }

    fn author(&self, header: &Header) -> Result<Address, ChainError> {
        ecrecover(header)
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), ChainError> {
        let number = header.number;
        if number == 0 {
            return Ok(());
        }
        if header.timestamp > now_secs() {
            return Err(ChainError::ConsensusError("block in the future".to_string()));
        }
        let checkpoint = number % self.inner.config.epoch == 0;
        if checkpoint && !header.coinbase.is_zero() {
            return Err(ChainError::ConsensusError("beneficiary in checkpoint block non-zero".to_string()));
        }
        if header.nonce != NONCE_AUTH_VOTE && header.nonce != NONCE_DROP_VOTE {
            return Err(ChainError::ConsensusError("nonce not 0x00..0 or 0xff..f".to_string()));
        }
        if checkpoint && header.nonce != NONCE_DROP_VOTE {
            return Err(ChainError::ConsensusError("vote nonce in checkpoint block non-zero".to_string()));
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(ChainError::ConsensusError("extra-data missing vanity or signature".to_string()));
        }
        let signer_bytes = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        if !checkpoint && signer_bytes != 0 {
            return Err(ChainError::ConsensusError("non-checkpoint block contains extra signer list".to_string()));
        }
        if header.mix_digest != [0u8; 32] {
            return Err(ChainError::ConsensusError("non-zero mix digest".to_string()));
        }
        if header.difficulty != DIFF_IN_TURN && header.difficulty != DIFF_NO_TURN {
            return Err(ChainError::ConsensusError("invalid difficulty".to_string()));
        }

        let parent = chain
            .get_header(&header.parent_hash, number - 1)
            .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;
        if parent.timestamp + self.inner.config.period > header.timestamp {
            return Err(ChainError::ConsensusError("invalid timestamp".to_string()));
        }

        if checkpoint {
            let snap = self.parent_snapshot(chain, header)?;
            let listed = extract_signers(header)?;
            if listed != snap.signers.iter().copied().collect::<Vec<_>>() {
                return Err(ChainError::ConsensusError("invalid signer list on checkpoint block".to_string()));
            }
        }
        if seal {
            self.verify_seal(chain, header)?;
        }
        Ok(())
    }

    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ChainError> {
        let snap = self.parent_snapshot(chain, header)?;
        let signer = ecrecover(header)?;
        if !snap.signers.contains(&signer) {
            return Err(ChainError::ConsensusError(format!("unauthorized signer {}", signer)));
        }
        if snap.recently_signed(header.number, &signer) {
            return Err(ChainError::ConsensusError(format!("{} signed recently", signer)));
        }
        let expected = if snap.inturn(header.number, &signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        };
        if header.difficulty != expected {
            return Err(ChainError::ConsensusError("wrong difficulty".to_string()));
        }
        Ok(())
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ChainError> {
        header.coinbase = Address::zero();
        header.nonce = NONCE_DROP_VOTE;

        let snap = self.parent_snapshot(chain, header)?;
        let checkpoint = header.number % self.inner.config.epoch == 0;
        if !checkpoint {
            let proposals = self.inner.proposals.read();
            let pick = proposals
                .iter()
                .filter(|(addr, auth)| snap.valid_vote(addr, **auth))
                .choose(&mut rand::thread_rng());
            if let Some((addr, auth)) = pick {
                header.coinbase = *addr;
                header.nonce = if *auth { NONCE_AUTH_VOTE } else { NONCE_DROP_VOTE };
            }
        }

        let signer = self.signer().unwrap_or_default();
        header.difficulty = if snap.inturn(header.number, &signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        };

        let mut extra = header.extra.clone();
        extra.resize(EXTRA_VANITY, 0);
        if checkpoint {
            for signer in &snap.signers {
                extra.extend_from_slice(signer.as_bytes());
            }
        }
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        header.extra = extra;
        header.mix_digest = [0u8; 32];

        let parent = chain
            .get_header(&header.parent_hash, header.number - 1)
            .ok_or_else(|| ChainError::ConsensusError("unknown ancestor".to_string()))?;
        header.timestamp = (parent.timestamp + self.inner.config.period).max(now_secs());
        Ok(())
    }

    fn seal(&self, chain: &dyn ChainReader, block: Block, stop: &AtomicBool) -> Result<Option<Block>, ChainError> {
        let mut header = block.header.clone();
        if header.number == 0 {
            return Err(ChainError::ConsensusError("unknown block".to_string()));
        }
        if self.inner.config.period == 0 && block.transactions.is_empty() {
            return Err(ChainError::ConsensusError("sealing paused while waiting for transactions".to_string()));
        }

        let (signer, sign_fn) = self
            .inner
            .signer
            .read()
            .clone()
            .ok_or_else(|| ChainError::SignerUnavailable("no signer authorized".to_string()))?;

        let snap = self.parent_snapshot(chain, &header)?;
        if !snap.signers.contains(&signer) {
            return Err(ChainError::ConsensusError(format!("unauthorized signer {}", signer)));
        }
        if snap.recently_signed(header.number, &signer) {
            info!("Signed recently, must wait for others");
            let _ = Self::wait(chain, &header.parent_hash, stop, Duration::MAX);
            return Ok(None);
        }

        let mut delay = Duration::from_secs(header.timestamp.saturating_sub(now_secs()));
        if header.difficulty == DIFF_NO_TURN {
            let wiggle = (snap.signers.len() as u64 / 2 + 1) * WIGGLE_TIME_MS;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..wiggle));
            trace!("Out-of-turn signing requested: wiggle {:?}", delay);
        }
        debug!("Waiting for slot to sign and propagate: delay {:?}", delay);
        if !Self::wait(chain, &header.parent_hash, stop, delay) {
            return Ok(None);
        }

        let seal = sign_fn(&signer, &sig_hash(&header))?;
        let len = header.extra.len();
        header.extra[len - EXTRA_SEAL..].copy_from_slice(&seal.to_bytes());
        Ok(Some(block.with_seal(header)))
    }

    fn calc_difficulty(&self, chain: &dyn ChainReader, _time: u64, parent: &Header) -> Result<u64, ChainError> {
        let snap = self.snapshot(chain, parent.number, parent.hash())?;
        let signer = self.signer().unwrap_or_default();
        Ok(if snap.inturn(parent.number + 1, &signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        })
    }

    fn apis(&self, chain: Arc<dyn ChainReader>) -> Vec<RpcApi> {
        vec![RpcApi {
            namespace: "clique".to_string(),
            version: "1.0".to_string(),
            service: Arc::new(CliqueApi {
                chain,
                clique: self.clone(),
            }),
            public: false,
        }]
    }

    fn close(&self) -> Result<(), ChainError> {
        Ok(())
    }

    fn authorizer(&self) -> Option<&dyn Authorizer> {
        Some(self)
    }
}

impl Authorizer for Clique {
    fn authorize(&self, signer: Address, sign_fn: SignerFn) {
        info!("Clique signer authorized: {}", signer);
        *self.inner.signer.write() = Some((signer, sign_fn));
    }
}

/// Control and query surface for the signer set.
pub struct CliqueApi {
    chain: Arc<dyn ChainReader>,
    clique: Clique,
}

impl RpcService for CliqueApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "getSigners" => Ok(json!(self.clique.get_signers(self.chain.as_ref())?)),
            "getSnapshot" => {
                let head = self.chain.current_header();
                Ok(serde_json::to_value(self.clique.snapshot(self.chain.as_ref(), head.number, head.hash())?)?)
            }
            "proposals" => {
                let proposals: BTreeMap<String, bool> = self
                    .clique
                    .proposals()
                    .into_iter()
                    .map(|(addr, auth)| (addr.to_string(), auth))
                    .collect();
                Ok(json!(proposals))
            }
            "propose" => {
                let address: Address = param(&params, 0)?;
                let authorize: bool = param(&params, 1)?;
                self.clique.propose(address, authorize);
                Ok(Value::Null)
            }
            "discard" => {
                let address: Address = param(&params, 0)?;
                self.clique.discard(&address);
                Ok(Value::Null)
            }
            _ => Err(ChainError::Rpc(format!("method clique_{} not found", method))),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["getSigners", "getSnapshot", "proposals", "propose", "discard"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::params::ChainConfig;
    use crate::persistence::MemoryDatabase;

    /// Minimal in-memory canonical chain.
    struct TestChain {
        config: ChainConfig,
        headers: RwLock<Vec<Header>>,
    }

    impl ChainReader for TestChain {
        fn config(&self) -> &ChainConfig {
            &self.config
        }
        fn current_header(&self) -> Header {
            self.headers.read().last().cloned().unwrap_or_default()
        }
        fn get_header(&self, hash: &Hash, number: u64) -> Option<Header> {
            self.get_header_by_number(number).filter(|h| h.hash() == *hash)
        }
        fn get_header_by_number(&self, number: u64) -> Option<Header> {
            self.headers.read().get(number as usize).cloned()
        }
    }

    fn signer_fn(key: KeyPair) -> SignerFn {
        Arc::new(move |_addr: &Address, digest: &Hash| key.sign_digest(digest))
    }

    fn setup(keys: &[KeyPair]) -> (Clique, TestChain) {
        let signers: Vec<Address> = keys.iter().map(|k| k.address()).collect();
        let genesis = Header {
            extra: genesis_extra(b"", &signers),
            ..Header::default()
        };
        let chain = TestChain {
            config: ChainConfig::all_clique_changes(0),
            headers: RwLock::new(vec![genesis]),
        };
        let clique = Clique::new(CliqueConfig { period: 0, epoch: 30_000 }, Arc::new(MemoryDatabase::new()));
        (clique, chain)
    }

    // Seals the next block with `key`, casting an optional vote.
    fn seal_next(
        clique: &Clique,
        chain: &TestChain,
        key: &KeyPair,
        vote: Option<(Address, bool)>,
    ) -> Result<Header, ChainError> {
        let parent = chain.current_header();
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            ..Header::default()
        };
        clique.inner.proposals.write().clear();
        if let Some((addr, auth)) = vote {
            clique.propose(addr, auth);
        }
        clique.authorize(key.address(), signer_fn(key.clone()));
        clique.prepare(chain, &mut header)?;

        let seal = key.sign_digest(&sig_hash(&header))?;
        let len = header.extra.len();
        header.extra[len - EXTRA_SEAL..].copy_from_slice(&seal.to_bytes());

        clique.verify_header(chain, &header, true)?;
        chain.headers.write().push(header.clone());
        Ok(header)
    }

    #[test]
    fn test_ecrecover_roundtrip() {
        let key = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[key.clone()]);
        let header = seal_next(&clique, &chain, &key, None).unwrap();
        assert_eq!(clique.author(&header).unwrap(), key.address());
        assert_eq!(header.difficulty, DIFF_IN_TURN);
    }

    #[test]
    fn test_unauthorized_signer_rejected() {
        let key = KeyPair::generate().unwrap();
        let outsider = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[key]);
        assert!(seal_next(&clique, &chain, &outsider, None).is_err());
    }

    #[test]
    fn test_recent_signer_must_wait() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[a.clone(), b.clone()]);
        seal_next(&clique, &chain, &a, None).unwrap();
        assert!(seal_next(&clique, &chain, &a, None).is_err());
        seal_next(&clique, &chain, &b, None).unwrap();
        seal_next(&clique, &chain, &a, None).unwrap();
    }

    #[test]
    fn test_single_signer_vote_adds_signer() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[a.clone()]);
        seal_next(&clique, &chain, &a, Some((b.address(), true))).unwrap();

        let signers = clique.get_signers(&chain).unwrap();
        assert_eq!(signers.len(), 2);
        assert!(signers.contains(&b.address()));
    }

    #[test]
    fn test_majority_vote_drops_signer() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[a.clone(), b.clone()]);
        seal_next(&clique, &chain, &a, Some((b.address(), false))).unwrap();
        assert_eq!(clique.get_signers(&chain).unwrap().len(), 2);
        seal_next(&clique, &chain, &b, Some((b.address(), false))).unwrap();
        assert_eq!(clique.get_signers(&chain).unwrap(), vec![a.address()]);
    }

    #[test]
    fn test_seal_without_transactions_waits() {
        let key = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[key.clone()]);
        clique.authorize(key.address(), signer_fn(key));
        let parent = chain.current_header();
        let block = Block::new(
            Header {
                parent_hash: parent.hash(),
                number: 1,
                ..Header::default()
            },
            vec![],
        );
        assert!(clique.seal(&chain, block, &AtomicBool::new(false)).is_err());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snap = Snapshot::new(3, [1u8; 32], vec![Address([4u8; 20])]);
        snap.recents.insert(3, Address([4u8; 20]));
        let json = serde_json::to_vec(&snap).unwrap();
        let back: Snapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_api_propose_and_discard() {
        let key = KeyPair::generate().unwrap();
        let (clique, chain) = setup(&[key]);
        let api = clique.apis(Arc::new(chain)).remove(0);
        assert_eq!(api.namespace, "clique");

        let candidate = Address([9u8; 20]);
        api.service
            .call("propose", vec![json!(candidate.to_string()), json!(true)])
            .unwrap();
        assert_eq!(clique.proposals().get(&candidate), Some(&true));
        api.service.call("discard", vec![json!(candidate.to_string())]).unwrap();
        assert!(clique.proposals().is_empty());
        assert_eq!(api.service.call("getSigners", vec![]).unwrap().as_array().unwrap().len(), 1);
    }
}

use crate::blockchain::core::bloom::Bloom;
use crate::blockchain::core::validation::{validate_body, validate_linkage};
use crate::consensus::Engine;
use crate::crypto::{hash_to_hex, Address, Hash};
use crate::error::ChainError;
use crate::params::ChainConfig;
use crate::persistence::{Batch, ChainDb};
use crate::rawdb;
use crate::txpool::Transaction;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    pub coinbase: Address,
    pub number: u64,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub difficulty: u64,
    pub gas_limit: u64,
    pub tx_root: Hash,
    pub bloom: Bloom,
    pub extra: Vec<u8>,
    pub mix_digest: Hash,
    pub nonce: u64,
}

impl Header {
    pub fn hash(&self) -> Hash {
        self.hash_with_extra(&self.extra)
    }

    /// Hash over every field except the seal (mix digest and nonce).
    pub fn seal_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.update_fields(&mut hasher, &self.extra);
        hasher.finalize().into()
    }

    /// Full header hash computed as if the extra-data field held `extra`.
    pub fn hash_with_extra(&self, extra: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        self.update_fields(&mut hasher, extra);
        hasher.update(self.mix_digest);
        hasher.update(self.nonce.to_be_bytes());
        hasher.finalize().into()
    }

    fn update_fields(&self, hasher: &mut Sha256, extra: &[u8]) {
        hasher.update(self.parent_hash);
        hasher.update(self.coinbase.as_bytes());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.tx_root);
        hasher.update(self.bloom.as_bytes());
        hasher.update((extra.len() as u64).to_be_bytes());
        hasher.update(extra);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assembles a block, filling in the transaction root and log bloom.
    pub fn new(mut header: Header, transactions: Vec<Transaction>) -> Self {
        header.tx_root = Block::calculate_merkle_root(&transactions);
        let mut bloom = Bloom::default();
        for tx in &transactions {
            bloom.union(&tx.bloom());
        }
        header.bloom = bloom;
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn with_seal(&self, header: Header) -> Block {
        Block {
            header,
            transactions: self.transactions.clone(),
        }
    }

    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }
}

/// Read access to the canonical chain, as needed by consensus engines.
pub trait ChainReader: Send + Sync {
    fn config(&self) -> &ChainConfig;
    fn current_header(&self) -> Header;
    fn get_header(&self, hash: &Hash, number: u64) -> Option<Header>;
    fn get_header_by_number(&self, number: u64) -> Option<Header>;
}

/// Posted whenever the canonical head moves, forwards or backwards.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub block: Block,
}

pub struct BlockChain {
    db: Arc<dyn ChainDb>,
    config: ChainConfig,
    engine: Arc<dyn Engine>,
    genesis: RwLock<Block>,
    current: RwLock<Block>,
    chainmu: Mutex<()>,
    head_subscribers: Mutex<Vec<Sender<ChainHeadEvent>>>,
    stopped: AtomicBool,
}

impl BlockChain {
    /// Opens the canonical chain stored in `db`. The genesis block must already
    /// be committed.
    pub fn new(
        db: Arc<dyn ChainDb>,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, ChainError> {
        let genesis = canonical_block(db.as_ref(), 0)?
            .ok_or_else(|| ChainError::InvalidBlock("no genesis block in database".to_string()))?;

        let current = match rawdb::read_head_block_hash(db.as_ref())? {
            Some(hash) => match rawdb::read_block(db.as_ref(), &hash)? {
                Some(block) => block,
                None => {
                    warn!("Head block {} missing, resetting to genesis", hash_to_hex(&hash));
                    genesis.clone()
                }
            },
            None => genesis.clone(),
        };

        info!(
            "Loaded most recent local block: number {} hash {}",
            current.number(),
            hash_to_hex(&current.hash())
        );

        Ok(BlockChain {
            db,
            config,
            engine,
            genesis: RwLock::new(genesis),
            current: RwLock::new(current),
            chainmu: Mutex::new(()),
            head_subscribers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    pub fn db(&self) -> Arc<dyn ChainDb> {
        self.db.clone()
    }

    pub fn genesis(&self) -> Block {
        self.genesis.read().clone()
    }

    pub fn current_block(&self) -> Block {
        self.current.read().clone()
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        canonical_block(self.db.as_ref(), number)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        rawdb::read_block(self.db.as_ref(), hash)
    }

    /// Imports blocks that extend the current head one by one. Returns the
    /// number of blocks imported.
    pub fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError> {
        let mut imported = 0;
        for block in blocks {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ChainError::Lifecycle("blockchain is stopped".to_string()));
            }
            let _guard = self.chainmu.lock();
            let parent = self.current_block();

            validate_linkage(&parent.header, &block)?;
            validate_body(&block)?;
            self.engine.verify_header(self, &block.header, true)?;

            rawdb::write_canonical_block(self.db.as_ref(), &block)?;
            *self.current.write() = block.clone();
            imported += 1;

            info!(
                "Imported new chain segment: number {} hash {} txs {}",
                block.number(),
                hash_to_hex(&block.hash()),
                block.transactions.len()
            );
            self.notify_head(block);
        }
        Ok(imported)
    }

    /// Rewinds the canonical chain to `number`, deleting everything above it.
    pub fn set_head(&self, number: u64) -> Result<(), ChainError> {
        let _guard = self.chainmu.lock();
        let current = self.current_block();
        if number >= current.number() {
            return Ok(());
        }
        warn!("Rewinding blockchain: target {} from {}", number, current.number());

        let target = canonical_block(self.db.as_ref(), number)?.ok_or_else(|| {
            ChainError::InvalidBlock(format!("no canonical block at height {}", number))
        })?;

        let mut batch = Batch::new();
        for n in (number + 1)..=current.number() {
            if let Some(hash) = rawdb::read_canonical_hash(self.db.as_ref(), n)? {
                rawdb::batch_delete_block(&mut batch, &hash);
            }
            rawdb::batch_delete_canonical_hash(&mut batch, n);
        }
        rawdb::batch_write_head(&mut batch, &target.hash());
        self.db.write_batch(batch)?;

        *self.current.write() = target.clone();
        self.notify_head(target);
        Ok(())
    }

    /// Purges the entire chain and installs `genesis` as the only block.
    pub fn reset_with_genesis_block(&self, genesis: Block) -> Result<(), ChainError> {
        self.set_head(0)?;
        let _guard = self.chainmu.lock();

        let old = self.genesis();
        let mut batch = Batch::new();
        rawdb::batch_delete_block(&mut batch, &old.hash());
        rawdb::batch_write_block(&mut batch, &genesis)?;
        rawdb::batch_write_canonical_hash(&mut batch, 0, &genesis.hash());
        rawdb::batch_write_head(&mut batch, &genesis.hash());
        self.db.write_batch(batch)?;

        *self.genesis.write() = genesis.clone();
        *self.current.write() = genesis.clone();
        info!("Chain reset to genesis {}", hash_to_hex(&genesis.hash()));
        self.notify_head(genesis);
        Ok(())
    }

    pub fn subscribe_chain_head(&self) -> Receiver<ChainHeadEvent> {
        let (tx, rx) = unbounded();
        if !self.stopped.load(Ordering::SeqCst) {
            self.head_subscribers.lock().push(tx);
        }
        rx
    }

    /// Writes the canonical blocks `first..=last` as JSON lines.
    pub fn export_range(&self, out: &mut dyn Write, first: u64, last: u64) -> Result<u64, ChainError> {
        if first > last {
            return Err(ChainError::InvalidBlock(format!(
                "export failed: first ({}) is greater than last ({})",
                first, last
            )));
        }
        let mut written = 0;
        for number in first..=last {
            let block = self.get_block_by_number(number)?.ok_or_else(|| {
                ChainError::InvalidBlock(format!("export failed on #{}: not found", number))
            })?;
            serde_json::to_writer(&mut *out, &block)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        Ok(written)
    }

    /// Stops accepting blocks and disconnects head subscribers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.chainmu.lock();
        self.head_subscribers.lock().clear();
        info!("Blockchain manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn notify_head(&self, block: Block) {
        let event = ChainHeadEvent { block };
        self.head_subscribers
            .lock()
            .retain(|sub| sub.send(event.clone()).is_ok());
    }
}

impl ChainReader for BlockChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn current_header(&self) -> Header {
        self.current.read().header.clone()
    }

    fn get_header(&self, hash: &Hash, number: u64) -> Option<Header> {
        match rawdb::read_header(self.db.as_ref(), hash) {
            Ok(Some(header)) if header.number == number => Some(header),
            _ => None,
        }
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let hash = rawdb::read_canonical_hash(self.db.as_ref(), number).ok()??;
        rawdb::read_header(self.db.as_ref(), &hash).ok()?
    }
}

fn canonical_block(db: &dyn ChainDb, number: u64) -> Result<Option<Block>, ChainError> {
    match rawdb::read_canonical_hash(db, number)? {
        Some(hash) => rawdb::read_block(db, &hash),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ethash::{Ethash, EthashConfig, PowMode};
    use crate::genesis::Genesis;
    use crate::persistence::MemoryDatabase;

    fn test_chain() -> (Arc<MemoryDatabase>, BlockChain) {
        let db = Arc::new(MemoryDatabase::new());
        let genesis = Genesis::developer_pow();
        genesis.commit(db.as_ref()).unwrap();
        let engine: Arc<dyn Engine> = Arc::new(Ethash::new(EthashConfig {
            pow_mode: PowMode::Fake,
            ..EthashConfig::default()
        }));
        let chain = BlockChain::new(db.clone(), genesis.config.clone(), engine).unwrap();
        (db, chain)
    }

    fn child_of(parent: &Block) -> Block {
        let header = Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            timestamp: parent.header.timestamp + 10,
            difficulty: 1,
            gas_limit: parent.header.gas_limit,
            ..Header::default()
        };
        Block::new(header, vec![])
    }

    fn extend(chain: &BlockChain, n: usize) {
        for _ in 0..n {
            let next = child_of(&chain.current_block());
            chain.insert_chain(vec![next]).unwrap();
        }
    }

    #[test]
    fn test_header_hash_covers_seal() {
        let mut header = Header::default();
        let seal_hash = header.seal_hash();
        let hash = header.hash();
        header.nonce = 42;
        assert_eq!(header.seal_hash(), seal_hash);
        assert_ne!(header.hash(), hash);
    }

    #[test]
    fn test_insert_extends_head() {
        let (_db, chain) = test_chain();
        extend(&chain, 3);
        assert_eq!(chain.current_block().number(), 3);
        assert_eq!(chain.get_header_by_number(2).unwrap().number, 2);
    }

    #[test]
    fn test_insert_rejects_unlinked_block() {
        let (_db, chain) = test_chain();
        let mut orphan = child_of(&chain.current_block());
        orphan.header.parent_hash = [9u8; 32];
        assert!(chain.insert_chain(vec![orphan]).is_err());
        assert_eq!(chain.current_block().number(), 0);
    }

    #[test]
    fn test_set_head_discards_above_target() {
        let (db, chain) = test_chain();
        extend(&chain, 5);
        chain.set_head(2).unwrap();

        assert_eq!(chain.current_block().number(), 2);
        assert!(chain.get_block_by_number(3).unwrap().is_none());
        assert_eq!(
            rawdb::read_head_block_hash(db.as_ref()).unwrap(),
            Some(chain.current_block().hash())
        );
    }

    #[test]
    fn test_reopen_restores_head() {
        let (db, chain) = test_chain();
        extend(&chain, 2);
        let head = chain.current_block().hash();
        let reopened = BlockChain::new(db, chain.config().clone(), chain.engine()).unwrap();
        assert_eq!(reopened.current_block().hash(), head);
    }

    #[test]
    fn test_head_subscribers_receive_events() {
        let (_db, chain) = test_chain();
        let rx = chain.subscribe_chain_head();
        extend(&chain, 1);
        assert_eq!(rx.recv().unwrap().block.number(), 1);

        chain.stop();
        assert!(rx.recv().is_err());
        let next = child_of(&chain.current_block());
        assert!(chain.insert_chain(vec![next]).is_err());
    }

    #[test]
    fn test_export_range() {
        let (_db, chain) = test_chain();
        extend(&chain, 2);
        let mut out = Vec::new();
        assert_eq!(chain.export_range(&mut out, 0, 2).unwrap(), 3);
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 3);
        assert!(chain.export_range(&mut out, 3, 1).is_err());
    }
}

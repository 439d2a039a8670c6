//! Pending transaction pool
//!
//! Holds executable transactions keyed by hash, enforces the gas-price floor
//! for remote submissions and journals local transactions across restarts.

use crate::blockchain::{Block, Bloom};
use crate::crypto::{Address, Hash};
use crate::error::ChainError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas: u64,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: u128,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.gas_price.to_be_bytes());
        hasher.update(self.gas.to_be_bytes());
        hasher.update(self.from.as_bytes());
        match &self.to {
            Some(to) => {
                hasher.update([1u8]);
                hasher.update(to.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.value.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    /// Log bloom contribution of this transaction: sender and recipient.
    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::default();
        bloom.add_address(&self.from);
        if let Some(to) = &self.to {
            bloom.add_address(to);
        }
        bloom
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPoolConfig {
    /// Disk journal for local transactions, resolved against the data dir.
    #[serde(default = "default_journal")]
    pub journal: Option<PathBuf>,
    #[serde(default = "default_global_slots")]
    pub global_slots: usize,
    #[serde(default)]
    pub no_locals: bool,
}

fn default_journal() -> Option<PathBuf> {
    Some(PathBuf::from("transactions.rlp"))
}

fn default_global_slots() -> usize {
    4096
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig {
            journal: default_journal(),
            global_slots: default_global_slots(),
            no_locals: false,
        }
    }
}

pub struct TxPool {
    config: TxPoolConfig,
    gas_price: RwLock<u128>,
    pending: RwLock<BTreeMap<(Address, u64), Transaction>>,
    locals: RwLock<HashSet<Hash>>,
    stopped: AtomicBool,
}

impl TxPool {
    pub fn new(config: TxPoolConfig, gas_price: u128) -> Self {
        let pool = TxPool {
            config,
            gas_price: RwLock::new(gas_price),
            pending: RwLock::new(BTreeMap::new()),
            locals: RwLock::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        };
        if !pool.config.no_locals {
            if let Err(e) = pool.load_journal() {
                warn!("Failed to load transaction journal: {}", e);
            }
        }
        pool
    }

    pub fn gas_price(&self) -> u128 {
        *self.gas_price.read()
    }

    /// Raises or lowers the minimum price for remote transactions.
    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.write() = price;
        info!("Transaction pool price threshold updated: {}", price);
    }

    /// Adds a transaction submitted through this node. Exempt from the price floor.
    pub fn add_local(&self, tx: Transaction) -> Result<Hash, ChainError> {
        let hash = self.insert(tx, true)?;
        if !self.config.no_locals {
            self.locals.write().insert(hash);
        }
        Ok(hash)
    }

    pub fn add_remote(&self, tx: Transaction) -> Result<Hash, ChainError> {
        self.insert(tx, false)
    }

    fn insert(&self, tx: Transaction, local: bool) -> Result<Hash, ChainError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ChainError::TxPoolError("transaction pool is stopped".to_string()));
        }
        if !local && tx.gas_price < self.gas_price() {
            return Err(ChainError::TxPoolError(format!(
                "transaction underpriced: {} < {}",
                tx.gas_price,
                self.gas_price()
            )));
        }
        let mut pending = self.pending.write();
        if pending.len() >= self.config.global_slots && !pending.contains_key(&(tx.from, tx.nonce)) {
            return Err(ChainError::TxPoolError("transaction pool is full".to_string()));
        }
        let hash = tx.hash();
        debug!("Pooled new transaction {}", hex::encode(hash));
        pending.insert((tx.from, tx.nonce), tx);
        Ok(hash)
    }

    /// Pending transactions ordered by sender and nonce.
    pub fn pending(&self) -> Vec<Transaction> {
        self.pending.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    /// Drops every transaction included in `block`.
    pub fn remove_included(&self, block: &Block) {
        let mut pending = self.pending.write();
        let mut locals = self.locals.write();
        for tx in &block.transactions {
            if pending.remove(&(tx.from, tx.nonce)).is_some() {
                locals.remove(&tx.hash());
            }
        }
    }

    /// Stops admission and rotates the local journal.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.write_journal() {
            warn!("Failed to write transaction journal: {}", e);
        }
        info!("Transaction pool stopped");
    }

    fn load_journal(&self) -> Result<(), ChainError> {
        let path = match &self.config.journal {
            Some(path) if path.exists() => path,
            _ => return Ok(()),
        };
        let reader = BufReader::new(File::open(path)?);
        let mut loaded = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let tx: Transaction = serde_json::from_str(&line)?;
            self.add_local(tx)?;
            loaded += 1;
        }
        info!("Loaded local transaction journal: {} transactions", loaded);
        Ok(())
    }

    fn write_journal(&self) -> Result<(), ChainError> {
        let path = match &self.config.journal {
            Some(path) if !self.config.no_locals => path,
            _ => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let locals = self.locals.read();
        let mut file = File::create(path)?;
        for tx in self.pending.read().values() {
            if locals.contains(&tx.hash()) {
                serde_json::to_writer(&mut file, tx)?;
                file.write_all(b"\n")?;
            }
        }
        debug!("Regenerated local transaction journal at {}", path.display());
        Ok(())
    }
}

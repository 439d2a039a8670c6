//! Account management
//!
//! The node only needs two things from account custody: a list of known
//! accounts (for etherbase discovery) and the ability to sign a digest with
//! one of them (for proof-of-authority sealing). Both go through [`Wallet`].

use crate::crypto::{Address, Hash, KeyPair, SignedDigest};
use crate::error::ChainError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub trait Wallet: Send + Sync {
    fn url(&self) -> String;
    fn accounts(&self) -> Vec<Address>;

    fn contains(&self, address: &Address) -> bool {
        self.accounts().contains(address)
    }

    /// Whether signing is currently refused.
    fn is_locked(&self) -> bool;

    fn sign_hash(&self, address: &Address, digest: &Hash) -> Result<SignedDigest, ChainError>;
}

/// Single-key wallet held in memory, locked until explicitly unlocked.
pub struct LocalWallet {
    url: String,
    key: KeyPair,
    locked: AtomicBool,
}

/// On-disk form of a [`LocalWallet`].
#[derive(Serialize, Deserialize)]
struct KeyFile {
    address: Address,
    secret: String,
    created_at: String,
}

impl LocalWallet {
    pub fn new(key: KeyPair) -> Self {
        LocalWallet {
            url: format!("local://{}", key.address()),
            key,
            locked: AtomicBool::new(true),
        }
    }

    pub fn generate() -> Result<Self, ChainError> {
        Ok(Self::new(KeyPair::generate()?))
    }

    /// Loads a key file, creating one with a fresh key when it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ChainError> {
        if path.exists() {
            let file: KeyFile = serde_json::from_slice(&fs::read(path)?)?;
            let secret = hex::decode(&file.secret)
                .map_err(|e| ChainError::WalletError(format!("Invalid key file: {}", e)))?;
            let wallet = Self::new(KeyPair::from_secret_bytes(&secret)?);
            if wallet.key.address() != file.address {
                return Err(ChainError::WalletError(format!(
                    "Key file address {} does not match its key",
                    file.address
                )));
            }
            return Ok(wallet);
        }

        let wallet = Self::generate()?;
        let file = KeyFile {
            address: wallet.key.address(),
            secret: hex::encode(wallet.key.secret_key.secret_bytes()),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        info!("Created new account {} at {}", file.address, path.display());
        Ok(wallet)
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }
}

impl Wallet for LocalWallet {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn accounts(&self) -> Vec<Address> {
        vec![self.key.address()]
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn sign_hash(&self, address: &Address, digest: &Hash) -> Result<SignedDigest, ChainError> {
        if *address != self.key.address() {
            return Err(ChainError::WalletError(format!("unknown account {}", address)));
        }
        if self.is_locked() {
            return Err(ChainError::WalletError(format!("account {} is locked", address)));
        }
        self.key.sign_digest(digest)
    }
}

#[derive(Default)]
pub struct AccountManager {
    wallets: RwLock<Vec<Arc<dyn Wallet>>>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_wallet(&self, wallet: Arc<dyn Wallet>) {
        info!("Wallet arrived: {}", wallet.url());
        self.wallets.write().push(wallet);
    }

    pub fn wallets(&self) -> Vec<Arc<dyn Wallet>> {
        self.wallets.read().clone()
    }

    /// Every account across all wallets, in wallet order.
    pub fn accounts(&self) -> Vec<Address> {
        self.wallets.read().iter().flat_map(|w| w.accounts()).collect()
    }

    /// Wallet holding `address`.
    pub fn find(&self, address: &Address) -> Result<Arc<dyn Wallet>, ChainError> {
        self.wallets
            .read()
            .iter()
            .find(|w| w.contains(address))
            .cloned()
            .ok_or_else(|| ChainError::WalletError(format!("unknown account {}", address)))
    }
}

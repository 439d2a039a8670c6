//! Genesis definitions and reconciliation with the stored chain

use crate::blockchain::{Block, Header};
use crate::consensus::clique;
use crate::crypto::{hash_to_hex, Address, Hash};
use crate::error::ChainError;
use crate::params::{ChainConfig, ConfigCompatError};
use crate::persistence::ChainDb;
use crate::rawdb;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub balance: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub config: ChainConfig,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, with = "hex_bytes")]
    pub extra_data: Vec<u8>,
    pub gas_limit: u64,
    pub difficulty: u64,
    #[serde(default)]
    pub coinbase: Address,
    #[serde(default)]
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

impl Genesis {
    /// The main network genesis block.
    pub fn mainnet() -> Self {
        Genesis {
            config: ChainConfig::mainnet(),
            nonce: 66,
            timestamp: 0,
            extra_data: b"vsc mainnet genesis".to_vec(),
            gas_limit: 5000,
            difficulty: 17_179_869_184,
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }

    pub fn testnet() -> Self {
        Genesis {
            config: ChainConfig::testnet(),
            nonce: 66,
            timestamp: 0,
            extra_data: b"vsc testnet genesis".to_vec(),
            gas_limit: 16_777_216,
            difficulty: 1_048_576,
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }

    /// Proof-of-authority test network.
    pub fn rinkeby() -> Self {
        let signer = Address([
            0x42, 0xeb, 0x76, 0x8f, 0x22, 0x44, 0xc8, 0x81, 0x1c, 0x63, 0x72, 0x9a, 0x21, 0xa3, 0x56,
            0x9f, 0x00, 0x12, 0x02, 0x51,
        ]);
        Genesis {
            config: ChainConfig::rinkeby(),
            nonce: 0,
            timestamp: 1_492_009_146,
            extra_data: clique::genesis_extra(b"", &[signer]),
            gas_limit: 4_700_000,
            difficulty: 1,
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }

    /// Single-signer proof-of-authority chain for local development, funding `faucet`.
    pub fn developer(period: u64, faucet: Address) -> Self {
        let mut alloc = BTreeMap::new();
        alloc.insert(faucet, GenesisAccount { balance: u128::MAX >> 1 });
        Genesis {
            config: ChainConfig::all_clique_changes(period),
            nonce: 0,
            timestamp: 0,
            extra_data: clique::genesis_extra(b"", &[faucet]),
            gas_limit: 6_283_185,
            difficulty: 1,
            coinbase: Address::zero(),
            alloc,
        }
    }

    /// Proof-of-work chain with every fork active and trivial difficulty.
    pub fn developer_pow() -> Self {
        Genesis {
            config: ChainConfig::all_ethash_changes(),
            nonce: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            gas_limit: 6_283_185,
            difficulty: 1,
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Commitment to the initial allocation, stored in the genesis transaction root.
    fn alloc_root(&self) -> Hash {
        let mut hasher = Sha256::new();
        for (address, account) in &self.alloc {
            hasher.update(address.as_bytes());
            hasher.update(account.balance.to_be_bytes());
        }
        hasher.finalize().into()
    }

    /// Builds the genesis block. The chain config is not part of its hash.
    pub fn to_block(&self) -> Block {
        let header = Header {
            number: 0,
            nonce: self.nonce,
            timestamp: self.timestamp,
            extra: self.extra_data.clone(),
            gas_limit: self.gas_limit,
            difficulty: self.difficulty,
            coinbase: self.coinbase,
            tx_root: self.alloc_root(),
            ..Header::default()
        };
        Block {
            header,
            transactions: Vec::new(),
        }
    }

    /// Writes the genesis block as the canonical head and stores its config.
    pub fn commit(&self, db: &dyn ChainDb) -> Result<Block, ChainError> {
        let block = self.to_block();
        rawdb::write_canonical_block(db, &block)?;
        rawdb::write_chain_config(db, &block.hash(), &self.config)?;
        Ok(block)
    }
}

/// How a requested genesis relates to what is already stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityOutcome {
    FirstRun,
    Matching,
    /// The stored chain passed a fork the new config moves; rewind before continuing.
    IncompatibleWithRewind { rewind_to: u64, error: ConfigCompatError },
    IncompatibleFatal { stored: Hash, new: Hash },
}

#[derive(Debug, Clone)]
pub struct GenesisSetup {
    pub config: ChainConfig,
    pub genesis_hash: Hash,
    pub outcome: CompatibilityOutcome,
}

/// Reconciles `genesis` (or the mainnet default) with the database contents.
pub fn setup_genesis_block(db: &dyn ChainDb, genesis: Option<&Genesis>) -> Result<GenesisSetup, ChainError> {
    let stored = match rawdb::read_canonical_hash(db, 0)? {
        Some(hash) => hash,
        None => {
            let default;
            let genesis = match genesis {
                Some(genesis) => {
                    info!("Writing custom genesis block");
                    genesis
                }
                None => {
                    info!("Writing default main-net genesis block");
                    default = Genesis::mainnet();
                    &default
                }
            };
            let block = genesis.commit(db)?;
            return Ok(GenesisSetup {
                config: genesis.config.clone(),
                genesis_hash: block.hash(),
                outcome: CompatibilityOutcome::FirstRun,
            });
        }
    };

    if let Some(genesis) = genesis {
        let hash = genesis.to_block().hash();
        if hash != stored {
            return Ok(GenesisSetup {
                config: genesis.config.clone(),
                genesis_hash: stored,
                outcome: CompatibilityOutcome::IncompatibleFatal { stored, new: hash },
            });
        }
    }

    let new_config = config_or_default(genesis, &stored);
    let stored_config = match rawdb::read_chain_config(db, &stored)? {
        Some(config) => config,
        None => {
            warn!("Found genesis block without chain config");
            rawdb::write_chain_config(db, &stored, &new_config)?;
            return Ok(GenesisSetup {
                config: new_config,
                genesis_hash: stored,
                outcome: CompatibilityOutcome::FirstRun,
            });
        }
    };

    // Custom chains keep their stored config unless a genesis is supplied.
    if genesis.is_none() && stored != Genesis::mainnet().to_block().hash() {
        return Ok(GenesisSetup {
            config: stored_config,
            genesis_hash: stored,
            outcome: CompatibilityOutcome::Matching,
        });
    }

    let head = rawdb::read_head_header_hash(db)?
        .ok_or_else(|| ChainError::DatabaseError("missing head header hash".to_string()))?;
    let height = rawdb::read_header_number(db, &head)?.ok_or_else(|| {
        ChainError::DatabaseError(format!("missing block number for head header hash {}", hash_to_hex(&head)))
    })?;

    if let Some(error) = stored_config.check_compatible(&new_config, height) {
        if height != 0 && error.rewind_to != 0 {
            return Ok(GenesisSetup {
                config: new_config,
                genesis_hash: stored,
                outcome: CompatibilityOutcome::IncompatibleWithRewind {
                    rewind_to: error.rewind_to,
                    error,
                },
            });
        }
    }
    rawdb::write_chain_config(db, &stored, &new_config)?;
    Ok(GenesisSetup {
        config: new_config,
        genesis_hash: stored,
        outcome: CompatibilityOutcome::Matching,
    })
}

fn config_or_default(genesis: Option<&Genesis>, stored: &Hash) -> ChainConfig {
    if let Some(genesis) = genesis {
        return genesis.config.clone();
    }
    if *stored == Genesis::mainnet().to_block().hash() {
        ChainConfig::mainnet()
    } else if *stored == Genesis::testnet().to_block().hash() {
        ChainConfig::testnet()
    } else if *stored == Genesis::rinkeby().to_block().hash() {
        ChainConfig::rinkeby()
    } else {
        ChainConfig::all_ethash_changes()
    }
}

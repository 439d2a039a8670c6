//! Typed accessors over the chain database key space
//!
//! Key layout:
//! - `DatabaseVersion` -> schema revision (u64, big endian)
//! - `vsc-config-<genesis hash>` -> chain config (JSON)
//! - `H<number>` -> canonical block hash
//! - `n<hash>` -> block number
//! - `h<hash>` -> header (bincode)
//! - `b<hash>` -> block body (bincode)
//! - `LastBlock` / `LastHeader` -> head hashes
//! - `blt<bit><section><head>` -> bloom bit-vector of one section
//! - `shead<section>` -> head hash of an indexed bloom section
//! - `bltIndex-count` -> number of valid bloom sections

use crate::blockchain::{Block, Header};
use crate::crypto::Hash;
use crate::error::ChainError;
use crate::params::ChainConfig;
use crate::persistence::{Batch, ChainDb};
use crate::txpool::Transaction;

const DATABASE_VERSION_KEY: &[u8] = b"DatabaseVersion";
const CONFIG_PREFIX: &[u8] = b"vsc-config-";
const CANONICAL_PREFIX: &[u8] = b"H";
const NUMBER_PREFIX: &[u8] = b"n";
const HEADER_PREFIX: &[u8] = b"h";
const BODY_PREFIX: &[u8] = b"b";
const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
const BLOOM_BITS_PREFIX: &[u8] = b"blt";
const SECTION_HEAD_PREFIX: &[u8] = b"shead";
const VALID_SECTIONS_KEY: &[u8] = b"bltIndex-count";

fn key(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

fn to_hash(bytes: &[u8]) -> Result<Hash, ChainError> {
    bytes
        .try_into()
        .map_err(|_| ChainError::DatabaseError(format!("corrupt hash entry ({} bytes)", bytes.len())))
}

fn to_u64(bytes: &[u8]) -> Result<u64, ChainError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::DatabaseError(format!("corrupt integer entry ({} bytes)", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Returns the stored schema version, zero for a fresh database.
pub fn read_database_version(db: &dyn ChainDb) -> Result<u64, ChainError> {
    match db.get(DATABASE_VERSION_KEY)? {
        Some(bytes) => to_u64(&bytes),
        None => Ok(0),
    }
}

pub fn write_database_version(db: &dyn ChainDb, version: u64) -> Result<(), ChainError> {
    db.put(DATABASE_VERSION_KEY, &version.to_be_bytes())
}

pub fn read_chain_config(db: &dyn ChainDb, genesis: &Hash) -> Result<Option<ChainConfig>, ChainError> {
    match db.get(&key(CONFIG_PREFIX, &[genesis]))? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn write_chain_config(db: &dyn ChainDb, genesis: &Hash, config: &ChainConfig) -> Result<(), ChainError> {
    let data = serde_json::to_vec(config)?;
    db.put(&key(CONFIG_PREFIX, &[genesis]), &data)
}

pub fn read_canonical_hash(db: &dyn ChainDb, number: u64) -> Result<Option<Hash>, ChainError> {
    db.get(&key(CANONICAL_PREFIX, &[&number.to_be_bytes()]))?
        .map(|b| to_hash(&b))
        .transpose()
}

pub fn read_header_number(db: &dyn ChainDb, hash: &Hash) -> Result<Option<u64>, ChainError> {
    db.get(&key(NUMBER_PREFIX, &[hash]))?
        .map(|b| to_u64(&b))
        .transpose()
}

pub fn read_header(db: &dyn ChainDb, hash: &Hash) -> Result<Option<Header>, ChainError> {
    match db.get(&key(HEADER_PREFIX, &[hash]))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn read_body(db: &dyn ChainDb, hash: &Hash) -> Result<Option<Vec<Transaction>>, ChainError> {
    match db.get(&key(BODY_PREFIX, &[hash]))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn read_block(db: &dyn ChainDb, hash: &Hash) -> Result<Option<Block>, ChainError> {
    let header = match read_header(db, hash)? {
        Some(header) => header,
        None => return Ok(None),
    };
    let transactions = read_body(db, hash)?.unwrap_or_default();
    Ok(Some(Block {
        header,
        transactions,
    }))
}

pub fn read_head_block_hash(db: &dyn ChainDb) -> Result<Option<Hash>, ChainError> {
    db.get(HEAD_BLOCK_KEY)?.map(|b| to_hash(&b)).transpose()
}

pub fn read_head_header_hash(db: &dyn ChainDb) -> Result<Option<Hash>, ChainError> {
    db.get(HEAD_HEADER_KEY)?.map(|b| to_hash(&b)).transpose()
}

/// Adds a block, its number index and header/body to `batch`.
pub fn batch_write_block(batch: &mut Batch, block: &Block) -> Result<(), ChainError> {
    let hash = block.hash();
    batch.put(&key(HEADER_PREFIX, &[&hash]), &bincode::serialize(&block.header)?);
    batch.put(&key(BODY_PREFIX, &[&hash]), &bincode::serialize(&block.transactions)?);
    batch.put(&key(NUMBER_PREFIX, &[&hash]), &block.header.number.to_be_bytes());
    Ok(())
}

pub fn batch_write_canonical_hash(batch: &mut Batch, number: u64, hash: &Hash) {
    batch.put(&key(CANONICAL_PREFIX, &[&number.to_be_bytes()]), hash);
}

pub fn batch_delete_canonical_hash(batch: &mut Batch, number: u64) {
    batch.delete(&key(CANONICAL_PREFIX, &[&number.to_be_bytes()]));
}

pub fn batch_delete_block(batch: &mut Batch, hash: &Hash) {
    batch.delete(&key(HEADER_PREFIX, &[hash]));
    batch.delete(&key(BODY_PREFIX, &[hash]));
    batch.delete(&key(NUMBER_PREFIX, &[hash]));
}

pub fn batch_write_head(batch: &mut Batch, hash: &Hash) {
    batch.put(HEAD_BLOCK_KEY, hash);
    batch.put(HEAD_HEADER_KEY, hash);
}

/// Writes a block as the single canonical entry at its height and moves the head to it.
pub fn write_canonical_block(db: &dyn ChainDb, block: &Block) -> Result<(), ChainError> {
    let mut batch = Batch::new();
    batch_write_block(&mut batch, block)?;
    batch_write_canonical_hash(&mut batch, block.header.number, &block.hash());
    batch_write_head(&mut batch, &block.hash());
    db.write_batch(batch)
}

pub fn read_bloom_bits(
    db: &dyn ChainDb,
    bit: u32,
    section: u64,
    head: &Hash,
) -> Result<Option<Vec<u8>>, ChainError> {
    db.get(&key(
        BLOOM_BITS_PREFIX,
        &[&(bit as u16).to_be_bytes(), &section.to_be_bytes(), head],
    ))
}

pub fn batch_write_bloom_bits(batch: &mut Batch, bit: u32, section: u64, head: &Hash, bits: &[u8]) {
    batch.put(
        &key(
            BLOOM_BITS_PREFIX,
            &[&(bit as u16).to_be_bytes(), &section.to_be_bytes(), head],
        ),
        bits,
    );
}

pub fn read_section_head(db: &dyn ChainDb, section: u64) -> Result<Option<Hash>, ChainError> {
    db.get(&key(SECTION_HEAD_PREFIX, &[&section.to_be_bytes()]))?
        .map(|b| to_hash(&b))
        .transpose()
}

pub fn batch_write_section_head(batch: &mut Batch, section: u64, head: &Hash) {
    batch.put(&key(SECTION_HEAD_PREFIX, &[&section.to_be_bytes()]), head);
}

pub fn batch_delete_section_head(batch: &mut Batch, section: u64) {
    batch.delete(&key(SECTION_HEAD_PREFIX, &[&section.to_be_bytes()]));
}

pub fn read_valid_sections(db: &dyn ChainDb) -> Result<u64, ChainError> {
    match db.get(VALID_SECTIONS_KEY)? {
        Some(bytes) => to_u64(&bytes),
        None => Ok(0),
    }
}

pub fn batch_write_valid_sections(batch: &mut Batch, sections: u64) {
    batch.put(VALID_SECTIONS_KEY, &sections.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryDatabase;

    #[test]
    fn test_fresh_database_version_is_zero() {
        let db = MemoryDatabase::new();
        assert_eq!(read_database_version(&db).unwrap(), 0);
        write_database_version(&db, 3).unwrap();
        assert_eq!(read_database_version(&db).unwrap(), 3);
    }

    #[test]
    fn test_chain_config_keyed_by_genesis() {
        let db = MemoryDatabase::new();
        let genesis_a = [1u8; 32];
        let genesis_b = [2u8; 32];
        write_chain_config(&db, &genesis_a, &ChainConfig::mainnet()).unwrap();

        assert_eq!(read_chain_config(&db, &genesis_a).unwrap(), Some(ChainConfig::mainnet()));
        assert_eq!(read_chain_config(&db, &genesis_b).unwrap(), None);
    }

    #[test]
    fn test_canonical_block_roundtrip() {
        let db = MemoryDatabase::new();
        let mut header = Header::default();
        header.number = 7;
        header.extra = b"block seven".to_vec();
        let block = Block {
            header,
            transactions: vec![],
        };
        write_canonical_block(&db, &block).unwrap();

        let hash = read_canonical_hash(&db, 7).unwrap().unwrap();
        assert_eq!(hash, block.hash());
        assert_eq!(read_header_number(&db, &hash).unwrap(), Some(7));
        assert_eq!(read_head_block_hash(&db).unwrap(), Some(hash));
        assert_eq!(read_block(&db, &hash).unwrap().unwrap().header.extra, b"block seven");
    }

    #[test]
    fn test_corrupt_version_entry() {
        let db = MemoryDatabase::new();
        db.put(DATABASE_VERSION_KEY, &[1, 2, 3]).unwrap();
        assert!(read_database_version(&db).is_err());
    }
}

//! Integration tests for genesis reconciliation and chain rewinds across restarts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vscnode::blockchain::{Block, BlockChain, Header};
use vscnode::config::NodeConfig;
use vscnode::consensus::{EthashConfig, PowMode};
use vscnode::error::ChainError;
use vscnode::genesis::{CompatibilityOutcome, Genesis};
use vscnode::node::{create_db, NodeService, ServiceContext};
use vscnode::params::BLOCKCHAIN_VERSION;
use vscnode::rawdb;

fn write_genesis(dir: &Path, name: &str, genesis: &Genesis) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(genesis)?)?;
    Ok(path)
}

fn node_config(genesis: PathBuf) -> NodeConfig {
    NodeConfig {
        genesis: Some(genesis),
        ethash: EthashConfig {
            pow_mode: PowMode::Fake,
            ..EthashConfig::default()
        },
        ..NodeConfig::ephemeral()
    }
}

fn open(dir: &TempDir, config: NodeConfig) -> Result<Arc<NodeService>, ChainError> {
    let ctx = ServiceContext::new(Some(dir.path().to_path_buf()));
    let db = create_db(&ctx, &config, "chaindata")?;
    NodeService::new(&ctx, config, db)
}

fn extend(chain: &BlockChain, count: u64) -> Result<(), ChainError> {
    let mut parent = chain.current_block();
    let mut blocks = Vec::new();
    for _ in 0..count {
        let block = Block::new(
            Header {
                parent_hash: parent.hash(),
                number: parent.number() + 1,
                timestamp: parent.header.timestamp + 1,
                difficulty: 1,
                ..Header::default()
            },
            vec![],
        );
        blocks.push(block.clone());
        parent = block;
    }
    chain.insert_chain(blocks)?;
    Ok(())
}

fn pow_genesis(byzantium: u64) -> Genesis {
    let mut genesis = Genesis::developer_pow();
    genesis.config.byzantium_block = Some(byzantium);
    genesis
}

#[test]
fn test_identical_genesis_matches_on_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = write_genesis(dir.path(), "genesis.json", &pow_genesis(10))?;

    let first = open(&dir, node_config(path.clone()))?;
    assert_eq!(first.genesis_outcome(), &CompatibilityOutcome::FirstRun);
    extend(&first.blockchain(), 3)?;
    first.stop()?;

    let second = open(&dir, node_config(path))?;
    assert_eq!(second.genesis_outcome(), &CompatibilityOutcome::Matching);
    assert_eq!(second.blockchain().current_block().number(), 3);
    second.stop()?;
    Ok(())
}

#[test]
fn test_moved_fork_rewinds_chain() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let old = write_genesis(dir.path(), "old.json", &pow_genesis(10))?;
    let first = open(&dir, node_config(old))?;
    extend(&first.blockchain(), 20)?;
    first.stop()?;

    let upgraded = pow_genesis(5);
    let new = write_genesis(dir.path(), "new.json", &upgraded)?;
    let second = open(&dir, node_config(new))?;

    match second.genesis_outcome() {
        CompatibilityOutcome::IncompatibleWithRewind { rewind_to, .. } => assert_eq!(*rewind_to, 4),
        other => panic!("unexpected outcome {:?}", other),
    }
    let chain = second.blockchain();
    assert_eq!(chain.current_block().number(), 4);
    let genesis_hash = chain.genesis().hash();
    let stored = rawdb::read_chain_config(second.chain_db().as_ref(), &genesis_hash)?;
    assert_eq!(stored, Some(upgraded.config));
    second.stop()?;
    Ok(())
}

#[test]
fn test_different_genesis_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = write_genesis(dir.path(), "genesis.json", &pow_genesis(10))?;
    open(&dir, node_config(path))?.stop()?;

    let mut other = pow_genesis(10);
    other.extra_data = b"another network".to_vec();
    let other_path = write_genesis(dir.path(), "other.json", &other)?;
    let result = open(&dir, node_config(other_path));
    assert!(matches!(result, Err(ChainError::GenesisIncompatible(_))));
    Ok(())
}

#[test]
fn test_schema_version_mismatch() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = write_genesis(dir.path(), "genesis.json", &pow_genesis(10))?;

    let node = open(&dir, node_config(path.clone()))?;
    assert_eq!(rawdb::read_database_version(node.chain_db().as_ref())?, BLOCKCHAIN_VERSION);
    rawdb::write_database_version(node.chain_db().as_ref(), BLOCKCHAIN_VERSION + 1)?;
    node.stop()?;

    let result = open(&dir, node_config(path.clone()));
    assert!(matches!(
        result,
        Err(ChainError::SchemaVersionMismatch { stored, expected })
            if stored == BLOCKCHAIN_VERSION + 1 && expected == BLOCKCHAIN_VERSION
    ));

    let skipped = open(
        &dir,
        NodeConfig {
            skip_bc_version_check: true,
            ..node_config(path)
        },
    )?;
    skipped.stop()?;
    Ok(())
}

use crate::blockchain::core::chain::{Block, Header};
use crate::error::ChainError;

/// Checks that `block` directly extends `parent`.
pub fn validate_linkage(parent: &Header, block: &Block) -> Result<(), ChainError> {
    if block.header.number != parent.number + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block number. Expected {}, but got {}.",
            parent.number + 1,
            block.header.number
        )));
    }
    if block.header.parent_hash != parent.hash() {
        return Err(ChainError::InvalidBlock(format!(
            "Unknown ancestor. Expected parent {}, but got {}.",
            hex::encode(parent.hash()),
            hex::encode(block.header.parent_hash)
        )));
    }
    Ok(())
}

/// Checks the transaction root and rejects two transactions from the same
/// sender with the same nonce.
pub fn validate_body(block: &Block) -> Result<(), ChainError> {
    let expected_root = Block::calculate_merkle_root(&block.transactions);
    if expected_root != block.header.tx_root {
        return Err(ChainError::InvalidBlock(format!(
            "Transaction root mismatch. Expected {}, but got {}.",
            hex::encode(expected_root),
            hex::encode(block.header.tx_root)
        )));
    }

    let mut seen = std::collections::HashMap::new();
    for tx in &block.transactions {
        if let Some(conflicting) = seen.insert((tx.from, tx.nonce), tx.hash()) {
            return Err(ChainError::InvalidBlock(format!(
                "Nonce {} of {} is used by both {} and {}",
                tx.nonce,
                tx.from,
                hex::encode(conflicting),
                hex::encode(tx.hash())
            )));
        }
    }
    Ok(())
}

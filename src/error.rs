//! Error types for the VSportChain node

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Blockchain DB version mismatch ({stored} / {expected}). Run the database upgrade first")]
    SchemaVersionMismatch { stored: u64, expected: u64 },
    #[error("Genesis incompatible: {0}")]
    GenesisIncompatible(String),
    #[error("etherbase must be explicitly specified")]
    MiningAddressUnconfigured,
    #[error("signer missing: {0}")]
    SignerUnavailable(String),
    #[error("invalid peer config: light peer count ({light_peers}) >= total peer count ({max_peers})")]
    PeerBudgetInvalid { light_peers: usize, max_peers: usize },
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Consensus error: {0}")]
    ConsensusError(String),
    #[error("Wallet error: {0}")]
    WalletError(String),
    #[error("Transaction pool error: {0}")]
    TxPoolError(String),
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
    #[error("event mux closed")]
    MuxClosed,
    #[error("Bloom retrieval failed: {0}")]
    BloomRetrieval(String),
    #[error("RPC error: {0}")]
    Rpc(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_budget_message() {
        let err = ChainError::PeerBudgetInvalid {
            light_peers: 25,
            max_peers: 25,
        };
        assert_eq!(
            err.to_string(),
            "invalid peer config: light peer count (25) >= total peer count (25)"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ChainError = io.into();
        assert!(matches!(err, ChainError::IoError(ref m) if m.contains("missing")));
    }
}

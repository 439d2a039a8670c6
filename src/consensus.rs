//! Pluggable consensus engines
//!
//! Every engine implements [`Engine`]. Capabilities that only some engines
//! have are exposed through optional accessors: [`Engine::authorizer`] for
//! engines that seal with a local signing key (proof-of-authority) and
//! [`Engine::threader`] for engines that seal with local worker threads
//! (proof-of-work).

pub mod clique;
pub mod ethash;

use crate::api::RpcApi;
use crate::blockchain::{Block, ChainReader, Header};
use crate::crypto::{Address, Hash, SignedDigest};
use crate::error::ChainError;
use crate::node::ServiceContext;
use crate::params::ChainConfig;
use crate::persistence::ChainDb;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

pub use clique::Clique;
pub use ethash::{Ethash, EthashConfig, PowMode};

/// Signs a 32-byte digest on behalf of an account.
pub type SignerFn = Arc<dyn Fn(&Address, &Hash) -> Result<SignedDigest, ChainError> + Send + Sync>;

pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Account that sealed `header`.
    fn author(&self, header: &Header) -> Result<Address, ChainError>;

    /// Checks header fields against consensus rules, and the seal when `seal` is set.
    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), ChainError>;

    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ChainError>;

    /// Fills the consensus fields of a header template built on the current head.
    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ChainError>;

    /// Produces a sealed copy of `block`. Returns `Ok(None)` when `stop` is
    /// raised or the chain head moves before a seal is found.
    fn seal(&self, chain: &dyn ChainReader, block: Block, stop: &AtomicBool) -> Result<Option<Block>, ChainError>;

    fn calc_difficulty(&self, chain: &dyn ChainReader, time: u64, parent: &Header) -> Result<u64, ChainError>;

    /// RPC services contributed by the engine.
    fn apis(&self, chain: Arc<dyn ChainReader>) -> Vec<RpcApi>;

    fn close(&self) -> Result<(), ChainError>;

    fn authorizer(&self) -> Option<&dyn Authorizer> {
        None
    }

    fn threader(&self) -> Option<&dyn Threader> {
        None
    }
}

/// Binds a local signing key to an engine.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, signer: Address, sign_fn: SignerFn);
}

/// Controls the number of local sealing threads. Negative disables local sealing,
/// zero uses every core.
pub trait Threader: Send + Sync {
    fn threads(&self) -> i32;
    fn set_threads(&self, threads: i32);
}

/// Picks the engine for a chain: proof-of-authority when the chain config
/// carries clique parameters, the configured proof-of-work mode otherwise.
pub fn create_consensus_engine(
    ctx: &ServiceContext,
    config: &EthashConfig,
    chain_config: &ChainConfig,
    db: Arc<dyn ChainDb>,
) -> Arc<dyn Engine> {
    if let Some(clique) = chain_config.clique {
        info!("Selected proof-of-authority consensus: period {} epoch {}", clique.period, clique.epoch);
        return Arc::new(Clique::new(clique, db));
    }

    match config.pow_mode {
        PowMode::Fake => {
            warn!("Ethash used in fake mode");
            Arc::new(Ethash::new_faker())
        }
        PowMode::Test => {
            warn!("Ethash used in test mode");
            Arc::new(Ethash::new_tester())
        }
        PowMode::Shared => {
            warn!("Ethash used in shared mode");
            Arc::new(Ethash::new_shared())
        }
        PowMode::Normal => {
            let engine = Ethash::new(EthashConfig {
                cache_dir: ctx.resolve_path(&config.cache_dir),
                ..config.clone()
            });
            engine.set_threads(-1);
            Arc::new(engine)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryDatabase;
    use tempfile::TempDir;

    fn select(mode: PowMode, chain_config: &ChainConfig) -> (TempDir, Arc<dyn Engine>) {
        let dir = TempDir::new().unwrap();
        let ctx = ServiceContext::new(Some(dir.path().to_path_buf()));
        let config = EthashConfig {
            pow_mode: mode,
            ..EthashConfig::default()
        };
        let engine = create_consensus_engine(&ctx, &config, chain_config, Arc::new(MemoryDatabase::new()));
        (dir, engine)
    }

    #[test]
    fn test_clique_config_selects_poa() {
        let (_dir, engine) = select(PowMode::Normal, &ChainConfig::rinkeby());
        assert_eq!(engine.name(), "clique");
        assert!(engine.authorizer().is_some());
        assert!(engine.threader().is_none());
    }

    #[test]
    fn test_normal_mode_disables_local_sealing() {
        let (_dir, engine) = select(PowMode::Normal, &ChainConfig::mainnet());
        assert_eq!(engine.name(), "ethash");
        assert_eq!(engine.threader().unwrap().threads(), -1);
        assert!(engine.authorizer().is_none());
    }

    #[test]
    fn test_non_production_modes_keep_threads() {
        for mode in [PowMode::Fake, PowMode::Test, PowMode::Shared] {
            let (_dir, engine) = select(mode, &ChainConfig::mainnet());
            assert_eq!(engine.threader().unwrap().threads(), 0);
        }
    }
}

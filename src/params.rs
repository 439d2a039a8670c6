//! Chain parameters: fork schedule, consensus selection and compatibility rules

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk layout revision of the chain database.
pub const BLOCKCHAIN_VERSION: u64 = 3;

/// Maximum size of the extra-data field in a sealed header.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

/// Number of blocks covered by one bloom-bits section.
pub const BLOOM_BITS_BLOCKS: u64 = 4096;

/// Blocks a section must trail the head by before it is indexed.
pub const BLOOM_CONFIRMS: u64 = 256;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 8;
pub const VERSION_PATCH: u32 = 3;

pub const MAINNET_NETWORK_ID: u64 = 1;

pub fn version_string() -> String {
    format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

/// Proof-of-authority parameters. Their presence selects the PoA engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliqueConfig {
    /// Seconds between blocks.
    pub period: u64,
    /// Epoch length after which votes are reset and a checkpoint is written.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homestead_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip150_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip155_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip158_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byzantium_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constantinople_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clique: Option<CliqueConfig>,
}

impl ChainConfig {
    pub fn mainnet() -> Self {
        ChainConfig {
            chain_id: 1,
            homestead_block: Some(1_150_000),
            eip150_block: Some(2_463_000),
            eip155_block: Some(2_675_000),
            eip158_block: Some(2_675_000),
            byzantium_block: Some(4_370_000),
            constantinople_block: None,
            clique: None,
        }
    }

    pub fn testnet() -> Self {
        ChainConfig {
            chain_id: 3,
            homestead_block: Some(0),
            eip150_block: Some(0),
            eip155_block: Some(10),
            eip158_block: Some(10),
            byzantium_block: Some(1_700_000),
            constantinople_block: None,
            clique: None,
        }
    }

    pub fn rinkeby() -> Self {
        ChainConfig {
            chain_id: 4,
            homestead_block: Some(1),
            eip150_block: Some(2),
            eip155_block: Some(3),
            eip158_block: Some(3),
            byzantium_block: Some(1_035_301),
            constantinople_block: None,
            clique: Some(CliqueConfig {
                period: 15,
                epoch: 30_000,
            }),
        }
    }

    /// Every fork active from genesis, proof-of-work.
    pub fn all_ethash_changes() -> Self {
        ChainConfig {
            chain_id: 1337,
            homestead_block: Some(0),
            eip150_block: Some(0),
            eip155_block: Some(0),
            eip158_block: Some(0),
            byzantium_block: Some(0),
            constantinople_block: None,
            clique: None,
        }
    }

    /// Every fork active from genesis, proof-of-authority.
    pub fn all_clique_changes(period: u64) -> Self {
        ChainConfig {
            clique: Some(CliqueConfig {
                period,
                epoch: 30_000,
            }),
            ..Self::all_ethash_changes()
        }
    }

    pub fn is_eip158(&self, number: u64) -> bool {
        is_forked(self.eip158_block, number)
    }

    pub fn is_byzantium(&self, number: u64) -> bool {
        is_forked(self.byzantium_block, number)
    }

    /// Checks whether a chain already advanced to `height` may switch to `new`.
    ///
    /// Repeats the check at the proposed rewind height until the lowest
    /// conflicting fork is found.
    pub fn check_compatible(&self, new: &ChainConfig, height: u64) -> Option<ConfigCompatError> {
        let mut head = height;
        let mut last: Option<ConfigCompatError> = None;
        loop {
            let err = match self.check_compatible_at(new, head) {
                Some(err) => err,
                None => break,
            };
            if let Some(prev) = &last {
                if prev.rewind_to == err.rewind_to {
                    break;
                }
            }
            head = err.rewind_to;
            last = Some(err);
        }
        last
    }

    fn check_compatible_at(&self, new: &ChainConfig, head: u64) -> Option<ConfigCompatError> {
        let forks = [
            ("Homestead fork block", self.homestead_block, new.homestead_block),
            ("EIP150 fork block", self.eip150_block, new.eip150_block),
            ("EIP155 fork block", self.eip155_block, new.eip155_block),
            ("EIP158 fork block", self.eip158_block, new.eip158_block),
        ];
        for (what, stored, proposed) in forks {
            if is_fork_incompatible(stored, proposed, head) {
                return Some(ConfigCompatError::new(what, stored, proposed));
            }
        }
        if self.is_eip158(head) && self.chain_id != new.chain_id {
            return Some(ConfigCompatError::new(
                "EIP158 chain ID",
                self.eip158_block,
                new.eip158_block,
            ));
        }
        let later = [
            ("Byzantium fork block", self.byzantium_block, new.byzantium_block),
            (
                "Constantinople fork block",
                self.constantinople_block,
                new.constantinople_block,
            ),
        ];
        for (what, stored, proposed) in later {
            if is_fork_incompatible(stored, proposed, head) {
                return Some(ConfigCompatError::new(what, stored, proposed));
            }
        }
        None
    }
}

impl fmt::Display for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let show = |b: Option<u64>| b.map_or_else(|| "<nil>".to_string(), |n| n.to_string());
        let engine = match &self.clique {
            Some(c) => format!("clique(period: {}, epoch: {})", c.period, c.epoch),
            None => "ethash".to_string(),
        };
        write!(
            f,
            "{{ChainID: {} Homestead: {} EIP150: {} EIP155: {} EIP158: {} Byzantium: {} Constantinople: {} Engine: {}}}",
            self.chain_id,
            show(self.homestead_block),
            show(self.eip150_block),
            show(self.eip155_block),
            show(self.eip158_block),
            show(self.byzantium_block),
            show(self.constantinople_block),
            engine
        )
    }
}

fn is_forked(fork: Option<u64>, head: u64) -> bool {
    matches!(fork, Some(block) if block <= head)
}

fn is_fork_incompatible(stored: Option<u64>, new: Option<u64>, head: u64) -> bool {
    (is_forked(stored, head) || is_forked(new, head)) && stored != new
}

/// Raised when a locally stored chain already passed a fork whose activation
/// height the new configuration moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCompatError {
    pub what: String,
    pub stored_config: Option<u64>,
    pub new_config: Option<u64>,
    /// Height the local chain must be rewound to for the new config to apply.
    pub rewind_to: u64,
}

impl ConfigCompatError {
    fn new(what: &str, stored: Option<u64>, new: Option<u64>) -> Self {
        let rewind = match (stored, new) {
            (None, new) => new,
            (Some(s), Some(n)) if s >= n => Some(n),
            (Some(s), _) => Some(s),
        };
        ConfigCompatError {
            what: what.to_string(),
            stored_config: stored,
            new_config: new,
            rewind_to: rewind.filter(|r| *r > 0).map_or(0, |r| r - 1),
        }
    }
}

impl fmt::Display for ConfigCompatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let show = |b: Option<u64>| b.map_or_else(|| "<nil>".to_string(), |n| n.to_string());
        write!(
            f,
            "mismatching {} in database (have {}, want {}, rewindto {})",
            self.what,
            show(self.stored_config),
            show(self.new_config),
            self.rewind_to
        )
    }
}

impl std::error::Error for ConfigCompatError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_configs_are_compatible() {
        let cfg = ChainConfig::mainnet();
        assert!(cfg.check_compatible(&cfg.clone(), 5_000_000).is_none());
    }

    #[test]
    fn test_future_fork_change_is_compatible() {
        let stored = ChainConfig::all_ethash_changes();
        let mut new = stored.clone();
        new.constantinople_block = Some(100);
        assert!(stored.check_compatible(&new, 50).is_none());
    }

    #[test]
    fn test_passed_fork_change_requires_rewind() {
        let mut stored = ChainConfig::all_ethash_changes();
        stored.byzantium_block = Some(10);
        let mut new = stored.clone();
        new.byzantium_block = Some(20);

        let err = stored.check_compatible(&new, 30).unwrap();
        assert_eq!(err.what, "Byzantium fork block");
        assert_eq!(err.rewind_to, 9);
    }

    #[test]
    fn test_lowest_conflict_wins() {
        let mut stored = ChainConfig::all_ethash_changes();
        stored.homestead_block = Some(5);
        stored.byzantium_block = Some(10);
        let mut new = stored.clone();
        new.homestead_block = Some(3);
        new.byzantium_block = Some(20);

        let err = stored.check_compatible(&new, 30).unwrap();
        assert_eq!(err.rewind_to, 2);
    }

    #[test]
    fn test_chain_id_change_after_eip158() {
        let stored = ChainConfig::all_ethash_changes();
        let mut new = stored.clone();
        new.chain_id = 99;
        let err = stored.check_compatible(&new, 10).unwrap();
        assert_eq!(err.what, "EIP158 chain ID");
    }

    #[test]
    fn test_config_json_roundtrip_omits_unset_forks() {
        let cfg = ChainConfig::rinkeby();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("constantinople_block"));
        let back: ChainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}

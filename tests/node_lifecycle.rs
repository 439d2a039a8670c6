//! Integration tests for the node service: mining identity, start/stop and the RPC table

use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vscnode::accounts::{AccountManager, LocalWallet, Wallet};
use vscnode::api::dispatch;
use vscnode::bloombits::Retrieval;
use vscnode::config::NodeConfig;
use vscnode::consensus::{EthashConfig, PowMode};
use vscnode::crypto::{Address, Hash, SignedDigest};
use vscnode::error::ChainError;
use vscnode::genesis::Genesis;
use vscnode::node::{LifecycleState, NodeService, ServiceContext};
use vscnode::p2p::{Server, ServerConfig};
use vscnode::persistence::{Batch, ChainDb, MemoryDatabase};
use vscnode::rawdb;
use vscnode::txpool::Transaction;

struct Fixture {
    dir: TempDir,
    accounts: Arc<AccountManager>,
    node: Arc<NodeService>,
}

fn fixture(genesis: Genesis, tweak: impl FnOnce(&mut NodeConfig)) -> Result<Fixture, Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("genesis.json");
    std::fs::write(&path, serde_json::to_vec(&genesis)?)?;

    let mut config = NodeConfig {
        genesis: Some(path),
        ethash: EthashConfig {
            pow_mode: PowMode::Fake,
            ..EthashConfig::default()
        },
        ..NodeConfig::ephemeral()
    };
    tweak(&mut config);

    let accounts = Arc::new(AccountManager::new());
    let ctx = ServiceContext::with_accounts(None, accounts.clone());
    let node = NodeService::new(&ctx, config, Arc::new(MemoryDatabase::new()))?;
    Ok(Fixture {
        dir,
        accounts,
        node,
    })
}

fn pow_fixture() -> Result<Fixture, Box<dyn std::error::Error>> {
    fixture(Genesis::developer_pow(), |_| {})
}

fn server(max_peers: usize) -> Arc<Server> {
    Arc::new(Server::new(ServerConfig {
        max_peers,
        ..ServerConfig::default()
    }))
}

/// Wallet that counts account queries and answers them slowly.
struct SlowWallet {
    address: Address,
    queries: AtomicUsize,
    delay: Duration,
}

impl SlowWallet {
    fn new(address: Address, delay: Duration) -> Self {
        SlowWallet {
            address,
            queries: AtomicUsize::new(0),
            delay,
        }
    }
}

impl Wallet for SlowWallet {
    fn url(&self) -> String {
        format!("slow://{}", self.address)
    }

    fn accounts(&self) -> Vec<Address> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        vec![self.address]
    }

    fn is_locked(&self) -> bool {
        true
    }

    fn sign_hash(&self, address: &Address, _digest: &Hash) -> Result<SignedDigest, ChainError> {
        Err(ChainError::WalletError(format!("account {} is locked", address)))
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_etherbase_discovery_and_override() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    assert!(matches!(f.node.etherbase(), Err(ChainError::MiningAddressUnconfigured)));

    let address = Address([1u8; 20]);
    let wallet = Arc::new(SlowWallet::new(address, Duration::ZERO));
    f.accounts.add_wallet(wallet.clone());
    assert_eq!(f.node.etherbase()?, address);

    // Cached: later calls never go back to the account manager.
    f.accounts.add_wallet(Arc::new(LocalWallet::generate()?));
    assert_eq!(f.node.etherbase()?, address);
    assert_eq!(f.node.etherbase()?, address);
    assert_eq!(wallet.queries.load(Ordering::SeqCst), 1);

    let manual = Address([9u8; 20]);
    f.node.set_etherbase(manual);
    assert_eq!(f.node.etherbase()?, manual);
    assert_eq!(f.node.miner().coinbase(), manual);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_manual_etherbase_wins_over_slow_discovery() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let discovered = Address([0x11; 20]);
    let manual = Address([0x22; 20]);
    f.accounts.add_wallet(Arc::new(SlowWallet::new(discovered, Duration::from_millis(200))));

    let node = f.node.clone();
    let lookup = thread::spawn(move || node.etherbase());
    thread::sleep(Duration::from_millis(50));
    f.node.set_etherbase(manual);

    let looked_up = lookup.join().map_err(|_| "etherbase lookup panicked")??;
    assert_eq!(looked_up, manual);
    assert_eq!(f.node.etherbase()?, manual);
    assert_eq!(f.node.miner().coinbase(), manual);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_gas_price_reaches_pool() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    f.node.set_gas_price(42);
    assert_eq!(f.node.gas_price(), 42);
    assert_eq!(f.node.txpool().gas_price(), 42);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_start_mining_requires_address() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    f.node.stop_mining();
    assert!(matches!(f.node.start_mining(false), Err(ChainError::MiningAddressUnconfigured)));
    assert!(matches!(f.node.start_mining(true), Err(ChainError::MiningAddressUnconfigured)));
    assert!(!f.node.is_mining());
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_only_local_mining_opens_tx_gate() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let gate = f.node.downloader().accept_txs();
    f.node.set_etherbase(Address([3u8; 20]));

    f.node.start_mining(false)?;
    assert!(f.node.is_mining());
    assert!(!gate.load(Ordering::SeqCst));
    f.node.stop_mining();

    f.node.start_mining(true)?;
    assert!(gate.load(Ordering::SeqCst));
    let chain = f.node.blockchain();
    assert!(wait_for(|| chain.current_block().number() >= 1));
    f.node.stop_mining();
    assert!(!f.node.is_mining());
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_clique_signer_must_be_local() -> Result<(), Box<dyn std::error::Error>> {
    let wallet = LocalWallet::generate()?;
    let signer = wallet.address();
    let f = fixture(Genesis::developer(1, signer), |_| {})?;
    assert_eq!(f.node.engine().name(), "clique");

    f.node.set_etherbase(signer);
    assert!(matches!(f.node.start_mining(true), Err(ChainError::SignerUnavailable(_))));

    let wallet = Arc::new(wallet);
    f.accounts.add_wallet(wallet.clone());
    assert!(matches!(f.node.start_mining(true), Err(ChainError::SignerUnavailable(_))));
    assert!(!f.node.is_mining());

    wallet.unlock();
    f.node.start_mining(true)?;
    assert!(f.node.is_mining());
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_peer_budget_validation() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture(Genesis::developer_pow(), |config| {
        config.light_serv = 50;
        config.light_peers = 10;
    })?;
    let result = f.node.start(server(10));
    assert!(matches!(
        result,
        Err(ChainError::PeerBudgetInvalid {
            light_peers: 10,
            max_peers: 10
        })
    ));
    assert_eq!(f.node.lifecycle_state(), LifecycleState::Created);

    f.node.start(server(25))?;
    assert_eq!(f.node.lifecycle_state(), LifecycleState::Running);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_stop_drains_queued_bloom_retrievals() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let head = [5u8; 32];
    let mut batch = Batch::new();
    rawdb::batch_write_section_head(&mut batch, 0, &head);
    rawdb::batch_write_bloom_bits(&mut batch, 7, 0, &head, &[0b1000_0000]);
    f.node.chain_db().write_batch(batch)?;
    f.node.start(server(10))?;

    let dispatcher = f.node.bloom_dispatcher();
    let (reply, replies) = crossbeam_channel::unbounded();
    for _ in 0..64 {
        dispatcher.submit(Retrieval {
            bit: 7,
            sections: vec![0],
            reply: reply.clone(),
        })?;
    }
    drop(reply);
    f.node.stop()?;

    let results: Vec<_> = replies.iter().collect();
    assert_eq!(results.len(), 64);
    for result in results {
        assert_eq!(result?, vec![vec![0b1000_0000]]);
    }
    assert!(f.node.chain_db().is_closed());
    Ok(())
}

#[test]
fn test_light_peers_ignored_without_light_serv() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture(Genesis::developer_pow(), |config| config.light_peers = 50)?;
    f.node.start(server(10))?;
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_start_twice_and_stop_once() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let shutdown = f.node.shutdown_signal();
    f.node.start(server(10))?;
    assert!(matches!(f.node.start(server(10)), Err(ChainError::Lifecycle(_))));

    f.node.stop()?;
    assert!(f.node.chain_db().is_closed());
    assert!(shutdown.recv().is_err());
    assert!(f.node.blockchain().is_stopped());

    f.node.stop()?;
    assert_eq!(f.node.lifecycle_state(), LifecycleState::Stopped);
    assert!(matches!(f.node.start(server(10)), Err(ChainError::Lifecycle(_))));
    Ok(())
}

#[test]
fn test_stop_racing_start_mining() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    f.node.set_etherbase(Address([4u8; 20]));
    f.node.start(server(10))?;

    let node = f.node.clone();
    let racer = thread::spawn(move || {
        for _ in 0..50 {
            let _ = node.start_mining(true);
            thread::sleep(Duration::from_millis(1));
        }
    });
    thread::sleep(Duration::from_millis(10));
    f.node.stop()?;
    racer.join().map_err(|_| "mining thread panicked")?;

    assert!(!f.node.is_mining());
    assert!(f.node.miner().is_closed());
    assert!(f.node.shutdown_signal().recv().is_err());
    Ok(())
}

#[test]
fn test_concurrent_etherbase_readers() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let a = Address([0xaa; 20]);
    let b = Address([0xbb; 20]);
    f.node.set_etherbase(a);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let node = f.node.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let seen = node.etherbase().map_err(|e| e.to_string())?;
                    if seen != a && seen != b {
                        return Err(format!("torn etherbase {}", seen));
                    }
                }
                Ok(())
            })
        })
        .collect();
    for i in 0..1000 {
        f.node.set_etherbase(if i % 2 == 0 { b } else { a });
    }
    for reader in readers {
        reader.join().map_err(|_| "reader panicked")??;
    }
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_api_table() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let apis = f.node.apis();
    assert_eq!(apis[0].namespace, "ethash");
    assert!(!apis.iter().any(|api| api.namespace == "net"));
    let private: Vec<&str> = apis.iter().filter(|a| !a.public).map(|a| a.namespace.as_str()).collect();
    assert_eq!(private, vec!["miner", "admin", "debug"]);

    dispatch(&apis, "miner_setEtherbase", vec![json!(Address([7u8; 20]))])?;
    assert_eq!(dispatch(&apis, "eth_etherbase", vec![])?, json!(Address([7u8; 20])));
    dispatch(&apis, "miner_setGasPrice", vec![json!(5)])?;
    assert_eq!(f.node.gas_price(), 5);
    assert!(dispatch(&apis, "miner_setExtra", vec![json!("x".repeat(33))]).is_err());
    assert_eq!(dispatch(&apis, "eth_syncing", vec![])?, json!(false));
    assert_eq!(dispatch(&apis, "eth_mining", vec![])?, json!(false));

    f.node.start(server(10))?;
    let apis = f.node.apis();
    assert_eq!(dispatch(&apis, "net_version", vec![])?, json!(f.node.net_version().to_string()));
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_export_chain_and_set_head() -> Result<(), Box<dyn std::error::Error>> {
    let f = pow_fixture()?;
    let sender = Address([6u8; 20]);
    f.node.txpool().add_local(Transaction {
        nonce: 0,
        gas_price: 1,
        gas: 21_000,
        from: sender,
        to: Some(Address([8u8; 20])),
        value: 10,
        data: vec![],
    })?;
    f.node.set_etherbase(Address([1u8; 20]));
    f.node.start_mining(true)?;
    let chain = f.node.blockchain();
    assert!(wait_for(|| chain.current_block().number() >= 2));
    f.node.stop_mining();
    assert_eq!(chain.get_block_by_number(1)?.map(|b| b.transactions.len()), Some(1));
    assert!(f.node.txpool().is_empty());

    let apis = f.node.apis();
    let matches = dispatch(
        &apis,
        "eth_getBloomMatches",
        vec![json!(format!("0x{}", hex::encode(sender.as_bytes()))), json!(0), json!(2)],
    )?;
    assert_eq!(matches, json!([1]));

    let out: PathBuf = f.dir.path().join("export.jsonl");
    let path = out.to_string_lossy().to_string();
    assert_eq!(dispatch(&apis, "admin_exportChain", vec![json!(path), json!(0), json!(2)])?, json!(true));
    assert_eq!(std::fs::read_to_string(&out)?.lines().count(), 3);
    assert!(dispatch(&apis, "admin_exportChain", vec![json!(path)]).is_err());

    dispatch(&apis, "debug_setHead", vec![json!(1)])?;
    assert_eq!(chain.current_block().number(), 1);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_protocols_advertised() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture(Genesis::developer_pow(), |config| {
        config.sync_mode = vscnode::config::SyncMode::Full;
    })?;
    let versions: Vec<u32> = f.node.protocols().iter().map(|p| p.version).collect();
    assert_eq!(versions, vec![63, 62]);
    assert_eq!(f.node.eth_version(), 63);
    f.node.stop()?;
    Ok(())
}

#[test]
fn test_wallet_trait_object_signs() -> Result<(), Box<dyn std::error::Error>> {
    let wallet = LocalWallet::generate()?;
    wallet.unlock();
    let address = wallet.address();
    let wallet: Arc<dyn Wallet> = Arc::new(wallet);
    let signed = wallet.sign_hash(&address, &[1u8; 32])?;
    assert_eq!(signed.verify(&[1u8; 32])?, address);
    Ok(())
}

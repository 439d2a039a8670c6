//! RPC service table for the node
//!
//! Services are transport-agnostic: each one dispatches a method name with
//! positional JSON params. Whoever serves them (HTTP, IPC, in-process) is
//! responsible for keeping private namespaces away from untrusted callers.

use crate::bloombits::BloomMatcher;
use crate::crypto::Address;
use crate::error::ChainError;
use crate::node::NodeService;
use crate::p2p::Server;
use crate::sync::SyncManager;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub trait RpcService: Send + Sync {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError>;

    fn methods(&self) -> Vec<&'static str>;
}

/// One entry of the exported API table.
#[derive(Clone)]
pub struct RpcApi {
    pub namespace: String,
    pub version: String,
    pub service: Arc<dyn RpcService>,
    pub public: bool,
}

impl RpcApi {
    fn new(namespace: &str, service: Arc<dyn RpcService>, public: bool) -> Self {
        RpcApi {
            namespace: namespace.to_string(),
            version: "1.0".to_string(),
            service,
            public,
        }
    }
}

impl fmt::Debug for RpcApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcApi")
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("methods", &self.service.methods())
            .field("public", &self.public)
            .finish()
    }
}

/// Positional parameter `idx`. A missing parameter reads as `null`, so
/// `Option<T>` parameters may be omitted.
pub fn param<T: DeserializeOwned>(params: &[Value], idx: usize) -> Result<T, ChainError> {
    let value = params.get(idx).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| ChainError::Rpc(format!("invalid argument {}: {}", idx, e)))
}

/// Routes `namespace_method` to the first service in `apis` exposing it.
pub fn dispatch(apis: &[RpcApi], name: &str, params: Vec<Value>) -> Result<Value, ChainError> {
    let (namespace, method) = name
        .split_once('_')
        .ok_or_else(|| ChainError::Rpc(format!("malformed method name {}", name)))?;
    apis.iter()
        .filter(|api| api.namespace == namespace)
        .find(|api| api.service.methods().contains(&method))
        .ok_or_else(|| ChainError::Rpc(format!("the method {} does not exist/is not available", name)))?
        .service
        .call(method, params)
}

fn not_found(namespace: &str, method: &str) -> ChainError {
    ChainError::Rpc(format!("method {}_{} not found", namespace, method))
}

/// Chain identity and mining address queries.
pub struct PublicEthApi {
    node: Arc<NodeService>,
}

impl PublicEthApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PublicEthApi { node }
    }
}

impl RpcService for PublicEthApi {
    fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "etherbase" | "coinbase" => Ok(json!(self.node.etherbase()?)),
            "chainId" => Ok(json!(self.node.blockchain().config().chain_id)),
            "blockNumber" => Ok(json!(self.node.blockchain().current_block().number())),
            "gasPrice" => Ok(json!(self.node.gas_price().to_string())),
            "protocolVersion" => Ok(json!(self.node.eth_version())),
            _ => Err(not_found("eth", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["etherbase", "coinbase", "chainId", "blockNumber", "gasPrice", "protocolVersion"]
    }
}

pub struct PublicMinerApi {
    node: Arc<NodeService>,
}

impl PublicMinerApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PublicMinerApi { node }
    }
}

impl RpcService for PublicMinerApi {
    fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "mining" => Ok(json!(self.node.is_mining())),
            _ => Err(not_found("eth", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["mining"]
    }
}

/// Sync progress, or `false` when the node is not syncing.
pub struct PublicDownloaderApi {
    sync: Arc<SyncManager>,
}

impl PublicDownloaderApi {
    pub fn new(sync: Arc<SyncManager>) -> Self {
        PublicDownloaderApi { sync }
    }
}

impl RpcService for PublicDownloaderApi {
    fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "syncing" => {
                if self.sync.is_syncing() {
                    Ok(serde_json::to_value(self.sync.progress())?)
                } else {
                    Ok(json!(false))
                }
            }
            _ => Err(not_found("eth", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["syncing"]
    }
}

/// Mining control. Private.
pub struct PrivateMinerApi {
    node: Arc<NodeService>,
}

impl PrivateMinerApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PrivateMinerApi { node }
    }

    /// `threads` of zero disables local sealing; none keeps the default.
    fn start(&self, threads: Option<i32>) -> Result<(), ChainError> {
        let threads = match threads {
            Some(0) => -1,
            Some(n) => n,
            None => 0,
        };
        if let Some(threader) = self.node.engine().threader() {
            info!("Updated mining threads: {}", threads);
            threader.set_threads(threads);
        }
        if !self.node.is_mining() {
            self.node.txpool().set_gas_price(self.node.gas_price());
            return self.node.start_mining(true);
        }
        Ok(())
    }
}

impl RpcService for PrivateMinerApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "start" => {
                self.start(param(&params, 0)?)?;
                Ok(Value::Null)
            }
            "stop" => {
                if let Some(threader) = self.node.engine().threader() {
                    threader.set_threads(-1);
                }
                self.node.stop_mining();
                Ok(json!(true))
            }
            "setEtherbase" => {
                let address: Address = param(&params, 0)?;
                self.node.set_etherbase(address);
                Ok(json!(true))
            }
            "setGasPrice" => {
                let price: u64 = param(&params, 0)?;
                self.node.set_gas_price(price as u128);
                Ok(json!(true))
            }
            "setExtra" => {
                let extra: String = param(&params, 0)?;
                self.node.miner().set_extra(extra.into_bytes())?;
                Ok(json!(true))
            }
            _ => Err(not_found("miner", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["start", "stop", "setEtherbase", "setGasPrice", "setExtra"]
    }
}

/// Log filtering over header blooms.
pub struct PublicFilterApi {
    node: Arc<NodeService>,
}

impl PublicFilterApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PublicFilterApi { node }
    }

    /// Indexed sections go through the bloom-bits matcher, the unindexed
    /// tail is scanned header by header.
    pub fn bloom_matches(&self, data: &[u8], from: u64, to: u64) -> Result<Vec<u64>, ChainError> {
        let chain = self.node.blockchain();
        let to = to.min(chain.current_block().number());
        if from > to {
            return Ok(Vec::new());
        }

        let indexer = self.node.bloom_indexer();
        let (sections, _) = indexer.sections();
        let matcher = BloomMatcher::new(self.node.bloom_dispatcher(), indexer.section_size());
        let mut numbers = matcher.matches(data, from, to, sections)?;

        let unindexed = (sections * indexer.section_size()).max(from);
        for number in unindexed..=to {
            if let Some(block) = chain.get_block_by_number(number)? {
                if block.header.bloom.contains(data) {
                    numbers.push(number);
                }
            }
        }
        Ok(numbers)
    }
}

impl RpcService for PublicFilterApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "getBloomMatches" => {
                let data: String = param(&params, 0)?;
                let data = hex::decode(data.strip_prefix("0x").unwrap_or(&data))
                    .map_err(|e| ChainError::Rpc(format!("invalid argument 0: {}", e)))?;
                let from: u64 = param(&params, 1)?;
                let to: u64 = param(&params, 2)?;
                Ok(json!(self.bloom_matches(&data, from, to)?))
            }
            _ => Err(not_found("eth", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["getBloomMatches"]
    }
}

pub struct PrivateAdminApi {
    node: Arc<NodeService>,
}

impl PrivateAdminApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PrivateAdminApi { node }
    }

    /// Writes canonical blocks `first..=last` to a new file, one JSON block per line.
    pub fn export_chain(&self, file: &Path, first: Option<u64>, last: Option<u64>) -> Result<u64, ChainError> {
        let chain = self.node.blockchain();
        let first = first.unwrap_or(0);
        let last = last.unwrap_or_else(|| chain.current_block().number());
        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(file)
            .map_err(|e| ChainError::Rpc(format!("{}: {}", file.display(), e)))?;
        let mut writer = BufWriter::new(out);
        let written = chain.export_range(&mut writer, first, last)?;
        writer.flush()?;
        Ok(written)
    }
}

impl RpcService for PrivateAdminApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "exportChain" => {
                let file: String = param(&params, 0)?;
                self.export_chain(Path::new(&file), param(&params, 1)?, param(&params, 2)?)?;
                Ok(json!(true))
            }
            _ => Err(not_found("admin", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["exportChain"]
    }
}

pub struct PublicDebugApi {
    node: Arc<NodeService>,
}

impl PublicDebugApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PublicDebugApi { node }
    }
}

impl RpcService for PublicDebugApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "chainConfig" => Ok(serde_json::to_value(self.node.blockchain().config())?),
            "getHeaderByNumber" => {
                let number: u64 = param(&params, 0)?;
                let block = self.node.blockchain().get_block_by_number(number)?;
                Ok(serde_json::to_value(block.map(|b| b.header))?)
            }
            _ => Err(not_found("debug", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["chainConfig", "getHeaderByNumber"]
    }
}

pub struct PrivateDebugApi {
    node: Arc<NodeService>,
}

impl PrivateDebugApi {
    pub fn new(node: Arc<NodeService>) -> Self {
        PrivateDebugApi { node }
    }
}

impl RpcService for PrivateDebugApi {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "setHead" => {
                let number: u64 = param(&params, 0)?;
                self.node.blockchain().set_head(number)?;
                Ok(Value::Null)
            }
            _ => Err(not_found("debug", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["setHead"]
    }
}

/// Network status, bound to the server the node was started with.
pub struct PublicNetApi {
    server: Arc<Server>,
    sync: Arc<SyncManager>,
    network_version: u64,
}

impl PublicNetApi {
    pub fn new(server: Arc<Server>, sync: Arc<SyncManager>, network_version: u64) -> Self {
        PublicNetApi {
            server,
            sync,
            network_version,
        }
    }
}

impl RpcService for PublicNetApi {
    fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, ChainError> {
        match method {
            "listening" => Ok(json!(self.server.is_listening())),
            "peerCount" => Ok(json!(self.sync.peer_count())),
            "version" => Ok(json!(self.network_version.to_string())),
            _ => Err(not_found("net", method)),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["listening", "peerCount", "version"]
    }
}

/// Assembles the node's API table. Engine APIs come first; the network API
/// only exists once the node has been started.
pub fn node_apis(node: &Arc<NodeService>) -> Vec<RpcApi> {
    let mut apis = node.engine().apis(node.blockchain());
    apis.extend([
        RpcApi::new("eth", Arc::new(PublicEthApi::new(node.clone())), true),
        RpcApi::new("eth", Arc::new(PublicMinerApi::new(node.clone())), true),
        RpcApi::new("eth", Arc::new(PublicDownloaderApi::new(node.downloader())), true),
        RpcApi::new("miner", Arc::new(PrivateMinerApi::new(node.clone())), false),
        RpcApi::new("eth", Arc::new(PublicFilterApi::new(node.clone())), true),
        RpcApi::new("admin", Arc::new(PrivateAdminApi::new(node.clone())), false),
        RpcApi::new("debug", Arc::new(PublicDebugApi::new(node.clone())), true),
        RpcApi::new("debug", Arc::new(PrivateDebugApi::new(node.clone())), false),
    ]);
    if let Some(net) = node.net_api() {
        apis.push(RpcApi::new("net", net, true));
    }
    apis
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl RpcService for Echo {
        fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
            match method {
                "echo" => Ok(params.into_iter().next().unwrap_or(Value::Null)),
                _ => Err(not_found("test", method)),
            }
        }

        fn methods(&self) -> Vec<&'static str> {
            vec!["echo"]
        }
    }

    #[test]
    fn test_param_decoding() {
        let params = vec![json!(7), json!("0x0202020202020202020202020202020202020202")];
        assert_eq!(param::<u64>(&params, 0).unwrap(), 7);
        assert_eq!(param::<Address>(&params, 1).unwrap(), Address([2u8; 20]));
        assert_eq!(param::<Option<u64>>(&params, 2).unwrap(), None);
        assert!(param::<u64>(&params, 2).is_err());
        assert!(param::<bool>(&params, 0).is_err());
    }

    #[test]
    fn test_dispatch_by_namespace() {
        let apis = vec![RpcApi::new("test", Arc::new(Echo), true)];
        assert_eq!(dispatch(&apis, "test_echo", vec![json!(1)]).unwrap(), json!(1));
        assert!(dispatch(&apis, "test_missing", vec![]).is_err());
        assert!(dispatch(&apis, "other_echo", vec![]).is_err());
        assert!(dispatch(&apis, "echo", vec![]).is_err());
    }
}

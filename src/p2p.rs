//! Peer-to-peer server handle
//!
//! Peer discovery and the wire format live outside this crate; the node only
//! needs the server's peer budget, its listening state and the sub-protocols
//! it should advertise.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// A devp2p-style sub-protocol advertised to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
    /// Number of message codes used by the protocol.
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_max_peers() -> usize {
    25
}

fn default_listen_addr() -> String {
    "0.0.0.0:30303".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_peers: default_max_peers(),
            listen_addr: default_listen_addr(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("P2P server started: listen {} max peers {}", self.config.listen_addr, self.config.max_peers);
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("P2P server stopped");
        }
    }

    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }

    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

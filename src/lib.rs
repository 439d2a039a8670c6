//! VSportChain node - the full-node service core
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Headers, blocks, blooms and the canonical chain
//! - [`genesis`] - Genesis presets and database reconciliation
//! - [`txpool`] - Transaction pool
//!
//! ## Consensus
//! - [`consensus`] - Engine trait, engine selection, ethash and clique
//! - [`miner`] - Block sealing loop
//!
//! ## Cryptography & Accounts
//! - [`crypto`] - Addresses, hashing and secp256k1 signatures
//! - [`accounts`] - Wallets and the account manager
//!
//! ## State Management
//! - [`persistence`] - Key/value database layer (SQLite)
//! - [`rawdb`] - Typed database accessors
//! - [`bloombits`] - Bloom section indexer and retrieval workers
//!
//! ## Networking & Integration
//! - [`p2p`] - P2P server handle and protocol descriptors
//! - [`sync`] - Chain synchronization
//! - [`api`] - RPC service table
//! - [`node`] - The node service orchestrating everything above
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`params`] - Chain parameters and protocol constants
//! - [`event`] - Node-wide event bus
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod genesis;
pub mod txpool;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod consensus;
pub mod miner;

// ============================================================================
// Cryptography & Accounts
// ============================================================================
pub mod accounts;
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod bloombits;
pub mod persistence;
pub mod rawdb;

// ============================================================================
// Networking & Integration
// ============================================================================
pub mod api;
pub mod node;
pub mod p2p;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod event;
pub mod params;

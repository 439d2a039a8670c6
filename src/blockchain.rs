// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// block types and chain management, header blooms and block validation.

pub mod core;
pub use core::*;

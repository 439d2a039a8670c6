// core.rs splits chain responsibilities into submodules: block types and the
// canonical chain manager, header bloom filters and block-level validation.
pub mod bloom;
pub mod chain;
pub mod validation;

pub use bloom::*;
pub use chain::*;
pub use validation::*;

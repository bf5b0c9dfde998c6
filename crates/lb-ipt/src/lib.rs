pub mod backend;
pub mod chain;
pub mod memory;
pub mod mutator;

pub use backend::*;
pub use chain::*;
pub use memory::*;
pub use mutator::*;

// iptables access: backends, idempotent rule edits and chain lifecycle

pub mod profiles;
pub mod store;

pub use profiles::*;
pub use store::*;

// Persisted profile attributes: dotted-key YAML store and profile-level access

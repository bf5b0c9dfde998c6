pub mod status;
pub mod synchronizer;

pub use status::*;
pub use synchronizer::*;

// Profile synchronization: drives the rule backend and the profile store together

pub mod error;
pub mod profile;
pub mod rules;
pub mod validator;

pub use error::*;
pub use profile::*;
pub use validator::*;

// Profile model, rule generation and validation shared by every iptlb crate

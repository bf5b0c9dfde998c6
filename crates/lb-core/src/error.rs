use thiserror::Error;

/// Broad classification of every failure the engine can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Backend,
    Config,
}

#[derive(Debug, Error)]
pub enum LbError {
    /// Address is not a usable `ipv4:port` pair
    #[error("{role} address [{address}] is not valid: {reason}")]
    InvalidAddress {
        role: &'static str,
        address: String,
        reason: String,
    },

    #[error("invalid profile name [{name}]: {reason}")]
    InvalidProfileName { name: String, reason: String },

    #[error("IP [{0}] is not a valid ipv4")]
    InvalidIpv4(String),

    #[error(
        "source [{source_addr}] already defined on profile [{profile}]. \
         Either re-create this profile using a different --src-addr, \
         or delete the profile [{profile}] with --delete --profile={profile}"
    )]
    SourceAlreadyExists {
        source_addr: String,
        profile: String,
    },

    #[error(
        "profile [{0}] already defined. Either use a new profile adding --profile=<name>, \
         or reset this one with --reset --profile={0}"
    )]
    ProfileAlreadyDefined(String),

    #[error("profile [{0}] does not exist")]
    ProfileNotFound(String),

    #[error("key [{0}] not found in state")]
    KeyNotFound(String),

    #[error("table[{table}]/chain[{chain}] not in the list")]
    ChainNotFound { table: String, chain: String },

    /// Rule backend refused or failed an operation
    #[error("{operation} on table[{table}]/chain[{chain}] failed: {message}")]
    Backend {
        operation: &'static str,
        table: String,
        chain: String,
        message: String,
    },

    /// Profile store could not be read or written
    #[error("state error: {0}")]
    Store(String),

    #[error("both --delete and --reset options were provided. Only one can be used")]
    DeleteAndReset,

    #[error("profile [{profile}] is missing required field {field}")]
    MissingField {
        profile: String,
        field: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl LbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress { .. }
            | Self::InvalidProfileName { .. }
            | Self::InvalidIpv4(_) => ErrorKind::Validation,
            Self::SourceAlreadyExists { .. } | Self::ProfileAlreadyDefined(_) => {
                ErrorKind::Conflict
            }
            Self::ProfileNotFound(_) | Self::KeyNotFound(_) | Self::ChainNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::Backend { .. } | Self::Store(_) => ErrorKind::Backend,
            Self::DeleteAndReset | Self::MissingField { .. } | Self::Config(_) => {
                ErrorKind::Config
            }
        }
    }

    pub fn backend(
        operation: &'static str,
        table: &str,
        chain: &str,
        message: impl ToString,
    ) -> Self {
        Self::Backend {
            operation,
            table: table.to_string(),
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LbError>;

use crate::error::{LbError, Result};
use crate::rules::chain_name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PROTOCOL: &str = "tcp";
pub const DEFAULT_LOG_LEVEL: &str = "6";
pub const NAT_TABLE: &str = "nat";

/// Where the jump into a profile chain is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesBackend {
    /// Rules live on the client host (nat/OUTPUT)
    #[default]
    Client,
    /// Rules live on a forwarding proxy (nat/PREROUTING)
    Proxy,
    /// Rules live on the server host (nat/INPUT)
    Server,
}

impl RulesBackend {
    pub fn base_chain(&self) -> &'static str {
        match self {
            Self::Client => "OUTPUT",
            Self::Proxy => "PREROUTING",
            Self::Server => "INPUT",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Proxy => "proxy",
            Self::Server => "server",
        }
    }
}

impl FromStr for RulesBackend {
    type Err = LbError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "proxy" => Ok(Self::Proxy),
            "server" => Ok(Self::Server),
            other => Err(LbError::Config(format!(
                "unknown rules backend '{}', expected client, proxy or server",
                other
            ))),
        }
    }
}

impl fmt::Display for RulesBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (table, chain) pair every chain and rule operation targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainRef {
    pub table: String,
    pub chain: String,
}

impl ChainRef {
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
        }
    }

    pub fn nat(chain: impl Into<String>) -> Self {
        Self::new(NAT_TABLE, chain)
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table[{}]/chain[{}]", self.table, self.chain)
    }
}

/// Ordered rule tokens. Two specs are equal only if every token matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// True when the last two tokens are `-j <target>`
    pub fn jumps_to(&self, target: &str) -> bool {
        matches!(self.0.as_slice(), [.., flag, dest] if flag == "-j" && dest == target)
    }

    /// Parse one `-S` listing line (`-A CHAIN tokens...`) into its chain and rule.
    /// Policy (`-P`) and chain declaration (`-N`) lines yield `None`.
    pub fn from_listing(line: &str) -> Option<(String, RuleSpec)> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "-A" {
            return None;
        }
        let chain = parts.next()?.to_string();
        Some((chain, RuleSpec::new(parts)))
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Desired state of one load-balancing profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    pub source: String,
    pub destinations: Vec<String>,
    pub protocol: String,
    pub log_level: String,
    pub logging_enabled: bool,
    pub rules_backend: RulesBackend,
}

impl ProfileSpec {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destinations: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            destinations,
            protocol: DEFAULT_PROTOCOL.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            logging_enabled: false,
            rules_backend: RulesBackend::default(),
        }
    }

    pub fn with_backend(mut self, backend: RulesBackend) -> Self {
        self.rules_backend = backend;
        self
    }

    pub fn with_logging(mut self, level: impl Into<String>) -> Self {
        self.logging_enabled = true;
        self.log_level = level.into();
        self
    }

    /// Host and port halves of the source address
    pub fn source_parts(&self) -> Result<(&str, &str)> {
        split_socket_addr("source", &self.source)
    }

    pub fn custom_nat_chain(&self) -> ChainRef {
        ChainRef::nat(chain_name("nat", &self.name))
    }

    pub fn base_chain(&self) -> ChainRef {
        ChainRef::nat(self.rules_backend.base_chain())
    }
}

/// Caller-supplied desired state; unset fields fall back to the stored profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileRequest {
    pub name: String,
    pub source: Option<String>,
    pub destinations: Option<Vec<String>>,
    pub protocol: Option<String>,
    pub log_level: Option<String>,
    pub logging_enabled: Option<bool>,
    pub rules_backend: Option<RulesBackend>,
}

impl ProfileRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_overrides(&self) -> bool {
        self.source.is_some()
            || self.destinations.is_some()
            || self.protocol.is_some()
            || self.log_level.is_some()
            || self.logging_enabled.is_some()
            || self.rules_backend.is_some()
    }

    /// Merge this request over `stored`, or complete it with defaults when
    /// nothing is stored yet.
    pub fn resolve(&self, stored: Option<ProfileSpec>) -> Result<ProfileSpec> {
        let base = match stored {
            Some(spec) => spec,
            None => ProfileSpec::new(
                self.name.clone(),
                self.source.clone().ok_or_else(|| LbError::MissingField {
                    profile: self.name.clone(),
                    field: "source",
                })?,
                self.destinations
                    .clone()
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| LbError::MissingField {
                        profile: self.name.clone(),
                        field: "destinations",
                    })?,
            ),
        };

        let spec = ProfileSpec {
            name: self.name.clone(),
            source: self.source.clone().unwrap_or(base.source),
            destinations: self
                .destinations
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or(base.destinations),
            protocol: self.protocol.clone().unwrap_or(base.protocol),
            log_level: self.log_level.clone().unwrap_or(base.log_level),
            logging_enabled: self.logging_enabled.unwrap_or(base.logging_enabled),
            rules_backend: self.rules_backend.unwrap_or(base.rules_backend),
        };

        Ok(spec)
    }
}

impl From<&ProfileSpec> for ProfileRequest {
    fn from(spec: &ProfileSpec) -> Self {
        Self {
            name: spec.name.clone(),
            source: Some(spec.source.clone()),
            destinations: Some(spec.destinations.clone()),
            protocol: Some(spec.protocol.clone()),
            log_level: Some(spec.log_level.clone()),
            logging_enabled: Some(spec.logging_enabled),
            rules_backend: Some(spec.rules_backend),
        }
    }
}

/// Split `host:port`, rejecting anything that is not exactly two non-empty halves
pub fn split_socket_addr<'a>(role: &'static str, addr: &'a str) -> Result<(&'a str, &'a str)> {
    let invalid = |reason: &str| LbError::InvalidAddress {
        role,
        address: addr.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = addr.split(':').collect();
    match parts.as_slice() {
        [host, port] => {
            if host.is_empty() {
                return Err(invalid("host is empty"));
            }
            if port.is_empty() {
                return Err(invalid("port is empty"));
            }
            Ok((*host, *port))
        }
        _ => Err(invalid("expected ip:port")),
    }
}

use crate::error::{LbError, Result};
use crate::profile::split_socket_addr;
use crate::rules::chain_name;

/// Pluggable check run once per configure before anything is persisted
pub trait Validator {
    fn validate(&self, source: &str, destinations: &[String]) -> Result<()>;
}

/// Accepts addresses that split into exactly one non-empty host and port
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketPairValidator;

impl Validator for SocketPairValidator {
    fn validate(&self, source: &str, destinations: &[String]) -> Result<()> {
        split_socket_addr("source", source)?;

        if destinations.is_empty() {
            return Err(LbError::InvalidAddress {
                role: "destination",
                address: String::new(),
                reason: "at least one destination is required".to_string(),
            });
        }

        for dest in destinations {
            split_socket_addr("destination", dest)?;
        }

        Ok(())
    }
}

impl<F> Validator for F
where
    F: Fn(&str, &[String]) -> Result<()>,
{
    fn validate(&self, source: &str, destinations: &[String]) -> Result<()> {
        self(source, destinations)
    }
}

/// iptables refuses chain names longer than this
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Profile names become store keys and part of chain names, so keep them to
/// `[A-Za-z0-9_-]` and short enough that `IPTLB_NAT_<NAME>` fits iptables.
pub fn validate_profile_name(name: &str) -> Result<()> {
    let invalid = |reason: String| LbError::InvalidProfileName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty".into()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid(
            "name contains invalid characters (use only a-z, 0-9, _, -)".into(),
        ));
    }

    let chain = chain_name("nat", name);
    if chain.len() > MAX_CHAIN_NAME_LEN {
        return Err(invalid(format!(
            "chain name {} exceeds {} characters",
            chain, MAX_CHAIN_NAME_LEN
        )));
    }

    Ok(())
}

/// Check that the host half of `addr` is a dotted quad with every octet in 0..=255
/// and that the port half is a valid port number.
pub fn check_ipv4(role: &'static str, addr: &str) -> Result<()> {
    let (host, port) = split_socket_addr(role, addr)?;

    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() != 4 {
        return Err(LbError::InvalidIpv4(host.to_string()));
    }

    for octet in octets {
        if octet.is_empty() || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LbError::InvalidIpv4(host.to_string()));
        }
        match octet.parse::<u16>() {
            Ok(value) if value <= 255 => {}
            _ => return Err(LbError::InvalidIpv4(host.to_string())),
        }
    }

    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(LbError::InvalidAddress {
            role,
            address: addr.to_string(),
            reason: format!("port {} is not in 1-65535", port),
        }),
    }
}

//! Rule generator: pure builders for every rule a profile owns.
//!
//! Token order follows `iptables -S` output so listings and generated rules
//! can be compared token by token.

use crate::error::Result;
use crate::profile::{ChainRef, ProfileSpec, RuleSpec};

/// Chain name owned by `profile` for `purpose`, e.g. `IPTLB_NAT_WEB`
pub fn chain_name(purpose: &str, profile: &str) -> String {
    format!(
        "IPTLB_{}_{}",
        purpose.to_uppercase(),
        profile.to_uppercase()
    )
    .replace('-', "_")
}

/// Probability carried by the `i`-th of `n` distribution rules, as iptables prints it
pub fn probability(n: usize, i: usize) -> String {
    format!("{:.5}", 1.0 / (n - i) as f64)
}

/// DNAT rule sending a `1/(n-i)` share of the remaining traffic to `destination`
pub fn weighted_distribution_rule(
    protocol: &str,
    src_host: &str,
    src_port: &str,
    destination: &str,
    n: usize,
    i: usize,
) -> RuleSpec {
    let probability = probability(n, i);
    RuleSpec::new([
        "-p",
        protocol,
        "-d",
        src_host,
        "--dport",
        src_port,
        "-m",
        "statistic",
        "--mode",
        "random",
        "--probability",
        probability.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        destination,
    ])
}

pub fn return_rule() -> RuleSpec {
    RuleSpec::new(["-j", "RETURN"])
}

/// Rule in a base chain sending matching traffic into `target`
pub fn jump_rule(protocol: &str, src_host: &str, src_port: &str, target: &str) -> RuleSpec {
    RuleSpec::new([
        "-p", protocol, "-d", src_host, "--dport", src_port, "-j", target,
    ])
}

/// Non-terminating LOG rule placed ahead of the jump in the base chain.
/// Matches the full source so profiles sharing a host keep separate LOG rules.
pub fn log_rule(
    src_host: &str,
    src_port: &str,
    protocol: &str,
    chain_label: &str,
    level: &str,
) -> RuleSpec {
    RuleSpec::new([
        "-d".to_string(),
        src_host.to_string(),
        "-p".to_string(),
        protocol.to_string(),
        "--dport".to_string(),
        src_port.to_string(),
        "-j".to_string(),
        "LOG".to_string(),
        "--log-prefix".to_string(),
        format!("IPTLB:{}:ACCEPT:", chain_label),
        "--log-level".to_string(),
        level.to_string(),
    ])
}

/// Always-on LOG rule appended to a logged custom chain
pub fn chain_log_rule(chain: &str, level: &str) -> RuleSpec {
    RuleSpec::new([
        "-j".to_string(),
        "LOG".to_string(),
        "--log-prefix".to_string(),
        format!("{}:ACCEPT:", chain),
        "--log-level".to_string(),
        level.to_string(),
    ])
}

/// All distribution rules for `spec` in evaluation order, followed by RETURN
pub fn distribution_rules(spec: &ProfileSpec) -> Result<Vec<RuleSpec>> {
    let (host, port) = spec.source_parts()?;
    let n = spec.destinations.len();

    let mut rules: Vec<RuleSpec> = spec
        .destinations
        .iter()
        .enumerate()
        .map(|(i, dest)| weighted_distribution_rule(&spec.protocol, host, port, dest, n, i))
        .collect();
    rules.push(return_rule());

    Ok(rules)
}

/// Jump from the backend's base chain into the profile chain, with the base chain it belongs to
pub fn custom_nat_jump_rule(spec: &ProfileSpec) -> Result<(ChainRef, RuleSpec)> {
    let (host, port) = spec.source_parts()?;
    let target = spec.custom_nat_chain();
    Ok((
        spec.base_chain(),
        jump_rule(&spec.protocol, host, port, &target.chain),
    ))
}

/// Logging rule for the base chain, labelled with the base chain's name
pub fn logging_jump_rule(spec: &ProfileSpec) -> Result<(ChainRef, RuleSpec)> {
    let (host, port) = spec.source_parts()?;
    let base = spec.base_chain();
    let rule = log_rule(host, port, &spec.protocol, &base.chain, &spec.log_level);
    Ok((base, rule))
}

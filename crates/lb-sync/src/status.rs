use lb_core::{ChainRef, ProfileSpec, RuleSpec};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub table: String,
    pub chain: String,
    pub rule: String,
    pub present: bool,
}

impl RuleStatus {
    pub fn new(chain: &ChainRef, rule: &RuleSpec, present: bool) -> Self {
        Self {
            table: chain.table.clone(),
            chain: chain.chain.clone(),
            rule: rule.to_string(),
            present,
        }
    }
}

/// Live iptables state of one stored profile compared with what it should be
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub profile: ProfileSpec,
    pub custom_chain: String,
    pub chain_present: bool,
    pub rules: Vec<RuleStatus>,
    /// Base-chain rules jumping into the custom chain
    pub references: usize,
}

impl ProfileStatus {
    pub fn missing_rules(&self) -> impl Iterator<Item = &RuleStatus> {
        self.rules.iter().filter(|r| !r.present)
    }

    /// Chain present, every rule present, exactly one jump into the chain
    pub fn is_converged(&self) -> bool {
        self.chain_present && self.missing_rules().next().is_none() && self.references == 1
    }

    pub fn display(&self) {
        let marker = if self.is_converged() { "✅" } else { "⚠️ " };
        println!("{} Profile {}", marker, self.profile.name);
        println!(
            "  Source: {} ({}, {} backend)",
            self.profile.source, self.profile.protocol, self.profile.rules_backend
        );
        println!("  Destinations: {}", self.profile.destinations.join(", "));
        if self.profile.logging_enabled {
            println!("  Logging: level {}", self.profile.log_level);
        }

        let chain_state = if self.chain_present { "present" } else { "missing" };
        println!("  Chain nat/{}: {}", self.custom_chain, chain_state);
        println!("  Jump references: {}", self.references);

        for rule in &self.rules {
            let mark = if rule.present { "•" } else { "✗" };
            println!("    {} {}/{}: {}", mark, rule.table, rule.chain, rule.rule);
        }
    }
}

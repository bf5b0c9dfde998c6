use crate::backend::RuleBackend;
use lb_core::{ChainRef, Result, RuleSpec};
use tracing::info;

/// Check-then-act rule edits. Every method returns whether the chain changed.
pub struct RuleMutator<'a, B: RuleBackend + ?Sized> {
    backend: &'a B,
}

impl<'a, B: RuleBackend + ?Sized> RuleMutator<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    pub fn exists(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        self.backend.exists(chain, rule)
    }

    /// Insert at 1-based `index` unless the rule is already in the chain
    pub fn insert(&self, chain: &ChainRef, index: usize, rule: &RuleSpec) -> Result<bool> {
        if self.exists(chain, rule)? {
            info!(
                table = %chain.table,
                chain = %chain.chain,
                index,
                rule = %rule,
                "[Insert] rule already exists"
            );
            return Ok(false);
        }

        info!(
            table = %chain.table,
            chain = %chain.chain,
            index,
            rule = %rule,
            "[Insert] rule"
        );
        self.backend.insert(chain, index, rule)?;
        Ok(true)
    }

    /// Append unless the rule is already in the chain
    pub fn append(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        if self.exists(chain, rule)? {
            info!(
                table = %chain.table,
                chain = %chain.chain,
                rule = %rule,
                "[Append] rule already exists"
            );
            return Ok(false);
        }

        info!(
            table = %chain.table,
            chain = %chain.chain,
            rule = %rule,
            "[Append] rule"
        );
        self.backend.append(chain, rule)?;
        Ok(true)
    }

    /// Remove the rule if present
    pub fn remove(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        if !self.exists(chain, rule)? {
            return Ok(false);
        }

        self.backend.delete(chain, rule)?;
        info!(
            table = %chain.table,
            chain = %chain.chain,
            rule = %rule,
            "[Deleted] rule"
        );
        Ok(true)
    }
}

use lb_core::{ChainRef, LbError, Result, RuleSpec};

/// Access to the live packet-filter tables.
///
/// Every call blocks until the kernel (or the fake) has answered. Rule
/// positions are 1-based like `iptables -I`.
pub trait RuleBackend {
    /// Chain names present in `table`
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;

    fn chain_exists(&self, chain: &ChainRef) -> Result<bool> {
        Ok(self
            .list_chains(&chain.table)?
            .iter()
            .any(|name| *name == chain.chain))
    }

    fn new_chain(&self, chain: &ChainRef) -> Result<()>;
    /// Remove every rule from the chain
    fn clear_chain(&self, chain: &ChainRef) -> Result<()>;
    /// Flush then delete; refused while another rule still jumps here
    fn clear_and_delete_chain(&self, chain: &ChainRef) -> Result<()>;
    /// Rules in `iptables -S` form, including the leading `-P`/`-N` line
    fn list_rules(&self, chain: &ChainRef) -> Result<Vec<String>>;
    fn exists(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool>;
    fn insert(&self, chain: &ChainRef, index: usize, rule: &RuleSpec) -> Result<()>;
    fn append(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()>;
    fn delete(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()>;
}

impl<B: RuleBackend + ?Sized> RuleBackend for &B {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        (**self).list_chains(table)
    }

    fn chain_exists(&self, chain: &ChainRef) -> Result<bool> {
        (**self).chain_exists(chain)
    }

    fn new_chain(&self, chain: &ChainRef) -> Result<()> {
        (**self).new_chain(chain)
    }

    fn clear_chain(&self, chain: &ChainRef) -> Result<()> {
        (**self).clear_chain(chain)
    }

    fn clear_and_delete_chain(&self, chain: &ChainRef) -> Result<()> {
        (**self).clear_and_delete_chain(chain)
    }

    fn list_rules(&self, chain: &ChainRef) -> Result<Vec<String>> {
        (**self).list_rules(chain)
    }

    fn exists(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        (**self).exists(chain, rule)
    }

    fn insert(&self, chain: &ChainRef, index: usize, rule: &RuleSpec) -> Result<()> {
        (**self).insert(chain, index, rule)
    }

    fn append(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        (**self).append(chain, rule)
    }

    fn delete(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        (**self).delete(chain, rule)
    }
}

/// IPv4 backend driving the `iptables` binary
pub struct IptablesBackend {
    inner: iptables::IPTables,
}

impl IptablesBackend {
    pub fn new() -> Result<Self> {
        let inner = iptables::new(false).map_err(|e| LbError::backend("init", "-", "-", e))?;
        Ok(Self { inner })
    }
}

impl RuleBackend for IptablesBackend {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.inner
            .list_chains(table)
            .map_err(|e| LbError::backend("list_chains", table, "*", e))
    }

    fn chain_exists(&self, chain: &ChainRef) -> Result<bool> {
        self.inner
            .chain_exists(&chain.table, &chain.chain)
            .map_err(|e| LbError::backend("chain_exists", &chain.table, &chain.chain, e))
    }

    fn new_chain(&self, chain: &ChainRef) -> Result<()> {
        self.inner
            .new_chain(&chain.table, &chain.chain)
            .map_err(|e| LbError::backend("new_chain", &chain.table, &chain.chain, e))
    }

    fn clear_chain(&self, chain: &ChainRef) -> Result<()> {
        self.inner
            .flush_chain(&chain.table, &chain.chain)
            .map_err(|e| LbError::backend("flush_chain", &chain.table, &chain.chain, e))
    }

    fn clear_and_delete_chain(&self, chain: &ChainRef) -> Result<()> {
        self.clear_chain(chain)?;
        self.inner
            .delete_chain(&chain.table, &chain.chain)
            .map_err(|e| LbError::backend("delete_chain", &chain.table, &chain.chain, e))
    }

    fn list_rules(&self, chain: &ChainRef) -> Result<Vec<String>> {
        self.inner
            .list(&chain.table, &chain.chain)
            .map_err(|e| LbError::backend("list", &chain.table, &chain.chain, e))
    }

    fn exists(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        self.inner
            .exists(&chain.table, &chain.chain, &rule.to_string())
            .map_err(|e| LbError::backend("exists", &chain.table, &chain.chain, e))
    }

    fn insert(&self, chain: &ChainRef, index: usize, rule: &RuleSpec) -> Result<()> {
        let position = i32::try_from(index).map_err(|_| {
            LbError::backend(
                "insert",
                &chain.table,
                &chain.chain,
                format!("index {} out of range", index),
            )
        })?;
        self.inner
            .insert(&chain.table, &chain.chain, &rule.to_string(), position)
            .map_err(|e| LbError::backend("insert", &chain.table, &chain.chain, e))
    }

    fn append(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        self.inner
            .append(&chain.table, &chain.chain, &rule.to_string())
            .map_err(|e| LbError::backend("append", &chain.table, &chain.chain, e))
    }

    fn delete(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        self.inner
            .delete(&chain.table, &chain.chain, &rule.to_string())
            .map_err(|e| LbError::backend("delete", &chain.table, &chain.chain, e))
    }
}

use crate::backend::RuleBackend;
use crate::mutator::RuleMutator;
use lb_core::rules::chain_log_rule;
use lb_core::{ChainRef, LbError, Result};
use tracing::info;

/// Chain lifecycle: Absent -> Present(unlogged) -> Present(logged)
pub struct ChainManager<'a, B: RuleBackend + ?Sized> {
    backend: &'a B,
}

impl<'a, B: RuleBackend + ?Sized> ChainManager<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    pub fn exists(&self, chain: &ChainRef) -> Result<bool> {
        self.backend.chain_exists(chain)
    }

    /// Create the chain when absent and verify it is really there afterwards.
    /// With `log_level` set, also make sure the chain's LOG rule is present.
    pub fn ensure(&self, chain: &ChainRef, log_level: Option<&str>) -> Result<()> {
        if self.exists(chain)? {
            info!(table = %chain.table, chain = %chain.chain, "Chain found");
        } else {
            info!(
                table = %chain.table,
                chain = %chain.chain,
                "Chain does not exist. Creating..."
            );
            self.backend.new_chain(chain)?;
        }

        if !self.exists(chain)? {
            return Err(LbError::ChainNotFound {
                table: chain.table.clone(),
                chain: chain.chain.clone(),
            });
        }

        let Some(level) = log_level else {
            return Ok(());
        };

        RuleMutator::new(self.backend).append(chain, &chain_log_rule(&chain.chain, level))?;
        info!(chain = %chain.chain, "Enabled logging to chain");
        Ok(())
    }

    pub fn flush(&self, chain: &ChainRef) -> Result<()> {
        self.backend.clear_chain(chain)
    }

    /// Delete the chain. The backend refuses while jump rules still point here.
    pub fn delete(&self, chain: &ChainRef) -> Result<()> {
        self.backend.clear_and_delete_chain(chain)?;
        info!(table = %chain.table, chain = %chain.chain, "Chain deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use lb_core::{ErrorKind, RuleSpec};

    #[test]
    fn ensure_creates_once_and_logs_once() {
        let backend = MemoryBackend::new();
        let manager = ChainManager::new(&backend);
        let chain = ChainRef::nat("IPTLB_NAT_WEB");

        manager.ensure(&chain, Some("6")).unwrap();
        manager.ensure(&chain, Some("6")).unwrap();

        assert_eq!(
            backend.rules(&chain),
            vec![chain_log_rule("IPTLB_NAT_WEB", "6")]
        );
    }

    #[test]
    fn ensure_without_logging_leaves_chain_empty() {
        let backend = MemoryBackend::new();
        let chain = ChainRef::nat("IPTLB_NAT_API");
        ChainManager::new(&backend).ensure(&chain, None).unwrap();
        assert!(backend.has_chain(&chain));
        assert!(backend.rules(&chain).is_empty());
    }

    #[test]
    fn ensure_reports_chain_missing_after_create() {
        let backend = MemoryBackend::with_phantom_chain_creation();
        let chain = ChainRef::nat("IPTLB_NAT_WEB");
        let err = ChainManager::new(&backend).ensure(&chain, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn delete_surfaces_reference_refusal() {
        let backend = MemoryBackend::new();
        let manager = ChainManager::new(&backend);
        let chain = ChainRef::nat("IPTLB_NAT_WEB");
        manager.ensure(&chain, None).unwrap();
        backend
            .append(
                &ChainRef::nat("PREROUTING"),
                &RuleSpec::new(["-j", "IPTLB_NAT_WEB"]),
            )
            .unwrap();

        let err = manager.delete(&chain).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(backend.has_chain(&chain));
    }
}

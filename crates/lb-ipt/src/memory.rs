use crate::backend::RuleBackend;
use lb_core::{ChainRef, LbError, Result, RuleSpec};
use std::cell::RefCell;
use std::collections::BTreeMap;

const BUILTIN_CHAINS: &[(&str, &[&str])] = &[
    ("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    ("filter", &["INPUT", "FORWARD", "OUTPUT"]),
];

#[derive(Debug, Default, Clone)]
struct MemChain {
    builtin: bool,
    rules: Vec<RuleSpec>,
}

/// In-process rule tables with iptables' refusal semantics: no duplicate
/// chains, no deleting built-ins or referenced chains, no rules on missing chains.
#[derive(Debug)]
pub struct MemoryBackend {
    tables: RefCell<BTreeMap<String, BTreeMap<String, MemChain>>>,
    ignore_new_chain: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for (table, chains) in BUILTIN_CHAINS {
            let entry: &mut BTreeMap<String, MemChain> =
                tables.entry(table.to_string()).or_default();
            for chain in *chains {
                entry.insert(
                    chain.to_string(),
                    MemChain {
                        builtin: true,
                        rules: vec![],
                    },
                );
            }
        }

        Self {
            tables: RefCell::new(tables),
            ignore_new_chain: false,
        }
    }

    /// A backend whose `new_chain` reports success without creating anything
    pub fn with_phantom_chain_creation() -> Self {
        Self {
            ignore_new_chain: true,
            ..Self::new()
        }
    }

    /// Rules currently in `chain`, empty when the chain is absent
    pub fn rules(&self, chain: &ChainRef) -> Vec<RuleSpec> {
        self.tables
            .borrow()
            .get(&chain.table)
            .and_then(|t| t.get(&chain.chain))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, chain: &ChainRef) -> bool {
        self.tables
            .borrow()
            .get(&chain.table)
            .is_some_and(|t| t.contains_key(&chain.chain))
    }

    fn with_chain<T>(
        &self,
        operation: &'static str,
        chain: &ChainRef,
        f: impl FnOnce(&mut MemChain) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.tables.borrow_mut();
        let found = tables
            .get_mut(&chain.table)
            .and_then(|t| t.get_mut(&chain.chain))
            .ok_or_else(|| {
                LbError::backend(
                    operation,
                    &chain.table,
                    &chain.chain,
                    "No chain/target/match by that name",
                )
            })?;
        f(found)
    }

    fn references(&self, chain: &ChainRef) -> usize {
        self.tables
            .borrow()
            .get(&chain.table)
            .map(|t| {
                t.values()
                    .flat_map(|c| c.rules.iter())
                    .filter(|r| r.jumps_to(&chain.chain))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBackend for MemoryBackend {
    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .borrow()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn new_chain(&self, chain: &ChainRef) -> Result<()> {
        if self.has_chain(chain) {
            return Err(LbError::backend(
                "new_chain",
                &chain.table,
                &chain.chain,
                "Chain already exists",
            ));
        }
        if self.ignore_new_chain {
            return Ok(());
        }

        self.tables
            .borrow_mut()
            .entry(chain.table.clone())
            .or_default()
            .insert(chain.chain.clone(), MemChain::default());
        Ok(())
    }

    fn clear_chain(&self, chain: &ChainRef) -> Result<()> {
        self.with_chain("flush_chain", chain, |c| {
            c.rules.clear();
            Ok(())
        })
    }

    fn clear_and_delete_chain(&self, chain: &ChainRef) -> Result<()> {
        let builtin = self.with_chain("delete_chain", chain, |c| Ok(c.builtin))?;
        if builtin {
            return Err(LbError::backend(
                "delete_chain",
                &chain.table,
                &chain.chain,
                "Can't delete built-in chain",
            ));
        }

        self.clear_chain(chain)?;

        if self.references(chain) > 0 {
            return Err(LbError::backend(
                "delete_chain",
                &chain.table,
                &chain.chain,
                "Too many links",
            ));
        }

        if let Some(table) = self.tables.borrow_mut().get_mut(&chain.table) {
            table.remove(&chain.chain);
        }
        Ok(())
    }

    fn list_rules(&self, chain: &ChainRef) -> Result<Vec<String>> {
        self.with_chain("list", chain, |c| {
            let header = if c.builtin {
                format!("-P {} ACCEPT", chain.chain)
            } else {
                format!("-N {}", chain.chain)
            };
            let mut lines = vec![header];
            lines.extend(c.rules.iter().map(|r| format!("-A {} {}", chain.chain, r)));
            Ok(lines)
        })
    }

    fn exists(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<bool> {
        self.with_chain("exists", chain, |c| Ok(c.rules.contains(rule)))
    }

    fn insert(&self, chain: &ChainRef, index: usize, rule: &RuleSpec) -> Result<()> {
        self.with_chain("insert", chain, |c| {
            if index == 0 || index > c.rules.len() + 1 {
                return Err(LbError::backend(
                    "insert",
                    &chain.table,
                    &chain.chain,
                    "Index of insertion too big",
                ));
            }
            c.rules.insert(index - 1, rule.clone());
            Ok(())
        })
    }

    fn append(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        self.with_chain("append", chain, |c| {
            c.rules.push(rule.clone());
            Ok(())
        })
    }

    fn delete(&self, chain: &ChainRef, rule: &RuleSpec) -> Result<()> {
        self.with_chain("delete", chain, |c| {
            match c.rules.iter().position(|r| r == rule) {
                Some(pos) => {
                    c.rules.remove(pos);
                    Ok(())
                }
                None => Err(LbError::backend(
                    "delete",
                    &chain.table,
                    &chain.chain,
                    "Bad rule (does a matching rule exist in that chain?)",
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(target: &str) -> RuleSpec {
        RuleSpec::new(["-p", "tcp", "-j", target])
    }

    #[test]
    fn seeds_builtin_chains() {
        let backend = MemoryBackend::new();
        assert!(backend.chain_exists(&ChainRef::nat("OUTPUT")).unwrap());
        assert!(backend.chain_exists(&ChainRef::new("filter", "FORWARD")).unwrap());
        assert!(!backend.chain_exists(&ChainRef::nat("IPTLB_NAT_WEB")).unwrap());
        assert_eq!(
            backend.list_chains("nat").unwrap(),
            vec!["INPUT", "OUTPUT", "POSTROUTING", "PREROUTING"]
        );
        assert!(backend.list_chains("mangle").unwrap().is_empty());
    }

    #[test]
    fn insert_is_one_based() {
        let backend = MemoryBackend::new();
        let output = ChainRef::nat("OUTPUT");
        backend.append(&output, &rule("A")).unwrap();
        backend.insert(&output, 1, &rule("B")).unwrap();
        assert_eq!(backend.rules(&output), vec![rule("B"), rule("A")]);

        assert!(backend.insert(&output, 0, &rule("C")).is_err());
        assert!(backend.insert(&output, 4, &rule("C")).is_err());
    }

    #[test]
    fn referenced_chain_cannot_be_deleted() {
        let backend = MemoryBackend::new();
        let custom = ChainRef::nat("IPTLB_NAT_WEB");
        let output = ChainRef::nat("OUTPUT");
        backend.new_chain(&custom).unwrap();
        backend.append(&output, &rule("IPTLB_NAT_WEB")).unwrap();

        let err = backend.clear_and_delete_chain(&custom).unwrap_err();
        assert!(err.to_string().contains("Too many links"));

        backend.delete(&output, &rule("IPTLB_NAT_WEB")).unwrap();
        backend.clear_and_delete_chain(&custom).unwrap();
        assert!(!backend.has_chain(&custom));
    }

    #[test]
    fn listing_matches_iptables_format() {
        let backend = MemoryBackend::new();
        let custom = ChainRef::nat("IPTLB_NAT_WEB");
        backend.new_chain(&custom).unwrap();
        backend.append(&custom, &RuleSpec::new(["-j", "RETURN"])).unwrap();

        assert_eq!(
            backend.list_rules(&custom).unwrap(),
            vec!["-N IPTLB_NAT_WEB", "-A IPTLB_NAT_WEB -j RETURN"]
        );
        assert_eq!(
            backend.list_rules(&ChainRef::nat("INPUT")).unwrap(),
            vec!["-P INPUT ACCEPT"]
        );
    }

    #[test]
    fn operations_on_missing_chain_fail() {
        let backend = MemoryBackend::new();
        let missing = ChainRef::nat("NOPE");
        assert!(backend.exists(&missing, &rule("X")).is_err());
        assert!(backend.append(&missing, &rule("X")).is_err());
        assert!(backend.clear_chain(&missing).is_err());
    }
}

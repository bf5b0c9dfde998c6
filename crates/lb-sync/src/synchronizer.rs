use crate::status::{ProfileStatus, RuleStatus};
use lb_core::rules::{
    chain_log_rule, chain_name, custom_nat_jump_rule, distribution_rules, logging_jump_rule,
};
use lb_core::{
    check_ipv4, validate_profile_name, ChainRef, LbError, ProfileRequest, ProfileSpec, Result,
    RuleSpec, RulesBackend, Validator,
};
use lb_ipt::{ChainManager, RuleBackend, RuleMutator};
use lb_state::{KeyValueStore, ProfileStore};
use tracing::{debug, info, warn};

/// Per-invocation switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub delete: bool,
    pub reset: bool,
    /// When false only the stored attributes are touched
    pub create_rules: bool,
    /// Trust the stored attributes and do not rewrite them
    pub use_state: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete: false,
            reset: false,
            create_rules: true,
            use_state: false,
        }
    }
}

/// Converges iptables and the profile store towards a requested profile
pub struct Synchronizer<B, S, V> {
    backend: B,
    profiles: ProfileStore<S>,
    validator: V,
    options: SyncOptions,
}

impl<B, S, V> Synchronizer<B, S, V>
where
    B: RuleBackend,
    S: KeyValueStore,
    V: Validator,
{
    pub fn new(backend: B, store: S, validator: V, options: SyncOptions) -> Self {
        Self {
            backend,
            profiles: ProfileStore::new(store),
            validator,
            options,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn profiles(&self) -> &ProfileStore<S> {
        &self.profiles
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn set_options(&mut self, options: SyncOptions) {
        self.options = options;
    }

    pub fn into_store(self) -> S {
        self.profiles.into_inner()
    }

    /// Apply `request` according to the current options
    pub fn configure(&mut self, request: &ProfileRequest) -> Result<()> {
        let options = self.options;
        if options.delete && options.reset {
            return Err(LbError::DeleteAndReset);
        }

        let name = request.name.as_str();
        validate_profile_name(name)?;

        if options.delete {
            if self.profile_exists(name) {
                self.delete_profile(name)?;
            } else {
                info!(profile = %name, "Profile not defined, nothing to delete");
            }
            return Ok(());
        }

        // Resolved before any deletion so a reset keeps the stored fields
        // the request leaves out.
        let spec = request.resolve(self.stored_spec(name)?)?;

        if options.reset && self.profile_exists(name) {
            info!(profile = %name, "Resetting profile");
            self.delete_profile(name)?;
        }

        self.validator.validate(&spec.source, &spec.destinations)?;
        self.add_profile(&spec)
    }

    /// Store `spec` and install its chain, distribution rules and jumps
    pub fn add_profile(&mut self, spec: &ProfileSpec) -> Result<()> {
        check_ipv4("source", &spec.source)?;
        for destination in &spec.destinations {
            check_ipv4("destination", destination)?;
        }

        let options = self.options;
        if options.use_state && !options.reset {
            debug!(profile = %spec.name, "Using stored attributes");
        } else {
            self.profiles.write(spec)?;
        }

        if !options.create_rules {
            info!(profile = %spec.name, "Rule creation skipped");
            return Ok(());
        }

        let spec = self.load_state(&spec.name)?;
        let chain = spec.custom_nat_chain();
        let log_level = spec.logging_enabled.then_some(spec.log_level.as_str());
        ChainManager::new(&self.backend).ensure(&chain, log_level)?;

        let mutator = RuleMutator::new(&self.backend);
        for rule in distribution_rules(&spec)? {
            mutator.append(&chain, &rule)?;
        }

        let (base, jump) = custom_nat_jump_rule(&spec)?;
        mutator.insert(&base, 1, &jump)?;

        if spec.logging_enabled {
            let (base, log) = logging_jump_rule(&spec)?;
            mutator.insert(&base, 1, &log)?;
        }

        info!(
            profile = %spec.name,
            chain = %chain.chain,
            destinations = spec.destinations.len(),
            "Profile configured"
        );
        Ok(())
    }

    /// Remove every rule and chain owned by `name`, then its stored attributes
    pub fn delete_profile(&mut self, name: &str) -> Result<()> {
        let stored = self.stored_spec(name)?;

        if self.options.create_rules {
            let chain = match &stored {
                Some(spec) => spec.custom_nat_chain(),
                None => ChainRef::nat(chain_name("nat", name)),
            };
            let chains = ChainManager::new(&self.backend);

            if chains.exists(&chain)? {
                let mutator = RuleMutator::new(&self.backend);

                if let Some(spec) = &stored {
                    for rule in distribution_rules(spec)? {
                        mutator.remove(&chain, &rule)?;
                    }
                    let (base, jump) = custom_nat_jump_rule(spec)?;
                    mutator.remove(&base, &jump)?;
                    let (base, log) = logging_jump_rule(spec)?;
                    mutator.remove(&base, &log)?;
                }

                let removed = self.remove_references(&chain)?;
                if removed > 0 {
                    info!(profile = %name, removed, "Removed remaining jumps to chain");
                }

                chains.flush(&chain)?;
                chains.delete(&chain)?;
            } else {
                debug!(profile = %name, chain = %chain.chain, "Chain already absent");
            }
        }

        match self.profiles.remove(name) {
            Ok(()) => {
                info!(profile = %name, "Profile deleted");
                Ok(())
            }
            Err(LbError::ProfileNotFound(_)) => {
                warn!(profile = %name, "Profile was not stored, nothing left to remove");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stored spec of `name`. An entry too incomplete or malformed to rebuild
    /// counts as absent, so it can still be deleted or reset.
    fn stored_spec(&self, name: &str) -> Result<Option<ProfileSpec>> {
        match self.profiles.find(name) {
            Ok(found) => Ok(found),
            Err(
                e @ (LbError::MissingField { .. } | LbError::Store(_) | LbError::Config(_)),
            ) => {
                warn!(profile = %name, error = %e, "Stored profile is incomplete, ignoring it");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop every base-chain rule whose target is `chain`
    fn remove_references(&self, chain: &ChainRef) -> Result<usize> {
        let mutator = RuleMutator::new(&self.backend);
        let mut removed = 0;

        for base in Self::base_chains() {
            if !self.backend.chain_exists(&base)? {
                continue;
            }
            for rule in self.references_in(&base, &chain.chain)? {
                if mutator.remove(&base, &rule)? {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    fn references_in(&self, base: &ChainRef, target: &str) -> Result<Vec<RuleSpec>> {
        Ok(self
            .backend
            .list_rules(base)?
            .iter()
            .filter_map(|line| RuleSpec::from_listing(line))
            .filter(|(owner, rule)| *owner == base.chain && rule.jumps_to(target))
            .map(|(_, rule)| rule)
            .collect())
    }

    fn base_chains() -> impl Iterator<Item = ChainRef> {
        [RulesBackend::Client, RulesBackend::Proxy, RulesBackend::Server]
            .into_iter()
            .map(|backend| ChainRef::nat(backend.base_chain()))
    }

    pub fn profile_exists(&self, name: &str) -> bool {
        self.profiles.exists(name)
    }

    pub fn load_state(&self, name: &str) -> Result<ProfileSpec> {
        self.profiles.load(name)
    }

    pub fn custom_nat_jump_rule(&self, spec: &ProfileSpec) -> Result<(ChainRef, RuleSpec)> {
        custom_nat_jump_rule(spec)
    }

    /// Re-apply every stored profile from its stored attributes. Stops at the
    /// first failure and returns how many profiles were applied otherwise.
    pub fn replay_all(&mut self) -> Result<usize> {
        let saved = self.options;
        self.options = SyncOptions {
            delete: false,
            reset: false,
            use_state: true,
            ..saved
        };

        let result = self.replay_stored();
        self.options = saved;
        result
    }

    fn replay_stored(&mut self) -> Result<usize> {
        let names = self.profiles.names()?;
        info!(count = names.len(), "Replaying stored profiles");

        for name in &names {
            self.configure(&ProfileRequest::new(name.as_str()))?;
        }
        Ok(names.len())
    }

    /// Compare the live rules of `name` with what its stored spec asks for
    pub fn status(&self, name: &str) -> Result<ProfileStatus> {
        let spec = self.load_state(name)?;
        let chain = spec.custom_nat_chain();
        let chain_present = self.backend.chain_exists(&chain)?;
        let mutator = RuleMutator::new(&self.backend);

        let mut wanted = Vec::new();
        if spec.logging_enabled {
            wanted.push(chain_log_rule(&chain.chain, &spec.log_level));
        }
        wanted.extend(distribution_rules(&spec)?);

        let mut rules = Vec::with_capacity(wanted.len() + 2);
        for rule in &wanted {
            let present = chain_present && mutator.exists(&chain, rule)?;
            rules.push(RuleStatus::new(&chain, rule, present));
        }

        let (base, jump) = custom_nat_jump_rule(&spec)?;
        let base_present = self.backend.chain_exists(&base)?;
        let present = base_present && mutator.exists(&base, &jump)?;
        rules.push(RuleStatus::new(&base, &jump, present));

        if spec.logging_enabled {
            let (base, log) = logging_jump_rule(&spec)?;
            let present = base_present && mutator.exists(&base, &log)?;
            rules.push(RuleStatus::new(&base, &log, present));
        }

        let mut references = 0;
        for base in Self::base_chains() {
            if self.backend.chain_exists(&base)? {
                references += self.references_in(&base, &chain.chain)?.len();
            }
        }

        Ok(ProfileStatus {
            custom_chain: chain.chain,
            chain_present,
            rules,
            references,
            profile: spec,
        })
    }

    /// Every stored profile, sorted by name
    pub fn list(&self) -> Result<Vec<ProfileSpec>> {
        self.profiles.list()
    }
}

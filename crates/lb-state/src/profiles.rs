use crate::store::KeyValueStore;
use lb_core::{LbError, ProfileSpec, Result, RulesBackend};
use serde_yaml::{Mapping, Value};
use tracing::debug;

pub const FIELD_SOURCE: &str = "source";
pub const FIELD_DESTINATION: &str = "destination";
pub const FIELD_PROTOCOL: &str = "protocol";
pub const FIELD_LOG_LEVEL: &str = "logLevel";
pub const FIELD_LOG_ENABLED: &str = "logEnabled";
pub const FIELD_RULES_BACKEND: &str = "rulesBackend";

fn key(profile: &str, field: &str) -> String {
    format!("{}.{}", profile, field)
}

/// Profile-level view over a dotted key-value store
pub struct ProfileStore<S> {
    store: S,
}

impl<S: KeyValueStore> ProfileStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    pub fn exists(&self, name: &str) -> bool {
        self.store.get_path(name).is_ok()
    }

    pub fn names(&self) -> Result<Vec<String>> {
        self.store.top_level_keys()
    }

    /// Fail when another profile already balances `source`
    pub fn check_source(&self, name: &str, source: &str) -> Result<()> {
        for found in self.store.find_keys(FIELD_SOURCE)? {
            let Some(owner) = found.strip_suffix(&format!(".{}", FIELD_SOURCE)) else {
                continue;
            };
            if owner == name {
                continue;
            }
            let stored = self.store.get_path(&found)?;
            if stored.as_str() == Some(source) {
                return Err(LbError::SourceAlreadyExists {
                    source_addr: source.to_string(),
                    profile: owner.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fail when `name` already has a stored source
    pub fn check_key(&self, name: &str) -> Result<()> {
        let wanted = key(name, FIELD_SOURCE);
        if self.store.find_keys(FIELD_SOURCE)?.iter().any(|k| *k == wanted) {
            return Err(LbError::ProfileAlreadyDefined(name.to_string()));
        }
        Ok(())
    }

    pub fn add_source(&mut self, name: &str, source: &str) -> Result<()> {
        self.check_source(name, source)?;
        self.check_key(name)?;
        self.store
            .upsert(&key(name, FIELD_SOURCE), Value::from(source))
    }

    pub fn add_destinations(&mut self, name: &str, destinations: &[String]) -> Result<()> {
        let list = destinations.iter().map(|d| Value::from(d.as_str())).collect();
        self.store
            .upsert(&key(name, FIELD_DESTINATION), Value::Sequence(list))
    }

    pub fn add_protocol(&mut self, name: &str, protocol: &str) -> Result<()> {
        self.store
            .upsert(&key(name, FIELD_PROTOCOL), Value::from(protocol))
    }

    pub fn add_log_level(&mut self, name: &str, level: &str) -> Result<()> {
        self.store
            .upsert(&key(name, FIELD_LOG_LEVEL), Value::from(level))
    }

    pub fn add_logging_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.store
            .upsert(&key(name, FIELD_LOG_ENABLED), Value::from(enabled))
    }

    pub fn add_rules_backend(&mut self, name: &str, backend: RulesBackend) -> Result<()> {
        self.store
            .upsert(&key(name, FIELD_RULES_BACKEND), Value::from(backend.as_str()))
    }

    /// Persist every attribute of `spec` as one mapping, so the profile is
    /// either stored whole or not at all. The source conflict and
    /// already-defined checks run before anything is written.
    pub fn write(&mut self, spec: &ProfileSpec) -> Result<()> {
        self.check_source(&spec.name, &spec.source)?;
        self.check_key(&spec.name)?;

        let destinations = spec
            .destinations
            .iter()
            .map(|d| Value::from(d.as_str()))
            .collect();

        let mut profile = Mapping::new();
        profile.insert(FIELD_SOURCE.into(), Value::from(spec.source.as_str()));
        profile.insert(FIELD_DESTINATION.into(), Value::Sequence(destinations));
        profile.insert(FIELD_PROTOCOL.into(), Value::from(spec.protocol.as_str()));
        profile.insert(FIELD_LOG_LEVEL.into(), Value::from(spec.log_level.as_str()));
        profile.insert(FIELD_LOG_ENABLED.into(), Value::from(spec.logging_enabled));
        profile.insert(
            FIELD_RULES_BACKEND.into(),
            Value::from(spec.rules_backend.as_str()),
        );

        self.store.upsert(&spec.name, Value::Mapping(profile))?;
        debug!(profile = %spec.name, "Profile attributes stored");
        Ok(())
    }

    fn string_field(&self, name: &str, field: &'static str) -> Result<Option<String>> {
        match self.store.get_path(&key(name, field)) {
            Ok(Value::String(s)) => Ok(Some(s)),
            Ok(Value::Number(n)) => Ok(Some(n.to_string())),
            Ok(Value::Null) | Err(LbError::KeyNotFound(_)) => Ok(None),
            Ok(other) => Err(LbError::Store(format!(
                "{} of profile [{}] has unexpected value {:?}",
                field, name, other
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn source(&self, name: &str) -> Result<String> {
        self.string_field(name, FIELD_SOURCE)?
            .ok_or_else(|| LbError::MissingField {
                profile: name.to_string(),
                field: FIELD_SOURCE,
            })
    }

    pub fn destinations(&self, name: &str) -> Result<Vec<String>> {
        let value = match self.store.get_path(&key(name, FIELD_DESTINATION)) {
            Ok(value) => value,
            Err(LbError::KeyNotFound(_)) => {
                return Err(LbError::MissingField {
                    profile: name.to_string(),
                    field: FIELD_DESTINATION,
                });
            }
            Err(e) => return Err(e),
        };

        match value {
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(LbError::Store(format!(
                        "destination of profile [{}] has unexpected entry {:?}",
                        name, other
                    ))),
                })
                .collect(),
            // a single destination written as a scalar
            Value::String(s) => Ok(vec![s]),
            other => Err(LbError::Store(format!(
                "destination of profile [{}] has unexpected value {:?}",
                name, other
            ))),
        }
    }

    pub fn protocol(&self, name: &str) -> Result<String> {
        Ok(self
            .string_field(name, FIELD_PROTOCOL)?
            .unwrap_or_else(|| lb_core::DEFAULT_PROTOCOL.to_string()))
    }

    pub fn log_level(&self, name: &str) -> Result<String> {
        Ok(self
            .string_field(name, FIELD_LOG_LEVEL)?
            .unwrap_or_else(|| lb_core::DEFAULT_LOG_LEVEL.to_string()))
    }

    pub fn logging_enabled(&self, name: &str) -> Result<bool> {
        match self.store.get_path(&key(name, FIELD_LOG_ENABLED)) {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(Value::String(s)) => s
                .parse::<bool>()
                .map_err(|_| LbError::Store(format!("logEnabled of profile [{}] is {}", name, s))),
            Ok(Value::Null) | Err(LbError::KeyNotFound(_)) => Ok(false),
            Ok(other) => Err(LbError::Store(format!(
                "logEnabled of profile [{}] has unexpected value {:?}",
                name, other
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn rules_backend(&self, name: &str) -> Result<RulesBackend> {
        match self.string_field(name, FIELD_RULES_BACKEND)? {
            Some(value) => value.parse(),
            None => Ok(RulesBackend::default()),
        }
    }

    /// Rebuild the full spec of `name` from the store
    pub fn load(&self, name: &str) -> Result<ProfileSpec> {
        if !self.exists(name) {
            return Err(LbError::ProfileNotFound(name.to_string()));
        }

        Ok(ProfileSpec {
            name: name.to_string(),
            source: self.source(name)?,
            destinations: self.destinations(name)?,
            protocol: self.protocol(name)?,
            log_level: self.log_level(name)?,
            logging_enabled: self.logging_enabled(name)?,
            rules_backend: self.rules_backend(name)?,
        })
    }

    /// Stored spec of `name`, or `None` when the profile is not stored
    pub fn find(&self, name: &str) -> Result<Option<ProfileSpec>> {
        match self.load(name) {
            Ok(spec) => Ok(Some(spec)),
            Err(LbError::ProfileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        match self.store.delete(name) {
            Ok(()) => {
                debug!(profile = %name, "Profile attributes removed");
                Ok(())
            }
            Err(LbError::KeyNotFound(_)) => Err(LbError::ProfileNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Every stored profile, sorted by name
    pub fn list(&self) -> Result<Vec<ProfileSpec>> {
        let mut names = self.names()?;
        names.sort();
        names.iter().map(|name| self.load(name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::YamlStore;
    use lb_core::ErrorKind;

    fn web() -> ProfileSpec {
        ProfileSpec::new(
            "web",
            "10.0.0.5:8080",
            vec!["10.0.0.6:9090".into(), "10.0.0.7:9090".into()],
        )
    }

    /// Counts upserts and refuses them once `budget` is spent
    struct BudgetStore {
        inner: YamlStore,
        upserts: usize,
        budget: usize,
    }

    impl BudgetStore {
        fn new(budget: usize) -> Self {
            Self {
                inner: YamlStore::in_memory(),
                upserts: 0,
                budget,
            }
        }
    }

    impl KeyValueStore for BudgetStore {
        fn get_path(&self, key: &str) -> Result<Value> {
            self.inner.get_path(key)
        }

        fn upsert(&mut self, key: &str, value: Value) -> Result<()> {
            if self.upserts >= self.budget {
                return Err(LbError::Store("No space left on device".into()));
            }
            self.upserts += 1;
            self.inner.upsert(key, value)
        }

        fn delete(&mut self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn find_keys(&self, suffix: &str) -> Result<Vec<String>> {
            self.inner.find_keys(suffix)
        }

        fn top_level_keys(&self) -> Result<Vec<String>> {
            self.inner.top_level_keys()
        }
    }

    #[test]
    fn write_is_one_store_update() {
        let mut profiles = ProfileStore::new(BudgetStore::new(usize::MAX));
        profiles.write(&web()).unwrap();
        assert_eq!(profiles.inner().upserts, 1);
        assert_eq!(profiles.load("web").unwrap(), web());
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let mut profiles = ProfileStore::new(BudgetStore::new(0));
        match profiles.write(&web()) {
            Err(LbError::Store(msg)) => assert!(msg.contains("No space left")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!profiles.exists("web"));
        assert!(profiles.find("web").unwrap().is_none());
    }

    #[test]
    fn write_then_load() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        let spec = web().with_backend(RulesBackend::Proxy).with_logging("4");
        profiles.write(&spec).unwrap();

        assert!(profiles.exists("web"));
        assert_eq!(profiles.load("web").unwrap(), spec);
        assert_eq!(profiles.names().unwrap(), vec!["web"]);
    }

    #[test]
    fn persisted_layout_uses_camel_case_fields() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        profiles.write(&web()).unwrap();

        let yaml = profiles.inner().to_yaml().unwrap();
        assert!(yaml.contains("source:") && yaml.contains("10.0.0.5:8080"));
        assert!(yaml.contains("destination:"));
        assert!(yaml.contains("logLevel: '6'") || yaml.contains("logLevel: \"6\""));
        assert!(yaml.contains("logEnabled: false"));
        assert!(yaml.contains("rulesBackend: client"));
    }

    #[test]
    fn source_conflicts_with_other_profiles() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        profiles.write(&web()).unwrap();

        let mut api = web();
        api.name = "api".into();
        match profiles.write(&api) {
            Err(LbError::SourceAlreadyExists {
                source_addr,
                profile,
            }) => {
                assert_eq!(source_addr, "10.0.0.5:8080");
                assert_eq!(profile, "web");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!profiles.exists("api"));
    }

    #[test]
    fn same_name_is_already_defined() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        profiles.write(&web()).unwrap();

        let mut moved = web();
        moved.source = "10.0.0.9:8080".into();
        let err = profiles.write(&moved).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, LbError::ProfileAlreadyDefined(ref name) if name == "web"));
    }

    #[test]
    fn prefix_names_do_not_collide() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        profiles.write(&web()).unwrap();

        let mut webapp = web();
        webapp.name = "webapp".into();
        webapp.source = "10.0.0.8:8080".into();
        assert!(profiles.write(&webapp).is_ok());
    }

    #[test]
    fn loose_values_are_accepted() {
        let yaml = "web:\n  source: 10.0.0.5:8080\n  destination: 10.0.0.6:9090\n  logLevel: 4\n  logEnabled: \"true\"\n";
        let profiles = ProfileStore::new(YamlStore::from_yaml(yaml).unwrap());

        let spec = profiles.load("web").unwrap();
        assert_eq!(spec.destinations, vec!["10.0.0.6:9090"]);
        assert_eq!(spec.log_level, "4");
        assert!(spec.logging_enabled);
        assert_eq!(spec.protocol, "tcp");
        assert_eq!(spec.rules_backend, RulesBackend::Client);
    }

    #[test]
    fn missing_source_is_reported() {
        let yaml = "web:\n  destination:\n    - 10.0.0.6:9090\n";
        let profiles = ProfileStore::new(YamlStore::from_yaml(yaml).unwrap());
        match profiles.load("web") {
            Err(LbError::MissingField { field, .. }) => assert_eq!(field, "source"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn remove_and_list() {
        let mut profiles = ProfileStore::new(YamlStore::in_memory());
        let mut zeta = web();
        zeta.name = "zeta".into();
        zeta.source = "10.0.0.1:80".into();
        profiles.write(&zeta).unwrap();
        profiles.write(&web()).unwrap();

        let names: Vec<String> = profiles.list().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["web", "zeta"]);

        profiles.remove("web").unwrap();
        assert!(profiles.find("web").unwrap().is_none());
        assert_eq!(
            profiles.remove("web").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}

use lb_core::{LbError, Result};
use serde_yaml::{Mapping, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Nested key-value state addressed by dotted paths (`web.source`)
pub trait KeyValueStore {
    /// Value stored under `key`, or `LbError::KeyNotFound`
    fn get_path(&self, key: &str) -> Result<Value>;
    /// Set `key`, creating intermediate mappings as needed
    fn upsert(&mut self, key: &str, value: Value) -> Result<()>;
    /// Remove `key` and everything below it, or `LbError::KeyNotFound`
    fn delete(&mut self, key: &str) -> Result<()>;
    /// Every dotted path whose last segment equals `suffix`
    fn find_keys(&self, suffix: &str) -> Result<Vec<String>>;
    fn top_level_keys(&self) -> Result<Vec<String>>;
}

/// YAML document kept in memory and, when backed by a file, rewritten
/// atomically after every mutation.
#[derive(Debug, Default)]
pub struct YamlStore {
    path: Option<PathBuf>,
    root: Mapping,
}

impl YamlStore {
    /// Load `path`, starting from an empty document when it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let root = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| LbError::Store(format!("failed to read {}: {}", path.display(), e)))?;
            parse_document(&content)
                .map_err(|e| LbError::Store(format!("failed to parse {}: {}", path.display(), e)))?
        } else {
            debug!(path = %path.display(), "State file not found, starting empty");
            Mapping::new()
        };

        Ok(Self {
            path: Some(path),
            root,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let root = parse_document(yaml).map_err(|e| LbError::Store(e.to_string()))?;
        Ok(Self { path: None, root })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root).map_err(|e| LbError::Store(e.to_string()))
    }

    /// Write through a temp file in the same directory, then rename over the target.
    /// The temp file is created 0600, so the state never becomes world-readable.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let store_err =
            |e: &dyn std::fmt::Display| LbError::Store(format!("{}: {}", path.display(), e));

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| store_err(&e))?;

        let yaml = self.to_yaml()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| store_err(&e))?;
        tmp.write_all(yaml.as_bytes()).map_err(|e| store_err(&e))?;
        tmp.as_file().sync_all().map_err(|e| store_err(&e))?;
        tmp.persist(path).map_err(|e| store_err(&e.error))?;

        debug!(path = %path.display(), "State saved");
        Ok(())
    }
}

fn parse_document(content: &str) -> std::result::Result<Mapping, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(Mapping::new());
    }
    match serde_yaml::from_str::<Value>(content)? {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => Err(serde::de::Error::custom("state document must be a mapping")),
    }
}

fn segments(key: &str) -> Vec<&str> {
    key.split('.').filter(|s| !s.is_empty()).collect()
}

fn collect_keys(map: &Mapping, prefix: &str, suffix: &str, out: &mut Vec<String>) {
    for (k, v) in map {
        let Some(name) = k.as_str() else { continue };
        let full = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        };
        if name == suffix {
            out.push(full.clone());
        }
        if let Value::Mapping(child) = v {
            collect_keys(child, &full, suffix, out);
        }
    }
}

impl KeyValueStore for YamlStore {
    fn get_path(&self, key: &str) -> Result<Value> {
        let parts = segments(key);
        let not_found = || LbError::KeyNotFound(key.to_string());

        let (last, parents) = parts.split_last().ok_or_else(not_found)?;
        let mut current = &self.root;
        for part in parents {
            current = current
                .get(*part)
                .and_then(Value::as_mapping)
                .ok_or_else(not_found)?;
        }
        current.get(*last).cloned().ok_or_else(not_found)
    }

    fn upsert(&mut self, key: &str, value: Value) -> Result<()> {
        let parts = segments(key);
        let Some((last, parents)) = parts.split_last() else {
            return Err(LbError::Store("cannot upsert an empty key".into()));
        };

        let mut current = &mut self.root;
        for part in parents {
            let slot = current
                .entry(Value::from(*part))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if !slot.is_mapping() {
                *slot = Value::Mapping(Mapping::new());
            }
            current = slot
                .as_mapping_mut()
                .ok_or_else(|| LbError::Store(format!("cannot descend into {}", key)))?;
        }
        current.insert(Value::from(*last), value);

        self.persist()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let parts = segments(key);
        let not_found = || LbError::KeyNotFound(key.to_string());

        let (last, parents) = parts.split_last().ok_or_else(not_found)?;
        let mut current = &mut self.root;
        for part in parents {
            current = current
                .get_mut(*part)
                .and_then(Value::as_mapping_mut)
                .ok_or_else(not_found)?;
        }
        current.remove(*last).ok_or_else(not_found)?;

        self.persist()
    }

    fn find_keys(&self, suffix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        collect_keys(&self.root, "", suffix, &mut out);
        Ok(out)
    }

    fn top_level_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .root
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lb_core::ErrorKind;

    #[test]
    fn dotted_paths_nest_mappings() {
        let mut store = YamlStore::in_memory();
        store.upsert("web.source", Value::from("10.0.0.5:8080")).unwrap();
        store.upsert("web.protocol", Value::from("tcp")).unwrap();
        store.upsert("api.source", Value::from("10.0.1.5:80")).unwrap();

        assert_eq!(
            store.get_path("web.source").unwrap().as_str(),
            Some("10.0.0.5:8080")
        );
        assert!(store.get_path("web").unwrap().is_mapping());
        assert_eq!(store.top_level_keys().unwrap(), vec!["web", "api"]);

        let mut keys = store.find_keys("source").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["api.source", "web.source"]);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let mut store = YamlStore::in_memory();
        assert_eq!(
            store.get_path("web.source").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(store.delete("web").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn delete_removes_subtree() {
        let mut store = YamlStore::from_yaml("web:\n  source: 10.0.0.5:8080\nkeep: 1\n").unwrap();
        store.delete("web").unwrap();
        assert!(store.get_path("web.source").is_err());
        assert_eq!(store.top_level_keys().unwrap(), vec!["keep"]);
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.yaml");

        {
            let mut store = YamlStore::open(&path).unwrap();
            store
                .upsert(
                    "web.destination",
                    Value::Sequence(vec![Value::from("10.0.0.6:9090")]),
                )
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("10.0.0.6:9090"));

        let reopened = YamlStore::open(&path).unwrap();
        assert!(reopened.get_path("web.destination").unwrap().is_sequence());
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[test]
    fn rejects_non_mapping_documents() {
        assert!(YamlStore::from_yaml("- a\n- b\n").is_err());
        assert!(YamlStore::from_yaml("").unwrap().top_level_keys().unwrap().is_empty());
    }
}

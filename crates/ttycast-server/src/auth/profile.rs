//! Per-user key/value profile storage.
//!
//! Each user has one JSON object at `<dir>/<username>.json`. Only string
//! values are stored; the broker uses the `mutelist` key.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use ttycast_core::{CastError, CastResult};

/// Profile key holding a user's space-separated mute list.
pub const MUTELIST_KEY: &str = "mutelist";

pub trait ProfileStore: Send + Sync {
    fn get(&self, username: &str, key: &str) -> CastResult<Option<String>>;
    fn set(&self, username: &str, key: &str, value: &str) -> CastResult<()>;
}

pub struct FileProfileStore {
    dir: PathBuf,
}

impl FileProfileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, username: &str) -> CastResult<PathBuf> {
        if username.is_empty()
            || username.contains(['/', '\\'])
            || username.starts_with('.')
        {
            return Err(CastError::Other(format!("invalid profile name: {username:?}")));
        }
        Ok(self.dir.join(format!("{username}.json")))
    }

    fn load(&self, path: &Path) -> CastResult<Map<String, Value>> {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => Ok(map),
                _ => Err(CastError::Other(format!(
                    "profile {} is not a JSON object",
                    path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ProfileStore for FileProfileStore {
    fn get(&self, username: &str, key: &str) -> CastResult<Option<String>> {
        let path = self.path_for(username)?;
        let map = self.load(&path)?;
        Ok(map.get(key).and_then(|v| v.as_str()).map(str::to_string))
    }

    fn set(&self, username: &str, key: &str, value: &str) -> CastResult<()> {
        let path = self.path_for(username)?;
        let mut map = self.load(&path)?;
        map.insert(key.to_string(), Value::String(value.to_string()));

        std::fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(map))?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(username, key, "profile updated");
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryProfileStore {
    values: std::sync::Mutex<std::collections::HashMap<(String, String), String>>,
}

#[cfg(test)]
impl ProfileStore for MemoryProfileStore {
    fn get(&self, username: &str, key: &str) -> CastResult<Option<String>> {
        let values = self.values.lock().unwrap();
        Ok(values.get(&(username.to_string(), key.to_string())).cloned())
    }

    fn set(&self, username: &str, key: &str, value: &str) -> CastResult<()> {
        let mut values = self.values.lock().unwrap();
        values.insert((username.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_profile_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path().to_path_buf());
        assert_eq!(store.get("alice", MUTELIST_KEY).unwrap(), None);
    }

    #[test]
    fn set_then_get_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path().join("profiles"));
        store.set("alice", "theme", "dark").unwrap();
        store.set("alice", MUTELIST_KEY, "bob carol").unwrap();

        assert_eq!(store.get("alice", "theme").unwrap().as_deref(), Some("dark"));
        assert_eq!(
            store.get("alice", MUTELIST_KEY).unwrap().as_deref(),
            Some("bob carol")
        );
        assert_eq!(store.get("bob", MUTELIST_KEY).unwrap(), None);
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path().to_path_buf());
        assert!(store.set("../evil", MUTELIST_KEY, "x").is_err());
        assert!(store.get(".hidden", MUTELIST_KEY).is_err());
    }
}

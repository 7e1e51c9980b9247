//! File-backed credential store for desktop hosts.

use runbeat_core::{CoreError, CredentialStore};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Key under which the serialized Spotify token is stored.
pub const SPOTIFY_TOKEN_KEY: &str = "spotify_token";

/// Stores secrets as a JSON object in a single file
/// (`~/.config/runbeat/.credentials.json` by default).
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileCredentialStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the default credentials path.
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(runbeat_core::credentials_path())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, CoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(values)?)?;
        debug!("Saved credentials to {:?}", self.path);
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn delete(&self, key: &str) -> Result<(), CoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> FileCredentialStore {
        let dir = std::env::temp_dir().join(format!("runbeat-test-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileCredentialStore::new(dir.join("credentials.json"))
    }

    #[test]
    fn test_put_get_delete() {
        let store = temp_store("roundtrip");
        assert_eq!(store.get(SPOTIFY_TOKEN_KEY).unwrap(), None);

        store.put(SPOTIFY_TOKEN_KEY, "{\"a\":1}").unwrap();
        store.put("other", "x").unwrap();
        assert_eq!(
            store.get(SPOTIFY_TOKEN_KEY).unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        store.delete(SPOTIFY_TOKEN_KEY).unwrap();
        assert_eq!(store.get(SPOTIFY_TOKEN_KEY).unwrap(), None);
        assert_eq!(store.get("other").unwrap().as_deref(), Some("x"));

        let _ = fs::remove_dir_all(store.path().parent().unwrap());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let store = temp_store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not json").unwrap();
        assert!(matches!(
            store.get(SPOTIFY_TOKEN_KEY),
            Err(CoreError::CredentialEncoding(_))
        ));
        let _ = fs::remove_dir_all(store.path().parent().unwrap());
    }
}

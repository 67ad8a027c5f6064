//! Storage backends: the raw string-keyed layers a `PersistentStore` stacks.
//!
//! FileBackend layout:
//! ```text
//! {dir}/
//! ├── 7761792e73657373696f6e        # hex("wp.session"), entry JSON
//! └── 7761792e76697369746f72        # hex("wp.visitor")
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::StoreError;

/// Trait for key/value storage layers.
///
/// Values are opaque strings (serialized `StoredEntry` envelopes). Backends
/// do not interpret expiry; that happens one level up.
pub trait StorageBackend: Send + Sync {
    /// Short name for logs ("file", "memory").
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` if the key doesn't exist.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Durable, file-per-key backend.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create) a backend rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            backend: "file",
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key.as_bytes()))
    }

    fn io_err(key: &str, source: io::Error) -> StoreError {
        StoreError::Io {
            backend: "file",
            key: key.to_string(),
            source,
        }
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.entry_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        // Write to a sibling temp file first so readers never see half an entry
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", hex::encode(key.as_bytes()), Uuid::new_v4()));

        fs::write(&tmp, value).map_err(|e| Self::io_err(key, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(Self::io_err(key, e));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io_err("*", e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err("*", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = hex::decode(name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory backend, used for the session-scoped layer and the last-resort
/// fallback.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` (quota/denied simulation).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("memory"))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_set_get_remove() -> Result<(), StoreError> {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path())?;

        assert_eq!(backend.get("wp.session")?, None);
        backend.set("wp.session", "{\"a\":1}")?;
        assert_eq!(backend.get("wp.session")?.as_deref(), Some("{\"a\":1}"));

        backend.set("wp.session", "{\"a\":2}")?;
        assert_eq!(backend.get("wp.session")?.as_deref(), Some("{\"a\":2}"));

        backend.remove("wp.session")?;
        assert_eq!(backend.get("wp.session")?, None);
        // Removing again is fine
        backend.remove("wp.session")?;
        Ok(())
    }

    #[test]
    fn test_file_keys_round_trip_names() -> Result<(), StoreError> {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path())?;

        backend.set("b/with/slashes", "1")?;
        backend.set("a key with spaces", "2")?;

        assert_eq!(
            backend.keys()?,
            vec!["a key with spaces".to_string(), "b/with/slashes".to_string()]
        );
        Ok(())
    }

    #[test]
    fn test_two_backends_share_a_directory() -> Result<(), StoreError> {
        let temp = TempDir::new().unwrap();
        let first = FileBackend::new(temp.path())?;
        let second = FileBackend::new(temp.path())?;

        first.set("shared", "from-first")?;
        assert_eq!(second.get("shared")?.as_deref(), Some("from-first"));
        Ok(())
    }

    #[test]
    fn test_memory_failing_mode() {
        let backend = MemoryBackend::new();
        backend.set("k", "v").unwrap();

        backend.set_failing(true);
        assert!(matches!(backend.get("k"), Err(StoreError::Unavailable("memory"))));
        assert!(backend.set("k", "w").is_err());

        backend.set_failing(false);
        assert_eq!(backend.get("k").unwrap().as_deref(), Some("v"));
    }
}

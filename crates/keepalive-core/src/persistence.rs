use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::PersistenceError;
use crate::host::Persistence;

pub const RING_KEY: &str = "ring_v1";
pub const DEVICE_ID_KEY: &str = "device_id_v1";
pub const UPLINK_CACHE_KEY: &str = "uplink_cache_v1";

/// In-process key/value store. `set_failing` makes every call error, which
/// lets callers exercise their error paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Raw bytes stored under `key`, bypassing the failure switch.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .ok()
            .and_then(|guard| guard.get(key).cloned())
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory backend set to fail".into()));
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.check()?;
        let guard = self
            .entries
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory backend poisoned".into()))?;
        Ok(guard.get(key).cloned())
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.check()?;
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory backend poisoned".into()))?;
        guard.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory. Writes go to a temp file
/// in the same directory which then replaces the target.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
        move |source| PersistenceError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl Persistence for FilePersistence {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(key)(err)),
        }
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir).map_err(Self::io_err(key))?;
        let path = self.path_for(key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(Self::io_err(key))?;
        tmp.write_all(bytes).map_err(Self::io_err(key))?;
        tmp.as_file().sync_all().map_err(Self::io_err(key))?;
        tmp.persist(&path)
            .map_err(|err| Self::io_err(key)(err.error))?;
        debug!(
            target: "keepalive::store",
            key,
            path = %path.display(),
            bytes = bytes.len(),
            "persisted"
        );
        Ok(())
    }
}

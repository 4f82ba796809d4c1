//! Per-process environment with copy-on-spawn semantics.
//!
//! Every process owns an [`Env`]. Spawning with `copy_env` hands the child a
//! detached copy; otherwise the parent's instance is shared by reference.
//! Exactly one instance — the root environment created at boot — is
//! persistent: its mutations are mirrored into a [`PersistentStore`] under
//! the `ms_env_` namespace prefix, and it is reloaded from that store on the
//! next boot. Detached copies never persist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Namespace prefix for environment keys in the persistent store.
pub const STORE_PREFIX: &str = "ms_env_";

/// Defaults ensured-present on the persistent root environment at boot.
pub const DEFAULTS: [(&str, &str); 6] = [
    ("PATH", "/bin:/usr/bin"),
    ("USER", "user"),
    ("HOME", "/home/user"),
    ("TERM", "minisys"),
    ("PS1", "$ "),
    ("LANG", "en_US.UTF-8"),
];

/// Durable key/value surface backing the persistent root environment.
///
/// The indexed access (`len`/`key_at`) exists so the whole store can be
/// scanned for `ms_env_`-prefixed keys at boot without the store having to
/// know about namespaces.
pub trait PersistentStore: Send + Sync {
    fn len(&self) -> usize;
    fn key_at(&self, index: usize) -> Option<String>;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key/value environment owned by a single process.
pub struct Env {
    vars: Mutex<HashMap<String, String>>,
    /// Only the root instance carries a store; detached copies never do.
    store: Option<Arc<dyn PersistentStore>>,
}

impl Env {
    /// A fresh, empty, non-persistent environment.
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// The persistent root environment.
    ///
    /// Scans `store` for `ms_env_`-prefixed entries, loads them, then ensures
    /// the [`DEFAULTS`] are present (writing any that were missing back to
    /// the store).
    pub fn persistent(store: Arc<dyn PersistentStore>) -> Self {
        let mut vars = HashMap::new();
        for i in 0..store.len() {
            let Some(key) = store.key_at(i) else { continue };
            if let Some(name) = key.strip_prefix(STORE_PREFIX) {
                if let Some(value) = store.get(&key) {
                    vars.insert(name.to_string(), value);
                }
            }
        }
        let env = Self {
            vars: Mutex::new(vars),
            store: Some(store),
        };
        for (key, value) in DEFAULTS {
            if env.get(key).is_empty() {
                env.set(key, value);
            }
        }
        env
    }

    /// Value for `key`, or `""` when absent.
    pub fn get(&self, key: &str) -> String {
        self.vars
            .lock()
            .map(|vars| vars.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Set `key = value`, mirroring to the store on the persistent instance.
    pub fn set(&self, key: &str, value: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            vars.insert(key.to_string(), value.to_string());
        }
        if let Some(ref store) = self.store {
            store.set(&format!("{STORE_PREFIX}{key}"), value);
        }
    }

    /// Remove `key`, mirroring to the store on the persistent instance.
    pub fn unset(&self, key: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            vars.remove(key);
        }
        if let Some(ref store) = self.store {
            store.remove(&format!("{STORE_PREFIX}{key}"));
        }
    }

    /// Snapshot of all entries, sorted by key.
    pub fn list_all(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .vars
            .lock()
            .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }

    /// A detached, non-persistent copy. The copy and the original evolve
    /// independently from this point on.
    pub fn clone_detached(&self) -> Self {
        Self {
            vars: Mutex::new(
                self.vars
                    .lock()
                    .map(|vars| vars.clone())
                    .unwrap_or_default(),
            ),
            store: None,
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory [`PersistentStore`] for tests and ephemeral boots.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PersistentStore for MemoryStore {
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn key_at(&self, index: usize) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(index).map(|(k, _)| k.clone()))
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_string(),
                None => entries.push((key.to_string(), value.to_string())),
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(k, _)| k != key);
        }
    }
}

/// On-disk JSON serialization of a [`FileStore`].
#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    entries: Vec<(String, String)>,
}

/// Disk-backed [`PersistentStore`] — a small JSON file rewritten on every
/// mutation.
///
/// Write failures are logged and swallowed: a read-only disk degrades the
/// root environment to in-memory behavior rather than failing the kernel.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Vec<(String, String)>>,
}

impl FileStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Arc<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StoreFile>(&content) {
                Ok(file) => file.entries,
                Err(e) => {
                    warn!("Persistent store {} is corrupt, starting empty: {e}", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Arc::new(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &[(String, String)]) {
        let file = StoreFile {
            entries: entries.to_vec(),
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize persistent store: {e}");
                return;
            }
        };
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!("Failed to write persistent store {}: {e}", self.path.display());
        }
    }
}

impl PersistentStore for FileStore {
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn key_at(&self, index: usize) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(index).map(|(k, _)| k.clone()))
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.to_string(),
                None => entries.push((key.to_string(), value.to_string())),
            }
            self.flush(&entries);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(k, _)| k != key);
            self.flush(&entries);
        }
    }
}

//! Executable loading behind a pluggable trait.
//!
//! The kernel resolves a path, asks the [`Loader`] for an entry point plus
//! the set of module keys the load pinned, and registers a cleanup hook that
//! releases those keys when the process exits. Module keys are
//! reference-counted: a module loaded by two processes is held once and
//! freed when the last holder releases it.
//!
//! [`RegistryLoader`] is the in-process implementation: program factories
//! registered under VFS paths. Other implementations (plugin caches, script
//! embeddings) only need to satisfy the trait.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;

use crate::error::SysError;
use crate::kernel::Kernel;
use crate::process::Process;
use crate::vfs::Vfs;

/// Identifier for a loaded module, used for refcounted unload.
pub type ModuleKey = String;

/// A callable program entry point: `(args, sys, proc) → exit code`.
pub type EntryPoint = Box<
    dyn FnOnce(Vec<String>, Kernel, Arc<Process>) -> BoxFuture<'static, Result<i32, SysError>>
        + Send,
>;

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule").finish_non_exhaustive()
    }
}

/// A successfully loaded executable.
pub struct LoadedModule {
    pub entry: EntryPoint,
    /// Keys pinned by this load; handed back via [`Loader::release`].
    pub keys: HashSet<ModuleKey>,
}

/// Produces entry points for absolute executable paths.
pub trait Loader: Send + Sync {
    fn load<'a>(
        &'a self,
        path: &'a str,
        fs: &'a Arc<dyn Vfs>,
    ) -> BoxFuture<'a, Result<LoadedModule, SysError>>;

    /// Decrement refcounts for `keys`; a key reaching zero is unloaded.
    /// Called from process cleanup, so it must not block.
    fn release(&self, keys: &HashSet<ModuleKey>);
}

/// Reusable program function: invoked once per process that executes it.
pub type ProgramFn = Arc<
    dyn Fn(Vec<String>, Kernel, Arc<Process>) -> BoxFuture<'static, Result<i32, SysError>>
        + Send
        + Sync,
>;

struct Registration {
    program: ProgramFn,
    /// The program's own key plus any dependency keys it pins when loaded.
    keys: Vec<ModuleKey>,
}

/// In-process program registry implementing [`Loader`].
pub struct RegistryLoader {
    programs: RwLock<HashMap<String, Registration>>,
    live: Mutex<HashMap<ModuleKey, usize>>,
}

impl RegistryLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            programs: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Register `program` under `path`. The program's key set is the path
    /// itself plus `deps` (shared libraries, in spirit).
    pub fn register(&self, path: &str, deps: &[&str], program: ProgramFn) {
        let mut keys = vec![path.to_string()];
        keys.extend(deps.iter().map(|d| (*d).to_string()));
        if let Ok(mut programs) = self.programs.write() {
            programs.insert(path.to_string(), Registration { program, keys });
        }
    }

    /// Current refcount for a module key (0 when unloaded).
    pub fn live_count(&self, key: &str) -> usize {
        self.live
            .lock()
            .map(|live| live.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Loader for RegistryLoader {
    fn load<'a>(
        &'a self,
        path: &'a str,
        _fs: &'a Arc<dyn Vfs>,
    ) -> BoxFuture<'a, Result<LoadedModule, SysError>> {
        Box::pin(async move {
            let (program, keys) = {
                let programs = self
                    .programs
                    .read()
                    .map_err(|_| SysError::Io("program registry poisoned".to_string()))?;
                match programs.get(path) {
                    Some(reg) => (Arc::clone(&reg.program), reg.keys.clone()),
                    None => return Err(SysError::NoEntryPoint(path.to_string())),
                }
            };
            if let Ok(mut live) = self.live.lock() {
                for key in &keys {
                    *live.entry(key.clone()).or_insert(0) += 1;
                }
            }
            let entry: EntryPoint =
                Box::new(move |args, sys, proc| program(args, sys, proc));
            Ok(LoadedModule {
                entry,
                keys: keys.into_iter().collect(),
            })
        })
    }

    fn release(&self, keys: &HashSet<ModuleKey>) {
        if let Ok(mut live) = self.live.lock() {
            for key in keys {
                if let Some(count) = live.get_mut(key) {
                    *count -= 1;
                    if *count == 0 {
                        live.remove(key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    fn noop_program() -> ProgramFn {
        Arc::new(|_args, _sys, _proc| Box::pin(async { Ok(0) }))
    }

    #[tokio::test]
    async fn test_load_unknown_path_is_no_entry_point() {
        let loader = RegistryLoader::new();
        let fs: Arc<dyn Vfs> = MemFs::new();
        let err = loader.load("/bin/ghost", &fs).await.unwrap_err();
        assert_eq!(err, SysError::NoEntryPoint("/bin/ghost".to_string()));
    }

    #[tokio::test]
    async fn test_refcounts_shared_across_loads() {
        let loader = RegistryLoader::new();
        let fs: Arc<dyn Vfs> = MemFs::new();
        loader.register("/bin/tool", &["/lib/core"], noop_program());

        let first = loader.load("/bin/tool", &fs).await.unwrap();
        let second = loader.load("/bin/tool", &fs).await.unwrap();
        assert_eq!(loader.live_count("/bin/tool"), 2);
        assert_eq!(loader.live_count("/lib/core"), 2);

        loader.release(&first.keys);
        assert_eq!(loader.live_count("/lib/core"), 1);
        loader.release(&second.keys);
        assert_eq!(loader.live_count("/bin/tool"), 0);
        assert_eq!(loader.live_count("/lib/core"), 0);
    }
}

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! minisys library — a user-space operating-system personality.
//!
//! The crate exposes the kernel runtime and its collaborators:
//! - `kernel` — process table, sessions, spawn/exec/wait/kill, signals
//! - `process` — process records, state machine, cleanup, completion
//! - `tty` — line discipline, echo, per-group input fan-out
//! - `stream` — kind-annotated stream pairs and pipes
//! - `env` — per-process environment with one persistent root instance
//! - `loader` — pluggable executable loading with refcounted modules
//! - `archive` — tar+gzip codec for install/boot images
//! - `vfs` — the filesystem interface the core consumes
//! - `config` — configuration loading

pub mod archive;
pub mod config;
pub mod env;
pub mod error;
pub mod kernel;
pub mod loader;
pub mod process;
pub mod stream;
pub mod tty;
pub mod vfs;

// Re-export key types at crate root for convenience.
pub use archive::Archiver;
pub use config::Config;
pub use env::{Env, FileStore, MemoryStore, PersistentStore};
pub use error::SysError;
pub use kernel::{Kernel, KernelSettings, ProcessIo, ProcessInfo, SpawnOpts};
pub use loader::{Loader, ProgramFn, RegistryLoader};
pub use process::{Process, ProcessState, Resource, SIGINT, SIGKILL, SIGTSTP};
pub use stream::{StreamKind, StreamPair};
pub use tty::{TtyDriver, TtyMode};
pub use vfs::{MemFs, Vfs};

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MINISYS_LOG`, `MINISYS_STORE`,
//!    `MINISYS_INIT`
//! 2. **Config file** — path via `--config <path>`, or `minisys.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [kernel]
//! exec_extensions = ["", ".bin"]
//! max_processes = 256
//!
//! [env]
//! store_path = "/var/lib/minisys/env.json"
//!
//! [boot]
//! init = "init"
//! args = []
//! image = "system.tar.gz"   # optional — omit to boot an empty tree
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::kernel::KernelSettings;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kernel tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    /// Extensions probed, in order, during executable resolution
    /// (default `["", ".bin"]`).
    #[serde(default = "default_exec_extensions")]
    pub exec_extensions: Vec<String>,
    /// Maximum live processes (default 256).
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
}

/// Persistent environment settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    /// Host path of the durable KV file backing the root environment.
    /// Override with `MINISYS_STORE`.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

/// Boot settings for the `minisys boot` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    /// Program started as init (default `init`, resolved via PATH).
    /// Override with `MINISYS_INIT`.
    #[serde(default = "default_init")]
    pub init: String,
    /// Arguments passed to init.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional host path of a `.tar.gz` system image unpacked into the
    /// VFS before init runs.
    pub image: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_exec_extensions() -> Vec<String> {
    vec![String::new(), ".bin".to_string()]
}
fn default_max_processes() -> usize {
    256
}
fn default_store_path() -> String {
    "/var/lib/minisys/env.json".to_string()
}
fn default_init() -> String {
    "init".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            exec_extensions: default_exec_extensions(),
            max_processes: default_max_processes(),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            init: default_init(),
            args: Vec::new(),
            image: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `minisys.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("minisys.toml").exists() {
            let content =
                std::fs::read_to_string("minisys.toml").expect("Failed to read minisys.toml");
            toml::from_str(&content).expect("Failed to parse minisys.toml")
        } else {
            Config {
                kernel: KernelConfig::default(),
                env: EnvConfig::default(),
                boot: BootConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(level) = std::env::var("MINISYS_LOG") {
            config.logging.level = level;
        }
        if let Ok(store) = std::env::var("MINISYS_STORE") {
            config.env.store_path = store;
        }
        if let Ok(init) = std::env::var("MINISYS_INIT") {
            config.boot.init = init;
        }

        config
    }

    /// The kernel-facing slice of this configuration.
    pub fn kernel_settings(&self) -> KernelSettings {
        KernelSettings {
            exec_extensions: self.kernel.exec_extensions.clone(),
            max_processes: self.kernel.max_processes,
        }
    }
}

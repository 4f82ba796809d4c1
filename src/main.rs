#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # minisys
//!
//! User-space operating-system personality: a cooperative kernel with a
//! UNIX-like process model, job control, TTY line discipline, and
//! stream-based stdio, running entirely inside the host process.
//!
//! ## Subcommands
//!
//! - `minisys boot` (default) — bring up the kernel on the host terminal
//!   and run init

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use minisys::{
    config::Config,
    env::{Env, FileStore},
    kernel::{Kernel, ProcessIo, SpawnOpts},
    loader::{ProgramFn, RegistryLoader},
    stream::StreamPair,
    vfs::{MemFs, Vfs},
    Archiver,
};

/// User-space operating-system personality.
#[derive(Parser)]
#[command(name = "minisys", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up the kernel on the host terminal and run init (default).
    Boot {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Path to a `.tar.gz` system image to install before init.
        #[arg(long)]
        image: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Some(Commands::Boot { config, image }) => {
            run_boot(config.as_deref(), image.as_deref()).await
        }
        None => run_boot(None, None).await,
    };
    std::process::exit(code);
}

async fn run_boot(config_path: Option<&str>, image_override: Option<&str>) -> i32 {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("minisys booting");

    let store = FileStore::open(Path::new(&config.env.store_path));
    let root_env = Arc::new(Env::persistent(store));

    let fs = MemFs::new();
    for dir in ["/bin", "/home/user", "/tmp"] {
        if let Err(e) = fs.mkdir_all(dir).await {
            warn!("Failed to create {dir}: {e}");
        }
    }

    // Install the system image, if one was provided.
    let image = image_override
        .map(ToString::to_string)
        .or_else(|| config.boot.image.clone());
    if let Some(image) = image {
        match std::fs::read(&image) {
            Ok(bytes) => {
                let installer = Archiver::new(Arc::clone(&fs) as Arc<dyn Vfs>, "/".to_string());
                match installer.unpack(&bytes, "/").await {
                    Ok(()) => info!("Installed system image {image} ({} bytes)", bytes.len()),
                    Err(e) => warn!("Failed to install system image {image}: {e}"),
                }
            }
            Err(e) => warn!("Failed to read system image {image}: {e}"),
        }
    }

    let loader = RegistryLoader::new();
    register_builtins(&loader, &fs).await;

    let kernel = Kernel::new(
        Arc::clone(&loader) as Arc<dyn minisys::Loader>,
        Arc::clone(&fs) as Arc<dyn Vfs>,
        root_env,
        config.kernel_settings(),
    );

    // The root session runs on the host terminal.
    let stdin = StreamPair::from_reader(tokio::io::stdin());
    let stdout = StreamPair::to_writer(tokio::io::stdout());

    let result = kernel
        .exec_path(
            None,
            &config.boot.init,
            config.boot.args.clone(),
            true,
            ProcessIo {
                stdin: Some(stdin),
                stdout: Some(stdout),
                stderr: None,
            },
            SpawnOpts {
                new_session: true,
                ..Default::default()
            },
        )
        .await;

    match result {
        Ok(code) => {
            kernel.shutdown().await;
            info!("init exited with code {code}");
            code
        }
        Err(e) => {
            eprintln!("minisys: failed to start {}: {e}", config.boot.init);
            1
        }
    }
}

/// Register the built-in programs every boot image can rely on. User-space
/// proper (shell, editor, coreutils) ships in the system image; `init` here
/// is the fallback used when no image provides one.
async fn register_builtins(loader: &Arc<RegistryLoader>, fs: &Arc<MemFs>) {
    if let Err(e) = fs.write("/bin/init", Vec::new(), 0o755).await {
        warn!("Failed to seed /bin/init: {e}");
    }

    let init: ProgramFn = Arc::new(|_args, kernel, proc| {
        Box::pin(async move {
            let stdout = proc
                .stdout()
                .ok_or_else(|| minisys::SysError::Io("init has no stdout".to_string()))?;
            let writer = stdout.text_writer()?;
            writer.write_str("minisys: session ready\r\n").await?;
            writer
                .write_str(&format!(
                    "minisys: USER={} HOME={} PATH={}\r\n",
                    proc.env.get("USER"),
                    proc.env.get("HOME"),
                    proc.env.get("PATH"),
                ))
                .await?;
            for info in kernel.list_processes().await {
                writer
                    .write_str(&format!(
                        "minisys: pid {:>3}  pgid {:>3}  {:?}  {}\r\n",
                        info.pid, info.pgid, info.state, info.name
                    ))
                    .await?;
            }
            Ok(0)
        })
    });
    loader.register("/bin/init", &[], init);
}

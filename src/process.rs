//! Process records: identity, state machine, stdio handles, and cleanup.
//!
//! A [`Process`] is owned by the kernel's process table and referenced by
//! handle (pid) everywhere else. Its completion is a one-shot value on a
//! watch channel, so any number of `wait()` callers observe the exit code.
//! Exit runs the cleanup chain — async resources in registration order,
//! then sync hooks in reverse registration order — to completion before the
//! completion value resolves, and is idempotent: the first exit wins, later
//! exits and kills are silent no-ops.

use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::env::Env;
use crate::error::SysError;
use crate::stream::StreamPair;
use crate::vfs::Vfs;

pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;
pub const SIGTSTP: i32 = 20;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Constructed, task not yet started.
    Embryo,
    Running,
    /// Pushed to the background by job control. Affects I/O wait semantics
    /// and foreground arbitration only — a suspended task keeps running
    /// until its next await.
    Suspended,
    /// Exit in progress: cleanup chain running.
    Zombie,
    /// Exit complete. Terminal — no further transitions.
    Terminated,
}

/// An asynchronously-closable handle registered with a process. `close()`
/// is awaited at termination.
pub trait Resource: Send {
    fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SysError>>;
}

struct Cleanup {
    hooks: Vec<Box<dyn FnOnce() + Send>>,
    resources: Vec<Box<dyn Resource>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("session", &self.session)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A process record in the kernel table.
pub struct Process {
    pub pid: u32,
    pub pgid: u32,
    /// Pid of the session leader this process belongs to.
    pub session: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub env: Arc<Env>,
    fs: Arc<dyn Vfs>,
    cwd: StdMutex<String>,
    stdin: Option<StreamPair>,
    stdout: Option<StreamPair>,
    stderr: Option<StreamPair>,
    state: Mutex<ProcessState>,
    cleanup: StdMutex<Option<Cleanup>>,
    completion_tx: watch::Sender<Option<i32>>,
    completion_rx: watch::Receiver<Option<i32>>,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: u32,
        pgid: u32,
        session: u32,
        parent: Option<u32>,
        name: String,
        env: Arc<Env>,
        fs: Arc<dyn Vfs>,
        cwd: String,
        stdin: Option<StreamPair>,
        stdout: Option<StreamPair>,
        stderr: Option<StreamPair>,
    ) -> Arc<Self> {
        let (completion_tx, completion_rx) = watch::channel(None);
        Arc::new(Self {
            pid,
            pgid,
            session,
            parent,
            name,
            env,
            fs,
            cwd: StdMutex::new(cwd),
            stdin,
            stdout,
            stderr,
            state: Mutex::new(ProcessState::Embryo),
            cleanup: StdMutex::new(Some(Cleanup {
                hooks: Vec::new(),
                resources: Vec::new(),
            })),
            completion_tx,
            completion_rx,
        })
    }

    pub fn stdin(&self) -> Option<&StreamPair> {
        self.stdin.as_ref()
    }

    pub fn stdout(&self) -> Option<&StreamPair> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&StreamPair> {
        self.stderr.as_ref()
    }

    pub fn fs(&self) -> Arc<dyn Vfs> {
        Arc::clone(&self.fs)
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().map(|c| c.clone()).unwrap_or_else(|_| "/".to_string())
    }

    pub fn set_cwd(&self, cwd: &str) {
        if let Ok(mut slot) = self.cwd.lock() {
            *slot = cwd.to_string();
        }
    }

    pub async fn state(&self) -> ProcessState {
        *self.state.lock().await
    }

    /// Whether this process still counts toward its group being alive.
    pub async fn is_alive(&self) -> bool {
        *self.state.lock().await != ProcessState::Terminated
    }

    /// Embryo → Running, once the task is about to execute. A process
    /// already suspended (or exiting) stays where it is.
    pub(crate) async fn mark_running(&self) {
        let mut state = self.state.lock().await;
        if *state == ProcessState::Embryo {
            *state = ProcessState::Running;
        }
    }

    /// Job-control suspend. First-class: no effect once exiting.
    pub async fn suspend(&self) {
        let mut state = self.state.lock().await;
        match *state {
            ProcessState::Zombie | ProcessState::Terminated => {}
            _ => *state = ProcessState::Suspended,
        }
    }

    /// Job-control resume.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        match *state {
            ProcessState::Zombie | ProcessState::Terminated => {}
            _ => *state = ProcessState::Running,
        }
    }

    /// Register a synchronous hook, run LIFO at termination.
    pub fn add_cleanup_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        match self.cleanup.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(cleanup) => cleanup.hooks.push(hook),
                None => debug!("pid {}: cleanup hook registered after exit, dropped", self.pid),
            },
            Err(_) => {}
        }
    }

    /// Register an async resource, closed in registration order at
    /// termination.
    pub fn add_resource(&self, resource: Box<dyn Resource>) {
        match self.cleanup.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(cleanup) => cleanup.resources.push(resource),
                None => debug!("pid {}: resource registered after exit, dropped", self.pid),
            },
            Err(_) => {}
        }
    }

    /// Resolves exactly once with the exit code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.completion_rx.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(code) => code.unwrap_or(1),
            Err(_) => 1,
        };
        result
    }

    /// Claim the exit transition. Returns `false` if an exit already ran
    /// (or is running) — the caller must then do nothing.
    pub(crate) async fn begin_exit(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            ProcessState::Zombie | ProcessState::Terminated => false,
            _ => {
                *state = ProcessState::Zombie;
                true
            }
        }
    }

    /// Run the cleanup chain: resources in registration order, then hooks
    /// in reverse. Failures are logged and swallowed — a parent must never
    /// hang on a child's cleanup. Leaves the process Terminated.
    pub(crate) async fn run_cleanup(&self) {
        let taken = match self.cleanup.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(cleanup) = taken {
            for mut resource in cleanup.resources {
                if let Err(e) = resource.close().await {
                    warn!("pid {}: resource close failed: {e}", self.pid);
                }
            }
            for hook in cleanup.hooks.into_iter().rev() {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)).is_err() {
                    warn!("pid {}: cleanup hook panicked", self.pid);
                }
            }
        }
        *self.state.lock().await = ProcessState::Terminated;
    }

    /// Resolve the completion value. First caller wins.
    pub(crate) fn resolve(&self, code: i32) {
        self.completion_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(code);
                true
            } else {
                false
            }
        });
    }

    /// Terminate with `code`: idempotent guard, cleanup chain, then resolve.
    pub async fn exit(&self, code: i32) {
        if !self.begin_exit().await {
            return;
        }
        self.run_cleanup().await;
        self.resolve(code);
    }

    /// Deliver a terminating signal: abort any pending stdio I/O with
    /// [`SysError::Signal`] so blocked readers and writers unblock, then
    /// exit with `128 + signal`. No-op on a process already exiting.
    pub async fn kill(&self, signal: i32) {
        {
            let state = self.state.lock().await;
            if matches!(*state, ProcessState::Zombie | ProcessState::Terminated) {
                return;
            }
        }
        for pair in [&self.stdin, &self.stdout, &self.stderr].into_iter().flatten() {
            pair.abort(SysError::Signal(signal)).await;
        }
        self.exit(128 + signal).await;
    }
}

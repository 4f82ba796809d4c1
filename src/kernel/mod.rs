//! The kernel: process table, sessions, spawn/exec/wait/kill, and signal
//! dispatch.
//!
//! [`Kernel`] is the single authority over process and session lifecycle,
//! and doubles as the syscall facade handed to every program task. It is
//! cheaply cloneable — all clones share the same inner state — and all
//! mutations to the process table and session registry are serialized
//! behind `RwLock`s, so the cooperative model holds on a multi-threaded
//! runtime too.
//!
//! ## Ownership
//!
//! The table owns [`Process`] records; the session map owns
//! [`TtyDriver`]s; everything else refers to them by pid / session id.
//! TTYs reach back only through the signal channel, which a background
//! dispatcher drains into [`Kernel::signal_foreground`].
//!
//! ## Shared physical writer
//!
//! [`Kernel::create_session`] acquires the physical output writer exactly
//! once and starts a pump task that owns it. TTY echo and the session
//! leader's stdout/stderr get bridge sinks that forward into the pump's
//! pipe — closing or aborting a bridge never touches the shared writer, so
//! echo and program output interleave whole-chunk, never torn.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::archive::Archiver;
use crate::env::Env;
use crate::error::SysError;
use crate::loader::Loader;
use crate::process::{Process, ProcessState, SIGTSTP};
use crate::stream::{pipe, StreamPair};
use crate::tty::{SignalRequest, TtyDriver, TtyMode};
use crate::vfs::{self, FileKind, Vfs};

/// Options controlling group and session placement of a spawned process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOpts {
    /// Join this existing group.
    pub pgid: Option<u32>,
    /// Become a group leader (`pgid = pid`).
    pub new_group: bool,
    /// Become both group and session leader.
    pub new_session: bool,
}

/// Stdio handles for a spawned process. `None` slots fall back to a TTY
/// subscriber (stdin, when the session has one) or the parent's handles.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<StreamPair>,
    pub stdout: Option<StreamPair>,
    pub stderr: Option<StreamPair>,
}

/// A program body handed to [`Kernel::spawn`].
pub type TaskFn = Box<
    dyn FnOnce(Kernel, Arc<Process>) -> BoxFuture<'static, Result<i32, SysError>> + Send,
>;

type SetupFn = Box<dyn FnOnce(&Arc<Process>) + Send>;

/// Snapshot of one table entry, for observability.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub pgid: u32,
    pub session: u32,
    pub name: String,
    pub state: ProcessState,
}

/// Bridge sinks returned by [`Kernel::create_session`] for the session
/// leader's output.
pub struct SessionStreams {
    pub stdout: StreamPair,
    pub stderr: StreamPair,
}

/// Tunables fixed at kernel construction.
#[derive(Debug, Clone)]
pub struct KernelSettings {
    /// Extensions probed, in order, during executable resolution.
    pub exec_extensions: Vec<String>,
    /// Maximum live processes (default 256).
    pub max_processes: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            exec_extensions: vec![String::new(), ".bin".to_string()],
            max_processes: 256,
        }
    }
}

struct KernelInner {
    table: RwLock<HashMap<u32, Arc<Process>>>,
    sessions: RwLock<HashMap<u32, Arc<TtyDriver>>>,
    next_pid: AtomicU32,
    loader: Arc<dyn Loader>,
    fs: Arc<dyn Vfs>,
    root_env: Arc<Env>,
    settings: KernelSettings,
    signal_tx: mpsc::UnboundedSender<SignalRequest>,
}

/// The kernel handle — also the syscall facade passed to program tasks.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Construct a kernel and start its signal dispatcher. Must be called
    /// from within a tokio runtime.
    pub fn new(
        loader: Arc<dyn Loader>,
        fs: Arc<dyn Vfs>,
        root_env: Arc<Env>,
        settings: KernelSettings,
    ) -> Kernel {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalRequest>();
        let inner = Arc::new(KernelInner {
            table: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            loader,
            fs,
            root_env,
            settings,
            signal_tx,
        });

        // Control keys typed at any TTY land here and become group signals.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(req) = signal_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let kernel = Kernel { inner };
                kernel.signal_foreground(req.session, req.signal).await;
            }
        });

        Kernel { inner }
    }

    pub fn fs(&self) -> Arc<dyn Vfs> {
        Arc::clone(&self.inner.fs)
    }

    pub fn root_env(&self) -> Arc<Env> {
        Arc::clone(&self.inner.root_env)
    }

    /// Look up a live process by pid.
    pub async fn process(&self, pid: u32) -> Option<Arc<Process>> {
        self.inner.table.read().await.get(&pid).cloned()
    }

    /// Snapshot of the process table, sorted by pid.
    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        let procs: Vec<Arc<Process>> = self.inner.table.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(procs.len());
        for p in procs {
            infos.push(ProcessInfo {
                pid: p.pid,
                pgid: p.pgid,
                session: p.session,
                name: p.name.clone(),
                state: p.state().await,
            });
        }
        infos.sort_by_key(|i| i.pid);
        infos
    }

    /// Spawn a task as a new process. The returned handle is delivered
    /// before the task begins executing.
    pub async fn spawn(
        &self,
        parent: Option<u32>,
        name: &str,
        task: TaskFn,
        copy_env: bool,
        io: ProcessIo,
        opts: SpawnOpts,
    ) -> Result<Arc<Process>, SysError> {
        self.spawn_with_setup(parent, name, task, copy_env, io, opts, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_with_setup(
        &self,
        parent: Option<u32>,
        name: &str,
        task: TaskFn,
        copy_env: bool,
        mut io: ProcessIo,
        opts: SpawnOpts,
        setup: Option<SetupFn>,
    ) -> Result<Arc<Process>, SysError> {
        // Fast-fail before any session or TTY side effects happen below.
        if self.inner.table.read().await.len() >= self.inner.settings.max_processes {
            return Err(SysError::Io(format!(
                "process limit reached (max {})",
                self.inner.settings.max_processes
            )));
        }

        let parent_proc = match parent {
            Some(ppid) => Some(
                self.process(ppid)
                    .await
                    .ok_or_else(|| SysError::Io(format!("no such process: {ppid}")))?,
            ),
            None => None,
        };

        let pid = self.inner.next_pid.fetch_add(1, Ordering::Relaxed);

        // Group placement: leader > explicit group > inherited > own.
        let pgid = if opts.new_group || opts.new_session {
            pid
        } else if let Some(g) = opts.pgid {
            g
        } else if let Some(ref p) = parent_proc {
            p.pgid
        } else {
            pid
        };

        // Session membership: own > parent's SESSION_PID > parent-owned
        // session > own.
        let session_pid = if opts.new_session {
            pid
        } else if let Some(ref p) = parent_proc {
            if let Ok(s) = p.env.get("SESSION_PID").parse::<u32>() {
                s
            } else if self.inner.sessions.read().await.contains_key(&p.pid) {
                p.pid
            } else {
                pid
            }
        } else {
            pid
        };

        // A new session with physical endpoints gets a TTY; the leader's
        // output is rebound to bridge sinks over the shared writer.
        if opts.new_session {
            match (io.stdin.take(), io.stdout.take()) {
                (Some(stdin), Some(stdout)) => {
                    let streams = self.create_session(pid, stdin, stdout).await?;
                    io.stdout = Some(streams.stdout);
                    if io.stderr.is_none() {
                        io.stderr = Some(streams.stderr);
                    }
                }
                (stdin, stdout) => {
                    io.stdin = stdin;
                    io.stdout = stdout;
                }
            }
        }

        // Wire stdin through the session TTY unless one was supplied.
        if io.stdin.is_none() {
            let tty = self.inner.sessions.read().await.get(&session_pid).cloned();
            if let Some(tty) = tty {
                let mut stdin = tty.create_stream_for(pgid).await;
                let hook_tty = Arc::clone(&tty);
                stdin.set_mode_hook(Arc::new(move |mode| hook_tty.set_mode(mode)));
                io.stdin = Some(stdin);
            }
        }

        // Remaining slots are inherited from the parent.
        if let Some(ref p) = parent_proc {
            if io.stdin.is_none() {
                io.stdin = p.stdin().cloned();
            }
            if io.stdout.is_none() {
                io.stdout = p.stdout().cloned();
            }
            if io.stderr.is_none() {
                io.stderr = p.stderr().cloned();
            }
        }

        let base_env = parent_proc
            .as_ref()
            .map(|p| Arc::clone(&p.env))
            .unwrap_or_else(|| Arc::clone(&self.inner.root_env));
        let env = if copy_env {
            Arc::new(base_env.clone_detached())
        } else {
            base_env
        };
        let cwd = parent_proc
            .as_ref()
            .map(|p| p.cwd())
            .unwrap_or_else(|| "/".to_string());

        let proc = Process::new(
            pid,
            pgid,
            session_pid,
            parent_proc.as_ref().map(|p| p.pid),
            name.to_string(),
            env,
            Arc::clone(&self.inner.fs),
            cwd,
            io.stdin,
            io.stdout,
            io.stderr,
        );

        self.inner.table.write().await.insert(pid, Arc::clone(&proc));

        if session_pid > 0 {
            proc.env.set("SESSION_PID", &session_pid.to_string());
        }
        if opts.new_group && !opts.new_session {
            self.set_foreground_pgid(session_pid, pgid).await;
        }

        if let Some(setup) = setup {
            setup(&proc);
        }

        info!(
            "spawned pid {pid} ({name}) pgid {pgid} session {session_pid}"
        );

        // Defer the task one scheduling round so the caller gets the
        // handle first; contain panics so a broken program degrades to
        // exit code 1 instead of tearing the kernel down.
        let kernel = self.clone();
        let task_proc = Arc::clone(&proc);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            task_proc.mark_running().await;
            let fut = task(kernel.clone(), Arc::clone(&task_proc));
            let code = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => match e {
                    // Job-control aborts are not failures; their exit code
                    // carries the signal.
                    SysError::Interrupted | SysError::Signal(_) => {
                        debug!("pid {}: task ended by {e}", task_proc.pid);
                        e.exit_code()
                    }
                    other => {
                        kernel
                            .report_task_failure(&task_proc, &other.to_string())
                            .await;
                        1
                    }
                },
                Err(_) => {
                    kernel.report_task_failure(&task_proc, "task panicked").await;
                    1
                }
            };
            kernel.exit_process(task_proc.pid, code).await;
        });

        Ok(proc)
    }

    /// Best-effort diagnostic on the process's stderr. The kernel never
    /// writes to a process's stdout on its behalf.
    async fn report_task_failure(&self, proc: &Arc<Process>, msg: &str) {
        warn!("pid {} ({}): {msg}", proc.pid, proc.name);
        if let Some(stderr) = proc.stderr() {
            if let Ok(writer) = stderr.text_writer() {
                let _ = writer.write_str(&format!("{}: {msg}\r\n", proc.name)).await;
            }
        }
    }

    /// Resolve an executable, load it, and spawn a process running its
    /// entry point. Loader refs are released when the process exits; on a
    /// spawn failure they are released before the error surfaces.
    pub async fn start_process(
        &self,
        parent: Option<u32>,
        path: &str,
        args: Vec<String>,
        copy_env: bool,
        io: ProcessIo,
        opts: SpawnOpts,
    ) -> Result<Arc<Process>, SysError> {
        let parent_proc = match parent {
            Some(ppid) => self.process(ppid).await,
            None => None,
        };
        let cwd = parent_proc
            .as_ref()
            .map(|p| p.cwd())
            .unwrap_or_else(|| "/".to_string());
        let env = parent_proc
            .as_ref()
            .map(|p| Arc::clone(&p.env))
            .unwrap_or_else(|| Arc::clone(&self.inner.root_env));

        let resolved = self.resolve_executable(&cwd, &env, path).await?;
        let module = self.inner.loader.load(&resolved, &self.inner.fs).await?;
        let name = vfs::basename(&resolved).to_string();

        let entry = module.entry;
        let keys = module.keys;
        let release_keys = keys.clone();
        let loader = Arc::clone(&self.inner.loader);
        let task: TaskFn = Box::new(move |sys, proc| entry(args, sys, proc));

        let spawned = self
            .spawn_with_setup(
                parent,
                &name,
                task,
                copy_env,
                io,
                opts,
                Some(Box::new(move |proc: &Arc<Process>| {
                    proc.add_cleanup_hook(Box::new(move || loader.release(&release_keys)));
                })),
            )
            .await;

        if spawned.is_err() {
            self.inner.loader.release(&keys);
        }
        spawned
    }

    /// Convenience: [`Kernel::start_process`] then wait for the exit code.
    pub async fn exec_path(
        &self,
        parent: Option<u32>,
        path: &str,
        args: Vec<String>,
        copy_env: bool,
        io: ProcessIo,
        opts: SpawnOpts,
    ) -> Result<i32, SysError> {
        let proc = self
            .start_process(parent, path, args, copy_env, io, opts)
            .await?;
        Ok(proc.wait().await)
    }

    /// Resolve `candidate` to an executable path.
    ///
    /// A candidate containing `/` resolves relative to `cwd`; otherwise
    /// each `PATH` entry is tried in order. For every base, the configured
    /// extensions are probed in order and the first regular file wins.
    pub async fn resolve_executable(
        &self,
        cwd: &str,
        env: &Env,
        candidate: &str,
    ) -> Result<String, SysError> {
        if candidate.contains('/') {
            let base = vfs::normalize(cwd, candidate);
            return match self.probe(&base).await {
                Some(hit) => Ok(hit),
                None => Err(SysError::CommandNotFound(candidate.to_string())),
            };
        }
        for dir in env.get("PATH").split(':').filter(|d| !d.is_empty()) {
            let base = format!("{}/{candidate}", dir.trim_end_matches('/'));
            if let Some(hit) = self.probe(&base).await {
                return Ok(hit);
            }
        }
        Err(SysError::CommandNotFound(candidate.to_string()))
    }

    async fn probe(&self, base: &str) -> Option<String> {
        for ext in &self.inner.settings.exec_extensions {
            let candidate = format!("{base}{ext}");
            if let Ok(meta) = self.inner.fs.metadata(&candidate).await {
                if meta.kind == FileKind::File {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Create a TTY session: acquire the physical writer (exactly once per
    /// session), start its pump and the TTY input pump, and return bridge
    /// sinks for the session leader's stdout/stderr.
    pub async fn create_session(
        &self,
        session_pid: u32,
        stdin: StreamPair,
        stdout: StreamPair,
    ) -> Result<SessionStreams, SysError> {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&session_pid) {
            return Err(SysError::Io(format!("session {session_pid} already exists")));
        }

        // Claim both physical endpoints up front so a failure leaves no
        // half-started pumps behind.
        let mut reader = stdin.text_reader()?;
        let writer = stdout.byte_writer()?;

        let (shared_tx, shared_rx) = pipe::channel::<Vec<u8>>();
        tokio::spawn(async move {
            loop {
                match shared_rx.recv().await {
                    Ok(Some(chunk)) => {
                        if writer.write(&chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("session {session_pid}: writer pump stopped: {e}");
                        break;
                    }
                }
            }
        });

        let tty = Arc::new(TtyDriver::new(
            session_pid,
            shared_tx.clone(),
            self.inner.signal_tx.clone(),
        ));

        // Physical input → line discipline. The text reader interposes the
        // UTF-8 decoder, so split multi-byte sequences arrive whole.
        let tty_in = Arc::clone(&tty);
        tokio::spawn(async move {
            loop {
                match reader.read_chunk().await {
                    Ok(Some(chunk)) => tty_in.input(&chunk).await,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("session {}: input pump stopped: {e}", tty_in.session_id());
                        break;
                    }
                }
            }
            info!("session {}: physical input closed", tty_in.session_id());
        });

        sessions.insert(session_pid, tty);
        drop(sessions);
        info!("session {session_pid} created");

        Ok(SessionStreams {
            stdout: bridge_into(shared_tx.clone()),
            stderr: bridge_into(shared_tx),
        })
    }

    /// Deliver `signal` to the session's foreground group. SIGTSTP
    /// suspends the members and hands the terminal back to the session
    /// leader; any other signal kills the members.
    pub async fn signal_foreground(&self, session_pid: u32, signal: i32) {
        let tty = self.inner.sessions.read().await.get(&session_pid).cloned();
        let Some(tty) = tty else {
            debug!("signal {signal} for unknown session {session_pid}, dropped");
            return;
        };
        let fg = tty.foreground();
        let members: Vec<Arc<Process>> = self
            .inner
            .table
            .read()
            .await
            .values()
            .filter(|p| p.pgid == fg)
            .cloned()
            .collect();

        if signal == SIGTSTP {
            info!("session {session_pid}: suspending foreground group {fg}");
            for p in &members {
                p.suspend().await;
            }
            self.set_foreground_pgid(session_pid, session_pid).await;
        } else {
            info!("session {session_pid}: signal {signal} to foreground group {fg}");
            for p in members {
                p.kill(signal).await;
            }
        }
    }

    /// Switch the session's foreground group. The session leader runs iff
    /// it holds the foreground.
    pub async fn set_foreground_pgid(&self, session_pid: u32, pgid: u32) {
        let tty = self.inner.sessions.read().await.get(&session_pid).cloned();
        let Some(tty) = tty else { return };
        tty.set_foreground(pgid);
        if let Some(leader) = self.process(session_pid).await {
            if pgid == session_pid {
                leader.resume().await;
            } else {
                leader.suspend().await;
            }
        }
    }

    pub async fn get_foreground_pgid(&self, session_pid: u32) -> Option<u32> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_pid)
            .map(|tty| tty.foreground())
    }

    pub async fn set_tty_mode(&self, session_pid: u32, mode: TtyMode) {
        if let Some(tty) = self.inner.sessions.read().await.get(&session_pid) {
            tty.set_mode(mode);
        }
    }

    #[cfg(test)]
    pub(crate) async fn session_tty(&self, session_pid: u32) -> Option<Arc<TtyDriver>> {
        self.inner.sessions.read().await.get(&session_pid).cloned()
    }

    /// An [`Archiver`] bound to the calling process's filesystem view.
    pub fn create_archiver(&self, proc: &Arc<Process>) -> Archiver {
        Archiver::new(proc.fs(), proc.cwd())
    }

    /// Terminate a process and release its kernel-side registrations:
    /// cleanup chain, TTY subscriber, foreground restoration, table entry.
    /// The completion value resolves last, so a waiter that wakes observes
    /// the table without the entry.
    pub async fn exit_process(&self, pid: u32, code: i32) {
        let Some(proc) = self.process(pid).await else {
            return;
        };
        if proc.begin_exit().await {
            proc.run_cleanup().await;
        }

        let tty = self.inner.sessions.read().await.get(&proc.session).cloned();
        if let Some(tty) = tty {
            tty.remove_subscriber(proc.pgid).await;
            if tty.foreground() == proc.pgid && proc.pgid != proc.session {
                let group_alive = {
                    let table = self.inner.table.read().await;
                    let peers: Vec<Arc<Process>> = table
                        .values()
                        .filter(|p| p.pgid == proc.pgid && p.pid != pid)
                        .cloned()
                        .collect();
                    drop(table);
                    let mut alive = false;
                    for peer in peers {
                        if peer.is_alive().await {
                            alive = true;
                            break;
                        }
                    }
                    alive
                };
                if !group_alive {
                    self.set_foreground_pgid(proc.session, proc.session).await;
                }
            }
        }

        self.inner.table.write().await.remove(&pid);
        proc.resolve(code);
        info!("pid {pid} ({}) exited with code {code}", proc.name);
    }

    /// Kill every remaining process and drop all sessions. For embedder
    /// teardown; exit codes reflect SIGKILL.
    pub async fn shutdown(&self) {
        let procs: Vec<Arc<Process>> =
            self.inner.table.read().await.values().cloned().collect();
        let count = procs.len();
        for proc in procs {
            proc.kill(crate::process::SIGKILL).await;
        }
        self.inner.table.write().await.clear();
        self.inner.sessions.write().await.clear();
        info!("kernel shut down, {count} process(es) reaped");
    }
}

/// A bridge sink forwarding into the session's shared writer. Closing or
/// aborting the bridge ends the forwarder without touching the shared
/// writer.
fn bridge_into(shared_tx: pipe::Sender<Vec<u8>>) -> StreamPair {
    let (pair, rx) = StreamPair::sink_pipe_bytes();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Some(chunk)) => {
                    if shared_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
    pair
}

#[cfg(test)]
mod tests;

//! Typed errors surfaced by the kernel core.
//!
//! [`SysError`] is the single error surface crossing the syscall facade.
//! Stream aborts clone the error into every pending operation, so the type is
//! `Clone` and cheap to copy. Exit codes are the only contract with parent
//! processes; errors returned from a program task are reported to stderr
//! best-effort and collapse to exit code 1.

/// Errors produced by the kernel core and its streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysError {
    /// Executable resolution failed for the given candidate.
    CommandNotFound(String),
    /// The loader produced a module without a usable entry point.
    NoEntryPoint(String),
    /// A reader or writer is already held on this stream.
    StreamBusy,
    /// Pending I/O was aborted by Ctrl-C on the controlling TTY.
    Interrupted,
    /// Pending I/O was aborted by a signal delivered via `kill`.
    Signal(i32),
    /// An archive stream ended before a complete record was read.
    UnexpectedEof,
    /// A caller-provided fixed buffer was exhausted mid-read.
    BufferOverflow,
    /// Host-side I/O failure surfaced through the VFS or persistent store.
    Io(String),
}

impl SysError {
    /// The exit code a process terminates with when this error ends its task.
    pub fn exit_code(&self) -> i32 {
        match self {
            SysError::Signal(n) => 128 + n,
            SysError::Interrupted => 130,
            _ => 1,
        }
    }
}

impl std::fmt::Display for SysError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SysError::CommandNotFound(path) => write!(f, "command not found: {path}"),
            SysError::NoEntryPoint(path) => write!(f, "no entry point: {path}"),
            SysError::StreamBusy => write!(f, "stream already locked"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::Signal(n) => write!(f, "killed by signal {n}"),
            SysError::UnexpectedEof => write!(f, "unexpected end of archive stream"),
            SysError::BufferOverflow => write!(f, "fixed read buffer exhausted"),
            SysError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for SysError {}

impl From<std::io::Error> for SysError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SysError::UnexpectedEof
        } else {
            SysError::Io(e.to_string())
        }
    }
}

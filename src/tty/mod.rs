//! TTY driver: line discipline, echo, and per-group input fan-out.
//!
//! One [`TtyDriver`] exists per session. Physical input is fed in as text
//! chunks; in cooked mode the driver performs line editing (backspace with
//! screen-cell erasure, caret notation for control characters), translates
//! control keys into signals, and delivers completed lines to the input
//! stream of the current foreground process group. In raw mode chunks pass
//! through verbatim with no echo.
//!
//! The driver holds no kernel reference: control keys push a
//! [`SignalRequest`] onto an unbounded channel that a kernel task drains
//! into `signal_foreground`. Echo bytes go out through a cloned sender into
//! the session's shared physical writer, so echo and program output are
//! serialized by construction.
//!
//! If input arrives while the foreground group has no subscriber, the input
//! is dropped with a diagnostic — the TTY never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::SysError;
use crate::process::{SIGINT, SIGTSTP};
use crate::stream::{pipe, StreamPair};

/// Terminal input mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyMode {
    /// Line editing, echo, and control-key interpretation.
    Cooked,
    /// Verbatim delivery, no echo.
    Raw,
}

/// A signal generated at the TTY, addressed to a session's foreground group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRequest {
    pub session: u32,
    pub signal: i32,
}

struct Discipline {
    line_buffer: String,
    subscribers: HashMap<u32, pipe::Sender<String>>,
}

/// Line discipline and input fan-out for one session.
pub struct TtyDriver {
    session_id: u32,
    mode: AtomicU8,
    foreground: AtomicU32,
    inner: Mutex<Discipline>,
    echo_tx: pipe::Sender<Vec<u8>>,
    signal_tx: mpsc::UnboundedSender<SignalRequest>,
}

impl TtyDriver {
    /// Create a driver for `session_id`. `echo_tx` feeds the session's
    /// shared physical writer; `signal_tx` reaches the kernel's signal
    /// dispatcher. The initial foreground group is the session leader.
    pub fn new(
        session_id: u32,
        echo_tx: pipe::Sender<Vec<u8>>,
        signal_tx: mpsc::UnboundedSender<SignalRequest>,
    ) -> Self {
        Self {
            session_id,
            mode: AtomicU8::new(0),
            foreground: AtomicU32::new(session_id),
            inner: Mutex::new(Discipline {
                line_buffer: String::new(),
                subscribers: HashMap::new(),
            }),
            echo_tx,
            signal_tx,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn mode(&self) -> TtyMode {
        if self.mode.load(Ordering::Acquire) == 1 {
            TtyMode::Raw
        } else {
            TtyMode::Cooked
        }
    }

    pub fn set_mode(&self, mode: TtyMode) {
        let v = match mode {
            TtyMode::Cooked => 0,
            TtyMode::Raw => 1,
        };
        self.mode.store(v, Ordering::Release);
    }

    /// The pgid currently receiving input.
    pub fn foreground(&self) -> u32 {
        self.foreground.load(Ordering::Acquire)
    }

    /// Rewire the foreground group. Takes effect for the next character.
    pub fn set_foreground(&self, pgid: u32) {
        self.foreground.store(pgid, Ordering::Release);
    }

    /// Register a fresh input stream for `pgid` and return its readable
    /// end. An existing subscriber for the group is closed and replaced.
    pub async fn create_stream_for(&self, pgid: u32) -> StreamPair {
        let (tx, pair) = StreamPair::source_pipe_text();
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.subscribers.insert(pgid, tx) {
            debug!("tty {}: replacing input stream for group {pgid}", self.session_id);
            old.close().await;
        }
        pair
    }

    /// Close and remove the subscriber for `pgid`, if any.
    pub async fn remove_subscriber(&self, pgid: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subscribers.remove(&pgid) {
            sub.close().await;
        }
    }

    #[cfg(test)]
    pub async fn has_subscriber(&self, pgid: u32) -> bool {
        self.inner.lock().await.subscribers.contains_key(&pgid)
    }

    /// Process an incoming chunk of physical input.
    pub async fn input(&self, text: &str) {
        if self.mode() == TtyMode::Raw {
            let inner = self.inner.lock().await;
            deliver(&inner, self.foreground(), text.to_string()).await;
            return;
        }

        let mut inner = self.inner.lock().await;
        let mut echo = String::new();
        for ch in text.chars() {
            match ch {
                // Ctrl-C: interrupt the foreground group.
                '\u{3}' => {
                    echo.push_str("^C\r\n");
                    self.flush_echo(&mut echo).await;
                    self.raise(SIGINT);
                    let fg = self.foreground();
                    match inner.subscribers.remove(&fg) {
                        Some(sub) => sub.abort(SysError::Interrupted).await,
                        None => debug!("tty {}: ^C with no subscriber for group {fg}", self.session_id),
                    }
                    inner.line_buffer.clear();
                }
                // Ctrl-Z: suspend the foreground group. The subscriber
                // stays registered so the group can be resumed later.
                '\u{1a}' => {
                    echo.push_str("^Z\r\n");
                    self.flush_echo(&mut echo).await;
                    self.raise(SIGTSTP);
                    inner.line_buffer.clear();
                }
                // Ctrl-D: flush a partial line, or EOF on an empty one.
                '\u{4}' => {
                    if inner.line_buffer.is_empty() {
                        let fg = self.foreground();
                        match inner.subscribers.remove(&fg) {
                            Some(sub) => sub.close().await,
                            None => {
                                debug!("tty {}: ^D with no subscriber for group {fg}", self.session_id);
                            }
                        }
                    } else {
                        let line = std::mem::take(&mut inner.line_buffer);
                        self.flush_echo(&mut echo).await;
                        deliver(&inner, self.foreground(), line).await;
                    }
                }
                // Backspace / DEL: erase the last grapheme from the line
                // and its cells from the screen. Whole clusters (combining
                // marks, ZWJ sequences) go at once — popping a lone scalar
                // would leave the base character behind.
                '\u{7f}' | '\u{8}' => {
                    let erased = inner
                        .line_buffer
                        .grapheme_indices(true)
                        .next_back()
                        .map(|(idx, cluster)| (idx, erase_width(cluster)));
                    if let Some((idx, width)) = erased {
                        inner.line_buffer.truncate(idx);
                        for _ in 0..width {
                            echo.push('\u{8}');
                        }
                        for _ in 0..width {
                            echo.push(' ');
                        }
                        for _ in 0..width {
                            echo.push('\u{8}');
                        }
                    }
                }
                // Commit the line.
                '\r' | '\n' => {
                    echo.push_str("\r\n");
                    inner.line_buffer.push('\n');
                    let line = std::mem::take(&mut inner.line_buffer);
                    self.flush_echo(&mut echo).await;
                    deliver(&inner, self.foreground(), line).await;
                }
                // Other control characters: caret-notation echo, raw byte
                // into the buffer.
                c if is_caret_notated(c) => {
                    echo.push('^');
                    if let Some(shown) = char::from_u32(c as u32 + 64) {
                        echo.push(shown);
                    }
                    inner.line_buffer.push(c);
                }
                c => {
                    echo.push(c);
                    inner.line_buffer.push(c);
                }
            }
        }
        self.flush_echo(&mut echo).await;
    }

    fn raise(&self, signal: i32) {
        let _ = self.signal_tx.send(SignalRequest {
            session: self.session_id,
            signal,
        });
    }

    async fn flush_echo(&self, echo: &mut String) {
        if echo.is_empty() {
            return;
        }
        let bytes = std::mem::take(echo).into_bytes();
        if self.echo_tx.send(bytes).await.is_err() {
            debug!("tty {}: echo writer gone", self.session_id);
        }
    }
}

/// Control characters (other than tab) are echoed as `^X` and occupy two
/// screen cells.
fn is_caret_notated(c: char) -> bool {
    (c as u32) < 32 && c != '\t' && c != '\n' && c != '\r'
}

/// Screen cells a buffered grapheme occupies: 2 for caret-notated controls
/// (always single-scalar clusters), 1 for everything printable.
fn erase_width(cluster: &str) -> usize {
    if cluster.chars().next().is_some_and(is_caret_notated) {
        2
    } else {
        1
    }
}

async fn deliver(inner: &Discipline, fg: u32, payload: String) {
    match inner.subscribers.get(&fg) {
        Some(sub) => {
            if let Err(e) = sub.send(payload).await {
                debug!("input for group {fg} dropped: {e}");
            }
        }
        None => debug!("no input subscriber for foreground group {fg}, dropped"),
    }
}

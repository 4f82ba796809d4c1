//! In-memory chunk pipe with abort support.
//!
//! The transport under every [`super::StreamPair`]: an unbounded queue of
//! chunks guarded by a mutex, with a `tokio::sync::Notify` waking blocked
//! readers. Three terminal states are possible: open, closed (clean EOF —
//! readers drain the queue, then observe end-of-stream), and aborted (a
//! typed [`SysError`] that preempts buffered data and fails every pending
//! and future operation with the same reason).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::SysError;

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    aborted: Option<SysError>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Create a new pipe. Both halves are cheaply cloneable and share state.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            closed: false,
            aborted: None,
        }),
        notify: Notify::new(),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Producing half of a pipe.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Sender<T> {
    /// Enqueue a chunk and wake waiting readers.
    pub async fn send(&self, chunk: T) -> Result<(), SysError> {
        let mut state = self.shared.state.lock().await;
        if let Some(reason) = state.aborted.clone() {
            return Err(reason);
        }
        if state.closed {
            return Err(SysError::Io("pipe closed".to_string()));
        }
        state.queue.push_back(chunk);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Clean EOF: readers drain buffered chunks, then see end-of-stream.
    pub async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Fail the pipe: buffered data is discarded and every pending or
    /// future operation completes with `reason`.
    pub async fn abort(&self, reason: SysError) {
        let mut state = self.shared.state.lock().await;
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        state.queue.clear();
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

/// Consuming half of a pipe.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Receiver<T> {
    /// Next chunk, `Ok(None)` on clean EOF, `Err` when aborted.
    pub async fn recv(&self) -> Result<Option<T>, SysError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().await;
                if let Some(reason) = state.aborted.clone() {
                    return Err(reason);
                }
                if let Some(chunk) = state.queue.pop_front() {
                    return Ok(Some(chunk));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Close from the consuming side; writers see the pipe as closed.
    pub async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Same as [`Sender::abort`].
    pub async fn abort(&self, reason: SysError) {
        let mut state = self.shared.state.lock().await;
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
        state.queue.clear();
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

//! Kind-annotated stream wrappers connecting programs, the TTY, and
//! physical I/O.
//!
//! A [`StreamPair`] is one directional end of a pipe, annotated with the
//! element kind it carries ([`StreamKind::Bytes`] or [`StreamKind::Text`]).
//! Readers and writers of either kind can be acquired; when the requested
//! kind differs from the underlying kind, an encoder or decoder is
//! interposed. The UTF-8 decoder is stateful and cached on the pair, so
//! multi-byte sequences split across chunk boundaries decode correctly.
//!
//! At most one reader or writer may be held at a time — acquisition while
//! locked fails with [`SysError::StreamBusy`]. Clones of a pair share the
//! underlying pipe, the lock, and the decoder state.
//!
//! `abort(reason)` tears the stream down: pending and future I/O completes
//! with the typed reason. This is how `kill` unblocks a process stuck in a
//! read and how Ctrl-C interrupts the foreground group's stdin.

pub mod pipe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SysError;
use crate::tty::TtyMode;

/// Element kind carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Bytes,
    Text,
}

/// Read chunk size for physical endpoint pumps.
const PUMP_CHUNK: usize = 4096;

#[derive(Clone)]
enum End {
    SourceBytes(pipe::Receiver<Vec<u8>>),
    SourceText(pipe::Receiver<String>),
    SinkBytes(pipe::Sender<Vec<u8>>),
    SinkText(pipe::Sender<String>),
}

/// One directional end of a stream, annotated with its element kind.
#[derive(Clone)]
pub struct StreamPair {
    kind: StreamKind,
    end: End,
    busy: Arc<AtomicBool>,
    utf8_tail: Arc<Mutex<Vec<u8>>>,
    mode_hook: Option<Arc<dyn Fn(TtyMode) + Send + Sync>>,
}

impl StreamPair {
    fn new(kind: StreamKind, end: End) -> Self {
        Self {
            kind,
            end,
            busy: Arc::new(AtomicBool::new(false)),
            utf8_tail: Arc::new(Mutex::new(Vec::new())),
            mode_hook: None,
        }
    }

    /// A connected (writable, readable) pair over a fresh pipe.
    pub fn channel(kind: StreamKind) -> (StreamPair, StreamPair) {
        match kind {
            StreamKind::Bytes => {
                let (tx, rx) = pipe::channel();
                (
                    Self::new(kind, End::SinkBytes(tx)),
                    Self::new(kind, End::SourceBytes(rx)),
                )
            }
            StreamKind::Text => {
                let (tx, rx) = pipe::channel();
                (
                    Self::new(kind, End::SinkText(tx)),
                    Self::new(kind, End::SourceText(rx)),
                )
            }
        }
    }

    /// A readable text pair plus the sender that feeds it. Used by the TTY
    /// for per-group subscriber streams.
    pub(crate) fn source_pipe_text() -> (pipe::Sender<String>, StreamPair) {
        let (tx, rx) = pipe::channel();
        (tx, Self::new(StreamKind::Text, End::SourceText(rx)))
    }

    /// A writable byte pair plus the receiver draining it. Used by the
    /// kernel for bridge sinks into the shared physical writer.
    pub(crate) fn sink_pipe_bytes() -> (StreamPair, pipe::Receiver<Vec<u8>>) {
        let (tx, rx) = pipe::channel();
        (Self::new(StreamKind::Bytes, End::SinkBytes(tx)), rx)
    }

    /// Wrap a physical byte source. A pump task reads chunks into the pipe
    /// until EOF or read failure.
    pub fn from_reader<R>(mut reader: R) -> StreamPair
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = pipe::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let mut tmp = [0u8; PUMP_CHUNK];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(tmp[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tx.close().await;
        });
        Self::new(StreamKind::Bytes, End::SourceBytes(rx))
    }

    /// Wrap a physical byte sink. A pump task drains the pipe into the
    /// writer; the writer itself is never closed by the pump.
    pub fn to_writer<W>(mut writer: W) -> StreamPair
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = pipe::channel::<Vec<u8>>();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Some(chunk)) => {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("physical writer pump stopped: {e}");
                        break;
                    }
                }
            }
        });
        Self::new(StreamKind::Bytes, End::SinkBytes(tx))
    }

    /// The element kind this stream carries.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_source(&self) -> bool {
        matches!(self.end, End::SourceBytes(_) | End::SourceText(_))
    }

    pub fn is_sink(&self) -> bool {
        !self.is_source()
    }

    /// Attach a terminal-mode callback (wired by the kernel when this pair
    /// is a TTY subscriber stdin).
    pub fn set_mode_hook(&mut self, hook: Arc<dyn Fn(TtyMode) + Send + Sync>) {
        self.mode_hook = Some(hook);
    }

    /// Request a terminal mode change through the mode hook, if any. A
    /// no-op on streams not connected to a TTY.
    pub fn request_mode(&self, mode: TtyMode) {
        if let Some(ref hook) = self.mode_hook {
            hook(mode);
        }
    }

    /// Abort the underlying pipe: pending and future I/O on either end
    /// completes with `reason`.
    pub async fn abort(&self, reason: SysError) {
        match &self.end {
            End::SourceBytes(rx) => rx.abort(reason).await,
            End::SourceText(rx) => rx.abort(reason).await,
            End::SinkBytes(tx) => tx.abort(reason).await,
            End::SinkText(tx) => tx.abort(reason).await,
        }
    }

    /// Close the underlying pipe cleanly (EOF for readers).
    pub async fn close(&self) {
        match &self.end {
            End::SourceBytes(rx) => rx.close().await,
            End::SourceText(rx) => rx.close().await,
            End::SinkBytes(tx) => tx.close().await,
            End::SinkText(tx) => tx.close().await,
        }
    }

    fn acquire(&self) -> Result<LockGuard, SysError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            Err(SysError::StreamBusy)
        } else {
            Ok(LockGuard {
                busy: Arc::clone(&self.busy),
            })
        }
    }

    /// Acquire the byte reader. Fails with [`SysError::StreamBusy`] if a
    /// reader or writer is already held, with an I/O error on sink ends.
    pub fn byte_reader(&self) -> Result<ByteReader, SysError> {
        let src = match &self.end {
            End::SourceBytes(rx) => ByteSrc::Bytes(rx.clone()),
            End::SourceText(rx) => ByteSrc::Text(rx.clone()),
            End::SinkBytes(_) | End::SinkText(_) => {
                return Err(SysError::Io("stream is write-only".to_string()))
            }
        };
        let guard = self.acquire()?;
        Ok(ByteReader { src, _guard: guard })
    }

    /// Acquire the text reader, interposing the cached UTF-8 decoder over
    /// byte sources.
    pub fn text_reader(&self) -> Result<TextReader, SysError> {
        let src = match &self.end {
            End::SourceBytes(rx) => TextSrc::Bytes(rx.clone()),
            End::SourceText(rx) => TextSrc::Text(rx.clone()),
            End::SinkBytes(_) | End::SinkText(_) => {
                return Err(SysError::Io("stream is write-only".to_string()))
            }
        };
        let guard = self.acquire()?;
        Ok(TextReader {
            src,
            tail: Arc::clone(&self.utf8_tail),
            pending: String::new(),
            _guard: guard,
        })
    }

    /// Acquire the byte writer, interposing the cached decoder when the
    /// sink carries text.
    pub fn byte_writer(&self) -> Result<ByteWriter, SysError> {
        let dst = match &self.end {
            End::SinkBytes(tx) => ByteDst::Bytes(tx.clone()),
            End::SinkText(tx) => ByteDst::Text(tx.clone()),
            End::SourceBytes(_) | End::SourceText(_) => {
                return Err(SysError::Io("stream is read-only".to_string()))
            }
        };
        let guard = self.acquire()?;
        Ok(ByteWriter {
            dst,
            tail: Arc::clone(&self.utf8_tail),
            _guard: guard,
        })
    }

    /// Acquire the text writer (UTF-8 encoding over byte sinks is direct).
    pub fn text_writer(&self) -> Result<TextWriter, SysError> {
        let dst = match &self.end {
            End::SinkBytes(tx) => TextDst::Bytes(tx.clone()),
            End::SinkText(tx) => TextDst::Text(tx.clone()),
            End::SourceBytes(_) | End::SourceText(_) => {
                return Err(SysError::Io("stream is read-only".to_string()))
            }
        };
        let guard = self.acquire()?;
        Ok(TextWriter { dst, _guard: guard })
    }
}

/// Releases the single reader/writer slot when the handle drops.
struct LockGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Incremental UTF-8 decode: consumes `tail` + `bytes`, leaves any
/// incomplete trailing sequence back in `tail`, replaces invalid bytes.
fn decode_utf8(tail: &mut Vec<u8>, bytes: &[u8]) -> String {
    let mut data = std::mem::take(tail);
    data.extend_from_slice(bytes);
    let mut out = String::new();
    let mut rest: &[u8] = &data;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or(""));
                match e.error_len() {
                    Some(n) => {
                        out.push('\u{FFFD}');
                        rest = &after[n..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    *tail = rest.to_vec();
    out
}

enum TextSrc {
    Text(pipe::Receiver<String>),
    Bytes(pipe::Receiver<Vec<u8>>),
}

impl std::fmt::Debug for TextReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextReader").finish_non_exhaustive()
    }
}

/// Exclusive text-reading handle on a [`StreamPair`].
pub struct TextReader {
    src: TextSrc,
    tail: Arc<Mutex<Vec<u8>>>,
    pending: String,
    _guard: LockGuard,
}

impl TextReader {
    async fn next_chunk(&mut self) -> Result<Option<String>, SysError> {
        match &self.src {
            TextSrc::Text(rx) => rx.recv().await,
            TextSrc::Bytes(rx) => loop {
                match rx.recv().await? {
                    Some(bytes) => {
                        let mut tail = self.tail.lock().await;
                        let decoded = decode_utf8(&mut tail, &bytes);
                        if decoded.is_empty() {
                            continue;
                        }
                        return Ok(Some(decoded));
                    }
                    None => {
                        let mut tail = self.tail.lock().await;
                        if tail.is_empty() {
                            return Ok(None);
                        }
                        let flushed = String::from_utf8_lossy(&tail).into_owned();
                        tail.clear();
                        return Ok(Some(flushed));
                    }
                }
            },
        }
    }

    /// Next text chunk, `Ok(None)` on EOF.
    pub async fn read_chunk(&mut self) -> Result<Option<String>, SysError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        self.next_chunk().await
    }

    /// Read up to and including the next `\n`. The final unterminated line
    /// before EOF is returned as-is; after that, `Ok(None)`.
    pub async fn read_line(&mut self) -> Result<Option<String>, SysError> {
        loop {
            if let Some(pos) = self.pending.find('\n') {
                let rest = self.pending.split_off(pos + 1);
                let line = std::mem::replace(&mut self.pending, rest);
                return Ok(Some(line));
            }
            match self.next_chunk().await? {
                Some(chunk) => self.pending.push_str(&chunk),
                None => {
                    if self.pending.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::take(&mut self.pending)));
                }
            }
        }
    }
}

enum ByteSrc {
    Bytes(pipe::Receiver<Vec<u8>>),
    Text(pipe::Receiver<String>),
}

/// Exclusive byte-reading handle on a [`StreamPair`].
pub struct ByteReader {
    src: ByteSrc,
    _guard: LockGuard,
}

impl ByteReader {
    /// Next byte chunk, `Ok(None)` on EOF.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, SysError> {
        match &self.src {
            ByteSrc::Bytes(rx) => rx.recv().await,
            ByteSrc::Text(rx) => Ok(rx.recv().await?.map(String::into_bytes)),
        }
    }

    /// Attach-style read into a caller-provided fixed buffer: fills until
    /// EOF and returns the byte count, or [`SysError::BufferOverflow`] when
    /// a chunk no longer fits.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, SysError> {
        let mut filled = 0;
        while let Some(chunk) = self.read_chunk().await? {
            if chunk.len() > buf.len() - filled {
                return Err(SysError::BufferOverflow);
            }
            buf[filled..filled + chunk.len()].copy_from_slice(&chunk);
            filled += chunk.len();
        }
        Ok(filled)
    }
}

enum TextDst {
    Text(pipe::Sender<String>),
    Bytes(pipe::Sender<Vec<u8>>),
}

/// Exclusive text-writing handle on a [`StreamPair`].
pub struct TextWriter {
    dst: TextDst,
    _guard: LockGuard,
}

impl TextWriter {
    pub async fn write_str(&self, s: &str) -> Result<(), SysError> {
        match &self.dst {
            TextDst::Text(tx) => tx.send(s.to_string()).await,
            TextDst::Bytes(tx) => tx.send(s.as_bytes().to_vec()).await,
        }
    }
}

enum ByteDst {
    Bytes(pipe::Sender<Vec<u8>>),
    Text(pipe::Sender<String>),
}

/// Exclusive byte-writing handle on a [`StreamPair`].
pub struct ByteWriter {
    dst: ByteDst,
    tail: Arc<Mutex<Vec<u8>>>,
    _guard: LockGuard,
}

impl ByteWriter {
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SysError> {
        match &self.dst {
            ByteDst::Bytes(tx) => tx.send(bytes.to_vec()).await,
            ByteDst::Text(tx) => {
                let decoded = {
                    let mut tail = self.tail.lock().await;
                    decode_utf8(&mut tail, bytes)
                };
                if decoded.is_empty() {
                    return Ok(());
                }
                tx.send(decoded).await
            }
        }
    }
}

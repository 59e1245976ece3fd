//! File-backed append-only store with an asynchronous writer.
//!
//! This module provides [`AppendStore`], an unbounded append-only sequence
//! persisted to a private temp file by a single background writer task.
//! Appends are fire-and-forget: the element count advances synchronously
//! and the write is scheduled on a bounded pending-write queue. Readers
//! that need the medium to match the count call [`AppendStore::drain`]
//! first; range reads replay the medium from the requested index.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use tempfile::NamedTempFile;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// An unbounded, append-only sequence of elements persisted to a private
/// temp file.
///
/// # Write Path
///
/// `append`/`append_all` increment the element count, enqueue the values on
/// the pending-write queue, and return. A dedicated writer task encodes and
/// writes batches in offer order, so sequential replay of the medium
/// reproduces the exact append order. The count may therefore run ahead of
/// the medium; [`drain`](AppendStore::drain) waits until the medium has
/// caught up with every write scheduled so far.
///
/// # Failure Latching
///
/// If the writer task fails (I/O or encoding), the error is recorded and
/// returned by the next operation that touches the store, and by every
/// operation after that. Already-written elements are not rolled back.
///
/// # Writer Semantics
///
/// The store supports a single logical appender; `clear` and `close` belong
/// to that appender's sequence of operations. Any number of tasks may read
/// concurrently.
///
/// # Example
///
/// ```ignore
/// use spool::{AppendStore, JsonCodec};
///
/// let store = AppendStore::create("ticks", JsonCodec, 10_000)?;
/// store.append_all(vec![row_a, row_b]).await?;
/// store.drain().await?;
/// let rows = store.subrange(0, store.count()).await?;
/// ```
pub struct AppendStore<T, C> {
    id: String,
    codec: Arc<C>,
    count: AtomicU64,
    epoch: AtomicU64,
    cmd_tx: mpsc::Sender<Command<T>>,
    applied_rx: watch::Receiver<u64>,
    failure: Arc<StdMutex<Option<String>>>,
    medium_path: Arc<StdMutex<PathBuf>>,
    stop_tok: CancellationToken,
    closed: AtomicBool,
    writer: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

enum Command<T> {
    Append { values: Vec<T>, epoch: u64 },
    Reset { medium: NamedTempFile, epoch: u64 },
}

impl<T, C> AppendStore<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    /// Creates a store with a fresh private medium and spawns its writer
    /// task. Must be called within a tokio runtime.
    ///
    /// `queue_capacity` bounds the pending-write queue; appends wait for
    /// queue space once the writer falls that far behind.
    pub fn create(id: impl Into<String>, codec: C, queue_capacity: usize) -> Result<Self> {
        let id = id.into();
        let medium = new_medium(&id)?;
        let medium_path = Arc::new(StdMutex::new(medium.path().to_path_buf()));
        let codec = Arc::new(codec);
        let failure = Arc::new(StdMutex::new(None));
        let stop_tok = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::channel(queue_capacity.max(1));
        let (applied_tx, applied_rx) = watch::channel(0u64);

        let writer = WriterTask {
            id: id.clone(),
            codec: Arc::clone(&codec),
            medium,
            file: None,
            cmd_rx,
            applied_tx,
            failure: Arc::clone(&failure),
            medium_path: Arc::clone(&medium_path),
            stop_tok: stop_tok.clone(),
        };
        let handle = tokio::spawn(writer.run());

        Ok(Self {
            id,
            codec,
            count: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            cmd_tx,
            applied_rx,
            failure,
            medium_path,
            stop_tok,
            closed: AtomicBool::new(false),
            writer: StdMutex::new(Some(handle)),
        })
    }

    /// Returns the number of appended elements.
    ///
    /// The count advances synchronously on append and may be ahead of what
    /// the medium holds; call [`drain`](AppendStore::drain) before reads
    /// that must observe everything counted.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Appends a single element. Equivalent to `append_all(vec![value])`.
    pub async fn append(&self, value: T) -> Result<()> {
        self.append_all(vec![value]).await
    }

    /// Appends a batch of elements.
    ///
    /// The count is incremented before the write is scheduled; the call
    /// returns once the batch is enqueued and never waits for the file
    /// write itself. An empty batch is a no-op.
    pub async fn append_all(&self, values: Vec<T>) -> Result<()> {
        self.ensure_open()?;
        self.check_failed()?;
        if values.is_empty() {
            return Ok(());
        }
        self.count.fetch_add(values.len() as u64, Ordering::SeqCst);
        let epoch = self.next_epoch();
        self.cmd_tx
            .send(Command::Append { values, epoch })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Waits until every write scheduled before this call has reached the
    /// medium, then surfaces any latched writer failure.
    pub async fn drain(&self) -> Result<()> {
        self.ensure_open()?;
        let target = self.epoch.load(Ordering::SeqCst);
        let mut applied = self.applied_rx.clone();
        applied
            .wait_for(|epoch| *epoch >= target)
            .await
            .map_err(|_| Error::Closed)?;
        self.check_failed()
    }

    /// Returns the element at `index`, or `None` past the end.
    pub async fn get(&self, index: u64) -> Result<Option<T>> {
        Ok(self
            .subrange(index, index.saturating_add(1))
            .await?
            .into_iter()
            .next())
    }

    /// Reads `from..to` by replaying the medium.
    ///
    /// `to` is clamped to the current count; a range entirely past the end
    /// yields an empty vec. Drains pending writes first so the replay is
    /// consistent with the count observed by the caller.
    pub async fn subrange(&self, from: u64, to: u64) -> Result<Vec<T>> {
        self.ensure_open()?;
        if to < from {
            return Err(Error::InvalidRange { from, to });
        }
        let to = to.min(self.count());
        if from >= to {
            return Ok(Vec::new());
        }
        self.drain().await?;

        let path = self
            .medium_path
            .lock()
            .expect("lock poisoned")
            .clone();
        let file = File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut index = 0u64;
        let mut out = Vec::with_capacity((to - from) as usize);
        while let Some(line) = lines.next_line().await? {
            if index >= to {
                break;
            }
            if index >= from {
                out.push(self.codec.decode(line.as_bytes())?);
            }
            index += 1;
        }
        Ok(out)
    }

    /// Discards the medium and resets the count to 0, creating a fresh
    /// medium. Waits until the swap is applied so subsequent reads observe
    /// an empty store. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.check_failed()?;
        let medium = new_medium(&self.id)?;
        self.count.store(0, Ordering::SeqCst);
        let epoch = self.next_epoch();
        self.cmd_tx
            .send(Command::Reset { medium, epoch })
            .await
            .map_err(|_| Error::Closed)?;
        let mut applied = self.applied_rx.clone();
        applied
            .wait_for(|e| *e >= epoch)
            .await
            .map_err(|_| Error::Closed)?;
        self.check_failed()
    }

    /// Drains pending writes, stops the writer, and deletes the medium.
    /// Idempotent; every operation after close fails with
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Flush what was scheduled before tearing the medium down; a
        // latched failure is not a reason to skip shutdown.
        let target = self.epoch.load(Ordering::SeqCst);
        let mut applied = self.applied_rx.clone();
        let _ = applied.wait_for(|epoch| *epoch >= target).await;

        self.stop_tok.cancel();
        let handle = self.writer.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(id = %self.id, "store closed, medium discarded");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_failed(&self) -> Result<()> {
        let failure = self.failure.lock().expect("lock poisoned");
        match failure.as_ref() {
            Some(msg) => Err(Error::WriteFailed(msg.clone())),
            None => Ok(()),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Background writer: consumes the pending-write queue, encodes batches,
/// and appends them to the medium in offer order.
struct WriterTask<T, C> {
    id: String,
    codec: Arc<C>,
    medium: NamedTempFile,
    file: Option<File>,
    cmd_rx: mpsc::Receiver<Command<T>>,
    applied_tx: watch::Sender<u64>,
    failure: Arc<StdMutex<Option<String>>>,
    medium_path: Arc<StdMutex<PathBuf>>,
    stop_tok: CancellationToken,
}

impl<T, C> WriterTask<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = self.stop_tok.cancelled() => break,
            };
            self.process(cmd).await;
        }
        // Drain commands that were enqueued before shutdown.
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.process(cmd).await;
        }
        // Dropping the tempfile deletes the medium.
    }

    async fn process(&mut self, cmd: Command<T>) {
        let mut next = Some(cmd);
        while let Some(cmd) = next.take() {
            match cmd {
                Command::Append { values, epoch } => {
                    let mut buf = BytesMut::new();
                    let mut high = epoch;
                    self.encode_into(&mut buf, values);
                    // Coalesce whatever appends are already queued into one
                    // write.
                    loop {
                        match self.cmd_rx.try_recv() {
                            Ok(Command::Append { values, epoch }) => {
                                high = epoch;
                                self.encode_into(&mut buf, values);
                            }
                            Ok(other) => {
                                next = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    self.write_batch(buf, high).await;
                }
                Command::Reset { medium, epoch } => {
                    self.swap_medium(medium);
                    self.advance(epoch);
                }
            }
        }
    }

    fn encode_into(&mut self, buf: &mut BytesMut, values: Vec<T>) {
        if self.failed() {
            return;
        }
        for value in &values {
            match self.codec.encode(value) {
                Ok(record) => {
                    buf.extend_from_slice(&record);
                    buf.extend_from_slice(b"\n");
                }
                Err(e) => {
                    self.latch_failure(e.to_string());
                    return;
                }
            }
        }
    }

    async fn write_batch(&mut self, buf: BytesMut, epoch: u64) {
        if !self.failed() && !buf.is_empty() {
            if let Err(e) = self.write_out(&buf).await {
                self.latch_failure(e.to_string());
            }
        }
        // The watermark always advances so drains observe the latched
        // failure instead of hanging.
        self.advance(epoch);
    }

    async fn write_out(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .open(self.medium.path())
                .await?;
            self.file = Some(file);
        }
        let file = self.file.as_mut().expect("file opened above");
        file.write_all(buf).await?;
        file.flush().await
    }

    fn swap_medium(&mut self, medium: NamedTempFile) {
        tracing::info!(
            id = %self.id,
            path = %medium.path().display(),
            "created fresh medium"
        );
        *self.medium_path.lock().expect("lock poisoned") = medium.path().to_path_buf();
        // Dropping the old tempfile deletes it.
        self.medium = medium;
        self.file = None;
    }

    fn advance(&self, epoch: u64) {
        self.applied_tx.send_modify(|applied| {
            if epoch > *applied {
                *applied = epoch;
            }
        });
    }

    fn failed(&self) -> bool {
        self.failure.lock().expect("lock poisoned").is_some()
    }

    fn latch_failure(&self, msg: String) {
        tracing::warn!(id = %self.id, error = %msg, "background write failed");
        let mut failure = self.failure.lock().expect("lock poisoned");
        if failure.is_none() {
            *failure = Some(msg);
        }
    }
}

fn new_medium(id: &str) -> Result<NamedTempFile> {
    let medium = tempfile::Builder::new()
        .prefix("spool-")
        .suffix(&format!("-{id}"))
        .tempfile()?;
    Ok(medium)
}

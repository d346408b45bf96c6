//! Append-only JSON-lines audit log.
//!
//! Submissions are queued on a bounded channel and written by a dedicated
//! thread, so a slow disk never stalls a session. A full queue is refused
//! immediately, counted, and the refused record is logged at `warn` with its
//! token and resource id so the gap in the file can be reconstructed.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::future::FutureExt;
use tokio::sync::oneshot;

use crate::config::AuditConfig;
use crate::error::{ExecutionError, RelayError};

use super::traits::{AuditAck, AuditError, AuditRecord, AuditSink};

struct Job {
    record: AuditRecord,
    ack: oneshot::Sender<Result<(), AuditError>>,
}

/// Audit sink writing one JSON object per line.
#[derive(Debug)]
pub struct FileAuditSink {
    path: PathBuf,
    capacity: usize,
    tx: Option<Sender<Job>>,
    written: Arc<AtomicU64>,
    dropped: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("token", &self.record.token).finish_non_exhaustive()
    }
}

impl FileAuditSink {
    /// Open (appending) the log at `path` and start the writer thread.
    ///
    /// # Errors
    /// Fails if the file cannot be opened or the thread cannot be spawned.
    pub fn open(path: impl AsRef<Path>, cfg: &AuditConfig) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RelayError::Execution(ExecutionError::Storage {
                message: format!("failed to open audit log {}: {e}", path.display()),
            }))?;

        let capacity = cfg.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(capacity);
        let written = Arc::new(AtomicU64::new(0));

        let thread_written = Arc::clone(&written);
        let sync_on_write = cfg.sync_on_write;
        let join = thread::Builder::new()
            .name("tokenrelay-audit".to_string())
            .spawn(move || writer_loop(file, sync_on_write, &thread_written, &rx))
            .map_err(|e| RelayError::internal(format!("failed to spawn audit writer: {e}")))?;

        tracing::info!(path = %path.display(), capacity, "audit log opened");
        Ok(Self {
            path,
            capacity,
            tx: Some(tx),
            written,
            dropped: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records durably written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Records refused because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn refuse(&self, record: &AuditRecord, reason: AuditError) -> AuditAck {
        if matches!(reason, AuditError::QueueFull { .. }) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        tracing::warn!(
            token = %record.token,
            resource_id = %record.resource.resource_id,
            path = %self.path.display(),
            error = %reason,
            "audit record dropped"
        );
        futures::future::ready(Err(reason)).boxed()
    }
}

impl AuditSink for FileAuditSink {
    fn submit(&self, record: AuditRecord) -> AuditAck {
        let Some(tx) = &self.tx else {
            return self.refuse(&record, AuditError::Closed);
        };

        let (ack, done) = oneshot::channel();
        match tx.try_send(Job { record, ack }) {
            Ok(()) => async move { done.await.unwrap_or(Err(AuditError::Closed)) }.boxed(),
            Err(TrySendError::Full(job)) => self.refuse(
                &job.record,
                AuditError::QueueFull {
                    capacity: self.capacity,
                },
            ),
            Err(TrySendError::Disconnected(job)) => self.refuse(&job.record, AuditError::Closed),
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        // Close the queue so the writer drains what is left and exits, then join.
        drop(self.tx.take());
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                if handle.join().is_err() {
                    tracing::error!(path = %self.path.display(), "audit writer panicked");
                }
            }
        }
    }
}

fn writer_loop(file: File, sync_on_write: bool, written: &AtomicU64, rx: &Receiver<Job>) {
    let mut out = BufWriter::new(file);
    for Job { record, ack } in rx {
        let outcome = write_line(&mut out, &record, sync_on_write);
        match &outcome {
            Ok(()) => {
                written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(token = %record.token, error = %e, "audit write failed"),
        }
        // The submitter may have stopped listening; the record is written either way.
        let _ = ack.send(outcome);
    }
}

fn write_line(out: &mut BufWriter<File>, record: &AuditRecord, sync_on_write: bool) -> Result<(), AuditError> {
    let write_err = |e: std::io::Error| AuditError::Write { message: e.to_string() };

    serde_json::to_writer(&mut *out, record).map_err(|e| AuditError::Write { message: e.to_string() })?;
    out.write_all(b"\n").map_err(write_err)?;
    out.flush().map_err(write_err)?;
    if sync_on_write {
        out.get_ref().sync_data().map_err(write_err)?;
    }
    Ok(())
}

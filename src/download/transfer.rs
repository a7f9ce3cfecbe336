// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A single managed download and its streaming worker.
//!
//! # State machine
//!
//! ```text
//! Ready ─start─▶ Started ─▶ Downloading ─▶ Finished
//!                              │  ▲   │
//!                        pause │  │   └──▶ Failed
//!                              ▼  │resume
//!                             Paused
//!
//! Downloading ─transient error─▶ Reconnecting ─▶ Downloading | Failed
//! any active status ─stop─▶ Stopped
//! ```
//!
//! The status lives in a `watch` channel. Every transition is a
//! compare-and-set under the channel's lock, so a `pause()` racing with the
//! worker's `Finished` can never resurrect a finished transfer, and the
//! worker can never overwrite a `Stopped` request. The worker also waits on
//! the same channel while paused and selects on it while reading the
//! network, which is how `stop()` cancels it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::error::{DownloadError, Result, TransferError, TransportError};
use super::sink::{OpenMode, Sink, SinkWriter};
use super::transport::{ByteStream, Transport};
use super::types::{EventKind, TransferEvent, TransferId, TransferSnapshot, TransferStatus};
use crate::sync::{resilient_read, resilient_write};

/// Default number of reconnect attempts after a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fixed wait between reconnect attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Directory used when no destination is given.
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

const FALLBACK_FILE_NAME: &str = "download";

/// Per-transfer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Directory used when the caller gives no destination path
    pub download_dir: PathBuf,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Receives lifecycle events from transfers.
///
/// The registry implements this to keep its aggregate running flag current.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

/// Handle to one download.
///
/// Cloning is cheap; all clones control the same transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ended: Option<Instant>,
}

struct Inner {
    id: TransferId,
    source: String,
    destination_dir: PathBuf,
    file_name: String,
    max_retries: u32,
    retry_backoff: Duration,
    status: watch::Sender<TransferStatus>,
    /// True from a successful `start()` until the worker task returns
    worker_active: watch::Sender<bool>,
    attempts: AtomicU32,
    bytes_total: AtomicU64,
    bytes_downloaded: AtomicU64,
    timing: RwLock<Timing>,
    last_error: RwLock<Option<String>>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    observer: Option<Weak<dyn TransferObserver>>,
}

/// How a single streaming attempt ended without an error.
enum StreamEnd {
    Exhausted,
    Stopped,
}

impl Transfer {
    /// Create a standalone transfer in the `Ready` state.
    ///
    /// `destination` is a full file path. Without it the file goes to
    /// `options.download_dir` under the last path segment of `source`.
    pub fn new(
        id: TransferId,
        source: impl Into<String>,
        destination: Option<&Path>,
        options: &TransferOptions,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self::with_observer(id, source, destination, options, transport, sink, None)
    }

    pub(crate) fn with_observer(
        id: TransferId,
        source: impl Into<String>,
        destination: Option<&Path>,
        options: &TransferOptions,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
        observer: Option<Weak<dyn TransferObserver>>,
    ) -> Self {
        let source = source.into();
        let (destination_dir, file_name) =
            resolve_destination(&source, destination, &options.download_dir);
        let (status, _) = watch::channel(TransferStatus::Ready);
        let (worker_active, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                id,
                source,
                destination_dir,
                file_name,
                max_retries: options.max_retries,
                retry_backoff: options.retry_backoff,
                status,
                worker_active,
                attempts: AtomicU32::new(0),
                bytes_total: AtomicU64::new(0),
                bytes_downloaded: AtomicU64::new(0),
                timing: RwLock::new(Timing::default()),
                last_error: RwLock::new(None),
                transport,
                sink,
                observer,
            }),
        }
    }

    /// Launch the streaming worker on the current Tokio runtime.
    ///
    /// Returns as soon as the worker is spawned. Restarting a transfer that
    /// already finished, failed or was stopped begins a fresh attempt, which
    /// fails with a "file exists" error if the previous run left a file.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.try_transition(|current| match current {
            TransferStatus::Started | TransferStatus::Downloading => {
                Err(DownloadError::AlreadyStarted)
            }
            s if !s.is_finished() => Err(DownloadError::InProgress),
            // a stopped worker may still be unwinding
            _ if *inner.worker_active.borrow() => Err(DownloadError::InProgress),
            _ => {
                inner.worker_active.send_replace(true);
                Ok(TransferStatus::Started)
            }
        })?;

        inner.attempts.store(0, Ordering::SeqCst);
        inner.bytes_total.store(0, Ordering::SeqCst);
        inner.bytes_downloaded.store(0, Ordering::SeqCst);
        *resilient_write(&inner.last_error) = None;
        *resilient_write(&inner.timing) = Timing {
            started: Some(Instant::now()),
            started_at: Some(Utc::now()),
            ended: None,
        };

        inner.emit(EventKind::Started);

        let worker = Arc::clone(inner);
        tokio::spawn(async move {
            worker.run().await;
        });

        Ok(())
    }

    /// Ask the worker to stop. The partial file is left in place.
    pub fn stop(&self) -> Result<()> {
        self.inner.try_transition(|current| match current {
            TransferStatus::Stopped => Err(DownloadError::AlreadyStopped),
            s if s.is_finished() => Err(DownloadError::AlreadyFinished),
            _ => Ok(TransferStatus::Stopped),
        })?;
        self.inner.mark_ended();
        self.inner.emit(EventKind::Stopped);
        Ok(())
    }

    /// Suspend writing until [`resume`](Self::resume) is called.
    pub fn pause(&self) -> Result<()> {
        self.inner.try_transition(|current| match current {
            s if s.is_finished() => Err(DownloadError::AlreadyFinished),
            TransferStatus::Paused => Err(DownloadError::AlreadyPaused),
            _ => Ok(TransferStatus::Paused),
        })?;
        self.inner.emit(EventKind::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.inner.try_transition(|current| match current {
            s if s.is_finished() => Err(DownloadError::AlreadyFinished),
            TransferStatus::Paused => Ok(TransferStatus::Downloading),
            _ => Err(DownloadError::NotPaused),
        })?;
        self.inner.emit(EventKind::Resumed);
        Ok(())
    }

    /// Wait until the transfer is finished, failed or stopped and its worker
    /// has exited.
    pub async fn wait(&self) -> TransferStatus {
        let mut status_rx = self.inner.status.subscribe();
        let _ = status_rx.wait_for(|s| s.is_finished()).await.map(|_| ());

        let mut worker_rx = self.inner.worker_active.subscribe();
        let _ = worker_rx.wait_for(|active| !*active).await.map(|_| ());

        self.status()
    }

    pub fn id(&self) -> TransferId {
        self.inner.id
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.status()
    }

    pub fn destination_dir(&self) -> &Path {
        &self.inner.destination_dir
    }

    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Full path of the output file.
    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }

    /// Size declared by the response; 0 until the first headers arrive.
    pub fn bytes_total(&self) -> u64 {
        self.inner.bytes_total.load(Ordering::SeqCst)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.bytes_downloaded.load(Ordering::SeqCst)
    }

    /// Percentage done, rounded to one decimal. `0.0` while the total is
    /// unknown.
    pub fn progress(&self) -> f64 {
        let total = self.bytes_total();
        if total == 0 {
            return 0.0;
        }
        let percent = self.bytes_downloaded() as f64 / total as f64 * 100.0;
        (percent * 10.0).round() / 10.0
    }

    /// Time since `start()`, frozen once the transfer ends.
    pub fn elapsed(&self) -> Duration {
        let timing = resilient_read(&self.inner.timing);
        match (timing.started, timing.ended) {
            (Some(started), Some(ended)) => ended.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Average speed in bytes per second. Elapsed time counts as at least
    /// one second.
    pub fn speed(&self) -> f64 {
        let seconds = self.elapsed().as_secs_f64().max(1.0);
        self.bytes_downloaded() as f64 / seconds
    }

    /// Estimated time left at the current average speed.
    pub fn eta(&self) -> Duration {
        let speed = self.speed();
        if speed <= 0.0 {
            return Duration::ZERO;
        }
        let remaining = self.bytes_total().saturating_sub(self.bytes_downloaded());
        Duration::try_from_secs_f64(remaining as f64 / speed).unwrap_or(Duration::MAX)
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Reconnect attempts since the last successful resume.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        resilient_read(&self.inner.timing).started_at
    }

    /// Message of the most recent transport or sink error.
    pub fn last_error(&self) -> Option<String> {
        resilient_read(&self.inner.last_error).clone()
    }

    /// True when idle or terminal: `Ready`, `Finished`, `Failed` or `Stopped`.
    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Whether the transfer completed. Errors while it is still running.
    pub fn is_success(&self) -> Result<bool> {
        let status = self.status();
        if !status.is_finished() {
            return Err(DownloadError::InProgress);
        }
        Ok(status == TransferStatus::Finished)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id(),
            source: self.inner.source.clone(),
            path: self.path(),
            status: self.status(),
            bytes_total: self.bytes_total(),
            bytes_downloaded: self.bytes_downloaded(),
            progress: self.progress(),
            speed_bps: self.speed() as u64,
            eta_seconds: self.eta().as_secs(),
            attempts: self.attempts(),
            max_retries: self.max_retries(),
            started_at: self.started_at(),
            last_error: self.last_error(),
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("path", &self.inner.path())
            .field("status", &self.status())
            .finish()
    }
}

/// Marks the worker as exited, including when it unwinds.
struct WorkerGuard<'a>(&'a watch::Sender<bool>);

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Inner {
    fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    fn path(&self) -> PathBuf {
        self.destination_dir.join(&self.file_name)
    }

    /// Controller-side transition. `decide` sees the current status under
    /// the channel lock and either names the next status or rejects.
    fn try_transition<F>(&self, decide: F) -> Result<TransferStatus>
    where
        F: FnOnce(TransferStatus) -> Result<TransferStatus>,
    {
        let mut outcome = Err(DownloadError::InProgress);
        self.status.send_if_modified(|current| {
            let previous = *current;
            outcome = decide(previous).map(|next| {
                *current = next;
                previous
            });
            outcome.is_ok() && previous != *current
        });
        outcome
    }

    /// Worker-side transition: move to `next` only if `allowed` accepts the
    /// current status.
    fn transition_if<F>(&self, allowed: F, next: TransferStatus) -> bool
    where
        F: FnOnce(TransferStatus) -> bool,
    {
        let mut moved = false;
        self.status.send_if_modified(|current| {
            if !allowed(*current) {
                return false;
            }
            moved = true;
            let changed = *current != next;
            *current = next;
            changed
        });
        moved
    }

    fn mark_ended(&self) {
        resilient_write(&self.timing).ended = Some(Instant::now());
    }

    fn record_error(&self, error: &TransferError) {
        *resilient_write(&self.last_error) = Some(error.to_string());
    }

    fn emit(&self, kind: EventKind) {
        let id = self.id;
        let file = self.file_name.as_str();
        match &kind {
            EventKind::Started => tracing::info!(%id, file, "download started"),
            EventKind::Paused => tracing::info!(%id, file, "download paused"),
            EventKind::Resumed => tracing::info!(%id, file, "download resumed"),
            EventKind::Stopped => tracing::info!(%id, file, "download stopped"),
            EventKind::Reconnecting { attempt, reason } => tracing::warn!(
                %id,
                file,
                attempt,
                max_retries = self.max_retries,
                %reason,
                "connection failed, retrying"
            ),
            EventKind::Finished => tracing::info!(
                %id,
                file,
                bytes = self.bytes_downloaded.load(Ordering::SeqCst),
                "download finished"
            ),
            EventKind::Failed { reason } => tracing::warn!(%id, file, %reason, "download failed"),
        }

        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.on_event(&TransferEvent {
                id,
                file_name: self.file_name.clone(),
                kind,
            });
        }
    }

    fn fail(&self, reason: String) {
        if self.transition_if(|s| !s.is_finished(), TransferStatus::Failed) {
            self.mark_ended();
            self.emit(EventKind::Failed { reason });
        }
    }

    /// Worker body: one streaming attempt per loop iteration until the
    /// transfer finishes, fails, or is stopped.
    async fn run(self: Arc<Self>) {
        let _guard = WorkerGuard(&self.worker_active);
        let mut status_rx = self.status.subscribe();
        let mut reconnecting = false;

        loop {
            if self.status().is_finished() {
                return;
            }

            let error = match self.stream(&mut status_rx, reconnecting).await {
                Ok(StreamEnd::Stopped) => return,
                Ok(StreamEnd::Exhausted) => {
                    if self.transition_if(|s| !s.is_finished(), TransferStatus::Finished) {
                        self.mark_ended();
                        self.emit(EventKind::Finished);
                    }
                    return;
                }
                Err(error) => error,
            };

            self.record_error(&error);
            if !error.is_transient() {
                self.fail(error.to_string());
                return;
            }

            if !self.transition_if(|s| !s.is_finished(), TransferStatus::Reconnecting) {
                return;
            }

            let attempts = self.attempts.load(Ordering::SeqCst);
            if attempts >= self.max_retries {
                tracing::warn!(
                    id = %self.id,
                    file = %self.file_name,
                    "reached the limit of {} attempts",
                    self.max_retries
                );
                self.fail(error.to_string());
                return;
            }

            let attempt = attempts + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.emit(EventKind::Reconnecting {
                attempt,
                reason: error.to_string(),
            });

            let stopped = tokio::select! {
                _ = tokio::time::sleep(self.retry_backoff) => false,
                _ = status_rx.wait_for(|s| *s == TransferStatus::Stopped) => true,
            };
            if stopped {
                return;
            }
            reconnecting = true;
        }
    }

    /// One attempt: prepare the destination, open the stream and pump it
    /// into the sink. The writer is closed on every exit path.
    async fn stream(
        &self,
        status_rx: &mut watch::Receiver<TransferStatus>,
        reconnecting: bool,
    ) -> std::result::Result<StreamEnd, TransferError> {
        self.sink.prepare_dir(&self.destination_dir).await?;
        let path = self.path();

        if !reconnecting && self.sink.exists(&path).await? {
            return Err(TransferError::DestinationExists(path));
        }

        let mut stream = tokio::select! {
            opened = self.transport.open(&self.source) => opened?,
            _ = status_rx.wait_for(|s| *s == TransferStatus::Stopped) => {
                return Ok(StreamEnd::Stopped);
            }
        };
        self.transition_if(|s| s == TransferStatus::Started, TransferStatus::Downloading);

        let total = stream.content_length().ok_or(TransportError::MissingLength)?;
        self.bytes_total.store(total, Ordering::SeqCst);

        let (mode, resume_from) = if reconnecting {
            (OpenMode::Append, Some(self.bytes_downloaded.load(Ordering::SeqCst)))
        } else {
            (OpenMode::CreateNew, None)
        };

        if self.status() == TransferStatus::Stopped {
            return Ok(StreamEnd::Stopped);
        }
        let mut writer = self.sink.open(&path, mode).await?;
        let outcome = self
            .pump(stream.as_mut(), writer.as_mut(), status_rx, resume_from)
            .await;
        let closed = writer.close().await;

        let end = outcome?;
        closed?;
        Ok(end)
    }

    async fn pump(
        &self,
        stream: &mut dyn ByteStream,
        writer: &mut dyn SinkWriter,
        status_rx: &mut watch::Receiver<TransferStatus>,
        mut resume_from: Option<u64>,
    ) -> std::result::Result<StreamEnd, TransferError> {
        loop {
            let next = tokio::select! {
                chunk = stream.next_chunk() => chunk,
                _ = status_rx.wait_for(|s| *s == TransferStatus::Stopped) => {
                    return Ok(StreamEnd::Stopped);
                }
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => return Ok(StreamEnd::Exhausted),
            };

            match self.status() {
                TransferStatus::Stopped => return Ok(StreamEnd::Stopped),
                TransferStatus::Paused => {
                    tracing::debug!(id = %self.id, "paused, waiting for resume");
                    let released = status_rx
                        .wait_for(|s| *s != TransferStatus::Paused)
                        .await
                        .map(|s| *s);
                    if !matches!(released, Ok(s) if !s.is_finished()) {
                        return Ok(StreamEnd::Stopped);
                    }
                }
                _ => {}
            }

            let read = stream.bytes_read();
            let mut skip = 0;
            if let Some(offset) = resume_from {
                // already on disk from the previous attempt
                if read < offset {
                    continue;
                }
                let chunk_start = read.saturating_sub(chunk.len() as u64);
                skip = offset.saturating_sub(chunk_start) as usize;
                resume_from = None;
                self.attempts.store(0, Ordering::SeqCst);
                self.transition_if(
                    |s| s == TransferStatus::Reconnecting,
                    TransferStatus::Downloading,
                );
                tracing::info!(id = %self.id, offset, "reconnected, resuming");
            }

            if skip < chunk.len() {
                writer.write_chunk(&chunk[skip..]).await?;
            }
            self.bytes_downloaded.store(read, Ordering::SeqCst);
        }
    }
}

/// Split an optional destination path into directory and file name.
fn resolve_destination(
    source: &str,
    destination: Option<&Path>,
    download_dir: &Path,
) -> (PathBuf, String) {
    if let Some(path) = destination {
        if let Some(name) = path.file_name() {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => download_dir.to_path_buf(),
            };
            return (dir, name.to_string_lossy().into_owned());
        }
    }
    (download_dir.to_path_buf(), file_name_from_source(source))
}

/// Last non-empty path segment of a URL, ignoring query and fragment.
fn file_name_from_source(source: &str) -> String {
    let name = match reqwest::Url::parse(source) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .map(str::to_owned),
        Err(_) => source
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').find(|s| !s.is_empty()))
            .map(str::to_owned),
    };
    name.unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

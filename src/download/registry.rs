// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ordered collection of transfers with an aggregate running flag.
//!
//! The registry is "running" from `start()` until every member has reached
//! the finished set. Members report terminal events back through
//! [`TransferObserver`], and the registry recomputes the flag from the
//! members' statuses each time. While running, the membership is frozen:
//! `add` and `remove(All)` are refused.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::sync::broadcast;

use super::error::{DownloadError, Result, TransportError};
use super::sink::{FileSink, Sink};
use super::transfer::{Transfer, TransferObserver, TransferOptions};
use super::transport::{HttpTransport, Transport};
use super::types::{StatusCounts, TransferEvent, TransferId, TransferSnapshot};
use crate::config::Config;
use crate::sync::{resilient_read, resilient_write};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Target of [`Registry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// One transfer; refused while that transfer is active
    One(TransferId),
    /// Every transfer, whatever its status; refused while the registry runs
    All,
}

impl From<TransferId> for Removal {
    fn from(id: TransferId) -> Self {
        Removal::One(id)
    }
}

/// Handle to a set of transfers. Cloning shares the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transfers: RwLock<IndexMap<TransferId, Transfer>>,
    running: AtomicBool,
    next_id: AtomicU64,
    options: TransferOptions,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    events: broadcast::Sender<TransferEvent>,
}

impl Registry {
    /// Registry that downloads over HTTP into the local filesystem.
    pub fn new(options: TransferOptions) -> Self {
        Self::with_backends(options, Arc::new(HttpTransport::new()), Arc::new(FileSink))
    }

    /// Registry configured from the user's config file.
    pub fn from_config(config: &Config) -> std::result::Result<Self, TransportError> {
        let transport = match &config.user_agent {
            Some(user_agent) => HttpTransport::with_user_agent(user_agent)?,
            None => HttpTransport::new(),
        };
        Ok(Self::with_backends(
            config.transfer_options(),
            Arc::new(transport),
            Arc::new(FileSink),
        ))
    }

    pub fn with_backends(
        options: TransferOptions,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                transfers: RwLock::new(IndexMap::new()),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                options,
                transport,
                sink,
                events,
            }),
        }
    }

    /// Register a new transfer in the `Ready` state.
    ///
    /// `destination` is a full file path; `max_retries` overrides the
    /// registry default for this transfer only.
    pub fn add(
        &self,
        source: impl Into<String>,
        destination: Option<PathBuf>,
        max_retries: Option<u32>,
    ) -> Result<TransferId> {
        let mut transfers = resilient_write(&self.inner.transfers);
        if self.is_running() {
            return Err(DownloadError::RegistryRunning);
        }

        let id = TransferId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let mut options = self.inner.options.clone();
        if let Some(max_retries) = max_retries {
            options.max_retries = max_retries;
        }

        let observer: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let transfer = Transfer::with_observer(
            id,
            source,
            destination.as_deref(),
            &options,
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.sink),
            Some(observer as Weak<dyn TransferObserver>),
        );

        tracing::debug!(%id, source = transfer.source(), path = %transfer.path().display(), "download added");
        transfers.insert(id, transfer);
        Ok(id)
    }

    /// Remove one transfer, or all of them.
    ///
    /// A single transfer can be removed while the registry runs as long as
    /// that transfer is finished. Clearing everything is only allowed while
    /// the registry is idle, and then ignores individual statuses.
    pub fn remove(&self, target: impl Into<Removal>) -> Result<()> {
        let mut transfers = resilient_write(&self.inner.transfers);
        match target.into() {
            Removal::All => {
                if self.is_running() {
                    return Err(DownloadError::RegistryRunning);
                }
                transfers.clear();
            }
            Removal::One(id) => {
                let transfer = transfers.get(&id).ok_or(DownloadError::UnknownId(id))?;
                if !transfer.is_finished() {
                    return Err(DownloadError::TransferInProgress(id));
                }
                transfers.shift_remove(&id);
            }
        }
        Ok(())
    }

    /// Start every member and mark the registry as running.
    ///
    /// Members that refuse to start (for example one whose previous worker is
    /// still unwinding) are logged and skipped.
    pub fn start(&self) -> Result<()> {
        {
            let transfers = resilient_write(&self.inner.transfers);
            if self.inner.running.swap(true, Ordering::SeqCst) {
                return Err(DownloadError::RegistryRunning);
            }

            for transfer in transfers.values() {
                if let Err(e) = transfer.start() {
                    tracing::warn!(id = %transfer.id(), error = %e, "skipping download that cannot start");
                }
            }
            tracing::info!(count = transfers.len(), "registry started");
        }

        // nothing may have been launched
        self.recompute_running();
        Ok(())
    }

    /// Stop every active member and clear the running flag.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(DownloadError::RegistryNotRunning);
        }

        // stopping emits events that take the read lock again
        for transfer in self.list() {
            if transfer.is_finished() {
                continue;
            }
            if let Err(e) = transfer.stop() {
                tracing::debug!(id = %transfer.id(), error = %e, "download settled before stop");
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        tracing::info!("registry stopped");
        Ok(())
    }

    /// Clear the running flag if every member is in the finished set.
    pub fn recompute_running(&self) {
        self.inner.recompute_running();
    }

    /// Members in registration order.
    pub fn list(&self) -> Vec<Transfer> {
        resilient_read(&self.inner.transfers).values().cloned().collect()
    }

    pub fn get(&self, id: TransferId) -> Option<Transfer> {
        resilient_read(&self.inner.transfers).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.inner.transfers).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.inner.transfers).is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Receive every event emitted by members from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until every member has settled and its worker has exited.
    pub async fn wait(&self) {
        let transfers = self.list();
        join_all(transfers.iter().map(Transfer::wait)).await;
    }

    /// Get counts of transfers by status.
    pub fn status_counts(&self) -> StatusCounts {
        let transfers = resilient_read(&self.inner.transfers);
        let mut counts = StatusCounts::default();
        for transfer in transfers.values() {
            counts.record(transfer.status());
        }
        counts
    }

    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.list().iter().map(Transfer::snapshot).collect()
    }
}

impl RegistryInner {
    fn recompute_running(&self) {
        let transfers = resilient_read(&self.transfers);
        if !transfers.values().all(Transfer::is_finished) {
            return;
        }
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(count = transfers.len(), "all downloads settled");
        }
    }
}

impl TransferObserver for RegistryInner {
    fn on_event(&self, event: &TransferEvent) {
        // no subscribers is fine
        let _ = self.events.send(event.clone());

        if event.kind.is_terminal() {
            self.recompute_running();
        }
    }
}

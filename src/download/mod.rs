// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Concurrent, resumable file downloads.
//!
//! Each [`Transfer`] streams one source into one local file on its own Tokio
//! task, and can be paused, resumed or stopped while it runs. Transient
//! network failures are retried by re-opening the stream and skipping the
//! bytes already on disk. A [`Registry`] groups transfers, starts and stops
//! them together, and tracks whether any of them is still running.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ start/stop ┌─────────────────┐
//! │    Registry     │───────────▶│    Transfer     │
//! │ (ordered, flag) │◀───────────│ (watch status)  │
//! └────────┬────────┘  events    └────────┬────────┘
//!          │                              │ tokio::spawn
//!          ▼                              ▼
//! ┌─────────────────┐            ┌─────────────────┐
//! │ broadcast       │            │ Worker          │
//! │ (subscribers)   │            │ Transport ▶ Sink│
//! └─────────────────┘            └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use fetchpool::download::{Registry, TransferOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Registry::new(TransferOptions::default());
//! let id = registry.add("https://example.com/files/archive.tar.gz", None, None)?;
//!
//! registry.start()?;
//!
//! // Pause and resume a single download
//! if let Some(transfer) = registry.get(id) {
//!     transfer.pause()?;
//!     transfer.resume()?;
//! }
//!
//! registry.wait().await;
//! for snapshot in registry.snapshots() {
//!     println!("{} {} {}%", snapshot.id, snapshot.status, snapshot.progress);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod registry;
pub mod sink;
pub mod transfer;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items
pub use error::{DownloadError, TransferError, TransportError};
pub use registry::{Registry, Removal};
pub use sink::{FileSink, OpenMode, Sink, SinkWriter};
pub use transfer::{
    Transfer, TransferObserver, TransferOptions, DEFAULT_DOWNLOAD_DIR, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF,
};
pub use transport::{ByteStream, HttpTransport, Transport};
pub use types::{EventKind, StatusCounts, TransferEvent, TransferId, TransferSnapshot, TransferStatus};

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by transfers and the registry.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a transfer within a registry.
///
/// Allocated from a counter owned by the registry and never reused, even
/// after the transfer is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Registered, never started
    Ready,
    /// Worker launched, stream not open yet
    Started,
    /// Streaming bytes to the sink
    Downloading,
    /// Suspended by the caller
    Paused,
    /// Stopped by the caller; partial file left in place
    Stopped,
    /// Re-opening the stream after a transient failure
    Reconnecting,
    /// Stream exhausted, file complete
    Finished,
    /// Fatal error or retries exhausted
    Failed,
}

impl TransferStatus {
    /// Returns true for the idle or terminal statuses: `Ready`, `Finished`,
    /// `Failed` and `Stopped`.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferStatus::Ready
                | TransferStatus::Finished
                | TransferStatus::Failed
                | TransferStatus::Stopped
        )
    }

    /// Returns true if a worker is currently responsible for the transfer.
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Started => "started",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Reconnecting => "reconnecting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Paused,
    Resumed,
    /// Stopped by the caller
    Stopped,
    /// A transient failure occurred and retry `attempt` is about to run
    Reconnecting { attempt: u32, reason: String },
    Finished,
    Failed { reason: String },
}

impl EventKind {
    /// Terminal events are the ones after which the registry must recompute
    /// whether anything is still running.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Stopped | EventKind::Finished | EventKind::Failed { .. }
        )
    }
}

/// A lifecycle notification emitted by a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferEvent {
    pub id: TransferId,
    pub file_name: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Point-in-time view of a transfer, suitable for display or JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub source: String,
    pub path: PathBuf,
    pub status: TransferStatus,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    /// Percentage rounded to one decimal
    pub progress: f64,
    /// Average speed in bytes per second since the start
    pub speed_bps: u64,
    pub eta_seconds: u64,
    pub attempts: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Number of transfers per status family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub ready: usize,
    /// Started, downloading or reconnecting
    pub active: usize,
    pub paused: usize,
    pub finished: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl StatusCounts {
    pub(crate) fn record(&mut self, status: TransferStatus) {
        match status {
            TransferStatus::Ready => self.ready += 1,
            TransferStatus::Started
            | TransferStatus::Downloading
            | TransferStatus::Reconnecting => self.active += 1,
            TransferStatus::Paused => self.paused += 1,
            TransferStatus::Finished => self.finished += 1,
            TransferStatus::Failed => self.failed += 1,
            TransferStatus::Stopped => self.stopped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.ready + self.active + self.paused + self.finished + self.failed + self.stopped
    }
}

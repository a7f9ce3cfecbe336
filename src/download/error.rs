// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for transfers and the registry.
//!
//! [`DownloadError`] is returned synchronously to a caller that asked for an
//! operation the current state does not allow. [`TransferError`] and
//! [`TransportError`] live inside the worker: they either trigger a
//! reconnect or end the transfer in `Failed`, and are only visible through
//! the transfer's status, `last_error` and events.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::types::TransferId;

/// Caller misuse of a transfer or registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("there are downloads in progress, stop them first or wait for them to finish")]
    RegistryRunning,
    #[error("there is no download in progress")]
    RegistryNotRunning,
    #[error("there is no download with id {0}")]
    UnknownId(TransferId),
    #[error("download {0} is in progress, stop it first")]
    TransferInProgress(TransferId),
    #[error("download is already started")]
    AlreadyStarted,
    #[error("download is already stopped")]
    AlreadyStopped,
    #[error("download is already paused")]
    AlreadyPaused,
    #[error("download is not paused")]
    NotPaused,
    #[error("download has already finished")]
    AlreadyFinished,
    #[error("download is in progress")]
    InProgress,
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Failure reported by a [`Transport`](super::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection interrupted: {0}")]
    Interrupted(String),
    #[error("server responded with HTTP {0}")]
    Status(u16),
    #[error("response did not declare a valid content length")]
    MissingLength,
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) | Self::Interrupted(_) | Self::MissingLength => {
                true
            }
            Self::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            Self::Fatal(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            TransportError::Fatal(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Interrupted(e.to_string())
        }
    }
}

/// Error raised inside a transfer worker.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file exists: '{}'", .0.display())]
    DestinationExists(PathBuf),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("write failed: {0}")]
    Sink(#[from] io::Error),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::DestinationExists(_) | Self::Sink(_) => false,
        }
    }
}

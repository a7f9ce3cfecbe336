// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fetchpool - concurrent, resumable file downloads
//!
//! Download many files at once, pause and resume them individually, and
//! survive flaky connections: a transfer that loses its connection reopens
//! the stream and continues where the file on disk ends.
//!
//! # Core Modules
//!
//! - [`download`] - Transfers, their streaming workers, and the registry
//! - [`config`] - User configuration in `~/.fetchpool/config.json`
//! - [`error`] - Actionable error text for the command line
//! - [`sync`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod sync;

pub use config::Config;
pub use download::{
    DownloadError, EventKind, Registry, Removal, Transfer, TransferEvent, TransferId,
    TransferOptions, TransferSnapshot, TransferStatus,
};

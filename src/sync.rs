// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! Transfer workers run on Tokio tasks and share a handful of small
//! `RwLock`-protected fields with the controlling side. A panic inside one
//! worker must not take down every other transfer that later touches the
//! same registry, so these helpers recover the guard from a poisoned lock
//! and log the event instead of propagating the panic.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "fetchpool::sync",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering. \
                 A transfer task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "fetchpool::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering. \
                 A transfer task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for fetchpool
//!
//! Many tasks hammer pause, resume and stop on live transfers while their
//! workers stream. They are designed to surface data races when run with
//! ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Invariants checked
//!
//! - Every transfer ends in the finished set and its worker exits
//! - The file on disk is exactly `bytes_downloaded` long
//! - The registry is idle once every member has settled

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::timeout;

use fetchpool::download::{
    ByteStream, FileSink, Registry, TransferOptions, TransferStatus, Transport, TransportError,
};

// Test configuration
const TRANSFER_COUNT: usize = 8;
const CONTROLLERS_PER_TRANSFER: usize = 4;
const ITERATIONS_PER_TASK: usize = 50;
const CHUNK_LEN: usize = 64;
const CHUNKS_PER_BODY: u64 = 400;
const TEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// TEST TRANSPORT
// =============================================================================

/// Serves a fixed-size body in small chunks, yielding between them so
/// controllers get a chance to interleave. Every third open drops the
/// connection halfway through.
#[derive(Default)]
struct SlowTransport {
    opens: AtomicU64,
}

struct SlowStream {
    remaining: u64,
    fail_after: Option<u64>,
    bytes_read: u64,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn open(&self, _source: &str) -> Result<Box<dyn ByteStream>, TransportError> {
        let open = self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SlowStream {
            remaining: CHUNKS_PER_BODY,
            fail_after: (open % 3 == 2).then_some(CHUNKS_PER_BODY / 2),
            bytes_read: 0,
        }))
    }
}

#[async_trait]
impl ByteStream for SlowStream {
    fn content_length(&self) -> Option<u64> {
        Some(CHUNKS_PER_BODY * CHUNK_LEN as u64)
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        tokio::task::yield_now().await;
        if self.fail_after == Some(CHUNKS_PER_BODY - self.remaining) {
            return Some(Err(TransportError::Interrupted("test reset".to_string())));
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.bytes_read += CHUNK_LEN as u64;
        Some(Ok(vec![b'x'; CHUNK_LEN]))
    }
}

fn registry(dir: &Path) -> Registry {
    let options = TransferOptions {
        download_dir: dir.to_path_buf(),
        max_retries: 5,
        retry_backoff: Duration::from_millis(1),
    };
    Registry::with_backends(options, Arc::new(SlowTransport::default()), Arc::new(FileSink))
}

// =============================================================================
// CONCURRENT CONTROL TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pause_resume() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = registry(temp_dir.path());
    for i in 0..TRANSFER_COUNT {
        registry
            .add(format!("https://example.test/pause-{}.bin", i), None, None)
            .unwrap();
    }
    registry.start().unwrap();

    let mut handles = vec![];
    for transfer in registry.list() {
        for _ in 0..CONTROLLERS_PER_TRANSFER {
            let transfer = transfer.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..ITERATIONS_PER_TASK {
                    // errors are expected: another controller got there first
                    if j % 2 == 0 {
                        let _ = transfer.pause();
                    } else {
                        let _ = transfer.resume();
                    }
                    tokio::task::yield_now().await;
                }
                // leave it running so it can finish
                let _ = transfer.resume();
            }));
        }
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
        registry.wait().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");

    assert!(!registry.is_running());
    for transfer in registry.list() {
        let status = transfer.status();
        assert!(status.is_finished(), "{} ended {:?}", transfer.id(), status);
        let on_disk = std::fs::metadata(transfer.path()).map(|m| m.len()).unwrap_or(0);
        assert_eq!(on_disk, transfer.bytes_downloaded());
        if status == TransferStatus::Finished {
            assert_eq!(transfer.bytes_downloaded(), transfer.bytes_total());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_races_with_control() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = registry(temp_dir.path());
    for i in 0..TRANSFER_COUNT {
        registry
            .add(format!("https://example.test/stop-{}.bin", i), None, None)
            .unwrap();
    }
    registry.start().unwrap();

    let mut handles = vec![];
    for (i, transfer) in registry.list().into_iter().enumerate() {
        for c in 0..CONTROLLERS_PER_TRANSFER {
            let transfer = transfer.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..ITERATIONS_PER_TASK {
                    match (c + j) % 3 {
                        0 => {
                            let _ = transfer.pause();
                        }
                        1 => {
                            let _ = transfer.resume();
                        }
                        _ if j > i => {
                            let _ = transfer.stop();
                        }
                        _ => {}
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
    }

    let stopper = {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // may already have settled
            let _ = registry.stop();
        })
    };

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
        stopper.await.expect("Stopper panicked");
        registry.wait().await;
    })
    .await;
    assert!(result.is_ok(), "Test timed out");

    assert!(!registry.is_running());
    let counts = registry.status_counts();
    assert_eq!(counts.total(), TRANSFER_COUNT);
    assert_eq!(counts.active + counts.paused, 0);

    for transfer in registry.list() {
        // a stopped transfer never flips back to a worker state
        assert!(transfer.stop().is_err());
        let on_disk = std::fs::metadata(transfer.path()).map(|m| m.len()).unwrap_or(0);
        assert_eq!(on_disk, transfer.bytes_downloaded());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_after_stop_while_worker_unwinds() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = registry(temp_dir.path());
    let id = registry
        .add("https://example.test/restart.bin", None, None)
        .unwrap();
    let transfer = registry.get(id).unwrap();

    for _ in 0..ITERATIONS_PER_TASK {
        // either the worker is still unwinding or the partial file blocks
        // the fresh attempt; neither may leave two workers writing
        let _ = transfer.start();
        let _ = transfer.stop();
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), transfer.wait()).await;
    assert!(result.is_ok(), "Test timed out");
    assert!(transfer.is_finished());

    let on_disk = std::fs::metadata(transfer.path()).map(|m| m.len()).unwrap_or(0);
    assert!(on_disk <= CHUNKS_PER_BODY * CHUNK_LEN as u64);
}

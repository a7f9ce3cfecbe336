// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared helpers for download tests: a transport that replays scripted
//! responses instead of touching the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::error::TransportError;
use super::transport::{ByteStream, Transport};

/// One step of a scripted response body.
pub(crate) enum Step {
    Chunk(Vec<u8>),
    /// Fail the stream as if the peer reset the connection
    Reset,
    /// Block until a permit is added to the semaphore
    Hold(Arc<Semaphore>),
}

/// Outcome of one `open` call.
pub(crate) enum Script {
    /// Connection refused
    Refuse,
    /// Non-success HTTP status
    Status(u16),
    /// No headers until a permit is added, then the complete body
    Stall(Arc<Semaphore>, Vec<u8>),
    Body {
        content_length: Option<u64>,
        steps: Vec<Step>,
    },
}

impl Script {
    pub(crate) fn body(content_length: Option<u64>, steps: Vec<Step>) -> Self {
        Script::Body { content_length, steps }
    }

    /// Complete body split into chunks of `chunk_size` bytes.
    pub(crate) fn chunked(data: &[u8], chunk_size: usize) -> Self {
        let steps = data
            .chunks(chunk_size)
            .map(|chunk| Step::Chunk(chunk.to_vec()))
            .collect();
        Script::body(Some(data.len() as u64), steps)
    }
}

/// Replays a queue of scripts per source. A source with nothing left
/// refuses the connection.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Script>>>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route(self, source: &str, scripts: impl IntoIterator<Item = Script>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .extend(scripts);
        self
    }

    /// Number of `open` calls so far, across all sources.
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, source: &str) -> Result<Box<dyn ByteStream>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .routes
            .lock()
            .unwrap()
            .get_mut(source)
            .and_then(VecDeque::pop_front);

        match script {
            None | Some(Script::Refuse) => {
                Err(TransportError::Connect("connection refused".to_string()))
            }
            Some(Script::Status(code)) => Err(TransportError::Status(code)),
            Some(Script::Stall(gate, data)) => {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Ok(Box::new(ScriptedStream {
                    content_length: Some(data.len() as u64),
                    steps: VecDeque::from([Step::Chunk(data)]),
                    bytes_read: 0,
                }))
            }
            Some(Script::Body { content_length, steps }) => Ok(Box::new(ScriptedStream {
                content_length,
                steps: steps.into(),
                bytes_read: 0,
            })),
        }
    }
}

struct ScriptedStream {
    content_length: Option<u64>,
    steps: VecDeque<Step>,
    bytes_read: u64,
}

#[async_trait]
impl ByteStream for ScriptedStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.steps.pop_front()? {
                Step::Chunk(chunk) => {
                    self.bytes_read += chunk.len() as u64;
                    return Some(Ok(chunk));
                }
                Step::Reset => {
                    return Some(Err(TransportError::Interrupted(
                        "connection reset by peer".to_string(),
                    )))
                }
                Step::Hold(gate) => {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
            }
        }
    }
}

/// Deterministic non-repeating-ish payload.
pub(crate) fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `condition` until it holds, panicking after five seconds.
pub(crate) async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for: {}", what);
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network side of a transfer.
//!
//! A [`Transport`] opens a streamed response for a source address. The
//! returned [`ByteStream`] is lazy, finite and cannot be restarted: a
//! reconnect opens a brand new stream from the beginning.

use async_trait::async_trait;

use super::error::TransportError;

/// Opens streamed responses for source addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, source: &str) -> Result<Box<dyn ByteStream>, TransportError>;
}

/// A streamed response body.
#[async_trait]
pub trait ByteStream: Send {
    /// Total size declared by the response headers, if any.
    fn content_length(&self) -> Option<u64>;

    /// Cumulative number of body bytes read from this stream so far.
    fn bytes_read(&self) -> u64;

    /// Next chunk of the body, or `None` once the body is exhausted.
    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// HTTP(S) transport backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transport that sends the given `User-Agent` header.
    pub fn with_user_agent(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, source: &str) -> Result<Box<dyn ByteStream>, TransportError> {
        let response = self.client.get(source).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        tracing::debug!(source, status = status.as_u16(), "response headers received");

        Ok(Box::new(HttpStream {
            content_length: response.content_length(),
            response,
            bytes_read: 0,
        }))
    }
}

struct HttpStream {
    response: reqwest::Response,
    content_length: Option<u64>,
    bytes_read: u64,
}

#[async_trait]
impl ByteStream for HttpStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Some(Ok(chunk.to_vec()))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

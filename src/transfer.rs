// src/transfer.rs
//
// One chunked HTTP PUT to a presigned URL, with upload progress and
// cooperative cancellation.
//
// The transport is a trait so the engine can be driven against a mock in
// tests; the shipped implementation rides reqwest with a streaming request
// body, reporting progress once per body chunk handed to the connection.

use crate::constants::{DEFAULT_CONTENT_TYPE, STREAM_CHUNK_SIZE};
use crate::progress::ProgressFn;
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failures of a single chunk PUT.
///
/// `Aborted` is user-initiated cancellation and must stay distinguishable
/// from network and server failures; the task layer decides whether an
/// abort means pause or cancel.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Aborted")]
    Aborted,
    #[error("Upload failed: {0}")]
    Status(u16),
    #[error("Missing ETag")]
    MissingEtag,
    #[error("Network error: {0}")]
    Network(String),
}

impl TransferError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransferError::Aborted)
    }
}

/// Uploads one byte range to a presigned URL.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// PUT `body` to `url`. `progress` receives monotonically increasing
    /// `(loaded, total)` byte counts. If `cancel` fires, the request is
    /// dropped and the call fails with [`TransferError::Aborted`]. The
    /// response's `ETag` header is mandatory: a 2xx without one is
    /// [`TransferError::MissingEtag`].
    async fn put_chunk(
        &self,
        url: &str,
        body: Bytes,
        content_type: Option<&str>,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError>;
}

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .tcp_nodelay(true)
        .use_rustls_tls()
        .build()
        .expect("failed to build HTTP client")
});

/// Shared connection-pooled client for presigned PUTs and the protocol API.
pub fn shared_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            client: shared_client().clone(),
        }
    }
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Split an owned buffer into stream-sized chunks. `Bytes::split_to` shares
/// the allocation, so this is reference counting, not copying.
fn chunk_body(mut body: Bytes) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(body.len() / STREAM_CHUNK_SIZE + 1);
    while body.len() > STREAM_CHUNK_SIZE {
        chunks.push(body.split_to(STREAM_CHUNK_SIZE));
    }
    if !body.is_empty() {
        chunks.push(body);
    }
    chunks
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn put_chunk(
        &self,
        url: &str,
        body: Bytes,
        content_type: Option<&str>,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Aborted);
        }

        let total = body.len() as u64;
        let report = progress.clone();
        let mut sent = 0u64;
        // The closure runs as the connection pulls body chunks, so progress
        // tracks bytes handed to the transport.
        let counted = futures_util::stream::iter(chunk_body(body).into_iter().map(
            move |chunk| {
                sent += chunk.len() as u64;
                report(sent, total);
                Ok::<Bytes, std::io::Error>(chunk)
            },
        ));

        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type.unwrap_or(DEFAULT_CONTENT_TYPE))
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(counted))
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Aborted),
            res = request => res.map_err(|e| TransferError::Network(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match etag {
            Some(etag) if !etag.is_empty() => {
                progress(total, total);
                debug!(url, bytes = total, %etag, "chunk uploaded");
                Ok(etag)
            }
            _ => Err(TransferError::MissingEtag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn chunking_preserves_content_and_bounds() {
        let data: Vec<u8> = (0..(STREAM_CHUNK_SIZE * 2 + 100))
            .map(|i| (i % 256) as u8)
            .collect();
        let chunks = chunk_body(Bytes::from(data.clone()));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= STREAM_CHUNK_SIZE));
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(rejoined, data);

        assert!(chunk_body(Bytes::new()).is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_without_network() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let progress: ProgressFn = Arc::new(move |_, _| {
            calls2.fetch_add(1, Ordering::Relaxed);
        });

        let err = HttpTransport::default()
            .put_chunk(
                "http://127.0.0.1:1/unreachable",
                Bytes::from_static(b"abc"),
                None,
                progress,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let cancel = CancellationToken::new();
        let progress: ProgressFn = Arc::new(|_, _| {});
        let err = HttpTransport::default()
            .put_chunk(
                "http://127.0.0.1:1/unreachable",
                Bytes::from_static(b"abc"),
                None,
                progress,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
    }
}

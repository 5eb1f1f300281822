use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::limiter::SpeedLimiter;
use crate::models::{ChunkDescriptor, ChunkResult};
use crate::probe::start_from_content_range;

/// Upper bound on the buffer reserved up front for a single chunk.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Errors for one chunk attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unexpected status {status}")]
    Status { status: StatusCode, transient: bool },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt at the same chunk could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ShortRead { .. } | Self::Stalled(_) | Self::InvalidResponse(_) => true,
            Self::Status { transient, .. } => *transient,
            Self::Cancelled => false,
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        let transient = status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error();
        Self::Status { status, transient }
    }
}

/// Everything a fetcher needs for one attempt.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub url: Arc<str>,
    pub descriptor: ChunkDescriptor,
    /// Send a `Range` header and require `206 Partial Content`.
    pub ranged: bool,
}

/// Retrieves one chunk. Implementations hold no per-transfer state and never retry.
#[async_trait]
pub trait ChunkFetcher: Send + Sync + 'static {
    async fn fetch(&self, request: ChunkRequest, cancel: CancellationToken) -> ChunkResult;

    /// Deliver the body through `pieces` in slices of at most `piece_size`
    /// bytes. Returns the number of bytes delivered.
    ///
    /// The default fetches the whole chunk first.
    async fn stream(
        &self,
        request: ChunkRequest,
        piece_size: usize,
        pieces: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<u64, FetchError> {
        let body = self.fetch(request, cancel).await.outcome?;
        let piece_size = piece_size.max(1);
        let mut start = 0;
        while start < body.len() {
            let end = (start + piece_size).min(body.len());
            pieces.send(body.slice(start..end)).await.map_err(|_| FetchError::Cancelled)?;
            start = end;
        }
        Ok(body.len() as u64)
    }
}

/// `ChunkFetcher` over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    stall_timeout: Duration,
    content_type: Option<String>,
    limiter: Option<SpeedLimiter>,
}

impl HttpFetcher {
    pub fn new(client: Client, stall_timeout: Duration) -> Self {
        Self { client, stall_timeout, content_type: None, limiter: None }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_limiter(mut self, limiter: Option<SpeedLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Send the request and validate the response head.
    async fn open(&self, request: &ChunkRequest) -> Result<Response, FetchError> {
        let descriptor = &request.descriptor;
        let mut builder = self.client.get(&*request.url);
        if let Some(content_type) = &self.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if request.ranged {
            let last = descriptor
                .last_byte()
                .ok_or_else(|| FetchError::InvalidResponse("ranged fetch of a chunk with unknown length".into()))?;
            builder = builder.header(RANGE, format!("bytes={}-{}", descriptor.offset, last));
        }

        let resp = timeout(self.stall_timeout, builder.send())
            .await
            .map_err(|_| FetchError::Stalled(self.stall_timeout))??;

        let status = resp.status();
        if request.ranged {
            if status != StatusCode::PARTIAL_CONTENT {
                // A 200 here means the server ignored the range and is sending everything.
                return Err(FetchError::from_status(status));
            }
            if let Some(start) = start_from_content_range(resp.headers()) {
                if start != descriptor.offset {
                    return Err(FetchError::InvalidResponse(format!(
                        "Content-Range starts at {start}, requested {}",
                        descriptor.offset
                    )));
                }
            }
        } else if !status.is_success() {
            return Err(FetchError::from_status(status));
        }
        Ok(resp)
    }

    /// Read the body, calling `on_piece` with the bytes buffered so far after
    /// every network read. Returns what is left in the buffer at the end.
    async fn read_body<F, Fut>(&self, request: &ChunkRequest, mut on_piece: F) -> Result<(BytesMut, u64), FetchError>
    where
        F: FnMut(&mut BytesMut) -> Fut,
        Fut: std::future::Future<Output = Result<(), FetchError>>,
    {
        let resp = self.open(request).await?;
        let expected = request.descriptor.length;
        let reserve = expected.unwrap_or(0).min(MAX_PREALLOCATION) as usize;
        let mut buf = BytesMut::with_capacity(reserve);
        let mut received: u64 = 0;
        let mut stream = resp.bytes_stream();

        loop {
            let next = timeout(self.stall_timeout, stream.next())
                .await
                .map_err(|_| FetchError::Stalled(self.stall_timeout))?;
            let Some(piece) = next else { break };
            let piece = piece?;

            if let Some(limiter) = &self.limiter {
                limiter.take(piece.len() as u64).await;
            }
            received += piece.len() as u64;
            if let Some(expected) = expected {
                if received > expected {
                    return Err(FetchError::ShortRead { expected, received });
                }
            }
            buf.extend_from_slice(&piece);
            on_piece(&mut buf).await?;
        }

        if let Some(expected) = expected {
            if received != expected {
                return Err(FetchError::ShortRead { expected, received });
            }
        }
        trace!(index = request.descriptor.index, bytes = received, "chunk body received");
        Ok((buf, received))
    }

    async fn fetch_bytes(&self, request: &ChunkRequest) -> Result<Bytes, FetchError> {
        let (buf, _) = self.read_body(request, |_| std::future::ready(Ok(()))).await?;
        Ok(buf.freeze())
    }

    async fn stream_body(
        &self,
        request: &ChunkRequest,
        piece_size: usize,
        pieces: &mpsc::Sender<Bytes>,
    ) -> Result<u64, FetchError> {
        let (rest, received) = self
            .read_body(request, move |buf| {
                let mut ready = Vec::new();
                while buf.len() >= piece_size {
                    ready.push(buf.split_to(piece_size).freeze());
                }
                async move {
                    for piece in ready {
                        pieces.send(piece).await.map_err(|_| FetchError::Cancelled)?;
                    }
                    Ok(())
                }
            })
            .await?;
        if !rest.is_empty() {
            pieces.send(rest.freeze()).await.map_err(|_| FetchError::Cancelled)?;
        }
        Ok(received)
    }
}

#[async_trait]
impl ChunkFetcher for HttpFetcher {
    async fn fetch(&self, request: ChunkRequest, cancel: CancellationToken) -> ChunkResult {
        let descriptor = request.descriptor;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_bytes(&request) => result,
        };
        ChunkResult { descriptor, outcome }
    }

    async fn stream(
        &self,
        request: ChunkRequest,
        piece_size: usize,
        pieces: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<u64, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.stream_body(&request, piece_size.max(1), &pieces) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(FetchError::from_status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(FetchError::from_status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(FetchError::from_status(StatusCode::REQUEST_TIMEOUT).is_transient());
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND).is_transient());
        assert!(!FetchError::from_status(StatusCode::OK).is_transient());
    }

    #[test]
    fn short_reads_and_stalls_are_retryable() {
        assert!(FetchError::ShortRead { expected: 10, received: 3 }.is_transient());
        assert!(FetchError::Stalled(Duration::from_secs(1)).is_transient());
        assert!(!FetchError::Cancelled.is_transient());
    }

    struct WholeBody(&'static [u8]);

    #[async_trait]
    impl ChunkFetcher for WholeBody {
        async fn fetch(&self, request: ChunkRequest, _cancel: CancellationToken) -> ChunkResult {
            ChunkResult { descriptor: request.descriptor, outcome: Ok(Bytes::from_static(self.0)) }
        }
    }

    #[tokio::test]
    async fn default_stream_slices_the_fetched_body() {
        let request = ChunkRequest {
            url: Arc::from("http://example.invalid/body"),
            descriptor: ChunkDescriptor { index: 0, offset: 0, length: None },
            ranged: false,
        };
        let (tx, mut rx) = mpsc::channel(8);
        let sent = WholeBody(b"0123456789").stream(request, 4, tx, CancellationToken::new()).await.unwrap();

        assert_eq!(sent, 10);
        let mut pieces = Vec::new();
        while let Some(piece) = rx.recv().await {
            pieces.push(piece);
        }
        assert_eq!(pieces, vec![Bytes::from_static(b"0123"), Bytes::from_static(b"4567"), Bytes::from_static(b"89")]);
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

use crate::fetcher::{ChunkFetcher, ChunkRequest, FetchError};
use crate::models::{ChunkDescriptor, ChunkResult, ChunkState, Progress, TransferManifest};
use crate::reassembler::{ReassemblyError, Reassembler};
use crate::sink::ChunkSink;

/// Pieces of an unranged stream allowed in flight between fetcher and sink.
const STREAM_BUFFER: usize = 4;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("chunk {index} failed {attempts} times: {last_error}")]
    ChunkExhausted {
        index: usize,
        attempts: u32,
        #[source]
        last_error: FetchError,
    },
    #[error("chunk {index} rejected: {error}")]
    ChunkRejected {
        index: usize,
        #[source]
        error: FetchError,
    },
    #[error(transparent)]
    Reassembly(ReassemblyError),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("worker task failed: {0}")]
    Worker(#[from] JoinError),
    #[error("no work left but {flushed} of {planned} chunks flushed")]
    Incomplete { flushed: usize, planned: usize },
}

impl From<ReassemblyError> for SchedulerError {
    fn from(e: ReassemblyError) -> Self {
        match e {
            ReassemblyError::Cancelled => Self::Cancelled,
            other => Self::Reassembly(other),
        }
    }
}

/// Drives a plan through a bounded pool of fetch workers.
///
/// All bookkeeping (state table, attempt counters, retry timers) lives on the
/// task that calls [`run`](Self::run). Workers only fetch and hand their
/// [`ChunkResult`] back through the `JoinSet`.
pub struct TransferScheduler {
    fetcher: Arc<dyn ChunkFetcher>,
    manifest: TransferManifest,
    cancel: CancellationToken,
    states: Vec<ChunkState>,
    attempts: Vec<u32>,
    dispatched: usize,
}

impl TransferScheduler {
    pub fn new(fetcher: Arc<dyn ChunkFetcher>, manifest: TransferManifest, cancel: CancellationToken) -> Self {
        Self {
            fetcher,
            manifest,
            cancel,
            states: Vec::new(),
            attempts: Vec::new(),
            dispatched: 0,
        }
    }

    pub fn chunk_states(&self) -> &[ChunkState] {
        &self.states
    }

    /// Total fetch attempts started, retries included.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub async fn run<S: ChunkSink>(
        &mut self,
        plan: &[ChunkDescriptor],
        reassembler: &mut Reassembler<S>,
        progress: &watch::Sender<Progress>,
    ) -> Result<(), SchedulerError> {
        let ranged = self.manifest.ranged_for(plan);
        let limit = self.manifest.effective_concurrency(plan);
        self.states = vec![ChunkState::Pending; plan.len()];
        self.attempts = vec![0; plan.len()];

        if !ranged && plan.len() == 1 {
            return self.run_stream(plan[0], reassembler, progress).await;
        }

        let mut pending: VecDeque<usize> = (0..plan.len()).collect();
        let mut retries: DelayQueue<usize> = DelayQueue::new();
        let mut workers: JoinSet<ChunkResult> = JoinSet::new();

        debug!(chunks = plan.len(), limit, ranged, "transfer scheduled");

        loop {
            if reassembler.is_complete() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                workers.abort_all();
                return Err(SchedulerError::Cancelled);
            }

            while workers.len() < limit {
                let Some(index) = pending.pop_front() else { break };
                self.dispatch(&mut workers, plan[index], ranged);
            }

            if workers.is_empty() && retries.is_empty() {
                return Err(SchedulerError::Incomplete {
                    flushed: reassembler.chunks_flushed(),
                    planned: plan.len(),
                });
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    return Err(SchedulerError::Cancelled);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    let result = joined?;
                    if let Some((index, delay)) = self.complete(result, reassembler, progress).await? {
                        retries.insert(index, delay);
                    }
                }
                Some(expired) = std::future::poll_fn(|cx| retries.poll_expired(cx)), if !retries.is_empty() => {
                    let index = expired.into_inner();
                    self.states[index] = ChunkState::Pending;
                    pending.push_back(index);
                }
            }
        }
    }

    /// Drive a single unranged chunk, writing each piece as it arrives.
    ///
    /// A failed attempt discards what was written and starts over at offset 0.
    async fn run_stream<S: ChunkSink>(
        &mut self,
        descriptor: ChunkDescriptor,
        reassembler: &mut Reassembler<S>,
        progress: &watch::Sender<Progress>,
    ) -> Result<(), SchedulerError> {
        let index = descriptor.index;
        let piece_size = usize::try_from(self.manifest.chunk_size).unwrap_or(usize::MAX).max(1);
        debug!(piece_size, "streaming unranged transfer");

        loop {
            if self.cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            self.states[index] = ChunkState::InFlight;
            self.dispatched += 1;

            let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
            let fetcher = Arc::clone(&self.fetcher);
            let request = ChunkRequest { url: Arc::clone(&self.manifest.url), descriptor, ranged: false };
            let cancel = self.cancel.child_token();
            // Dropping the set on an early return aborts the worker.
            let mut worker: JoinSet<Result<u64, FetchError>> = JoinSet::new();
            worker.spawn(async move { fetcher.stream(request, piece_size, tx, cancel).await });

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
                    piece = rx.recv() => {
                        let Some(data) = piece else { break };
                        reassembler.append_streamed(data, &self.cancel).await?;
                        let bytes_done = reassembler.bytes_flushed();
                        progress.send_modify(|p| p.bytes_done = bytes_done);
                    }
                }
            }

            let outcome = match worker.join_next().await {
                Some(joined) => joined?,
                None => Err(FetchError::Cancelled),
            };
            let outcome = outcome.and_then(|received| match descriptor.length {
                Some(expected) if received != expected => Err(FetchError::ShortRead { expected, received }),
                _ => Ok(received),
            });

            match outcome {
                Ok(received) => {
                    reassembler.end_stream();
                    self.states[index] = ChunkState::Succeeded;
                    let chunks_done = reassembler.chunks_flushed();
                    progress.send_modify(|p| {
                        p.bytes_done = received;
                        p.chunks_done = chunks_done;
                    });
                    return Ok(());
                }
                Err(error) => {
                    let delay = self.record_failure(index, error)?;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    reassembler.restart_stream().await?;
                    progress.send_modify(|p| p.bytes_done = 0);
                }
            }
        }
    }

    fn dispatch(&mut self, workers: &mut JoinSet<ChunkResult>, descriptor: ChunkDescriptor, ranged: bool) {
        self.states[descriptor.index] = ChunkState::InFlight;
        self.dispatched += 1;
        let fetcher = Arc::clone(&self.fetcher);
        let request = ChunkRequest { url: Arc::clone(&self.manifest.url), descriptor, ranged };
        let cancel = self.cancel.child_token();
        debug!(index = descriptor.index, offset = descriptor.offset, "dispatching chunk");
        workers.spawn(async move { fetcher.fetch(request, cancel).await });
    }

    /// Apply one finished attempt. Returns a retry to schedule, if any.
    async fn complete<S: ChunkSink>(
        &mut self,
        result: ChunkResult,
        reassembler: &mut Reassembler<S>,
        progress: &watch::Sender<Progress>,
    ) -> Result<Option<(usize, Duration)>, SchedulerError> {
        let descriptor = result.descriptor;
        let index = descriptor.index;

        let outcome = result.outcome.and_then(|bytes| match descriptor.length {
            Some(expected) if bytes.len() as u64 != expected => Err(FetchError::ShortRead {
                expected,
                received: bytes.len() as u64,
            }),
            _ => Ok(bytes),
        });

        match outcome {
            Ok(bytes) => {
                self.states[index] = ChunkState::Succeeded;
                let flushed = reassembler.accept(index, bytes, &self.cancel).await?;
                if flushed > 0 {
                    let (bytes_done, chunks_done) = (reassembler.bytes_flushed(), reassembler.chunks_flushed());
                    progress.send_modify(|p| {
                        p.bytes_done = bytes_done;
                        p.chunks_done = chunks_done;
                    });
                }
                Ok(None)
            }
            Err(error) => self.record_failure(index, error).map(|delay| Some((index, delay))),
        }
    }

    /// Count a failed attempt. Returns the backoff before the next one, or the
    /// error that ends the transfer.
    fn record_failure(&mut self, index: usize, error: FetchError) -> Result<Duration, SchedulerError> {
        if matches!(error, FetchError::Cancelled) {
            return Err(SchedulerError::Cancelled);
        }
        self.attempts[index] += 1;
        let attempts = self.attempts[index];
        self.states[index] = ChunkState::Failed(attempts);
        if !error.is_transient() {
            warn!(index, error = %error, "chunk rejected");
            return Err(SchedulerError::ChunkRejected { index, error });
        }
        if attempts >= self.manifest.retry_ceiling {
            warn!(index, attempts, error = %error, "chunk exhausted its retries");
            return Err(SchedulerError::ChunkExhausted { index, attempts, last_error: error });
        }
        let delay = self.manifest.backoff.delay(attempts);
        warn!(index, attempt = attempts, ?delay, error = %error, "chunk failed, retrying");
        Ok(delay)
    }
}

use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, TransferConfig};
use crate::fetcher::{FetchError, HttpFetcher};
use crate::limiter::SpeedLimiter;
use crate::models::{Progress, SessionState, TransferManifest, TransferOutput};
use crate::planner::plan_for;
use crate::probe::{ProbeError, RangeProber};
use crate::reassembler::{ReassemblyError, Reassembler};
use crate::scheduler::{SchedulerError, TransferScheduler};
use crate::sink::{self, SinkError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal failure of a session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("chunk {index} failed {attempts} times: {source}")]
    ChunkExhausted { index: usize, attempts: u32, source: FetchError },
    #[error("chunk {index} rejected: {source}")]
    ChunkRejected { index: usize, source: FetchError },
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Client(reqwest::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable codes reported with a failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    ProbeError,
    ChunkExhaustedError,
    ChunkRejected,
    SinkError,
    IntegrityError,
    ConfigError,
    CancelledError,
    InternalError,
}

impl TransferError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Probe(_) => ErrorCode::ProbeError,
            Self::ChunkExhausted { .. } => ErrorCode::ChunkExhaustedError,
            Self::ChunkRejected { .. } => ErrorCode::ChunkRejected,
            Self::Sink(_) => ErrorCode::SinkError,
            Self::IntegrityMismatch { .. } => ErrorCode::IntegrityError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Cancelled => ErrorCode::CancelledError,
            Self::Client(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// The terminal state a session ends in when it stops with this error.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Cancelled => SessionState::Cancelled,
            _ => SessionState::Failed,
        }
    }
}

impl From<ReassemblyError> for TransferError {
    fn from(e: ReassemblyError) -> Self {
        match e {
            ReassemblyError::Sink(e) => Self::Sink(e),
            ReassemblyError::Integrity { expected, actual } => Self::IntegrityMismatch { expected, actual },
            ReassemblyError::Cancelled => Self::Cancelled,
            other @ ReassemblyError::Incomplete { .. } => Self::Internal(other.to_string()),
        }
    }
}

impl From<SchedulerError> for TransferError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::ChunkExhausted { index, attempts, last_error } => {
                Self::ChunkExhausted { index, attempts, source: last_error }
            }
            SchedulerError::ChunkRejected { index, error } => Self::ChunkRejected { index, source: error },
            SchedulerError::Reassembly(e) => e.into(),
            SchedulerError::Cancelled => Self::Cancelled,
            other @ (SchedulerError::Worker(_) | SchedulerError::Incomplete { .. }) => {
                Self::Internal(other.to_string())
            }
        }
    }
}

/// Delivered once when a session reaches a terminal state.
#[derive(Debug)]
pub struct Completion {
    pub state: SessionState,
    pub result: Result<TransferOutput, TransferError>,
}

impl Completion {
    pub fn code(&self) -> Option<ErrorCode> {
        self.result.as_ref().err().map(TransferError::code)
    }

    pub fn is_success(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// Start downloading `url` on the current tokio runtime.
pub fn start_transfer(url: impl Into<String>, config: TransferConfig) -> SessionHandle {
    TransferSession::new(url, config).start()
}

/// Caller's side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    url: String,
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
    limiter: SpeedLimiter,
    task: JoinHandle<Completion>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.progress.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Request cancellation. Safe to call repeatedly or after the session ended.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            self.cancel.cancel();
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Change the session's bandwidth cap. 0 removes it.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.limiter.set_rate(bytes_per_sec).await;
    }

    /// Wait for the terminal state.
    pub async fn wait(self) -> Completion {
        match self.task.await {
            Ok(completion) => completion,
            Err(e) => Completion {
                state: SessionState::Failed,
                result: Err(TransferError::Internal(format!("session task failed: {e}"))),
            },
        }
    }
}

/// One transfer's lifecycle: probe, plan, schedule, reassemble.
pub struct TransferSession {
    id: u64,
    url: String,
    config: TransferConfig,
    client: Option<Client>,
    gate: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    limiter: SpeedLimiter,
    progress: watch::Sender<Progress>,
}

impl TransferSession {
    pub fn new(url: impl Into<String>, config: TransferConfig) -> Self {
        let (progress, _) = watch::channel(Progress::new());
        let limiter = SpeedLimiter::new(config.max_bytes_per_sec);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            url: url.into(),
            config,
            client: None,
            gate: None,
            cancel: CancellationToken::new(),
            limiter,
            progress,
        }
    }

    /// Use a caller-supplied client instead of building one from the config.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Hold a permit from `gate` for the whole transfer. The session stays
    /// `Created` until one is available.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn start(self) -> SessionHandle {
        let id = self.id;
        let url = self.url.clone();
        let cancel = self.cancel.clone();
        let progress = self.progress.subscribe();
        let limiter = self.limiter.clone();
        let task = tokio::spawn(self.run());
        SessionHandle { id, url, cancel, progress, limiter, task }
    }

    #[instrument(name = "transfer", skip_all, fields(id = self.id, url = %self.url))]
    async fn run(self) -> Completion {
        let result = self.drive().await;
        let state = match &result {
            Ok(_) => SessionState::Completed,
            Err(e) => e.terminal_state(),
        };
        self.advance(state);

        match &result {
            Ok(TransferOutput::File(path)) => info!(path = %path.display(), "transfer completed"),
            Ok(TransferOutput::Memory(bytes)) => info!(bytes = bytes.len(), "transfer completed"),
            Err(TransferError::Cancelled) => info!("transfer cancelled"),
            Err(e) => error!(error = %e, code = ?e.code(), "transfer failed"),
        }
        Completion { state, result }
    }

    async fn drive(&self) -> Result<TransferOutput, TransferError> {
        self.config.validate()?;

        let _permit = match &self.gate {
            Some(gate) => {
                debug!(available = gate.available_permits(), "waiting for a transfer slot");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    permit = Arc::clone(gate).acquire_owned() => {
                        Some(permit.map_err(|_| TransferError::Internal("transfer gate closed".into()))?)
                    }
                }
            }
            None => None,
        };

        self.advance(SessionState::Probing);
        let client = match &self.client {
            Some(client) => client.clone(),
            None => build_client(&self.config).map_err(TransferError::Client)?,
        };
        let prober = RangeProber::new(client.clone(), self.config.probe_timeout());
        let report = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            report = prober.probe(&self.url) => report?,
        };
        info!(total = ?report.total_size, ranges = report.supports_ranges, "probe complete");

        self.advance(SessionState::Planning);
        let plan = plan_for(&report, self.config.chunk_size_bytes);
        let manifest = TransferManifest {
            url: Arc::from(self.url.as_str()),
            total_size: report.total_size,
            supports_ranges: report.supports_ranges,
            chunk_size: self.config.chunk_size_bytes,
            concurrency_limit: self.config.concurrency_limit,
            retry_ceiling: self.config.retry_ceiling,
            backoff: self.config.backoff(),
        };
        if !report.supports_ranges || report.total_size.is_none() {
            warn!("range requests unavailable, fetching as a single stream");
        }
        self.progress.send_modify(|p| {
            p.bytes_total = report.total_size;
            p.chunks_total = plan.len();
        });

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.advance(SessionState::Transferring);

        let sink = sink::open(&self.config.output, report.total_size).await?;
        let mut reassembler = Reassembler::new(sink, plan.clone(), report.total_size)
            .with_expected_sha256(self.config.expected_sha256.clone());
        let fetcher = HttpFetcher::new(client, self.config.stall_timeout())
            .with_content_type(self.config.content_type.clone())
            .with_limiter(Some(self.limiter.clone()));
        let mut scheduler = TransferScheduler::new(Arc::new(fetcher), manifest, self.cancel.clone());

        match scheduler.run(&plan, &mut reassembler, &self.progress).await {
            Ok(()) => {
                let bytes_done = reassembler.bytes_flushed();
                let output = reassembler.finish().await?;
                self.progress.send_modify(|p| {
                    p.bytes_total.get_or_insert(bytes_done);
                });
                Ok(output)
            }
            Err(e) => {
                reassembler.abort().await;
                Err(e.into())
            }
        }
    }

    fn advance(&self, next: SessionState) {
        self.progress.send_if_modified(|p| apply_transition(p, next));
    }
}

/// Move `progress` to `next` if the state machine allows it.
fn apply_transition(progress: &mut Progress, next: SessionState) -> bool {
    if progress.state.can_advance_to(next) {
        debug!(from = ?progress.state, to = ?next, "session state");
        progress.state = next;
        true
    } else {
        warn!(from = ?progress.state, to = ?next, "ignoring illegal session transition");
        false
    }
}

fn build_client(config: &TransferConfig) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().connect_timeout(config.connect_timeout());
    if let Some(agent) = &config.user_agent {
        builder = builder.user_agent(agent.clone());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn scheduler_errors_map_to_codes() {
        let exhausted: TransferError = SchedulerError::ChunkExhausted {
            index: 2,
            attempts: 5,
            last_error: FetchError::Stalled(Duration::from_secs(1)),
        }
        .into();
        assert_eq!(exhausted.code(), ErrorCode::ChunkExhaustedError);
        assert_eq!(exhausted.terminal_state(), SessionState::Failed);

        let cancelled: TransferError = SchedulerError::Reassembly(ReassemblyError::Cancelled).into();
        assert_eq!(cancelled.code(), ErrorCode::CancelledError);
        assert_eq!(cancelled.terminal_state(), SessionState::Cancelled);

        let sink: TransferError =
            SchedulerError::Reassembly(ReassemblyError::Sink(SinkError::OutOfOrder { expected: 0, got: 4 })).into();
        assert_eq!(sink.code(), ErrorCode::SinkError);
    }

    #[test]
    fn illegal_transitions_leave_the_state_alone() {
        let mut progress = Progress::new();
        assert!(apply_transition(&mut progress, SessionState::Probing));
        assert!(apply_transition(&mut progress, SessionState::Planning));

        assert!(!apply_transition(&mut progress, SessionState::Failed));
        assert!(!apply_transition(&mut progress, SessionState::Completed));
        assert_eq!(progress.state, SessionState::Planning);

        assert!(apply_transition(&mut progress, SessionState::Cancelled));
        assert!(!apply_transition(&mut progress, SessionState::Transferring));
        assert_eq!(progress.state, SessionState::Cancelled);
    }

    #[tokio::test]
    async fn invalid_config_fails_without_network() {
        let config = TransferConfig { chunk_size_bytes: 0, ..Default::default() };
        let handle = start_transfer("http://127.0.0.1:9/never-contacted", config);
        let completion = handle.wait().await;
        assert_eq!(completion.state, SessionState::Failed);
        assert_eq!(completion.code(), Some(ErrorCode::ConfigError));
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_a_slot() {
        let gate = Arc::new(Semaphore::new(0));
        let handle = TransferSession::new("http://127.0.0.1:9/never-contacted", TransferConfig::default())
            .with_gate(gate)
            .start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), SessionState::Created);

        handle.cancel();
        handle.cancel();
        let completion = handle.wait().await;
        assert_eq!(completion.state, SessionState::Cancelled);
        assert_eq!(completion.code(), Some(ErrorCode::CancelledError));
    }
}

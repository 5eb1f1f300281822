// src/models.rs

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::fetcher::FetchError;

/// One contiguous byte range of the remote resource.
///
/// `length` is `None` only for the single descriptor planned when the
/// server did not report a size; that chunk is fetched as an unranged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub offset: u64,
    pub length: Option<u64>,
}

impl ChunkDescriptor {
    /// Exclusive end offset, if the length is known.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.offset + len)
    }

    /// Inclusive last byte, as written in a `Range` header.
    pub fn last_byte(&self) -> Option<u64> {
        self.end().map(|end| end - 1)
    }
}

/// Scheduler-side state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    InFlight,
    Succeeded,
    /// Number of failed attempts so far.
    Failed(u32),
}

/// What a fetcher hands back for one chunk. Consumed once by the reassembler.
#[derive(Debug)]
pub struct ChunkResult {
    pub descriptor: ChunkDescriptor,
    pub outcome: Result<Bytes, FetchError>,
}

/// Exponential backoff between retries of the same chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Delay before the retry that follows failure number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

/// Immutable description of one transfer, fixed once probing is done.
#[derive(Debug, Clone)]
pub struct TransferManifest {
    pub url: Arc<str>,
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub chunk_size: u64,
    pub concurrency_limit: usize,
    pub retry_ceiling: u32,
    pub backoff: BackoffPolicy,
}

impl TransferManifest {
    /// Whether fetches should carry a `Range` header for this plan.
    pub fn ranged_for(&self, plan: &[ChunkDescriptor]) -> bool {
        self.supports_ranges && self.total_size.is_some() && plan.len() > 1
    }

    /// Number of workers allowed for this plan. Unranged plans always get one.
    pub fn effective_concurrency(&self, plan: &[ChunkDescriptor]) -> usize {
        if self.ranged_for(plan) {
            self.concurrency_limit.max(1)
        } else {
            1
        }
    }
}

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Probing,
    Planning,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            // Created -> Failed only for a configuration that fails validation.
            (Created, Probing) | (Created, Failed) => true,
            (Probing, Planning) | (Probing, Failed) => true,
            (Planning, Transferring) => true,
            (Transferring, Completed) | (Transferring, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Point-in-time view of a session, published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub state: SessionState,
    /// Bytes flushed to the sink in final order.
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub chunks_done: usize,
    pub chunks_total: usize,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: SessionState::Created,
            bytes_done: 0,
            bytes_total: None,
            chunks_done: 0,
            chunks_total: 0,
        }
    }

    /// Progress as a fraction from 0.0 to 1.0, if the total is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.bytes_total {
            Some(0) => Some(if self.state == SessionState::Completed { 1.0 } else { 0.0 }),
            Some(total) => Some(self.bytes_done as f32 / total as f32),
            None if self.state == SessionState::Completed => Some(1.0),
            None => None,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the assembled bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutput {
    Memory(Bytes),
    File(PathBuf),
}

impl TransferOutput {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Memory(bytes) => Some(bytes),
            Self::File(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (1..=7).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn backoff_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [SessionState::Completed, SessionState::Cancelled, SessionState::Failed] {
            for next in [
                SessionState::Created,
                SessionState::Probing,
                SessionState::Transferring,
                SessionState::Completed,
                SessionState::Cancelled,
                SessionState::Failed,
            ] {
                assert!(!terminal.can_advance_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn cancellation_allowed_from_every_live_state() {
        for live in [
            SessionState::Created,
            SessionState::Probing,
            SessionState::Planning,
            SessionState::Transferring,
        ] {
            assert!(live.can_advance_to(SessionState::Cancelled));
        }
        assert!(!SessionState::Created.can_advance_to(SessionState::Transferring));
    }

    #[test]
    fn unranged_plans_run_on_one_worker() {
        let manifest = TransferManifest {
            url: Arc::from("http://example.invalid/file"),
            total_size: Some(100),
            supports_ranges: false,
            chunk_size: 10,
            concurrency_limit: 8,
            retry_ceiling: 3,
            backoff: BackoffPolicy::default(),
        };
        let plan = vec![ChunkDescriptor { index: 0, offset: 0, length: Some(100) }];
        assert!(!manifest.ranged_for(&plan));
        assert_eq!(manifest.effective_concurrency(&plan), 1);
    }
}

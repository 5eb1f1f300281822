use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::integrity::{digests_match, StreamDigest};
use crate::models::{ChunkDescriptor, TransferOutput};
use crate::sink::{ChunkSink, SinkError};

#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("finished with {flushed} of {planned} chunks flushed")]
    Incomplete { flushed: usize, planned: usize },
    #[error("reassembly cancelled")]
    Cancelled,
}

/// Turns chunks arriving in any order into one ordered write stream.
///
/// Out-of-order chunks wait in a slot vector indexed by chunk ordinal. Every
/// accept flushes the longest ready run starting at the cursor, so the sink
/// only ever sees ascending, gap-free offsets.
pub struct Reassembler<S> {
    sink: S,
    plan: Vec<ChunkDescriptor>,
    slots: Vec<Option<Bytes>>,
    delivered: Vec<bool>,
    next_index: usize,
    cursor: u64,
    total_size: Option<u64>,
    digest: Option<StreamDigest>,
    expected_sha256: Option<String>,
}

impl<S: ChunkSink> Reassembler<S> {
    pub fn new(sink: S, plan: Vec<ChunkDescriptor>, total_size: Option<u64>) -> Self {
        let n = plan.len();
        Self {
            sink,
            plan,
            slots: vec![None; n],
            delivered: vec![false; n],
            next_index: 0,
            cursor: 0,
            total_size,
            digest: None,
            expected_sha256: None,
        }
    }

    /// Verify the assembled output against a hex SHA-256 in `finish`.
    pub fn with_expected_sha256(mut self, expected: Option<String>) -> Self {
        self.digest = expected.as_ref().map(|_| StreamDigest::new());
        self.expected_sha256 = expected;
        self
    }

    /// Take ownership of a completed chunk and flush whatever became contiguous.
    ///
    /// Returns the number of chunks flushed by this call. Duplicate or unknown
    /// indices are dropped.
    pub async fn accept(
        &mut self,
        index: usize,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<usize, ReassemblyError> {
        match self.delivered.get(index) {
            None => {
                warn!(index, planned = self.plan.len(), "dropping chunk outside the plan");
                return Ok(0);
            }
            Some(true) => {
                warn!(index, "dropping duplicate chunk");
                return Ok(0);
            }
            Some(false) => {}
        }
        self.delivered[index] = true;
        self.slots[index] = Some(data);
        self.flush_ready(cancel).await
    }

    async fn flush_ready(&mut self, cancel: &CancellationToken) -> Result<usize, ReassemblyError> {
        let mut flushed = 0;
        while self.next_index < self.slots.len() && self.slots[self.next_index].is_some() {
            if cancel.is_cancelled() {
                return Err(ReassemblyError::Cancelled);
            }
            let Some(data) = self.slots[self.next_index].take() else { break };
            let len = data.len() as u64;
            if let Some(digest) = self.digest.as_mut() {
                digest.update(&data);
            }
            self.sink.write(self.cursor, data).await?;
            self.cursor += len;
            self.next_index += 1;
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, cursor = self.cursor, next_index = self.next_index, "flushed contiguous run");
        }
        Ok(flushed)
    }

    /// Write the next piece of a single-chunk plan as soon as it arrives.
    pub async fn append_streamed(&mut self, data: Bytes, cancel: &CancellationToken) -> Result<(), ReassemblyError> {
        debug_assert_eq!(self.plan.len(), 1, "only single-chunk plans are streamed");
        if cancel.is_cancelled() {
            return Err(ReassemblyError::Cancelled);
        }
        let len = data.len() as u64;
        if let Some(digest) = self.digest.as_mut() {
            digest.update(&data);
        }
        self.sink.write(self.cursor, data).await?;
        self.cursor += len;
        Ok(())
    }

    /// Mark the streamed chunk as fully written.
    pub fn end_stream(&mut self) {
        if let Some(first) = self.delivered.first_mut() {
            *first = true;
            self.next_index = 1;
        }
    }

    /// Discard a partially streamed chunk so the next attempt starts at offset 0.
    pub async fn restart_stream(&mut self) -> Result<(), ReassemblyError> {
        self.sink.reset().await?;
        debug!(discarded = self.cursor, "restarting streamed chunk");
        self.cursor = 0;
        if self.digest.is_some() {
            self.digest = Some(StreamDigest::new());
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.next_index == self.plan.len() && self.total_size.map_or(true, |total| self.cursor == total)
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.cursor
    }

    pub fn chunks_flushed(&self) -> usize {
        self.next_index
    }

    /// Chunks received but still waiting on a predecessor.
    pub fn held(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn planned(&self) -> usize {
        self.plan.len()
    }

    /// Check integrity and finalise the sink.
    pub async fn finish(mut self) -> Result<TransferOutput, ReassemblyError> {
        if !self.is_complete() {
            let (flushed, planned) = (self.next_index, self.plan.len());
            self.sink.abort().await;
            return Err(ReassemblyError::Incomplete { flushed, planned });
        }
        if let (Some(digest), Some(expected)) = (self.digest.take(), self.expected_sha256.take()) {
            let actual = digest.finalize_hex();
            if !digests_match(&expected, &actual) {
                self.sink.abort().await;
                return Err(ReassemblyError::Integrity { expected, actual });
            }
        }
        match self.sink.finish().await {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(error = %e, "finalising output failed");
                self.sink.abort().await;
                Err(e.into())
            }
        }
    }

    /// Throw away everything written so far.
    pub async fn abort(mut self) {
        self.sink.abort().await;
    }
}

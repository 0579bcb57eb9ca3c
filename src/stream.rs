use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    digest::{short_hex, Digest},
    error::RpcError,
};

/// Identifier of a stream on its connection: the sequence number of the
/// echo call that declared it.
pub type StreamId = u64;

/// Default number of chunks folded together by a batching receiver.
pub const DEFAULT_MESSAGES_IN_BATCH: usize = 128;
/// Default number of bytes a batching receiver may hold before flushing.
pub const DEFAULT_MAX_BUF_SIZE: usize = 2 * 1024 * 1024;

/// Batching parameters of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub messages_in_batch: usize,
    pub max_buf_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            messages_in_batch: DEFAULT_MESSAGES_IN_BATCH,
            max_buf_size: DEFAULT_MAX_BUF_SIZE,
        }
    }
}

impl StreamOptions {
    /// Options of a full reassembly session: everything is one batch.
    pub fn bulk() -> Self {
        Self {
            messages_in_batch: 1 << 30,
            max_buf_size: 1 << 30,
        }
    }

    /// Options from optional client hints, defaulting what is absent.
    pub fn from_hints(messages_in_batch: Option<u64>, max_buf_size: Option<u64>) -> Self {
        let defaults = Self::default();
        let clamp = |v: u64| usize::try_from(v).unwrap_or(usize::MAX).max(1);
        Self {
            messages_in_batch: messages_in_batch
                .map(clamp)
                .unwrap_or(defaults.messages_in_batch),
            max_buf_size: max_buf_size.map(clamp).unwrap_or(defaults.max_buf_size),
        }
    }
}

/// Which receiver produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Reassemble,
    ContinueStreaming,
}

/// Verification outcome of one finished stream.
///
/// Size and hash are checked independently; both may fail at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub declared_len: u64,
    pub received_len: u64,
    pub chunks: u64,
    /// Idle notifications the session got while open.
    pub idle_events: u64,
    pub expected_hash: Digest,
    /// `None` when the payload could not be retained.
    pub actual_hash: Option<Digest>,
    pub size_mismatch: bool,
    pub hash_mismatch: bool,
    /// The session ran out of memory and dropped its buffer.
    pub overflowed: bool,
}

impl StreamReport {
    pub fn is_match(&self) -> bool {
        !self.size_mismatch && !self.hash_mismatch
    }

    /// Record the outcome in the log. Integrity failures are warnings.
    pub fn log(&self) {
        if self.size_mismatch {
            warn!(
                stream_id = self.stream_id,
                kind = ?self.kind,
                received_len = self.received_len,
                expected_len = self.declared_len,
                overflowed = self.overflowed,
                "stream data size not match"
            );
        }
        if self.hash_mismatch {
            warn!(
                stream_id = self.stream_id,
                kind = ?self.kind,
                data_len = self.declared_len,
                expected_hash = %short_hex(&self.expected_hash),
                actual_hash = %self.actual_hash.as_ref().map(short_hex).unwrap_or_default(),
                "stream data hash not match"
            );
        }
        if self.is_match() {
            debug!(
                stream_id = self.stream_id,
                kind = ?self.kind,
                bytes = self.received_len,
                chunks = self.chunks,
                idle_events = self.idle_events,
                "stream verified"
            );
        }
    }
}

/// Event callbacks of one stream session. Events arrive in order, one at a
/// time, and `on_close` runs exactly once.
pub trait StreamHandler: Send + Sync {
    /// Append one chunk. Chunks arrive in send order; no validation happens
    /// here because partial digests are not comparable to the final one.
    fn on_chunk(&mut self, id: StreamId, chunk: Bytes);

    /// Nothing arrived for `idle_for`. Informational only.
    fn on_idle(&mut self, id: StreamId, idle_for: Duration);

    /// The producer closed the stream. Consumes the session.
    fn on_close(self: Box<Self>, id: StreamId) -> StreamReport;
}

/// The transport side of stream acceptance, bound to one call.
pub trait StreamAcceptor {
    /// Accept the stream declared by the current call. The transport checks
    /// `declared_len` against its limits before `make_handler` runs, so a
    /// refused stream never allocates its buffer.
    fn accept_stream<F>(
        &mut self,
        declared_len: u64,
        make_handler: F,
    ) -> Result<StreamId, RpcError<String>>
    where
        F: FnOnce() -> Result<Box<dyn StreamHandler>, RpcError<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_hints() {
        assert_eq!(StreamOptions::from_hints(None, None), StreamOptions::default());
        let options = StreamOptions::from_hints(Some(4), Some(0));
        assert_eq!(options.messages_in_batch, 4);
        assert_eq!(options.max_buf_size, 1);
    }

    #[test]
    fn test_report_match() {
        let mut report = StreamReport {
            stream_id: 1,
            kind: StreamKind::Reassemble,
            declared_len: 0,
            received_len: 0,
            chunks: 0,
            idle_events: 0,
            expected_hash: [0; 32],
            actual_hash: Some([0; 32]),
            size_mismatch: false,
            hash_mismatch: false,
            overflowed: false,
        };
        assert!(report.is_match());
        report.hash_mismatch = true;
        assert!(!report.is_match());
    }
}

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    digest::{Digest, Hasher},
    error::RpcError,
    message::EchoRequest,
    stream::{StreamHandler, StreamId, StreamKind, StreamOptions, StreamReport},
};

/// Continue-streaming session. Never holds the whole transfer: chunks are
/// folded into an incremental digest batch by batch.
pub struct ContinueStreamReceiver {
    declared_len: u64,
    expected_hash: Digest,
    options: StreamOptions,
    pending: Vec<Bytes>,
    pending_bytes: usize,
    hasher: Hasher,
    seq: u64,
    batches: u64,
    received_len: u64,
    idle_events: u64,
}

impl ContinueStreamReceiver {
    /// Bind a receiver to a request declaring `continue_streaming_size`.
    /// Batching follows the request's hints when present.
    pub fn new(request: &EchoRequest) -> Result<Self, RpcError<String>> {
        let declared_len = request.continue_streaming_size.ok_or_else(|| {
            RpcError::InvalidRequest("continue_streaming_size is not declared".to_string())
        })?;
        let expected_hash = request
            .hash
            .ok_or_else(|| RpcError::InvalidRequest("hash is not declared".to_string()))?;
        let options = StreamOptions::from_hints(
            request.streaming_messages_in_batch,
            request.streaming_max_buf_size,
        );

        Ok(Self {
            declared_len,
            expected_hash,
            options,
            pending: Vec::new(),
            pending_bytes: 0,
            hasher: Hasher::new(),
            seq: 0,
            batches: 0,
            received_len: 0,
            idle_events: 0,
        })
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    fn flush(&mut self, id: StreamId) {
        if self.pending.is_empty() {
            return;
        }
        for chunk in self.pending.drain(..) {
            self.hasher.update(&chunk);
        }
        self.batches += 1;
        debug!(
            stream_id = id,
            batch = self.batches,
            bytes = self.pending_bytes,
            "continue stream batch consumed"
        );
        self.pending_bytes = 0;
    }
}

impl StreamHandler for ContinueStreamReceiver {
    fn on_chunk(&mut self, id: StreamId, chunk: Bytes) {
        self.seq += 1;
        self.received_len += chunk.len() as u64;
        self.pending_bytes += chunk.len();
        self.pending.push(chunk);
        if self.pending.len() >= self.options.messages_in_batch
            || self.pending_bytes >= self.options.max_buf_size
        {
            self.flush(id);
        }
    }

    fn on_idle(&mut self, id: StreamId, idle_for: Duration) {
        self.idle_events += 1;
        info!(
            stream_id = id,
            idle_ms = idle_for.as_millis() as u64,
            received_len = self.received_len,
            "continue stream has no data transmission for a while"
        );
    }

    fn on_close(mut self: Box<Self>, id: StreamId) -> StreamReport {
        self.flush(id);
        let actual_hash = self.hasher.finalize();

        StreamReport {
            stream_id: id,
            kind: StreamKind::ContinueStreaming,
            declared_len: self.declared_len,
            received_len: self.received_len,
            chunks: self.seq,
            idle_events: self.idle_events,
            expected_hash: self.expected_hash,
            actual_hash: Some(actual_hash),
            size_mismatch: self.received_len != self.declared_len,
            hash_mismatch: actual_hash != self.expected_hash,
            overflowed: false,
        }
    }
}

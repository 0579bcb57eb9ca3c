use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use crate::{
    digest::{hash, Digest, Hasher},
    error::RpcError,
    message::EchoRequest,
    stream::{StreamHandler, StreamId, StreamKind, StreamReport},
};

/// Session state of one streamed transfer.
///
/// Owns the declaration it was accepted for and a buffer pre-sized to the
/// declared total. The buffer never grows past that total: once more bytes
/// arrive, the buffered prefix and everything after it go through an
/// incremental digest instead. Verification happens only in
/// [`StreamHandler::on_close`].
pub struct StreamReceiver {
    request: EchoRequest,
    declared_len: u64,
    expected_hash: Digest,
    data: Vec<u8>,
    /// Set once the stream outgrew its declaration.
    excess: Option<Hasher>,
    seq: u64,
    received_len: u64,
    idle_events: u64,
    overflowed: bool,
}

impl StreamReceiver {
    /// Bind a receiver to a request declaring `streaming_size` and `hash`.
    pub fn new(request: EchoRequest) -> Result<Self, RpcError<String>> {
        let declared_len = request.streaming_size.ok_or_else(|| {
            RpcError::InvalidRequest("streaming_size is not declared".to_string())
        })?;
        let expected_hash = request
            .hash
            .ok_or_else(|| RpcError::InvalidRequest("hash is not declared".to_string()))?;

        let capacity = usize::try_from(declared_len).map_err(|_| {
            RpcError::StreamRegistration(format!("streaming_size {} is too large", declared_len))
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|err| {
            RpcError::StreamRegistration(format!(
                "Fail to reserve {} bytes for stream: {}",
                declared_len, err
            ))
        })?;

        Ok(Self {
            request,
            declared_len,
            expected_hash,
            data,
            excess: None,
            seq: 0,
            received_len: 0,
            idle_events: 0,
            overflowed: false,
        })
    }

    /// The declaration this session was accepted for.
    pub fn request(&self) -> &EchoRequest {
        &self.request
    }

    pub fn received_len(&self) -> u64 {
        self.received_len
    }

    /// Bytes currently held in memory.
    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }
}

impl StreamHandler for StreamReceiver {
    fn on_chunk(&mut self, id: StreamId, chunk: Bytes) {
        self.seq += 1;
        self.received_len += chunk.len() as u64;
        if self.overflowed {
            return;
        }
        if let Some(hasher) = self.excess.as_mut() {
            hasher.update(&chunk);
            return;
        }
        if self.received_len > self.declared_len {
            warn!(
                stream_id = id,
                expected_len = self.declared_len,
                received_len = self.received_len,
                "stream data exceeds declared size, no longer buffering"
            );
            let mut hasher = Hasher::new();
            hasher.update(&self.data);
            hasher.update(&chunk);
            self.data = Vec::new();
            self.excess = Some(hasher);
            return;
        }
        if let Err(err) = self.data.try_reserve(chunk.len()) {
            warn!(
                stream_id = id,
                buffered = self.data.len(),
                chunk_len = chunk.len(),
                error = %err,
                "stream buffer allocation failed, dropping payload"
            );
            self.overflowed = true;
            self.data = Vec::new();
            return;
        }
        self.data.extend_from_slice(&chunk);
    }

    fn on_idle(&mut self, id: StreamId, idle_for: Duration) {
        self.idle_events += 1;
        info!(
            stream_id = id,
            idle_ms = idle_for.as_millis() as u64,
            received_len = self.received_len,
            "stream has no data transmission for a while"
        );
    }

    fn on_close(self: Box<Self>, id: StreamId) -> StreamReport {
        let actual_hash = match (&self.excess, self.overflowed) {
            (_, true) => None,
            (Some(hasher), false) => Some(hasher.finalize()),
            (None, false) => Some(hash(&self.data)),
        };
        let size_mismatch = self.overflowed || self.received_len != self.declared_len;
        let hash_mismatch = actual_hash.map_or(true, |actual| actual != self.expected_hash);

        StreamReport {
            stream_id: id,
            kind: StreamKind::Reassemble,
            declared_len: self.declared_len,
            received_len: self.received_len,
            chunks: self.seq,
            idle_events: self.idle_events,
            expected_hash: self.expected_hash,
            actual_hash,
            size_mismatch,
            hash_mismatch,
            overflowed: self.overflowed,
        }
    }
}

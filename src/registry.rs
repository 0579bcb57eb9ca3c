use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    error::RpcError,
    stream::{StreamHandler, StreamId, StreamReport},
};

/// Capacity of the report channel; slow subscribers lose the oldest.
const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// Key of a session: streams ids are only unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub conn_id: u64,
    pub stream_id: StreamId,
}

struct Session {
    handler: Box<dyn StreamHandler>,
    last_active: Instant,
}

/// Open stream sessions of a server. A session lives here from acceptance
/// until its close event; closing removes it and consumes the handler.
pub struct StreamRegistry {
    sessions: DashMap<StreamKey, Session>,
    reports: broadcast::Sender<StreamReport>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            reports,
        }
    }

    /// Register a freshly accepted session.
    pub fn register(
        &self,
        key: StreamKey,
        handler: Box<dyn StreamHandler>,
    ) -> Result<(), RpcError<String>> {
        match self.sessions.entry(key) {
            Entry::Occupied(_) => Err(RpcError::StreamRegistration(format!(
                "Stream {} is already accepted on connection {}",
                key.stream_id, key.conn_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Session {
                    handler,
                    last_active: Instant::now(),
                });
                info!(
                    conn_id = key.conn_id,
                    stream_id = key.stream_id,
                    "stream accepted"
                );
                Ok(())
            }
        }
    }

    /// Hand a chunk to its session. Returns false for unknown streams.
    pub fn deliver(&self, key: StreamKey, chunk: Bytes) -> bool {
        match self.sessions.get_mut(&key) {
            Some(mut session) => {
                session.last_active = Instant::now();
                session.handler.on_chunk(key.stream_id, chunk);
                true
            }
            None => false,
        }
    }

    /// Tell every session of a connection that got no chunk for at least
    /// `idle_timeout`. Other traffic on the connection does not count.
    /// Returns the number of sessions notified.
    pub fn notify_idle(&self, conn_id: u64, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut notified = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.key().conn_id != conn_id {
                continue;
            }
            let idle_for = now.saturating_duration_since(entry.last_active);
            if idle_for < idle_timeout {
                continue;
            }
            let stream_id = entry.key().stream_id;
            entry.value_mut().handler.on_idle(stream_id, idle_for);
            notified += 1;
        }
        notified
    }

    /// Finalize a session: remove it, run its close callback, publish the
    /// report. Returns `None` if the stream is not open.
    pub fn close(&self, key: StreamKey) -> Option<StreamReport> {
        let (_, session) = self.sessions.remove(&key)?;
        let report = session.handler.on_close(key.stream_id);
        report.log();
        // No subscriber is fine.
        let _ = self.reports.send(report.clone());
        Some(report)
    }

    /// Close every session still open on a connection.
    pub fn close_connection(&self, conn_id: u64) -> Vec<StreamReport> {
        let keys: Vec<StreamKey> = self
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| key.conn_id == conn_id)
            .collect();
        if !keys.is_empty() {
            debug!(conn_id, streams = keys.len(), "closing streams of connection");
        }
        keys.into_iter().filter_map(|key| self.close(key)).collect()
    }

    /// Close every open session.
    pub fn close_all(&self) -> Vec<StreamReport> {
        let keys: Vec<StreamKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        keys.into_iter().filter_map(|key| self.close(key)).collect()
    }

    /// Receive the report of every stream closed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamReport> {
        self.reports.subscribe()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Wait until every session is closed or `window` elapses.
    /// Returns true when the registry drained in time.
    pub async fn drain(&self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{digest::hash, message::EchoRequest, receiver::StreamReceiver, stream::StreamKind};

    fn key(conn_id: u64, stream_id: u64) -> StreamKey {
        StreamKey { conn_id, stream_id }
    }

    fn receiver(payload: &[u8]) -> Box<dyn StreamHandler> {
        let request = EchoRequest::streaming(payload.len() as u64, hash(payload));
        Box::new(StreamReceiver::new(request).unwrap())
    }

    #[test]
    fn test_interleaved_sessions_stay_independent() {
        let registry = StreamRegistry::new();
        let a = b"first stream payload".to_vec();
        let b = b"second, somewhat longer, stream payload".to_vec();
        registry.register(key(1, 1), receiver(&a)).unwrap();
        registry.register(key(1, 2), receiver(&b)).unwrap();

        let mut a_chunks = a.chunks(3);
        let mut b_chunks = b.chunks(5);
        loop {
            let next_a = a_chunks.next();
            let next_b = b_chunks.next();
            if next_a.is_none() && next_b.is_none() {
                break;
            }
            if let Some(chunk) = next_a {
                assert!(registry.deliver(key(1, 1), Bytes::copy_from_slice(chunk)));
            }
            if let Some(chunk) = next_b {
                assert!(registry.deliver(key(1, 2), Bytes::copy_from_slice(chunk)));
            }
        }

        let report_b = registry.close(key(1, 2)).unwrap();
        let report_a = registry.close(key(1, 1)).unwrap();
        assert!(report_a.is_match());
        assert!(report_b.is_match());
        assert_eq!(report_a.received_len, a.len() as u64);
        assert_eq!(report_b.received_len, b.len() as u64);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_stream_id_on_different_connections() {
        let registry = StreamRegistry::new();
        registry.register(key(1, 7), receiver(b"aa")).unwrap();
        registry.register(key(2, 7), receiver(b"bbb")).unwrap();
        registry.deliver(key(1, 7), Bytes::from_static(b"aa"));
        registry.deliver(key(2, 7), Bytes::from_static(b"bbb"));
        assert!(registry.close(key(1, 7)).unwrap().is_match());
        assert!(registry.close(key(2, 7)).unwrap().is_match());
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let registry = StreamRegistry::new();
        registry.register(key(1, 1), receiver(b"")).unwrap();
        let err = registry.register(key(1, 1), receiver(b"")).unwrap_err();
        assert!(matches!(err, RpcError::StreamRegistration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_delivery_after_close() {
        let registry = StreamRegistry::new();
        registry.register(key(1, 1), receiver(b"")).unwrap();
        assert!(registry.close(key(1, 1)).unwrap().is_match());
        assert!(!registry.deliver(key(1, 1), Bytes::from_static(b"late")));
        assert!(registry.close(key(1, 1)).is_none());
    }

    #[tokio::test]
    async fn test_reports_are_published() {
        let registry = StreamRegistry::new();
        let mut reports = registry.subscribe();
        registry.register(key(3, 1), receiver(&[0u8; 10])).unwrap();
        registry.deliver(key(3, 1), Bytes::from_static(&[0u8; 5]));
        registry.close(key(3, 1));

        let report = reports.recv().await.unwrap();
        assert_eq!(report.kind, StreamKind::Reassemble);
        assert!(report.size_mismatch);
        assert_eq!(report.received_len, 5);
    }

    #[test]
    fn test_close_connection_only_touches_its_streams() {
        let registry = StreamRegistry::new();
        registry.register(key(1, 1), receiver(b"x")).unwrap();
        registry.register(key(1, 2), receiver(b"y")).unwrap();
        registry.register(key(2, 1), receiver(b"z")).unwrap();

        let reports = registry.close_connection(1);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.size_mismatch));
        assert!(registry.contains(&key(2, 1)));
        assert_eq!(registry.close_all().len(), 1);
        assert!(registry.is_empty());
    }

    struct IdleCounter {
        idles: Arc<AtomicUsize>,
    }

    impl StreamHandler for IdleCounter {
        fn on_chunk(&mut self, _id: StreamId, _chunk: Bytes) {}

        fn on_idle(&mut self, _id: StreamId, _idle_for: Duration) {
            self.idles.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(self: Box<Self>, id: StreamId) -> StreamReport {
            StreamReport {
                stream_id: id,
                kind: StreamKind::Reassemble,
                declared_len: 0,
                received_len: 0,
                chunks: 0,
                idle_events: self.idles.load(Ordering::SeqCst) as u64,
                expected_hash: hash(&[]),
                actual_hash: Some(hash(&[])),
                size_mismatch: false,
                hash_mismatch: false,
                overflowed: false,
            }
        }
    }

    #[test]
    fn test_idle_notification_is_per_connection() {
        let registry = StreamRegistry::new();
        let idles = Arc::new(AtomicUsize::new(0));
        registry
            .register(key(1, 1), Box::new(IdleCounter { idles: idles.clone() }))
            .unwrap();
        registry
            .register(key(2, 1), Box::new(IdleCounter { idles: idles.clone() }))
            .unwrap();

        assert_eq!(registry.notify_idle(1, Duration::ZERO), 1);
        assert_eq!(idles.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_idle_notification_skips_active_streams() {
        let registry = StreamRegistry::new();
        let idles = Arc::new(AtomicUsize::new(0));
        registry
            .register(key(1, 1), Box::new(IdleCounter { idles: idles.clone() }))
            .unwrap();
        registry
            .register(key(1, 2), Box::new(IdleCounter { idles: idles.clone() }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        registry.deliver(key(1, 2), Bytes::from_static(b"fresh"));

        assert_eq!(registry.notify_idle(1, Duration::from_millis(50)), 1);
        assert_eq!(idles.load(Ordering::SeqCst), 1);
        let silent = registry.close(key(1, 1)).unwrap();
        assert_eq!(silent.idle_events, 1);
    }

    #[tokio::test]
    async fn test_drain_times_out_with_open_streams() {
        let registry = StreamRegistry::new();
        assert!(registry.drain(Duration::from_millis(10)).await);
        registry.register(key(1, 1), receiver(b"")).unwrap();
        assert!(!registry.drain(Duration::from_millis(50)).await);
    }
}

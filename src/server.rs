use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, watch},
    task::{self, JoinSet},
    time::{interval_at, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    common::{StreamLimits, TimeoutOptions},
    error::RpcError,
    message::{
        decode_echo_request, encode_call_body, encode_echo_response, encode_error_response,
        split_call_body, EchoRequest, EchoResponse, ErrorResponse,
    },
    packet::{encode_resp_frame, Decode, ReqHeader, ReqType, RespType, REQ_HEADER_SIZE},
    registry::{StreamKey, StreamRegistry},
    service::EchoService,
    stream::{StreamAcceptor, StreamHandler, StreamId},
    workerpool::{Job, WorkerPool},
};

/// Default graceful shutdown window.
pub const DEFAULT_LOGOFF: Duration = Duration::from_millis(2000);

/// Capacity of the per-connection response queue.
const DONE_CHANNEL_CAPACITY: usize = 1000;

/// Build an error response frame for a failed call.
fn error_frame(seq: u64, err: &RpcError<String>) -> Vec<u8> {
    let body = encode_error_response(&ErrorResponse::from(err));
    encode_resp_frame(seq, RespType::ErrorResponse, &body)
}

/// Build a successful call response frame.
fn call_frame(seq: u64, resp_type: RespType, resp: &EchoResponse, attachment: &[u8]) -> Vec<u8> {
    let body = encode_call_body(&encode_echo_response(resp), attachment);
    encode_resp_frame(seq, resp_type, &body)
}

/// Aborts the wrapped task when dropped, including when the owning
/// connection task is cancelled.
struct AbortOnDrop(task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The context of one call, able to accept the stream the call declares.
pub struct CallContext {
    conn_id: u64,
    seq: u64,
    max_stream_size: u64,
    registry: Arc<StreamRegistry>,
    accepted: Option<StreamId>,
}

impl CallContext {
    pub fn new(conn_id: u64, seq: u64, max_stream_size: u64, registry: Arc<StreamRegistry>) -> Self {
        Self {
            conn_id,
            seq,
            max_stream_size,
            registry,
            accepted: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn accepted_stream(&self) -> Option<StreamId> {
        self.accepted
    }
}

impl StreamAcceptor for CallContext {
    fn accept_stream<F>(&mut self, declared_len: u64, make_handler: F) -> Result<StreamId, RpcError<String>>
    where
        F: FnOnce() -> Result<Box<dyn StreamHandler>, RpcError<String>>,
    {
        if self.accepted.is_some() {
            return Err(RpcError::StreamRegistration(
                "Fail to accept stream: call already has a stream".to_string(),
            ));
        }
        if declared_len > self.max_stream_size {
            return Err(RpcError::StreamRegistration(format!(
                "Fail to accept stream: declared size {} exceeds limit {}",
                declared_len, self.max_stream_size
            )));
        }
        let key = StreamKey {
            conn_id: self.conn_id,
            stream_id: self.seq,
        };
        self.registry.register(key, make_handler()?)?;
        self.accepted = Some(self.seq);
        Ok(self.seq)
    }
}

/// The handler for the RPC ask-echo request.
pub struct AskEchoHandler {
    seq: u64,
    request: EchoRequest,
    service: Arc<EchoService>,
    done_tx: mpsc::Sender<Vec<u8>>,
}

impl AskEchoHandler {
    pub fn new(
        seq: u64,
        request: EchoRequest,
        service: Arc<EchoService>,
        done_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            seq,
            request,
            service,
            done_tx,
        }
    }
}

#[async_trait]
impl Job for AskEchoHandler {
    async fn run(&self) {
        debug!(seq = self.seq, "AskEchoHandler::run");
        let frame = match self.service.ask_echo(&self.request) {
            Ok((resp, attachment)) => {
                call_frame(self.seq, RespType::AskEchoResponse, &resp, &attachment)
            }
            Err(err) => {
                warn!(seq = self.seq, error = %err, "ask echo failed");
                error_frame(self.seq, &err)
            }
        };

        if self.done_tx.send(frame).await.is_err() {
            debug!(seq = self.seq, "connection closed before ask echo response was sent");
        }
    }
}

#[async_trait]
pub trait RpcServerConnectionHandler {
    async fn dispatch(
        &self,
        call: CallContext,
        req_header: ReqHeader,
        req_buffer: Bytes,
        done_tx: mpsc::Sender<Vec<u8>>,
    );
}

/// The echo handler for the RPC server.
#[derive(Clone)]
pub struct EchoRpcServerHandler {
    worker_pool: Arc<WorkerPool>,
    service: Arc<EchoService>,
}

impl EchoRpcServerHandler {
    pub fn new(worker_pool: Arc<WorkerPool>, service: EchoService) -> Self {
        Self {
            worker_pool,
            service: Arc::new(service),
        }
    }

    fn handle_echo(
        &self,
        call: &mut CallContext,
        req_buffer: &Bytes,
    ) -> Result<EchoResponse, RpcError<String>> {
        let (message, attachment) = split_call_body(req_buffer)?;
        let request = decode_echo_request(&message)?;
        self.service.echo(call, request, attachment)
    }
}

#[async_trait]
impl RpcServerConnectionHandler for EchoRpcServerHandler {
    async fn dispatch(
        &self,
        mut call: CallContext,
        req_header: ReqHeader,
        req_buffer: Bytes,
        done_tx: mpsc::Sender<Vec<u8>>,
    ) {
        let seq = req_header.seq;
        match ReqType::from_u8(req_header.op) {
            Ok(ReqType::EchoRequest) => {
                // Runs inline so a declared stream is registered before the
                // next frame of this connection is read.
                let frame = match self.handle_echo(&mut call, &req_buffer) {
                    Ok(resp) => call_frame(seq, RespType::EchoResponse, &resp, &[]),
                    Err(err) => {
                        warn!(seq, error = %err, "echo failed");
                        error_frame(seq, &err)
                    }
                };
                if done_tx.send(frame).await.is_err() {
                    debug!(seq, "connection closed before echo response was sent");
                }
            }
            Ok(ReqType::AskEchoRequest) => {
                let request = match split_call_body(&req_buffer)
                    .and_then(|(message, _)| decode_echo_request(&message))
                {
                    Ok(request) => request,
                    Err(err) => {
                        let _ = done_tx.send(error_frame(seq, &err)).await;
                        return;
                    }
                };
                let handler =
                    AskEchoHandler::new(seq, request, self.service.clone(), done_tx.clone());
                if let Err(err) = self.worker_pool.submit_job_async(Box::new(handler)).await {
                    error!(seq, error = %err, "Failed to submit job");
                    let _ = done_tx.send(error_frame(seq, &err)).await;
                }
            }
            _ => {
                debug!(
                    "EchoRpcServerHandler: Inner request type is not matched: {:?}",
                    req_header.op
                );
            }
        }
    }
}

/// The connection for the RPC server.
pub struct RpcServerConnection<T>
where
    T: RpcServerConnectionHandler + Send + Sync + 'static,
{
    conn_id: u64,
    reader: OwnedReadHalf,
    writer: Option<OwnedWriteHalf>,
    /// Options for the timeout of the connection
    timeout_options: TimeoutOptions,
    limits: StreamLimits,
    registry: Arc<StreamRegistry>,
    /// The handler for the connection
    dispatch_handler: T,
}

impl<T> RpcServerConnection<T>
where
    T: RpcServerConnectionHandler + Send + Sync + 'static,
{
    /// Create a new RPC server connection.
    pub fn new(
        conn_id: u64,
        stream: TcpStream,
        timeout_options: TimeoutOptions,
        limits: StreamLimits,
        registry: Arc<StreamRegistry>,
        dispatch_handler: T,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            conn_id,
            reader,
            writer: Some(writer),
            timeout_options,
            limits,
            registry,
            dispatch_handler,
        }
    }

    /// Recv request header from the stream.
    ///
    /// Waits in `idle_timeout` slices so the connection idle limit can be
    /// checked; partial reads survive each slice.
    async fn recv_header(&mut self, last_frame: Instant) -> Result<ReqHeader, RpcError<String>> {
        let mut buf = [0u8; REQ_HEADER_SIZE as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match timeout(
                self.timeout_options.idle_timeout,
                self.reader.read(&mut buf[filled..]),
            )
            .await
            {
                Ok(Ok(0)) => {
                    return Err(RpcError::InternalError("Connection closed by peer".to_string()));
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    debug!(conn_id = self.conn_id, "connection is idle");
                    if let Some(limit) = self.limits.connection_idle_timeout {
                        if last_frame.elapsed() >= limit {
                            return Err(RpcError::Timeout(format!(
                                "No request for {:?}, closing connection",
                                limit
                            )));
                        }
                    }
                }
            }
        }
        ReqHeader::decode(&buf)
    }

    /// Recv request body from the stream
    async fn recv_len(&mut self, len: u64) -> Result<Bytes, RpcError<String>> {
        if len > self.limits.max_frame_len {
            return Err(RpcError::InternalError(format!(
                "Frame length {} exceeds limit {}",
                len, self.limits.max_frame_len
            )));
        }
        let len = usize::try_from(len)
            .map_err(|_| RpcError::InternalError("Frame length overflow".to_string()))?;
        let mut req_buffer = vec![0u8; len];
        match timeout(
            self.timeout_options.read_timeout,
            self.reader.read_exact(&mut req_buffer),
        )
        .await
        {
            Ok(Ok(_)) => Ok(Bytes::from(req_buffer)),
            Ok(Err(err)) => {
                debug!("Failed to receive request body: {:?}", err);
                Err(err.into())
            }
            Err(_) => {
                debug!("Timeout to receive request body");
                Err(RpcError::Timeout(
                    "Timeout to receive request body".to_string(),
                ))
            }
        }
    }

    /// Send responses from the done channel to the stream, in queue order.
    fn spawn_writer(
        &mut self,
        mut done_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Option<task::JoinHandle<()>> {
        let mut writer = self.writer.take()?;
        let write_timeout = self.timeout_options.write_timeout;
        let conn_id = self.conn_id;
        Some(tokio::spawn(async move {
            while let Some(resp_buffer) = done_rx.recv().await {
                match timeout(write_timeout, writer.write_all(&resp_buffer)).await {
                    Ok(Ok(())) => debug!(conn_id, len = resp_buffer.len(), "Sent response"),
                    Ok(Err(err)) => {
                        info!(conn_id, error = %err, "Failed to send response");
                        break;
                    }
                    Err(_) => {
                        info!(conn_id, "Timeout to send response");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
            debug!(conn_id, "done_rx channel is closed");
        }))
    }

    /// Notify streams of this connection that got no chunk for
    /// `idle_timeout`, checked once per `idle_timeout`.
    fn spawn_idle_watcher(&self) -> AbortOnDrop {
        let registry = self.registry.clone();
        let conn_id = self.conn_id;
        let period = self.timeout_options.idle_timeout.max(Duration::from_millis(1));
        AbortOnDrop(tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let notified = registry.notify_idle(conn_id, period);
                if notified > 0 {
                    debug!(conn_id, notified, "notified idle streams");
                }
            }
        }))
    }

    /// Handle one frame. Returns false when the connection must be closed.
    async fn dispatch(&mut self, req_header: ReqHeader, done_tx: &mpsc::Sender<Vec<u8>>) -> bool {
        let req_buffer = match self.recv_len(req_header.len).await {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(conn_id = self.conn_id, "Failed to receive request body: {:?}", err);
                return false;
            }
        };
        let key = StreamKey {
            conn_id: self.conn_id,
            stream_id: req_header.seq,
        };

        match ReqType::from_u8(req_header.op) {
            Ok(ReqType::KeepAliveRequest) => {
                // Keep-alive is answered by the connection directly.
                let frame = encode_resp_frame(req_header.seq, RespType::KeepAliveResponse, &[]);
                if done_tx.send(frame).await.is_err() {
                    error!("Failed to send keepalive response");
                    return false;
                }
            }
            Ok(ReqType::StreamData) => {
                if !self.registry.deliver(key, req_buffer) {
                    debug!(stream_id = key.stream_id, "data for unknown stream dropped");
                }
            }
            Ok(ReqType::StreamClose) => {
                if self.registry.close(key).is_none() {
                    debug!(stream_id = key.stream_id, "close for unknown stream ignored");
                }
            }
            Ok(_) => {
                let call = CallContext::new(
                    self.conn_id,
                    req_header.seq,
                    self.limits.max_stream_size,
                    self.registry.clone(),
                );
                self.dispatch_handler
                    .dispatch(call, req_header, req_buffer, done_tx.clone())
                    .await;
            }
            Err(err) => {
                debug!("Inner request type is not matched: {:?}", err);
            }
        }
        true
    }

    /// Serve the connection until the peer leaves or a frame fails.
    pub async fn run(mut self) {
        debug!(conn_id = self.conn_id, "RpcServerConnection::run");

        let (done_tx, done_rx) = mpsc::channel::<Vec<u8>>(DONE_CHANNEL_CAPACITY);
        let writer = self.spawn_writer(done_rx);
        let idle_watcher = self.spawn_idle_watcher();

        let mut last_frame = Instant::now();
        loop {
            let req_header = match self.recv_header(last_frame).await {
                Ok(header) => {
                    debug!("Received request header: {:?}", header);
                    header
                }
                Err(err) => {
                    debug!(conn_id = self.conn_id, "Failed to receive request header: {:?}", err);
                    break;
                }
            };
            last_frame = Instant::now();

            if !self.dispatch(req_header, &done_tx).await {
                break;
            }
        }

        drop(idle_watcher);
        // Every stream still open on this connection gets its close event.
        let reports = self.registry.close_connection(self.conn_id);
        if !reports.is_empty() {
            info!(conn_id = self.conn_id, streams = reports.len(), "closed streams of finished connection");
        }
        drop(done_tx);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        debug!(conn_id = self.conn_id, "connection finished");
    }
}

/// The RPC server definition.
pub struct RpcServer<T>
where
    T: RpcServerConnectionHandler + Send + Sync + Clone + 'static,
{
    /// Options for the timeout of the server connection
    timeout_options: TimeoutOptions,
    limits: StreamLimits,
    /// Graceful shutdown window for open streams
    logoff: Duration,
    /// Main worker for the server
    main_worker: Option<task::JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    local_addr: Option<SocketAddr>,
    registry: Arc<StreamRegistry>,
    /// The handler for the connection
    dispatch_handler: T,
}

impl<T> RpcServer<T>
where
    T: RpcServerConnectionHandler + Send + Sync + Clone + 'static,
{
    /// Create a new RPC server.
    pub fn new(timeout_options: TimeoutOptions, limits: StreamLimits, dispatch_handler: T) -> Self {
        Self {
            timeout_options,
            limits,
            logoff: DEFAULT_LOGOFF,
            main_worker: None,
            shutdown_tx: None,
            local_addr: None,
            registry: Arc::new(StreamRegistry::new()),
            dispatch_handler,
        }
    }

    /// Set the graceful shutdown window.
    pub fn with_logoff(mut self, logoff: Duration) -> Self {
        self.logoff = logoff;
        self
    }

    /// The stream registry shared by every connection of this server.
    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    /// Address the server is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the RPC server.
    pub async fn listen(&mut self, addr: &str) -> Result<(), RpcError<String>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {:?}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let timeout_options = self.timeout_options.clone();
        let limits = self.limits.clone();
        let registry = self.registry.clone();
        let dispatch_handler = self.dispatch_handler.clone();
        let logoff = self.logoff;

        let handle = tokio::spawn(async move {
            let next_conn_id = AtomicU64::new(1);
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                            debug!(conn_id, "Accepted connection from {:?}", peer);
                            if let Err(err) = stream.set_nodelay(true) {
                                debug!(conn_id, "Failed to set nodelay: {:?}", err);
                            }
                            let conn = RpcServerConnection::new(
                                conn_id,
                                stream,
                                timeout_options.clone(),
                                limits.clone(),
                                registry.clone(),
                                dispatch_handler.clone(),
                            );
                            connections.spawn(conn.run());
                        }
                        Err(err) => {
                            debug!("Failed to accept connection: {:?}", err);
                            continue;
                        }
                    }
                }
            }

            drop(listener);
            if !registry.drain(logoff).await {
                warn!(
                    streams = registry.len(),
                    "streams still open after logoff window, closing them"
                );
            }
            connections.shutdown().await;
            registry.close_all();
            info!("server stopped");
        });

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.main_worker = Some(handle);
        Ok(())
    }

    /// Stop the RPC server: stop accepting, give open streams the logoff
    /// window to finish, then drop every connection.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.main_worker.take() {
            if let Err(err) = handle.await {
                error!("server task failed: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;
    use crate::digest::hash;
    use std::net::TcpStream;

    /// Check if the port is in use
    fn is_port_in_use(addr: &str) -> bool {
        if let Ok(stream) = TcpStream::connect(addr) {
            // Port is in use
            drop(stream);
            true
        } else {
            // Port is not in use
            false
        }
    }

    fn echo_server() -> RpcServer<EchoRpcServerHandler> {
        let pool = Arc::new(WorkerPool::new(4, 100));
        let handler = EchoRpcServerHandler::new(pool, EchoService::default());
        RpcServer::new(TimeoutOptions::default(), StreamLimits::default(), handler)
            .with_logoff(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_rpc_server() {
        let addr = "127.0.0.1:2788";
        let mut server = echo_server();
        server.listen(addr).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        assert!(is_port_in_use(addr));
        server.stop().await;
        time::sleep(Duration::from_millis(200)).await;
        assert!(!is_port_in_use(addr));
    }

    #[test]
    fn test_call_context_limits() {
        let registry = Arc::new(StreamRegistry::new());
        let mut call = CallContext::new(1, 10, 100, registry.clone());
        let make = || -> Result<Box<dyn StreamHandler>, RpcError<String>> {
            let request = EchoRequest::streaming(0, hash(&[]));
            Ok(Box::new(crate::receiver::StreamReceiver::new(request)?))
        };

        assert!(matches!(
            call.accept_stream(101, make),
            Err(RpcError::StreamRegistration(_))
        ));
        assert_eq!(call.accept_stream(0, make).unwrap(), 10);
        assert_eq!(call.accepted_stream(), Some(10));
        assert!(call.accept_stream(0, make).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_open_streams() {
        let mut server = echo_server();
        server.listen("127.0.0.1:0").await.unwrap();
        let registry = server.registry();
        let mut reports = registry.subscribe();
        let mut call = CallContext::new(99, 1, 1 << 20, registry.clone());
        call.accept_stream(4, || {
            let request = EchoRequest::streaming(4, hash(b"abcd"));
            Ok(Box::new(crate::receiver::StreamReceiver::new(request)?) as Box<dyn StreamHandler>)
        })
        .unwrap();

        server.stop().await;
        assert!(registry.is_empty());
        let report = reports.recv().await.unwrap();
        assert!(report.size_mismatch);
    }
}

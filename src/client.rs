use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use crate::{
    common::{TimeoutOptions, DEFAULT_MAX_FRAME_LEN},
    error::RpcError,
    message::{
        decode_echo_response, decode_error_response, encode_call_body, encode_echo_request,
        split_call_body, EchoRequest, EchoResponse,
    },
    packet::{encode_req_frame, Decode, Encode, ReqHeader, ReqType, RespHeader, RespType, RESP_HEADER_SIZE},
    stream::StreamId,
};

/// Capacity of the outgoing frame queue.
const REQUEST_CHANNEL_CAPACITY: usize = 1000;

/// Largest response body the client accepts.
pub const MAX_RESPONSE_LEN: u64 = DEFAULT_MAX_FRAME_LEN;

type CallResult = Result<(RespHeader, Bytes), RpcError<String>>;
type PendingCalls = DashMap<u64, oneshot::Sender<CallResult>>;

/// Send loop for the client: forwards queued frames and keeps the
/// connection alive.
async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut request_channel_rx: mpsc::Receiver<Vec<u8>>,
    timeout_options: TimeoutOptions,
    keep_alive_seq: Arc<AtomicU64>,
) {
    // Tickers to keep alive the connection
    let period = (timeout_options.idle_timeout / 3).max(Duration::from_millis(1));
    let mut tickers = tokio::time::interval(period);
    tickers.tick().await;
    loop {
        let data = tokio::select! {
            _ = tickers.tick() => {
                ReqHeader {
                    seq: keep_alive_seq.load(Ordering::Relaxed),
                    op: ReqType::KeepAliveRequest.to_u8(),
                    len: 0,
                }
                .encode()
            }
            req_result = request_channel_rx.recv() => match req_result {
                Some(req) => req,
                None => {
                    // The request channel is closed and no remaining requests
                    debug!("Request channel closed.");
                    break;
                }
            }
        };

        match timeout(timeout_options.write_timeout, writer.write_all(&data)).await {
            Ok(Ok(())) => debug!(len = data.len(), "Sent data"),
            Ok(Err(err)) => {
                debug!("Failed to send data: {:?}", err);
                break;
            }
            Err(_) => {
                debug!("Timeout to send data");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Receive loop for the client: routes responses to their pending calls.
async fn recv_loop(
    mut reader: OwnedReadHalf,
    pending: Arc<PendingCalls>,
    timeout_options: TimeoutOptions,
    keep_alive_seq: Arc<AtomicU64>,
) {
    loop {
        let mut header_buffer = [0u8; RESP_HEADER_SIZE as usize];
        if let Err(err) = reader.read_exact(&mut header_buffer).await {
            debug!("Failed to receive response header: {:?}", err);
            break;
        }
        let header = match RespHeader::decode(&header_buffer) {
            Ok(header) => header,
            Err(err) => {
                debug!("Failed to decode response header: {:?}", err);
                break;
            }
        };

        if header.len > MAX_RESPONSE_LEN {
            debug!(
                seq = header.seq,
                len = header.len,
                "Response length exceeds limit {}, closing connection",
                MAX_RESPONSE_LEN
            );
            break;
        }
        let len = match usize::try_from(header.len) {
            Ok(len) => len,
            Err(_) => {
                debug!(len = header.len, "Response length overflow");
                break;
            }
        };
        let mut body = vec![0u8; len];
        match timeout(timeout_options.read_timeout, reader.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!("Failed to receive response body: {:?}", err);
                break;
            }
            Err(_) => {
                debug!("Timeout to receive response body");
                break;
            }
        }

        match RespType::from_u8(header.op) {
            Ok(RespType::KeepAliveResponse) => {
                let current = keep_alive_seq.load(Ordering::Relaxed);
                if header.seq != current {
                    debug!("Keep alive sequence mismatch: {} != {}", header.seq, current);
                }
                // Received keep alive response, increment the keep alive sequence
                keep_alive_seq.fetch_add(1, Ordering::Relaxed);
            }
            Ok(resp_type) => {
                let result: CallResult = if resp_type == RespType::ErrorResponse {
                    match decode_error_response(&body) {
                        Ok(resp) => Err(resp.into()),
                        Err(err) => Err(err),
                    }
                } else {
                    Ok((header.clone(), Bytes::from(body)))
                };
                match pending.remove(&header.seq) {
                    Some((_, done)) => {
                        let _ = done.send(result);
                    }
                    None => debug!(seq = header.seq, "response for unknown call dropped"),
                }
            }
            Err(err) => debug!("Unknown response type: {:?}", err),
        }
    }

    // Fail every call still waiting on this connection.
    let seqs: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for seq in seqs {
        if let Some((_, done)) = pending.remove(&seq) {
            let _ = done.send(Err(RpcError::InternalError(
                "Connection closed".to_string(),
            )));
        }
    }
}

/// The RPC client definition.
pub struct RpcClient {
    /// Options for the timeout of the client connection
    timeout_options: TimeoutOptions,
    /// Request channel for buffer
    request_channel_tx: mpsc::Sender<Vec<u8>>,
    /// Calls waiting for their response, by sequence number
    pending: Arc<PendingCalls>,
    next_seq: AtomicU64,
    send_worker: JoinHandle<()>,
    recv_worker: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to an echo server.
    pub async fn connect(addr: &str, timeout_options: TimeoutOptions) -> Result<Self, RpcError<String>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (request_channel_tx, request_channel_rx) =
            mpsc::channel::<Vec<u8>>(REQUEST_CHANNEL_CAPACITY);
        let pending = Arc::new(PendingCalls::new());
        let keep_alive_seq = Arc::new(AtomicU64::new(0));

        let send_worker = tokio::spawn(send_loop(
            writer,
            request_channel_rx,
            timeout_options.clone(),
            keep_alive_seq.clone(),
        ));
        let recv_worker = tokio::spawn(recv_loop(
            reader,
            pending.clone(),
            timeout_options.clone(),
            keep_alive_seq,
        ));

        Ok(Self {
            timeout_options,
            request_channel_tx,
            pending,
            next_seq: AtomicU64::new(1),
            send_worker,
            recv_worker,
        })
    }

    /// Send an echo call. `attachment` travels beside the message and must
    /// match `request.attachment_size` when that is declared.
    pub async fn echo(
        &self,
        request: &EchoRequest,
        attachment: &[u8],
    ) -> Result<EchoResponse, RpcError<String>> {
        let seq = self.next_seq();
        let (resp, _) = self
            .call(seq, ReqType::EchoRequest, request, attachment)
            .await?;
        Ok(resp)
    }

    /// Ask the server to generate a payload. Returns the response and the
    /// attachment bytes sent with it.
    pub async fn ask_echo(
        &self,
        request: &EchoRequest,
    ) -> Result<(EchoResponse, Bytes), RpcError<String>> {
        let seq = self.next_seq();
        self.call(seq, ReqType::AskEchoRequest, request, &[]).await
    }

    /// Declare a stream with an echo call and return a writer for its
    /// chunks. The request must declare `streaming_size` or
    /// `continue_streaming_size`.
    pub async fn open_stream(&self, request: &EchoRequest) -> Result<StreamWriter, RpcError<String>> {
        if request.streaming_size.is_none() && request.continue_streaming_size.is_none() {
            return Err(RpcError::InvalidRequest(
                "Request does not declare a stream".to_string(),
            ));
        }
        let seq = self.next_seq();
        self.call(seq, ReqType::EchoRequest, request, &[]).await?;
        Ok(StreamWriter {
            stream_id: seq,
            request_channel_tx: self.request_channel_tx.clone(),
        })
    }

    /// Send a request to the server. Contains the request header and body.
    pub async fn send_request(&self, req: Vec<u8>) -> Result<(), RpcError<String>> {
        self.request_channel_tx
            .send(req)
            .await
            .map_err(|e| RpcError::InternalError(e.to_string()))
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(
        &self,
        seq: u64,
        req_type: ReqType,
        request: &EchoRequest,
        attachment: &[u8],
    ) -> Result<(EchoResponse, Bytes), RpcError<String>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.insert(seq, done_tx);

        let body = encode_call_body(&encode_echo_request(request), attachment);
        if let Err(err) = self.send_request(encode_req_frame(seq, req_type, &body)).await {
            self.pending.remove(&seq);
            return Err(err);
        }

        let (_, resp_body) = match timeout(self.timeout_options.read_timeout, done_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RpcError::InternalError("Connection closed".to_string()));
            }
            Err(_) => {
                self.pending.remove(&seq);
                return Err(RpcError::Timeout(format!("No response for call {}", seq)));
            }
        };

        let (message, attachment) = split_call_body(&resp_body)?;
        Ok((decode_echo_response(&message)?, attachment))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.send_worker.abort();
        self.recv_worker.abort();
    }
}

/// Writer for the chunks of an accepted stream.
pub struct StreamWriter {
    stream_id: StreamId,
    request_channel_tx: mpsc::Sender<Vec<u8>>,
}

impl StreamWriter {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Send one chunk. Chunks reach the server in write order.
    pub async fn write(&self, chunk: &[u8]) -> Result<(), RpcError<String>> {
        self.request_channel_tx
            .send(encode_req_frame(self.stream_id, ReqType::StreamData, chunk))
            .await
            .map_err(|e| RpcError::InternalError(e.to_string()))
    }

    /// Close the stream; the server verifies it on receipt.
    pub async fn close(self) -> Result<(), RpcError<String>> {
        self.request_channel_tx
            .send(encode_req_frame(self.stream_id, ReqType::StreamClose, &[]))
            .await
            .map_err(|e| RpcError::InternalError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::packet::{encode_resp_frame, REQ_HEADER_SIZE};

    #[tokio::test]
    async fn test_oversized_response_fails_the_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; REQ_HEADER_SIZE as usize];
            stream.read_exact(&mut header).await.unwrap();
            let req = ReqHeader::decode(&header).unwrap();
            // Claims a body far larger than any echo response.
            let mut frame = RespHeader {
                seq: req.seq,
                op: RespType::EchoResponse.to_u8(),
                len: MAX_RESPONSE_LEN + 1,
            }
            .encode();
            frame.extend_from_slice(b"short");
            stream.write_all(&frame).await.unwrap();
            // Hold the socket open so only the length check can end the call.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = RpcClient::connect(&addr, TimeoutOptions::default()).await.unwrap();
        let err = client
            .echo(&EchoRequest::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::InternalError("Connection closed".to_string()));
        server.abort();
    }

    #[tokio::test]
    async fn test_error_response_keeps_its_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; REQ_HEADER_SIZE as usize];
            stream.read_exact(&mut header).await.unwrap();
            let req = ReqHeader::decode(&header).unwrap();
            let mut body = vec![0u8; req.len as usize];
            stream.read_exact(&mut body).await.unwrap();
            let err = RpcError::InvalidRequest("unsupport request type".to_string());
            let body = crate::message::encode_error_response(&(&err).into());
            let frame = encode_resp_frame(req.seq, RespType::ErrorResponse, &body);
            stream.write_all(&frame).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = RpcClient::connect(&addr, TimeoutOptions::default()).await.unwrap();
        let err = client.ask_echo(&EchoRequest::default()).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::InvalidRequest("unsupport request type".to_string())
        );
    }
}

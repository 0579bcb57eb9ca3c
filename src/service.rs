use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    common::DEFAULT_MAX_STREAM_SIZE,
    continue_stream::ContinueStreamReceiver,
    digest::{hash, short_hex, Digest},
    error::RpcError,
    message::{EchoRequest, EchoResponse, TransferMode, ECHO_ACK},
    payload::generate,
    receiver::StreamReceiver,
    stream::{StreamAcceptor, StreamHandler},
};

/// Verifies echo payloads and generates ask-echo payloads.
#[derive(Debug, Clone)]
pub struct EchoService {
    /// Largest payload an ask-echo call may request.
    max_payload_size: u64,
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAM_SIZE)
    }
}

impl EchoService {
    pub fn new(max_payload_size: u64) -> Self {
        Self { max_payload_size }
    }

    /// Verify the payload of an echo call.
    ///
    /// Inline and attachment payloads are checked before returning. A
    /// declared stream is accepted through `call` and checked when it
    /// closes; its outcome is not part of this call's result.
    pub fn echo<A: StreamAcceptor>(
        &self,
        call: &mut A,
        request: EchoRequest,
        attachment: Bytes,
    ) -> Result<EchoResponse, RpcError<String>> {
        let modes = request.transfer_modes();
        if modes.len() > 1 {
            return Err(RpcError::InvalidRequest(format!(
                "At most one transfer mode per request, got {:?}",
                modes
            )));
        }

        match modes.first() {
            None => debug!("echo without payload"),
            Some(TransferMode::Inline) => verify_inline(&request)?,
            Some(TransferMode::Attachment) => verify_attachment(&request, &attachment)?,
            Some(TransferMode::Streaming) => {
                let declared_len = request.streaming_size.unwrap_or_default();
                expected_hash(&request)?;
                let stream_id = call.accept_stream(declared_len, move || {
                    Ok(Box::new(StreamReceiver::new(request)?) as Box<dyn StreamHandler>)
                })?;
                debug!(stream_id, declared_len, "streaming echo accepted");
            }
            Some(TransferMode::ContinueStreaming) => {
                let declared_len = request.continue_streaming_size.unwrap_or_default();
                expected_hash(&request)?;
                let stream_id = call.accept_stream(declared_len, || {
                    Ok(Box::new(ContinueStreamReceiver::new(&request)?) as Box<dyn StreamHandler>)
                })?;
                debug!(stream_id, declared_len, "continue streaming echo accepted");
            }
        }

        Ok(EchoResponse {
            ack: ECHO_ACK,
            ..Default::default()
        })
    }

    /// Generate the payload an ask-echo call requests.
    ///
    /// Returns the response and the attachment to send with it. The response
    /// hash always equals the digest of the returned bytes.
    pub fn ask_echo(&self, request: &EchoRequest) -> Result<(EchoResponse, Bytes), RpcError<String>> {
        match (request.inline_size, request.attachment_size) {
            (Some(size), None) => {
                let data = Bytes::from(generate(self.requested_len(size)?));
                let response = EchoResponse {
                    hash: Some(hash(&data)),
                    inline_size: Some(size),
                    inline_data: Some(data),
                    ..Default::default()
                };
                Ok((response, Bytes::new()))
            }
            (None, Some(size)) => {
                let data = Bytes::from(generate(self.requested_len(size)?));
                let response = EchoResponse {
                    hash: Some(hash(&data)),
                    attachment_size: Some(size),
                    ..Default::default()
                };
                Ok((response, data))
            }
            (Some(_), Some(_)) => Err(RpcError::InvalidRequest(
                "Ask echo takes either an inline or an attachment size, not both".to_string(),
            )),
            (None, None) => Err(RpcError::InvalidRequest("unsupport request type".to_string())),
        }
    }

    fn requested_len(&self, size: u64) -> Result<usize, RpcError<String>> {
        if size > self.max_payload_size {
            return Err(RpcError::InvalidRequest(format!(
                "Requested size {} exceeds limit {}",
                size, self.max_payload_size
            )));
        }
        usize::try_from(size)
            .map_err(|_| RpcError::InvalidRequest(format!("Requested size {} is too large", size)))
    }
}

fn expected_hash(request: &EchoRequest) -> Result<Digest, RpcError<String>> {
    request
        .hash
        .ok_or_else(|| RpcError::InvalidRequest("hash is not declared".to_string()))
}

fn verify_inline(request: &EchoRequest) -> Result<(), RpcError<String>> {
    let expected = expected_hash(request)?;
    let data = request.inline_data.as_deref().unwrap_or_default();
    if let Some(size) = request.inline_size {
        if size != data.len() as u64 {
            warn!(declared = size, actual = data.len(), "request data size not match");
            return Err(RpcError::ProtocolViolation(format!(
                "request data size not match! real len: {}, expect length: {}",
                data.len(),
                size
            )));
        }
    }
    let actual = hash(data);
    if actual != expected {
        warn!(
            data_len = data.len(),
            expected_hash = %short_hex(&expected),
            actual_hash = %short_hex(&actual),
            "request data hash not match"
        );
        return Err(RpcError::ProtocolViolation(format!(
            "request data hash not match! data len: {}",
            data.len()
        )));
    }
    Ok(())
}

fn verify_attachment(request: &EchoRequest, attachment: &[u8]) -> Result<(), RpcError<String>> {
    let expected = expected_hash(request)?;
    let size = request.attachment_size.unwrap_or_default();
    if size != attachment.len() as u64 {
        warn!(declared = size, actual = attachment.len(), "request attachment size not match");
        return Err(RpcError::ProtocolViolation(format!(
            "request attachment size not match! real len: {}, expect length: {}",
            attachment.len(),
            size
        )));
    }
    let actual = hash(attachment);
    if actual != expected {
        warn!(
            attachment_len = attachment.len(),
            expected_hash = %short_hex(&expected),
            actual_hash = %short_hex(&actual),
            "request attachment hash not match"
        );
        return Err(RpcError::ProtocolViolation(format!(
            "request attachment hash not match! attachment len: {}",
            attachment.len()
        )));
    }
    Ok(())
}

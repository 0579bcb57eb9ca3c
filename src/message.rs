use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    digest::{Digest, DIGEST_LEN},
    error::RpcError,
};

/// Acknowledgment value carried by every successful echo response.
pub const ECHO_ACK: u64 = 123;

const REQ_INLINE_SIZE: u8 = 1 << 0;
const REQ_ATTACHMENT_SIZE: u8 = 1 << 1;
const REQ_STREAMING_SIZE: u8 = 1 << 2;
const REQ_CONTINUE_STREAMING_SIZE: u8 = 1 << 3;
const REQ_MESSAGES_IN_BATCH: u8 = 1 << 4;
const REQ_MAX_BUF_SIZE: u8 = 1 << 5;
const REQ_HASH: u8 = 1 << 6;
const REQ_INLINE_DATA: u8 = 1 << 7;

const RESP_HASH: u8 = 1 << 0;
const RESP_INLINE_SIZE: u8 = 1 << 1;
const RESP_ATTACHMENT_SIZE: u8 = 1 << 2;
const RESP_INLINE_DATA: u8 = 1 << 3;

/// The channel carrying the bulk payload of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Inline,
    Attachment,
    Streaming,
    ContinueStreaming,
}

/// Request shared by `Echo` and `AskEcho`.
///
/// For `Echo` this is the transfer declaration: at most one mode is
/// populated and `hash` is the digest the sender computed over the payload.
/// For `AskEcho`, `inline_size` or `attachment_size` is the number of bytes
/// the server should generate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoRequest {
    pub inline_size: Option<u64>,
    pub inline_data: Option<Bytes>,
    pub attachment_size: Option<u64>,
    pub streaming_size: Option<u64>,
    pub continue_streaming_size: Option<u64>,
    pub streaming_messages_in_batch: Option<u64>,
    pub streaming_max_buf_size: Option<u64>,
    pub hash: Option<Digest>,
}

impl EchoRequest {
    /// Declare an inline payload.
    pub fn inline(data: Bytes, hash: Digest) -> Self {
        Self {
            inline_size: Some(data.len() as u64),
            inline_data: Some(data),
            hash: Some(hash),
            ..Default::default()
        }
    }

    /// Declare an attachment of `size` bytes.
    pub fn attachment(size: u64, hash: Digest) -> Self {
        Self {
            attachment_size: Some(size),
            hash: Some(hash),
            ..Default::default()
        }
    }

    /// Declare a stream of `size` bytes that follows the call.
    pub fn streaming(size: u64, hash: Digest) -> Self {
        Self {
            streaming_size: Some(size),
            hash: Some(hash),
            ..Default::default()
        }
    }

    /// Declare a continue-streaming transfer of `size` bytes.
    pub fn continue_streaming(size: u64, hash: Digest) -> Self {
        Self {
            continue_streaming_size: Some(size),
            hash: Some(hash),
            ..Default::default()
        }
    }

    /// Every transfer mode populated by this request, in wire order.
    pub fn transfer_modes(&self) -> Vec<TransferMode> {
        let mut modes = Vec::new();
        if self.inline_size.is_some() || self.inline_data.is_some() {
            modes.push(TransferMode::Inline);
        }
        if self.attachment_size.is_some() {
            modes.push(TransferMode::Attachment);
        }
        if self.streaming_size.is_some() {
            modes.push(TransferMode::Streaming);
        }
        if self.continue_streaming_size.is_some() {
            modes.push(TransferMode::ContinueStreaming);
        }
        modes
    }
}

/// Response shared by `Echo` and `AskEcho`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoResponse {
    /// Fixed acknowledgment, [`ECHO_ACK`] for echo calls.
    pub ack: u64,
    /// Digest of the bytes returned by an ask-echo call.
    pub hash: Option<Digest>,
    pub inline_size: Option<u64>,
    pub inline_data: Option<Bytes>,
    pub attachment_size: Option<u64>,
}

/// Status code of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    ProtocolViolation,
    StreamRegistration,
    InvalidRequest,
    InternalError,
    Timeout,
}

impl StatusCode {
    pub fn from_u8(code: u8) -> Result<Self, RpcError<String>> {
        match code {
            1 => Ok(Self::ProtocolViolation),
            2 => Ok(Self::StreamRegistration),
            3 => Ok(Self::InvalidRequest),
            4 => Ok(Self::InternalError),
            5 => Ok(Self::Timeout),
            _ => Err(RpcError::InternalError(format!(
                "Invalid status code: {}",
                code
            ))),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            Self::ProtocolViolation => 1,
            Self::StreamRegistration => 2,
            Self::InvalidRequest => 3,
            Self::InternalError => 4,
            Self::Timeout => 5,
        }
    }
}

/// Body of an error response: the failed call's status and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub reason: String,
}

impl From<&RpcError<String>> for ErrorResponse {
    fn from(err: &RpcError<String>) -> Self {
        let status = match err {
            RpcError::InternalError(_) => StatusCode::InternalError,
            RpcError::ProtocolViolation(_) => StatusCode::ProtocolViolation,
            RpcError::StreamRegistration(_) => StatusCode::StreamRegistration,
            RpcError::InvalidRequest(_) => StatusCode::InvalidRequest,
            RpcError::Timeout(_) => StatusCode::Timeout,
        };
        Self {
            status,
            reason: err.message().clone(),
        }
    }
}

impl From<ErrorResponse> for RpcError<String> {
    fn from(resp: ErrorResponse) -> Self {
        match resp.status {
            StatusCode::ProtocolViolation => RpcError::ProtocolViolation(resp.reason),
            StatusCode::StreamRegistration => RpcError::StreamRegistration(resp.reason),
            StatusCode::InvalidRequest => RpcError::InvalidRequest(resp.reason),
            StatusCode::InternalError => RpcError::InternalError(resp.reason),
            StatusCode::Timeout => RpcError::Timeout(resp.reason),
        }
    }
}

/// Read-side helper that turns short input into errors instead of panics.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], RpcError<String>> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| RpcError::InternalError("Insufficient bytes".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, RpcError<String>> {
        Ok(self.take(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64, RpcError<String>> {
        let raw = self.take(8)?;
        Ok(u64::from_be_bytes(raw.try_into().map_err(|_| {
            RpcError::InternalError("Failed to convert bytes".to_string())
        })?))
    }

    fn read_digest(&mut self) -> Result<Digest, RpcError<String>> {
        let raw = self.take(DIGEST_LEN)?;
        raw.try_into()
            .map_err(|_| RpcError::InternalError("Failed to convert bytes".to_string()))
    }

    fn read_bytes(&mut self) -> Result<Bytes, RpcError<String>> {
        let len = usize::try_from(self.read_u64()?)
            .map_err(|_| RpcError::InternalError("Length overflow".to_string()))?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn read_if(&mut self, flags: u8, bit: u8) -> Result<Option<u64>, RpcError<String>> {
        if flags & bit != 0 {
            Ok(Some(self.read_u64()?))
        } else {
            Ok(None)
        }
    }
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    if let Some(value) = value {
        buf.put_u64(value);
    }
}

fn flag(present: bool, bit: u8) -> u8 {
    if present {
        bit
    } else {
        0
    }
}

/// Encode the echo request into a buffer.
pub fn encode_echo_request(req: &EchoRequest) -> Bytes {
    let flags = flag(req.inline_size.is_some(), REQ_INLINE_SIZE)
        | flag(req.attachment_size.is_some(), REQ_ATTACHMENT_SIZE)
        | flag(req.streaming_size.is_some(), REQ_STREAMING_SIZE)
        | flag(
            req.continue_streaming_size.is_some(),
            REQ_CONTINUE_STREAMING_SIZE,
        )
        | flag(
            req.streaming_messages_in_batch.is_some(),
            REQ_MESSAGES_IN_BATCH,
        )
        | flag(req.streaming_max_buf_size.is_some(), REQ_MAX_BUF_SIZE)
        | flag(req.hash.is_some(), REQ_HASH)
        | flag(req.inline_data.is_some(), REQ_INLINE_DATA);

    let data_len = req.inline_data.as_ref().map_or(0, |d| d.len() + 8);
    let mut buf = BytesMut::with_capacity(1 + 6 * 8 + DIGEST_LEN + data_len);
    buf.put_u8(flags);
    put_opt_u64(&mut buf, req.inline_size);
    put_opt_u64(&mut buf, req.attachment_size);
    put_opt_u64(&mut buf, req.streaming_size);
    put_opt_u64(&mut buf, req.continue_streaming_size);
    put_opt_u64(&mut buf, req.streaming_messages_in_batch);
    put_opt_u64(&mut buf, req.streaming_max_buf_size);
    if let Some(hash) = &req.hash {
        buf.put_slice(hash);
    }
    if let Some(data) = &req.inline_data {
        buf.put_u64(data.len() as u64);
        buf.put_slice(data);
    }
    buf.freeze()
}

/// Decode the echo request from the buffer.
pub fn decode_echo_request(buf: &[u8]) -> Result<EchoRequest, RpcError<String>> {
    let mut cursor = Cursor::new(buf);
    let flags = cursor.read_u8()?;
    let inline_size = cursor.read_if(flags, REQ_INLINE_SIZE)?;
    let attachment_size = cursor.read_if(flags, REQ_ATTACHMENT_SIZE)?;
    let streaming_size = cursor.read_if(flags, REQ_STREAMING_SIZE)?;
    let continue_streaming_size = cursor.read_if(flags, REQ_CONTINUE_STREAMING_SIZE)?;
    let streaming_messages_in_batch = cursor.read_if(flags, REQ_MESSAGES_IN_BATCH)?;
    let streaming_max_buf_size = cursor.read_if(flags, REQ_MAX_BUF_SIZE)?;
    let hash = if flags & REQ_HASH != 0 {
        Some(cursor.read_digest()?)
    } else {
        None
    };
    let inline_data = if flags & REQ_INLINE_DATA != 0 {
        Some(cursor.read_bytes()?)
    } else {
        None
    };

    Ok(EchoRequest {
        inline_size,
        inline_data,
        attachment_size,
        streaming_size,
        continue_streaming_size,
        streaming_messages_in_batch,
        streaming_max_buf_size,
        hash,
    })
}

/// Encode the echo response into a buffer.
pub fn encode_echo_response(resp: &EchoResponse) -> Bytes {
    let flags = flag(resp.hash.is_some(), RESP_HASH)
        | flag(resp.inline_size.is_some(), RESP_INLINE_SIZE)
        | flag(resp.attachment_size.is_some(), RESP_ATTACHMENT_SIZE)
        | flag(resp.inline_data.is_some(), RESP_INLINE_DATA);

    let data_len = resp.inline_data.as_ref().map_or(0, |d| d.len() + 8);
    let mut buf = BytesMut::with_capacity(1 + 3 * 8 + DIGEST_LEN + data_len);
    buf.put_u8(flags);
    buf.put_u64(resp.ack);
    if let Some(hash) = &resp.hash {
        buf.put_slice(hash);
    }
    put_opt_u64(&mut buf, resp.inline_size);
    put_opt_u64(&mut buf, resp.attachment_size);
    if let Some(data) = &resp.inline_data {
        buf.put_u64(data.len() as u64);
        buf.put_slice(data);
    }
    buf.freeze()
}

/// Decode the echo response from the buffer.
pub fn decode_echo_response(buf: &[u8]) -> Result<EchoResponse, RpcError<String>> {
    let mut cursor = Cursor::new(buf);
    let flags = cursor.read_u8()?;
    let ack = cursor.read_u64()?;
    let hash = if flags & RESP_HASH != 0 {
        Some(cursor.read_digest()?)
    } else {
        None
    };
    let inline_size = cursor.read_if(flags, RESP_INLINE_SIZE)?;
    let attachment_size = cursor.read_if(flags, RESP_ATTACHMENT_SIZE)?;
    let inline_data = if flags & RESP_INLINE_DATA != 0 {
        Some(cursor.read_bytes()?)
    } else {
        None
    };

    Ok(EchoResponse {
        ack,
        hash,
        inline_size,
        inline_data,
        attachment_size,
    })
}

/// Encode the error response into a buffer.
pub fn encode_error_response(resp: &ErrorResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + resp.reason.len());
    buf.put_u8(resp.status.to_u8());
    buf.put_slice(resp.reason.as_bytes());
    buf.freeze()
}

/// Decode the error response from the buffer.
pub fn decode_error_response(buf: &[u8]) -> Result<ErrorResponse, RpcError<String>> {
    let mut cursor = Cursor::new(buf);
    let status = StatusCode::from_u8(cursor.read_u8()?)?;
    let reason = String::from_utf8_lossy(&buf[cursor.pos..]).into_owned();
    Ok(ErrorResponse { status, reason })
}

/// Frame a call body: `u32` message length, message, then the attachment.
pub fn encode_call_body(message: &[u8], attachment: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + message.len() + attachment.len());
    body.extend((message.len() as u32).to_be_bytes());
    body.extend_from_slice(message);
    body.extend_from_slice(attachment);
    body
}

/// Split a call body into its message and attachment without copying.
pub fn split_call_body(body: &Bytes) -> Result<(Bytes, Bytes), RpcError<String>> {
    if body.len() < 4 {
        return Err(RpcError::InternalError("Insufficient bytes".to_string()));
    }
    let message_len = u32::from_be_bytes(
        body[0..4]
            .try_into()
            .map_err(|_| RpcError::InternalError("Failed to convert bytes".to_string()))?,
    ) as usize;
    if body.len() - 4 < message_len {
        return Err(RpcError::InternalError("Insufficient bytes".to_string()));
    }
    let message = body.slice(4..4 + message_len);
    let attachment = body.slice(4 + message_len..);
    Ok((message, attachment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::hash;

    #[test]
    fn test_echo_request_with_every_field() {
        let req = EchoRequest {
            inline_size: Some(3),
            inline_data: Some(Bytes::from_static(b"abc")),
            attachment_size: Some(10),
            streaming_size: Some(20),
            continue_streaming_size: Some(30),
            streaming_messages_in_batch: Some(4),
            streaming_max_buf_size: Some(1024),
            hash: Some(hash(b"abc")),
        };
        let decoded = decode_echo_request(&encode_echo_request(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_absent_fields_stay_absent() {
        let req = EchoRequest::streaming(0, hash(&[]));
        let buf = encode_echo_request(&req);
        // flags + streaming_size + digest
        assert_eq!(buf.len(), 1 + 8 + DIGEST_LEN);
        let decoded = decode_echo_request(&buf).unwrap();
        assert_eq!(decoded.inline_size, None);
        assert_eq!(decoded.streaming_size, Some(0));
        assert_eq!(decoded.transfer_modes(), vec![TransferMode::Streaming]);
    }

    #[test]
    fn test_truncated_request() {
        let req = EchoRequest::inline(Bytes::from_static(b"hello"), hash(b"hello"));
        let buf = encode_echo_request(&req);
        for cut in [0, 1, 5, buf.len() - 1] {
            assert!(decode_echo_request(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn test_inline_data_length_is_bounded_by_input() {
        let mut buf = vec![REQ_INLINE_DATA];
        buf.extend(u64::MAX.to_be_bytes());
        assert!(decode_echo_request(&buf).is_err());
    }

    #[test]
    fn test_echo_response_fields() {
        let resp = EchoResponse {
            ack: ECHO_ACK,
            hash: Some(hash(b"x")),
            attachment_size: Some(1),
            ..Default::default()
        };
        assert_eq!(decode_echo_response(&encode_echo_response(&resp)).unwrap(), resp);
    }

    #[test]
    fn test_error_response_maps_back_to_variant() {
        let err = RpcError::ProtocolViolation("hash not match".to_string());
        let body = encode_error_response(&ErrorResponse::from(&err));
        let decoded = decode_error_response(&body).unwrap();
        assert_eq!(RpcError::from(decoded), err);
        assert!(decode_error_response(&[9]).is_err());
    }

    #[test]
    fn test_call_body_split() {
        let body = Bytes::from(encode_call_body(b"msg", b"attachment"));
        let (message, attachment) = split_call_body(&body).unwrap();
        assert_eq!(&message[..], b"msg");
        assert_eq!(&attachment[..], b"attachment");

        let body = Bytes::from(encode_call_body(b"msg", b""));
        let (_, attachment) = split_call_body(&body).unwrap();
        assert!(attachment.is_empty());

        let mut bad = 100u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"short");
        assert!(split_call_body(&Bytes::from(bad)).is_err());
    }
}

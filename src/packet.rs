use crate::error::RpcError;

/// The size of the request header.
pub const REQ_HEADER_SIZE: u64 = 17;
/// The size of the response header.
pub const RESP_HEADER_SIZE: u64 = 17;

/// The Encode trait is used to encode a data structure into a byte buffer.
pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

/// The Decode trait is used to decode a byte buffer into a data structure.
pub trait Decode {
    fn decode(buf: &[u8]) -> Result<Self, RpcError<String>>
    where
        Self: Sized;
}

/// The request header, sent in front of every client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqHeader {
    /// The sequence number of the request. For stream frames this is the
    /// stream id, i.e. the sequence number of the echo call that declared it.
    pub seq: u64,
    /// The operation type of the request, see [`ReqType`].
    pub op: u8,
    /// The length of the body following the header.
    pub len: u64,
}

/// The operation type of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    EchoRequest,
    AskEchoRequest,
    KeepAliveRequest,
    StreamData,
    StreamClose,
}

impl ReqType {
    pub fn from_u8(op: u8) -> Result<Self, RpcError<String>> {
        match op {
            0 => Ok(Self::EchoRequest),
            1 => Ok(Self::AskEchoRequest),
            2 => Ok(Self::KeepAliveRequest),
            3 => Ok(Self::StreamData),
            4 => Ok(Self::StreamClose),
            _ => Err(RpcError::InternalError(format!(
                "Invalid operation type: {}",
                op
            ))),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            Self::EchoRequest => 0,
            Self::AskEchoRequest => 1,
            Self::KeepAliveRequest => 2,
            Self::StreamData => 3,
            Self::StreamClose => 4,
        }
    }
}

/// The response header, sent in front of every server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespHeader {
    /// The sequence number of the request being answered.
    pub seq: u64,
    /// The operation type of the response, see [`RespType`].
    pub op: u8,
    /// The length of the body following the header.
    pub len: u64,
}

/// The operation type of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    EchoResponse,
    AskEchoResponse,
    KeepAliveResponse,
    ErrorResponse,
}

impl RespType {
    pub fn from_u8(op: u8) -> Result<Self, RpcError<String>> {
        match op {
            0 => Ok(Self::EchoResponse),
            1 => Ok(Self::AskEchoResponse),
            2 => Ok(Self::KeepAliveResponse),
            3 => Ok(Self::ErrorResponse),
            _ => Err(RpcError::InternalError(format!(
                "Invalid operation type: {}",
                op
            ))),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            Self::EchoResponse => 0,
            Self::AskEchoResponse => 1,
            Self::KeepAliveResponse => 2,
            Self::ErrorResponse => 3,
        }
    }
}

impl Encode for ReqHeader {
    fn encode(&self) -> Vec<u8> {
        encode_header(self.seq, self.op, self.len)
    }
}

impl Decode for ReqHeader {
    fn decode(buf: &[u8]) -> Result<Self, RpcError<String>> {
        let (seq, op, len) = decode_header(buf)?;
        Ok(ReqHeader { seq, op, len })
    }
}

impl Encode for RespHeader {
    fn encode(&self) -> Vec<u8> {
        encode_header(self.seq, self.op, self.len)
    }
}

impl Decode for RespHeader {
    fn decode(buf: &[u8]) -> Result<Self, RpcError<String>> {
        let (seq, op, len) = decode_header(buf)?;
        Ok(RespHeader { seq, op, len })
    }
}

fn decode_header(buf: &[u8]) -> Result<(u64, u8, u64), RpcError<String>> {
    if buf.len() < REQ_HEADER_SIZE as usize {
        return Err(RpcError::InternalError("Insufficient bytes".to_string()));
    }
    let seq = u64::from_be_bytes(
        buf[0..8]
            .try_into()
            .map_err(|_| RpcError::InternalError("Failed to convert bytes".to_string()))?,
    );
    let op = buf[8];
    let len = u64::from_be_bytes(
        buf[9..17]
            .try_into()
            .map_err(|_| RpcError::InternalError("Failed to convert bytes".to_string()))?,
    );
    Ok((seq, op, len))
}

fn encode_header(seq: u64, op: u8, len: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(REQ_HEADER_SIZE as usize);
    bytes.extend(seq.to_be_bytes());
    bytes.push(op);
    bytes.extend(len.to_be_bytes());
    bytes
}

/// Build a complete request frame: header followed by body.
pub fn encode_req_frame(seq: u64, req_type: ReqType, body: &[u8]) -> Vec<u8> {
    let header = ReqHeader {
        seq,
        op: req_type.to_u8(),
        len: body.len() as u64,
    };
    let mut frame = header.encode();
    frame.extend_from_slice(body);
    frame
}

/// Build a complete response frame: header followed by body.
pub fn encode_resp_frame(seq: u64, resp_type: RespType, body: &[u8]) -> Vec<u8> {
    let header = RespHeader {
        seq,
        op: resp_type.to_u8(),
        len: body.len() as u64,
    };
    let mut frame = header.encode();
    frame.extend_from_slice(body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ReqHeader {
            seq: 7,
            op: ReqType::StreamData.to_u8(),
            len: 0x0102,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), REQ_HEADER_SIZE as usize);
        assert_eq!(&buf[0..8], &7u64.to_be_bytes());
        assert_eq!(buf[8], 3);
        assert_eq!(ReqHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_short_header_is_rejected() {
        let err = RespHeader::decode(&[0u8; 16]).unwrap_err();
        assert_eq!(err, RpcError::InternalError("Insufficient bytes".to_string()));
    }

    #[test]
    fn test_unknown_op() {
        assert!(ReqType::from_u8(9).is_err());
        assert!(RespType::from_u8(4).is_err());
        assert_eq!(RespType::from_u8(3).unwrap(), RespType::ErrorResponse);
    }

    #[test]
    fn test_frame_carries_body() {
        let frame = encode_resp_frame(3, RespType::AskEchoResponse, b"abc");
        let header = RespHeader::decode(&frame).unwrap();
        assert_eq!(header.len, 3);
        assert_eq!(&frame[RESP_HEADER_SIZE as usize..], b"abc");
    }
}

use thiserror::Error;

/// Errors produced by the RPC transport and the echo service.
///
/// Synchronous verification failures travel back to the caller as one of
/// these; integrity failures of streamed payloads never do, they are only
/// reported by the stream registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError<T> {
    /// Transport, codec or runtime failure.
    #[error("internal error: {0}")]
    InternalError(T),
    /// The payload did not match its declared size or digest.
    #[error("protocol violation: {0}")]
    ProtocolViolation(T),
    /// The transport refused to accept the declared stream.
    #[error("stream registration failed: {0}")]
    StreamRegistration(T),
    /// The request shape is not supported by the called method.
    #[error("invalid request: {0}")]
    InvalidRequest(T),
    /// A read or write did not finish in time.
    #[error("timeout: {0}")]
    Timeout(T),
}

impl<T> RpcError<T> {
    /// Borrow the message carried by any variant.
    pub fn message(&self) -> &T {
        match self {
            Self::InternalError(msg)
            | Self::ProtocolViolation(msg)
            | Self::StreamRegistration(msg)
            | Self::InvalidRequest(msg)
            | Self::Timeout(msg) => msg,
        }
    }
}

impl From<std::io::Error> for RpcError<String> {
    fn from(err: std::io::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

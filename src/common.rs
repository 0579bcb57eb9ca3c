use std::time::Duration;

/// Default cap on the bytes a single stream may declare, 1 GiB.
pub const DEFAULT_MAX_STREAM_SIZE: u64 = 1 << 30;
/// Default cap on a single frame body, slightly above the stream cap so a
/// maximal inline payload plus its message still fits.
pub const DEFAULT_MAX_FRAME_LEN: u64 = (1 << 30) + (1 << 20);

/// Options for the timeout of a connection.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Deadline for reading a frame body once its header arrived.
    pub read_timeout: Duration,
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
    /// Quiet period after which open streams get an idle notification
    /// (server) or the keep-alive interval is derived from (client).
    pub idle_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-connection limits enforced by the server transport.
#[derive(Debug, Clone)]
pub struct StreamLimits {
    /// Largest `streaming_size` a stream may declare.
    pub max_stream_size: u64,
    /// Largest body a single frame may carry.
    pub max_frame_len: u64,
    /// Close the connection after this long without any frame. `None` keeps
    /// idle connections open forever.
    pub connection_idle_timeout: Option<Duration>,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_stream_size: DEFAULT_MAX_STREAM_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connection_idle_timeout: None,
        }
    }
}

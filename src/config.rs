use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use std::time::Duration;

/// Default cap on concurrently open streams per session
pub const DEFAULT_MAX_STREAMS: usize = 1024;

/// Default per-stream inbound buffer bound (4 MiB)
pub const DEFAULT_MAX_STREAM_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Session configuration
///
/// ```rust
/// use mplex_stream::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_max_streams(64)
///     .with_backpressure_timeout(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of open streams (both origins combined)
    pub max_streams: usize,

    /// Maximum payload size of one frame, inbound and outbound
    pub max_message_size: usize,

    /// Bound on unread bytes buffered per stream
    pub max_stream_buffer_size: usize,

    /// How long the read loop stalls on a full stream buffer before resetting it
    pub backpressure_timeout: Duration,

    /// Hand inbound streams to `accept_stream`; when false they are reset
    pub accept_inbound_streams: bool,

    /// Inbound streams waiting for `accept_stream`
    pub incoming_queue_capacity: usize,

    /// Frames waiting for the writer task
    pub outgoing_queue_capacity: usize,

    /// Upper bound on the flush performed by `Session::close`
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_stream_buffer_size: DEFAULT_MAX_STREAM_BUFFER_SIZE,
            backpressure_timeout: Duration::from_secs(5),
            accept_inbound_streams: true,
            incoming_queue_capacity: 16,
            outgoing_queue_capacity: 256,
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_max_stream_buffer_size(mut self, size: usize) -> Self {
        self.max_stream_buffer_size = size;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    pub fn with_accept_inbound_streams(mut self, accept: bool) -> Self {
        self.accept_inbound_streams = accept;
        self
    }

    pub fn with_incoming_queue_capacity(mut self, capacity: usize) -> Self {
        self.incoming_queue_capacity = capacity;
        self
    }

    pub fn with_outgoing_queue_capacity(mut self, capacity: usize) -> Self {
        self.outgoing_queue_capacity = capacity;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Check that every limit is usable
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.max_streams, "max_streams"),
            (self.max_message_size, "max_message_size"),
            (self.max_stream_buffer_size, "max_stream_buffer_size"),
            (self.incoming_queue_capacity, "incoming_queue_capacity"),
            (self.outgoing_queue_capacity, "outgoing_queue_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

use crate::protocol::StreamKey;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur in session and stream operations
///
/// `Clone` so that one session-fatal error can be handed to every open stream.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (malformed varint, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame header carried an unknown message kind
    #[error("Invalid frame header: unknown kind code {0}")]
    InvalidFrameHeader(u8),

    /// Frame payload larger than the configured maximum
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    /// Remote opened a stream whose key is already in use
    #[error("Duplicate stream: {0}")]
    DuplicateStream(StreamKey),

    /// Local side of the stream has been closed for writing
    #[error("Stream closed")]
    StreamClosed,

    /// Stream was reset locally
    #[error("Stream reset")]
    StreamReset,

    /// Stream was reset by the remote peer
    #[error("Stream reset by peer")]
    RemoteReset,

    /// Registry is at capacity
    #[error("Too many streams (max {0})")]
    TooManyStreams(usize),

    /// Session is closing or has terminated
    #[error("Session closed")]
    SessionClosed,

    /// Underlying connection reached end of stream
    #[error("Connection closed")]
    ConnectionClosed,

    /// Consumer did not drain the inbound buffer in time
    #[error("Input buffer full: consumer too slow, increase max_stream_buffer_size")]
    InputBufferFull,

    /// Session was cancelled by its owner
    #[error("Session cancelled")]
    Cancelled,

    /// Timeout waiting for operation
    #[error("Operation timed out")]
    Timeout,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(inner) => inner.kind(),
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::StreamReset | Error::RemoteReset | Error::InputBufferFull => {
                io::ErrorKind::ConnectionReset
            }
            Error::SessionClosed | Error::Cancelled => io::ErrorKind::NotConnected,
            Error::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Protocol(_)
            | Error::InvalidFrameHeader(_)
            | Error::FrameTooLarge(..)
            | Error::DuplicateStream(_) => io::ErrorKind::InvalidData,
            Error::TooManyStreams(_) | Error::Config(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! mplex-style stream multiplexing over a single connection
//!
//! This crate runs many independent, bidirectional, ordered byte streams
//! over one reliable ordered connection (anything `AsyncRead + AsyncWrite`:
//! TCP, TLS, an in-memory duplex). It allows applications to:
//!
//! - Open and accept concurrent streams on one connection
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite) per stream
//! - Half-close a stream (Close) or abort it (Reset) independently
//! - Bound memory per stream with backpressure on slow consumers
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Stream (AsyncRead/AsyncWrite, one per logical stream)
//!     ↓
//! Session (registry, demux reader task, single writer task)
//!     ↓
//! FrameCodec ([header varint][length varint][payload])
//!     ↓
//! Connection (AsyncRead + AsyncWrite)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use mplex_stream::{Config, Session};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tcp = TcpStream::connect("127.0.0.1:4001").await?;
//!     let session = Session::new(tcp, Config::default())?;
//!
//!     // Outbound stream
//!     let mut stream = session.open_stream().await?;
//!     stream.write_all(b"ping").await?;
//!     stream.shutdown().await?;
//!
//!     let mut reply = Vec::new();
//!     stream.read_to_end(&mut reply).await?;
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
mod registry;
pub mod session;
pub mod stream;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::SessionState;
pub use protocol::{
    Frame, FrameCodec, MessageKind, Origin, StreamKey, DEFAULT_MAX_MESSAGE_SIZE, MAX_STREAM_ID,
};
pub use session::Session;
pub use stream::{Stream, StreamState};

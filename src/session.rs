use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, SessionState};
use crate::protocol::{Action, Frame, FrameCodec, Origin, StreamKey};
use crate::registry::StreamRegistry;
use crate::stream::Stream;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Read-side buffer growth step
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Flush to the connection once this many encoded bytes are pending
const WRITE_BATCH_SIZE: usize = 64 * 1024;

/// Work items for the writer task
pub(crate) enum Outbound {
    Frame(Frame),
    /// Write out everything queued before this, then shut down the write half
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Session multiplexes many streams over one connection
///
/// Owns the connection: a reader task demultiplexes inbound frames to
/// streams, and a single writer task serializes every outbound frame so
/// frames never interleave on the wire.
///
/// A slow consumer back-pressures the whole session: while a stream's buffer
/// is full the reader stops pulling bytes off the connection.
///
/// Dropping the `Session` aborts it.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Config,

    /// Open streams ((id, origin) -> Stream)
    registry: Arc<StreamRegistry>,

    /// Next id for locally opened streams
    next_stream_id: AtomicU64,

    /// Channel to the writer task
    outgoing: mpsc::Sender<Outbound>,

    /// Sender for incoming streams (used by the reader task)
    incoming_tx: mpsc::Sender<Stream>,

    /// Channel for incoming streams
    incoming: Mutex<mpsc::Receiver<Stream>>,

    lifecycle: Lifecycle,
}

impl Session {
    /// Create a session over `io`. Must be called within a tokio runtime.
    pub fn new<T>(io: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_cancellation(io, config, CancellationToken::new())
    }

    /// Create a session that aborts with `Error::Cancelled` once `cancel` fires
    pub fn with_cancellation<T>(io: T, config: Config, cancel: CancellationToken) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = tokio::io::split(io);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_queue_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_queue_capacity);
        let codec = FrameCodec::new(config.max_message_size);

        let inner = Arc::new(SessionInner {
            registry: Arc::new(StreamRegistry::new(config.max_streams)),
            config,
            next_stream_id: AtomicU64::new(0),
            outgoing: outgoing_tx,
            incoming_tx,
            incoming: Mutex::new(incoming_rx),
            lifecycle: Lifecycle::new(cancel),
        });

        let shutdown = inner.lifecycle.shutdown_token();
        tokio::spawn(writer_task(
            writer,
            outgoing_rx,
            codec,
            Arc::downgrade(&inner),
            shutdown,
        ));
        tokio::spawn(reader_task(reader, inner.clone()));

        debug!("Session started (max_streams={})", inner.config.max_streams);
        Ok(Self { inner })
    }

    /// Open a new outbound stream named after its id
    pub async fn open_stream(&self) -> Result<Stream> {
        self.inner.open(None).await
    }

    /// Open a new outbound stream with the given name
    pub async fn open_named_stream(&self, name: impl Into<String>) -> Result<Stream> {
        self.inner.open(Some(name.into())).await
    }

    /// Accept the next inbound stream
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut incoming = self.inner.incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.inner.lifecycle.terminated() => Err(Error::SessionClosed),
            stream = incoming.recv() => stream.ok_or(Error::SessionClosed),
        }
    }

    /// Graceful shutdown.
    ///
    /// Refuses new streams, sends Close for every stream still open for
    /// writing, flushes and shuts down the connection's write side. Does not
    /// wait for the peer's Close frames. Falls back to `abort` if the flush
    /// fails or exceeds `close_timeout`.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    /// Immediate teardown: every stream is reset with `err`, pending writes
    /// are dropped and the connection is closed.
    pub fn abort(&self, err: Error) {
        self.inner.abort(err);
    }

    /// Wait for the session to end. Returns the abort cause, if any.
    pub async fn closed(&self) -> Option<Error> {
        match self.inner.lifecycle.terminated().await {
            SessionState::Aborted(err) => Some(err),
            _ => None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.state()
    }

    /// Check if the session still accepts new streams
    pub fn is_alive(&self) -> bool {
        self.inner.lifecycle.is_open()
    }

    /// Token that aborts the session when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.lifecycle.external_token()
    }

    /// Get the number of open streams
    pub fn stream_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// All open streams the application still holds, both origins
    pub fn streams(&self) -> Vec<Stream> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .filter_map(Stream::attach)
            .collect()
    }

    /// Subscribe to the keys of streams as they leave the session.
    ///
    /// A stream ends once both sides closed it, on reset, or when the session
    /// terminates. Slow subscribers skip notifications (`RecvError::Lagged`).
    pub fn stream_ended(&self) -> broadcast::Receiver<StreamKey> {
        self.inner.registry.subscribe_ended()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.abort(Error::SessionClosed);
    }
}

impl SessionInner {
    async fn open(&self, name: Option<String>) -> Result<Stream> {
        if !self.lifecycle.is_open() {
            return Err(Error::SessionClosed);
        }
        if self.registry.is_full() {
            return Err(Error::TooManyStreams(self.config.max_streams));
        }
        if let Some(name) = &name {
            if name.len() > self.config.max_message_size {
                return Err(Error::FrameTooLarge(name.len(), self.config.max_message_size));
            }
        }

        let permit = self
            .outgoing
            .reserve()
            .await
            .map_err(|_| Error::SessionClosed)?;
        if !self.lifecycle.is_open() {
            return Err(Error::SessionClosed);
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let name = name.unwrap_or_else(|| id.to_string());
        let key = StreamKey::new(id, Origin::Initiator);
        let stream = Stream::new(
            key,
            name,
            &self.config,
            self.outgoing.clone(),
            Arc::downgrade(&self.registry),
        );

        if let Err(err) = self.registry.insert(stream.detached()) {
            stream.terminate(err.clone());
            return Err(err);
        }
        permit.send(Outbound::Frame(Frame::new_stream(id, stream.name())));

        debug!("Opened stream {} ({})", key, stream.name());
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if !self.lifecycle.begin_close() {
            // Someone else is closing or the session already ended
            return match self.lifecycle.terminated().await {
                SessionState::Aborted(err) => Err(err),
                _ => Ok(()),
            };
        }

        debug!("Closing session with {} open streams", self.registry.len());

        let flush = async {
            for stream in self.registry.snapshot() {
                // Errors here only mean the stream already finished
                let _ = stream.close_write().await;
            }
            let (done_tx, done_rx) = oneshot::channel();
            self.outgoing
                .send(Outbound::Shutdown(done_tx))
                .await
                .map_err(|_| Error::SessionClosed)?;
            done_rx.await.map_err(|_| Error::SessionClosed)?
        };

        let result = tokio::select! {
            result = tokio::time::timeout(self.config.close_timeout, flush) => {
                result.unwrap_or(Err(Error::Timeout))
            }
            state = self.lifecycle.terminated() => match state {
                SessionState::Aborted(err) => Err(err),
                _ => Ok(()),
            },
        };

        match result {
            Ok(()) => {
                self.finish_close();
                Ok(())
            }
            Err(err) => {
                warn!("Graceful close failed: {}, aborting", err);
                self.abort(err.clone());
                Err(err)
            }
        }
    }

    fn finish_close(&self) {
        if self.lifecycle.finish_close() {
            let streams = self.registry.close();
            for stream in &streams {
                stream.terminate(Error::SessionClosed);
            }
            debug!("Session closed ({} streams still open)", streams.len());
        }
    }

    fn abort(&self, err: Error) {
        if self.lifecycle.abort(err.clone()) {
            let streams = self.registry.close();
            for stream in &streams {
                stream.terminate(err.clone());
            }
            debug!("Session aborted: {} ({} streams reset)", err, streams.len());
        }
    }

    /// Demultiplex loop: decode frames off the connection and route them
    async fn demux<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = FrameCodec::new(self.config.max_message_size);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            while let Some(frame) = codec.decode(&mut buf)? {
                self.dispatch(frame).await?;
            }

            if buf.capacity() - buf.len() < READ_BUFFER_SIZE / 4 {
                buf.reserve(READ_BUFFER_SIZE);
            }
            if reader.read_buf(&mut buf).await? == 0 {
                while let Some(frame) = codec.decode_eof(&mut buf)? {
                    self.dispatch(frame).await?;
                }
                debug!("Connection reached EOF");
                return Ok(());
            }
        }
    }

    /// Route one inbound frame to its stream
    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let key = frame.recipient_key();
        let action = frame.kind.action();
        trace!(
            "Received {:?} for stream {} ({} bytes)",
            frame.kind,
            key,
            frame.payload.len()
        );

        if action == Action::Open {
            return self.accept_new_stream(key, frame.payload).await;
        }

        let Some(stream) = self.registry.get(&key) else {
            // May have been removed after a Close/Reset race
            trace!("Received {:?} for unknown stream {}, ignoring", frame.kind, key);
            return Ok(());
        };

        match action {
            Action::Message => self.deliver_message(&stream, frame.payload).await,
            Action::Close => stream.deliver_close(),
            Action::Reset => stream.deliver_reset(),
            Action::Open => {}
        }
        Ok(())
    }

    async fn accept_new_stream(&self, key: StreamKey, name: Bytes) -> Result<()> {
        if self.registry.get(&key).is_some() {
            return Err(Error::DuplicateStream(key));
        }

        if !self.config.accept_inbound_streams {
            debug!("Rejecting inbound stream {}: inbound streams disabled", key);
            self.reject(key).await;
            return Ok(());
        }

        let name = String::from_utf8_lossy(&name).into_owned();
        let stream = Stream::new(
            key,
            name,
            &self.config,
            self.outgoing.clone(),
            Arc::downgrade(&self.registry),
        );

        let registered = stream.detached();
        if let Err(err) = self.registry.insert(registered.clone()) {
            // Never registered, so end it without a frame of its own
            stream.terminate(err.clone());
            return match err {
                Error::TooManyStreams(max) => {
                    warn!("Rejecting inbound stream {}: {} streams already open", key, max);
                    self.reject(key).await;
                    Ok(())
                }
                err => Err(err),
            };
        }

        debug!("Accepted inbound stream {} ({})", key, stream.name());

        // Stalls the reader while the accept queue is full, but not forever
        let queued = tokio::time::timeout(
            self.config.backpressure_timeout,
            self.incoming_tx.send(stream),
        )
        .await;
        match queued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => registered.reset(),
            Err(_) => {
                warn!("Accept queue full, resetting inbound stream {}", key);
                registered.reset();
            }
        }
        Ok(())
    }

    /// Refuse an inbound stream that was never registered
    async fn reject(&self, key: StreamKey) {
        let _ = self.outgoing.send(Outbound::Frame(Frame::reset(key))).await;
    }

    async fn deliver_message(&self, stream: &Stream, payload: Bytes) {
        if stream.would_overflow(payload.len()) {
            trace!("Stream {} buffer full, pausing reads", stream.key());
            let drained = tokio::time::timeout(
                self.config.backpressure_timeout,
                stream.wait_for_capacity(payload.len()),
            )
            .await;
            if drained.is_err() {
                warn!("Stream {} input buffer full, resetting", stream.key());
                stream.abort(Error::InputBufferFull);
                return;
            }
        }
        stream.deliver_data(payload);
    }
}

/// Background reader task
///
/// Runs the demultiplex loop until the connection ends, a protocol error
/// occurs, or the session is cancelled. Every exit except an internal
/// shutdown aborts the session.
async fn reader_task<R>(reader: R, inner: Arc<SessionInner>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = inner.lifecycle.shutdown_token();
    let external = inner.lifecycle.external_token();

    let result = tokio::select! {
        result = inner.demux(reader) => result,
        _ = shutdown.cancelled() => {
            debug!("Reader task stopped");
            return;
        }
        _ = external.cancelled() => Err(Error::Cancelled),
    };

    let err = match result {
        // Peer hung up while we were flushing our own close; close() finishes it
        Ok(()) if !inner.lifecycle.is_open() => {
            debug!("Connection closed during graceful shutdown");
            return;
        }
        Ok(()) => Error::ConnectionClosed,
        Err(err) => {
            warn!("Reader task error: {}", err);
            err
        }
    };
    inner.abort(err);
}

/// Background writer task
///
/// Sole owner of the connection's write half. Frames are encoded in queue
/// order and written in batches.
async fn writer_task<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<Outbound>,
    mut codec: FrameCodec,
    session: Weak<SessionInner>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            debug!("Writer task cancelled");
            return;
        }
        result = write_loop(&mut writer, &mut outgoing, &mut codec) => result,
    };

    match result {
        Ok(()) => debug!("Writer task finished"),
        Err(err) => {
            warn!("Writer task error: {}", err);
            if let Some(inner) = session.upgrade() {
                inner.abort(err);
            }
        }
    }
}

async fn write_loop<W>(
    writer: &mut W,
    outgoing: &mut mpsc::Receiver<Outbound>,
    codec: &mut FrameCodec,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();

    while let Some(item) = outgoing.recv().await {
        let mut next = Some(item);
        while let Some(item) = next.take() {
            match item {
                Outbound::Frame(frame) => {
                    trace!(
                        "Sending {:?} for stream {} ({} bytes)",
                        frame.kind,
                        frame.stream_id,
                        frame.payload.len()
                    );
                    codec.encode(frame, &mut buf)?;
                }
                Outbound::Shutdown(done) => {
                    let result = shutdown_writer(writer, &buf).await;
                    let _ = done.send(result.clone());
                    return result;
                }
            }
            if buf.len() < WRITE_BATCH_SIZE {
                next = outgoing.try_recv().ok();
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        buf.clear();
    }
    Ok(())
}

async fn shutdown_writer<W>(writer: &mut W, pending: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(pending).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    debug!("Connection write side shut down");
    Ok(())
}

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{Frame, Origin, StreamKey};
use crate::registry::StreamRegistry;
use crate::session::Outbound;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::{pin, Pin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;
use tracing::{debug, trace};

/// Stream state
///
/// ```text
/// Open -> HalfClosedLocal  -> Closed
/// Open -> HalfClosedRemote -> Closed
/// Open | HalfClosed* -> Reset
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open
    Open,
    /// We closed for writing, peer may still send
    HalfClosedLocal,
    /// Peer closed for writing, we may still send
    HalfClosedRemote,
    /// Both sides closed
    Closed,
    /// Aborted by either side or by the session
    Reset,
}

struct Shared {
    key: StreamKey,

    /// Name carried in the NewStream frame
    name: String,

    max_message_size: usize,

    max_buffer_size: usize,

    state: Mutex<Inner>,

    /// Session's outbound frame queue
    outgoing: mpsc::Sender<Outbound>,

    registry: Weak<StreamRegistry>,

    /// Notified whenever the consumer takes bytes out of the receive buffer
    drained: Notify,

    /// Alive while any application handle exists
    guard: Weak<HandleGuard>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Inner {
    local_closed: bool,

    remote_closed: bool,

    /// Terminal cause once reset; implies both sides closed
    reset: Option<Error>,

    /// Data received from peer, in order
    recv_buf: VecDeque<Bytes>,

    /// Total bytes in `recv_buf`
    buffered: usize,

    read_waker: Option<Waker>,
}

impl Inner {
    fn state(&self) -> StreamState {
        match (self.reset.is_some(), self.local_closed, self.remote_closed) {
            (true, _, _) => StreamState::Reset,
            (false, true, true) => StreamState::Closed,
            (false, true, false) => StreamState::HalfClosedLocal,
            (false, false, true) => StreamState::HalfClosedRemote,
            (false, false, false) => StreamState::Open,
        }
    }

    /// Eligible for removal from the registry
    fn is_done(&self) -> bool {
        self.reset.is_some() || (self.local_closed && self.remote_closed)
    }

    fn check_writable(&self) -> Result<()> {
        if self.reset.is_some() {
            Err(Error::StreamReset)
        } else if self.local_closed {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }

    fn would_overflow(&self, len: usize, limit: usize) -> bool {
        self.buffered > 0 && self.buffered + len > limit
    }
}

/// Shared by every application handle of a stream.
///
/// Dropping the last handle of a stream that is still open for writing
/// resets it. A stream already closed for writing is only forgotten locally,
/// so its Close reaches the peer intact.
struct HandleGuard {
    shared: Arc<Shared>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let stream = Stream::detached_from(self.shared.clone());
        if self.shared.lock().local_closed {
            stream.terminate(Error::StreamClosed);
        } else {
            trace!("Stream {} dropped while open", self.shared.key);
            stream.reset();
        }
    }
}

/// One logical bidirectional stream within a session
///
/// Cheap to clone; all clones share the same state. Implements
/// `AsyncRead` + `AsyncWrite`, with `poll_shutdown` acting as a half-close.
///
/// Dropping every handle without closing the stream resets it.
pub struct Stream {
    shared: Arc<Shared>,

    /// Reservation slot for `poll_write` / `poll_shutdown`
    sender: PollSender<Outbound>,

    /// Held by application handles only; the session's own copies go without
    guard: Option<Arc<HandleGuard>>,
}

impl Stream {
    pub(crate) fn new(
        key: StreamKey,
        name: String,
        config: &Config,
        outgoing: mpsc::Sender<Outbound>,
        registry: Weak<StreamRegistry>,
    ) -> Self {
        let sender = PollSender::new(outgoing.clone());
        let guard = Arc::new_cyclic(|guard| HandleGuard {
            shared: Arc::new(Shared {
                key,
                name,
                max_message_size: config.max_message_size,
                max_buffer_size: config.max_stream_buffer_size,
                state: Mutex::new(Inner::default()),
                outgoing,
                registry,
                drained: Notify::new(),
                guard: guard.clone(),
            }),
        });
        Self {
            shared: guard.shared.clone(),
            sender,
            guard: Some(guard),
        }
    }

    fn detached_from(shared: Arc<Shared>) -> Self {
        Self {
            sender: PollSender::new(shared.outgoing.clone()),
            shared,
            guard: None,
        }
    }

    /// Copy for the session's bookkeeping; does not keep the stream alive
    pub(crate) fn detached(&self) -> Self {
        Self::detached_from(self.shared.clone())
    }

    /// Application handle for a session-held copy, if one is still alive
    pub(crate) fn attach(&self) -> Option<Self> {
        let guard = self.shared.guard.upgrade()?;
        Some(Self {
            shared: self.shared.clone(),
            sender: PollSender::new(self.shared.outgoing.clone()),
            guard: Some(guard),
        })
    }

    pub fn key(&self) -> StreamKey {
        self.shared.key
    }

    /// Numeric stream id
    pub fn id(&self) -> u64 {
        self.shared.key.id
    }

    /// Whether this side opened the stream
    pub fn origin(&self) -> Origin {
        self.shared.key.origin
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state()
    }

    /// True once the stream is fully closed or reset
    pub fn is_closed(&self) -> bool {
        self.shared.lock().is_done()
    }

    /// Bytes received but not yet read
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().buffered
    }

    pub(crate) fn same_stream(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Send `data` to the peer.
    ///
    /// Payloads larger than the maximum message size go out as several
    /// consecutive Message frames.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.shared.lock().check_writable()?;

        for chunk in data.chunks(self.shared.max_message_size) {
            let permit = match self.shared.outgoing.reserve().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.shared.lock().check_writable()?;
                    return Err(Error::SessionClosed);
                }
            };
            // State check and enqueue happen under one lock so no frame can
            // slip in behind our own Close or Reset.
            {
                let inner = self.shared.lock();
                inner.check_writable()?;
                permit.send(Outbound::Frame(Frame::message(
                    self.shared.key,
                    Bytes::copy_from_slice(chunk),
                )));
            }
        }
        trace!("Stream {} queued {} bytes", self.shared.key, data.len());
        Ok(())
    }

    /// Read the next chunk of data.
    ///
    /// `Ok(None)` once the peer has closed and the buffer is drained; an
    /// error if the stream was reset.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>> {
        std::future::poll_fn(|cx| self.poll_read_chunk(cx)).await
    }

    pub fn poll_read_chunk(&self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>>> {
        let mut inner = self.shared.lock();
        if let Some(cause) = &inner.reset {
            return Poll::Ready(Err(cause.clone()));
        }
        if let Some(chunk) = inner.recv_buf.pop_front() {
            inner.buffered -= chunk.len();
            drop(inner);
            self.shared.drained.notify_waiters();
            return Poll::Ready(Ok(Some(chunk)));
        }
        if inner.remote_closed {
            return Poll::Ready(Ok(None));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Graceful half-close (Close frame). Reading stays possible.
    pub async fn close_write(&self) -> Result<()> {
        if self.shared.lock().local_closed {
            return Ok(());
        }

        let permit = match self.shared.outgoing.reserve().await {
            Ok(permit) => permit,
            Err(_) if self.shared.lock().local_closed => return Ok(()),
            Err(_) => return Err(Error::SessionClosed),
        };

        let done = {
            let mut inner = self.shared.lock();
            if inner.local_closed {
                return Ok(());
            }
            inner.local_closed = true;
            permit.send(Outbound::Frame(Frame::close(self.shared.key)));
            inner.is_done()
        };

        debug!("Stream {} closed for writing", self.shared.key);
        if done {
            self.release();
        }
        Ok(())
    }

    /// Immediate close (Reset frame). Buffered data is discarded and pending
    /// reads fail with `StreamReset`.
    pub fn reset(&self) {
        self.abort(Error::StreamReset);
    }

    /// Reset with a caller-chosen cause.
    ///
    /// The peer gets a Reset frame; pending and future reads on every handle
    /// fail with `cause`.
    pub fn abort(&self, cause: Error) {
        if self.shut_down(cause) {
            self.send_best_effort(Frame::reset(self.shared.key));
            debug!("Stream {} reset", self.shared.key);
        }
    }

    /// Reset without telling the peer (session teardown)
    pub(crate) fn terminate(&self, cause: Error) {
        if self.shut_down(cause) {
            trace!("Stream {} terminated with session", self.shared.key);
        }
    }

    /// Handle a Message frame from the peer
    pub(crate) fn deliver_data(&self, data: Bytes) {
        let waker = {
            let mut inner = self.shared.lock();
            if inner.remote_closed {
                trace!("Stream {} dropping {} bytes after remote close", self.shared.key, data.len());
                return;
            }
            if data.is_empty() {
                return;
            }
            inner.buffered += data.len();
            inner.recv_buf.push_back(data);
            inner.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Handle a Close frame from the peer
    pub(crate) fn deliver_close(&self) {
        let (waker, done) = {
            let mut inner = self.shared.lock();
            if inner.remote_closed {
                return;
            }
            inner.remote_closed = true;
            (inner.read_waker.take(), inner.is_done())
        };
        debug!("Stream {} closed by peer", self.shared.key);
        if let Some(waker) = waker {
            waker.wake();
        }
        if done {
            self.release();
        }
    }

    /// Handle a Reset frame from the peer
    pub(crate) fn deliver_reset(&self) {
        if self.shut_down(Error::RemoteReset) {
            debug!("Stream {} reset by peer", self.shared.key);
        }
    }

    pub(crate) fn would_overflow(&self, len: usize) -> bool {
        self.shared
            .lock()
            .would_overflow(len, self.shared.max_buffer_size)
    }

    /// Wait until `len` more bytes fit in the receive buffer or the stream ends
    pub(crate) async fn wait_for_capacity(&self, len: usize) {
        loop {
            let mut drained = pin!(self.shared.drained.notified());
            drained.as_mut().enable();
            {
                let inner = self.shared.lock();
                if inner.reset.is_some() || !inner.would_overflow(len, self.shared.max_buffer_size) {
                    return;
                }
            }
            drained.await;
        }
    }

    /// Move to the reset state. Returns false if already finished.
    fn shut_down(&self, cause: Error) -> bool {
        let waker = {
            let mut inner = self.shared.lock();
            if inner.is_done() {
                return false;
            }
            inner.reset = Some(cause);
            inner.local_closed = true;
            inner.remote_closed = true;
            inner.recv_buf.clear();
            inner.buffered = 0;
            inner.read_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.shared.drained.notify_waiters();
        self.release();
        true
    }

    /// Enqueue without waiting; falls back to a spawned send when the queue is full
    fn send_best_effort(&self, frame: Frame) {
        match self.shared.outgoing.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let outgoing = self.shared.outgoing.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = outgoing.send(item).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Stream {}: outgoing queue closed", self.shared.key);
            }
        }
    }

    fn release(&self) {
        if let Some(registry) = self.shared.registry.upgrade() {
            if registry.remove(self) {
                debug!("Stream {} removed from session", self.shared.key);
            }
        }
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            sender: PollSender::new(self.shared.outgoing.clone()),
            guard: self.guard.clone(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.shared.key)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        let mut inner = shared.lock();

        if let Some(cause) = &inner.reset {
            return Poll::Ready(Err(cause.clone().into()));
        }

        if let Some(front) = inner.recv_buf.front_mut() {
            let n = buf.remaining().min(front.len());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                inner.recv_buf.pop_front();
            }
            inner.buffered -= n;
            drop(inner);
            shared.drained.notify_waiters();
            return Poll::Ready(Ok(()));
        }

        if inner.remote_closed {
            // EOF
            return Poll::Ready(Ok(()));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Err(e) = this.shared.lock().check_writable() {
            return Poll::Ready(Err(e.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.sender.poll_reserve(cx)).is_err() {
            let err = this
                .shared
                .lock()
                .check_writable()
                .err()
                .unwrap_or(Error::SessionClosed);
            return Poll::Ready(Err(err.into()));
        }

        let to_send = buf.len().min(this.shared.max_message_size);
        let frame = Frame::message(this.shared.key, Bytes::copy_from_slice(&buf[..to_send]));

        let inner = this.shared.lock();
        if let Err(e) = inner.check_writable() {
            this.sender.abort_send();
            return Poll::Ready(Err(e.into()));
        }
        match this.sender.send_item(Outbound::Frame(frame)) {
            Ok(()) => Poll::Ready(Ok(to_send)),
            Err(_) => Poll::Ready(Err(Error::SessionClosed.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer immediately
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shared.lock().local_closed {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.sender.poll_reserve(cx)).is_err() {
            if this.shared.lock().local_closed {
                return Poll::Ready(Ok(()));
            }
            return Poll::Ready(Err(Error::SessionClosed.into()));
        }

        let done = {
            let mut inner = this.shared.lock();
            if inner.local_closed {
                this.sender.abort_send();
                return Poll::Ready(Ok(()));
            }
            inner.local_closed = true;
            if this
                .sender
                .send_item(Outbound::Frame(Frame::close(this.shared.key)))
                .is_err()
            {
                return Poll::Ready(Err(Error::SessionClosed.into()));
            }
            inner.is_done()
        };

        debug!("Stream {} closed for writing", this.shared.key);
        if done {
            this.release();
        }
        Poll::Ready(Ok(()))
    }
}

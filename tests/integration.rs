// Integration tests over in-memory duplex connections

use bytes::{Bytes, BytesMut};
use mplex_stream::{
    Config, Error, Frame, FrameCodec, MessageKind, Origin, Session, SessionState, StreamKey,
    StreamState,
};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,mplex_stream=debug")
        .try_init();
}

/// Two sessions talking to each other
fn session_pair(config: Config) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Session::new(a, config.clone()).unwrap(),
        Session::new(b, config).unwrap(),
    )
}

/// Hand-driven peer that speaks raw frames
struct RawPeer {
    io: DuplexStream,
    codec: FrameCodec,
    buf: BytesMut,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            codec: FrameCodec::default(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out).unwrap();
        self.io.write_all(&out).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Next frame from the session, `None` on EOF
    async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }
}

fn session_with_raw_peer(config: Config) -> (Session, RawPeer) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (Session::new(a, config).unwrap(), RawPeer::new(b))
}

async fn closed_with(session: &Session) -> Option<Error> {
    tokio::time::timeout(TIMEOUT, session.closed())
        .await
        .expect("session should terminate")
}

#[tokio::test]
async fn test_ping_pong() {
    init_tracing();
    let (client, server) = session_pair(Config::default());

    let stream = client.open_stream().await.unwrap();
    stream.write(b"ping").await.unwrap();
    stream.close_write().await.unwrap();

    let accepted = tokio::time::timeout(TIMEOUT, server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.key(), StreamKey::new(0, Origin::Receiver));

    let mut received = Vec::new();
    while let Some(chunk) = accepted.read_chunk().await.unwrap() {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"ping");

    accepted.write(b"pong").await.unwrap();
    accepted.close_write().await.unwrap();
    assert_eq!(accepted.state(), StreamState::Closed);
    assert_eq!(server.stream_count(), 0);

    assert_eq!(stream.read_chunk().await.unwrap().unwrap(), "pong");
    assert!(stream.read_chunk().await.unwrap().is_none());
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn test_async_io_traits() {
    init_tracing();
    let (client, server) = session_pair(Config::default());

    let mut stream = client.open_stream().await.unwrap();
    let echo = tokio::spawn(async move {
        let mut stream = server.accept_stream().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.shutdown().await.unwrap();
        server
    });

    stream.write_all(b"echo me").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"echo me");

    let _server = echo.await.unwrap();
}

#[tokio::test]
async fn test_stream_key_disambiguation() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    // Local stream 0
    let ours = session.open_stream().await.unwrap();
    let open = peer.recv().await.unwrap();
    assert_eq!(open.kind, MessageKind::NewStream);
    assert_eq!(open.stream_id, 0);
    assert_eq!(&open.payload[..], b"0");

    // Remote stream 0, same numeric id
    peer.send(Frame::new_stream(0, "theirs")).await;
    let theirs = tokio::time::timeout(TIMEOUT, session.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(theirs.key(), StreamKey::new(0, Origin::Receiver));
    assert_eq!(theirs.name(), "theirs");
    assert_eq!(session.stream_count(), 2);

    // From the peer's view: stream it initiated, and stream it received
    peer.send(Frame::message(
        StreamKey::new(0, Origin::Initiator),
        Bytes::from_static(b"to theirs"),
    ))
    .await;
    peer.send(Frame::message(
        StreamKey::new(0, Origin::Receiver),
        Bytes::from_static(b"to ours"),
    ))
    .await;

    assert_eq!(theirs.read_chunk().await.unwrap().unwrap(), "to theirs");
    assert_eq!(ours.read_chunk().await.unwrap().unwrap(), "to ours");

    // Replies carry the matching direction tag
    ours.write(b"a").await.unwrap();
    theirs.write(b"b").await.unwrap();
    let first = peer.recv().await.unwrap();
    let second = peer.recv().await.unwrap();
    assert_eq!(first.kind, MessageKind::MessageFromInitiator);
    assert_eq!(&first.payload[..], b"a");
    assert_eq!(second.kind, MessageKind::MessageFromReceiver);
    assert_eq!(&second.payload[..], b"b");
}

#[tokio::test]
async fn test_half_close() {
    init_tracing();
    let (client, server) = session_pair(Config::default());

    let stream = client.open_stream().await.unwrap();
    let accepted = server.accept_stream().await.unwrap();

    stream.close_write().await.unwrap();
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    assert!(matches!(stream.write(b"late").await, Err(Error::StreamClosed)));

    // Peer sees EOF but may keep writing
    assert!(accepted.read_chunk().await.unwrap().is_none());
    assert_eq!(accepted.state(), StreamState::HalfClosedRemote);
    accepted.write(b"still here").await.unwrap();

    assert_eq!(stream.read_chunk().await.unwrap().unwrap(), "still here");
    assert_eq!(client.stream_count(), 1);
}

#[tokio::test]
async fn test_reset_propagates() {
    init_tracing();
    let (client, server) = session_pair(Config::default());

    let stream = client.open_stream().await.unwrap();
    let accepted = server.accept_stream().await.unwrap();

    let reader = tokio::spawn({
        let accepted = accepted.clone();
        async move { accepted.read_chunk().await }
    });

    stream.reset();
    assert_eq!(client.stream_count(), 0);

    let result = tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::RemoteReset)));
    assert_eq!(accepted.state(), StreamState::Reset);
    assert!(matches!(accepted.write(b"x").await, Err(Error::StreamReset)));
    assert_eq!(server.stream_count(), 0);
}

#[tokio::test]
async fn test_outbound_stream_limit() {
    init_tracing();
    let (client, server) = session_pair(Config::default().with_max_streams(2));

    let first = client.open_stream().await.unwrap();
    let _second = client.open_stream().await.unwrap();
    assert!(matches!(
        client.open_stream().await,
        Err(Error::TooManyStreams(2))
    ));

    // Removal frees a slot
    let _accepted = server.accept_stream().await.unwrap();
    first.reset();
    let third = client.open_stream().await.unwrap();
    assert_eq!(third.id(), 2);
}

#[tokio::test]
async fn test_inbound_stream_limit() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default().with_max_streams(1));

    peer.send(Frame::new_stream(0, "0")).await;
    peer.send(Frame::new_stream(1, "1")).await;

    let accepted = session.accept_stream().await.unwrap();
    assert_eq!(accepted.id(), 0);

    let reset = peer.recv().await.unwrap();
    assert_eq!(reset.kind, MessageKind::ResetFromReceiver);
    assert_eq!(reset.stream_id, 1);

    assert!(session.is_alive());
    assert_eq!(session.stream_count(), 1);
}

#[tokio::test]
async fn test_inbound_streams_disabled() {
    init_tracing();
    let config = Config::default().with_accept_inbound_streams(false);
    let (session, mut peer) = session_with_raw_peer(config);

    peer.send(Frame::new_stream(5, "unwanted")).await;

    let reset = peer.recv().await.unwrap();
    assert_eq!(reset.kind, MessageKind::ResetFromReceiver);
    assert_eq!(reset.stream_id, 5);
    assert_eq!(session.stream_count(), 0);

    // Outbound still works
    session.open_stream().await.unwrap();
    assert_eq!(peer.recv().await.unwrap().kind, MessageKind::NewStream);
}

#[tokio::test]
async fn test_duplicate_stream_aborts() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    peer.send(Frame::new_stream(3, "3")).await;
    let accepted = session.accept_stream().await.unwrap();
    peer.send(Frame::new_stream(3, "3")).await;

    let cause = closed_with(&session).await;
    assert!(matches!(
        cause,
        Some(Error::DuplicateStream(key)) if key == StreamKey::new(3, Origin::Receiver)
    ));
    assert!(matches!(accepted.read_chunk().await, Err(Error::DuplicateStream(_))));
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_invalid_header_aborts() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    // Kind code 7 on stream 0, empty payload
    peer.send_raw(&[0x07, 0x00]).await;

    let cause = closed_with(&session).await;
    assert!(matches!(cause, Some(Error::InvalidFrameHeader(7))));
    assert!(matches!(session.state(), SessionState::Aborted(_)));
    assert!(matches!(session.open_stream().await, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn test_oversized_frame_aborts() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default().with_max_message_size(16));

    // MessageFromInitiator on stream 0 announcing 17 bytes
    peer.send_raw(&[0x02, 17]).await;

    let cause = closed_with(&session).await;
    assert!(matches!(cause, Some(Error::FrameTooLarge(17, 16))));
}

#[tokio::test]
async fn test_eof_mid_frame() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    peer.send(Frame::new_stream(0, "0")).await;
    let accepted = session.accept_stream().await.unwrap();

    // Header and length for 10 bytes, then only 3 of them
    peer.send_raw(&[0x02, 10, b'a', b'b', b'c']).await;
    drop(peer);

    let cause = closed_with(&session).await;
    assert!(matches!(
        &cause,
        Some(Error::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof
    ));
    assert!(matches!(accepted.read_chunk().await, Err(Error::Io(_))));
}

#[tokio::test]
async fn test_clean_eof_aborts_streams() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    let ours = session.open_stream().await.unwrap();
    peer.recv().await.unwrap();
    drop(peer);

    assert!(matches!(closed_with(&session).await, Some(Error::ConnectionClosed)));
    assert!(matches!(ours.read_chunk().await, Err(Error::ConnectionClosed)));
    assert_eq!(session.stream_count(), 0);
}

#[tokio::test]
async fn test_unknown_stream_ignored() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    peer.send(Frame::message(
        StreamKey::new(42, Origin::Initiator),
        Bytes::from_static(b"nobody home"),
    ))
    .await;
    peer.send(Frame::close(StreamKey::new(42, Origin::Initiator))).await;
    peer.send(Frame::reset(StreamKey::new(43, Origin::Receiver))).await;
    peer.send(Frame::new_stream(1, "1")).await;

    let accepted = tokio::time::timeout(TIMEOUT, session.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.id(), 1);
    assert!(session.is_alive());
}

#[tokio::test]
async fn test_write_splitting() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default().with_max_message_size(16));

    let stream = session.open_stream().await.unwrap();
    peer.recv().await.unwrap();

    let data: Vec<u8> = (0..100u8).collect();
    stream.write(&data).await.unwrap();

    let mut received = Vec::new();
    let mut frames = 0;
    while received.len() < data.len() {
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.kind, MessageKind::MessageFromInitiator);
        assert!(frame.payload.len() <= 16);
        received.extend_from_slice(&frame.payload);
        frames += 1;
    }
    assert_eq!(received, data);
    assert_eq!(frames, 7);
}

#[tokio::test]
async fn test_slow_consumer_reset() {
    init_tracing();
    let config = Config::default()
        .with_max_stream_buffer_size(8)
        .with_backpressure_timeout(Duration::from_millis(100));
    let (session, mut peer) = session_with_raw_peer(config);

    peer.send(Frame::new_stream(0, "0")).await;
    let accepted = session.accept_stream().await.unwrap();

    let key = StreamKey::new(0, Origin::Initiator);
    peer.send(Frame::message(key, Bytes::from_static(b"12345678"))).await;
    peer.send(Frame::message(key, Bytes::from_static(b"overflow"))).await;

    // Nobody reads; the stream is reset once the wait expires
    let reset = peer.recv().await.unwrap();
    assert_eq!(reset.kind, MessageKind::ResetFromReceiver);
    assert_eq!(reset.stream_id, 0);

    assert!(matches!(accepted.read_chunk().await, Err(Error::InputBufferFull)));
    assert!(session.is_alive());
}

#[tokio::test]
async fn test_backpressure_resumes_after_read() {
    init_tracing();
    let config = Config::default().with_max_stream_buffer_size(8);
    let (session, mut peer) = session_with_raw_peer(config);

    peer.send(Frame::new_stream(0, "0")).await;
    let accepted = session.accept_stream().await.unwrap();

    let key = StreamKey::new(0, Origin::Initiator);
    peer.send(Frame::message(key, Bytes::from_static(b"12345678"))).await;
    peer.send(Frame::message(key, Bytes::from_static(b"abcdefgh"))).await;
    peer.send(Frame::close(key)).await;

    let mut received = Vec::new();
    while let Some(chunk) = tokio::time::timeout(TIMEOUT, accepted.read_chunk())
        .await
        .unwrap()
        .unwrap()
    {
        assert!(accepted.buffered_len() <= 8);
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"12345678abcdefgh");
}

#[tokio::test]
async fn test_concurrent_writers_do_not_interleave() {
    init_tracing();
    let (client, server) = session_pair(Config::default().with_max_message_size(1024));

    let a = client.open_named_stream("a").await.unwrap();
    let b = client.open_named_stream("b").await.unwrap();

    let writers: Vec<_> = [(a, b'a'), (b, b'b')]
        .into_iter()
        .map(|(stream, byte)| {
            tokio::spawn(async move {
                let chunk = vec![byte; 3000];
                for _ in 0..50 {
                    stream.write(&chunk).await.unwrap();
                }
                stream.close_write().await.unwrap();
            })
        })
        .collect();

    let mut readers = Vec::new();
    for _ in 0..2 {
        let stream = server.accept_stream().await.unwrap();
        readers.push(tokio::spawn(async move {
            let expected = stream.name().as_bytes()[0];
            let mut total = 0;
            while let Some(chunk) = stream.read_chunk().await.unwrap() {
                assert!(chunk.iter().all(|&byte| byte == expected));
                total += chunk.len();
            }
            total
        }));
    }

    for writer in writers {
        writer.await.unwrap();
    }
    for reader in readers {
        let total = tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();
        assert_eq!(total, 3000 * 50);
    }
}

#[tokio::test]
async fn test_graceful_close() {
    init_tracing();
    let (session, mut peer) = session_with_raw_peer(Config::default());

    let first = session.open_stream().await.unwrap();
    let second = session.open_stream().await.unwrap();
    first.write(b"bye").await.unwrap();

    tokio::time::timeout(TIMEOUT, session.close())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(session.state(), SessionState::Closed));
    assert!(session.closed().await.is_none());

    let mut frames = Vec::new();
    while let Some(frame) = peer.recv().await {
        frames.push(frame);
    }
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[2].kind, MessageKind::MessageFromInitiator);
    assert_eq!(&frames[2].payload[..], b"bye");
    let mut closed: Vec<u64> = frames[3..]
        .iter()
        .filter(|frame| frame.kind == MessageKind::CloseFromInitiator)
        .map(|frame| frame.stream_id)
        .collect();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 1]);

    // Still half-open streams end with the session
    assert!(matches!(first.read_chunk().await, Err(Error::SessionClosed)));
    assert!(matches!(second.read_chunk().await, Err(Error::SessionClosed)));
    assert!(matches!(session.open_stream().await, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn test_abort_fans_out() {
    init_tracing();
    let (client, server) = session_pair(Config::default());

    let mut pending = Vec::new();
    for _ in 0..3 {
        let stream = client.open_stream().await.unwrap();
        pending.push(tokio::spawn(async move { stream.read_chunk().await }));
    }
    tokio::task::yield_now().await;

    client.abort(Error::Protocol("test".into()));

    for reader in pending {
        let result = tokio::time::timeout(TIMEOUT, reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
    assert_eq!(client.stream_count(), 0);

    // Peer sees the connection go away
    assert!(matches!(closed_with(&server).await, Some(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_external_cancellation() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let token = CancellationToken::new();
    let session = Session::with_cancellation(a, Config::default(), token.clone()).unwrap();
    let mut peer = RawPeer::new(b);

    let stream = session.open_stream().await.unwrap();
    peer.recv().await.unwrap();

    token.cancel();

    assert!(matches!(closed_with(&session).await, Some(Error::Cancelled)));
    assert!(matches!(stream.read_chunk().await, Err(Error::Cancelled)));
    assert!(peer.recv().await.is_none());
    assert!(session.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_dropped_stream_frees_slot() {
    init_tracing();
    let (client, server) = session_pair(Config::default().with_max_streams(1));

    let stream = client.open_stream().await.unwrap();
    stream.write(b"once").await.unwrap();
    stream.close_write().await.unwrap();

    let accepted = server.accept_stream().await.unwrap();
    while accepted.read_chunk().await.unwrap().is_some() {}
    drop(accepted);
    assert_eq!(server.stream_count(), 0);

    // The peer learns the handler went away
    let result = tokio::time::timeout(TIMEOUT, stream.read_chunk()).await.unwrap();
    assert!(matches!(result, Err(Error::RemoteReset)));
    assert_eq!(client.stream_count(), 0);

    // The freed slot takes the next stream instead of rejecting it
    let next = client.open_stream().await.unwrap();
    let accepted = tokio::time::timeout(TIMEOUT, server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.id(), next.id());
    assert_eq!(server.stream_count(), 1);
}

#[tokio::test]
async fn test_full_accept_queue_does_not_stall_session() {
    init_tracing();
    let config = Config::default()
        .with_incoming_queue_capacity(1)
        .with_backpressure_timeout(Duration::from_millis(100));
    let (session, mut peer) = session_with_raw_peer(config);

    let mine = session.open_stream().await.unwrap();
    assert_eq!(peer.recv().await.unwrap().kind, MessageKind::NewStream);

    // Nobody accepts: the first fills the queue, the second times out
    peer.send(Frame::new_stream(0, "0")).await;
    peer.send(Frame::new_stream(1, "1")).await;
    let reset = peer.recv().await.unwrap();
    assert_eq!(reset.kind, MessageKind::ResetFromReceiver);
    assert_eq!(reset.stream_id, 1);

    // Traffic for other streams keeps flowing
    peer.send(Frame::message(
        StreamKey::new(0, Origin::Receiver),
        Bytes::from_static(b"reply"),
    ))
    .await;
    let chunk = tokio::time::timeout(TIMEOUT, mine.read_chunk())
        .await
        .expect("reader should not stall")
        .unwrap();
    assert_eq!(chunk.unwrap(), "reply");

    let queued = session.accept_stream().await.unwrap();
    assert_eq!(queued.key(), StreamKey::new(0, Origin::Receiver));
    assert_eq!(session.stream_count(), 2);
}

#[tokio::test]
async fn test_stream_ended_notifications() {
    init_tracing();
    let (client, server) = session_pair(Config::default());
    let mut client_ended = client.stream_ended();
    let mut server_ended = server.stream_ended();

    async fn next_ended(rx: &mut tokio::sync::broadcast::Receiver<StreamKey>) -> StreamKey {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("stream should end")
            .unwrap()
    }

    // Close on both sides
    let stream = client.open_stream().await.unwrap();
    let accepted = server.accept_stream().await.unwrap();
    stream.close_write().await.unwrap();
    assert!(accepted.read_chunk().await.unwrap().is_none());
    accepted.close_write().await.unwrap();
    assert_eq!(
        next_ended(&mut server_ended).await,
        StreamKey::new(0, Origin::Receiver)
    );
    assert!(stream.read_chunk().await.unwrap().is_none());
    assert_eq!(
        next_ended(&mut client_ended).await,
        StreamKey::new(0, Origin::Initiator)
    );

    // Reset
    let second = client.open_stream().await.unwrap();
    let _accepted = server.accept_stream().await.unwrap();
    second.reset();
    assert_eq!(
        next_ended(&mut client_ended).await,
        StreamKey::new(1, Origin::Initiator)
    );
    assert_eq!(
        next_ended(&mut server_ended).await,
        StreamKey::new(1, Origin::Receiver)
    );
}

#[tokio::test]
async fn test_streams_lists_held_handles() {
    init_tracing();
    let (client, _server) = session_pair(Config::default());

    let kept = client.open_named_stream("kept").await.unwrap();
    let _also = client.open_named_stream("also").await.unwrap();

    let mut names: Vec<String> = client
        .streams()
        .iter()
        .map(|stream| stream.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["also", "kept"]);

    // Listed handles count as application handles
    let listed = client.streams();
    drop(kept);
    assert_eq!(client.stream_count(), 2);
    drop(listed);
    assert_eq!(client.stream_count(), 1);
}

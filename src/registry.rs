use crate::error::{Error, Result};
use crate::protocol::StreamKey;
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Ended-stream notifications kept for slow subscribers before they lag
const ENDED_CHANNEL_CAPACITY: usize = 128;

/// Open streams of one session, keyed by (id, origin).
///
/// Shared between the session and its streams; a stream removes itself once
/// both directions are done. Once closed, no further inserts succeed.
///
/// Every key that leaves the registry is announced on the `ended` channel.
#[derive(Debug)]
pub(crate) struct StreamRegistry {
    max_streams: usize,
    inner: Mutex<Inner>,
    ended: broadcast::Sender<StreamKey>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamKey, Stream>,
    closed: bool,
}

impl StreamRegistry {
    pub(crate) fn new(max_streams: usize) -> Self {
        let (ended, _) = broadcast::channel(ENDED_CHANNEL_CAPACITY);
        Self {
            max_streams,
            inner: Mutex::new(Inner::default()),
            ended,
        }
    }

    pub(crate) fn subscribe_ended(&self) -> broadcast::Receiver<StreamKey> {
        self.ended.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, stream: Stream) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::SessionClosed);
        }
        let key = stream.key();
        if inner.streams.contains_key(&key) {
            return Err(Error::DuplicateStream(key));
        }
        if inner.streams.len() >= self.max_streams {
            return Err(Error::TooManyStreams(self.max_streams));
        }
        inner.streams.insert(key, stream);
        Ok(())
    }

    pub(crate) fn get(&self, key: &StreamKey) -> Option<Stream> {
        self.lock().streams.get(key).cloned()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.lock().streams.len() >= self.max_streams
    }

    /// Remove `stream`, but only if its key still maps to that same stream
    pub(crate) fn remove(&self, stream: &Stream) -> bool {
        let key = stream.key();
        {
            let mut inner = self.lock();
            match inner.streams.get(&key) {
                Some(current) if current.same_stream(stream) => {
                    inner.streams.remove(&key);
                }
                _ => return false,
            }
        }
        // No subscribers is fine
        let _ = self.ended.send(key);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Stream> {
        self.lock().streams.values().cloned().collect()
    }

    /// Refuse further inserts and hand back everything still registered
    pub(crate) fn close(&self) -> Vec<Stream> {
        let streams: Vec<Stream> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in &streams {
            let _ = self.ended.send(stream.key());
        }
        streams
    }
}

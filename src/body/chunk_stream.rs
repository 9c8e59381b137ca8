use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::HttpError;

/// Error returned by [`ChunkSender::send`] once the stream can no longer
/// accept chunks: the consumer is gone or the stream was terminated.
#[derive(Debug, Error)]
#[error("chunk stream closed, consumer no longer accepts chunks")]
pub struct BodyClosed;

/// Terminal state of a live stream.
///
/// `Closed` is set by a regular close: a buffered chunk is still drained
/// before the end (or the close error) surfaces. `Interrupted` is set by a
/// stop request and preempts everything, including a buffered chunk.
enum Terminal {
    Open,
    Closed(Option<HttpError>),
    Interrupted(Option<HttpError>),
}

struct Shared {
    slot: Option<Bytes>,
    terminal: Terminal,
    consumer: Option<Waker>,
    producer: Option<Waker>,
    consumer_gone: bool,
}

impl Shared {
    fn new() -> Self {
        Self {
            slot: None,
            terminal: Terminal::Open,
            consumer: None,
            producer: None,
            consumer_gone: false,
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer.take() {
            waker.wake();
        }
    }

    fn wake_producer(&mut self) {
        if let Some(waker) = self.producer.take() {
            waker.wake();
        }
    }
}

/// A finite lazy sequence of byte chunks.
///
/// Produced either from fixed content (the `From` impls and constructors)
/// or from a live producer via [`ChunkStream::channel`]. A live stream
/// buffers at most one chunk; the producer is suspended from the moment a
/// chunk is buffered until the consumer drains it.
///
/// The stream is not restartable: once it reports the end (or an error) it
/// stays finished.
pub struct ChunkStream {
    source: Source,
    size_hint: Option<u64>,
}

enum Source {
    Channel(Rc<RefCell<Shared>>),
    Queued(VecDeque<Bytes>),
}

impl ChunkStream {
    /// Creates a connected producer/consumer pair.
    pub fn channel() -> (ChunkSender, ChunkStream) {
        let shared = Rc::new(RefCell::new(Shared::new()));
        let sender = ChunkSender { shared: shared.clone(), done: false };
        let stream = ChunkStream { source: Source::Channel(shared), size_hint: None };
        (sender, stream)
    }

    /// A stream with no chunks at all.
    pub fn empty() -> Self {
        ChunkStream { source: Source::Queued(VecDeque::new()), size_hint: Some(0) }
    }

    /// A stream yielding a single chunk.
    pub fn once<B: Into<Bytes>>(chunk: B) -> Self {
        let chunk = chunk.into();
        let len = chunk.len() as u64;
        ChunkStream { source: Source::Queued(VecDeque::from([chunk])), size_hint: Some(len) }
    }

    /// A stream yielding the given chunks in order. Empty chunks are kept;
    /// they yield no bytes and the encoders drop them before the wire.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let queue: VecDeque<Bytes> = chunks.into_iter().map(Into::into).collect();
        let total = queue.iter().map(|c| c.len() as u64).sum();
        ChunkStream { source: Source::Queued(queue), size_hint: Some(total) }
    }

    /// Total byte count, when the stream was built from fixed content.
    /// Live channel streams have no size hint and are framed chunked.
    pub fn exact_size(&self) -> Option<u64> {
        self.size_hint
    }

    /// Waits for the next step of the stream.
    ///
    /// Resolves with `Ok(Some(chunk))` when a chunk is available (resuming
    /// the producer), `Ok(None)` at the end of the stream, or the terminal
    /// error. After the error has been reported once, further calls yield
    /// `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<Bytes>, HttpError> {
        match &mut self.source {
            Source::Queued(queue) => Ok(queue.pop_front()),
            Source::Channel(shared) => NextChunk { shared: shared.clone() }.await,
        }
    }

    /// Drains the stream to completion, concatenating every chunk.
    pub async fn collect(&mut self) -> Result<Bytes, HttpError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if let Source::Channel(shared) = &self.source {
            let mut shared = shared.borrow_mut();
            shared.consumer_gone = true;
            shared.wake_producer();
        }
    }
}

impl From<&'static str> for ChunkStream {
    fn from(s: &'static str) -> Self {
        ChunkStream::once(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ChunkStream {
    fn from(s: String) -> Self {
        ChunkStream::once(Bytes::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for ChunkStream {
    fn from(v: Vec<u8>) -> Self {
        ChunkStream::once(Bytes::from(v))
    }
}

impl From<Bytes> for ChunkStream {
    fn from(b: Bytes) -> Self {
        ChunkStream::once(b)
    }
}

struct NextChunk {
    shared: Rc<RefCell<Shared>>,
}

impl Future for NextChunk {
    type Output = Result<Option<Bytes>, HttpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.borrow_mut();
        let shared = &mut *guard;

        if matches!(shared.terminal, Terminal::Interrupted(_)) {
            let error = match std::mem::replace(&mut shared.terminal, Terminal::Closed(None)) {
                Terminal::Interrupted(error) => error,
                _ => unreachable!("matched interrupted terminal"),
            };
            shared.slot = None;
            shared.wake_producer();
            return Poll::Ready(match error {
                Some(error) => Err(error),
                None => Ok(None),
            });
        }

        if let Some(chunk) = shared.slot.take() {
            shared.wake_producer();
            return Poll::Ready(Ok(Some(chunk)));
        }

        match &mut shared.terminal {
            Terminal::Closed(error) => Poll::Ready(match error.take() {
                Some(error) => Err(error),
                None => Ok(None),
            }),
            Terminal::Open => {
                shared.consumer = Some(cx.waker().clone());
                Poll::Pending
            }
            Terminal::Interrupted(_) => unreachable!("interrupted state handled above"),
        }
    }
}

/// Producer half of a [`ChunkStream::channel`] pair.
///
/// Exactly one of `close` or `fail` terminates the stream; dropping the
/// sender without either closes it with a truncation error so a consumer
/// never hangs on a producer that went away.
pub struct ChunkSender {
    shared: Rc<RefCell<Shared>>,
    done: bool,
}

impl ChunkSender {
    /// Hands one chunk to the stream.
    ///
    /// Suspends while the previous chunk has not been drained: this is the
    /// producer-pause window. Fails once the stream is terminated or the
    /// consumer is gone.
    pub fn send(&mut self, chunk: Bytes) -> SendChunk<'_> {
        SendChunk { shared: &self.shared, chunk: Some(chunk) }
    }

    /// Terminates the stream. `Ok(())` marks a clean end; an error is
    /// surfaced to the consumer after any still-buffered chunk has been
    /// drained. Terminal and idempotent.
    pub fn close(mut self, result: Result<(), HttpError>) {
        self.terminate(Terminal::Closed(result.err()));
    }

    /// Interrupts the stream: the error preempts any buffered chunk and is
    /// raised on the consumer's very next step. Used by stop requests.
    pub fn fail(mut self, error: HttpError) {
        self.terminate(Terminal::Interrupted(Some(error)));
    }

    fn terminate(&mut self, terminal: Terminal) {
        if self.done {
            return;
        }
        self.done = true;
        let mut shared = self.shared.borrow_mut();
        if matches!(shared.terminal, Terminal::Open) {
            if matches!(terminal, Terminal::Interrupted(_)) {
                shared.slot = None;
            }
            shared.terminal = terminal;
        }
        shared.wake_consumer();
    }
}

impl Drop for ChunkSender {
    fn drop(&mut self) {
        self.terminate(Terminal::Closed(Some(HttpError::TruncatedBody)));
    }
}

/// Future returned by [`ChunkSender::send`].
pub struct SendChunk<'a> {
    shared: &'a Rc<RefCell<Shared>>,
    chunk: Option<Bytes>,
}

impl Future for SendChunk<'_> {
    type Output = Result<(), BodyClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut guard = this.shared.borrow_mut();
        let shared = &mut *guard;

        if shared.consumer_gone || !matches!(shared.terminal, Terminal::Open) {
            return Poll::Ready(Err(BodyClosed));
        }

        if shared.slot.is_none() {
            let chunk = this.chunk.take().expect("send future polled after completion");
            shared.slot = Some(chunk);
            shared.wake_consumer();
            return Poll::Ready(Ok(()));
        }

        shared.producer = Some(cx.waker().clone());
        Poll::Pending
    }
}

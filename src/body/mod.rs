//! Lazy body streaming.
//!
//! [`ChunkStream`] is the body type on both sides of the wire: a finite,
//! non-restartable sequence of byte chunks with a one-slot buffer between
//! producer and consumer. The producer half ([`ChunkSender`]) cannot get
//! ahead of the consumer: `send` completes only once the previous chunk has
//! been drained, which propagates backpressure all the way to the socket.

mod chunk_stream;

pub use chunk_stream::BodyClosed;
pub use chunk_stream::ChunkSender;
pub use chunk_stream::ChunkStream;

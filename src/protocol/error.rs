//! Error types for the HTTP core.
//!
//! [`HttpError`] is the single user-facing error type. It distinguishes
//! protocol errors seen while decoding ([`ParseError`]), errors while
//! encoding or writing ([`SendError`]), transport failures (connect and
//! socket errors), cooperative interruption via a stop token, and bodies
//! cut short by the peer. HTTP status codes (including 4xx and 5xx) are
//! never errors; status is data carried by the response.

use std::io;
use thiserror::Error;

/// The top-level error type for client and server operations.
#[derive(Debug, Error)]
pub enum HttpError {
    /// A protocol error while decoding an incoming message.
    #[error("protocol error: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    /// An error while encoding or writing an outgoing message.
    #[error("send error: {source}")]
    Send {
        #[from]
        source: SendError,
    },

    /// A transport-level failure: connect, socket or shutdown error.
    /// Carries a human-readable message and, when available, the
    /// underlying I/O error (whose OS code is preserved).
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The operation was interrupted by a stop request.
    #[error("interrupted by stop request")]
    Interrupted,

    /// The peer went away before the body completed.
    #[error("body truncated before completion")]
    TruncatedBody,
}

impl HttpError {
    /// Creates a transport error from a message and an I/O cause.
    pub fn transport<S: ToString>(message: S, source: io::Error) -> Self {
        Self::Transport { message: message.to_string(), source: Some(source) }
    }

    /// Creates a transport error that has no I/O cause (e.g. a timeout).
    pub fn transport_msg<S: ToString>(message: S) -> Self {
        Self::Transport { message: message.to_string(), source: None }
    }

    /// Returns true if this error is the interruption marker.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Errors raised while parsing incoming HTTP messages.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Head size exceeds the maximum allowed size.
    #[error("head too large, current: {current} exceeds the limit {max}")]
    TooLargeHead { current: usize, max: usize },

    /// Number of headers exceeds the maximum allowed.
    #[error("header count exceeds the limit {max}")]
    TooManyHeaders { max: usize },

    /// Malformed request line, status line or header line.
    #[error("invalid head: {reason}")]
    InvalidHead { reason: String },

    /// Unsupported HTTP version.
    #[error("invalid http version")]
    InvalidVersion,

    /// Invalid or unsupported HTTP method.
    #[error("invalid http method")]
    InvalidMethod,

    /// Invalid URI.
    #[error("invalid http uri")]
    InvalidUri,

    /// Unparseable status code on a response.
    #[error("invalid http status: {reason}")]
    InvalidStatus { reason: String },

    /// Invalid Content-Length header.
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// Invalid message body.
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// I/O error while reading.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_head(current: usize, max: usize) -> Self {
        Self::TooLargeHead { current, max }
    }

    pub fn too_many_headers(max: usize) -> Self {
        Self::TooManyHeaders { max }
    }

    pub fn invalid_head<S: ToString>(reason: S) -> Self {
        Self::InvalidHead { reason: reason.to_string() }
    }

    pub fn invalid_status<S: ToString>(reason: S) -> Self {
        Self::InvalidStatus { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors raised while encoding or writing outgoing HTTP messages.
#[derive(Error, Debug)]
pub enum SendError {
    /// The body cannot be encoded as framed.
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// I/O error while writing.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

use bytes::Bytes;

/// A frame flowing through the codec layer: either a message head or a
/// piece of the payload that follows it.
///
/// `T` is the head type: `(RequestHead, PayloadSize)` on the server read
/// path and client write path, `(ResponseHead, PayloadSize)` on the other
/// two.
pub enum Message<T> {
    /// The decoded (or to-be-encoded) head of a request or response.
    Head(T),
    /// A piece of the payload following the head.
    Payload(PayloadItem),
}

impl<T> Message<T> {
    /// Returns true if this frame carries payload data or the payload end.
    #[inline]
    pub fn is_payload(&self) -> bool {
        matches!(self, Message::Payload(_))
    }

    /// Returns true if this frame carries a message head.
    #[inline]
    pub fn is_head(&self) -> bool {
        matches!(self, Message::Head(_))
    }

    /// Extracts the payload item, if any.
    pub fn into_payload_item(self) -> Option<PayloadItem> {
        match self {
            Message::Head(_) => None,
            Message::Payload(item) => Some(item),
        }
    }
}

impl<T> From<Bytes> for Message<T> {
    fn from(bytes: Bytes) -> Self {
        Message::Payload(PayloadItem::Chunk(bytes))
    }
}

/// One step of a message payload: a chunk of bytes or the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem {
    /// A chunk of payload data. May be empty; empty chunks are dropped by
    /// the encoders so they never reach the wire.
    Chunk(Bytes),
    /// End of the payload.
    Eof,
}

impl PayloadItem {
    /// Returns true if this item marks the end of the payload.
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    /// Returns true if this item carries data.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }

    /// Returns the contained bytes, if this is a chunk.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }

    /// Consumes the item, returning the contained bytes if this is a chunk.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}

/// How the payload of a message is delimited on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Exactly this many bytes follow (Content-Length framing).
    Length(u64),
    /// Chunked transfer encoding.
    Chunked,
    /// The payload runs until the peer closes the connection. Only valid
    /// for response bodies read by the client.
    Unbounded,
    /// No payload at all.
    Empty,
}

impl PayloadSize {
    /// Returns true if the payload uses chunked transfer encoding.
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    /// Returns true if there is no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

//! Response framing: the client-side decoder and the server-side encoder.

use bytes::BytesMut;
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::{Decoder, Encoder};
use tracing::error;

use crate::codec::head::{encode_response_head, ResponseHeadDecoder};
use crate::codec::payload::{PayloadDecoder, PayloadEncoder};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHead, SendError};

/// Streaming decoder for incoming responses (client read path).
///
/// Built per request: a HEAD request's response never carries a body, so
/// the decoder must know which kind of request it is reading for.
pub struct ResponseDecoder {
    head_decoder: ResponseHeadDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl ResponseDecoder {
    pub fn new(head_request: bool) -> Self {
        Self { head_decoder: ResponseHeadDecoder::new(head_request), payload_decoder: None }
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let message = match self.head_decoder.decode(src)? {
            Some((head, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Head((head, payload_size)))
            }
            None => None,
        };
        Ok(message)
    }

    /// End-of-stream handling: until-close bodies end here cleanly, the
    /// delimited kinds must already be complete, and a connection closed
    /// before (or inside) the head is a decode error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode_at_eof(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        if src.is_empty() {
            Ok(None)
        } else {
            match self.head_decoder.decode(src)? {
                Some((head, payload_size)) => {
                    self.payload_decoder = Some(payload_size.into());
                    Ok(Some(Message::Head((head, payload_size))))
                }
                None => Err(ParseError::invalid_head("connection closed inside a response head")),
            }
        }
    }
}

/// Streaming encoder for outgoing responses (server write path).
///
/// Reusable across a keep-alive connection: once a payload is fully
/// framed, the encoder accepts the next head.
pub struct ResponseEncoder {
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { payload_encoder: None }
    }
}

impl Encoder<Message<(ResponseHead, PayloadSize)>> for ResponseEncoder {
    type Error = SendError;

    fn encode(
        &mut self,
        item: Message<(ResponseHead, PayloadSize)>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::Head((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expected payload item but got a response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                encode_response_head(head, payload_size, dst)?;
                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expected response head but got a payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}

//! Request framing: the server-side decoder and the client-side encoder.

use bytes::BytesMut;
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::{Decoder, Encoder};
use tracing::error;

use crate::codec::head::{encode_request_head, RequestHeadDecoder};
use crate::codec::payload::{PayloadDecoder, PayloadEncoder};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead, SendError};

/// Streaming decoder for incoming requests (server read path).
///
/// Two-phase: the head first, then the payload that the head announced.
/// After the payload's `Eof` the decoder is back in head phase, ready for
/// the next request on a keep-alive connection.
pub struct RequestDecoder {
    head_decoder: RequestHeadDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self { head_decoder: RequestHeadDecoder, payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHead, PayloadSize)>;
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
            // a request head was cut off mid-line
            match self.head_decoder.decode(src)? {
                Some((head, payload_size)) => {
                    self.payload_decoder = Some(payload_size.into());
                    Ok(Some(Message::Head((head, payload_size))))
                }
                None => Err(ParseError::invalid_head("connection closed inside a request head")),
            }
        }
    }
}

/// Streaming encoder for outgoing requests (client write path).
pub struct RequestEncoder {
    payload_encoder: Option<PayloadEncoder>,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for RequestEncoder {
    fn default() -> Self {
        Self { payload_encoder: None }
    }
}

impl Encoder<Message<(RequestHead, PayloadSize)>> for RequestEncoder {
    type Error = SendError;

    fn encode(
        &mut self,
        item: Message<(RequestHead, PayloadSize)>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::Head((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expected payload item but got a request head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                encode_request_head(head, payload_size, dst)?;
                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expected request head but got a payload item");
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

//! The HTTP client engine.
//!
//! [`Client::fetch`] runs one request/response exchange over its own
//! connection. The returned [`Task`] resolves with the response as soon as
//! the status line and headers are decoded, before the body, which
//! surfaces as a lazy [`ChunkStream`]. The socket is only read ahead of the
//! consumer by the stream's one-chunk slot, so a slow consumer pauses the
//! transfer, and a fired stop token interrupts it at the next step.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, Uri};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::body::{ChunkSender, ChunkStream};
use crate::codec::{RequestEncoder, ResponseDecoder};
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHead,
};
use crate::runtime::{spawn, spawn_detached, Task};
use crate::stop::{StopSource, StopToken};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Limit on establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(30) }
    }
}

/// The body of an outgoing request.
#[derive(Default)]
pub enum RequestBody {
    /// No body. A GET carries no implicit body and no framing headers.
    #[default]
    Empty,
    /// A complete in-memory body, framed with its exact Content-Length.
    Full(Bytes),
    /// A streamed body: framed with Content-Length when the total size is
    /// known (declared header or exact-size stream), chunked otherwise.
    Stream(ChunkStream),
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Full(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Full(Bytes::from(v))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Full(Bytes::from(s.into_bytes()))
    }
}

impl From<ChunkStream> for RequestBody {
    fn from(stream: ChunkStream) -> Self {
        RequestBody::Stream(stream)
    }
}

/// The HTTP client engine. Cheap to clone; each fetch opens its own
/// connection.
#[derive(Debug, Clone, Default)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Issues one request.
    ///
    /// The task resolves once status and headers are known; 4xx and 5xx
    /// are ordinary responses, not errors. If the stop token fires before
    /// the head arrives the task fails with [`HttpError::Interrupted`];
    /// if it fires during the body, the next [`ChunkStream::next`] call
    /// raises the interruption and no further chunks are delivered.
    pub fn fetch(
        &self,
        request: Request<RequestBody>,
        stop: StopToken,
    ) -> Task<Response<ChunkStream>> {
        let connect_timeout = self.config.connect_timeout;
        spawn(run_exchange(request, stop, connect_timeout))
    }
}

/// Shared state of one in-flight exchange.
///
/// The upload task funnels its failure here and trips the abort signal, so
/// an upload error tears the whole exchange down, including a download
/// already in progress. The writer half parks here between the end of the
/// upload and the end of the exchange, keeping the connection open.
struct Exchange {
    fault: RefCell<Option<HttpError>>,
    abort: StopSource,
    writer: RefCell<Option<FramedWrite<OwnedWriteHalf, RequestEncoder>>>,
}

impl Exchange {
    fn new(writer: FramedWrite<OwnedWriteHalf, RequestEncoder>) -> Self {
        Self {
            fault: RefCell::new(None),
            abort: StopSource::new(),
            writer: RefCell::new(Some(writer)),
        }
    }

    fn fail(&self, error: HttpError) {
        let mut fault = self.fault.borrow_mut();
        if fault.is_none() {
            *fault = Some(error);
        }
        drop(fault);
        self.abort.request_stop();
    }

    fn take_fault(&self) -> HttpError {
        self.fault.borrow_mut().take().unwrap_or(HttpError::Interrupted)
    }
}

async fn run_exchange(
    request: Request<RequestBody>,
    stop: StopToken,
    connect_timeout: Duration,
) -> Result<Response<ChunkStream>, HttpError> {
    let (mut parts, body) = request.into_parts();
    let (host, port) = http_target(&parts.uri)?;
    let head_request = parts.method == Method::HEAD;

    if !parts.headers.contains_key(header::HOST) {
        let authority = parts.uri.authority().expect("authority checked above").as_str();
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(authority).map_err(|_| ParseError::InvalidUri)?,
        );
    }
    let payload_size = request_payload_size(&parts.headers, &body)?;

    let connect = TcpStream::connect((host.as_str(), port));
    let stream = select! {
        biased;
        () = stop.stopped() => return Err(HttpError::Interrupted),
        connected = tokio::time::timeout(connect_timeout, connect) => match connected {
            Err(_) => return Err(HttpError::transport_msg(format!("connect to {host}:{port} timed out"))),
            Ok(Err(e)) => return Err(HttpError::transport(format!("connect to {host}:{port} failed"), e)),
            Ok(Ok(stream)) => stream,
        },
    };
    stream.set_nodelay(true).ok();
    debug!(%host, port, method = %parts.method, "connected");

    let (read_half, write_half) = stream.into_split();
    let mut framed_read =
        FramedRead::with_capacity(read_half, ResponseDecoder::new(head_request), READ_BUFFER_SIZE);
    let mut framed_write = FramedWrite::new(write_half, RequestEncoder::new());

    let head = RequestHead::from(Request::from_parts(parts, ()));
    let head_frame = Message::Head((head, payload_size));
    // a zero-length upload frames no body at all, so the head flushes alone
    let has_body_frames = !matches!(payload_size, PayloadSize::Empty | PayloadSize::Length(0));
    if has_body_frames {
        // flushed together with the first body chunk
        framed_write.feed(head_frame).await?;
    } else {
        framed_write.send(head_frame).await?;
    }

    let exchange = Rc::new(Exchange::new(framed_write));
    if has_body_frames {
        spawn_detached(send_request_body(exchange.clone(), body, stop.clone()));
    }

    let aborted = exchange.abort.token();
    let frame = select! {
        biased;
        () = stop.stopped() => return Err(HttpError::Interrupted),
        () = aborted.stopped() => return Err(exchange.take_fault()),
        frame = framed_read.next() => frame,
    };

    let (head, payload_size) = match frame {
        Some(Ok(Message::Head(head))) => head,
        Some(Ok(Message::Payload(_))) => {
            unreachable!("decoder yields a head before any payload")
        }
        // an unparseable status line is a transport failure, not a
        // skippable protocol error
        Some(Err(ParseError::InvalidStatus { reason })) => {
            return Err(HttpError::transport_msg(reason))
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(HttpError::transport_msg("connection closed before the response head")),
    };
    trace!(status = %head.status(), "response head received");

    // ownership of the connection moves to the body pump here
    let (parts, ()) = head.into_inner().into_parts();
    let body = if payload_size.is_empty() {
        ChunkStream::empty()
    } else {
        let (sender, body) = ChunkStream::channel();
        spawn_detached(pump_response_body(framed_read, sender, stop, exchange));
        body
    };
    Ok(Response::from_parts(parts, body))
}

/// Extracts host and port, admitting only plain-http targets.
fn http_target(uri: &Uri) -> Result<(String, u16), HttpError> {
    if let Some(scheme) = uri.scheme_str() {
        if scheme != "http" {
            return Err(HttpError::transport_msg(format!("unsupported scheme {scheme}")));
        }
    }
    let host = uri.host().ok_or(ParseError::InvalidUri)?.to_string();
    let port = uri.port_u16().unwrap_or(80);
    Ok((host, port))
}

/// Chooses the upload framing: a declared Content-Length wins, then the
/// body's own exact size; a stream of unknown size goes out chunked.
fn request_payload_size(headers: &HeaderMap, body: &RequestBody) -> Result<PayloadSize, HttpError> {
    let declared = match headers.get(header::CONTENT_LENGTH) {
        None => None,
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
            let parsed = text.trim().parse::<u64>().map_err(|_| {
                ParseError::invalid_content_length(format!("value {text} is not u64"))
            })?;
            Some(parsed)
        }
    };

    Ok(match body {
        RequestBody::Empty => match declared {
            Some(n) => PayloadSize::Length(n),
            None => PayloadSize::Empty,
        },
        RequestBody::Full(bytes) => PayloadSize::Length(declared.unwrap_or(bytes.len() as u64)),
        RequestBody::Stream(stream) => match declared.or(stream.exact_size()) {
            Some(n) => PayloadSize::Length(n),
            None => PayloadSize::Chunked,
        },
    })
}

/// Detached upload task: advances the request-body generator chunk by
/// chunk. Every failure is funneled into the exchange, which aborts the
/// response side as well; an upload failure aborts the download.
async fn send_request_body(
    exchange: Rc<Exchange>,
    body: RequestBody,
    stop: StopToken,
) -> Result<(), HttpError> {
    let mut writer = exchange.writer.borrow_mut().take().expect("writer owned by the upload task");

    let result = select! {
        biased;
        () = stop.stopped() => Err(HttpError::Interrupted),
        result = drive_upload(&mut writer, body) => result,
    };

    // park the writer so the connection stays open for the download
    *exchange.writer.borrow_mut() = Some(writer);
    if let Err(error) = result {
        exchange.fail(error);
    }
    Ok(())
}

async fn drive_upload(
    writer: &mut FramedWrite<OwnedWriteHalf, RequestEncoder>,
    body: RequestBody,
) -> Result<(), HttpError> {
    match body {
        RequestBody::Empty => Ok(()),

        RequestBody::Full(bytes) => {
            writer.send(Message::Payload(PayloadItem::Chunk(bytes))).await?;
            writer.send(Message::Payload(PayloadItem::Eof)).await?;
            Ok(())
        }

        RequestBody::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await? {
                // each send flushes: the transport is paused between chunks
                writer.send(Message::Payload(PayloadItem::Chunk(chunk))).await?;
            }
            writer.send(Message::Payload(PayloadItem::Eof)).await?;
            Ok(())
        }
    }
}

enum PumpEvent {
    Stopped,
    Aborted,
    Frame(Option<Result<Message<(crate::protocol::ResponseHead, PayloadSize)>, ParseError>>),
}

/// Detached download task: forwards decoded body chunks into the stream.
/// `send` completes only when the consumer drained the previous chunk, so
/// the socket is never read ahead of consumer demand.
async fn pump_response_body(
    mut framed_read: FramedRead<OwnedReadHalf, ResponseDecoder>,
    mut sender: ChunkSender,
    stop: StopToken,
    exchange: Rc<Exchange>,
) -> Result<(), HttpError> {
    let aborted = exchange.abort.token();
    loop {
        let event = select! {
            biased;
            () = stop.stopped() => PumpEvent::Stopped,
            () = aborted.stopped() => PumpEvent::Aborted,
            frame = framed_read.next() => PumpEvent::Frame(frame),
        };

        let frame = match event {
            PumpEvent::Stopped => {
                sender.fail(HttpError::Interrupted);
                return Ok(());
            }
            PumpEvent::Aborted => {
                sender.fail(exchange.take_fault());
                return Ok(());
            }
            PumpEvent::Frame(frame) => frame,
        };

        match frame {
            Some(Ok(Message::Payload(PayloadItem::Chunk(chunk)))) => {
                let delivered = select! {
                    biased;
                    () = stop.stopped() => None,
                    delivered = sender.send(chunk) => Some(delivered),
                };
                match delivered {
                    None => {
                        sender.fail(HttpError::Interrupted);
                        return Ok(());
                    }
                    Some(Err(_)) => {
                        // consumer dropped the body: tear the handle down
                        return Ok(());
                    }
                    Some(Ok(())) => {}
                }
            }
            Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                sender.close(Ok(()));
                return Ok(());
            }
            Some(Ok(Message::Head(_))) => {
                sender.fail(ParseError::invalid_head("head frame inside a response body").into());
                return Ok(());
            }
            Some(Err(e)) => {
                sender.close(Err(e.into()));
                return Ok(());
            }
            None => {
                sender.close(Err(HttpError::TruncatedBody));
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_extraction() {
        let uri: Uri = "http://example.test:8080/a/b?c=1".parse().unwrap();
        assert_eq!(http_target(&uri).unwrap(), ("example.test".to_string(), 8080));

        let uri: Uri = "http://example.test/".parse().unwrap();
        assert_eq!(http_target(&uri).unwrap(), ("example.test".to_string(), 80));

        let uri: Uri = "https://example.test/".parse().unwrap();
        assert!(http_target(&uri).is_err());

        let uri: Uri = "/relative".parse().unwrap();
        assert!(http_target(&uri).is_err());
    }

    #[test]
    fn payload_size_selection() {
        let headers = HeaderMap::new();

        assert_eq!(
            request_payload_size(&headers, &RequestBody::Empty).unwrap(),
            PayloadSize::Empty
        );
        assert_eq!(
            request_payload_size(&headers, &RequestBody::from("abc")).unwrap(),
            PayloadSize::Length(3)
        );
        // a fixed-content stream knows its size
        assert_eq!(
            request_payload_size(&headers, &ChunkStream::from_chunks(["ab", "cd"]).into()).unwrap(),
            PayloadSize::Length(4)
        );
        // a live stream does not
        let (_tx, stream) = ChunkStream::channel();
        assert_eq!(
            request_payload_size(&headers, &RequestBody::Stream(stream)).unwrap(),
            PayloadSize::Chunked
        );
    }

    #[test]
    fn declared_content_length_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));

        let empty_stream: RequestBody = ChunkStream::empty().into();
        assert_eq!(
            request_payload_size(&headers, &empty_stream).unwrap(),
            PayloadSize::Length(0)
        );

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("not a number"));
        assert!(request_payload_size(&headers, &RequestBody::Empty).is_err());
    }
}

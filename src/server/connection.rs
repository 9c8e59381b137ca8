//! Per-connection request processing.
//!
//! One [`ServerConnection`] owns the framed halves of an accepted socket
//! and loops over requests (keep-alive). Each request walks RECEIVED →
//! HANDLER_RUNNING → REPLY_STARTED → STREAMING → FINISHED, with the
//! error branch producing a 500 before the reply has started and a plain
//! connection teardown after.

use std::cell::Cell;
use std::rc::Rc;

use futures::{FutureExt, SinkExt, StreamExt};
use http::{Method, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::body::{ChunkSender, ChunkStream};
use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::handler::Handler;
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead,
};
use crate::stop::{StopCallback, StopSource, StopToken};

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub(crate) struct ServerConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
}

impl<R, W> ServerConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), READ_BUFFER_SIZE),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
        }
    }

    /// Processes requests until the client goes away, the server shuts
    /// down, or an unrecoverable framing error occurs. `on_quit` initiates
    /// server shutdown when the quit endpoint is hit.
    pub(crate) async fn process<H, Q>(
        mut self,
        handler: Rc<H>,
        server_stop: StopToken,
        on_quit: Q,
    ) -> Result<(), HttpError>
    where
        H: Handler,
        Q: Fn(),
    {
        loop {
            if server_stop.stop_requested() {
                return Ok(());
            }

            let frame = select! {
                biased;
                () = server_stop.stopped() => return Ok(()),
                frame = self.framed_read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Head((head, _)))) => {
                    if head.method() == Method::GET && head.uri().path() == "/quit" {
                        debug!("quit endpoint hit, starting graceful shutdown");
                        self.send_empty_response(StatusCode::OK).await?;
                        on_quit();
                        return Ok(());
                    }

                    let keep_alive = self.dispatch(head, &handler, &server_stop).await?;
                    if !keep_alive {
                        return Ok(());
                    }
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("received a body frame while awaiting a request head");
                    self.send_empty_response(StatusCode::BAD_REQUEST).await?;
                    return Err(ParseError::invalid_body("body frame while awaiting a request head").into());
                }

                Some(Err(e)) => {
                    error!(cause = %e, "failed to decode request");
                    self.send_empty_response(StatusCode::BAD_REQUEST).await?;
                    return Err(e.into());
                }

                None => {
                    info!("client closed the connection");
                    return Ok(());
                }
            }
        }
    }

    /// Runs one request through the handler and streams the reply.
    /// Returns whether the connection can serve another request.
    async fn dispatch<H: Handler>(
        &mut self,
        head: RequestHead,
        handler: &Rc<H>,
        server_stop: &StopToken,
    ) -> Result<bool, HttpError> {
        // per-request stop: chained to server shutdown, fired on client
        // disconnect, handed to the handler and its body generators
        let request_stop = StopSource::new();
        let chained = request_stop.clone();
        let _chain = StopCallback::new(server_stop, move || chained.request_stop());

        let (body_sender, body_stream) = ChunkStream::channel();
        let request = head.body(body_stream);

        let saw_eof = Rc::new(Cell::new(false));

        // the handler and the request-body pump run concurrently: the
        // handler may await body chunks while the pump feeds them, and a
        // handler that never reads the body must still complete
        let response_result = {
            let handler_fut = handler.call(request, request_stop.token()).fuse();
            let pump = pump_request_body(
                &mut self.framed_read,
                body_sender,
                saw_eof.clone(),
                request_stop.clone(),
            )
            .fuse();
            tokio::pin!(handler_fut, pump);

            loop {
                select! {
                    biased;
                    result = &mut handler_fut => break result,
                    () = &mut pump => {}
                }
            }
        };

        // drain whatever part of the request body the handler left unread,
        // to keep the connection framing intact
        if !saw_eof.get() {
            self.skip_request_body().await?;
        }

        match response_result {
            Ok(response) => self.reply(response, &request_stop).await,
            Err(e) => {
                let cause: Box<dyn std::error::Error> = e.into();
                error!(cause = %cause, "handler failed before reply start");
                self.send_empty_response(StatusCode::INTERNAL_SERVER_ERROR).await?;
                Ok(true)
            }
        }
    }

    /// Streams a response: reply-start, one flushed chunk at a time,
    /// reply-end. The flush after each chunk is the write-readiness
    /// backpressure point; the per-request stop and a client disconnect
    /// abort the stream mid-way.
    async fn reply(
        &mut self,
        response: Response<ChunkStream>,
        request_stop: &StopSource,
    ) -> Result<bool, HttpError> {
        let stop_token = request_stop.token();
        let (parts, mut body) = response.into_parts();

        let payload_size = match body.exact_size() {
            Some(0) => PayloadSize::Empty,
            Some(n) => PayloadSize::Length(n),
            None => PayloadSize::Chunked,
        };
        let head = ResponseHead::from(Response::from_parts(parts, ()));

        if payload_size.is_empty() {
            self.framed_write.send(Message::Head((head, payload_size))).await?;
            return Ok(true);
        }

        // reply-start: the head goes out before the first chunk is pulled,
        // so status and headers reach the client ahead of a slow body
        self.framed_write.send(Message::Head((head, payload_size))).await?;

        let mut keep_alive = true;
        let mut watch_inbound = true;
        loop {
            let step = if watch_inbound {
                select! {
                    biased;
                    () = stop_token.stopped() => ReplyStep::Stopped,
                    inbound = self.framed_read.next() => ReplyStep::Inbound(inbound.is_some_and(|f| f.is_ok())),
                    chunk = body.next() => ReplyStep::Chunk(chunk),
                }
            } else {
                select! {
                    biased;
                    () = stop_token.stopped() => ReplyStep::Stopped,
                    chunk = body.next() => ReplyStep::Chunk(chunk),
                }
            };

            match step {
                ReplyStep::Stopped => {
                    info!("reply interrupted by stop request");
                    return Err(HttpError::Interrupted);
                }

                // inbound close or error while replying: client is gone
                ReplyStep::Inbound(false) => {
                    info!("client disconnected while reply was streaming");
                    request_stop.request_stop();
                    return Err(HttpError::Interrupted);
                }

                // early bytes for a next request; stop watching so the
                // frame is not misread, and close once this reply is done
                ReplyStep::Inbound(true) => {
                    warn!("inbound frame while reply streaming, connection will close after reply");
                    watch_inbound = false;
                    keep_alive = false;
                }

                ReplyStep::Chunk(Ok(Some(chunk))) => {
                    let sent = select! {
                        biased;
                        () = stop_token.stopped() => None,
                        sent = self.framed_write.send(Message::Payload(PayloadItem::Chunk(chunk))) => Some(sent),
                    };
                    match sent {
                        None => {
                            info!("reply interrupted by stop request");
                            return Err(HttpError::Interrupted);
                        }
                        Some(Err(e)) => {
                            request_stop.request_stop();
                            return Err(e.into());
                        }
                        Some(Ok(())) => {}
                    }
                }

                ReplyStep::Chunk(Ok(None)) => {
                    // reply-end
                    self.framed_write.send(Message::Payload(PayloadItem::Eof)).await?;
                    return Ok(keep_alive);
                }

                ReplyStep::Chunk(Err(e)) => {
                    // past reply-start there is no way to frame an error;
                    // streaming just stops and the connection closes
                    error!(cause = %e, "response body failed mid reply");
                    return Err(e);
                }
            }
        }
    }

    async fn skip_request_body(&mut self) -> Result<(), HttpError> {
        let mut skipped: usize = 0;
        loop {
            match self.framed_read.next().await {
                Some(Ok(Message::Payload(PayloadItem::Chunk(chunk)))) => {
                    skipped += chunk.len();
                }
                Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                    if skipped > 0 {
                        debug!(skipped, "skipped unread request body");
                    }
                    return Ok(());
                }
                Some(Ok(Message::Head(_))) => {
                    return Err(ParseError::invalid_head("head frame while draining a request body").into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(HttpError::TruncatedBody),
            }
        }
    }

    async fn send_empty_response(&mut self, status: StatusCode) -> Result<(), HttpError> {
        let head = ResponseHead::from(Response::builder().status(status).body(()).expect("static response head"));
        self.framed_write.send(Message::Head((head, PayloadSize::Empty))).await?;
        Ok(())
    }
}

enum ReplyStep {
    Stopped,
    /// Inbound activity while replying; `true` means a decodable frame,
    /// `false` means close or framing error.
    Inbound(bool),
    Chunk(Result<Option<bytes::Bytes>, HttpError>),
}

/// Forwards decoded request-body chunks into the handler's stream.
///
/// Stops forwarding when the handler drops its body (the remainder is
/// drained afterwards). A transport close or decode failure before the
/// body completed fires the per-request stop: that is the client-disconnect
/// cancellation path.
async fn pump_request_body<R>(
    framed_read: &mut FramedRead<R, RequestDecoder>,
    mut sender: ChunkSender,
    saw_eof: Rc<Cell<bool>>,
    request_stop: StopSource,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match framed_read.next().await {
            Some(Ok(Message::Payload(PayloadItem::Chunk(chunk)))) => {
                if sender.send(chunk).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                saw_eof.set(true);
                sender.close(Ok(()));
                return;
            }
            Some(Ok(Message::Head(_))) => {
                sender.fail(ParseError::invalid_head("head frame inside a request body").into());
                return;
            }
            Some(Err(e)) => {
                request_stop.request_stop();
                sender.fail(e.into());
                return;
            }
            None => {
                request_stop.request_stop();
                sender.fail(HttpError::TruncatedBody);
                return;
            }
        }
    }
}

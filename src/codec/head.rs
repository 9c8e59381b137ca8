//! Request and response head parsing and encoding.
//!
//! Decoding goes through `httparse`; header names therefore arrive already
//! lowercased into the `http::HeaderMap` and values have surrounding
//! whitespace trimmed. Payload delimitation is derived here, from the
//! framing headers on the request side (RFC 7230 §3.3) and from status +
//! framing headers on the response side.

use bytes::{Buf, BytesMut};
use http::{header, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead, ResponseHead, SendError};

pub(crate) const MAX_HEADER_NUM: usize = 64;
pub(crate) const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Decoder for request heads (server read path).
pub struct RequestHeadDecoder;

impl Decoder for RequestHeadDecoder {
    type Item = (RequestHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Request::new(&mut headers);

        let status = parsed.parse(src.as_ref()).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_head(e.to_string()),
        })?;

        let head_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                ensure!(src.len() <= MAX_HEAD_BYTES, ParseError::too_large_head(src.len(), MAX_HEAD_BYTES));
                return Ok(None);
            }
        };
        ensure!(head_len <= MAX_HEAD_BYTES, ParseError::too_large_head(head_len, MAX_HEAD_BYTES));
        trace!(head_len, "parsed request head");

        let version = parse_version(parsed.version)?;
        let mut builder = Request::builder()
            .method(parsed.method.ok_or(ParseError::InvalidMethod)?)
            .uri(parsed.path.ok_or(ParseError::InvalidUri)?)
            .version(version);

        let header_map = builder
            .headers_mut()
            .ok_or_else(|| ParseError::invalid_head("malformed request line"))?;
        header_map.reserve(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| ParseError::invalid_head(format!("bad header name {:?}", h.name)))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| ParseError::invalid_head("bad header value"))?;
            header_map.append(name, value);
        }

        let head = RequestHead::from(
            builder.body(()).map_err(|e| ParseError::invalid_head(e.to_string()))?,
        );
        let payload_size = request_payload_size(&head)?;

        src.advance(head_len);
        Ok(Some((head, payload_size)))
    }
}

/// Decoder for response heads (client read path).
///
/// Interim 1xx heads (other than 101) are discarded and parsing restarts
/// on the following head, so captured status and headers always belong to
/// the last status line seen before the body.
pub struct ResponseHeadDecoder {
    /// The request was HEAD, so the response never carries a body.
    head_request: bool,
}

impl ResponseHeadDecoder {
    pub fn new(head_request: bool) -> Self {
        Self { head_request }
    }
}

impl Decoder for ResponseHeadDecoder {
    type Item = (ResponseHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
            let mut parsed = httparse::Response::new(&mut headers);

            let status = parsed.parse(src.as_ref()).map_err(|e| match e {
                httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
                e => ParseError::invalid_head(e.to_string()),
            })?;

            let head_len = match status {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => {
                    ensure!(src.len() <= MAX_HEAD_BYTES, ParseError::too_large_head(src.len(), MAX_HEAD_BYTES));
                    return Ok(None);
                }
            };
            ensure!(head_len <= MAX_HEAD_BYTES, ParseError::too_large_head(head_len, MAX_HEAD_BYTES));

            let version = parse_version(parsed.version)?;
            let code = parsed.code.ok_or_else(|| ParseError::invalid_status("missing status code"))?;
            let status_code = StatusCode::from_u16(code)
                .map_err(|_| ParseError::invalid_status(format!("unparseable status {code}")))?;

            let mut builder = Response::builder().status(status_code).version(version);
            let header_map = builder.headers_mut().expect("fresh response builder");
            header_map.reserve(parsed.headers.len());
            for h in parsed.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| ParseError::invalid_head(format!("bad header name {:?}", h.name)))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| ParseError::invalid_head("bad header value"))?;
                header_map.append(name, value);
            }

            src.advance(head_len);

            // an interim head restarts status and header capture
            if status_code.is_informational() && status_code != StatusCode::SWITCHING_PROTOCOLS {
                trace!(status = %status_code, "discarding interim response head");
                continue;
            }

            let head = ResponseHead::from(
                builder.body(()).map_err(|e| ParseError::invalid_head(e.to_string()))?,
            );
            let payload_size = response_payload_size(&head, self.head_request)?;
            return Ok(Some((head, payload_size)));
        }
    }
}

fn parse_version(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        // http2 and http3 heads never appear on this wire
        _ => Err(ParseError::InvalidVersion),
    }
}

/// Derives request payload delimitation per RFC 7230 §3.3.
fn request_payload_size(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    if !head.may_have_body() {
        return Ok(PayloadSize::Empty);
    }

    let te = head.headers().get(header::TRANSFER_ENCODING);
    let cl = head.headers().get(header::CONTENT_LENGTH);

    match (te, cl) {
        (None, None) => Ok(PayloadSize::Empty),

        (Some(te), None) => {
            if is_chunked(te) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::Empty)
            }
        }

        (None, Some(cl)) => Ok(PayloadSize::Length(parse_content_length(cl)?)),

        (Some(_), Some(_)) => Err(ParseError::invalid_content_length(
            "transfer-encoding and content-length both present",
        )),
    }
}

/// Derives response payload delimitation from status and framing headers.
fn response_payload_size(head: &ResponseHead, head_request: bool) -> Result<PayloadSize, ParseError> {
    if head_request || head.bodyless() {
        return Ok(PayloadSize::Empty);
    }

    if let Some(te) = head.headers().get(header::TRANSFER_ENCODING) {
        if is_chunked(te) {
            return Ok(PayloadSize::Chunked);
        }
    }

    match head.headers().get(header::CONTENT_LENGTH) {
        Some(cl) => {
            let length = parse_content_length(cl)?;
            if length == 0 {
                Ok(PayloadSize::Empty)
            } else {
                Ok(PayloadSize::Length(length))
            }
        }
        // no framing headers: the body runs to connection close
        None => Ok(PayloadSize::Unbounded),
    }
}

fn parse_content_length(value: &HeaderValue) -> Result<u64, ParseError> {
    let text = value
        .to_str()
        .map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| ParseError::invalid_content_length(format!("value {text} is not u64")))
}

/// Per RFC 7230 §3.3.3 a message is chunked iff chunked is the final
/// transfer coding applied.
fn is_chunked(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Writes a request head: request line, headers, framing stamp.
pub(crate) fn encode_request_head(
    mut head: RequestHead,
    payload_size: PayloadSize,
    dst: &mut BytesMut,
) -> Result<(), SendError> {
    ensure!(
        matches!(head.version(), Version::HTTP_11),
        SendError::io(std::io::Error::from(std::io::ErrorKind::Unsupported))
    );

    dst.reserve(256);
    dst.extend_from_slice(head.method().as_str().as_bytes());
    dst.extend_from_slice(b" ");
    match head.uri().path_and_query() {
        Some(target) => dst.extend_from_slice(target.as_str().as_bytes()),
        None => dst.extend_from_slice(b"/"),
    }
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    stamp_framing(head.headers_mut(), payload_size, false);
    write_header_block(head.headers(), dst);
    Ok(())
}

/// Writes a response head: status line, headers, framing stamp.
pub(crate) fn encode_response_head(
    mut head: ResponseHead,
    payload_size: PayloadSize,
    dst: &mut BytesMut,
) -> Result<(), SendError> {
    ensure!(
        matches!(head.version(), Version::HTTP_11 | Version::HTTP_10),
        SendError::io(std::io::Error::from(std::io::ErrorKind::Unsupported))
    );

    dst.reserve(256);
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(head.status().as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(head.status().canonical_reason().unwrap_or("").as_bytes());
    dst.extend_from_slice(b"\r\n");

    stamp_framing(head.headers_mut(), payload_size, true);
    write_header_block(head.headers(), dst);
    Ok(())
}

/// Makes the framing headers agree with the chosen payload delimitation.
/// Responses carry an explicit `Content-Length: 0` when empty; requests
/// stay silent so a bodiless GET carries no framing headers at all.
fn stamp_framing(headers: &mut http::HeaderMap, payload_size: PayloadSize, response: bool) {
    match payload_size {
        PayloadSize::Length(n) => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
            headers.remove(header::TRANSFER_ENCODING);
        }
        PayloadSize::Chunked => {
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            headers.remove(header::CONTENT_LENGTH);
        }
        PayloadSize::Empty => {
            if response {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
            }
        }
        PayloadSize::Unbounded => unreachable!("unbounded payloads cannot be encoded"),
    }
}

fn write_header_block(headers: &http::HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_ref());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use indoc::indoc;

    fn crlf(text: &str) -> BytesMut {
        BytesMut::from(text.replace('\n', "\r\n").as_str())
    }

    #[test]
    fn decode_get_request_head() {
        let mut src = crlf(indoc! {"
            GET /index.html HTTP/1.1
            Host: 127.0.0.1:8080
            Accept: */*

            rest"});

        let (head, payload_size) = RequestHeadDecoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(head.method(), &Method::GET);
        assert_eq!(head.uri().path(), "/index.html");
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(payload_size, PayloadSize::Empty);

        assert_eq!(head.headers().get(header::HOST).unwrap(), "127.0.0.1:8080");
        assert_eq!(head.headers().get(header::ACCEPT).unwrap(), "*/*");
        // head consumed, body bytes left in place
        assert_eq!(&src[..], b"rest");
    }

    #[test]
    fn decode_partial_request_head() {
        let mut src = BytesMut::from(&b"GET /index.html HTT"[..]);
        assert!(RequestHeadDecoder.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 19);
    }

    #[test]
    fn decode_post_with_content_length() {
        let mut src = crlf(indoc! {"
            POST /echo HTTP/1.1
            Host: localhost
            Content-Length: 3

            abc"});

        let (head, payload_size) = RequestHeadDecoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(head.method(), &Method::POST);
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(&src[..], b"abc");
    }

    #[test]
    fn decode_post_with_chunked_encoding() {
        let mut src = crlf(indoc! {"
            POST /upload HTTP/1.1
            Host: localhost
            Transfer-Encoding: chunked

        "});

        let (_, payload_size) = RequestHeadDecoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Chunked);
    }

    #[test]
    fn reject_conflicting_framing_headers() {
        let mut src = crlf(indoc! {"
            POST /x HTTP/1.1
            Content-Length: 3
            Transfer-Encoding: chunked

        "});

        assert!(RequestHeadDecoder.decode(&mut src).is_err());
    }

    #[test]
    fn repeated_headers_are_kept_in_order() {
        let mut src = crlf(indoc! {"
            GET / HTTP/1.1
            X-Tag: one
            X-Tag: two

        "});

        let (head, _) = RequestHeadDecoder.decode(&mut src).unwrap().unwrap();
        let tags: Vec<_> = head.headers().get_all("x-tag").iter().collect();
        assert_eq!(tags, [&HeaderValue::from_static("one"), &HeaderValue::from_static("two")]);
    }

    #[test]
    fn decode_response_head_lowercases_names() {
        let mut src = crlf(indoc! {"
            HTTP/1.1 200 OK
            Content-Type: text/plain
            Content-Length: 5

            hello"});

        let (head, payload_size) = ResponseHeadDecoder::new(false).decode(&mut src).unwrap().unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(payload_size, PayloadSize::Length(5));
        // HeaderMap keys are lowercase; lookup is case-insensitive
        let names: Vec<_> = head.headers().keys().map(|n| n.as_str()).collect();
        assert_eq!(names, ["content-type", "content-length"]);
    }

    #[test]
    fn interim_head_restarts_capture() {
        let mut src = crlf(indoc! {"
            HTTP/1.1 100 Continue
            X-Interim: yes

            HTTP/1.1 200 OK
            Content-Length: 0

        "});

        let (head, payload_size) = ResponseHeadDecoder::new(false).decode(&mut src).unwrap().unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(payload_size, PayloadSize::Empty);
        // headers captured before the final status line are gone
        assert!(head.headers().get("x-interim").is_none());
    }

    #[test]
    fn response_without_framing_reads_until_close() {
        let mut src = crlf(indoc! {"
            HTTP/1.1 200 OK

            tail"});

        let (_, payload_size) = ResponseHeadDecoder::new(false).decode(&mut src).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Unbounded);
    }

    #[test]
    fn head_request_response_has_no_body() {
        let mut src = crlf(indoc! {"
            HTTP/1.1 200 OK
            Content-Length: 100

        "});

        let (_, payload_size) = ResponseHeadDecoder::new(true).decode(&mut src).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Empty);
    }

    #[test]
    fn reject_unparseable_status() {
        let mut src = crlf(indoc! {"
            HTTP/1.1 abc OK

        "});

        assert!(ResponseHeadDecoder::new(false).decode(&mut src).is_err());
    }

    #[test]
    fn encode_get_head_has_no_framing_headers() {
        let head = RequestHead::from(
            Request::builder().method(Method::GET).uri("/hello?q=1").header("host", "h").body(()).unwrap(),
        );
        let mut dst = BytesMut::new();
        encode_request_head(head, PayloadSize::Empty, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("GET /hello?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: h\r\n"));
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_request_head_stamps_chunked() {
        let head = RequestHead::from(
            Request::builder().method(Method::POST).uri("/up").body(()).unwrap(),
        );
        let mut dst = BytesMut::new();
        encode_request_head(head, PayloadSize::Chunked, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
    }

    #[test]
    fn encode_response_head_stamps_length() {
        let head = ResponseHead::from(Response::builder().status(200).body(()).unwrap());
        let mut dst = BytesMut::new();
        encode_response_head(head, PayloadSize::Length(5), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
    }

    #[test]
    fn encode_empty_response_declares_zero_length() {
        let head = ResponseHead::from(Response::builder().status(500).body(()).unwrap());
        let mut dst = BytesMut::new();
        encode_response_head(head, PayloadSize::Empty, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }
}

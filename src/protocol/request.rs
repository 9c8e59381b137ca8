//! Request head handling.
//!
//! [`RequestHead`] wraps `http::Request<()>` so both sides of the wire share
//! one representation: the server decodes into it, the client encodes from
//! it. Attaching a body converts it into a full `http::Request<B>`.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// The head of an HTTP request: method, target, version and headers.
#[derive(Debug)]
pub struct RequestHead {
    inner: Request<()>,
}

impl RequestHead {
    /// Consumes the head and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body, converting this head into a full `Request<B>`.
    pub fn body<B>(self, body: B) -> Request<B> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    /// Whether a message with this method may carry a body. GET, HEAD,
    /// DELETE, OPTIONS and CONNECT requests carry none implicitly.
    pub fn may_have_body(&self) -> bool {
        !matches!(
            self.method(),
            &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT
        )
    }
}

impl From<Parts> for RequestHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHead {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

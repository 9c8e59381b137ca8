//! Response head handling.
//!
//! [`ResponseHead`] wraps `http::Response<()>`: the client decodes into it
//! (header names arrive lowercased, values trimmed by the parser), the
//! server encodes from it.

use http::response::Parts;
use http::{HeaderMap, Response, StatusCode, Version};

/// The head of an HTTP response: status, version and headers.
#[derive(Debug)]
pub struct ResponseHead {
    inner: Response<()>,
}

impl ResponseHead {
    /// Consumes the head and returns the inner `Response<()>`.
    pub fn into_inner(self) -> Response<()> {
        self.inner
    }

    /// Attaches a body, converting this head into a full `Response<B>`.
    pub fn body<B>(self, body: B) -> Response<B> {
        self.inner.map(|_| body)
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status()
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

    /// Whether a response with this status never carries a body,
    /// regardless of framing headers.
    pub fn bodyless(&self) -> bool {
        let status = self.status();
        status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
    }
}

impl From<Parts> for ResponseHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Response::from_parts(parts, ()) }
    }
}

impl From<Response<()>> for ResponseHead {
    #[inline]
    fn from(inner: Response<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodyless_statuses() {
        for code in [100u16, 101, 204, 304] {
            let head = ResponseHead::from(
                Response::builder().status(code).body(()).unwrap(),
            );
            assert!(head.bodyless(), "{code} must be bodyless");
        }

        for code in [200u16, 404, 500] {
            let head = ResponseHead::from(
                Response::builder().status(code).body(()).unwrap(),
            );
            assert!(!head.bodyless(), "{code} may carry a body");
        }
    }
}

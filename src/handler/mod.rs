//! The user handler contract.
//!
//! A [`Handler`] receives the decoded request (with its lazily streamed
//! body) together with the per-request stop token, and produces a response
//! whose body is itself a lazy [`ChunkStream`]. Handlers run on the
//! event-loop thread; their futures need not be `Send`.

use std::error::Error;
use std::future::Future;

use http::{Request, Response};

use crate::body::ChunkStream;
use crate::stop::StopToken;

pub trait Handler {
    type Error: Into<Box<dyn Error>>;
    type Fut<'fut>: Future<Output = Result<Response<ChunkStream>, Self::Error>>
    where
        Self: 'fut;

    fn call(&self, request: Request<ChunkStream>, stop: StopToken) -> Self::Fut<'_>;
}

/// Adapter turning a plain async closure into a [`Handler`].
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<Err, F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<ChunkStream>, StopToken) -> Fut,
    Err: Into<Box<dyn Error>>,
    Fut: Future<Output = Result<Response<ChunkStream>, Err>>,
{
    type Error = Err;
    type Fut<'fut> = Fut where Self: 'fut;

    fn call(&self, request: Request<ChunkStream>, stop: StopToken) -> Self::Fut<'_> {
        (self.f)(request, stop)
    }
}

pub fn make_handler<F, Err, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<ChunkStream>, StopToken) -> Fut,
    Err: Into<Box<dyn Error>>,
    Fut: Future<Output = Result<Response<ChunkStream>, Err>>,
{
    HandlerFn { f }
}

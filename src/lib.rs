//! strand-http: a single-threaded cooperative HTTP/1.1 client and server.
//!
//! The crate drives all I/O, timers and user code on one event-loop thread
//! (a current-thread tokio runtime plus a [`LocalSet`]); there is no
//! parallelism and therefore no locking anywhere in the core. Bodies are
//! exposed to user code as [`ChunkStream`]s: finite lazy sequences of byte
//! chunks with a one-slot buffer, so a slow consumer pauses the producing
//! side all the way down to the socket.
//!
//! # Client
//!
//! ```rust,no_run
//! use strand_http::{Client, RequestBody, StopSource};
//!
//! # async fn run() -> Result<(), strand_http::HttpError> {
//! let client = Client::default();
//! let stop = StopSource::new();
//!
//! let request = http::Request::get("http://127.0.0.1:8080/hello")
//!     .body(RequestBody::Empty)
//!     .unwrap();
//!
//! let mut response = client.fetch(request, stop.token()).await?;
//! assert_eq!(response.status(), 200);
//! while let Some(chunk) = response.body_mut().next().await? {
//!     println!("{} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Server
//!
//! ```rust,no_run
//! use strand_http::{make_handler, ChunkStream, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), strand_http::HttpError> {
//! let handler = make_handler(|_req, _stop| async {
//!     let response = http::Response::builder().status(200).body(ChunkStream::from("hello")).unwrap();
//!     Ok::<_, strand_http::HttpError>(response)
//! });
//!
//! let server = Server::bind(ServerConfig::new("127.0.0.1", 8080), handler).await?;
//! server.serve().await
//! # }
//! ```
//!
//! [`LocalSet`]: tokio::task::LocalSet

pub mod body;
pub mod client;
pub mod codec;
pub mod handler;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod stop;

pub use body::{ChunkSender, ChunkStream};
pub use client::{Client, ClientConfig, RequestBody};
pub use handler::{make_handler, Handler, HandlerFn};
pub use protocol::HttpError;
pub use runtime::{spawn, spawn_detached, LocalExecutor, Task};
pub use server::{Server, ServerConfig};
pub use stop::{StopCallback, StopSource, StopToken};

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}

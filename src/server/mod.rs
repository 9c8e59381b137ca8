//! The HTTP server engine.
//!
//! [`Server::bind`] binds the listener eagerly; [`Server::serve`] accepts
//! connections and runs each on its own local task. Shutdown is
//! cooperative: [`Server::quit`] (or a `GET /quit` request) signals the
//! server-wide stop, which chains into every per-request stop token, and
//! resolves once the listener is closed and in-flight connections have
//! drained to zero.

mod connection;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tokio::net::TcpListener;
use tokio::select;
use tracing::{error, info, warn};

use crate::handler::Handler;
use crate::protocol::HttpError;
use crate::runtime::{spawn, Task};
use crate::stop::StopSource;

use connection::ServerConnection;

/// Listen address configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new<S: Into<String>>(address: S, port: u16) -> Self {
        Self { address: address.into(), port }
    }
}

/// Shutdown and drain bookkeeping, shared by every connection task.
struct ServerState {
    shutdown: StopSource,
    connections: Cell<usize>,
    listener_closed: Cell<bool>,
    drain_wakers: RefCell<Vec<Waker>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            shutdown: StopSource::new(),
            connections: Cell::new(0),
            listener_closed: Cell::new(false),
            drain_wakers: RefCell::new(Vec::new()),
        }
    }

    fn connection_opened(&self) {
        self.connections.set(self.connections.get() + 1);
    }

    fn connection_closed(&self) {
        self.connections.set(self.connections.get() - 1);
        self.maybe_wake_drained();
    }

    fn is_drained(&self) -> bool {
        self.shutdown.stop_requested() && self.listener_closed.get() && self.connections.get() == 0
    }

    fn maybe_wake_drained(&self) {
        if self.is_drained() {
            for waker in self.drain_wakers.borrow_mut().drain(..) {
                waker.wake();
            }
        }
    }
}

struct Inner<H> {
    handler: Rc<H>,
    listener: RefCell<Option<TcpListener>>,
    local_addr: SocketAddr,
    state: Rc<ServerState>,
}

/// The HTTP server engine.
pub struct Server<H> {
    inner: Rc<Inner<H>>,
}

impl<H> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<H> Server<H>
where
    H: Handler + 'static,
{
    /// Binds the listener and returns the server, ready to serve.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self, HttpError> {
        let listener = TcpListener::bind((config.address.as_str(), config.port))
            .await
            .map_err(|e| HttpError::transport(format!("bind {}:{} failed", config.address, config.port), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HttpError::transport("local_addr failed", e))?;
        info!(address = %local_addr, "listening");

        Ok(Self {
            inner: Rc::new(Inner {
                handler: Rc::new(handler),
                listener: RefCell::new(Some(listener)),
                local_addr,
                state: Rc::new(ServerState::new()),
            }),
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Accepts connections until shutdown is requested.
    ///
    /// Each accepted connection runs on its own local task; the accept
    /// loop itself never blocks on a connection.
    pub async fn serve(&self) -> Result<(), HttpError> {
        let listener = self
            .inner
            .listener
            .borrow_mut()
            .take()
            .ok_or_else(|| HttpError::transport_msg("server is already serving or shut down"))?;
        let shutdown = self.inner.state.shutdown.token();

        loop {
            let accepted = select! {
                biased;
                () = shutdown.stopped() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    stream.set_nodelay(true).ok();
                    let inner = self.inner.clone();
                    inner.state.connection_opened();
                    tokio::task::spawn_local(async move {
                        let (reader, writer) = stream.into_split();
                        let connection = ServerConnection::new(reader, writer);
                        let server_stop = inner.state.shutdown.token();
                        let quit_state = inner.state.clone();
                        let on_quit = move || quit_state.shutdown.request_stop();

                        match connection.process(inner.handler.clone(), server_stop, on_quit).await {
                            Ok(()) => info!(remote = %remote, "connection finished"),
                            Err(HttpError::Interrupted) => info!(remote = %remote, "connection interrupted"),
                            Err(e) => error!(remote = %remote, cause = %e, "connection failed"),
                        }
                        inner.state.connection_closed();
                    });
                }
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            }
        }

        // closing the listener makes further connects fail
        drop(listener);
        self.inner.state.listener_closed.set(true);
        self.inner.state.maybe_wake_drained();
        Ok(())
    }

    /// Initiates graceful shutdown and resolves once every in-flight
    /// connection has drained and the listener is closed.
    ///
    /// Idempotent: every call observes the same drain, and calls after the
    /// drain resolve immediately. Never fails.
    pub fn quit(&self) -> Task<()> {
        let inner = self.inner.clone();
        spawn(async move {
            // per-request stop tokens are chained to this signal, so
            // streaming bodies abort promptly
            inner.state.shutdown.request_stop();

            // a listener that never started serving is closed here;
            // otherwise the serve loop observes the stop and closes it
            if inner.listener.borrow_mut().take().is_some() {
                inner.state.listener_closed.set(true);
                inner.state.maybe_wake_drained();
            }

            Drained { state: inner.state.clone() }.await;
            info!("server drained");
            Ok(())
        })
    }
}

/// Resolves when the server has fully drained.
struct Drained {
    state: Rc<ServerState>,
}

impl Future for Drained {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.is_drained() {
            Poll::Ready(())
        } else {
            self.state.drain_wakers.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

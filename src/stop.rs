//! Cooperative cancellation.
//!
//! A [`StopSource`] owns a monotonic stop signal. [`StopToken`]s observe it;
//! a [`StopCallback`] is a scoped registration that fires exactly once on
//! the first stop request (immediately, if the signal is already set) and
//! deregisters without firing when dropped. [`StopToken::stopped`] exposes
//! the signal as a future for use in `select!`.
//!
//! Everything is single-threaded. Callbacks run on whichever call site
//! invoked [`StopSource::request_stop`]; they must be short and must not
//! request a stop on the same source.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use slab::Slab;

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Registry {
    stopped: bool,
    callbacks: Slab<Callback>,
}

/// Owner of a stop signal.
///
/// Cloning yields another owner of the same signal; the signal only ever
/// moves from unset to set.
#[derive(Clone, Default)]
pub struct StopSource {
    inner: Rc<RefCell<Registry>>,
}

impl StopSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a token observing this source's signal.
    pub fn token(&self) -> StopToken {
        StopToken { inner: self.inner.clone() }
    }

    /// Returns true once a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.borrow().stopped
    }

    /// Sets the signal and fires every registered callback exactly once.
    /// Idempotent: later calls are no-ops.
    pub fn request_stop(&self) {
        let fired: Vec<Callback> = {
            let mut registry = self.inner.borrow_mut();
            if registry.stopped {
                return;
            }
            registry.stopped = true;
            registry.callbacks.drain().collect()
        };
        // registry borrow released: callbacks may register further
        // callbacks (which fire immediately) or inspect tokens
        for callback in fired {
            callback();
        }
    }
}

/// Observer of a stop signal.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Rc<RefCell<Registry>>,
}

impl StopToken {
    /// A token that can never be stopped. Handy as a placeholder.
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns true once a stop has been requested on the source.
    pub fn stop_requested(&self) -> bool {
        self.inner.borrow().stopped
    }

    /// Resolves once a stop has been requested. Resolves immediately if the
    /// signal is already set.
    pub fn stopped(&self) -> Stopped {
        Stopped { token: self.clone(), registered: None }
    }
}

/// Scoped callback registration against a [`StopToken`].
///
/// Construction registers the callback, firing it on the spot when the
/// signal is already set. Dropping deregisters without firing.
pub struct StopCallback {
    inner: Rc<RefCell<Registry>>,
    key: Option<usize>,
}

impl StopCallback {
    pub fn new<F: FnOnce() + 'static>(token: &StopToken, callback: F) -> Self {
        let mut registry = token.inner.borrow_mut();
        if registry.stopped {
            drop(registry);
            callback();
            return Self { inner: token.inner.clone(), key: None };
        }
        let key = registry.callbacks.insert(Box::new(callback));
        drop(registry);
        Self { inner: token.inner.clone(), key: Some(key) }
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // the slab was drained if the stop already fired
            self.inner.borrow_mut().callbacks.try_remove(key);
        }
    }
}

/// Future returned by [`StopToken::stopped`].
pub struct Stopped {
    token: StopToken,
    registered: Option<(usize, Rc<Cell<Option<Waker>>>)>,
}

impl Future for Stopped {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.stop_requested() {
            return Poll::Ready(());
        }
        match &self.registered {
            Some((_, slot)) => slot.set(Some(cx.waker().clone())),
            None => {
                let slot = Rc::new(Cell::new(Some(cx.waker().clone())));
                let woken = slot.clone();
                let key = self
                    .token
                    .inner
                    .borrow_mut()
                    .callbacks
                    .insert(Box::new(move || {
                        if let Some(waker) = woken.take() {
                            waker.wake();
                        }
                    }));
                self.registered = Some((key, slot));
            }
        }
        Poll::Pending
    }
}

impl Drop for Stopped {
    fn drop(&mut self) {
        if let Some((key, _)) = self.registered.take() {
            self.token.inner.borrow_mut().callbacks.try_remove(key);
        }
    }
}

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tracing::error;

use crate::protocol::HttpError;

struct Slot<T> {
    result: Option<Result<T, HttpError>>,
    waker: Option<Waker>,
    handle_gone: bool,
}

/// Handle to a computation spawned on the local event loop.
///
/// Awaiting the handle yields the computation's value or relays its error;
/// there is exactly one awaiter. Dropping the handle detaches the
/// computation: it keeps running, but an error it later produces has no
/// observer and is reported loudly (and panics in debug builds) instead of
/// vanishing.
pub struct Task<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

/// Spawns a computation on the local set and returns its [`Task`] handle.
///
/// Must be called from within a `LocalSet` context (anything driven by
/// [`LocalExecutor::block_on`](crate::LocalExecutor::block_on)).
pub fn spawn<T, F>(future: F) -> Task<T>
where
    T: 'static,
    F: Future<Output = Result<T, HttpError>> + 'static,
{
    let slot = Rc::new(RefCell::new(Slot { result: None, waker: None, handle_gone: false }));
    let inner = slot.clone();
    tokio::task::spawn_local(async move {
        let result = future.await;
        let mut slot = inner.borrow_mut();
        if slot.handle_gone {
            if let Err(e) = &result {
                report_dropped_error(e);
            }
            return;
        }
        slot.result = Some(result);
        if let Some(waker) = slot.waker.take() {
            waker.wake();
        }
    });
    Task { slot }
}

/// Spawns a fire-and-forget computation on the local set.
///
/// The future owns its own error funnel; an error that still reaches the
/// runtime here has escaped its owner and is reported loudly.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = Result<(), HttpError>> + 'static,
{
    tokio::task::spawn_local(async move {
        if let Err(e) = future.await {
            report_dropped_error(&e);
        }
    });
}

fn report_dropped_error(e: &HttpError) {
    if e.is_interrupted() {
        // stop requests routinely outlive their observers
        return;
    }
    error!(cause = %e, "task error dropped without an observer");
    debug_assert!(false, "task error dropped without an observer: {e}");
}

impl<T> Future for Task<T> {
    type Output = Result<T, HttpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.borrow_mut();
        slot.handle_gone = true;
        if let Some(Err(e)) = slot.result.take() {
            report_dropped_error(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn task_relays_value() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let task = spawn(async { Ok(41 + 1) });
                assert_eq!(task.await.unwrap(), 42);
            })
            .await;
    }

    #[tokio::test]
    async fn task_relays_error() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let task: Task<()> = spawn(async { Err(HttpError::Interrupted) });
                assert!(matches!(task.await, Err(HttpError::Interrupted)));
            })
            .await;
    }

    #[tokio::test]
    async fn task_completes_across_suspension() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let task = spawn(async {
                    tokio::task::yield_now().await;
                    Ok("done")
                });
                assert_eq!(task.await.unwrap(), "done");
            })
            .await;
    }

    #[tokio::test]
    async fn detached_interruption_is_silent() {
        let local = LocalSet::new();
        local
            .run_until(async {
                spawn_detached(async { Err(HttpError::Interrupted) });
                tokio::task::yield_now().await;
            })
            .await;
    }
}

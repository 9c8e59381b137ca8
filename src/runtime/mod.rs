//! The single-threaded cooperative runtime.
//!
//! Everything in this crate runs on one event-loop thread: a current-thread
//! tokio runtime plus a [`LocalSet`]. [`Task`] is the handle to a spawned
//! computation; it relays the computation's value or error to exactly one
//! awaiter. [`spawn_detached`] is the fire-and-forget variant used for
//! helper work (body pumps, uploads) whose errors are funneled elsewhere.
//!
//! [`LocalSet`]: tokio::task::LocalSet

mod task;

pub use task::spawn;
pub use task::spawn_detached;
pub use task::Task;

use std::future::Future;
use std::io;

use tokio::task::LocalSet;

/// The event-loop thread bootstrap.
///
/// Embedders construct one `LocalExecutor` and drive their whole program
/// through [`block_on`](LocalExecutor::block_on); every task spawned by the
/// client and server engines lands on its local set.
pub struct LocalExecutor {
    runtime: tokio::runtime::Runtime,
    local: LocalSet,
}

impl LocalExecutor {
    /// Builds a current-thread runtime with I/O and timers enabled.
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime, local: LocalSet::new() })
    }

    /// Runs the future to completion on this thread, driving every local
    /// task spawned along the way.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }
}

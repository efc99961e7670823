// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A thin, cloneable wrapper around a tokio runtime.
//!
//! The evaluator (`graph::Graph`) spawns one task per Node run; a Node's task spends most of its
//! life suspended awaiting its own dependencies' tasks, so the `num_threads` bound from the
//! façade is realized simply as the worker-thread count of the runtime a given `Executor` owns,
//! per [§5](../../SPEC_FULL.md). There is no additional semaphore: gating task *spawn* rather
//! than thread occupancy would let a blocked parent task hold a permit its child needs to make
//! progress, deadlocking the pool.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Executor {
    runtime: Arc<Runtime>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("worker_threads", &self.runtime.metrics().num_workers())
            .finish()
    }
}

impl Executor {
    /// Creates an Executor with `num_threads` worker threads. A value of 0 falls back to the
    /// number of logical CPUs, matching the façade's default for the analysis phase.
    pub fn new(num_threads: usize) -> Result<Executor, String> {
        let num_threads = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_threads)
            .enable_all()
            .thread_name("evaluator")
            .build()
            .map_err(|e| format!("Failed to start the evaluator runtime: {e}"))?;
        Ok(Executor {
            runtime: Arc::new(runtime),
        })
    }

    /// Spawns a future that does not need to be awaited by the caller; it continues to run on
    /// this Executor's pool even if the returned handle is dropped.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Spawns a closure that is allowed to block the calling worker thread (the execution phase's
    /// action-running Nodes do this; see `num_threads` sizing in §5 of SPEC_FULL.md).
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runtime.spawn_blocking(f)
    }

    /// Blocks the calling (non-runtime) thread until `future` completes. Used at the façade
    /// boundary, where synchronous driver methods must hand a request to the async evaluator.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn num_threads(&self) -> usize {
        self.runtime.metrics().num_workers()
    }
}

#[cfg(test)]
mod tests {
    use super::Executor;

    #[test]
    fn spawn_and_block_on() {
        let executor = Executor::new(2).unwrap();
        let handle = executor.spawn(async { 1 + 1 });
        let result = executor.block_on(async move { handle.await.unwrap() });
        assert_eq!(result, 2);
    }

    #[test]
    fn zero_defaults_to_cpu_count() {
        let executor = Executor::new(0).unwrap();
        assert!(executor.num_threads() >= 1);
    }
}

//! A thin wrapper around a crossbeam-channel backed thread pool, used to
//! run blocking work (storage I/O, signature verification) off the
//! single-threaded consensus actor without bringing its own async
//! runtime into play.

use threadpool_crossbeam_channel::Builder as CrossbeamBuilder;
use threadpool_crossbeam_channel::ThreadPool as CrossbeamThreadPool;

/// Builds a [`ThreadPool`] with a configurable size and thread name.
pub struct Builder {
    inner: CrossbeamBuilder,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            inner: CrossbeamBuilder::new(),
        }
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.inner = self.inner.num_threads(num_threads);
        self
    }

    pub fn thread_name(mut self, name: String) -> Self {
        self.inner = self.inner.thread_name(name);
        self
    }

    pub fn build(self) -> ThreadPool {
        ThreadPool {
            inner: self.inner.build(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle to a pool of worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: CrossbeamThreadPool,
}

impl ThreadPool {
    /// Spawns a new thread pool with `num_threads` worker threads.
    pub fn new(num_threads: usize) -> Self {
        Self {
            inner: CrossbeamThreadPool::new(num_threads),
        }
    }

    /// Executes `job` on one of the pool's worker threads.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job)
    }

    /// Returns the number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.inner.max_count()
    }

    /// Blocks until all currently queued jobs have finished executing.
    pub fn join(&self) {
        self.inner.join()
    }
}

impl From<CrossbeamThreadPool> for ThreadPool {
    fn from(inner: CrossbeamThreadPool) -> Self {
        Self { inner }
    }
}

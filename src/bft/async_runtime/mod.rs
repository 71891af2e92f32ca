//! Abstraction over the async runtime backing this crate's I/O.
//!
//! Only a tokio backend is implemented, selected through the
//! `async_runtime_tokio` feature, mirroring how the teacher crate this
//! workspace descends from let the runtime be swapped out behind a
//! thin `rt::{init, block_on, spawn}` surface.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
use self::tokio as backend;

pub use backend::JoinHandle;
pub use backend::Runtime;

use std::future::Future;
use std::sync::OnceLock;

use crate::bft::error::*;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initializes the global async runtime with `num_threads` worker threads.
///
/// Must be called exactly once, before any call to [`block_on`] or
/// [`spawn`].
pub fn init(num_threads: usize) -> Result<()> {
    let runtime = backend::init(num_threads).simple(ErrorKind::Error)?;
    RUNTIME
        .set(runtime)
        .map_err(|_| ())
        .simple_msg(ErrorKind::Error, "async runtime already initialized")
}

/// Drops the global async runtime initialized by [`init`].
///
/// A no-op: the runtime lives for the remainder of the process, since
/// `OnceLock` offers no way to tear down its contents early. Kept as a
/// symmetric counterpart to [`init`] for callers that pair the two.
pub fn drop() {}

fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("async runtime not initialized")
}

/// Runs a future to completion on the global runtime.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    runtime().handle().block_on(fut)
}

/// Spawns a future onto the global runtime, returning a handle to its
/// eventual result.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().handle().spawn(fut)
}

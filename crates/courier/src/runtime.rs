//! Runtime management for async operations.
//!
//! Sessions and the reqwest transport spawn their work on the ambient tokio
//! runtime when one is running. Callers outside a runtime get a shared
//! background runtime created on first use.

use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};

use crate::error::{Result, TransportError};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the shared background runtime.
///
/// Called implicitly by [`handle`] when no runtime is running.
pub fn init() -> Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("courier-io")
        .enable_all()
        .build()
        .map_err(TransportError::from)?;
    let _ = RUNTIME.set(runtime);
    RUNTIME
        .get()
        .ok_or_else(|| TransportError::Other("runtime unavailable".to_string()).into())
}

/// Handle of the runtime that session work is spawned on.
pub fn handle() -> Result<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => init().map(|runtime| runtime.handle().clone()),
    }
}

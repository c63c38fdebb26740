//! The process-wide tokio runtime the protocol engine runs on.
//!
//! Session operations are synchronous because the host calls them from its own threads.
//! They drive async engine work through [`block_on`].

use std::future::Future;
use std::io;

use once_cell::sync::OnceCell;
use tokio::runtime::{Handle, Runtime};

static VNC_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Initializes or retrieves the global multi-threaded runtime.
///
/// The runtime lives for the rest of the process; sessions come and go on top of it.
pub fn get_or_init_vnc_runtime() -> io::Result<&'static Runtime> {
    VNC_RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("droidvnc-worker")
            .build()
    })
}

/// Runs `future` to completion on the global runtime, blocking the calling thread.
///
/// Safe to call from inside another runtime: the wait then happens on a scoped helper
/// thread instead of nesting runtimes.
pub fn block_on<F>(future: F) -> io::Result<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    let runtime = get_or_init_vnc_runtime()?;
    if Handle::try_current().is_err() {
        return Ok(runtime.block_on(future));
    }

    std::thread::scope(|scope| {
        match scope.spawn(|| runtime.block_on(future)).join() {
            Ok(output) => Ok(output),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_is_shared() {
        let a = get_or_init_vnc_runtime().unwrap() as *const Runtime;
        let b = get_or_init_vnc_runtime().unwrap() as *const Runtime;
        assert_eq!(a, b);
    }

    #[test]
    fn block_on_from_plain_thread() {
        assert_eq!(block_on(async { 21 * 2 }).unwrap(), 42);
    }

    #[test]
    fn block_on_from_inside_a_runtime() {
        let outer = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let value = outer.block_on(async { block_on(async { "nested" }).unwrap() });
        assert_eq!(value, "nested");
    }
}

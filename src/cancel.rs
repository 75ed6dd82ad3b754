//! Cooperative cancellation for long walks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{signal, SigHandler, Signal};

use crate::error::{GraphError, Result};

/// Shared flag checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }
}

static SIGINT_FLAG: OnceLock<CancelFlag> = OnceLock::new();

extern "C" fn handle_sigint(_: nix::libc::c_int) {
    if let Some(flag) = SIGINT_FLAG.get() {
        flag.cancel();
    }
}

/// Flag that is set when the process receives SIGINT.
///
/// Replaces the default handler, so the process keeps running until the
/// caller notices the flag and cleans up.
pub fn on_sigint() -> Result<CancelFlag> {
    let flag = SIGINT_FLAG.get_or_init(CancelFlag::default).clone();
    // SAFETY: the handler only performs an atomic store
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) }
        .map_err(std::io::Error::from)?;
    Ok(flag)
}

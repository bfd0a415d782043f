//! Interrupt handling for runs that own scratch resources.
//!
//! While an [`InterruptGuard`] is alive, SIGINT/SIGTERM (and SIGHUP on unix)
//! only raise a flag instead of killing the process. Long loops poll
//! [`InterruptGuard::check`] and unwind with [`CapsuleError::Interrupted`],
//! so scratch directories and temp files are dropped normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;
use tracing::{debug, warn};

use super::error::CapsuleError;

#[derive(Debug)]
pub struct InterruptGuard {
    flag: Arc<AtomicBool>,
    ids: Vec<SigId>,
}

impl InterruptGuard {
    /// Register handlers. Registration failures are logged; the guard then
    /// simply never observes that signal.
    pub fn install() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();

        #[cfg(unix)]
        let signals = [SIGINT, SIGTERM, signal_hook::consts::SIGHUP];
        #[cfg(not(unix))]
        let signals = [SIGINT, SIGTERM];

        for signal in signals {
            match signal_hook::flag::register(signal, Arc::clone(&flag)) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("cannot install handler for signal {}: {}", signal, e),
            }
        }
        debug!("interrupt guard installed for {} signals", ids.len());
        Self { flag, ids }
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Interrupted)` once a signal has arrived.
    pub fn check(&self) -> Result<(), CapsuleError> {
        if self.is_interrupted() {
            Err(CapsuleError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Raise the flag by hand.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            let _ = signal_hook::low_level::unregister(id);
        }
    }
}

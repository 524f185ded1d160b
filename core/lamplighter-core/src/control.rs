//! External control events (reload, shutdown) delivered to the runner.
//!
//! Whoever receives OS signals flips these flags; the runner and the
//! debouncer only look at them at step boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ControlSignals {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Consumes a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

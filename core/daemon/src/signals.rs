//! OS signal delivery.
//!
//! SIGHUP, SIGTERM and SIGINT are blocked process-wide and collected by one
//! dedicated thread with `sigwait`, which turns them into flag flips on
//! [`ControlSignals`]. Nothing runs inside an async signal handler.

use lamplighter_core::ControlSignals;
use std::thread;

/// Signals blocked on the calling thread, waiting for a listener.
pub struct BlockedSignals {
    set: libc::sigset_t,
}

/// Must run before any other thread is spawned so every thread inherits
/// the blocked mask.
pub fn block() -> Result<BlockedSignals, String> {
    let set = blocked_set()?;

    // SAFETY: `set` is a fully initialized sigset_t and the old-mask
    // pointer may be null.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(format!("Failed to block signals: errno {}", rc));
    }
    Ok(BlockedSignals { set })
}

impl BlockedSignals {
    pub fn listen(self, signals: ControlSignals) -> Result<(), String> {
        let set = self.set;
        thread::Builder::new()
            .name("lamplighter-signals".to_string())
            .spawn(move || wait_loop(set, signals))
            .map_err(|err| format!("Failed to spawn signal thread: {}", err))?;
        Ok(())
    }
}

fn blocked_set() -> Result<libc::sigset_t, String> {
    // SAFETY: sigemptyset initializes the zeroed set before sigaddset reads it.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        if libc::sigemptyset(&mut set) != 0 {
            return Err("Failed to initialize signal set".to_string());
        }
        for signal in [libc::SIGHUP, libc::SIGTERM, libc::SIGINT] {
            if libc::sigaddset(&mut set, signal) != 0 {
                return Err(format!("Failed to add signal {} to set", signal));
            }
        }
        Ok(set)
    }
}

fn wait_loop(set: libc::sigset_t, signals: ControlSignals) {
    loop {
        let mut received: libc::c_int = 0;
        // SAFETY: both pointers reference live stack values.
        let rc = unsafe { libc::sigwait(&set, &mut received) };
        if rc != 0 {
            tracing::warn!(errno = rc, "sigwait failed; signal thread exiting");
            return;
        }

        match received {
            libc::SIGHUP => {
                tracing::info!("Received SIGHUP; configuration reload requested");
                signals.request_reload();
            }
            libc::SIGTERM | libc::SIGINT => {
                tracing::info!(signal = received, "Received termination signal");
                signals.request_shutdown();
            }
            other => {
                tracing::debug!(signal = other, "Ignoring unexpected signal");
            }
        }
    }
}

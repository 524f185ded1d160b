//! # lamplighter-core
//!
//! Presence state machine for Lamplighter. Turns noisy network scans (or
//! heartbeat timestamps) into a stable home/away state per identity and for
//! the household, and invokes callbacks on confirmed transitions.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The runner is one sequential loop.
//! - **Asymmetric confidence**: Arrivals commit on the first sighting;
//!   departures only after a full confirmation sequence.
//! - **Unknown is not absent**: A failed scan never becomes a state value.
//! - **Durable**: State lives in SQLite so a restart does not re-fire
//!   transitions.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lamplighter_core::*;
//!
//! let config = load_config(None)?;
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let store = Store::open(config.state_db_path()?)?;
//! let source = CommandSource::new(
//!     config.scanner.fast_command.clone(),
//!     config.scanner.thorough_command.clone(),
//!     Duration::from_secs(config.scanner.timeout_secs),
//! );
//! let scanner = Scanner::new(Box::new(source), RetryPolicy::default(), Duration::from_secs(1), clock.clone());
//! let mut engine = PresenceEngine::new(&config, scanner, store, Callbacks::new(), clock, ControlSignals::new());
//! let report = engine.cycle()?;
//! ```

pub mod backoff;
pub mod callbacks;
pub mod clock;
pub mod command;
pub mod config;
pub mod control;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod pidfile;
pub mod presence;
pub mod quiet_hours;
pub mod runner;
pub mod scanner;
pub mod stats;
pub mod store;

pub use backoff::RetryPolicy;
pub use callbacks::{CallbackSlot, Callbacks};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{run_with_timeout, CommandFailure};
pub use config::*;
pub use control::ControlSignals;
pub use debounce::{DebounceSession, DebounceSettings, Debouncer, DepartureOutcome, Verdict};
pub use engine::{CycleReport, PresenceEngine};
pub use error::{LamplighterError, Result};
pub use pidfile::PidFile;
pub use presence::*;
pub use quiet_hours::QuietHoursWindow;
pub use runner::Runner;
pub use scanner::{CommandSource, ConfirmAbsence, HeartbeatSource, PresenceSource, ScanProfile, Scanner};
pub use stats::RunnerStats;
pub use store::Store;

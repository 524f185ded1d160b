//! Fixed-cadence driver for the engine.
//!
//! Strictly sequential: one cycle (confirmation delays included) finishes
//! before the next starts. Reload and shutdown requests are only looked at
//! between cycles.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{Config, ConfigCell};
use crate::control::ControlSignals;
use crate::engine::{CycleReport, PresenceEngine};
use crate::error::Result;
use crate::stats::RunnerStats;

pub type ConfigLoader = Box<dyn FnMut() -> Result<Config> + Send>;
pub type ReloadHook = Box<dyn FnMut(&Config, &mut PresenceEngine) + Send>;

pub struct Runner {
    engine: PresenceEngine,
    config: Arc<ConfigCell>,
    loader: ConfigLoader,
    on_reload: Option<ReloadHook>,
    signals: ControlSignals,
    clock: Arc<dyn Clock>,
    stats: RunnerStats,
}

impl Runner {
    pub fn new(
        engine: PresenceEngine,
        config: Arc<ConfigCell>,
        loader: ConfigLoader,
        signals: ControlSignals,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = RunnerStats::new(clock.now());
        Self {
            engine,
            config,
            loader,
            on_reload: None,
            signals,
            clock,
            stats,
        }
    }

    /// Extra work after a successful reload (rebuilding the scanner or
    /// hooks, adjusting log verbosity).
    pub fn with_reload_hook(
        mut self,
        hook: impl FnMut(&Config, &mut PresenceEngine) + Send + 'static,
    ) -> Self {
        self.on_reload = Some(Box::new(hook));
        self
    }

    pub fn engine(&self) -> &PresenceEngine {
        &self.engine
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    /// Runs until shutdown is requested.
    pub fn run(&mut self) -> RunnerStats {
        tracing::info!(
            identities = self.engine.identities().len(),
            "Presence loop started"
        );

        while !self.signals.shutdown_requested() {
            if self.signals.take_reload() {
                self.reload();
            }

            // Failures are already logged and counted.
            let _ = self.run_once();

            let now = self.clock.now();
            let config = self.config.snapshot();
            if self
                .stats
                .should_report(now, std::time::Duration::from_secs(config.general.report_frequency_secs))
            {
                self.stats.log_summary(now);
                self.stats.mark_reported(now);
            }

            if self.signals.shutdown_requested() {
                break;
            }
            self.clock.sleep(config.poll_interval());
        }

        tracing::info!("Shutdown requested; presence loop stopped");
        self.stats.log_summary(self.clock.now());
        self.stats.clone()
    }

    /// One engine cycle with stats accounting. A failed cycle leaves state
    /// as it was and is retried on the next tick.
    pub fn run_once(&mut self) -> Result<CycleReport> {
        match self.engine.cycle() {
            Ok(report) => {
                self.stats.record_cycle(&report);
                if let Some(reason) = &report.debounce_aborted {
                    tracing::warn!(reason = %reason, "Departure confirmation aborted; retrying next cycle");
                }
                tracing::debug!(
                    probes = report.probes,
                    aggregate = ?report.aggregate_after,
                    quiet = report.quiet,
                    "Cycle complete"
                );
                Ok(report)
            }
            Err(err) => {
                let probes = self.engine.take_probe_count();
                self.stats.record_failure(probes);
                tracing::warn!(error = %err, transient = err.is_transient(), "Presence cycle failed");
                Err(err)
            }
        }
    }

    /// Re-reads configuration. On failure the last good configuration
    /// stays in effect.
    pub fn reload(&mut self) {
        match (self.loader)() {
            Ok(config) => {
                self.config.replace(config);
                let snapshot = self.config.snapshot();
                self.engine.apply_config(&snapshot);
                if let Some(hook) = self.on_reload.as_mut() {
                    hook(&snapshot, &mut self.engine);
                }
                tracing::info!(
                    identities = snapshot.identities.len(),
                    "Configuration reloaded"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "Configuration reload failed; keeping last good configuration");
            }
        }
    }
}

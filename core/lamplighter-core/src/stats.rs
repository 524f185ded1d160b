//! Counters for the periodic runner summary.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::engine::CycleReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerStats {
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub scans: u64,
    pub confirmation_scans: u64,
    pub state_changes: u64,
    pub failed_cycles: u64,
    pub last_report: DateTime<Utc>,
}

impl RunnerStats {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            cycles: 0,
            scans: 0,
            confirmation_scans: 0,
            state_changes: 0,
            failed_cycles: 0,
            last_report: now,
        }
    }

    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.scans += report.probes;
        self.confirmation_scans += u64::from(report.confirmation_scans);
        self.state_changes += (report.arrived.len() + report.departed.len()) as u64;
    }

    pub fn record_failure(&mut self, probes: u64) {
        self.cycles += 1;
        self.failed_cycles += 1;
        self.scans += probes;
    }

    pub fn running_for(&self, now: DateTime<Utc>) -> ChronoDuration {
        now.signed_duration_since(self.started_at)
    }

    /// Scans per hour of uptime. Uptime under an hour counts as one hour.
    pub fn scans_per_hour(&self, now: DateTime<Utc>) -> f64 {
        let hours = self.running_for(now).num_seconds() as f64 / 3600.0;
        self.scans as f64 / hours.max(1.0)
    }

    pub fn should_report(&self, now: DateTime<Utc>, frequency: Duration) -> bool {
        if frequency.is_zero() {
            return false;
        }
        let elapsed = now.signed_duration_since(self.last_report);
        elapsed.to_std().map(|elapsed| elapsed >= frequency).unwrap_or(false)
    }

    pub fn mark_reported(&mut self, now: DateTime<Utc>) {
        self.last_report = now;
    }

    pub fn log_summary(&self, now: DateTime<Utc>) {
        tracing::info!(
            running_for_mins = self.running_for(now).num_minutes(),
            cycles = self.cycles,
            scans = self.scans,
            confirmation_scans = self.confirmation_scans,
            scans_per_hour = format!("{:.1}", self.scans_per_hour(now)),
            state_changes = self.state_changes,
            failed_cycles = self.failed_cycles,
            "Runner summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn reports_are_due_after_frequency_elapses() {
        let start = Utc::now();
        let mut stats = RunnerStats::new(start);
        let hour = Duration::from_secs(3600);

        assert!(!stats.should_report(start + ChronoDuration::minutes(59), hour));
        assert!(stats.should_report(start + ChronoDuration::minutes(60), hour));

        stats.mark_reported(start + ChronoDuration::minutes(60));
        assert!(!stats.should_report(start + ChronoDuration::minutes(90), hour));
        assert!(!stats.should_report(start + ChronoDuration::days(1), Duration::ZERO));
    }

    #[test]
    fn cycle_reports_feed_counters() {
        let start = Utc::now();
        let mut stats = RunnerStats::new(start);
        stats.record_cycle(&CycleReport {
            arrived: BTreeSet::from(["aaron".to_string()]),
            departed: BTreeSet::from(["veronica".to_string()]),
            probes: 5,
            confirmation_scans: 3,
            ..CycleReport::default()
        });
        stats.record_failure(2);

        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.failed_cycles, 1);
        assert_eq!(stats.scans, 7);
        assert_eq!(stats.confirmation_scans, 3);
        assert_eq!(stats.state_changes, 2);
    }

    #[test]
    fn scans_per_hour_uses_at_least_one_hour() {
        let start = Utc::now();
        let mut stats = RunnerStats::new(start);
        stats.scans = 120;
        assert_eq!(stats.scans_per_hour(start + ChronoDuration::minutes(10)), 120.0);
        assert_eq!(stats.scans_per_hour(start + ChronoDuration::hours(4)), 30.0);
    }
}

//! Asymmetric-confidence confirmation of state transitions.
//!
//! A detected device is really there, so `away → home` is confirmed on the
//! first positive reading. A missed device may just be asleep, so
//! `home → away` waits out a settle delay and then needs `attempts`
//! consecutive misses, `spacing` apart, each from a thorough scan. A single
//! sighting during that sequence is a false alarm and leaves state alone.
//!
//! A failed scan aborts the sequence rather than counting as a miss; the
//! candidates stay `home` and are looked at again next cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::control::ControlSignals;
use crate::error::Result;
use crate::presence::{Observation, Presence};
use crate::scanner::ConfirmAbsence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub attempts: u32,
    pub spacing: Duration,
    pub settle_delay: Duration,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            spacing: Duration::from_secs(5),
            settle_delay: Duration::from_secs(10),
        }
    }
}

/// Bookkeeping for one running confirmation. Dropped when it resolves.
#[derive(Debug, Clone)]
pub struct DebounceSession {
    pub candidate_state: Presence,
    pub candidates: BTreeSet<String>,
    pub attempts_so_far: u32,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl DebounceSession {
    fn departures(candidates: BTreeSet<String>, settings: &DebounceSettings) -> Self {
        Self {
            candidate_state: Presence::Away,
            candidates,
            attempts_so_far: 0,
            max_attempts: settings.attempts,
            interval: settings.spacing,
        }
    }

    fn is_complete(&self) -> bool {
        self.candidates.is_empty() || self.attempts_so_far >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Observation agrees with the current state; nothing to confirm.
    Unchanged,
    Confirmed,
    FalseAlarm,
    /// A confirmation scan failed; state must stay as it is.
    Inconclusive(String),
    /// Shutdown was requested between confirmation steps.
    Interrupted,
}

impl Verdict {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verdict::Confirmed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepartureOutcome {
    /// Missed on every confirmation scan.
    pub confirmed: BTreeSet<String>,
    /// Seen at least once during the sequence.
    pub false_alarms: BTreeSet<String>,
    /// Still pending when the sequence was aborted.
    pub unresolved: BTreeSet<String>,
    pub confirmation_scans: u32,
    pub aborted: Option<String>,
    pub interrupted: bool,
}

pub struct Debouncer {
    settings: DebounceSettings,
    clock: Arc<dyn Clock>,
    signals: ControlSignals,
}

impl Debouncer {
    pub fn new(settings: DebounceSettings, clock: Arc<dyn Clock>, signals: ControlSignals) -> Self {
        Self {
            settings,
            clock,
            signals,
        }
    }

    pub fn settings(&self) -> &DebounceSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: DebounceSettings) {
        self.settings = settings;
    }

    /// Single-identity form: decides whether `from → observed` should be
    /// committed. `rescan` reports whether the identity is currently seen.
    pub fn confirm_transition(
        &self,
        alias: &str,
        from: Presence,
        observed_present: bool,
        mut rescan: impl FnMut(&ConfirmAbsence) -> Result<bool>,
    ) -> Verdict {
        match (from, observed_present) {
            (Presence::Away, true) => Verdict::Confirmed,
            (Presence::Home, true) | (Presence::Away, false) => Verdict::Unchanged,
            (Presence::Home, false) => {
                let outcome = self.confirm_departures(BTreeSet::from([alias.to_string()]), |confirm| {
                    rescan(confirm).map(|present| {
                        Observation::new(present.then(|| alias.to_string()))
                    })
                });
                if outcome.interrupted {
                    Verdict::Interrupted
                } else if let Some(reason) = outcome.aborted {
                    Verdict::Inconclusive(reason)
                } else if outcome.confirmed.contains(alias) {
                    Verdict::Confirmed
                } else {
                    Verdict::FalseAlarm
                }
            }
        }
    }

    /// Runs one confirmation sequence for every identity that looked like it
    /// left this cycle. Candidates drop out individually as they are seen.
    pub fn confirm_departures(
        &self,
        candidates: BTreeSet<String>,
        mut rescan: impl FnMut(&ConfirmAbsence) -> Result<Observation>,
    ) -> DepartureOutcome {
        let mut outcome = DepartureOutcome::default();
        if candidates.is_empty() {
            return outcome;
        }

        let mut session = DebounceSession::departures(candidates, &self.settings);
        tracing::info!(
            candidates = ?session.candidates,
            settle_secs = self.settings.settle_delay.as_secs(),
            attempts = session.max_attempts,
            "Possible change to away; settling before confirmation searches"
        );

        if self.interrupted(&mut outcome, &session) {
            return outcome;
        }
        self.clock.sleep(self.settings.settle_delay);

        while !session.is_complete() {
            if self.interrupted(&mut outcome, &session) {
                return outcome;
            }

            let confirm = ConfirmAbsence::Of(session.candidates.clone());
            let observation = match rescan(&confirm) {
                Ok(observation) => observation,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        attempt = session.attempts_so_far + 1,
                        "Confirmation search failed; leaving state unchanged"
                    );
                    outcome.unresolved = session.candidates;
                    outcome.aborted = Some(err.to_string());
                    return outcome;
                }
            };
            session.attempts_so_far += 1;
            outcome.confirmation_scans += 1;

            let seen: Vec<String> = session
                .candidates
                .iter()
                .filter(|alias| observation.is_present(alias))
                .cloned()
                .collect();
            for alias in seen {
                tracing::info!(alias = %alias, attempt = session.attempts_so_far, "False alarm, device found");
                session.candidates.remove(&alias);
                outcome.false_alarms.insert(alias);
            }

            tracing::debug!(
                attempt = session.attempts_so_far,
                remaining = session.candidates.len(),
                "Confirmation search complete"
            );

            if !session.is_complete() {
                self.clock.sleep(session.interval);
            }
        }

        if !session.candidates.is_empty() {
            tracing::info!(
                confirmed = ?session.candidates,
                "Devices confirmed missing"
            );
        }
        outcome.confirmed = session.candidates;
        outcome
    }

    fn interrupted(&self, outcome: &mut DepartureOutcome, session: &DebounceSession) -> bool {
        if !self.signals.shutdown_requested() {
            return false;
        }
        tracing::info!("Shutdown requested; abandoning confirmation sequence");
        outcome.unresolved = session.candidates.clone();
        outcome.interrupted = true;
        true
    }
}

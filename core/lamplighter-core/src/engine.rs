//! The presence state machine.
//!
//! Each cycle reads the stored records, takes one observation, seeds any
//! identity seen for the first time, commits arrivals at once, runs the
//! debouncer over apparent departures and finally fires callbacks. The
//! aggregate is recomputed each cycle from the records read at its start
//! plus the transitions it committed; the engine is the only writer.
//!
//! A failed observation ends the cycle before anything is written. A store
//! failure after some writes still dispatches callbacks for those writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::callbacks::{CallbackSlot, Callbacks};
use crate::clock::Clock;
use crate::config::{tracked_aliases, Config, TrackingMode};
use crate::control::ControlSignals;
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::presence::{
    aggregate, aggregate_states, Identity, Observation, Presence, PresenceRecord, HOUSEHOLD_ALIAS,
};
use crate::quiet_hours::QuietHoursWindow;
use crate::scanner::{ConfirmAbsence, Scanner};
use crate::store::Store;

/// What one cycle did. Returned to the runner for stats and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// First observation of an alias; not a transition.
    pub seeded: BTreeMap<String, Presence>,
    pub arrived: BTreeSet<String>,
    pub departed: BTreeSet<String>,
    pub false_alarms: BTreeSet<String>,
    pub aggregate_before: Option<Presence>,
    pub aggregate_after: Option<Presence>,
    pub quiet: bool,
    pub fired: Vec<CallbackSlot>,
    pub probes: u64,
    pub confirmation_scans: u32,
    /// Set when a confirmation scan failed and departures were left alone.
    pub debounce_aborted: Option<String>,
    /// Set when shutdown interrupted the confirmation sequence.
    pub interrupted: bool,
    /// Consecutive idle cycles counted so far, this one included.
    pub idle_cycles: u32,
    /// The "no presence changes" line was logged this cycle.
    pub idle_reported: bool,
}

impl CycleReport {
    /// Aliases that transitioned this cycle.
    pub fn changed(&self) -> BTreeSet<String> {
        self.arrived.union(&self.departed).cloned().collect()
    }

    pub fn aggregate_changed(&self) -> bool {
        matches!(
            (self.aggregate_before, self.aggregate_after),
            (Some(before), Some(after)) if before != after
        )
    }

    pub fn is_idle(&self) -> bool {
        self.seeded.is_empty() && self.arrived.is_empty() && self.departed.is_empty()
    }
}

pub struct PresenceEngine {
    identities: Vec<Identity>,
    tracking: TrackingMode,
    quiet_hours: QuietHoursWindow,
    idle_report_cycles: u32,
    idle_cycles: u32,
    scanner: Scanner,
    debouncer: Debouncer,
    store: Store,
    callbacks: Callbacks,
    clock: Arc<dyn Clock>,
}

impl PresenceEngine {
    pub fn new(
        config: &Config,
        scanner: Scanner,
        store: Store,
        callbacks: Callbacks,
        clock: Arc<dyn Clock>,
        signals: ControlSignals,
    ) -> Self {
        Self {
            identities: config.identities.clone(),
            tracking: config.general.tracking,
            quiet_hours: config.quiet_hours(),
            idle_report_cycles: config.general.idle_report_cycles,
            idle_cycles: 0,
            scanner,
            debouncer: Debouncer::new(config.debounce_settings(), Arc::clone(&clock), signals),
            store,
            callbacks,
            clock,
        }
    }

    /// Picks up a reloaded configuration. Stored presence is untouched;
    /// newly added identities are seeded on the next cycle.
    pub fn apply_config(&mut self, config: &Config) {
        self.identities = config.identities.clone();
        self.tracking = config.general.tracking;
        self.quiet_hours = config.quiet_hours();
        self.idle_report_cycles = config.general.idle_report_cycles;
        self.debouncer.set_settings(config.debounce_settings());
    }

    pub fn replace_scanner(&mut self, scanner: Scanner) {
        self.scanner = scanner;
    }

    pub fn replace_callbacks(&mut self, callbacks: Callbacks) {
        self.callbacks = callbacks;
    }

    /// Probes run since the last report, including those of failed cycles.
    pub fn take_probe_count(&mut self) -> u64 {
        self.scanner.take_probe_count()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tracked_aliases(&self) -> Vec<String> {
        tracked_aliases(&self.identities, self.tracking)
    }

    /// Current records and the aggregate derived from them.
    pub fn snapshot(&self) -> Result<(Vec<PresenceRecord>, Option<Presence>)> {
        let records = self.store.get_all(&self.tracked_aliases())?;
        let derived = aggregate(&records);
        Ok((records, derived))
    }

    pub fn cycle(&mut self) -> Result<CycleReport> {
        let tracked = self.tracked_aliases();
        let before = self.store.get_all(&tracked)?;
        let known: BTreeMap<String, Presence> = before
            .iter()
            .map(|record| (record.alias.clone(), record.state))
            .collect();

        let mut report = CycleReport {
            aggregate_before: aggregate(&before),
            ..CycleReport::default()
        };

        let home: BTreeSet<String> = known
            .iter()
            .filter(|(_, state)| **state == Presence::Home)
            .map(|(alias, _)| alias.clone())
            .collect();
        let confirm = if home.is_empty() {
            ConfirmAbsence::Never
        } else {
            ConfirmAbsence::Of(home)
        };

        let observation =
            observe(&mut self.scanner, &self.identities, self.tracking, &confirm, true)?;

        // Anything committed before a store failure still gets its callbacks.
        let committed = self.commit(&tracked, &known, &observation, &mut report);

        let mut states = known;
        states.extend(report.seeded.iter().map(|(alias, state)| (alias.clone(), *state)));
        states.extend(report.arrived.iter().map(|alias| (alias.clone(), Presence::Home)));
        states.extend(report.departed.iter().map(|alias| (alias.clone(), Presence::Away)));
        report.aggregate_after = aggregate_states(states.into_values());
        report.quiet = self.quiet_hours.is_quiet(&self.clock.local_now());

        if let Err(err) = committed {
            if !report.changed().is_empty() {
                tracing::warn!(
                    error = %err,
                    changed = ?report.changed(),
                    "Store failed mid-cycle; firing callbacks for committed transitions"
                );
            }
            self.dispatch(&mut report);
            return Err(err);
        }

        report.probes = self.scanner.take_probe_count();
        self.dispatch(&mut report);
        self.track_idle(&mut report);
        Ok(report)
    }

    /// Seeds, arrivals and confirmed departures, each recorded in `report`
    /// as soon as its write commits.
    fn commit(
        &mut self,
        tracked: &[String],
        known: &BTreeMap<String, Presence>,
        observation: &Observation,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = self.clock.now();

        let mut departures = BTreeSet::new();
        for alias in tracked {
            let present = observation.is_present(alias);
            match known.get(alias) {
                None => {
                    let state = Presence::from_observed(present);
                    if self.store.transition(alias, None, state, now)?.is_some() {
                        tracing::info!(alias = %alias, state = %state, "Seeded presence");
                        report.seeded.insert(alias.clone(), state);
                    }
                }
                Some(Presence::Away) if present => {
                    if self
                        .store
                        .transition(alias, Some(Presence::Away), Presence::Home, now)?
                        .is_some()
                    {
                        tracing::info!(alias = %alias, "Arrived");
                        report.arrived.insert(alias.clone());
                    }
                }
                Some(Presence::Home) if !present => {
                    departures.insert(alias.clone());
                }
                _ => {}
            }
        }

        if departures.is_empty() {
            return Ok(());
        }

        let scanner = &mut self.scanner;
        let identities = &self.identities;
        let tracking = self.tracking;
        let outcome = self.debouncer.confirm_departures(departures, |confirm| {
            observe(scanner, identities, tracking, confirm, false)
        });

        report.confirmation_scans = outcome.confirmation_scans;
        report.false_alarms = outcome.false_alarms;
        report.debounce_aborted = outcome.aborted;
        report.interrupted = outcome.interrupted;

        let at = self.clock.now();
        for alias in &outcome.confirmed {
            if self
                .store
                .transition(alias, Some(Presence::Home), Presence::Away, at)?
                .is_some()
            {
                tracing::info!(alias = %alias, "Departed");
                report.departed.insert(alias.clone());
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, report: &mut CycleReport) {
        let changed = report.changed();
        // Seeding alone may move the aggregate but is never a transition.
        if changed.is_empty() {
            return;
        }

        if report.aggregate_changed() {
            if let Some(state) = report.aggregate_after {
                tracing::info!(state = %state, changed = ?changed, quiet = report.quiet, "Household presence changed");
                let result = self.callbacks.fire_aggregate(state, report.quiet, &changed);
                note_fired(report, CallbackSlot::aggregate(state), result);
            }
            return;
        }

        if self.tracking != TrackingMode::PerIdentity {
            return;
        }

        let transitions = report
            .arrived
            .iter()
            .map(|alias| (alias.clone(), Presence::Home))
            .chain(
                report
                    .departed
                    .iter()
                    .map(|alias| (alias.clone(), Presence::Away)),
            )
            .collect::<Vec<_>>();
        for (alias, state) in transitions {
            let Some(identity) = self.identities.iter().find(|identity| identity.alias == alias) else {
                continue;
            };
            let result = self.callbacks.fire_identity(state, report.quiet, identity);
            note_fired(report, CallbackSlot::identity(state), result);
        }
    }

    fn track_idle(&mut self, report: &mut CycleReport) {
        if !report.is_idle() {
            self.idle_cycles = 0;
            return;
        }
        self.idle_cycles += 1;
        report.idle_cycles = self.idle_cycles;
        if self.idle_report_cycles > 0 && self.idle_cycles >= self.idle_report_cycles {
            tracing::info!(
                cycles = self.idle_cycles,
                aggregate = report.aggregate_after.map(|state| state.as_str()).unwrap_or("unknown"),
                "No presence changes"
            );
            report.idle_reported = true;
            self.idle_cycles = 0;
        }
    }
}

fn note_fired(report: &mut CycleReport, slot: CallbackSlot, result: Result<bool>) {
    match result {
        Ok(true) => report.fired.push(slot),
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(slot = slot.as_str(), error = %err, "Callback failed");
            report.fired.push(slot);
        }
    }
}

/// One observation expressed in tracked aliases. In combined mode the
/// household is present iff anything at all was detected.
fn observe(
    scanner: &mut Scanner,
    identities: &[Identity],
    tracking: TrackingMode,
    confirm: &ConfirmAbsence,
    retry: bool,
) -> Result<Observation> {
    let confirm = match (tracking, confirm) {
        (TrackingMode::Combined, ConfirmAbsence::Of(_)) => ConfirmAbsence::Everyone,
        (_, other) => other.clone(),
    };

    let observation = if retry {
        scanner.scan_with_retry(identities, &confirm)?
    } else {
        scanner.scan(identities, &confirm)?
    };

    Ok(match tracking {
        TrackingMode::PerIdentity => observation,
        TrackingMode::Combined => {
            Observation::new((observation.count() > 0).then(|| HOUSEHOLD_ALIAS.to_string()))
        }
    })
}

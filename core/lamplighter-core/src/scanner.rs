//! Presence scanning.
//!
//! A [`PresenceSource`] is the narrow seam to the outside world: an external
//! network scanner or the heartbeat log. [`Scanner`] layers the two-tier
//! policy on top. A fast probe is trusted when it finds someone; when it
//! misses someone and the caller asks for confirmation, a slower thorough
//! probe runs before the miss is believed.
//!
//! Failures are always `ScanUnavailable` and never an empty observation.

use chrono::Duration as ChronoDuration;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::clock::Clock;
use crate::command::run_with_timeout;
use crate::error::{LamplighterError, Result};
use crate::presence::{Identity, Observation};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProfile {
    Fast,
    Thorough,
}

impl ScanProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanProfile::Fast => "fast",
            ScanProfile::Thorough => "thorough",
        }
    }
}

/// Which misses are worth a thorough second look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAbsence {
    Never,
    /// Any of these aliases missing from the fast probe.
    Of(BTreeSet<String>),
    /// The fast probe found nobody at all.
    Everyone,
}

impl ConfirmAbsence {
    fn needs_thorough(&self, observation: &Observation) -> bool {
        match self {
            ConfirmAbsence::Never => false,
            ConfirmAbsence::Of(aliases) => aliases.iter().any(|alias| !observation.is_present(alias)),
            ConfirmAbsence::Everyone => observation.count() == 0,
        }
    }
}

pub trait PresenceSource: Send {
    fn probe(&mut self, identities: &[Identity], profile: ScanProfile) -> Result<Observation>;

    /// Whether a thorough probe can see anything a fast probe missed.
    fn has_tiers(&self) -> bool {
        true
    }
}

/// Runs an external network scanner and looks for each identity's device
/// fingerprint in its output.
#[derive(Debug, Clone)]
pub struct CommandSource {
    fast: Vec<String>,
    thorough: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(fast: Vec<String>, thorough: Vec<String>, timeout: Duration) -> Self {
        Self {
            fast,
            thorough,
            timeout,
        }
    }

    fn command_for(&self, profile: ScanProfile) -> &[String] {
        match profile {
            ScanProfile::Thorough if !self.thorough.is_empty() => &self.thorough,
            _ => &self.fast,
        }
    }
}

impl PresenceSource for CommandSource {
    fn probe(&mut self, identities: &[Identity], profile: ScanProfile) -> Result<Observation> {
        let argv = self.command_for(profile);
        tracing::debug!(profile = profile.as_str(), command = ?argv, "Searching for devices");
        let output = run_with_timeout(argv, &[], self.timeout).map_err(|err| {
            LamplighterError::ScanUnavailable(format!("{} scan {}", profile.as_str(), err))
        })?;
        Ok(match_output(&output, identities))
    }

    fn has_tiers(&self) -> bool {
        !self.thorough.is_empty()
    }
}

/// Identities whose fingerprint appears anywhere in scanner output.
pub fn match_output(output: &str, identities: &[Identity]) -> Observation {
    let haystack = output.to_lowercase();
    Observation::new(
        identities
            .iter()
            .filter(|identity| identity.matches(&haystack))
            .map(|identity| {
                tracing::debug!(alias = %identity.alias, "Found device");
                identity.alias.clone()
            }),
    )
}

/// Presence from the heartbeat log: someone is present when their last
/// heartbeat is younger than the staleness threshold.
pub struct HeartbeatSource {
    store: Store,
    staleness: Duration,
    clock: Arc<dyn Clock>,
}

impl HeartbeatSource {
    pub fn new(store: Store, staleness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            staleness,
            clock,
        }
    }
}

impl PresenceSource for HeartbeatSource {
    fn probe(&mut self, identities: &[Identity], _profile: ScanProfile) -> Result<Observation> {
        let aliases: Vec<String> = identities
            .iter()
            .map(|identity| identity.alias.clone())
            .collect();
        let last_seen = self.store.last_seen_all(&aliases).map_err(|err| {
            LamplighterError::ScanUnavailable(format!("heartbeat lookup failed: {}", err))
        })?;

        let now = self.clock.now();
        let staleness =
            ChronoDuration::from_std(self.staleness).unwrap_or_else(|_| ChronoDuration::weeks(5200));
        Ok(Observation::new(last_seen.into_iter().filter_map(
            |(alias, seen_at)| {
                let age = now.signed_duration_since(seen_at);
                (age < staleness).then_some(alias)
            },
        )))
    }

    fn has_tiers(&self) -> bool {
        false
    }
}

pub struct Scanner {
    source: Box<dyn PresenceSource>,
    retry: RetryPolicy,
    tier_gap: Duration,
    clock: Arc<dyn Clock>,
    probes: u64,
}

impl Scanner {
    pub fn new(
        source: Box<dyn PresenceSource>,
        retry: RetryPolicy,
        tier_gap: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            retry,
            tier_gap,
            clock,
            probes: 0,
        }
    }

    /// One two-tier scan. A miss covered by `confirm` triggers a thorough
    /// probe whose detections are merged in.
    pub fn scan(&mut self, identities: &[Identity], confirm: &ConfirmAbsence) -> Result<Observation> {
        let mut observation = self.probe(identities, ScanProfile::Fast)?;

        if self.source.has_tiers() && confirm.needs_thorough(&observation) {
            tracing::debug!(
                found = observation.count(),
                "Fast scan missed devices; confirming with thorough scan"
            );
            self.clock.sleep(self.tier_gap);
            observation.merge(self.probe(identities, ScanProfile::Thorough)?);
        }

        Ok(observation)
    }

    /// [`Scanner::scan`] retried with backoff. The observation step is the
    /// only thing retried; failures never turn into "nobody is home".
    pub fn scan_with_retry(
        &mut self,
        identities: &[Identity],
        confirm: &ConfirmAbsence,
    ) -> Result<Observation> {
        let retry = self.retry;
        let clock = Arc::clone(&self.clock);
        retry.run(
            |delay| clock.sleep(delay),
            |attempt| {
                self.scan(identities, confirm).map_err(|err| {
                    tracing::warn!(attempt, error = %err, "Presence scan failed");
                    err
                })
            },
        )
    }

    /// Probes run since the previous call.
    pub fn take_probe_count(&mut self) -> u64 {
        std::mem::take(&mut self.probes)
    }

    fn probe(&mut self, identities: &[Identity], profile: ScanProfile) -> Result<Observation> {
        self.probes += 1;
        self.source.probe(identities, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn identity(alias: &str, rule: &str) -> Identity {
        Identity {
            alias: alias.to_string(),
            name: alias.to_string(),
            match_rule: rule.to_string(),
            notification_target: None,
        }
    }

    struct Scripted {
        replies: Arc<Mutex<VecDeque<Result<Vec<&'static str>>>>>,
        profiles: Arc<Mutex<Vec<ScanProfile>>>,
    }

    impl PresenceSource for Scripted {
        fn probe(&mut self, _: &[Identity], profile: ScanProfile) -> Result<Observation> {
            self.profiles.lock().expect("profiles").push(profile);
            let reply = self
                .replies
                .lock()
                .expect("replies")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            reply.map(|aliases| Observation::new(aliases.into_iter().map(str::to_string)))
        }
    }

    fn scripted(
        replies: Vec<Result<Vec<&'static str>>>,
    ) -> (Scripted, Arc<Mutex<Vec<ScanProfile>>>) {
        let profiles = Arc::new(Mutex::new(Vec::new()));
        (
            Scripted {
                replies: Arc::new(Mutex::new(replies.into())),
                profiles: Arc::clone(&profiles),
            },
            profiles,
        )
    }

    #[test]
    fn matches_fingerprints_case_insensitively() {
        let identities = vec![
            identity("aaron", "AA:BB:CC:DD:EE:FF"),
            identity("veronica", "11:22:33:44:55:66"),
        ];
        let output = "Nmap scan report for 192.168.10.4\nMAC Address: aa:bb:cc:dd:ee:ff (Apple)";
        let observation = match_output(output, &identities);
        assert!(observation.is_present("aaron"));
        assert!(!observation.is_present("veronica"));
        assert_eq!(observation.count(), 1);
    }

    #[test]
    fn thorough_probe_only_runs_when_fast_probe_misses_and_confirmation_requested() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let identities = vec![identity("aaron", "x")];

        let (source, profiles) = scripted(vec![Ok(vec![]), Ok(vec!["aaron"])]);
        let mut scanner = Scanner::new(
            Box::new(source),
            RetryPolicy::immediate(1),
            Duration::from_secs(1),
            clock.clone(),
        );
        let confirm = ConfirmAbsence::Of(BTreeSet::from(["aaron".to_string()]));
        let observation = scanner.scan(&identities, &confirm).expect("scan");
        assert!(observation.is_present("aaron"));
        assert_eq!(
            *profiles.lock().expect("profiles"),
            vec![ScanProfile::Fast, ScanProfile::Thorough]
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert_eq!(scanner.take_probe_count(), 2);
        assert_eq!(scanner.take_probe_count(), 0);

        let (source, profiles) = scripted(vec![Ok(vec![])]);
        let mut scanner = Scanner::new(
            Box::new(source),
            RetryPolicy::immediate(1),
            Duration::from_secs(1),
            clock,
        );
        let observation = scanner
            .scan(&identities, &ConfirmAbsence::Never)
            .expect("scan");
        assert_eq!(observation.count(), 0);
        assert_eq!(*profiles.lock().expect("profiles"), vec![ScanProfile::Fast]);
    }

    #[test]
    fn everyone_policy_ignores_partial_misses() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let identities = vec![identity("aaron", "x"), identity("veronica", "y")];
        let (source, profiles) = scripted(vec![Ok(vec!["aaron"])]);
        let mut scanner = Scanner::new(
            Box::new(source),
            RetryPolicy::immediate(1),
            Duration::from_secs(1),
            clock,
        );
        let observation = scanner
            .scan(&identities, &ConfirmAbsence::Everyone)
            .expect("scan");
        assert_eq!(observation.count(), 1);
        assert_eq!(*profiles.lock().expect("profiles"), vec![ScanProfile::Fast]);
    }

    #[test]
    fn failures_are_retried_then_surface_as_scan_unavailable() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let identities = vec![identity("aaron", "x")];
        let (source, _) = scripted(vec![
            Err(LamplighterError::ScanUnavailable("boom".to_string())),
            Err(LamplighterError::ScanUnavailable("boom".to_string())),
            Err(LamplighterError::ScanUnavailable("boom".to_string())),
        ]);
        let mut scanner = Scanner::new(
            Box::new(source),
            RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10)),
            Duration::ZERO,
            clock.clone(),
        );
        let err = scanner
            .scan_with_retry(&identities, &ConfirmAbsence::Everyone)
            .expect_err("fails");
        assert!(matches!(err, LamplighterError::ScanUnavailable(_)));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn heartbeat_source_uses_staleness_threshold() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(dir.path().join("state.db")).expect("store");
        let now = Utc::now();
        store
            .record_heartbeat("aaron", now - ChronoDuration::minutes(10))
            .expect("heartbeat");
        store
            .record_heartbeat("veronica", now - ChronoDuration::minutes(50))
            .expect("heartbeat");

        let clock = Arc::new(ManualClock::new(now));
        let mut source = HeartbeatSource::new(store, Duration::from_secs(2700), clock);
        let identities = vec![
            identity("aaron", "Pixel"),
            identity("veronica", "iPhone"),
            identity("guest", "Galaxy"),
        ];
        let observation = source
            .probe(&identities, ScanProfile::Fast)
            .expect("probe");
        assert!(observation.is_present("aaron"));
        assert!(!observation.is_present("veronica"));
        assert!(!observation.is_present("guest"));
        assert!(!source.has_tiers());
    }

    #[cfg(unix)]
    #[test]
    fn command_source_matches_devices_in_latin1_output() {
        let mut source = CommandSource::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf '192.168.1.20\\taa:bb:cc:dd:ee:ff\\tSoci\\351t\\351 Ltd\\n'".to_string(),
            ],
            Vec::new(),
            Duration::from_secs(5),
        );
        let observation = source
            .probe(&[identity("aaron", "AA:BB:CC:DD:EE:FF")], ScanProfile::Fast)
            .expect("probe");
        assert!(observation.is_present("aaron"));
    }

    #[cfg(unix)]
    #[test]
    fn command_source_reports_failure_not_absence() {
        let mut source = CommandSource::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            Vec::new(),
            Duration::from_secs(5),
        );
        let err = source
            .probe(&[identity("aaron", "x")], ScanProfile::Fast)
            .expect_err("failure");
        assert!(matches!(err, LamplighterError::ScanUnavailable(_)));
    }
}

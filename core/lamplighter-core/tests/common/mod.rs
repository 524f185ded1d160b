#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use lamplighter_core::{
    Callbacks, Config, ControlSignals, Identity, LamplighterError, ManualClock, Observation,
    PresenceEngine, PresenceSource, Result, RetryPolicy, ScanProfile, Scanner, Store,
};
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type ProbeAction = Box<dyn FnOnce() + Send>;

/// Stand-in for the LAN. Probes see `present` unless a scripted reply is
/// queued, in which case the reply is consumed instead.
#[derive(Default)]
pub struct FakeNetwork {
    present: Mutex<BTreeSet<String>>,
    script: Mutex<VecDeque<Option<Vec<&'static str>>>>,
    probes: Mutex<Vec<ScanProfile>>,
    armed: Mutex<Option<(usize, ProbeAction)>>,
}

impl FakeNetwork {
    pub fn set_present(&self, aliases: &[&str]) {
        *self.present.lock().expect("present") = aliases.iter().map(|a| a.to_string()).collect();
    }

    /// Queues one probe reply; `None` is a scanner failure.
    pub fn push(&self, reply: Option<Vec<&'static str>>) {
        self.script.lock().expect("script").push_back(reply);
    }

    pub fn fail_next(&self, count: usize) {
        for _ in 0..count {
            self.push(None);
        }
    }

    pub fn probes(&self) -> Vec<ScanProfile> {
        self.probes.lock().expect("probes").clone()
    }

    /// Runs `action` once, when the `nth` probe from now (1-based) is made.
    pub fn on_probe(&self, nth: usize, action: impl FnOnce() + Send + 'static) {
        let target = self.probes.lock().expect("probes").len() + nth;
        *self.armed.lock().expect("armed") = Some((target, Box::new(action)));
    }

    fn record_probe(&self, profile: ScanProfile) {
        let count = {
            let mut probes = self.probes.lock().expect("probes");
            probes.push(profile);
            probes.len()
        };
        let due = {
            let mut armed = self.armed.lock().expect("armed");
            match armed.take() {
                Some((target, action)) if target == count => Some(action),
                other => {
                    *armed = other;
                    None
                }
            }
        };
        if let Some(action) = due {
            action();
        }
    }
}

pub struct FakeSource(pub Arc<FakeNetwork>);

impl PresenceSource for FakeSource {
    fn probe(&mut self, _identities: &[Identity], profile: ScanProfile) -> Result<Observation> {
        self.0.record_probe(profile);
        let scripted = self.0.script.lock().expect("script").pop_front();
        match scripted {
            Some(Some(aliases)) => Ok(Observation::new(aliases.into_iter().map(str::to_string))),
            Some(None) => Err(LamplighterError::ScanUnavailable(
                "scanner exited with status 1".to_string(),
            )),
            None => Ok(Observation::new(
                self.0.present.lock().expect("present").iter().cloned(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired {
    Home { quiet: bool, changed: Vec<String> },
    Away { quiet: bool, changed: Vec<String> },
    IdentityHome(String),
    IdentityAway(String),
}

pub fn recording_callbacks() -> (Callbacks, Arc<Mutex<Vec<Fired>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (home, away, identity_home, identity_away) =
        (log.clone(), log.clone(), log.clone(), log.clone());
    let callbacks = Callbacks::new()
        .on_home(move |quiet, changed| {
            home.lock().expect("log").push(Fired::Home {
                quiet,
                changed: changed.iter().cloned().collect(),
            });
            Ok(())
        })
        .on_away(move |quiet, changed| {
            away.lock().expect("log").push(Fired::Away {
                quiet,
                changed: changed.iter().cloned().collect(),
            });
            Ok(())
        })
        .on_identity_home(move |_, identity| {
            identity_home
                .lock()
                .expect("log")
                .push(Fired::IdentityHome(identity.alias.clone()));
            Ok(())
        })
        .on_identity_away(move |_, identity| {
            identity_away
                .lock()
                .expect("log")
                .push(Fired::IdentityAway(identity.alias.clone()));
            Ok(())
        });
    (callbacks, log)
}

pub fn config_toml(aliases: &[&str], general: &str) -> String {
    let mut content = format!(
        "[lamplighter]\n{}\n\n[scanner]\nfast_command = [\"true\"]\ntier_gap_secs = 1\n",
        general
    );
    for alias in aliases {
        content.push_str(&format!(
            "\n[[identity]]\nalias = \"{alias}\"\nname = \"{alias}\"\nmatch_rule = \"{alias}-phone\"\n"
        ));
    }
    content
}

pub fn config(aliases: &[&str], general: &str) -> Config {
    Config::from_toml_str(&config_toml(aliases, general), Path::new("test.toml")).expect("config")
}

pub struct Harness {
    pub dir: TempDir,
    pub network: Arc<FakeNetwork>,
    pub clock: Arc<ManualClock>,
    pub signals: ControlSignals,
    pub fired: Arc<Mutex<Vec<Fired>>>,
    pub engine: PresenceEngine,
}

impl Harness {
    pub fn new(config: &Config) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(dir.path().join("lamplighter.db")).expect("store");
        Self::with_store(config, dir, store)
    }

    pub fn with_store(config: &Config, dir: TempDir, store: Store) -> Self {
        let network = Arc::new(FakeNetwork::default());
        // Midday UTC; quiet-hours assertions compare against the clock itself.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().expect("timestamp"),
        ));
        let signals = ControlSignals::new();
        let (callbacks, fired) = recording_callbacks();
        let engine = PresenceEngine::new(
            config,
            scanner(&network, &clock),
            store,
            callbacks,
            clock.clone(),
            signals.clone(),
        );
        Self {
            dir,
            network,
            clock,
            signals,
            fired,
            engine,
        }
    }

    pub fn fired(&self) -> Vec<Fired> {
        std::mem::take(&mut *self.fired.lock().expect("fired"))
    }

    pub fn state(&self, alias: &str) -> Option<lamplighter_core::Presence> {
        self.engine
            .store()
            .get(alias)
            .expect("store read")
            .map(|record| record.state)
    }
}

pub fn scanner(network: &Arc<FakeNetwork>, clock: &Arc<ManualClock>) -> Scanner {
    Scanner::new(
        Box::new(FakeSource(Arc::clone(network))),
        RetryPolicy::immediate(3),
        Duration::from_secs(1),
        clock.clone(),
    )
}

pub fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

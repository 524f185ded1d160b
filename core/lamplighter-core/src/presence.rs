//! Presence data model: identities, per-identity state and the derived
//! aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Alias used for the single record kept in combined tracking mode.
pub const HOUSEHOLD_ALIAS: &str = "household";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Home,
    Away,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Home => "home",
            Presence::Away => "away",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "home" => Some(Presence::Home),
            "away" => Some(Presence::Away),
            _ => None,
        }
    }

    pub fn from_observed(present: bool) -> Self {
        if present {
            Presence::Home
        } else {
            Presence::Away
        }
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked person or device, as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub alias: String,
    #[serde(alias = "display_name")]
    pub name: String,
    /// Device fingerprint (scan mode) or client-identifier fragment
    /// (heartbeat mode).
    #[serde(alias = "user_agent_match")]
    pub match_rule: String,
    #[serde(default)]
    pub notification_target: Option<String>,
}

impl Identity {
    /// Case-insensitive substring match against scanner output or a
    /// heartbeat client string.
    pub fn matches(&self, haystack_lower: &str) -> bool {
        let needle = self.match_rule.trim().to_lowercase();
        !needle.is_empty() && haystack_lower.contains(&needle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub alias: String,
    pub state: Presence,
    pub updated_at: DateTime<Utc>,
}

/// `Home` if anyone is home, `Away` if everyone is away. `None` until at
/// least one record exists.
pub fn aggregate(records: &[PresenceRecord]) -> Option<Presence> {
    aggregate_states(records.iter().map(|record| record.state))
}

pub fn aggregate_states(states: impl IntoIterator<Item = Presence>) -> Option<Presence> {
    states.into_iter().fold(None, |derived, state| match (derived, state) {
        (Some(Presence::Home), _) | (_, Presence::Home) => Some(Presence::Home),
        _ => Some(Presence::Away),
    })
}

/// Aliases seen by one scan. Transient; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    present: BTreeSet<String>,
}

impl Observation {
    pub fn new(present: impl IntoIterator<Item = String>) -> Self {
        Self {
            present: present.into_iter().collect(),
        }
    }

    pub fn is_present(&self, alias: &str) -> bool {
        self.present.contains(alias)
    }

    pub fn count(&self) -> usize {
        self.present.len()
    }

    pub fn present(&self) -> &BTreeSet<String> {
        &self.present
    }

    /// Folds in a second, higher-confidence reading. Detections are
    /// trusted, so the result is the union.
    pub fn merge(&mut self, other: Observation) {
        self.present.extend(other.present);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(alias: &str, state: Presence) -> PresenceRecord {
        PresenceRecord {
            alias: alias.to_string(),
            state,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn aggregate_is_away_only_when_everyone_is_away() {
        assert_eq!(aggregate(&[]), None);
        assert_eq!(
            aggregate(&[record("a", Presence::Away), record("b", Presence::Away)]),
            Some(Presence::Away)
        );
        assert_eq!(
            aggregate(&[record("a", Presence::Away), record("b", Presence::Home)]),
            Some(Presence::Home)
        );
        assert_eq!(
            aggregate(&[record("a", Presence::Home)]),
            Some(Presence::Home)
        );
    }

    #[test]
    fn presence_round_trips_through_storage_strings() {
        assert_eq!(Presence::from_str("home"), Some(Presence::Home));
        assert_eq!(Presence::from_str("away"), Some(Presence::Away));
        assert_eq!(Presence::from_str("unknown"), None);
        assert_eq!(Presence::Home.as_str(), "home");
    }

    #[test]
    fn identity_matching_ignores_case_and_blank_rules() {
        let mut identity = Identity {
            alias: "aaron".to_string(),
            name: "Aaron".to_string(),
            match_rule: "AA:BB:CC:DD:EE:FF".to_string(),
            notification_target: None,
        };
        assert!(identity.matches("host up (aa:bb:cc:dd:ee:ff)"));
        assert!(!identity.matches("host up (11:22:33:44:55:66)"));

        identity.match_rule = "  ".to_string();
        assert!(!identity.matches("anything"));
    }

    #[test]
    fn merge_unions_detections() {
        let mut first = Observation::new(["a".to_string()]);
        first.merge(Observation::new(["b".to_string()]));
        assert_eq!(first.count(), 2);
        assert!(first.is_present("a"));
        assert!(first.is_present("b"));
    }
}

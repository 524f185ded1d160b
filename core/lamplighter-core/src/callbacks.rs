//! Named callback slots invoked by the engine on confirmed transitions.
//!
//! Every slot is optional. A slot that returns an error or panics is
//! reported as [`LamplighterError::Callback`]; the engine logs it and keeps
//! going.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{LamplighterError, Result};
use crate::presence::{Identity, Presence};

pub type AggregateHook = Box<dyn FnMut(bool, &BTreeSet<String>) -> std::result::Result<(), String> + Send>;
pub type IdentityHook = Box<dyn FnMut(bool, &Identity) -> std::result::Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    /// Aggregate went from everyone away to someone home.
    Home,
    /// Aggregate went from someone home to everyone away.
    Away,
    IdentityHome,
    IdentityAway,
}

impl CallbackSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackSlot::Home => "on_home",
            CallbackSlot::Away => "on_away",
            CallbackSlot::IdentityHome => "on_identity_home",
            CallbackSlot::IdentityAway => "on_identity_away",
        }
    }

    pub fn aggregate(state: Presence) -> Self {
        match state {
            Presence::Home => CallbackSlot::Home,
            Presence::Away => CallbackSlot::Away,
        }
    }

    pub fn identity(state: Presence) -> Self {
        match state {
            Presence::Home => CallbackSlot::IdentityHome,
            Presence::Away => CallbackSlot::IdentityAway,
        }
    }
}

#[derive(Default)]
pub struct Callbacks {
    on_home: Option<AggregateHook>,
    on_away: Option<AggregateHook>,
    on_identity_home: Option<IdentityHook>,
    on_identity_away: Option<IdentityHook>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_home", &self.on_home.is_some())
            .field("on_away", &self.on_away.is_some())
            .field("on_identity_home", &self.on_identity_home.is_some())
            .field("on_identity_away", &self.on_identity_away.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_home(
        mut self,
        hook: impl FnMut(bool, &BTreeSet<String>) -> std::result::Result<(), String> + Send + 'static,
    ) -> Self {
        self.on_home = Some(Box::new(hook));
        self
    }

    pub fn on_away(
        mut self,
        hook: impl FnMut(bool, &BTreeSet<String>) -> std::result::Result<(), String> + Send + 'static,
    ) -> Self {
        self.on_away = Some(Box::new(hook));
        self
    }

    pub fn on_identity_home(
        mut self,
        hook: impl FnMut(bool, &Identity) -> std::result::Result<(), String> + Send + 'static,
    ) -> Self {
        self.on_identity_home = Some(Box::new(hook));
        self
    }

    pub fn on_identity_away(
        mut self,
        hook: impl FnMut(bool, &Identity) -> std::result::Result<(), String> + Send + 'static,
    ) -> Self {
        self.on_identity_away = Some(Box::new(hook));
        self
    }

    pub fn is_bound(&self, slot: CallbackSlot) -> bool {
        match slot {
            CallbackSlot::Home => self.on_home.is_some(),
            CallbackSlot::Away => self.on_away.is_some(),
            CallbackSlot::IdentityHome => self.on_identity_home.is_some(),
            CallbackSlot::IdentityAway => self.on_identity_away.is_some(),
        }
    }

    /// Fires `on_home`/`on_away`. `Ok(false)` when the slot is unbound.
    pub fn fire_aggregate(
        &mut self,
        state: Presence,
        quiet: bool,
        changed: &BTreeSet<String>,
    ) -> Result<bool> {
        let slot = CallbackSlot::aggregate(state);
        let hook = match state {
            Presence::Home => self.on_home.as_mut(),
            Presence::Away => self.on_away.as_mut(),
        };
        match hook {
            Some(hook) => guarded(slot, || hook(quiet, changed)).map(|_| true),
            None => Ok(false),
        }
    }

    /// Fires the single-identity slot for `state`. `Ok(false)` when unbound.
    pub fn fire_identity(&mut self, state: Presence, quiet: bool, identity: &Identity) -> Result<bool> {
        let slot = CallbackSlot::identity(state);
        let hook = match state {
            Presence::Home => self.on_identity_home.as_mut(),
            Presence::Away => self.on_identity_away.as_mut(),
        };
        match hook {
            Some(hook) => guarded(slot, || hook(quiet, identity)).map(|_| true),
            None => Ok(false),
        }
    }
}

fn guarded(
    slot: CallbackSlot,
    call: impl FnOnce() -> std::result::Result<(), String>,
) -> Result<()> {
    let failure = |details: String| LamplighterError::Callback {
        slot: slot.as_str().to_string(),
        details,
    };
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(details)) => Err(failure(details)),
        Err(payload) => Err(failure(format!("panicked: {}", panic_message(&payload)))),
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn identity() -> Identity {
        Identity {
            alias: "aaron".to_string(),
            name: "Aaron".to_string(),
            match_rule: "aa:bb".to_string(),
            notification_target: Some("+15555550100".to_string()),
        }
    }

    #[test]
    fn unbound_slots_are_skipped() {
        let mut callbacks = Callbacks::new();
        assert!(!callbacks.is_bound(CallbackSlot::Home));
        assert!(!callbacks
            .fire_aggregate(Presence::Home, false, &BTreeSet::new())
            .expect("no error"));
        assert!(!callbacks
            .fire_identity(Presence::Away, false, &identity())
            .expect("no error"));
    }

    #[test]
    fn aggregate_slots_receive_quiet_flag_and_changed_set() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let mut callbacks = Callbacks::new().on_away(move |quiet, changed| {
            sink.lock()
                .expect("calls")
                .push((quiet, changed.iter().cloned().collect::<Vec<_>>()));
            Ok(())
        });

        let changed = BTreeSet::from(["aaron".to_string()]);
        assert!(callbacks
            .fire_aggregate(Presence::Away, true, &changed)
            .expect("fires"));
        assert!(!callbacks
            .fire_aggregate(Presence::Home, true, &changed)
            .expect("unbound"));
        assert_eq!(
            *calls.lock().expect("calls"),
            vec![(true, vec!["aaron".to_string()])]
        );
    }

    #[test]
    fn errors_and_panics_become_callback_errors() {
        let mut callbacks = Callbacks::new()
            .on_identity_home(|_, _| Err("lights offline".to_string()))
            .on_identity_away(|_, _| panic!("hook blew up"));

        let err = callbacks
            .fire_identity(Presence::Home, false, &identity())
            .expect_err("error");
        match err {
            LamplighterError::Callback { slot, details } => {
                assert_eq!(slot, "on_identity_home");
                assert_eq!(details, "lights offline");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = callbacks
            .fire_identity(Presence::Away, false, &identity())
            .expect_err("panic");
        assert!(err.to_string().contains("hook blew up"));

        // Still usable after a panic.
        assert!(callbacks.is_bound(CallbackSlot::IdentityAway));
    }
}

//! Callback slots bound to external commands from `[hooks]`.
//!
//! Each hook runs with a timeout and learns about the event through
//! `LAMPLIGHTER_*` environment variables. Notification credentials from
//! `[notifications]` are exported as `LAMPLIGHTER_NOTIFY_<KEY>`.

use lamplighter_core::{run_with_timeout, Callbacks, Config, Identity};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone)]
struct HookCommand {
    event: &'static str,
    argv: Vec<String>,
    base_env: Vec<(String, String)>,
    timeout: Duration,
}

impl HookCommand {
    fn run(&self, mut env: Vec<(String, String)>) -> Result<(), String> {
        env.extend(self.base_env.iter().cloned());
        env.push(("LAMPLIGHTER_EVENT".to_string(), self.event.to_string()));
        tracing::debug!(event = self.event, command = ?self.argv, "Running hook");
        run_with_timeout(&self.argv, &env, self.timeout)
            .map(|_| ())
            .map_err(|err| format!("{} hook {}", self.event, err))
    }
}

pub fn callbacks(config: &Config) -> Callbacks {
    let base_env = notification_env(config);
    let timeout = Duration::from_secs(config.hooks.timeout_secs);
    let command = |event: &'static str, argv: &[String]| -> Option<HookCommand> {
        (!argv.is_empty()).then(|| HookCommand {
            event,
            argv: argv.to_vec(),
            base_env: base_env.clone(),
            timeout,
        })
    };

    let mut callbacks = Callbacks::new();
    if let Some(hook) = command("home", &config.hooks.on_home) {
        callbacks = callbacks.on_home(move |quiet, changed| hook.run(aggregate_env(quiet, changed)));
    }
    if let Some(hook) = command("away", &config.hooks.on_away) {
        callbacks = callbacks.on_away(move |quiet, changed| hook.run(aggregate_env(quiet, changed)));
    }
    if let Some(hook) = command("identity_home", &config.hooks.on_identity_home) {
        callbacks = callbacks
            .on_identity_home(move |quiet, identity| hook.run(identity_env(quiet, identity)));
    }
    if let Some(hook) = command("identity_away", &config.hooks.on_identity_away) {
        callbacks = callbacks
            .on_identity_away(move |quiet, identity| hook.run(identity_env(quiet, identity)));
    }
    callbacks
}

fn notification_env(config: &Config) -> Vec<(String, String)> {
    config
        .notifications
        .iter()
        .map(|(key, value)| {
            let key: String = key
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            (format!("LAMPLIGHTER_NOTIFY_{}", key), value.clone())
        })
        .collect()
}

fn quiet_flag(quiet: bool) -> String {
    if quiet { "1" } else { "0" }.to_string()
}

fn aggregate_env(quiet: bool, changed: &BTreeSet<String>) -> Vec<(String, String)> {
    vec![
        ("LAMPLIGHTER_QUIET".to_string(), quiet_flag(quiet)),
        (
            "LAMPLIGHTER_CHANGED".to_string(),
            changed.iter().cloned().collect::<Vec<_>>().join(","),
        ),
    ]
}

fn identity_env(quiet: bool, identity: &Identity) -> Vec<(String, String)> {
    vec![
        ("LAMPLIGHTER_QUIET".to_string(), quiet_flag(quiet)),
        ("LAMPLIGHTER_CHANGED".to_string(), identity.alias.clone()),
        ("LAMPLIGHTER_ALIAS".to_string(), identity.alias.clone()),
        ("LAMPLIGHTER_NAME".to_string(), identity.name.clone()),
        (
            "LAMPLIGHTER_NOTIFY_TARGET".to_string(),
            identity.notification_target.clone().unwrap_or_default(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamplighter_core::{CallbackSlot, Presence};
    use std::path::Path;

    fn config(extra: &str) -> Config {
        let content = format!(
            r#"
[scanner]
fast_command = ["true"]

[notifications]
twilio_sid = "AC123"
"webhook-url" = "https://example.invalid/hook"

[[identity]]
alias = "aaron"
name = "Aaron"
match_rule = "aa:bb:cc"
notification_target = "+15555550100"

{}
"#,
            extra
        );
        Config::from_toml_str(&content, Path::new("test.toml")).expect("config")
    }

    #[test]
    fn notification_keys_are_uppercased_and_sanitized() {
        let env = notification_env(&config(""));
        assert!(env.contains(&("LAMPLIGHTER_NOTIFY_TWILIO_SID".to_string(), "AC123".to_string())));
        assert!(env.contains(&(
            "LAMPLIGHTER_NOTIFY_WEBHOOK_URL".to_string(),
            "https://example.invalid/hook".to_string()
        )));
    }

    #[test]
    fn only_configured_hooks_are_bound() {
        let callbacks = callbacks(&config("[hooks]\non_away = [\"true\"]\n"));
        assert!(callbacks.is_bound(CallbackSlot::Away));
        assert!(!callbacks.is_bound(CallbackSlot::Home));
        assert!(!callbacks.is_bound(CallbackSlot::IdentityHome));
    }

    #[cfg(unix)]
    #[test]
    fn hooks_receive_event_environment() {
        let dir = tempfile::tempdir().expect("temp dir");
        let out = dir.path().join("hook.out");
        let script = format!(
            "echo \"$LAMPLIGHTER_EVENT|$LAMPLIGHTER_QUIET|$LAMPLIGHTER_ALIAS|$LAMPLIGHTER_NAME|$LAMPLIGHTER_NOTIFY_TARGET|$LAMPLIGHTER_NOTIFY_TWILIO_SID\" > '{}'",
            out.display()
        );
        let extra = format!(
            "[hooks]\non_identity_home = [\"sh\", \"-c\", {:?}]\n",
            script
        );
        let config = config(&extra);
        let mut callbacks = callbacks(&config);

        let fired = callbacks
            .fire_identity(Presence::Home, true, &config.identities[0])
            .expect("hook runs");
        assert!(fired);
        let written = std::fs::read_to_string(&out).expect("hook output");
        assert_eq!(
            written.trim(),
            "identity_home|1|aaron|Aaron|+15555550100|AC123"
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_hooks_surface_as_errors() {
        let config = config("[hooks]\non_home = [\"sh\", \"-c\", \"exit 7\"]\n");
        let mut callbacks = callbacks(&config);
        let err = callbacks
            .fire_aggregate(Presence::Home, false, &BTreeSet::from(["aaron".to_string()]))
            .expect_err("non-zero exit");
        assert!(err.to_string().contains("status 7"));
    }
}

//! Runtime configuration.
//!
//! Loaded from TOML (`~/.lamplighter/config.toml` by default). Every field
//! has a serde default so a minimal file only needs its identities and a
//! scan command. The whole value is replaced on reload; readers hold an
//! `Arc` snapshot for the duration of one cycle or request.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::debounce::DebounceSettings;
use crate::error::{LamplighterError, Result};
use crate::presence::{Identity, HOUSEHOLD_ALIAS};
use crate::quiet_hours::QuietHoursWindow;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".lamplighter/config.toml";
const DEFAULT_STATE_DB_RELATIVE_PATH: &str = ".lamplighter/lamplighter.db";
const DEFAULT_PIDFILE_RELATIVE_PATH: &str = ".lamplighter/lamplighter.pid";
const DEFAULT_SOCKET_RELATIVE_PATH: &str = ".lamplighter/heartbeat.sock";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Shell out to a network scanner and look for device fingerprints.
    #[default]
    Scan,
    /// Treat recent heartbeats as presence.
    Heartbeat,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    PerIdentity,
    /// One household-wide record; present iff anything was detected.
    Combined,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_frequency_secs")]
    pub report_frequency_secs: u64,
    #[serde(default = "default_idle_report_cycles")]
    pub idle_report_cycles: u32,
    #[serde(default)]
    pub quiet_hours_start: u32,
    #[serde(default)]
    pub quiet_hours_end: u32,
    #[serde(default)]
    pub mode: DetectionMode,
    #[serde(default)]
    pub tracking: TrackingMode,
    #[serde(default)]
    pub state_db: Option<PathBuf>,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            poll_interval_secs: default_poll_interval_secs(),
            report_frequency_secs: default_report_frequency_secs(),
            idle_report_cycles: default_idle_report_cycles(),
            quiet_hours_start: 0,
            quiet_hours_end: 0,
            mode: DetectionMode::default(),
            tracking: TrackingMode::default(),
            state_db: None,
            pidfile: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub fast_command: Vec<String>,
    #[serde(default)]
    pub thorough_command: Vec<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_tier_gap_secs")]
    pub tier_gap_secs: u64,
    #[serde(default = "default_scan_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fast_command: Vec::new(),
            thorough_command: Vec::new(),
            timeout_secs: default_scan_timeout_secs(),
            tier_gap_secs: default_tier_gap_secs(),
            retry_attempts: default_scan_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Listen even when detection runs in scan mode.
    #[serde(default)]
    pub always_listen: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            socket: None,
            always_listen: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_debounce_attempts")]
    pub attempts: u32,
    #[serde(default = "default_debounce_spacing_secs")]
    pub spacing_secs: u64,
    #[serde(default = "default_debounce_settle_delay_secs")]
    pub settle_delay_secs: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            attempts: default_debounce_attempts(),
            spacing_secs: default_debounce_spacing_secs(),
            settle_delay_secs: default_debounce_settle_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_home: Vec<String>,
    #[serde(default)]
    pub on_away: Vec<String>,
    #[serde(default)]
    pub on_identity_home: Vec<String>,
    #[serde(default)]
    pub on_identity_away: Vec<String>,
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            on_home: Vec::new(),
            on_away: Vec::new(),
            on_identity_home: Vec::new(),
            on_identity_away: Vec::new(),
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default, rename = "lamplighter")]
    pub general: GeneralConfig,
    /// Opaque credentials handed to notification hooks.
    #[serde(default)]
    pub notifications: BTreeMap<String, String>,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default, rename = "identity")]
    pub identities: Vec<Identity>,
}

impl Config {
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self> {
        let mut config = toml::from_str::<Config>(content).map_err(|err| {
            LamplighterError::ConfigInvalid {
                path: origin.to_path_buf(),
                details: err.to_string(),
            }
        })?;
        // Aliases key stored state and hook environments.
        for identity in &mut config.identities {
            identity.alias = identity.alias.trim().to_string();
        }
        config.validate(origin)?;
        Ok(config)
    }

    pub fn validate(&self, origin: &Path) -> Result<()> {
        let invalid = |details: String| LamplighterError::ConfigInvalid {
            path: origin.to_path_buf(),
            details,
        };

        if self.identities.is_empty() {
            return Err(invalid("at least one [[identity]] is required".to_string()));
        }

        let mut seen = HashSet::new();
        for identity in &self.identities {
            let alias = identity.alias.as_str();
            if alias.trim().is_empty() {
                return Err(invalid("identity alias must not be empty".to_string()));
            }
            if alias.trim() != alias {
                return Err(invalid(format!(
                    "identity alias '{}' has surrounding whitespace",
                    alias
                )));
            }
            if alias == HOUSEHOLD_ALIAS {
                return Err(invalid(format!("alias '{}' is reserved", HOUSEHOLD_ALIAS)));
            }
            if !seen.insert(alias.to_string()) {
                return Err(invalid(format!("duplicate identity alias '{}'", alias)));
            }
            if identity.match_rule.trim().is_empty() {
                return Err(invalid(format!("identity '{}' has an empty match_rule", alias)));
            }
        }

        let general = &self.general;
        if general.quiet_hours_start > 23 || general.quiet_hours_end > 23 {
            return Err(invalid("quiet hours must be within 0..=23".to_string()));
        }
        if general.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs must be positive".to_string()));
        }
        if self.debounce.attempts == 0 {
            return Err(invalid("debounce attempts must be positive".to_string()));
        }
        if general.mode == DetectionMode::Scan && self.scanner.fast_command.is_empty() {
            return Err(invalid("scan mode requires scanner.fast_command".to_string()));
        }
        if general.mode == DetectionMode::Heartbeat && self.heartbeat.staleness_secs == 0 {
            return Err(invalid("heartbeat.staleness_secs must be positive".to_string()));
        }

        Ok(())
    }

    pub fn quiet_hours(&self) -> QuietHoursWindow {
        QuietHoursWindow::new(self.general.quiet_hours_start, self.general.quiet_hours_end)
    }

    pub fn debounce_settings(&self) -> DebounceSettings {
        DebounceSettings {
            attempts: self.debounce.attempts,
            spacing: Duration::from_secs(self.debounce.spacing_secs),
            settle_delay: Duration::from_secs(self.debounce.settle_delay_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.general.poll_interval_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.heartbeat.staleness_secs)
    }

    pub fn identity(&self, alias: &str) -> Option<&Identity> {
        self.identities.iter().find(|identity| identity.alias == alias)
    }

    /// Identity whose match rule appears in a heartbeat client string.
    pub fn identity_for_client(&self, client: &str) -> Option<&Identity> {
        let haystack = client.to_lowercase();
        self.identities
            .iter()
            .find(|identity| identity.matches(&haystack))
    }

    /// Aliases that get a stored record under the current tracking mode.
    pub fn tracked_aliases(&self) -> Vec<String> {
        tracked_aliases(&self.identities, self.general.tracking)
    }

    /// Whether the daemon should run the heartbeat receiver socket.
    pub fn receiver_enabled(&self) -> bool {
        self.general.mode == DetectionMode::Heartbeat || self.heartbeat.always_listen
    }

    pub fn state_db_path(&self) -> Result<PathBuf> {
        resolve_path(self.general.state_db.as_ref(), DEFAULT_STATE_DB_RELATIVE_PATH)
    }

    pub fn pidfile_path(&self) -> Result<PathBuf> {
        resolve_path(self.general.pidfile.as_ref(), DEFAULT_PIDFILE_RELATIVE_PATH)
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        resolve_path(self.heartbeat.socket.as_ref(), DEFAULT_SOCKET_RELATIVE_PATH)
    }
}

/// One record per identity, or the single household record in combined
/// mode.
pub fn tracked_aliases(identities: &[Identity], tracking: TrackingMode) -> Vec<String> {
    match tracking {
        TrackingMode::PerIdentity => identities
            .iter()
            .map(|identity| identity.alias.clone())
            .collect(),
        TrackingMode::Combined => vec![HOUSEHOLD_ALIAS.to_string()],
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    home_relative(DEFAULT_CONFIG_RELATIVE_PATH)
}

pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let content = match fs_err::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(LamplighterError::ConfigMissing(path));
        }
        Err(err) => {
            return Err(LamplighterError::Io {
                context: "read configuration".to_string(),
                source: err,
            })
        }
    };
    Config::from_toml_str(&content, &path)
}

fn resolve_path(configured: Option<&PathBuf>, default_relative: &str) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.clone()),
        None => home_relative(default_relative),
    }
}

fn home_relative(relative: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| LamplighterError::ConfigInvalid {
        path: PathBuf::from(relative),
        details: "Home directory not found".to_string(),
    })?;
    Ok(home.join(relative))
}

/// Process-wide configuration, swapped wholesale on reload.
#[derive(Debug)]
pub struct ConfigCell {
    current: RwLock<Arc<Config>>,
}

impl ConfigCell {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, config: Config) {
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
    }
}

fn default_log_level() -> String {
    "brief".to_string()
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_report_frequency_secs() -> u64 {
    3600
}

fn default_idle_report_cycles() -> u32 {
    60
}

fn default_scan_timeout_secs() -> u64 {
    30
}

fn default_tier_gap_secs() -> u64 {
    1
}

fn default_scan_retry_attempts() -> u32 {
    3
}

fn default_staleness_secs() -> u64 {
    2700
}

fn default_debounce_attempts() -> u32 {
    3
}

fn default_debounce_spacing_secs() -> u64 {
    5
}

fn default_debounce_settle_delay_secs() -> u64 {
    10
}

fn default_hook_timeout_secs() -> u64 {
    30
}

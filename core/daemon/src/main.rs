//! Lamplighter daemon entrypoint.
//!
//! Loads configuration, opens the state store, optionally starts the
//! heartbeat receiver socket and then drives the presence engine until
//! SIGTERM/SIGINT. SIGHUP reloads configuration in place.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use lamplighter_core::{
    load_config, Clock, CommandSource, Config, ConfigCell, ControlSignals, DetectionMode,
    HeartbeatSource, PidFile, PresenceEngine, PresenceSource, RetryPolicy, Runner, Scanner, Store,
    SystemClock,
};

mod hooks;
mod logging;
mod server;
mod signals;

const SCAN_RETRY_STEP_MS: u64 = 500;
const SCAN_RETRY_MAX_SECS: u64 = 5;

#[derive(Debug, Parser)]
#[command(name = "lamplighter", version, about = "Presence detection daemon")]
struct Cli {
    /// Configuration file (default: ~/.lamplighter/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run a single presence cycle and exit
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Before the log writer thread exists, so no thread can take a signal.
    let blocked = (!cli.once).then(signals::block);

    let config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            let _log = logging::init("brief", None);
            error!(error = %err, "Failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let log = logging::init(&config.general.log_level, config.general.log_file.as_deref());

    match run(cli, config, log, blocked) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Lamplighter stopped");
            ExitCode::from(1)
        }
    }
}

fn run(
    cli: Cli,
    config: Config,
    log: logging::LogControl,
    blocked: Option<Result<signals::BlockedSignals, String>>,
) -> Result<(), String> {
    let signals = ControlSignals::new();
    if let Some(blocked) = blocked {
        blocked?.listen(signals.clone())?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Store::open(config.state_db_path()?)?;
    let config = Arc::new(ConfigCell::new(config));
    let snapshot = config.snapshot();

    let engine = PresenceEngine::new(
        &snapshot,
        build_scanner(&snapshot, &store, &clock),
        store.clone(),
        hooks::callbacks(&snapshot),
        Arc::clone(&clock),
        signals.clone(),
    );

    let loader_path = cli.config.clone();
    let loader = Box::new(move || load_config(loader_path.clone()));

    let reload_store = store.clone();
    let reload_clock = Arc::clone(&clock);
    let mut runner = Runner::new(engine, Arc::clone(&config), loader, signals, Arc::clone(&clock))
        .with_reload_hook(move |config, engine| {
            log.apply_level(&config.general.log_level);
            engine.replace_scanner(build_scanner(config, &reload_store, &reload_clock));
            engine.replace_callbacks(hooks::callbacks(config));
        });

    if cli.once {
        let report = runner.run_once()?;
        info!(
            aggregate = ?report.aggregate_after,
            arrived = ?report.arrived,
            departed = ?report.departed,
            "Single cycle complete"
        );
        return Ok(());
    }

    let pidfile = PidFile::acquire(snapshot.pidfile_path()?)?;

    let receiver = if snapshot.receiver_enabled() {
        let state = server::ReceiverState {
            config: Arc::clone(&config),
            store: store.clone(),
        };
        Some(server::start(&snapshot.socket_path()?, state)?)
    } else {
        None
    };

    info!(
        mode = ?snapshot.general.mode,
        tracking = ?snapshot.general.tracking,
        identities = snapshot.identities.len(),
        pid = std::process::id(),
        "Lamplighter started"
    );
    drop(snapshot);

    let stats = runner.run();

    drop(receiver);
    if let Err(err) = pidfile.release() {
        warn!(error = %err, "Failed to remove pidfile");
    }
    info!(cycles = stats.cycles, "Lamplighter stopped cleanly");
    Ok(())
}

fn build_scanner(config: &Config, store: &Store, clock: &Arc<dyn Clock>) -> Scanner {
    let source: Box<dyn PresenceSource> = match config.general.mode {
        DetectionMode::Scan => Box::new(CommandSource::new(
            config.scanner.fast_command.clone(),
            config.scanner.thorough_command.clone(),
            Duration::from_secs(config.scanner.timeout_secs),
        )),
        DetectionMode::Heartbeat => Box::new(HeartbeatSource::new(
            store.clone(),
            config.staleness(),
            Arc::clone(clock),
        )),
    };
    let retry = RetryPolicy::new(
        config.scanner.retry_attempts,
        Duration::from_millis(SCAN_RETRY_STEP_MS),
        Duration::from_secs(SCAN_RETRY_MAX_SECS),
    );
    Scanner::new(
        source,
        retry,
        Duration::from_secs(config.scanner.tier_gap_secs),
        Arc::clone(clock),
    )
}

//! Bounded external process execution.
//!
//! Scanner tools and hook commands both run through here. A process that
//! outlives its timeout is killed and reported as a failure.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    EmptyCommand,
    Spawn(String),
    Exit { code: Option<i32>, stderr: String },
    TimedOut(Duration),
    Wait(String),
    Read(String),
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::EmptyCommand => write!(f, "no command configured"),
            CommandFailure::Spawn(err) => write!(f, "failed to spawn: {}", err),
            CommandFailure::Exit { code, stderr } => match code {
                Some(code) => write!(f, "exited with status {}: {}", code, stderr.trim()),
                None => write!(f, "terminated by signal: {}", stderr.trim()),
            },
            CommandFailure::TimedOut(timeout) => {
                write!(f, "timed out after {}s", timeout.as_secs_f64())
            }
            CommandFailure::Wait(err) => write!(f, "failed to wait for process: {}", err),
            CommandFailure::Read(err) => write!(f, "failed to read output: {}", err),
        }
    }
}

/// Runs `argv` with extra environment variables, returning stdout on a zero
/// exit status.
pub fn run_with_timeout(
    argv: &[String],
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<String, CommandFailure> {
    let (program, args) = argv.split_first().ok_or(CommandFailure::EmptyCommand)?;

    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| CommandFailure::Spawn(format!("{}: {}", program, err)))?;

    // Drain pipes on their own threads so a chatty tool cannot block on a
    // full pipe while we poll for exit.
    let stdout_reader = child.stdout.take().map(|stdout| thread::spawn(move || drain(stdout)));
    let stderr_reader = child.stderr.take().map(|stderr| thread::spawn(move || drain(stderr)));

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandFailure::TimedOut(timeout));
                }
                thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            Err(err) => {
                let _ = child.kill();
                return Err(CommandFailure::Wait(err.to_string()));
            }
        }
    };

    let stdout = collect("stdout", stdout_reader)?;
    let stderr = collect("stderr", stderr_reader).unwrap_or_else(|err| err.to_string());

    if status.success() {
        Ok(stdout)
    } else {
        Err(CommandFailure::Exit {
            code: status.code(),
            stderr,
        })
    }
}

fn drain(mut pipe: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Output of one pipe. Bytes that are not UTF-8 are replaced rather than
/// discarded; a read that fails is a command failure, never empty output.
fn collect(
    name: &str,
    reader: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<String, CommandFailure> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    match reader.join() {
        Ok(Ok(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(Err(err)) => Err(CommandFailure::Read(format!("{}: {}", name, err))),
        Err(_) => Err(CommandFailure::Read(format!("{} reader panicked", name))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn captures_stdout_on_success() {
        let output = run_with_timeout(
            &argv(&["sh", "-c", "echo \"$GREETING\""]),
            &[("GREETING".to_string(), "hello".to_string())],
            Duration::from_secs(5),
        )
        .expect("command runs");
        assert_eq!(output.trim(), "hello");
    }

    #[test]
    fn keeps_output_that_is_not_utf8() {
        let output = run_with_timeout(
            &argv(&["sh", "-c", "printf 'host aaron-phone \\377\\n'"]),
            &[],
            Duration::from_secs(5),
        )
        .expect("command runs");
        assert!(output.contains("aaron-phone"));
        assert!(output.contains('\u{FFFD}'));
    }

    #[test]
    fn reports_non_zero_exit() {
        let err = run_with_timeout(
            &argv(&["sh", "-c", "echo oops >&2; exit 3"]),
            &[],
            Duration::from_secs(5),
        )
        .expect_err("non-zero exit");
        match err {
            CommandFailure::Exit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn kills_processes_that_exceed_timeout() {
        let started = Instant::now();
        let err = run_with_timeout(
            &argv(&["sleep", "5"]),
            &[],
            Duration::from_millis(100),
        )
        .expect_err("timeout");
        assert!(matches!(err, CommandFailure::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert_eq!(
            run_with_timeout(&[], &[], Duration::from_secs(1)),
            Err(CommandFailure::EmptyCommand)
        );
    }
}

//! Heartbeat receiver: newline-delimited JSON over a Unix socket.
//!
//! One request per connection. Phones (or a web front end forwarding for
//! them) send `heartbeat` with their client string; the matching identity's
//! `last_seen` is set to now.

use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use chrono::Utc;
use lamplighter_core::{aggregate, Config, ConfigCell, DetectionMode, Store};
use lamplighter_protocol::{
    parse_heartbeat, ErrorInfo, HealthData, HeartbeatAck, Method, PresenceData, PresenceEntry,
    Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Clone)]
pub struct ReceiverState {
    pub config: Arc<ConfigCell>,
    pub store: Store,
}

/// Removes the socket file when dropped.
pub struct Receiver {
    path: PathBuf,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Err(err) = remove_existing_socket(&self.path) {
            warn!(error = %err, path = %self.path.display(), "Failed to remove socket");
        }
    }
}

pub fn start(socket_path: &Path, state: ReceiverState) -> Result<Receiver, String> {
    prepare_socket_dir(socket_path)?;
    remove_existing_socket(socket_path)?;

    let listener = UnixListener::bind(socket_path)
        .map_err(|err| format!("Failed to bind heartbeat socket: {}", err))?;
    info!(path = %socket_path.display(), "Heartbeat receiver listening");

    thread::Builder::new()
        .name("lamplighter-receiver".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let state = state.clone();
                        thread::spawn(move || handle_connection(stream, state));
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to accept heartbeat connection");
                    }
                }
            }
        })
        .map_err(|err| format!("Failed to spawn receiver thread: {}", err))?;

    Ok(Receiver {
        path: socket_path.to_path_buf(),
    })
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: ReceiverState) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Receiver request");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &ReceiverState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let config = state.config.snapshot();
    match request.method {
        Method::GetHealth => to_response(request.id, &health(&config)),
        Method::Heartbeat => {
            let params = match parse_heartbeat(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let Some(identity) = config.identity_for_client(&params.client) else {
                warn!(client = %params.client, "Heartbeat from unknown client");
                return Response::error(
                    request.id,
                    "unknown_client",
                    "client does not match any identity",
                );
            };

            let seen_at = Utc::now();
            match state.store.record_heartbeat(&identity.alias, seen_at) {
                Ok(()) => {
                    info!(alias = %identity.alias, "Heartbeat received");
                    to_response(
                        request.id,
                        &HeartbeatAck {
                            alias: identity.alias.clone(),
                            seen_at,
                        },
                    )
                }
                Err(err) => Response::error(
                    request.id,
                    "store_error",
                    format!("Failed to record heartbeat: {}", err),
                ),
            }
        }
        Method::GetPresence => match presence(&config, &state.store) {
            Ok(data) => to_response(request.id, &data),
            Err(err) => Response::error(
                request.id,
                "store_error",
                format!("Failed to read presence: {}", err),
            ),
        },
    }
}

fn health(config: &Config) -> HealthData {
    HealthData {
        status: "ok".to_string(),
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        mode: match config.general.mode {
            DetectionMode::Scan => "scan",
            DetectionMode::Heartbeat => "heartbeat",
        }
        .to_string(),
    }
}

fn presence(config: &Config, store: &Store) -> lamplighter_core::Result<PresenceData> {
    let records = store.get_all(&config.tracked_aliases())?;
    let aliases: Vec<String> = config
        .identities
        .iter()
        .map(|identity| identity.alias.clone())
        .collect();
    let last_seen = store.last_seen_all(&aliases)?;

    Ok(PresenceData {
        aggregate: aggregate(&records).map(|state| state.as_str().to_string()),
        identities: records
            .into_iter()
            .map(|record| PresenceEntry {
                last_heartbeat_at: last_seen.get(&record.alias).copied(),
                alias: record.alias,
                state: record.state.as_str().to_string(),
                updated_at: record.updated_at,
            })
            .collect(),
    })
}

fn to_response<T: serde::Serialize>(id: Option<String>, data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

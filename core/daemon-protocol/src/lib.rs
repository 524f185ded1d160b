//! Socket protocol types and validation for the lamplighter heartbeat
//! receiver.
//!
//! Shared by the daemon and by anything that forwards heartbeats to it, so
//! both sides agree on the schema. The daemon remains the authority on
//! validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024; // 64KB
pub const MAX_CLIENT_LEN: usize = 512;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Heartbeat,
    GetPresence,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// "This client was just seen." `client` is matched against each
/// identity's match rule (typically a phone's user agent).
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatParams {
    pub client: String,
}

impl HeartbeatParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.client.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "client is required"));
        }
        if self.client.len() > MAX_CLIENT_LEN {
            return Err(ErrorInfo::new(
                "invalid_client",
                format!("client must be {} bytes or fewer", MAX_CLIENT_LEN),
            ));
        }
        Ok(())
    }
}

pub fn parse_heartbeat(params: Option<Value>) -> Result<HeartbeatParams, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    let heartbeat: HeartbeatParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("heartbeat payload is invalid JSON: {}", err),
        )
    })?;
    heartbeat.validate()?;
    Ok(heartbeat)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthData {
    pub status: String,
    pub pid: u32,
    pub version: String,
    pub protocol_version: u32,
    pub mode: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub alias: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub alias: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceData {
    /// `None` until the first cycle has recorded anything.
    pub aggregate: Option<String>,
    pub identities: Vec<PresenceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_heartbeat_request() {
        let request: Request = serde_json::from_value(json!({
            "protocol_version": 1,
            "method": "heartbeat",
            "id": "req-1",
            "params": { "client": "Mozilla/5.0 (Linux; Android 14; Pixel 8)" }
        }))
        .expect("request");
        assert_eq!(request.method, Method::Heartbeat);

        let params = parse_heartbeat(request.params).expect("params");
        assert!(params.client.contains("Pixel 8"));
    }

    #[test]
    fn rejects_blank_and_oversized_clients() {
        let err = parse_heartbeat(Some(json!({ "client": "   " }))).expect_err("blank");
        assert_eq!(err.code, "missing_field");

        let err = parse_heartbeat(Some(json!({ "client": "x".repeat(MAX_CLIENT_LEN + 1) })))
            .expect_err("oversized");
        assert_eq!(err.code, "invalid_client");

        let err = parse_heartbeat(None).expect_err("missing");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_unknown_fields_and_methods() {
        let err = parse_heartbeat(Some(json!({ "client": "Pixel", "extra": true })))
            .expect_err("unknown field");
        assert_eq!(err.code, "invalid_params");

        let request = serde_json::from_value::<Request>(json!({
            "protocol_version": 1,
            "method": "set_state"
        }));
        assert!(request.is_err());
    }

    #[test]
    fn error_responses_omit_data() {
        let response = Response::error(Some("req-9".to_string()), "unknown_client", "no match");
        let encoded = serde_json::to_value(&response).expect("encode");
        assert_eq!(encoded["ok"], json!(false));
        assert_eq!(encoded["error"]["code"], json!("unknown_client"));
        assert!(encoded.get("data").is_none());
    }
}

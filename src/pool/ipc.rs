// src/pool/ipc.rs
//! Worker ↔ parent IPC protocol
//!
//! JSON-lines over the worker's stdin/stdout, one frame per line,
//! discriminated by a `type` field. Messages from a single worker are
//! delivered in the order the worker sent them. A frame that fails to match
//! a known type is logged and dropped, never allowed to crash the parent.
//!
//! Worker stdout carries only protocol frames; all worker logging goes to
//! stderr.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variables bootstrapping a worker process.
///
/// This is the only side channel used for worker configuration.
pub const ENV_EXECUTION_ID: &str = "FOREMAN_EXECUTION_ID";
pub const ENV_PROJECT_ID: &str = "FOREMAN_PROJECT_ID";
pub const ENV_REPO_PATH: &str = "FOREMAN_REPO_PATH";
pub const ENV_DB_PATH: &str = "FOREMAN_DB_PATH";
pub const ENV_WORKER_ID: &str = "FOREMAN_WORKER_ID";
pub const ENV_MEMORY_LIMIT_MB: &str = "FOREMAN_MEMORY_LIMIT_MB";

/// Frames sent from a worker to the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker finished initializing
    Ready,

    /// Structured log line
    Log { level: String, message: String },

    /// Application event, forwarded verbatim to observers
    Event { payload: serde_json::Value },

    /// Phase change
    Status { phase: String },

    /// Final result payload
    Complete { result: serde_json::Value },

    /// Failure report; `fatal` marks infrastructure-level failures
    Error { message: String, fatal: bool },

    /// Liveness response to a parent ping
    Pong,
}

/// Frames sent from the parent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Abort the in-flight attempt and exit
    Cancel,

    /// Finish cleanly: flush pending frames and exit zero
    Shutdown,

    /// Liveness probe
    Ping,
}

/// Encode one frame as a single line (no trailing newline)
pub fn encode<T: Serialize>(message: &T) -> crate::utils::errors::Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a worker frame; unknown or malformed frames are dropped with a log
pub fn decode_worker(line: &str) -> Option<WorkerMessage> {
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(err = %e, line, "dropping unrecognized worker frame");
            None
        }
    }
}

/// Decode a parent frame; unknown or malformed frames are dropped with a log
pub fn decode_parent(line: &str) -> Option<ParentMessage> {
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(err = %e, line, "dropping unrecognized parent frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged_by_type() {
        assert_eq!(encode(&WorkerMessage::Ready).unwrap(), r#"{"type":"ready"}"#);
        assert_eq!(encode(&ParentMessage::Cancel).unwrap(), r#"{"type":"cancel"}"#);

        let encoded = encode(&WorkerMessage::Error {
            message: "agent exploded".to_string(),
            fatal: true,
        })
        .unwrap();
        assert!(encoded.contains(r#""type":"error""#));
        assert!(encoded.contains(r#""fatal":true"#));
    }

    #[test]
    fn test_worker_frame_round_trip() {
        let original = WorkerMessage::Complete {
            result: serde_json::json!({"files_changed": 3}),
        };
        let decoded = decode_worker(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        assert!(decode_worker(r#"{"type":"launch_missiles"}"#).is_none());
        assert!(decode_parent(r#"{"type":"self_destruct"}"#).is_none());
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        assert!(decode_worker("not json at all").is_none());
        assert!(decode_worker("").is_none());
        assert!(decode_worker(r#"{"no_type_field": 1}"#).is_none());
    }

    #[test]
    fn test_event_payload_passes_through_verbatim() {
        let payload = serde_json::json!({
            "type": "tool_use",
            "tool": "editor",
            "nested": {"deep": [1, 2, 3]},
        });
        let frame = WorkerMessage::Event {
            payload: payload.clone(),
        };
        let decoded = decode_worker(&encode(&frame).unwrap()).unwrap();
        match decoded {
            WorkerMessage::Event { payload: p } => assert_eq!(p, payload),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

//! Wire protocol for the dashboard backend.
//!
//! Both the request/response calls and the stream control messages are
//! newline-delimited JSON, internally tagged with `"type"`. Inbound
//! prediction events are *not* represented here: they arrive in two
//! historical shapes and are adapted structurally in
//! [`stream::normalize`](crate::stream::normalize).

use serde::{Deserialize, Serialize};

/// Request/response calls. One short-lived connection per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    CreateSubject {
        name: String,
        age: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    StartSession {
        user_id: u64,
    },
    EndSession {
        session_id: u64,
    },
    Health,
    SessionStats {
        session_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    SubjectCreated {
        user_id: u64,
    },
    SessionStarted {
        session_id: u64,
        user_id: u64,
    },
    SessionEnded {
        session_id: u64,
    },
    Health {
        status: BackendHealth,
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        model_loaded: Option<bool>,
    },
    SessionStats(SessionStats),
    Error {
        message: String,
    },
}

/// Outbound control messages on the persistent stream channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamRequest {
    StartStream { session_id: u64 },
    StopStream { session_id: u64 },
}

/// Backend self-reported health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// Session statistics, always sourced from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_trials: u32,
    pub correct: u32,
    pub accuracy: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_type_tagged() {
        let json = serde_json::to_string(&Request::Health).unwrap();
        assert_eq!(json, r#"{"type":"Health"}"#);

        let json = serde_json::to_string(&Request::CreateSubject {
            name: "S01".to_string(),
            age: 25,
            condition: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"CreateSubject","name":"S01","age":25}"#);
    }

    #[test]
    fn health_status_uses_lowercase_wire_names() {
        let resp: Response =
            serde_json::from_str(r#"{"type":"Health","status":"degraded"}"#).unwrap();
        match resp {
            Response::Health {
                status,
                device,
                model_loaded,
            } => {
                assert_eq!(status, BackendHealth::Degraded);
                assert!(device.is_none());
                assert!(model_loaded.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn stream_control_round_trips() {
        let json = serde_json::to_string(&StreamRequest::StartStream { session_id: 7 }).unwrap();
        assert_eq!(json, r#"{"type":"StartStream","session_id":7}"#);

        let parsed: StreamRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, StreamRequest::StartStream { session_id: 7 }));
    }
}

//! Events broadcast by the engines.
//!
//! | Event | Source |
//! |-------|--------|
//! | `EngineStatusEvent` | `CaptureEngine::subscribe_status` |
//! | `RecognitionEvent` | `CaptureEngine::subscribe_recognitions` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted when the capture engine changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but never started.
    Idle,
    /// Capturing and segmenting.
    Recording,
    /// Session ended normally; may be restarted.
    Stopped,
    /// The device failed past its retry budget; `stop()` then restart.
    Error,
}

/// Emitted once per recognised segment with non-empty text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Ordinal of the segment within its capture session.
    pub segment: u64,
    pub text: String,
    /// Speech duration of the segment, excluding trailing silence.
    pub speech_ms: u64,
    pub recognized_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_lowercase() {
        let event = EngineStatusEvent {
            status: EngineStatus::Recording,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "recording");
        assert!(json["detail"].is_null());

        let back: EngineStatusEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.status, EngineStatus::Recording);
    }

    #[test]
    fn recognition_event_uses_camel_case() {
        let event = RecognitionEvent {
            seq: 2,
            segment: 1,
            text: "你好".into(),
            speech_ms: 600,
            recognized_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize recognition event");
        assert_eq!(json["speechMs"], 600);
        assert_eq!(json["text"], "你好");
        assert!(json["recognizedAt"].is_string());
    }

    #[test]
    fn status_rejects_other_casing() {
        assert!(serde_json::from_str::<EngineStatus>(r#""Recording""#).is_err());
    }
}

//! # Events and Wire Frames
//!
//! Two shapes of the same message. A [`Frame`] is what the push transport
//! carries (camelCase JSON, one object per message or per line). A
//! [`SyncEvent`] is what the dispatcher fans out: the frame's open `type`
//! string has been resolved to a closed [`EventKind`] through a static lookup
//! table, so a typo in a handler registration fails to compile instead of
//! silently never matching.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use static_init::dynamic;
use thiserror::Error;

/// Closed set of event types the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    CourseUpdateComplete,
    ChapterUpdateComplete,
    ChapterDeleteComplete,
    VideoUpdateComplete,
    VideoDeleteComplete,
    UploadProgress,
    UploadComplete,
    UploadFailed,
    CollectionInvalidated,
    OperationFailed,
}

impl EventKind {
    /// Every kind, in wire-table order.
    pub const ALL: [EventKind; 10] = [
        EventKind::CourseUpdateComplete,
        EventKind::ChapterUpdateComplete,
        EventKind::ChapterDeleteComplete,
        EventKind::VideoUpdateComplete,
        EventKind::VideoDeleteComplete,
        EventKind::UploadProgress,
        EventKind::UploadComplete,
        EventKind::UploadFailed,
        EventKind::CollectionInvalidated,
        EventKind::OperationFailed,
    ];

    /// The `type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CourseUpdateComplete => "course-update-complete",
            EventKind::ChapterUpdateComplete => "chapter-update-complete",
            EventKind::ChapterDeleteComplete => "chapter-delete-complete",
            EventKind::VideoUpdateComplete => "video-update-complete",
            EventKind::VideoDeleteComplete => "video-delete-complete",
            EventKind::UploadProgress => "upload-progress",
            EventKind::UploadComplete => "upload-complete",
            EventKind::UploadFailed => "upload-failed",
            EventKind::CollectionInvalidated => "collection-invalidated",
            EventKind::OperationFailed => "operation-failed",
        }
    }

    /// Resolves a wire `type` string. Unknown strings yield `None`.
    pub fn from_wire(kind: &str) -> Option<EventKind> {
        FRAME_TYPES.get(kind).copied()
    }

    /// Kinds that check off one expected sub-operation in the tracker.
    pub fn is_completion(self) -> bool {
        matches!(
            self,
            EventKind::CourseUpdateComplete
                | EventKind::ChapterUpdateComplete
                | EventKind::ChapterDeleteComplete
                | EventKind::VideoUpdateComplete
                | EventKind::VideoDeleteComplete
                | EventKind::UploadComplete
        )
    }

    /// Kinds that resolve their operation as failed.
    pub fn is_failure(self) -> bool {
        matches!(self, EventKind::UploadFailed | EventKind::OperationFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[dynamic]
/// Wire `type` → [`EventKind`]. Built once from [`EventKind::ALL`].
static FRAME_TYPES: HashMap<&'static str, EventKind> =
    EventKind::ALL.iter().map(|kind| (kind.as_str(), *kind)).collect();

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame payload is not valid UTF-8")]
    Utf8,
}

/// # Wire Frame
///
/// `{ type, scopeId, operationId?, data, timestamp }`. `data` must be a JSON
/// object; `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub scope_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub data: Map<String, Value>,
    pub timestamp: i64,
}

impl Frame {
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Splits a transport message into frames. A message may hold one JSON
    /// object or several newline-separated ones; blank lines are skipped.
    pub fn decode_all(text: &str) -> Vec<Result<Frame, FrameError>> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Frame::decode)
            .collect()
    }

    pub fn encode(&self) -> String {
        // A struct of strings, a map of JSON values and an integer cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Resolves the frame into a dispatchable event. `None` for unknown types.
    pub fn into_event(self) -> Option<SyncEvent> {
        let kind = EventKind::from_wire(&self.frame_type)?;
        Some(SyncEvent {
            kind,
            scope_id: self.scope_id,
            operation_id: self.operation_id,
            payload: Value::Object(self.data),
            timestamp: self.timestamp,
        })
    }
}

/// # Sync Event
///
/// The in-process event record handed to every dispatcher subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub kind: EventKind,
    /// Owning scope (a course id). Subscribers of other scopes ignore the event.
    pub scope_id: String,
    pub operation_id: Option<String>,
    pub payload: Value,
    /// Epoch milliseconds assigned by the server.
    pub timestamp: i64,
}

impl SyncEvent {
    pub fn new(kind: EventKind, scope_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            scope_id: scope_id.into(),
            operation_id: None,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Back to wire form, for servers and test harnesses.
    pub fn to_frame(&self) -> Frame {
        let data = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        Frame {
            frame_type: self.kind.as_str().to_string(),
            scope_id: self.scope_id.clone(),
            operation_id: self.operation_id.clone(),
            data,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_table_covers_every_kind() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("chapter-updated"), None);
    }

    #[test]
    fn test_decode_wire_frame() {
        let text = r#"{"type":"video-delete-complete","scopeId":"c1","operationId":"op-9","data":{"id":"v1"},"timestamp":1700000000000}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.frame_type, "video-delete-complete");
        assert_eq!(frame.operation_id.as_deref(), Some("op-9"));

        let event = frame.into_event().unwrap();
        assert_eq!(event.kind, EventKind::VideoDeleteComplete);
        assert_eq!(event.scope_id, "c1");
        assert_eq!(event.payload, json!({"id": "v1"}));
        assert_eq!(event.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_encode_omits_missing_operation_id() {
        let event = SyncEvent::new(EventKind::CollectionInvalidated, "c1", json!({"collection": "videos"}))
            .with_timestamp(5);
        let text = event.to_frame().encode();
        assert!(!text.contains("operationId"));
        assert!(text.contains(r#""type":"collection-invalidated""#));
        assert!(text.contains(r#""scopeId":"c1""#));
    }

    #[test]
    fn test_decode_all_splits_lines() {
        let text = "{\"type\":\"upload-progress\",\"scopeId\":\"c1\",\"data\":{\"progress\":10},\"timestamp\":1}\n\n{\"type\":\"nope\",\"scopeId\":\"c1\",\"data\":{},\"timestamp\":2}\nnot json";
        let frames = Frame::decode_all(text);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_ok());
        assert!(frames[1].as_ref().unwrap().clone().into_event().is_none());
        assert!(frames[2].is_err());
    }

    #[test]
    fn test_data_must_be_an_object() {
        let text = r#"{"type":"upload-progress","scopeId":"c1","data":[1,2],"timestamp":1}"#;
        assert!(Frame::decode(text).is_err());
    }

    #[test]
    fn test_completion_classification() {
        assert!(EventKind::UploadComplete.is_completion());
        assert!(!EventKind::UploadProgress.is_completion());
        assert!(!EventKind::CollectionInvalidated.is_completion());
        assert!(EventKind::OperationFailed.is_failure());
        assert!(!EventKind::OperationFailed.is_completion());
    }
}

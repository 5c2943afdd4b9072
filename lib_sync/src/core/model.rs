//! # Entity Model
//!
//! Flat records keyed by id. No record embeds another record; ownership is
//! expressed by the child's `course_id` / `chapter_id` and position by the
//! child's integer `order`. The `chapter_ids` / `video_ids` sequences exist
//! only on values handed out by the cache, where they are derived from the
//! children at read time. Values arriving in payloads are ignored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Derived on read, sorted by chapter `order`.
    #[serde(default, skip_deserializing)]
    pub chapter_ids: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub order: i64,
    /// Derived on read, sorted by video `order`.
    #[serde(default, skip_deserializing)]
    pub video_ids: Vec<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    #[default]
    Pending,
    Uploading,
    Processing,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub chapter_id: String,
    pub order: i64,
    pub title: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub status: VideoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_progress: Option<u8>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Video {
    /// A placeholder for an upload that has just started.
    pub fn provisional(temp_id: impl Into<String>, chapter_id: impl Into<String>, order: i64, title: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: temp_id.into(),
            chapter_id: chapter_id.into(),
            order,
            title: title.into(),
            size_bytes,
            status: VideoStatus::Pending,
            upload_progress: Some(0),
            version: 0,
            updated_at: 0,
        }
    }
}

/// # Video Slot
///
/// A video either stands for in-flight work under a client-generated id, or
/// is a server-confirmed record. Provisional slots remember the operation id
/// that progress and completion frames are correlated by.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Provisional { record: Video, operation_id: String },
    Confirmed(Video),
}

impl Slot {
    pub fn record(&self) -> &Video {
        match self {
            Slot::Provisional { record, .. } | Slot::Confirmed(record) => record,
        }
    }

    pub fn record_mut(&mut self) -> &mut Video {
        match self {
            Slot::Provisional { record, .. } | Slot::Confirmed(record) => record,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Slot::Provisional { .. })
    }

    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Slot::Provisional { operation_id, .. } => Some(operation_id),
            Slot::Confirmed(_) => None,
        }
    }
}

/// What `get_entity` hands out.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Course(Course),
    Chapter(Chapter),
    Video(Video),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Course(c) => &c.id,
            Entity::Chapter(c) => &c.id,
            Entity::Video(v) => &v.id,
        }
    }

    pub fn as_course(&self) -> Option<&Course> {
        match self {
            Entity::Course(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_chapter(&self) -> Option<&Chapter> {
        match self {
            Entity::Chapter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&Video> {
        match self {
            Entity::Video(v) => Some(v),
            _ => None,
        }
    }
}

/// Collections a scope can mark stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Course,
    Chapters,
    Videos,
    All,
}

/// Authoritative state of one course, as returned by a direct fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSnapshot {
    pub course: Option<Course>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub videos: Vec<Video>,
    /// Epoch milliseconds at which the server produced the snapshot.
    #[serde(default)]
    pub fetched_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_ordering_hints_are_ignored() {
        let chapter: Chapter = serde_json::from_value(json!({
            "id": "ch1", "courseId": "c1", "title": "Intro", "order": 2,
            "videoIds": ["v9", "v8"]
        }))
        .unwrap();
        assert!(chapter.video_ids.is_empty());
        assert_eq!(chapter.order, 2);
    }

    #[test]
    fn test_video_status_wire_names() {
        let video: Video = serde_json::from_value(json!({
            "id": "v-42", "chapterId": "ch1", "order": 1, "title": "f1.mp4",
            "sizeBytes": 1024, "status": "ready"
        }))
        .unwrap();
        assert_eq!(video.status, VideoStatus::Ready);
        assert_eq!(video.upload_progress, None);
        assert_eq!(serde_json::to_value(VideoStatus::Processing).unwrap(), json!("processing"));
    }
}

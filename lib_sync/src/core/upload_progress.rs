//! # Upload Progress Stream
//!
//! Upload progress arrives far more often than any other event and only ever
//! touches one field, so it bypasses the general merge path. Frames are
//! correlated by operation id to the provisional video the upload writes
//! into, debounced per operation, then patched into the cache.
//!
//! - A frame at or below the highest value seen so far is dropped.
//! - A frame within `min_interval` of the last applied one is held back; the
//!   newest held value is flushed once the interval has passed.
//! - A terminal frame (`final: true`) always applies. When it carries the
//!   finalized `video` record the provisional slot is swapped for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{sleep_until, Instant};

use crate::core::cache::{ApplyOutcome, NormalizedCache};
use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::core::event::{EventKind, SyncEvent};
use crate::core::model::Video;
use crate::error::SyncError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressFrame {
    #[serde(default)]
    progress: f64,
    #[serde(default, rename = "final")]
    is_final: bool,
    video: Option<Video>,
}

/// What happened to one progress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Applied(ApplyOutcome),
    /// Held back by the debounce window; a later flush applies it.
    Coalesced,
    /// Regression or duplicate.
    Dropped,
    Finalized(ApplyOutcome),
}

#[derive(Debug)]
struct ProgressState {
    scope_id: String,
    applied: Option<(u8, Instant)>,
    pending: Option<u8>,
    flush_scheduled: bool,
}

impl ProgressState {
    fn highest(&self) -> Option<u8> {
        let applied = self.applied.map(|(value, _)| value);
        applied.max(self.pending)
    }
}

pub struct UploadProgressStream {
    cache: Arc<NormalizedCache>,
    min_interval: Duration,
    uploads: Mutex<HashMap<String, ProgressState>>,
}

impl UploadProgressStream {
    pub fn new(cache: Arc<NormalizedCache>, min_interval: Duration) -> Self {
        Self {
            cache,
            min_interval,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProgressState>> {
        self.uploads.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Subscribes to progress frames of one scope, and to the upload's
    /// completion/failure so its debounce state is released.
    pub fn attach_scope(self: &Arc<Self>, dispatcher: &Dispatcher, scope_id: &str) -> Vec<Subscription> {
        let mut subscriptions = Vec::with_capacity(3);

        let stream = Arc::clone(self);
        let scope = scope_id.to_string();
        subscriptions.push(dispatcher.subscribe(EventKind::UploadProgress, move |event| {
            if event.scope_id != scope {
                return Ok(());
            }
            let outcome = stream.on_progress(&scope, event)?;
            tracing::trace!("Progress frame for {:?}: {:?}", event.operation_id, outcome);
            Ok(())
        }));

        for kind in [EventKind::UploadComplete, EventKind::UploadFailed] {
            let stream = Arc::clone(self);
            let scope = scope_id.to_string();
            subscriptions.push(dispatcher.subscribe(kind, move |event| {
                if event.scope_id == scope {
                    if let Some(op) = event.operation_id.as_deref() {
                        stream.forget(op);
                    }
                }
                Ok(())
            }));
        }
        subscriptions
    }

    /// # On Progress
    ///
    /// Handles one `upload-progress` event already filtered to `scope_id`.
    pub fn on_progress(self: &Arc<Self>, scope_id: &str, event: &SyncEvent) -> Result<ProgressOutcome, SyncError> {
        let Some(operation_id) = event.operation_id.as_deref() else {
            tracing::debug!("Progress frame without operationId dropped");
            return Ok(ProgressOutcome::Dropped);
        };
        let frame: ProgressFrame = serde_json::from_value(event.payload.clone()).map_err(|e| SyncError::Payload {
            kind: event.kind.as_str(),
            reason: e.to_string(),
        })?;

        if frame.is_final {
            self.forget(operation_id);
            let outcome = self
                .cache
                .finish_upload(scope_id, operation_id, frame.video, event.timestamp);
            tracing::info!("Upload {} finished: {:?}", operation_id, outcome);
            return Ok(ProgressOutcome::Finalized(outcome));
        }

        let progress = frame.progress.clamp(0.0, 100.0).round() as u8;
        let now = Instant::now();
        {
            let mut uploads = self.lock();
            let state = uploads.entry(operation_id.to_string()).or_insert_with(|| ProgressState {
                scope_id: scope_id.to_string(),
                applied: None,
                pending: None,
                flush_scheduled: false,
            });
            if state.highest().is_some_and(|high| progress <= high) {
                return Ok(ProgressOutcome::Dropped);
            }
            if let Some((_, at)) = state.applied {
                let window_end = at + self.min_interval;
                if now < window_end {
                    state.pending = Some(progress);
                    if !state.flush_scheduled {
                        state.flush_scheduled = true;
                        self.schedule_flush(operation_id, window_end);
                    }
                    return Ok(ProgressOutcome::Coalesced);
                }
            }
            state.applied = Some((progress, now));
            state.pending = None;
        }

        Ok(ProgressOutcome::Applied(
            self.cache.patch_upload_progress(scope_id, operation_id, progress),
        ))
    }

    fn schedule_flush(self: &Arc<Self>, operation_id: &str, deadline: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime: the held value waits for the next frame instead.
            return;
        };
        let stream = Arc::clone(self);
        let operation_id = operation_id.to_string();
        runtime.spawn(async move {
            sleep_until(deadline).await;
            stream.flush(&operation_id);
        });
    }

    fn flush(&self, operation_id: &str) {
        let flushed = {
            let mut uploads = self.lock();
            let Some(state) = uploads.get_mut(operation_id) else {
                return;
            };
            state.flush_scheduled = false;
            state.pending.take().map(|value| {
                state.applied = Some((value, Instant::now()));
                (state.scope_id.clone(), value)
            })
        };
        if let Some((scope_id, value)) = flushed {
            self.cache.patch_upload_progress(&scope_id, operation_id, value);
        }
    }

    /// Releases the debounce state of one upload.
    pub fn forget(&self, operation_id: &str) {
        self.lock().remove(operation_id);
    }

    /// Releases the debounce state of every upload in a scope.
    pub fn forget_scope(&self, scope_id: &str) {
        self.lock().retain(|_, state| state.scope_id != scope_id);
    }

    pub fn tracked_uploads(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{CourseSnapshot, VideoStatus};
    use serde_json::json;

    fn setup(interval_ms: u64) -> (Dispatcher, Arc<NormalizedCache>, Arc<UploadProgressStream>, Vec<Subscription>) {
        let dispatcher = Dispatcher::new();
        let cache = Arc::new(NormalizedCache::new());
        cache.hydrate(
            "c1",
            serde_json::from_value::<CourseSnapshot>(json!({
                "course": {"id": "c1", "title": "Rust"},
                "chapters": [{"id": "ch1", "courseId": "c1", "title": "Intro", "order": 1}]
            }))
            .unwrap(),
        );
        cache.insert_provisional("c1", Video::provisional("temp-1", "ch1", 1, "f1.mp4", 4096), "op1");
        let stream = Arc::new(UploadProgressStream::new(Arc::clone(&cache), Duration::from_millis(interval_ms)));
        let mut subs = cache.attach_scope(&dispatcher, "c1");
        subs.extend(stream.attach_scope(&dispatcher, "c1"));
        (dispatcher, cache, stream, subs)
    }

    fn progress_of(cache: &NormalizedCache) -> Option<u8> {
        cache.get_video("temp-1").and_then(|v| v.upload_progress)
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_then_final_swap() {
        let (dispatcher, cache, stream, _subs) = setup(100);

        dispatcher.emit(EventKind::UploadProgress, "c1", json!({"progress": 10}), Some("op1"));
        assert_eq!(progress_of(&cache), Some(10));

        tokio::time::sleep(Duration::from_millis(150)).await;
        dispatcher.emit(EventKind::UploadProgress, "c1", json!({"progress": 55}), Some("op1"));
        assert_eq!(progress_of(&cache), Some(55));
        assert!(cache.get_video_slot("temp-1").unwrap().is_provisional());

        dispatcher.emit(
            EventKind::UploadProgress,
            "c1",
            json!({
                "progress": 100,
                "final": true,
                "video": {"id": "v-42", "chapterId": "ch1", "order": 1, "title": "f1.mp4", "sizeBytes": 4096, "status": "ready"}
            }),
            Some("op1"),
        );
        let video = cache.get_video("temp-1").unwrap();
        assert_eq!(video.id, "v-42");
        assert_eq!(video.status, VideoStatus::Ready);
        assert_eq!(cache.get_ordered_children("ch1"), vec!["v-42"]);
        assert_eq!(stream.tracked_uploads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regressions_are_dropped() {
        let (_dispatcher, cache, stream, _subs) = setup(0);
        let frame = |p: u32| SyncEvent::new(EventKind::UploadProgress, "c1", json!({"progress": p})).with_operation("op1");

        assert!(matches!(stream.on_progress("c1", &frame(40)).unwrap(), ProgressOutcome::Applied(_)));
        assert_eq!(stream.on_progress("c1", &frame(40)).unwrap(), ProgressOutcome::Dropped);
        assert_eq!(stream.on_progress("c1", &frame(20)).unwrap(), ProgressOutcome::Dropped);
        assert_eq!(progress_of(&cache), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_and_flushed() {
        let (dispatcher, cache, _stream, _subs) = setup(100);

        for p in [5, 6, 7, 8, 9] {
            dispatcher.emit(EventKind::UploadProgress, "c1", json!({"progress": p}), Some("op1"));
        }
        assert_eq!(progress_of(&cache), Some(5));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(progress_of(&cache), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_without_record_marks_transfer_done() {
        let (dispatcher, cache, _stream, _subs) = setup(100);
        dispatcher.emit(EventKind::UploadProgress, "c1", json!({"progress": 90}), Some("op1"));
        dispatcher.emit(EventKind::UploadProgress, "c1", json!({"progress": 100, "final": true}), Some("op1"));

        let video = cache.get_video("temp-1").unwrap();
        assert_eq!(video.upload_progress, Some(100));
        assert_eq!(video.status, VideoStatus::Processing);
        assert!(cache.get_video_slot("temp-1").unwrap().is_provisional());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_scope_progress_is_ignored() {
        let (dispatcher, cache, stream, _subs) = setup(0);
        dispatcher.emit(EventKind::UploadProgress, "c2", json!({"progress": 70}), Some("op1"));
        assert_eq!(progress_of(&cache), Some(0));
        assert_eq!(stream.tracked_uploads(), 0);
    }
}

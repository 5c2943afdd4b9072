//! # Normalized Cache Layer
//!
//! The only component that writes entity state, and the only one the UI reads
//! from. Courses, chapters and video slots live in flat id-keyed maps behind a
//! single `RwLock`; every mutation is one short write-locked section, so a
//! reader sees either the state before an event or the state after it.
//!
//! ## What an event can do
//!
//! - **Merge**: apply the payload's field deltas onto the record with that id.
//!   A payload `version` (when present and non-zero) must be newer than the
//!   stored one; otherwise the event timestamp must not be older than the
//!   last applied one. Reapplying an event therefore changes nothing.
//! - **Remove**: delete the record if it still exists and leave a tombstone so
//!   an older upsert arriving late cannot bring it back.
//! - **Invalidate**: mark a collection of the scope stale and queue one
//!   [`RefetchRequest`]; the host answers with [`NormalizedCache::hydrate`].
//! - **Replace**: swap a provisional upload slot for the confirmed record in
//!   the same write section. Lookups by the old temporary id keep resolving
//!   through an alias table.
//!
//! Every handler is bound to one scope (a course id). Events for another scope,
//! and events that target records owned by another scope, are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::core::event::{EventKind, SyncEvent};
use crate::core::model::{Chapter, Collection, Course, CourseSnapshot, Entity, Slot, Video, VideoStatus};
use crate::error::SyncError;

/// Event kinds the cache subscribes to for every open scope.
/// `upload-progress` is deliberately absent: it has its own debounced path.
pub const CACHE_EVENT_KINDS: [EventKind; 8] = [
    EventKind::CourseUpdateComplete,
    EventKind::ChapterUpdateComplete,
    EventKind::ChapterDeleteComplete,
    EventKind::VideoUpdateComplete,
    EventKind::VideoDeleteComplete,
    EventKind::UploadComplete,
    EventKind::UploadFailed,
    EventKind::CollectionInvalidated,
];

/// Result of applying one event. Mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Merged,
    Removed,
    Replaced,
    Patched,
    Invalidated,
    /// The event was valid but the cache already reflects it.
    Unchanged,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    ForeignScope,
    UnknownEntity,
    Outdated,
    Tombstoned,
    Provisional,
    NotHandled,
}

/// Queued when a collection goes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefetchRequest {
    pub scope_id: String,
    pub collection: Collection,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntityType {
    Course,
    Chapter,
    Video,
}

#[derive(Debug, Clone)]
struct VideoEntry {
    slot: Slot,
    scope_id: String,
}

#[derive(Default)]
struct Store {
    courses: HashMap<String, Course>,
    chapters: HashMap<String, Chapter>,
    videos: HashMap<String, VideoEntry>,
    /// Finalized temporary id → confirmed id.
    aliases: HashMap<String, String>,
    /// Operation id → temporary id of its provisional slot.
    provisional_by_op: HashMap<String, String>,
    /// (type, id) → (scope, delete timestamp).
    tombstones: HashMap<(EntityType, String), (String, i64)>,
    stale: HashSet<(String, Collection)>,
}

// --- Payload shapes -------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseDelta {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    status: Option<String>,
    version: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterDelta {
    id: String,
    course_id: Option<String>,
    title: Option<String>,
    order: Option<i64>,
    version: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDelta {
    id: String,
    chapter_id: Option<String>,
    order: Option<i64>,
    title: Option<String>,
    size_bytes: Option<u64>,
    status: Option<VideoStatus>,
    upload_progress: Option<u8>,
    version: Option<u64>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadCompletion {
    temp_id: Option<String>,
    video: Video,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UploadFailure {
    temp_id: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct Invalidation {
    #[serde(default = "all_collections")]
    collection: Collection,
}

fn all_collections() -> Collection {
    Collection::All
}

fn parse<T: DeserializeOwned>(event: &SyncEvent) -> Result<T, SyncError> {
    serde_json::from_value(event.payload.clone()).map_err(|e| SyncError::Payload {
        kind: event.kind.as_str(),
        reason: e.to_string(),
    })
}

/// Whether an incoming change is newer than what is stored.
fn is_fresh(stored_version: u64, stored_at: i64, incoming_version: Option<u64>, timestamp: i64) -> bool {
    match incoming_version.filter(|v| *v > 0) {
        Some(v) => v > stored_version,
        None => timestamp >= stored_at,
    }
}

/// # Normalized Cache
///
/// Shared as `Arc<NormalizedCache>`. Readers never wait on I/O.
pub struct NormalizedCache {
    store: RwLock<Store>,
    refetch_tx: mpsc::UnboundedSender<RefetchRequest>,
    refetch_rx: Mutex<Option<mpsc::UnboundedReceiver<RefetchRequest>>>,
}

impl Default for NormalizedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NormalizedCache {
    pub fn new() -> Self {
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        Self {
            store: RwLock::new(Store::default()),
            refetch_tx,
            refetch_rx: Mutex::new(Some(refetch_rx)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Hands out the refetch queue. Only the first caller gets it.
    pub fn take_refetch_requests(&self) -> Option<mpsc::UnboundedReceiver<RefetchRequest>> {
        self.refetch_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    // --- Subscription -----------------------------------------------------

    /// # Attach Scope
    ///
    /// Subscribes this cache to every completion kind for one scope. The
    /// returned subscriptions are the scope's; dropping them detaches it.
    pub fn attach_scope(self: &Arc<Self>, dispatcher: &Dispatcher, scope_id: &str) -> Vec<Subscription> {
        CACHE_EVENT_KINDS
            .iter()
            .map(|kind| {
                let cache = Arc::clone(self);
                let scope = scope_id.to_string();
                dispatcher.subscribe(*kind, move |event| {
                    if event.scope_id != scope {
                        return Ok(());
                    }
                    let outcome = cache.apply_event(&scope, event)?;
                    tracing::debug!(
                        "Cache applied {} for scope {}: {:?}",
                        event.kind,
                        scope,
                        outcome
                    );
                    Ok(())
                })
            })
            .collect()
    }

    // --- Reads --------------------------------------------------------------

    /// Looks up a course, chapter or video by id. Ordering sequences on the
    /// returned value are derived from the children's `order` fields.
    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        let store = self.read();
        if let Some(course) = store.courses.get(id) {
            let mut course = course.clone();
            course.chapter_ids = store.ordered_chapters(id);
            return Some(Entity::Course(course));
        }
        if let Some(chapter) = store.chapters.get(id) {
            let mut chapter = chapter.clone();
            chapter.video_ids = store.ordered_videos(id);
            return Some(Entity::Chapter(chapter));
        }
        store
            .videos
            .get(store.resolve_video_id(id))
            .map(|entry| Entity::Video(entry.slot.record().clone()))
    }

    /// Child ids of a course (chapters) or chapter (videos), sorted by `order`
    /// with the id as tie-breaker. Empty for unknown owners.
    pub fn get_ordered_children(&self, owner_id: &str) -> Vec<String> {
        let store = self.read();
        if store.courses.contains_key(owner_id) {
            store.ordered_chapters(owner_id)
        } else if store.chapters.contains_key(owner_id) {
            store.ordered_videos(owner_id)
        } else {
            Vec::new()
        }
    }

    pub fn get_course(&self, id: &str) -> Option<Course> {
        self.get_entity(id).and_then(|e| e.as_course().cloned())
    }

    pub fn get_chapter(&self, id: &str) -> Option<Chapter> {
        self.get_entity(id).and_then(|e| e.as_chapter().cloned())
    }

    pub fn get_video(&self, id: &str) -> Option<Video> {
        self.get_entity(id).and_then(|e| e.as_video().cloned())
    }

    /// The video slot behind `id`, revealing whether it is still provisional.
    pub fn get_video_slot(&self, id: &str) -> Option<Slot> {
        let store = self.read();
        store.videos.get(store.resolve_video_id(id)).map(|entry| entry.slot.clone())
    }

    /// Temporary id of the provisional record an operation is uploading into.
    pub fn provisional_for_operation(&self, operation_id: &str) -> Option<String> {
        self.read().provisional_by_op.get(operation_id).cloned()
    }

    pub fn is_stale(&self, scope_id: &str, collection: Collection) -> bool {
        let store = self.read();
        store.stale.contains(&(scope_id.to_string(), collection))
            || store.stale.contains(&(scope_id.to_string(), Collection::All))
    }

    /// Number of records (course, chapters, videos) owned by a scope.
    pub fn scope_len(&self, scope_id: &str) -> usize {
        let store = self.read();
        let courses = usize::from(store.courses.contains_key(scope_id));
        let chapters = store.chapters.values().filter(|c| c.course_id == scope_id).count();
        let videos = store.videos.values().filter(|v| v.scope_id == scope_id).count();
        courses + chapters + videos
    }

    // --- Cache-layer writes -------------------------------------------------

    /// # Invalidate
    ///
    /// Marks a collection stale and queues a refetch. Repeated invalidation of
    /// an already stale collection queues nothing new.
    pub fn invalidate(&self, scope_id: &str, collection: Collection, reason: &str) -> ApplyOutcome {
        let mut store = self.write();
        self.mark_stale(&mut store, scope_id, collection, reason)
    }

    fn mark_stale(&self, store: &mut Store, scope_id: &str, collection: Collection, reason: &str) -> ApplyOutcome {
        if !store.stale.insert((scope_id.to_string(), collection)) {
            return ApplyOutcome::Unchanged;
        }
        tracing::info!("Scope {} {:?} marked stale: {}", scope_id, collection, reason);
        let request = RefetchRequest {
            scope_id: scope_id.to_string(),
            collection,
            reason: reason.to_string(),
        };
        if self.refetch_tx.send(request).is_err() {
            tracing::warn!("Refetch queue closed; scope {} stays stale until hydrated", scope_id);
        }
        ApplyOutcome::Invalidated
    }

    /// # Hydrate
    ///
    /// Installs an authoritative snapshot for a scope: confirmed records of the
    /// scope are replaced wholesale, provisional uploads are kept, staleness
    /// and tombstones covered by the snapshot are cleared.
    pub fn hydrate(&self, scope_id: &str, snapshot: CourseSnapshot) {
        let mut store = self.write();
        let stamp = snapshot.fetched_at;

        if let Some(mut course) = snapshot.course {
            course.chapter_ids.clear();
            course.updated_at = course.updated_at.max(stamp);
            store.courses.insert(scope_id.to_string(), Course { id: scope_id.to_string(), ..course });
        }

        store.chapters.retain(|_, c| c.course_id != scope_id);
        for mut chapter in snapshot.chapters {
            chapter.video_ids.clear();
            chapter.course_id = scope_id.to_string();
            chapter.updated_at = chapter.updated_at.max(stamp);
            store.tombstones.remove(&(EntityType::Chapter, chapter.id.clone()));
            store.chapters.insert(chapter.id.clone(), chapter);
        }

        store
            .videos
            .retain(|_, v| v.scope_id != scope_id || v.slot.is_provisional());
        for mut video in snapshot.videos {
            video.updated_at = video.updated_at.max(stamp);
            store.tombstones.remove(&(EntityType::Video, video.id.clone()));
            store.videos.insert(
                video.id.clone(),
                VideoEntry {
                    slot: Slot::Confirmed(video),
                    scope_id: scope_id.to_string(),
                },
            );
        }

        store.stale.retain(|(scope, _)| scope != scope_id);
        tracing::info!("Scope {} hydrated from snapshot", scope_id);
    }

    /// # Insert Provisional
    ///
    /// Optimistic placeholder for work the server has not confirmed yet. The
    /// record's id is the client-generated temporary id; `operation_id` is
    /// what progress and completion frames will carry.
    pub fn insert_provisional(&self, scope_id: &str, record: Video, operation_id: &str) {
        let mut store = self.write();
        let temp_id = record.id.clone();
        store.provisional_by_op.insert(operation_id.to_string(), temp_id.clone());
        store.videos.insert(
            temp_id.clone(),
            VideoEntry {
                slot: Slot::Provisional {
                    record,
                    operation_id: operation_id.to_string(),
                },
                scope_id: scope_id.to_string(),
            },
        );
        tracing::debug!("Provisional video {} inserted for operation {}", temp_id, operation_id);
    }

    /// Drops a provisional record when the mutation failed before the server
    /// accepted it. Confirmed records are left alone.
    pub fn discard_provisional(&self, temp_id: &str) -> ApplyOutcome {
        let mut store = self.write();
        store.remove_provisional(temp_id)
    }

    /// # Evict Scope
    ///
    /// Drops everything a scope owns. Called when its last handle closes.
    pub fn evict_scope(&self, scope_id: &str) {
        let mut store = self.write();
        store.courses.remove(scope_id);
        store.chapters.retain(|_, c| c.course_id != scope_id);

        let evicted: HashSet<String> = store
            .videos
            .iter()
            .filter(|(_, v)| v.scope_id == scope_id)
            .map(|(id, _)| id.clone())
            .collect();
        store.videos.retain(|id, _| !evicted.contains(id));
        store.aliases.retain(|_, real| !evicted.contains(real.as_str()));
        store.provisional_by_op.retain(|_, temp| !evicted.contains(temp.as_str()));
        store.tombstones.retain(|_, (scope, _)| scope != scope_id);
        store.stale.retain(|(scope, _)| scope != scope_id);
        tracing::info!("Scope {} evicted ({} videos)", scope_id, evicted.len());
    }

    /// # Apply Event
    ///
    /// Routes one confirmed event to its cache action. `scope_id` is the
    /// scope of the calling subscriber.
    pub(crate) fn apply_event(&self, scope_id: &str, event: &SyncEvent) -> Result<ApplyOutcome, SyncError> {
        if event.scope_id != scope_id {
            return Ok(ApplyOutcome::Ignored(IgnoreReason::ForeignScope));
        }
        let ts = event.timestamp;
        let outcome = match event.kind {
            EventKind::CourseUpdateComplete => {
                let delta: CourseDelta = parse(event)?;
                self.write().merge_course(scope_id, delta, ts)
            }
            EventKind::ChapterUpdateComplete => {
                let delta: ChapterDelta = parse(event)?;
                let mut store = self.write();
                match store.merge_chapter(scope_id, delta, ts) {
                    ApplyOutcome::Ignored(IgnoreReason::UnknownEntity) => {
                        self.mark_stale(&mut store, scope_id, Collection::Chapters, "delta for unknown chapter")
                    }
                    other => other,
                }
            }
            EventKind::ChapterDeleteComplete => {
                let IdOnly { id } = parse(event)?;
                self.write().remove_chapter(scope_id, &id, ts)
            }
            EventKind::VideoUpdateComplete => {
                let delta: VideoDelta = parse(event)?;
                let mut store = self.write();
                match store.merge_video(scope_id, delta, ts) {
                    ApplyOutcome::Ignored(IgnoreReason::UnknownEntity) => {
                        self.mark_stale(&mut store, scope_id, Collection::Videos, "delta for unknown video")
                    }
                    other => other,
                }
            }
            EventKind::VideoDeleteComplete => {
                let IdOnly { id } = parse(event)?;
                self.write().remove_video(scope_id, &id, ts)
            }
            EventKind::UploadComplete => {
                let (temp_id, video) = if event.payload.get("video").is_some() {
                    let completion: UploadCompletion = parse(event)?;
                    (completion.temp_id, completion.video)
                } else {
                    (None, parse::<Video>(event)?)
                };
                self.write()
                    .complete_upload(scope_id, event.operation_id.as_deref(), temp_id.as_deref(), video, ts)
            }
            EventKind::UploadFailed => {
                let failure: UploadFailure = if event.payload.is_null() {
                    UploadFailure::default()
                } else {
                    parse(event)?
                };
                let mut store = self.write();
                let temp_id = event
                    .operation_id
                    .as_ref()
                    .and_then(|op| store.provisional_by_op.get(op).cloned())
                    .or(failure.temp_id);
                match temp_id {
                    Some(temp_id) => {
                        tracing::info!(
                            "Upload into {} failed: {}",
                            temp_id,
                            failure.reason.as_deref().unwrap_or("no reason given")
                        );
                        store.remove_provisional(&temp_id)
                    }
                    None => ApplyOutcome::Unchanged,
                }
            }
            EventKind::CollectionInvalidated => {
                let Invalidation { collection } = parse(event)?;
                self.invalidate(scope_id, collection, "server invalidation")
            }
            EventKind::UploadProgress | EventKind::OperationFailed => {
                ApplyOutcome::Ignored(IgnoreReason::NotHandled)
            }
        };
        Ok(outcome)
    }

    /// Patches `upload_progress` on the provisional record of `operation_id`.
    /// Never lowers progress. Used by the upload progress stream.
    pub(crate) fn patch_upload_progress(&self, scope_id: &str, operation_id: &str, progress: u8) -> ApplyOutcome {
        let mut store = self.write();
        let Some(temp_id) = store.provisional_by_op.get(operation_id).cloned() else {
            return ApplyOutcome::Ignored(IgnoreReason::UnknownEntity);
        };
        let Some(entry) = store.videos.get_mut(&temp_id) else {
            return ApplyOutcome::Ignored(IgnoreReason::UnknownEntity);
        };
        if entry.scope_id != scope_id {
            return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
        }
        if !entry.slot.is_provisional() {
            return ApplyOutcome::Unchanged;
        }
        let progress = progress.min(100);
        let record = entry.slot.record_mut();
        if record.upload_progress.is_some_and(|current| current >= progress) {
            return ApplyOutcome::Unchanged;
        }
        record.upload_progress = Some(progress);
        if record.status == VideoStatus::Pending {
            record.status = VideoStatus::Uploading;
        }
        ApplyOutcome::Patched
    }

    /// Terminal progress frame. With a finalized record the provisional slot
    /// is replaced; without one the upload is marked fully transferred and
    /// left for `upload-complete` to confirm.
    pub(crate) fn finish_upload(
        &self,
        scope_id: &str,
        operation_id: &str,
        finalized: Option<Video>,
        timestamp: i64,
    ) -> ApplyOutcome {
        match finalized {
            Some(video) => self
                .write()
                .complete_upload(scope_id, Some(operation_id), None, video, timestamp),
            None => {
                let outcome = self.patch_upload_progress(scope_id, operation_id, 100);
                let mut store = self.write();
                if let Some(temp_id) = store.provisional_by_op.get(operation_id).cloned() {
                    if let Some(entry) = store.videos.get_mut(&temp_id) {
                        if entry.slot.is_provisional() && entry.scope_id == scope_id {
                            entry.slot.record_mut().status = VideoStatus::Processing;
                        }
                    }
                }
                outcome
            }
        }
    }
}

impl Store {
    fn resolve_video_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    fn ordered_chapters(&self, course_id: &str) -> Vec<String> {
        let mut children: Vec<(i64, &str)> = self
            .chapters
            .values()
            .filter(|c| c.course_id == course_id)
            .map(|c| (c.order, c.id.as_str()))
            .collect();
        children.sort_unstable();
        children.into_iter().map(|(_, id)| id.to_string()).collect()
    }

    fn ordered_videos(&self, chapter_id: &str) -> Vec<String> {
        let mut children: Vec<(i64, &str)> = self
            .videos
            .values()
            .map(|entry| entry.slot.record())
            .filter(|v| v.chapter_id == chapter_id)
            .map(|v| (v.order, v.id.as_str()))
            .collect();
        children.sort_unstable();
        children.into_iter().map(|(_, id)| id.to_string()).collect()
    }

    fn is_tombstoned(&self, kind: EntityType, id: &str, timestamp: i64) -> bool {
        self.tombstones
            .get(&(kind, id.to_string()))
            .is_some_and(|(_, deleted_at)| *deleted_at >= timestamp)
    }

    fn merge_course(&mut self, scope_id: &str, delta: CourseDelta, ts: i64) -> ApplyOutcome {
        let id = delta.id.clone().unwrap_or_else(|| scope_id.to_string());
        if id != scope_id {
            return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
        }
        match self.courses.get_mut(&id) {
            Some(course) => {
                if !is_fresh(course.version, course.updated_at, delta.version, ts) {
                    return ApplyOutcome::Ignored(IgnoreReason::Outdated);
                }
                let before = course.clone();
                if let Some(title) = delta.title {
                    course.title = title;
                }
                if let Some(description) = delta.description {
                    course.description = description;
                }
                if let Some(status) = delta.status {
                    course.status = status;
                }
                course.version = course.version.max(delta.version.unwrap_or(0));
                course.updated_at = course.updated_at.max(ts);
                if course.title == before.title
                    && course.description == before.description
                    && course.status == before.status
                {
                    ApplyOutcome::Unchanged
                } else {
                    ApplyOutcome::Merged
                }
            }
            None => {
                let Some(title) = delta.title else {
                    return ApplyOutcome::Ignored(IgnoreReason::UnknownEntity);
                };
                self.courses.insert(
                    id.clone(),
                    Course {
                        id,
                        title,
                        description: delta.description.unwrap_or_default(),
                        chapter_ids: Vec::new(),
                        status: delta.status.unwrap_or_default(),
                        version: delta.version.unwrap_or(0),
                        updated_at: ts,
                    },
                );
                ApplyOutcome::Inserted
            }
        }
    }

    fn merge_chapter(&mut self, scope_id: &str, delta: ChapterDelta, ts: i64) -> ApplyOutcome {
        if delta.course_id.as_deref().is_some_and(|c| c != scope_id) {
            return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
        }
        match self.chapters.get_mut(&delta.id) {
            Some(chapter) => {
                if chapter.course_id != scope_id {
                    return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
                }
                if !is_fresh(chapter.version, chapter.updated_at, delta.version, ts) {
                    return ApplyOutcome::Ignored(IgnoreReason::Outdated);
                }
                let before = (chapter.title.clone(), chapter.order);
                if let Some(title) = delta.title {
                    chapter.title = title;
                }
                if let Some(order) = delta.order {
                    chapter.order = order;
                }
                chapter.version = chapter.version.max(delta.version.unwrap_or(0));
                chapter.updated_at = chapter.updated_at.max(ts);
                if before == (chapter.title.clone(), chapter.order) {
                    ApplyOutcome::Unchanged
                } else {
                    ApplyOutcome::Merged
                }
            }
            None => {
                if self.is_tombstoned(EntityType::Chapter, &delta.id, ts) {
                    return ApplyOutcome::Ignored(IgnoreReason::Tombstoned);
                }
                let (Some(title), Some(order)) = (delta.title, delta.order) else {
                    return ApplyOutcome::Ignored(IgnoreReason::UnknownEntity);
                };
                self.chapters.insert(
                    delta.id.clone(),
                    Chapter {
                        id: delta.id,
                        course_id: scope_id.to_string(),
                        title,
                        order,
                        video_ids: Vec::new(),
                        version: delta.version.unwrap_or(0),
                        updated_at: ts,
                    },
                );
                ApplyOutcome::Inserted
            }
        }
    }

    fn remove_chapter(&mut self, scope_id: &str, id: &str, ts: i64) -> ApplyOutcome {
        let owner = self.chapters.get(id).map(|c| c.course_id.clone());
        match owner {
            None => ApplyOutcome::Unchanged,
            Some(owner) if owner != scope_id => ApplyOutcome::Ignored(IgnoreReason::ForeignScope),
            Some(_) => {
                self.chapters.remove(id);
                let orphaned: Vec<String> = self
                    .videos
                    .iter()
                    .filter(|(_, v)| v.slot.record().chapter_id == id)
                    .map(|(video_id, _)| video_id.clone())
                    .collect();
                for video_id in &orphaned {
                    self.videos.remove(video_id);
                }
                self.provisional_by_op.retain(|_, temp| !orphaned.contains(&*temp));
                self.aliases.retain(|_, real| !orphaned.contains(&*real));
                self.tombstones
                    .insert((EntityType::Chapter, id.to_string()), (scope_id.to_string(), ts));
                ApplyOutcome::Removed
            }
        }
    }

    /// Scope of the chapter a video points at, when that chapter is cached.
    fn chapter_scope(&self, chapter_id: &str) -> Option<&str> {
        self.chapters.get(chapter_id).map(|c| c.course_id.as_str())
    }

    fn merge_video(&mut self, scope_id: &str, delta: VideoDelta, ts: i64) -> ApplyOutcome {
        if let Some(target) = delta.chapter_id.as_deref() {
            if self.chapter_scope(target).is_some_and(|s| s != scope_id) {
                return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
            }
        }
        let id = self.resolve_video_id(&delta.id).to_string();
        match self.videos.get_mut(&id) {
            Some(entry) => {
                if entry.scope_id != scope_id {
                    return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
                }
                let Slot::Confirmed(video) = &mut entry.slot else {
                    return ApplyOutcome::Ignored(IgnoreReason::Provisional);
                };
                if !is_fresh(video.version, video.updated_at, delta.version, ts) {
                    return ApplyOutcome::Ignored(IgnoreReason::Outdated);
                }
                let before = video.clone();
                if let Some(chapter_id) = delta.chapter_id {
                    video.chapter_id = chapter_id;
                }
                if let Some(order) = delta.order {
                    video.order = order;
                }
                if let Some(title) = delta.title {
                    video.title = title;
                }
                if let Some(size_bytes) = delta.size_bytes {
                    video.size_bytes = size_bytes;
                }
                if let Some(status) = delta.status {
                    video.status = status;
                }
                if let Some(progress) = delta.upload_progress {
                    video.upload_progress = Some(progress.min(100));
                }
                video.version = video.version.max(delta.version.unwrap_or(0));
                video.updated_at = video.updated_at.max(ts);
                let mut compare = before;
                compare.version = video.version;
                compare.updated_at = video.updated_at;
                if compare == *video {
                    ApplyOutcome::Unchanged
                } else {
                    ApplyOutcome::Merged
                }
            }
            None => {
                if self.is_tombstoned(EntityType::Video, &id, ts) {
                    return ApplyOutcome::Ignored(IgnoreReason::Tombstoned);
                }
                let (Some(chapter_id), Some(order), Some(title)) = (delta.chapter_id, delta.order, delta.title)
                else {
                    return ApplyOutcome::Ignored(IgnoreReason::UnknownEntity);
                };
                let video = Video {
                    id: id.clone(),
                    chapter_id,
                    order,
                    title,
                    size_bytes: delta.size_bytes.unwrap_or(0),
                    status: delta.status.unwrap_or_default(),
                    upload_progress: delta.upload_progress,
                    version: delta.version.unwrap_or(0),
                    updated_at: ts,
                };
                self.videos.insert(
                    id,
                    VideoEntry {
                        slot: Slot::Confirmed(video),
                        scope_id: scope_id.to_string(),
                    },
                );
                ApplyOutcome::Inserted
            }
        }
    }

    fn remove_video(&mut self, scope_id: &str, id: &str, ts: i64) -> ApplyOutcome {
        let id = self.resolve_video_id(id).to_string();
        let owner = self.videos.get(&id).map(|v| v.scope_id.clone());
        match owner {
            None => ApplyOutcome::Unchanged,
            Some(owner) if owner != scope_id => ApplyOutcome::Ignored(IgnoreReason::ForeignScope),
            Some(_) => {
                self.videos.remove(&id);
                self.aliases.retain(|_, real| *real != id);
                self.provisional_by_op.retain(|_, temp| *temp != id);
                self.tombstones
                    .insert((EntityType::Video, id), (scope_id.to_string(), ts));
                ApplyOutcome::Removed
            }
        }
    }

    fn remove_provisional(&mut self, temp_id: &str) -> ApplyOutcome {
        if !self.videos.get(temp_id).is_some_and(|v| v.slot.is_provisional()) {
            return ApplyOutcome::Unchanged;
        }
        self.videos.remove(temp_id);
        self.provisional_by_op.retain(|_, temp| temp.as_str() != temp_id);
        ApplyOutcome::Removed
    }

    /// Swaps the provisional slot of an upload for its confirmed record, or
    /// upserts the record when no provisional slot exists (duplicate frame,
    /// upload started elsewhere).
    fn complete_upload(
        &mut self,
        scope_id: &str,
        operation_id: Option<&str>,
        temp_id: Option<&str>,
        mut video: Video,
        ts: i64,
    ) -> ApplyOutcome {
        video.upload_progress = video.upload_progress.map(|p| p.min(100));
        let provisional = operation_id
            .and_then(|op| self.provisional_by_op.get(op).cloned())
            .or_else(|| temp_id.map(str::to_string))
            .filter(|temp| self.videos.get(temp).is_some_and(|e| e.slot.is_provisional()));

        if let Some(temp) = provisional {
            let owner = self.videos.get(&temp).map(|e| e.scope_id.clone()).unwrap_or_default();
            if owner != scope_id {
                return ApplyOutcome::Ignored(IgnoreReason::ForeignScope);
            }
            if self.is_tombstoned(EntityType::Video, &video.id, ts) {
                self.remove_provisional(&temp);
                return ApplyOutcome::Ignored(IgnoreReason::Tombstoned);
            }
            let real_id = video.id.clone();
            let confirmed_elsewhere =
                temp != real_id && self.videos.get(&real_id).is_some_and(|e| !e.slot.is_provisional());
            self.videos.remove(&temp);
            self.provisional_by_op.retain(|_, t| *t != temp);
            if temp != real_id {
                self.aliases.insert(temp, real_id.clone());
            }
            if !confirmed_elsewhere {
                video.updated_at = video.updated_at.max(ts);
                self.videos.insert(
                    real_id,
                    VideoEntry {
                        slot: Slot::Confirmed(video),
                        scope_id: scope_id.to_string(),
                    },
                );
                return ApplyOutcome::Replaced;
            }
            // The real id already arrived through an update event; the
            // freshness guard picks the newer of the two records.
            tracing::debug!("Upload {} confirmed after a newer update; merging", real_id);
        }

        self.merge_video(
            scope_id,
            VideoDelta {
                id: video.id,
                chapter_id: Some(video.chapter_id),
                order: Some(video.order),
                title: Some(video.title),
                size_bytes: Some(video.size_bytes),
                status: Some(video.status),
                upload_progress: video.upload_progress,
                version: Some(video.version),
            },
            ts,
        )
    }
}

//! Answers the engine's refetch requests from `<courseId>.json` snapshot files.
//!
//! In production the host would call the course API; the client binary reads
//! the same JSON shape from disk so it can run against the dummy push server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use lib_sync::core::{CourseSnapshot, RefetchRequest, SyncEngine};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn load(&self, course_id: &str) -> Result<CourseSnapshot> {
        let path = self.dir.join(format!("{}.json", course_id));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let mut snapshot: CourseSnapshot =
            serde_json::from_str(&raw).with_context(|| format!("parsing snapshot {}", path.display()))?;
        if snapshot.fetched_at == 0 {
            snapshot.fetched_at = chrono::Utc::now().timestamp_millis();
        }
        Ok(snapshot)
    }

    /// Hydrates `course_id` from its snapshot file.
    pub async fn hydrate(&self, engine: &SyncEngine, course_id: &str) -> Result<()> {
        let snapshot = self.load(course_id).await?;
        engine.cache().hydrate(course_id, snapshot);
        Ok(())
    }
}

/// Drains refetch requests until the engine drops its sender.
pub async fn serve_refetches(engine: SyncEngine, mut requests: mpsc::UnboundedReceiver<RefetchRequest>, store: SnapshotStore) {
    while let Some(request) = requests.recv().await {
        tracing::info!(
            "Refetching {:?} of {} ({})",
            request.collection,
            request.scope_id,
            request.reason
        );
        if let Err(e) = store.hydrate(&engine, &request.scope_id).await {
            tracing::error!("Refetch of {} failed: {:#}", request.scope_id, e);
        }
    }
    tracing::debug!("Refetch queue closed");
}

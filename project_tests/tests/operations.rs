//! Compound and single operations resolved by events pushed over a real socket.

use anyhow::Result;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;

use lib_sync::core::{Collection, EventKind, MutationResponse, OperationOutcome, SyncEngine, SyncEvent, VideoStatus};
use project_tests::{config, eventually, seed, PushServer, WAIT};

fn accepted(op: &str) -> MutationResponse {
    MutationResponse {
        success: true,
        operation_id: Some(op.to_string()),
        data: None,
    }
}

#[tokio::test]
async fn test_batch_save_signals_once_after_all_three_events() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let scope = engine.open_scope("c1");
    seed(&engine, "c1")?;
    let mut client = server.next_client().await?;

    let (done_tx, done_rx) = oneshot::channel();
    let save = scope.begin_compound(3, move |outcome| {
        let _ = done_tx.send(outcome);
    });
    for op in ["op-rename", "op-delete", "op-upload"] {
        assert!(scope.link_sub_operation(&accepted(op), &save));
    }
    scope.start_upload_as("temp-1", "op-upload", "c1-ch1", 2, "f1.mp4", 1024);
    assert_eq!(engine.get_ordered_children("c1-ch1"), vec!["c1-v1", "temp-1"]);

    client
        .send(&SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "c1-ch1", "title": "Intro 2"})).with_operation("op-rename"))
        .await?;
    client
        .send(&SyncEvent::new(EventKind::VideoDeleteComplete, "c1", json!({"id": "c1-v1"})).with_operation("op-delete"))
        .await?;
    client
        .send(
            &SyncEvent::new(
                EventKind::UploadComplete,
                "c1",
                json!({"tempId": "temp-1", "video": {"id": "v-42", "chapterId": "c1-ch1", "order": 2, "title": "f1.mp4", "status": "ready"}}),
            )
            .with_operation("op-upload"),
        )
        .await?;

    let outcome = timeout(WAIT, done_rx).await??;
    assert_eq!(outcome, OperationOutcome::Completed);
    assert_eq!(engine.cache().get_chapter("c1-ch1").map(|c| c.title), Some("Intro 2".to_string()));
    assert!(engine.get_entity("c1-v1").is_none());
    assert_eq!(engine.get_ordered_children("c1-ch1"), vec!["v-42"]);
    assert_eq!(engine.cache().get_video("v-42").map(|v| v.status), Some(VideoStatus::Ready));
    assert_eq!(engine.tracker().in_flight(), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_partial_save_times_out_and_requests_refetch() -> Result<()> {
    let mut server = PushServer::start().await?;
    let mut cfg = config(&server.url);
    cfg.operation_timeout_ms = 300;
    let engine = SyncEngine::with_websocket(cfg)?;
    let mut refetch = engine.take_refetch_requests().expect("refetch receiver");
    let scope = engine.open_scope("c1");
    seed(&engine, "c1")?;
    let mut client = server.next_client().await?;

    let (done_tx, done_rx) = oneshot::channel();
    let save = scope.begin_compound(2, move |outcome| {
        let _ = done_tx.send(outcome);
    });
    scope.link_sub_operation(&accepted("op-a"), &save);
    scope.link_sub_operation(&accepted("op-b"), &save);
    client
        .send(&SyncEvent::new(EventKind::ChapterUpdateComplete, "c1", json!({"id": "c1-ch1", "title": "Renamed"})).with_operation("op-a"))
        .await?;

    let outcome = timeout(WAIT, done_rx).await??;
    assert_eq!(outcome, OperationOutcome::TimedOut { received: 1, expected: 2 });
    assert!(!outcome.is_success());

    let request = timeout(WAIT, refetch.recv()).await?.expect("refetch request");
    assert_eq!(request.scope_id, "c1");
    assert_eq!(request.collection, Collection::All);
    assert!(engine.cache().is_stale("c1", Collection::Videos));
    // The event that did arrive was still applied.
    assert_eq!(engine.cache().get_chapter("c1-ch1").map(|c| c.title), Some("Renamed".to_string()));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_server_failure_resolves_with_reason() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let scope = engine.open_scope("c1");
    seed(&engine, "c1")?;
    let mut client = server.next_client().await?;

    let (done_tx, done_rx) = oneshot::channel();
    let op = scope.track_mutation(&accepted("op-move"), 1, move |outcome| {
        let _ = done_tx.send(outcome);
    });
    assert_eq!(op.as_deref(), Some("op-move"));

    client
        .send(&SyncEvent::new(EventKind::OperationFailed, "c1", json!({"reason": "chapter is locked"})).with_operation("op-move"))
        .await?;

    let outcome = timeout(WAIT, done_rx).await??;
    assert_eq!(
        outcome,
        OperationOutcome::Failed {
            reason: "chapter is locked".to_string(),
            received: 0,
            expected: 1,
        }
    );
    eventually("tracker to drain", || engine.tracker().in_flight() == 0).await?;

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_mutation_never_waits_for_events() -> Result<()> {
    let server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let scope = engine.open_scope("c1");

    let (done_tx, done_rx) = oneshot::channel();
    let rejected = MutationResponse {
        success: false,
        ..Default::default()
    };
    assert!(scope.track_mutation(&rejected, 2, move |outcome| {
        let _ = done_tx.send(outcome);
    })
    .is_none());
    assert!(matches!(done_rx.await?, OperationOutcome::Failed { received: 0, expected: 2, .. }));
    assert_eq!(engine.tracker().in_flight(), 0);

    engine.shutdown().await;
    Ok(())
}

//! Connection lifecycle against a real socket: reconnects, protocol errors,
//! scope isolation and shutdown when the last scope goes away.

use anyhow::Result;
use serde_json::json;

use lib_sync::core::{ConnectionStatus, EventKind, SyncEngine, SyncEvent};
use project_tests::{config, eventually, seed, PushServer};

fn rename(scope: &str, chapter: &str, title: &str) -> SyncEvent {
    SyncEvent::new(EventKind::ChapterUpdateComplete, scope, json!({"id": chapter, "title": title}))
}

fn title_of(engine: &SyncEngine, chapter: &str) -> Option<String> {
    engine.cache().get_chapter(chapter).map(|c| c.title)
}

#[tokio::test]
async fn test_reconnects_after_server_close() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let _scope = engine.open_scope("c1");
    seed(&engine, "c1")?;

    let mut first = server.next_client().await?;
    first.send(&rename("c1", "c1-ch1", "Before drop")).await?;
    eventually("first event", || title_of(&engine, "c1-ch1").as_deref() == Some("Before drop")).await?;
    first.close().await?;

    let mut second = server.next_client().await?;
    eventually("reconnected", || engine.status() == ConnectionStatus::Connected).await?;
    second.send(&rename("c1", "c1-ch1", "After reconnect")).await?;
    eventually("second event", || title_of(&engine, "c1-ch1").as_deref() == Some("After reconnect")).await?;
    assert!(!engine.is_degraded());
    assert_eq!(engine.connection().frames_dispatched(), 2);

    engine.shutdown().await;
    assert_eq!(engine.status(), ConnectionStatus::Closed);
    Ok(())
}

#[tokio::test]
async fn test_malformed_frame_drops_the_connection() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let _scope = engine.open_scope("c1");
    seed(&engine, "c1")?;

    let mut first = server.next_client().await?;
    // Unknown types are skipped, broken JSON is not.
    first.send_raw(r#"{"type":"course:archived","scopeId":"c1","data":{},"timestamp":1}"#).await?;
    first.send_raw("{not json").await?;
    first.wait_closed().await?;

    let mut second = server.next_client().await?;
    second.send(&rename("c1", "c1-ch1", "Recovered")).await?;
    eventually("event after recovery", || title_of(&engine, "c1-ch1").as_deref() == Some("Recovered")).await?;
    assert_eq!(engine.connection().frames_dispatched(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_events_only_touch_their_own_scope() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let _c1 = engine.open_scope("c1");
    let _c2 = engine.open_scope("c2");
    seed(&engine, "c1")?;
    seed(&engine, "c2")?;
    assert_eq!(engine.open_scopes(), 2);

    // One connection carries every scope.
    let mut client = server.next_client().await?;
    client.send(&rename("c2", "c1-ch1", "Hijacked")).await?;
    client.send(&rename("c2", "c2-ch1", "Scoped")).await?;
    client
        .send(&SyncEvent::new(EventKind::VideoDeleteComplete, "c2", json!({"id": "c1-v1"})))
        .await?;
    eventually("c2 event", || title_of(&engine, "c2-ch1").as_deref() == Some("Scoped")).await?;

    assert_eq!(title_of(&engine, "c1-ch1").as_deref(), Some("Intro"));
    assert!(engine.get_entity("c1-v1").is_some());
    assert_eq!(engine.get_ordered_children("c1-ch1"), vec!["c1-v1"]);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_closing_last_scope_disconnects_after_linger() -> Result<()> {
    let mut server = PushServer::start().await?;
    let engine = SyncEngine::with_websocket(config(&server.url))?;
    let scope = engine.open_scope("c1");
    seed(&engine, "c1")?;
    let mut client = server.next_client().await?;
    eventually("connected", || engine.status() == ConnectionStatus::Connected).await?;

    scope.close();
    // Detached at once, data kept for the linger window.
    client.send(&rename("c1", "c1-ch1", "Ignored")).await?;
    assert_eq!(title_of(&engine, "c1-ch1").as_deref(), Some("Intro"));

    client.wait_closed().await?;
    eventually("closed status", || engine.status() == ConnectionStatus::Closed).await?;
    assert!(engine.get_entity("c1").is_none());
    assert_eq!(engine.open_scopes(), 0);
    Ok(())
}

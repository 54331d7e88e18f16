//! One-shot timer service: set/clear semantics, firing, and the
//! persistence round-trip across a restart.

mod common;

use chrono::Utc;
use common::RecordingMessages;
use gateway::platform::MessageService;
use gateway::timer::oneshot::{MISFIRE_GRACE_SECONDS, OneShotTimerService, PERSIST_VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn persist_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("oneshot_timers.json")
}

fn read_persisted(path: &PathBuf) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn future_timer_is_persisted_and_listed() {
    let dir = tempfile::tempdir().unwrap();
    let path = persist_path(&dir);
    let service = OneShotTimerService::new(path.clone(), RecordingMessages::new());

    let trigger_time = Utc::now().timestamp() + 3600;
    assert!(
        service
            .set_timer("sse-p-group_1", trigger_time, "water the plants", false, false, None, None)
            .await
    );

    let timers = service.get_timers("sse-p-group_1").await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].trigger_time, trigger_time);
    assert!(!timers[0].temporary);

    let persisted = read_persisted(&path);
    assert_eq!(persisted["version"], PERSIST_VERSION);
    assert_eq!(persisted["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(persisted["tasks"][0]["event_desc"], "water the plants");
}

#[tokio::test]
async fn past_trigger_time_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = OneShotTimerService::new(persist_path(&dir), RecordingMessages::new());

    let past = Utc::now().timestamp() - 5;
    assert!(
        !service
            .set_timer("sse-p-group_1", past, "too late", false, false, None, None)
            .await
    );
    assert!(service.get_timers("sse-p-group_1").await.is_empty());
}

#[tokio::test]
async fn zero_trigger_schedules_an_immediate_agent_task() {
    let dir = tempfile::tempdir().unwrap();
    let messages = RecordingMessages::new();
    let service = OneShotTimerService::new(persist_path(&dir), Arc::clone(&messages) as Arc<dyn MessageService>);

    assert!(
        service
            .set_timer("sse-p-group_1", 0, "", false, false, None, None)
            .await
    );
    assert_eq!(
        messages.scheduled.lock().await.as_slice(),
        ["sse-p-group_1".to_owned()]
    );
}

#[tokio::test]
async fn negative_trigger_clears_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let service = OneShotTimerService::new(persist_path(&dir), RecordingMessages::new());
    let future = Utc::now().timestamp() + 3600;

    // One durable timer, one temporary (override) timer.
    assert!(
        service
            .set_timer("sse-p-group_1", future, "durable", false, false, None, None)
            .await
    );
    assert!(
        service
            .set_timer("sse-p-group_1", future + 60, "temp", false, true, None, None)
            .await
    );
    assert_eq!(service.get_timers("sse-p-group_1").await.len(), 2);

    // Clear only the temporary one.
    assert!(
        service
            .set_timer("sse-p-group_1", -1, "", false, false, Some(true), None)
            .await
    );
    let timers = service.get_timers("sse-p-group_1").await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].event_desc, "durable");

    // Clear everything.
    assert!(
        service
            .set_timer("sse-p-group_1", -1, "", false, false, None, None)
            .await
    );
    assert!(service.get_timers("sse-p-group_1").await.is_empty());
}

#[tokio::test]
async fn override_replaces_previous_temporary_timer() {
    let dir = tempfile::tempdir().unwrap();
    let service = OneShotTimerService::new(persist_path(&dir), RecordingMessages::new());
    let future = Utc::now().timestamp() + 3600;

    assert!(
        service
            .set_timer("sse-p-group_1", future, "first temp", false, true, None, None)
            .await
    );
    assert!(
        service
            .set_timer("sse-p-group_1", future + 60, "second temp", false, true, None, None)
            .await
    );

    let timers = service.get_timers("sse-p-group_1").await;
    assert_eq!(timers.len(), 1, "a channel holds at most one temporary timer");
    assert_eq!(timers[0].event_desc, "second temp");
}

#[tokio::test]
async fn callback_timers_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = persist_path(&dir);
    let service = OneShotTimerService::new(path.clone(), RecordingMessages::new());
    let future = Utc::now().timestamp() + 3600;

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let callback: gateway::timer::oneshot::TimerCallback = Arc::new(move || {
        let flag = Arc::clone(&flag);
        Box::pin(async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
    });
    assert!(
        service
            .set_timer(
                "sse-p-group_1",
                future,
                "system housekeeping",
                true,
                false,
                None,
                Some(callback),
            )
            .await
    );

    assert_eq!(service.get_timers("sse-p-group_1").await.len(), 1);
    // The durable file must not contain the callback-bearing timer.
    if path.exists() {
        let persisted = read_persisted(&path);
        assert!(persisted["tasks"].as_array().unwrap().is_empty());
    }
}

#[tokio::test]
async fn due_timer_fires_reminder_with_trigger_agent() {
    let dir = tempfile::tempdir().unwrap();
    let messages = RecordingMessages::new();
    let service = OneShotTimerService::new(persist_path(&dir), Arc::clone(&messages) as Arc<dyn MessageService>);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _task = service.start(shutdown_rx).await;

    let trigger_time = Utc::now().timestamp() + 1;
    assert!(
        service
            .set_timer("sse-p-group_1", trigger_time, "stretch", false, false, None, None)
            .await
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let sent = messages.sent.lock().await;
            if let Some((chat_key, content, trigger_agent)) = sent.first() {
                assert_eq!(chat_key, "sse-p-group_1");
                assert_eq!(content, "⏰ 定时提醒：stretch");
                assert!(*trigger_agent);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timer did not fire in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(service.get_timers("sse-p-group_1").await.is_empty());
}

#[tokio::test]
async fn restart_restores_future_timers_and_compensates_recent_misfires() {
    let dir = tempfile::tempdir().unwrap();
    let path = persist_path(&dir);
    let now = Utc::now().timestamp();

    // Simulate the previous process's durable state: one future timer,
    // one missed within grace, one missed beyond grace.
    let previous = serde_json::json!({
        "version": PERSIST_VERSION,
        "tasks": [
            {"chat_key": "sse-p-group_1", "trigger_time": now + 3600, "event_desc": "future", "temporary": false},
            {"chat_key": "sse-p-group_2", "trigger_time": now - 10, "event_desc": "recent", "temporary": false},
            {"chat_key": "sse-p-group_3", "trigger_time": now - MISFIRE_GRACE_SECONDS - 60, "event_desc": "ancient", "temporary": false},
        ]
    });
    std::fs::write(&path, serde_json::to_vec(&previous).unwrap()).unwrap();

    let messages = RecordingMessages::new();
    let service = OneShotTimerService::new(path.clone(), Arc::clone(&messages) as Arc<dyn MessageService>);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _task = service.start(shutdown_rx).await;

    // The future timer survives the restart.
    let timers = service.get_timers("sse-p-group_1").await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].event_desc, "future");

    // The recent misfire fired exactly once with the make-up marker.
    let sent = messages.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "sse-p-group_2");
    assert_eq!(sent[0].1, "⏰ 定时提醒（补发）：recent");
    assert!(sent[0].2);
    drop(sent);

    // The ancient one is gone without firing.
    assert!(service.get_timers("sse-p-group_3").await.is_empty());

    // The durable file was rewritten without the consumed entries.
    let persisted = read_persisted(&path);
    let tasks = persisted["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["event_desc"], "future");
}

#[tokio::test]
async fn version_mismatch_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = persist_path(&dir);
    std::fs::write(
        &path,
        serde_json::to_vec(&serde_json::json!({
            "version": 99,
            "tasks": [{"chat_key": "sse-p-group_1", "trigger_time": 1, "event_desc": "x", "temporary": false}]
        }))
        .unwrap(),
    )
    .unwrap();

    let service = OneShotTimerService::new(path, RecordingMessages::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _task = service.start(shutdown_rx).await;
    assert!(service.get_timers("sse-p-group_1").await.is_empty());
}

//! Command endpoint contract: status codes, header requirements, state
//! effects.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bridge_protocol::{RegisterReply, ResponseReply};
use common::app_state;
use gateway::config::SseConfig;
use http_body_util::BodyExt;
use tower::ServiceExt;

fn post_command(body: serde_json::Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/connect")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn register_allocates_a_client() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());

    let response = router
        .oneshot(post_command(
            serde_json::json!({
                "cmd": "register",
                "platform": "p",
                "client_name": "a",
                "client_version": "1"
            }),
            &[],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let reply: RegisterReply = serde_json::from_value(body_json(response).await).unwrap();
    assert!(!reply.client_id.is_empty());
    assert!(state.registry.get(&reply.client_id).await.is_some());
}

#[tokio::test]
async fn missing_or_unknown_cmd_is_a_400() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state);

    let response = router
        .clone()
        .oneshot(post_command(serde_json::json!({"foo": 1}), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(post_command(serde_json::json!({"cmd": "explode"}), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn subscribe_requires_client_id_header() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());

    let body = serde_json::json!({"cmd": "subscribe", "channel_ids": ["g1"]});

    let response = router
        .clone()
        .oneshot(post_command(body.clone(), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .clone()
        .oneshot(post_command(body.clone(), &[("X-Client-ID", "ghost")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;
    let response = router
        .oneshot(post_command(
            body,
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(client.is_subscribed("g1").await);
}

#[tokio::test]
async fn unsubscribe_removes_channels() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());
    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;
    client.subscribe(&["g1".to_owned(), "g2".to_owned()]).await;

    let response = router
        .oneshot(post_command(
            serde_json::json!({"cmd": "unsubscribe", "channel_ids": ["g1"]}),
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!client.is_subscribed("g1").await);
    assert!(client.is_subscribed("g2").await);
}

#[tokio::test]
async fn access_key_gates_without_mutating_state() {
    let (state, _ingest) = app_state(SseConfig {
        access_key: Some("k1".to_owned()),
        ..SseConfig::default()
    });
    let router = gateway::build_router(state.clone());

    let register = serde_json::json!({
        "cmd": "register", "platform": "p", "client_name": "a", "client_version": "1"
    });

    let response = router
        .clone()
        .oneshot(post_command(register.clone(), &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(post_command(register.clone(), &[("X-Access-Key", "nope")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // Rejected commands never mutate the registry.
    assert!(state.registry.is_empty().await);

    let response = router
        .oneshot(post_command(register, &[("X-Access-Key", "k1")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn stream_connect_respects_access_key() {
    let (state, _ingest) = app_state(SseConfig {
        access_key: Some("k1".to_owned()),
        ..SseConfig::default()
    });
    let router = gateway::build_router(state.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/connect?client_name=a&platform=p")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(state.registry.is_empty().await);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/connect?client_name=a&platform=p&access_key=k1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn stream_reconnect_reuses_known_client() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());
    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;
    client.subscribe(&["g1".to_owned()]).await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/connect?client_id={}", client.client_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // Reused, not re-registered; subscriptions intact.
    assert_eq!(state.registry.len().await, 1);
    assert!(client.is_subscribed("g1").await);

    // An unknown presented id registers a brand-new client.
    let response = router
        .oneshot(
            Request::builder()
                .uri("/connect?client_id=not-a-known-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.registry.len().await, 2);
}

#[tokio::test]
async fn inbound_message_reaches_the_ingest_pipeline() {
    let (state, ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());
    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;

    let response = router
        .oneshot(post_command(
            serde_json::json!({
                "cmd": "message",
                "channel_id": "group_1",
                "message": {
                    "msg_id": "m1",
                    "channel_id": "group_1",
                    "platform_name": "p",
                    "from_id": "u1",
                    "from_name": "ada",
                    "timestamp": 1727000000,
                    "segments": [{"type": "text", "content": "hi"}]
                }
            }),
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let collected = ingest.collected.lock().await;
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].0.channel_id, "group_1");
    assert_eq!(collected[0].2.content_text, "hi");
}

#[tokio::test]
async fn response_command_resolves_a_pending_slot_once() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());
    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.register_handler("r1", tx).await;

    let body = serde_json::json!({
        "cmd": "response",
        "request_id": "r1",
        "success": true,
        "data": {"message_id": "m1", "success": true}
    });

    let response = router
        .clone()
        .oneshot(post_command(
            body.clone(),
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let reply: ResponseReply = serde_json::from_value(body_json(response).await).unwrap();
    assert!(reply.success);

    let envelope = rx.await.unwrap();
    assert_eq!(envelope.request_id, "r1");
    assert!(envelope.success);

    // A second delivery finds no slot and reports failure.
    let response = router
        .oneshot(post_command(
            body,
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    let reply: ResponseReply = serde_json::from_value(body_json(response).await).unwrap();
    assert!(!reply.success);
}

#[tokio::test]
async fn commands_bump_the_client_heartbeat() {
    let (state, _ingest) = app_state(SseConfig::default());
    let router = gateway::build_router(state.clone());
    let client = state
        .registry
        .register("a".into(), "p".into(), "1".into())
        .await;
    let stale = chrono::Utc::now() - chrono::Duration::seconds(50);
    // Not expired yet, but close; any command refreshes it.
    let before = client.last_heartbeat().await;
    assert!(before > stale);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let response = router
        .oneshot(post_command(
            serde_json::json!({"cmd": "subscribe", "channel_ids": []}),
            &[("X-Client-ID", client.client_id.as_str())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(client.last_heartbeat().await > before);
}

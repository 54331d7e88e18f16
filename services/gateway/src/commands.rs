//! The command endpoint: `POST /connect`.
//!
//! One JSON body `{cmd, ...}` plus the `X-Client-ID` / `X-Access-Key`
//! headers.  Validation contract: unknown `cmd` → 400, missing required
//! header → 400, invalid access key → 401, unknown client id → 404,
//! schema mismatch → 400 with a reason string.

use crate::convert;
use crate::registry::SseClient;
use crate::responses::{HttpResult, bad_request, internal_error, not_found, unauthorized};
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge_protocol::{AckReply, Command, RegisterReply, ResponseReply, command_names};
use std::sync::Arc;
use tracing::{info, warn};

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const ACCESS_KEY_HEADER: &str = "x-access-key";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn require_client(state: &AppState, client_id: &str) -> HttpResult<Arc<SseClient>> {
    state
        .registry
        .get(client_id)
        .await
        .ok_or_else(|| not_found(format!("unknown client: {client_id}")))
}

pub async fn command_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> HttpResult<Response> {
    let config = state.config.read().await.clone();
    if !config.key_matches(header_str(&headers, ACCESS_KEY_HEADER)) {
        warn!("command rejected: invalid access key");
        return Err(unauthorized("invalid access key"));
    }

    let Some(cmd) = payload.get("cmd").and_then(serde_json::Value::as_str) else {
        return Err(bad_request("missing cmd field"));
    };
    let cmd = cmd.to_owned();
    if !command_names::ALL.contains(&cmd.as_str()) {
        return Err(bad_request(format!("unknown command: {cmd}")));
    }

    let client_id = header_str(&headers, CLIENT_ID_HEADER).map(str::to_owned);
    info!(cmd = %cmd, client_id = ?client_id, "command received");

    // Every command carrying a client id bumps that client's heartbeat.
    if let Some(id) = &client_id {
        match state.registry.get(id).await {
            Some(client) => client.touch().await,
            None if cmd != command_names::REGISTER => {
                warn!(client_id = %id, cmd = %cmd, "command from unknown client id");
            }
            None => {}
        }
    }

    if cmd != command_names::REGISTER && client_id.is_none() {
        return Err(bad_request(format!(
            "command '{cmd}' requires the X-Client-ID header"
        )));
    }

    let command: Command = serde_json::from_value(payload)
        .map_err(|e| bad_request(format!("invalid {cmd} command: {e}")))?;

    match command {
        Command::Register {
            platform,
            client_name,
            client_version,
        } => {
            let client = state
                .registry
                .register(client_name.clone(), platform, client_version.clone())
                .await;
            Ok(Json(RegisterReply {
                client_id: client.client_id.clone(),
                message: format!("client {client_name} ({client_version}) registered"),
            })
            .into_response())
        }

        Command::Subscribe { channel_ids } => {
            let client = require_client(&state, client_id.as_deref().unwrap_or_default()).await?;
            client.subscribe(&channel_ids).await;
            Ok(Json(AckReply {
                message: format!("subscribed {} channels", channel_ids.len()),
            })
            .into_response())
        }

        Command::Unsubscribe { channel_ids } => {
            let client = require_client(&state, client_id.as_deref().unwrap_or_default()).await?;
            client.unsubscribe(&channel_ids).await;
            Ok(Json(AckReply {
                message: format!("unsubscribed {} channels", channel_ids.len()),
            })
            .into_response())
        }

        Command::Message { channel_id, message } => {
            let _client = require_client(&state, client_id.as_deref().unwrap_or_default()).await?;
            if message.channel_id != channel_id {
                warn!(
                    outer = %channel_id,
                    inner = %message.channel_id,
                    "message command channel mismatch, using the message's channel"
                );
            }
            let (channel, user, platform_message) = convert::inbound_to_platform(&message);
            state
                .ingest
                .collect_message(channel, user, platform_message)
                .await
                .map_err(internal_error)?;
            Ok(Json(AckReply {
                message: "message accepted".to_owned(),
            })
            .into_response())
        }

        Command::Response(envelope) => {
            let client = require_client(&state, client_id.as_deref().unwrap_or_default()).await?;
            let consumed = client.resolve_response(envelope).await;
            Ok(Json(ResponseReply { success: consumed }).into_response())
        }
    }
}

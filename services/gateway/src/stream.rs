//! The SSE stream endpoint and per-client event generator.
//!
//! On connect the generator emits a `connected` event, then alternates
//! between heartbeat emission (every 5 s) and bounded waits on the client's
//! event queue (1 s) until the client is removed or the peer drops the
//! connection — axum cancels the generator when the response body is
//! abandoned, so peer disconnect needs no explicit polling.

use crate::registry::SseClient;
use crate::responses::{HttpResult, unauthorized};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use bridge_protocol::{ConnectedData, HeartbeatData, WireEvent, event_types};
use chrono::Utc;
use futures_util::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound between heartbeat events on a healthy stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Bounded wait on the event queue per loop iteration.
pub const QUEUE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_name: Option<String>,
    pub platform: Option<String>,
    pub client_id: Option<String>,
    pub access_key: Option<String>,
}

/// `GET /connect` — open (or resume) an SSE stream.
///
/// A known `client_id` is reused with its subscriptions intact; anything
/// else registers a new client.  A missing `client_name` is auto-generated.
pub async fn sse_connect(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> HttpResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let config = state.config.read().await.clone();
    if !config.key_matches(params.access_key.as_deref()) {
        warn!("stream connect rejected: invalid access key");
        return Err(unauthorized("invalid access key"));
    }

    let platform = params
        .platform
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "unknown".to_owned());

    let client = match &params.client_id {
        Some(client_id) => match state.registry.get(client_id).await {
            Some(existing) => {
                // Heartbeat only; platform and subscriptions are kept.
                existing.touch().await;
                info!(client_id = %client_id, name = %existing.name, "client stream reconnected");
                existing
            }
            None => {
                let name = params
                    .client_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| client_id.clone());
                let client = state
                    .registry
                    .register(name, platform.clone(), String::new())
                    .await;
                info!(
                    presented_id = %client_id,
                    client_id = %client.client_id,
                    "unknown client id presented, registered as new"
                );
                client
            }
        },
        None => {
            let name = params
                .client_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(generate_client_name);
            state.registry.register(name, platform, String::new()).await
        }
    };

    client.touch().await;
    Ok(Sse::new(client_event_stream(client)))
}

fn generate_client_name() -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("sse-client-{}", &tag[..8])
}

/// The per-client event generator.
pub(crate) fn client_event_stream(
    client: Arc<SseClient>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        if let Ok(connected) = WireEvent::new(
            event_types::CONNECTED,
            &ConnectedData {
                client_id: client.client_id.clone(),
                timestamp: Utc::now().timestamp(),
            },
        ) {
            yield Ok(to_axum_event(&connected));
        }

        let mut last_beat: Option<Instant> = None;
        while client.is_alive() {
            let beat_due = last_beat.is_none_or(|at| at.elapsed() >= HEARTBEAT_INTERVAL);
            if beat_due {
                if let Ok(heartbeat) = WireEvent::new(
                    event_types::HEARTBEAT,
                    &HeartbeatData {
                        timestamp: Utc::now().timestamp(),
                    },
                ) {
                    yield Ok(to_axum_event(&heartbeat));
                }
                client.touch().await;
                last_beat = Some(Instant::now());
            }

            if let Some(event) = client.recv_event_timeout(QUEUE_WAIT).await {
                yield Ok(to_axum_event(&event));
            }
        }
        debug!(client_id = %client.client_id, "event stream ended");
    }
}

fn to_axum_event(event: &WireEvent) -> Event {
    Event::default()
        .event(&event.event)
        .data(event.data.to_string())
}

//! Outbound dispatcher and correlation layer.
//!
//! Given a platform send request the dispatcher resolves the target
//! channel, selects subscribed clients, routes oversize attachments
//! through the chunk emitter, and drives the remaining message through
//! send-with-ack or fire-and-forget depending on configuration.
//!
//! Correlation: each outbound request allocates a fresh UUID `request_id`
//! and a one-shot slot on the target client.  The slot resolves exactly
//! once — by the matching `response` command or by the timeout path, which
//! removes the slot so a late response is dropped.

use crate::chunker;
use crate::config::SharedConfig;
use crate::convert;
use crate::platform::{PlatformSendSegment, parse_chat_key};
use crate::registry::{ClientRegistry, SseClient};
use bridge_protocol::{
    ChannelInfo, FileKind, GetChannelInfoRequest, GetSelfInfoRequest, GetUserInfoRequest,
    MessageSegment, RequestEnvelope, RequestKind, SendMessageRequest, SetMessageReactionRequest,
    SetMessageReactionResponse, UserInfo, WireEvent,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid chat key: {0}")]
    InvalidChatKey(String),
    #[error("no client subscribes channel {0}")]
    NoSubscribers(String),
}

pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    config: SharedConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>, config: SharedConfig) -> Arc<Self> {
        Arc::new(Self { registry, config })
    }

    async fn response_timeout(&self) -> Duration {
        self.config.read().await.response_timeout
    }

    /// Forward a platform send request to the clients subscribed to the
    /// target channel.
    ///
    /// `Ok(true)`: delivered (acknowledged, enqueued under fire-and-forget,
    /// or fully chunk-streamed to at least one client).  `Ok(false)`: every
    /// subscribed client was tried and none confirmed delivery.
    pub async fn forward_message(
        &self,
        chat_key: &str,
        segments: &[PlatformSendSegment],
    ) -> Result<bool, DispatchError> {
        let (_platform, channel_id) = parse_chat_key(chat_key)
            .ok_or_else(|| DispatchError::InvalidChatKey(chat_key.to_owned()))?;

        let message = convert::platform_to_wire(channel_id, segments).await;
        let clients = self.registry.by_channel(channel_id).await;
        if clients.is_empty() {
            warn!(channel_id, "no subscribed clients for outbound message");
            return Err(DispatchError::NoSubscribers(channel_id.to_owned()));
        }

        // Oversize attachments bypass the request/ack path entirely: the
        // chunk stream is the delivery.
        if let Some(delivered) = self.send_oversize_attachments(&message, &clients).await {
            return Ok(delivered);
        }

        Ok(self.send_to_clients(&clients, &message).await)
    }

    /// Chunk every oversize image/file attachment to every selected client.
    ///
    /// Returns `None` when the message carries no oversize attachment,
    /// otherwise whether at least one client received a full chunk stream.
    async fn send_oversize_attachments(
        &self,
        message: &SendMessageRequest,
        clients: &[Arc<SseClient>],
    ) -> Option<bool> {
        let mut chunked_any = false;
        let mut delivered = false;

        for segment in &message.segments {
            let (base64_url, name, kind) = match segment {
                MessageSegment::Image {
                    base64_url: Some(url),
                    name,
                    ..
                } => (url, name, FileKind::Image),
                MessageSegment::File {
                    base64_url: Some(url),
                    name,
                    ..
                } => (url, name, FileKind::File),
                _ => continue,
            };
            let Some((mime, data)) = convert::split_data_url(base64_url) else {
                continue;
            };
            if !chunker::needs_chunking(data) {
                continue;
            }

            chunked_any = true;
            info!(filename = %name, "oversize attachment, switching to chunked transfer");
            for client in clients {
                if chunker::send_chunked(client, data, mime, name, kind).await {
                    delivered = true;
                } else {
                    error!(client_id = %client.client_id, filename = %name, "chunked transfer failed");
                }
            }
        }

        chunked_any.then_some(delivered)
    }

    async fn send_to_clients(
        &self,
        clients: &[Arc<SseClient>],
        message: &SendMessageRequest,
    ) -> bool {
        let ignore_response = self.config.read().await.ignore_response;
        if ignore_response {
            self.send_fire_and_forget(clients, message)
        } else {
            self.send_with_ack(clients, message).await
        }
    }

    /// Fire-and-forget: succeed on the first client whose enqueue works.
    fn send_fire_and_forget(
        &self,
        clients: &[Arc<SseClient>],
        message: &SendMessageRequest,
    ) -> bool {
        warn!("ignore-response mode active, not waiting for client acknowledgement");
        for client in clients {
            let request_id = Uuid::new_v4().to_string();
            let Some(event) = request_event(RequestKind::SendMessage, &request_id, message) else {
                continue;
            };
            if client.send_event(event) {
                info!(client_id = %client.client_id, request_id = %request_id, "message enqueued (no ack)");
                return true;
            }
        }
        false
    }

    /// Try each subscribed client sequentially; the first ack with
    /// `success=true` wins.  Timeouts and refusals move on to the next
    /// client; exhausted clients mean `false`.
    async fn send_with_ack(&self, clients: &[Arc<SseClient>], message: &SendMessageRequest) -> bool {
        let timeout = self.response_timeout().await;

        for client in clients {
            match self
                .request_with_ack(client, RequestKind::SendMessage, message, timeout)
                .await
            {
                Some(response) if response.success => {
                    info!(client_id = %client.client_id, "message delivery acknowledged");
                    return true;
                }
                Some(_) => {
                    warn!(client_id = %client.client_id, "client reported delivery failure");
                }
                None => {}
            }
        }
        false
    }

    /// Issue one correlated request to one client and wait for its reply.
    async fn request_with_ack<T: Serialize>(
        &self,
        client: &SseClient,
        kind: RequestKind,
        data: &T,
        timeout: Duration,
    ) -> Option<bridge_protocol::ResponseEnvelope> {
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        client.register_handler(&request_id, reply_tx).await;

        let Some(event) = request_event(kind, &request_id, data) else {
            let _ = client.take_handler(&request_id).await;
            return None;
        };
        if !client.send_event(event) {
            let _ = client.take_handler(&request_id).await;
            return None;
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => {
                // Slot cancelled under us: the client was unregistered.
                None
            }
            Err(_) => {
                warn!(
                    client_id = %client.client_id,
                    request_id = %request_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "client response timed out"
                );
                let _ = client.take_handler(&request_id).await;
                None
            }
        }
    }

    /// Issue a typed info request to the first available client.
    async fn request_any<T, R>(&self, kind: RequestKind, data: &T) -> Option<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let clients = self.registry.all().await;
        let Some(client) = clients.first() else {
            warn!("no connected clients for info request");
            return None;
        };
        let timeout = self.response_timeout().await;

        let response = self.request_with_ack(client, kind, data, timeout).await?;
        if !response.success {
            return None;
        }
        match serde_json::from_value(response.data) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                error!(error = %e, "malformed client response payload");
                None
            }
        }
    }

    pub async fn get_self_info(&self) -> Option<UserInfo> {
        self.request_any(RequestKind::GetSelfInfo, &GetSelfInfoRequest::default())
            .await
    }

    pub async fn get_user_info(&self, user_id: &str) -> Option<UserInfo> {
        self.request_any(
            RequestKind::GetUserInfo,
            &GetUserInfoRequest {
                user_id: user_id.to_owned(),
            },
        )
        .await
    }

    pub async fn get_channel_info(&self, channel_id: &str) -> Option<ChannelInfo> {
        self.request_any(
            RequestKind::GetChannelInfo,
            &GetChannelInfoRequest {
                channel_id: channel_id.to_owned(),
            },
        )
        .await
    }

    pub async fn set_message_reaction(&self, message_id: &str, status: bool) -> bool {
        let response: Option<SetMessageReactionResponse> = self
            .request_any(
                RequestKind::SetMessageReaction,
                &SetMessageReactionRequest {
                    message_id: message_id.to_owned(),
                    status,
                },
            )
            .await;
        response.is_some_and(|r| r.success)
    }
}

/// Wrap a request payload into the envelope event for its kind.
fn request_event<T: Serialize>(kind: RequestKind, request_id: &str, data: &T) -> Option<WireEvent> {
    let data = match serde_json::to_value(data) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "request payload serialization failed");
            return None;
        }
    };
    WireEvent::new(
        kind.event_type(),
        &RequestEnvelope {
            request_id: request_id.to_owned(),
            data,
        },
    )
    .ok()
}

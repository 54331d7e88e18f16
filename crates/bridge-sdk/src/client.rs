//! The bridge client: registration, channel subscriptions, the
//! reconnecting SSE consumer, request dispatch, and the response retry
//! queue.
//!
//! # Protocol
//! 1. POST `register` — receive `client_id`
//! 2. GET the stream with `client_id` — receive `connected`, resubscribe
//! 3. Handle server requests (`send_message`, info lookups, chunk frames)
//! 4. Answer every request via a POST `response` command; a failed POST
//!    goes to the retry queue — the server times out silent clients, so
//!    the response must be delivered even across transient failures.

use crate::chunk_receiver::{ChunkReceiver, ReceivedFile, SWEEP_INTERVAL};
use crate::retry::{RetryPolicy, with_retry};
use crate::sse_parser::SseFrameParser;
use async_trait::async_trait;
use bridge_protocol::{
    ChannelInfo, ChunkComplete, ChunkFrame, GetChannelInfoRequest, GetUserInfoRequest,
    ReceiveMessage, RegisterReply, RequestEnvelope, SendMessageRequest, SendMessageResponse,
    SetMessageReactionRequest, SetMessageReactionResponse, UserInfo, command_names, event_types,
};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONNECT_PATH: &str = "/api/adapters/sse/connect";
/// Queued responses beyond this are dropped instead of enqueued.
const MAX_PENDING_RESPONSES: u64 = 1000;

// ---------------------------------------------------------------------------
// Config & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://localhost:8080`.
    pub server_url: String,
    pub platform: String,
    pub client_name: String,
    pub client_version: String,
    pub access_key: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    /// Attempts before a queued response is abandoned.
    pub max_response_retries: u32,
    /// Pause before each queued-response retry.
    pub response_retry_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        platform: impl Into<String>,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_owned(),
            platform: platform.into(),
            client_name: client_name.into(),
            client_version: client_version.into(),
            access_key: None,
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_response_retries: 5,
            response_retry_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("client not registered")]
    NotRegistered,
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

/// Server-request callbacks.  Defaults log and return canned data so a
/// bare client stays protocol-correct; real integrations override what
/// they support.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_send_message(&self, request: SendMessageRequest) -> SendMessageResponse {
        info!(channel_id = %request.channel_id, segments = request.segments.len(), "send_message request");
        SendMessageResponse {
            message_id: format!("msg_{}", &Uuid::new_v4().simple().to_string()[..8]),
            success: true,
        }
    }

    async fn on_get_user_info(&self, request: GetUserInfoRequest) -> UserInfo {
        info!(user_id = %request.user_id, "get_user_info request");
        UserInfo {
            user_name: format!("user_{}", request.user_id),
            user_id: request.user_id,
            platform_name: "unknown".to_owned(),
            user_avatar: None,
            user_nickname: None,
        }
    }

    async fn on_get_channel_info(&self, request: GetChannelInfoRequest) -> ChannelInfo {
        info!(channel_id = %request.channel_id, "get_channel_info request");
        ChannelInfo {
            channel_name: format!("channel_{}", request.channel_id),
            channel_id: request.channel_id,
            channel_avatar: None,
            member_count: None,
            owner_id: None,
            is_admin: false,
        }
    }

    async fn on_get_self_info(&self) -> UserInfo {
        UserInfo {
            user_id: "self".to_owned(),
            user_name: "self".to_owned(),
            platform_name: "unknown".to_owned(),
            user_avatar: None,
            user_nickname: None,
        }
    }

    async fn on_set_message_reaction(
        &self,
        request: SetMessageReactionRequest,
    ) -> SetMessageReactionResponse {
        info!(message_id = %request.message_id, status = request.status, "set_message_reaction request");
        SetMessageReactionResponse {
            success: true,
            message: None,
        }
    }

    /// A chunked transfer finished reassembling.
    async fn on_file_received(&self, file: ReceivedFile) {
        info!(
            filename = %file.filename,
            bytes = file.bytes.len(),
            mime_type = %file.mime_type,
            "file received"
        );
    }
}

/// Protocol-correct no-op handler.
pub struct DefaultEventHandler;

#[async_trait]
impl EventHandler for DefaultEventHandler {}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClientStats {
    events_received: AtomicU64,
    responses_sent: AtomicU64,
    responses_failed: AtomicU64,
    responses_retried: AtomicU64,
    responses_abandoned: AtomicU64,
}

/// Delivery counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub responses_sent: u64,
    pub responses_failed: u64,
    pub responses_retried: u64,
    pub responses_abandoned: u64,
    pub pending_responses: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct RetryItem {
    request_id: String,
    success: bool,
    data: serde_json::Value,
    retry_count: u32,
}

pub struct BridgeClient {
    config: ClientConfig,
    http: reqwest::Client,
    handler: Arc<dyn EventHandler>,
    client_id: RwLock<Option<String>>,
    subscribed: Mutex<HashSet<String>>,
    running: AtomicBool,
    retry_tx: mpsc::UnboundedSender<RetryItem>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryItem>>>,
    pending_responses: AtomicU64,
    stats: ClientStats,
    chunks: Mutex<ChunkReceiver>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn new(config: ClientConfig, handler: Arc<dyn EventHandler>) -> Arc<Self> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            handler,
            client_id: RwLock::new(None),
            subscribed: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            pending_responses: AtomicU64::new(0),
            stats: ClientStats::default(),
            chunks: Mutex::new(ChunkReceiver::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    /// Register, then start the stream consumer, the response retry worker
    /// and the chunk-assembly sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<(), SdkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("client already running");
            return Ok(());
        }

        if let Err(e) = self.register().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut tasks = self.tasks.lock().await;
        let stream_client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            stream_client.run_stream_loop().await;
        }));

        let retry_rx = self
            .retry_rx
            .lock()
            .await
            .take()
            .expect("retry receiver taken once at start");
        let retry_client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            retry_client.response_retry_loop(retry_rx).await;
        }));

        let sweep_client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while sweep_client.is_running() {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                sweep_client.chunks.lock().await.sweep_expired();
            }
        }));

        Ok(())
    }

    /// Idempotent stop: flags the loops and aborts the background tasks.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("client stopped");
    }

    pub async fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.stats.events_received.load(Ordering::SeqCst),
            responses_sent: self.stats.responses_sent.load(Ordering::SeqCst),
            responses_failed: self.stats.responses_failed.load(Ordering::SeqCst),
            responses_retried: self.stats.responses_retried.load(Ordering::SeqCst),
            responses_abandoned: self.stats.responses_abandoned.load(Ordering::SeqCst),
            pending_responses: self.pending_responses.load(Ordering::SeqCst),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn post_command(&self, payload: serde_json::Value) -> Result<reqwest::Response, SdkError> {
        let url = format!("{}{CONNECT_PATH}", self.config.server_url);
        debug!(cmd = ?payload.get("cmd"), "posting command");

        let client_id = self.client_id.read().await.clone();
        let response = with_retry(&RetryPolicy::default(), || {
            let mut request = self.http.post(&url).json(&payload);
            if let Some(id) = &client_id {
                request = request.header("X-Client-ID", id);
            }
            if let Some(key) = &self.config.access_key {
                request = request.header("X-Access-Key", key);
            }
            async move { request.send().await }
        })
        .await?;
        Ok(response)
    }

    pub async fn register(&self) -> Result<(), SdkError> {
        let payload = serde_json::json!({
            "cmd": command_names::REGISTER,
            "platform": self.config.platform,
            "client_name": self.config.client_name,
            "client_version": self.config.client_version,
        });
        let response = self.post_command(payload).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Rejected { status, body });
        }
        let reply: RegisterReply = response.json().await?;
        info!(client_id = %reply.client_id, "registered");
        *self.client_id.write().await = Some(reply.client_id);
        Ok(())
    }

    pub async fn subscribe_channels(&self, channel_ids: &[String]) -> Result<(), SdkError> {
        self.require_registered().await?;
        let payload = serde_json::json!({
            "cmd": command_names::SUBSCRIBE,
            "channel_ids": channel_ids,
        });
        let response = self.post_command(payload).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Rejected { status, body });
        }
        let mut subscribed = self.subscribed.lock().await;
        for channel_id in channel_ids {
            subscribed.insert(channel_id.clone());
        }
        info!(?channel_ids, "channels subscribed");
        Ok(())
    }

    pub async fn unsubscribe_channels(&self, channel_ids: &[String]) -> Result<(), SdkError> {
        self.require_registered().await?;
        let payload = serde_json::json!({
            "cmd": command_names::UNSUBSCRIBE,
            "channel_ids": channel_ids,
        });
        let response = self.post_command(payload).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Rejected { status, body });
        }
        let mut subscribed = self.subscribed.lock().await;
        for channel_id in channel_ids {
            subscribed.remove(channel_id);
        }
        Ok(())
    }

    /// Relay a platform message inbound to the server.
    pub async fn send_message(
        &self,
        channel_id: &str,
        message: &ReceiveMessage,
    ) -> Result<(), SdkError> {
        self.require_registered().await?;
        let payload = serde_json::json!({
            "cmd": command_names::MESSAGE,
            "channel_id": channel_id,
            "message": message,
        });
        let response = self.post_command(payload).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Rejected { status, body });
        }
        Ok(())
    }

    async fn require_registered(&self) -> Result<(), SdkError> {
        if self.client_id.read().await.is_none() {
            return Err(SdkError::NotRegistered);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Response delivery & retry queue
    // -----------------------------------------------------------------------

    /// Deliver a response for `request_id`.  On any failure the response
    /// is queued for background retry; returns whether the immediate send
    /// succeeded.
    pub async fn deliver_response(
        &self,
        request_id: &str,
        success: bool,
        data: serde_json::Value,
    ) -> bool {
        let payload = serde_json::json!({
            "cmd": command_names::RESPONSE,
            "request_id": request_id,
            "success": success,
            "data": data,
        });
        match self.post_command(payload).await {
            Ok(response) if response.status().is_success() => {
                debug!(request_id, "response delivered");
                self.stats.responses_sent.fetch_add(1, Ordering::SeqCst);
                true
            }
            Ok(response) => {
                warn!(
                    request_id,
                    status = response.status().as_u16(),
                    "response rejected, queueing for retry"
                );
                self.stats.responses_failed.fetch_add(1, Ordering::SeqCst);
                self.enqueue_retry(request_id, success, data, 0);
                false
            }
            Err(e) => {
                warn!(request_id, error = %e, "response send failed, queueing for retry");
                self.stats.responses_failed.fetch_add(1, Ordering::SeqCst);
                self.enqueue_retry(request_id, success, data, 0);
                false
            }
        }
    }

    fn enqueue_retry(
        &self,
        request_id: &str,
        success: bool,
        data: serde_json::Value,
        retry_count: u32,
    ) {
        if self.pending_responses.load(Ordering::SeqCst) >= MAX_PENDING_RESPONSES {
            error!(request_id, "retry queue full, dropping response");
            self.stats.responses_abandoned.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let item = RetryItem {
            request_id: request_id.to_owned(),
            success,
            data,
            retry_count,
        };
        if self.retry_tx.send(item).is_ok() {
            self.pending_responses.fetch_add(1, Ordering::SeqCst);
            debug!(request_id, retry_count, "response queued for retry");
        }
    }

    async fn response_retry_loop(self: Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<RetryItem>) {
        info!("response retry worker started");
        while self.is_running() {
            let item = match tokio::time::timeout(Duration::from_secs(5), retry_rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(item)) => item,
            };
            self.pending_responses.fetch_sub(1, Ordering::SeqCst);

            if item.retry_count >= self.config.max_response_retries {
                error!(
                    request_id = %item.request_id,
                    retries = item.retry_count,
                    "response retry budget exhausted, abandoning"
                );
                self.stats.responses_abandoned.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            tokio::time::sleep(self.config.response_retry_interval).await;
            info!(
                request_id = %item.request_id,
                attempt = item.retry_count + 1,
                "retrying response delivery"
            );

            let payload = serde_json::json!({
                "cmd": command_names::RESPONSE,
                "request_id": item.request_id,
                "success": item.success,
                "data": item.data,
            });
            match self.post_command(payload).await {
                Ok(response) if response.status().is_success() => {
                    self.stats.responses_sent.fetch_add(1, Ordering::SeqCst);
                    self.stats.responses_retried.fetch_add(1, Ordering::SeqCst);
                    info!(request_id = %item.request_id, "response retry delivered");
                }
                Ok(response) => {
                    warn!(
                        request_id = %item.request_id,
                        status = response.status().as_u16(),
                        "response retry rejected"
                    );
                    self.enqueue_retry(
                        &item.request_id,
                        item.success,
                        item.data,
                        item.retry_count + 1,
                    );
                }
                Err(e) => {
                    warn!(request_id = %item.request_id, error = %e, "response retry failed");
                    self.enqueue_retry(
                        &item.request_id,
                        item.success,
                        item.data,
                        item.retry_count + 1,
                    );
                }
            }
        }
        info!("response retry worker stopped");
    }

    // -----------------------------------------------------------------------
    // Stream consumption
    // -----------------------------------------------------------------------

    async fn run_stream_loop(self: Arc<Self>) {
        while self.is_running() {
            match self.consume_stream().await {
                Ok(()) => info!("event stream ended"),
                Err(e) => warn!(error = %e, "event stream failed"),
            }
            if !self.config.auto_reconnect || !self.is_running() {
                break;
            }
            info!(
                seconds = self.config.reconnect_interval.as_secs(),
                "reconnecting after pause"
            );
            tokio::time::sleep(self.config.reconnect_interval).await;
        }
    }

    async fn consume_stream(&self) -> Result<(), SdkError> {
        let url = format!("{}{CONNECT_PATH}", self.config.server_url);
        let mut query: Vec<(&str, String)> = vec![
            ("client_name", self.config.client_name.clone()),
            ("platform", self.config.platform.clone()),
        ];
        if let Some(client_id) = self.client_id.read().await.clone() {
            query.push(("client_id", client_id));
        }
        if let Some(access_key) = self.config.access_key.clone() {
            query.push(("access_key", access_key));
        }

        let response = self.http.get(&url).query(&query).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SdkError::Rejected { status, body });
        }
        info!("event stream connected");

        let mut parser = SseFrameParser::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            if !self.is_running() {
                break;
            }
            let chunk = chunk?;
            for (event_type, data) in parser.push_bytes(&chunk) {
                self.dispatch_event(&event_type, &data).await;
            }
        }
        Ok(())
    }

    async fn dispatch_event(&self, event_type: &str, raw_data: &str) {
        let data: serde_json::Value = match serde_json::from_str(raw_data) {
            Ok(data) => data,
            Err(_) => {
                warn!(event_type, "event data is not JSON");
                serde_json::json!({ "text": raw_data })
            }
        };

        match event_type {
            event_types::CONNECTED => {
                if let Some(client_id) = data.get("client_id").and_then(|v| v.as_str()) {
                    *self.client_id.write().await = Some(client_id.to_owned());
                }
                let channels: Vec<String> =
                    self.subscribed.lock().await.iter().cloned().collect();
                if !channels.is_empty() {
                    if let Err(e) = self.subscribe_channels(&channels).await {
                        warn!(error = %e, "resubscribe after reconnect failed");
                    }
                }
            }
            event_types::HEARTBEAT => {}
            event_types::FILE_CHUNK => {
                self.handle_file_chunk(data).await;
            }
            event_types::FILE_CHUNK_COMPLETE => match serde_json::from_value::<ChunkComplete>(data)
            {
                Ok(complete) => self.chunks.lock().await.handle_complete(&complete),
                Err(e) => warn!(error = %e, "malformed chunk completion"),
            },
            event_types::SEND_MESSAGE
            | event_types::GET_USER_INFO
            | event_types::GET_CHANNEL_INFO
            | event_types::GET_SELF_INFO
            | event_types::SET_MESSAGE_REACTION => {
                self.handle_request(event_type, data).await;
            }
            other => warn!(event_type = other, "unknown event type"),
        }
    }

    async fn handle_file_chunk(&self, data: serde_json::Value) {
        let frame: ChunkFrame = match serde_json::from_value(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed chunk frame");
                return;
            }
        };
        let completed = self.chunks.lock().await.handle_chunk(&frame);
        match completed {
            Ok(Some(file)) => self.handler.on_file_received(file).await,
            Ok(None) => {}
            Err(e) => error!(chunk_id = %frame.chunk_id, error = %e, "chunk assembly failed"),
        }
    }

    async fn handle_request(&self, event_type: &str, data: serde_json::Value) {
        self.stats.events_received.fetch_add(1, Ordering::SeqCst);
        let envelope: RequestEnvelope = match serde_json::from_value(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event_type, error = %e, "request without a valid envelope");
                return;
            }
        };
        let request_id = envelope.request_id.clone();

        let outcome: Result<serde_json::Value, String> =
            self.run_handler(event_type, envelope.data).await;

        let delivered = match outcome {
            Ok(response_data) => {
                self.deliver_response(&request_id, true, response_data).await
            }
            Err(reason) => {
                error!(event_type, request_id = %request_id, reason = %reason, "request handler failed");
                self.deliver_response(&request_id, false, serde_json::json!({ "error": reason }))
                    .await
            }
        };
        if !delivered {
            warn!(
                event_type,
                request_id = %request_id,
                "response not yet delivered, retry queue engaged"
            );
        }
    }

    async fn run_handler(
        &self,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        match event_type {
            event_types::SEND_MESSAGE => {
                let request: SendMessageRequest =
                    serde_json::from_value(data).map_err(|e| e.to_string())?;
                let response = self.handler.on_send_message(request).await;
                serde_json::to_value(response).map_err(|e| e.to_string())
            }
            event_types::GET_USER_INFO => {
                let request: GetUserInfoRequest =
                    serde_json::from_value(data).map_err(|e| e.to_string())?;
                let response = self.handler.on_get_user_info(request).await;
                serde_json::to_value(response).map_err(|e| e.to_string())
            }
            event_types::GET_CHANNEL_INFO => {
                let request: GetChannelInfoRequest =
                    serde_json::from_value(data).map_err(|e| e.to_string())?;
                let response = self.handler.on_get_channel_info(request).await;
                serde_json::to_value(response).map_err(|e| e.to_string())
            }
            event_types::GET_SELF_INFO => {
                let response = self.handler.on_get_self_info().await;
                serde_json::to_value(response).map_err(|e| e.to_string())
            }
            event_types::SET_MESSAGE_REACTION => {
                let request: SetMessageReactionRequest =
                    serde_json::from_value(data).map_err(|e| e.to_string())?;
                let response = self.handler.on_set_message_reaction(request).await;
                serde_json::to_value(response).map_err(|e| e.to_string())
            }
            other => Err(format!("no handler for event type {other}")),
        }
    }
}

//! Client registry: the set of live SSE clients and their per-client state.
//!
//! The registry is the sole owner of the client set.  Every other component
//! looks clients up by id/name/channel/platform and either enqueues events
//! or registers correlation slots on them.  A background sweeper removes
//! clients whose heartbeat has gone stale.

use bridge_protocol::{ResponseEnvelope, WireEvent};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Clients idle longer than this are removed by the sweeper.
pub const CLIENT_EXPIRY_SECONDS: i64 = 60;
/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// SseClient
// ---------------------------------------------------------------------------

/// A single connected client.
///
/// The event queue is fed by the dispatcher/broadcast paths and drained by
/// the owning stream generator; correlation slots are one-shot and removed
/// exactly once — by the matching response or by the timeout path.
pub struct SseClient {
    pub client_id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    last_heartbeat: RwLock<DateTime<Utc>>,
    subscribed: RwLock<HashSet<String>>,
    alive: AtomicBool,
    event_tx: mpsc::UnboundedSender<WireEvent>,
    event_rx: Mutex<mpsc::UnboundedReceiver<WireEvent>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl SseClient {
    fn new(client_id: String, name: String, platform: String, version: String) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        Arc::new(Self {
            client_id,
            name,
            platform,
            version,
            connected_at: now,
            last_heartbeat: RwLock::new(now),
            subscribed: RwLock::new(HashSet::new()),
            alive: AtomicBool::new(true),
            event_tx,
            event_rx: Mutex::new(event_rx),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn shut_down(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Refresh the heartbeat clock.  Called on every received command, on
    /// stream (re)connect and on each heartbeat emission.
    pub async fn touch(&self) {
        *self.last_heartbeat.write().await = Utc::now();
    }

    pub async fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.read().await
    }

    pub async fn is_expired(&self, timeout_seconds: i64) -> bool {
        let last = *self.last_heartbeat.read().await;
        Utc::now().signed_duration_since(last).num_seconds() > timeout_seconds
    }

    pub async fn subscribe(&self, channel_ids: &[String]) {
        let mut set = self.subscribed.write().await;
        for channel_id in channel_ids {
            set.insert(channel_id.clone());
        }
    }

    pub async fn unsubscribe(&self, channel_ids: &[String]) {
        let mut set = self.subscribed.write().await;
        for channel_id in channel_ids {
            set.remove(channel_id);
        }
    }

    pub async fn is_subscribed(&self, channel_id: &str) -> bool {
        self.subscribed.read().await.contains(channel_id)
    }

    pub async fn subscriptions(&self) -> HashSet<String> {
        self.subscribed.read().await.clone()
    }

    /// Enqueue an event for the stream generator.  Returns `false` when the
    /// client is unreachable (removed, or its queue has been torn down).
    pub fn send_event(&self, event: WireEvent) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.event_tx.send(event).is_ok()
    }

    /// Wait up to `wait` for the next queued event.
    ///
    /// The stream generator is the intended consumer; the receiver lock is
    /// taken per call so a reconnecting stream is never starved by a stale
    /// one.
    pub async fn recv_event_timeout(&self, wait: Duration) -> Option<WireEvent> {
        let mut rx = self.event_rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    /// Install a correlation slot for `request_id`.
    ///
    /// A previous slot under the same id is dropped, which cancels its
    /// waiter — request ids are UUIDs, so this only happens on misuse.
    pub async fn register_handler(
        &self,
        request_id: &str,
        reply: oneshot::Sender<ResponseEnvelope>,
    ) {
        let prior = self
            .pending
            .lock()
            .await
            .insert(request_id.to_owned(), reply);
        if prior.is_some() {
            warn!(
                client_id = %self.client_id,
                request_id,
                "replaced an existing correlation slot"
            );
        }
    }

    /// Remove a slot without resolving it (timeout path).
    pub async fn take_handler(
        &self,
        request_id: &str,
    ) -> Option<oneshot::Sender<ResponseEnvelope>> {
        self.pending.lock().await.remove(request_id)
    }

    /// Resolve the pending slot matching the response, if any.
    ///
    /// Returns whether a waiter consumed it.  A late response after the
    /// timeout path finds no slot and is dropped.
    pub async fn resolve_response(&self, response: ResponseEnvelope) -> bool {
        let request_id = response.request_id.clone();
        match self.pending.lock().await.remove(&request_id) {
            Some(reply) => {
                if reply.send(response).is_err() {
                    warn!(
                        client_id = %self.client_id,
                        request_id = %request_id,
                        "correlation waiter gone before the response arrived"
                    );
                    return false;
                }
                true
            }
            None => {
                warn!(
                    client_id = %self.client_id,
                    request_id = %request_id,
                    "response without a pending correlation slot, dropping"
                );
                false
            }
        }
    }

    /// Cancel all pending slots.  Part of client destruction: dropping the
    /// senders wakes every waiter with a cancellation.
    async fn cancel_pending(&self) {
        let dropped = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(client_id = %self.client_id, dropped, "cancelled pending correlation slots");
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_last_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.write().await = at;
    }
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<SseClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new client under a fresh opaque id.
    pub async fn register(&self, name: String, platform: String, version: String) -> Arc<SseClient> {
        let client_id = Uuid::new_v4().to_string();
        let client = SseClient::new(client_id.clone(), name, platform, version);
        self.clients
            .write()
            .await
            .insert(client_id.clone(), Arc::clone(&client));
        info!(
            client_id = %client_id,
            name = %client.name,
            platform = %client.platform,
            "client registered"
        );
        client
    }

    /// Remove a client and tear it down: the stream generator exits on its
    /// next tick and all pending correlation slots are cancelled.
    pub async fn unregister(&self, client_id: &str) {
        let removed = self.clients.write().await.remove(client_id);
        if let Some(client) = removed {
            client.shut_down();
            client.cancel_pending().await;
            info!(client_id = %client_id, name = %client.name, "client unregistered");
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<SseClient>> {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<SseClient>> {
        self.clients
            .read()
            .await
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub async fn by_channel(&self, channel_id: &str) -> Vec<Arc<SseClient>> {
        let clients: Vec<Arc<SseClient>> = self.clients.read().await.values().cloned().collect();
        let mut matching = Vec::new();
        for client in clients {
            if client.is_subscribed(channel_id).await {
                matching.push(client);
            }
        }
        matching
    }

    pub async fn by_platform(&self, platform: &str) -> Vec<Arc<SseClient>> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.platform == platform)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Arc<SseClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Enqueue an event to every client subscribed to `channel_id`.
    pub async fn broadcast(&self, channel_id: &str, event: &WireEvent) {
        for client in self.by_channel(channel_id).await {
            let _ = client.send_event(event.clone());
        }
    }

    /// Enqueue an event to every registered client.
    pub async fn broadcast_all(&self, event: &WireEvent) {
        for client in self.all().await {
            let _ = client.send_event(event.clone());
        }
    }

    /// One expiry pass: remove every client idle longer than
    /// [`CLIENT_EXPIRY_SECONDS`].  Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let clients = self.all().await;
        let mut expired = Vec::new();
        for client in clients {
            if client.is_expired(CLIENT_EXPIRY_SECONDS).await {
                expired.push(client.client_id.clone());
            }
        }
        for client_id in &expired {
            info!(client_id = %client_id, "client heartbeat stale, removing");
            self.unregister(client_id).await;
        }
        expired.len()
    }

    /// Run the periodic expiry sweep until `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(SWEEP_INTERVAL) => {
                        let removed = registry.sweep_expired().await;
                        if removed > 0 {
                            debug!(removed, "expiry sweep removed clients");
                        }
                    }
                }
            }
            debug!("expiry sweeper stopped");
        })
    }
}

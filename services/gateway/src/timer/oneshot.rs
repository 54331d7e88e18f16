//! One-shot timer service: ad-hoc delayed agent triggers keyed by channel.
//!
//! A one-second tick loop fires due timers.  Timers without an in-process
//! callback are persisted to a single JSON file (atomic temp-file rename);
//! after a restart, entries already past due within a 300 s grace window
//! fire once with a make-up marker, older ones are dropped.

use crate::platform::MessageService;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

pub const PERSIST_VERSION: u32 = 1;
/// Past-due persisted timers within this window fire once at startup.
pub const MISFIRE_GRACE_SECONDS: i64 = 300;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// In-process callback run instead of the default system message.
/// Callback-bearing timers are never persisted.
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct OneShotTimer {
    pub chat_key: String,
    /// Unix seconds.
    pub trigger_time: i64,
    pub event_desc: String,
    pub temporary: bool,
    callback: Option<TimerCallback>,
}

/// Snapshot of a pending timer, without the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub chat_key: String,
    pub trigger_time: i64,
    pub event_desc: String,
    pub temporary: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTimer {
    chat_key: String,
    trigger_time: i64,
    event_desc: String,
    #[serde(default)]
    temporary: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistFile {
    version: u32,
    tasks: Vec<PersistedTimer>,
}

pub struct OneShotTimerService {
    tasks: Mutex<HashMap<String, Vec<OneShotTimer>>>,
    messages: Arc<dyn MessageService>,
    persist_path: PathBuf,
    persist_lock: Mutex<()>,
}

impl OneShotTimerService {
    pub fn new(persist_path: PathBuf, messages: Arc<dyn MessageService>) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            messages,
            persist_path,
            persist_lock: Mutex::new(()),
        })
    }

    /// Restore persisted timers (compensating recent misfires) and start
    /// the tick loop.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        self.restore_persisted().await;
        let service = Arc::clone(self);
        info!("one-shot timer service started");
        tokio::spawn(async move { service.tick_loop(shutdown).await })
    }

    /// Set, clear, or immediately trigger a channel timer.
    ///
    /// - `trigger_time < 0`: clear this channel's timers; `temporary`
    ///   selects which kind (`None` clears all).
    /// - `trigger_time == 0`: schedule an immediate agent trigger.
    /// - `trigger_time <= now`: rejected.
    /// - `override_temporary`: drop the channel's previous temporary timers
    ///   and mark this one temporary.
    pub async fn set_timer(
        &self,
        chat_key: &str,
        trigger_time: i64,
        event_desc: &str,
        silent: bool,
        override_temporary: bool,
        temporary: Option<bool>,
        callback: Option<TimerCallback>,
    ) -> bool {
        if trigger_time < 0 {
            self.clear_timers(chat_key, temporary, silent).await;
            return true;
        }

        if trigger_time == 0 {
            return match self.messages.schedule_agent_task(chat_key).await {
                Ok(()) => true,
                Err(e) => {
                    error!(chat_key, error = %e, "immediate agent trigger failed");
                    false
                }
            };
        }

        if trigger_time <= Utc::now().timestamp() {
            warn!(chat_key, trigger_time, "timer rejected: trigger time already past");
            return false;
        }

        let persist = callback.is_none();
        {
            let mut tasks = self.tasks.lock().await;
            let channel_tasks = tasks.entry(chat_key.to_owned()).or_default();
            if override_temporary {
                channel_tasks.retain(|t| !t.temporary);
            }
            channel_tasks.push(OneShotTimer {
                chat_key: chat_key.to_owned(),
                trigger_time,
                event_desc: event_desc.to_owned(),
                temporary: override_temporary,
                callback,
            });
        }
        if !silent {
            info!(chat_key, trigger_time, "timer set");
        }
        if persist {
            self.persist_tasks().await;
        }
        true
    }

    async fn clear_timers(&self, chat_key: &str, temporary: Option<bool>, silent: bool) {
        {
            let mut tasks = self.tasks.lock().await;
            match temporary {
                None => {
                    tasks.remove(chat_key);
                }
                Some(kind) => {
                    if let Some(channel_tasks) = tasks.get_mut(chat_key) {
                        channel_tasks.retain(|t| t.temporary != kind);
                        if channel_tasks.is_empty() {
                            tasks.remove(chat_key);
                        }
                    }
                }
            }
        }
        if !silent {
            info!(chat_key, kind = ?temporary, "channel timers cleared");
        }
        self.persist_tasks().await;
    }

    /// Pending timers for a channel.
    pub async fn get_timers(&self, chat_key: &str) -> Vec<TimerInfo> {
        self.tasks
            .lock()
            .await
            .get(chat_key)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|t| TimerInfo {
                        chat_key: t.chat_key.clone(),
                        trigger_time: t.trigger_time,
                        event_desc: t.event_desc.clone(),
                        temporary: t.temporary,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(TICK_INTERVAL) => {
                    self.fire_due_timers().await;
                }
            }
        }
        debug!("one-shot timer loop stopped");
    }

    async fn fire_due_timers(&self) {
        let now = Utc::now().timestamp();
        let due: Vec<OneShotTimer> = {
            let mut tasks = self.tasks.lock().await;
            let mut due = Vec::new();
            tasks.retain(|_, channel_tasks| {
                let mut remaining = Vec::with_capacity(channel_tasks.len());
                for task in channel_tasks.drain(..) {
                    if task.trigger_time <= now {
                        due.push(task);
                    } else {
                        remaining.push(task);
                    }
                }
                *channel_tasks = remaining;
                !channel_tasks.is_empty()
            });
            due
        };

        if due.is_empty() {
            return;
        }

        for task in &due {
            if let Some(callback) = &task.callback {
                callback().await;
            } else if !task.event_desc.is_empty() {
                let content = format!("⏰ 定时提醒：{}", task.event_desc);
                if let Err(e) = self
                    .messages
                    .push_system_message(&task.chat_key, &content, true)
                    .await
                {
                    error!(chat_key = %task.chat_key, error = %e, "timer reminder failed");
                }
            } else if let Err(e) = self.messages.schedule_agent_task(&task.chat_key).await {
                error!(chat_key = %task.chat_key, error = %e, "timer agent trigger failed");
            }
            debug!(chat_key = %task.chat_key, trigger_time = task.trigger_time, "timer fired");
        }

        self.persist_tasks().await;
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn persist_tasks(&self) {
        let _guard = self.persist_lock.lock().await;
        let payload = {
            let tasks = self.tasks.lock().await;
            let dump: Vec<PersistedTimer> = tasks
                .values()
                .flatten()
                .filter(|t| t.callback.is_none())
                .map(|t| PersistedTimer {
                    chat_key: t.chat_key.clone(),
                    trigger_time: t.trigger_time,
                    event_desc: t.event_desc.clone(),
                    temporary: t.temporary,
                })
                .collect();
            PersistFile {
                version: PERSIST_VERSION,
                tasks: dump,
            }
        };

        if let Err(e) = write_atomic(&self.persist_path, &payload) {
            error!(path = %self.persist_path.display(), error = %e, "timer persistence failed");
        }
    }

    async fn restore_persisted(&self) {
        let payload = match read_persist_file(&self.persist_path) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                error!(path = %self.persist_path.display(), error = %e, "timer restore failed");
                return;
            }
        };
        if payload.version != PERSIST_VERSION {
            error!(
                version = payload.version,
                "persisted timer version mismatch, ignoring file"
            );
            return;
        }

        let now = Utc::now().timestamp();
        let mut restored = 0usize;
        let mut triggered = 0usize;
        let mut dropped = 0usize;

        for item in payload.tasks {
            if item.trigger_time <= now {
                let lag = now - item.trigger_time;
                if lag <= MISFIRE_GRACE_SECONDS && !item.event_desc.is_empty() {
                    let content = format!("⏰ 定时提醒（补发）：{}", item.event_desc);
                    match self
                        .messages
                        .push_system_message(&item.chat_key, &content, true)
                        .await
                    {
                        Ok(()) => triggered += 1,
                        Err(e) => {
                            error!(chat_key = %item.chat_key, error = %e, "make-up reminder failed");
                        }
                    }
                } else {
                    dropped += 1;
                }
                continue;
            }

            self.tasks
                .lock()
                .await
                .entry(item.chat_key.clone())
                .or_default()
                .push(OneShotTimer {
                    chat_key: item.chat_key,
                    trigger_time: item.trigger_time,
                    event_desc: item.event_desc,
                    temporary: item.temporary,
                    callback: None,
                });
            restored += 1;
        }

        info!(restored, triggered, dropped, "persisted timers restored");
        // Drop the fired/expired entries from disk.
        self.persist_tasks().await;
    }
}

fn read_persist_file(path: &Path) -> Result<Option<PersistFile>, std::io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str(&raw) {
        Ok(payload) => Ok(Some(payload)),
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
    }
}

fn write_atomic(path: &Path, payload: &PersistFile) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(payload)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

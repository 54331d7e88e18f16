//! Shared recording doubles for the gateway integration suites.

use async_trait::async_trait;
use gateway::AppState;
use gateway::config::SseConfig;
use gateway::platform::{
    InboundSink, MessageService, PlatformChannel, PlatformError, PlatformMessage, PlatformUser,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

pub struct RecordingIngest {
    pub collected: Mutex<Vec<(PlatformChannel, PlatformUser, PlatformMessage)>>,
}

impl RecordingIngest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collected: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl InboundSink for RecordingIngest {
    async fn collect_message(
        &self,
        channel: PlatformChannel,
        user: PlatformUser,
        message: PlatformMessage,
    ) -> Result<(), PlatformError> {
        self.collected.lock().await.push((channel, user, message));
        Ok(())
    }
}

pub struct RecordingMessages {
    pub sent: Mutex<Vec<(String, String, bool)>>,
    pub scheduled: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingMessages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageService for RecordingMessages {
    async fn push_system_message(
        &self,
        chat_key: &str,
        content: &str,
        trigger_agent: bool,
    ) -> Result<(), PlatformError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::Delivery("push refused".to_owned()));
        }
        self.sent
            .lock()
            .await
            .push((chat_key.to_owned(), content.to_owned(), trigger_agent));
        Ok(())
    }

    async fn schedule_agent_task(&self, chat_key: &str) -> Result<(), PlatformError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::Delivery("schedule refused".to_owned()));
        }
        self.scheduled.lock().await.push(chat_key.to_owned());
        Ok(())
    }
}

pub fn app_state(config: SseConfig) -> (AppState, Arc<RecordingIngest>) {
    let ingest = RecordingIngest::new();
    let state = AppState::new(config, ingest.clone());
    (state, ingest)
}

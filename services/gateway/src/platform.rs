//! Platform-neutral message model and the collaborator seams the bridge
//! calls out to.
//!
//! The agent execution core and the chat-message persistence layer live
//! outside this service; they are reached exclusively through the traits
//! below.  Timer engines push system messages, the command router hands
//! inbound chat messages to the ingest pipeline.

use async_trait::async_trait;
use thiserror::Error;

/// Adapter prefix used when wrapping external channel identifiers.
pub const ADAPTER_KEY: &str = "sse";

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Whether a channel is a group conversation or a direct one.
///
/// Derived from the external identifier: `group_<id>` vs `private_<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Group,
    Private,
}

impl ChannelKind {
    pub fn from_channel_id(channel_id: &str) -> Self {
        if channel_id.starts_with("private_") {
            ChannelKind::Private
        } else {
            ChannelKind::Group
        }
    }
}

/// Build the internal chat key for a platform channel:
/// `sse-<platform>-<channel_id>`.
pub fn build_chat_key(platform: &str, channel_id: &str) -> String {
    format!("{ADAPTER_KEY}-{platform}-{channel_id}")
}

/// Split a chat key back into `(platform, channel_id)`.
///
/// The channel id may itself contain `-`, so only the first separator after
/// the platform segment is consumed.
pub fn parse_chat_key(chat_key: &str) -> Option<(&str, &str)> {
    let rest = chat_key.strip_prefix("sse-")?;
    let (platform, channel_id) = rest.split_once('-')?;
    if platform.is_empty() || channel_id.is_empty() {
        return None;
    }
    Some((platform, channel_id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformChannel {
    pub channel_id: String,
    pub channel_name: String,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUser {
    pub platform_name: String,
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: String,
}

/// Inbound message content in platform-neutral form.  Binary payloads keep
/// whatever reference the client supplied; downloading/persisting them is
/// the ingest pipeline's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSegment {
    Text {
        text: String,
    },
    Image {
        name: String,
        base64_url: Option<String>,
        url: Option<String>,
    },
    File {
        name: String,
        base64_url: Option<String>,
        url: Option<String>,
    },
    At {
        user_id: String,
        nickname: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMessage {
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_nickname: String,
    pub segments: Vec<InboundSegment>,
    /// Flattened text content (text + rendered mentions).
    pub content_text: String,
    pub is_tome: bool,
    pub is_self: bool,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Outbound content handed to the dispatcher by the agent core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformSendSegment {
    Text { content: String },
    Image { file_path: std::path::PathBuf },
    File { file_path: std::path::PathBuf },
    At { user_id: String, nickname: String },
}

/// The external message service: system-message push and agent wakeups.
#[async_trait]
pub trait MessageService: Send + Sync {
    async fn push_system_message(
        &self,
        chat_key: &str,
        content: &str,
        trigger_agent: bool,
    ) -> Result<(), PlatformError>;

    async fn schedule_agent_task(&self, chat_key: &str) -> Result<(), PlatformError>;
}

/// Entry point of the inbound message pipeline.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn collect_message(
        &self,
        channel: PlatformChannel,
        user: PlatformUser,
        message: PlatformMessage,
    ) -> Result<(), PlatformError>;
}

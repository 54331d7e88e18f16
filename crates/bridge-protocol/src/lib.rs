// bridge-protocol: SSE bridge wire types and serialization.
//
// Events flow server -> client over the SSE stream; commands flow
// client -> server over HTTP POST.  Both sides of the protocol use
// discriminated serde unions: segments on `type`, commands on `cmd`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SSE events
// ---------------------------------------------------------------------------

/// Event type names emitted by the server.
pub mod event_types {
    pub const CONNECTED: &str = "connected";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const GET_USER_INFO: &str = "get_user_info";
    pub const GET_CHANNEL_INFO: &str = "get_channel_info";
    pub const GET_SELF_INFO: &str = "get_self_info";
    pub const SET_MESSAGE_REACTION: &str = "set_message_reaction";
    pub const FILE_CHUNK: &str = "file_chunk";
    pub const FILE_CHUNK_COMPLETE: &str = "file_chunk_complete";
}

/// A single server->client event: the SSE `event:` name plus a JSON payload.
///
/// Stored pre-serialized as a JSON value so per-client queues never fail on
/// enqueue; framing happens at emit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl WireEvent {
    /// Build an event from any serializable payload.
    pub fn new<T: Serialize>(event: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Render the text framing `event: T\ndata: JSON\n\n`.
    ///
    /// The payload is compact JSON and therefore never contains a raw
    /// newline, which keeps the frame a single `data:` line.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Payload of the initial `connected` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedData {
    pub client_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Payload of periodic `heartbeat` events (every ~5 s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Request / response correlation envelopes
// ---------------------------------------------------------------------------

/// Server->client request carried as the `data` of events that expect a
/// reply.  The client answers with a `response` command over HTTP, never
/// over the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub data: serde_json::Value,
}

/// Client->server reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The request kinds that allocate a correlation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    SendMessage,
    GetUserInfo,
    GetChannelInfo,
    GetSelfInfo,
    SetMessageReaction,
}

impl RequestKind {
    /// The SSE event type this request is delivered under.
    pub fn event_type(self) -> &'static str {
        match self {
            RequestKind::SendMessage => event_types::SEND_MESSAGE,
            RequestKind::GetUserInfo => event_types::GET_USER_INFO,
            RequestKind::GetChannelInfo => event_types::GET_CHANNEL_INFO,
            RequestKind::GetSelfInfo => event_types::GET_SELF_INFO,
            RequestKind::SetMessageReaction => event_types::SET_MESSAGE_REACTION,
        }
    }
}

// ---------------------------------------------------------------------------
// Message segments
// ---------------------------------------------------------------------------

/// A platform-neutral message segment in wire form.
///
/// Binary content travels either as a `data:` base64 URL (`base64_url`) or
/// as a plain fetchable `url`; exactly one of the two is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSegment {
    Text {
        content: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base64_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        name: String,
        mime_type: String,
        suffix: String,
    },
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base64_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        mime_type: String,
        suffix: String,
    },
    At {
        user_id: String,
        nickname: String,
    },
}

impl MessageSegment {
    pub fn text(content: impl Into<String>) -> Self {
        MessageSegment::Text {
            content: content.into(),
        }
    }

    pub fn at(user_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        MessageSegment::At {
            user_id: user_id.into(),
            nickname: nickname.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed request / response payloads
// ---------------------------------------------------------------------------

/// `send_message` request payload (inside the [`RequestEnvelope`] data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub segments: Vec<MessageSegment>,
}

/// Expected `data` of a successful `send_message` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUserInfoRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChannelInfoRequest {
    pub channel_id: String,
}

/// `get_self_info` carries no parameters; the empty object keeps the wire
/// shape uniform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSelfInfoRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMessageReactionRequest {
    pub message_id: String,
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMessageReactionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Advisory user identity returned by `get_user_info` / `get_self_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
    pub platform_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

// ---------------------------------------------------------------------------
// Chunked file transfer
// ---------------------------------------------------------------------------

/// Whether a chunked transfer reassembles into an image or a generic file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    File,
}

/// One `file_chunk` event.  `chunk_data` is a fragment of the base64 text;
/// fragments concatenate in `chunk_index` order to the full payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub chunk_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_data: String,
    /// Length of `chunk_data` in base64 characters.
    pub chunk_size: u64,
    /// Estimated decoded size of the whole payload in bytes.
    pub total_size: u64,
    pub mime_type: String,
    pub filename: String,
    pub file_type: FileKind,
}

/// The `file_chunk_complete` marker closing a transfer.  `success=false`
/// tells the receiver to discard any partial assembly for `chunk_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkComplete {
    pub chunk_id: String,
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Inbound chat messages (client -> server `message` command)
// ---------------------------------------------------------------------------

/// A chat message received by a client on its platform and relayed inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveMessage {
    pub msg_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub platform_name: String,
    pub from_id: String,
    pub from_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_nickname: Option<String>,
    #[serde(default)]
    pub is_to_me: bool,
    #[serde(default)]
    pub is_self: bool,
    /// Unix seconds.
    pub timestamp: i64,
    pub segments: Vec<MessageSegment>,
}

// ---------------------------------------------------------------------------
// Client -> server commands
// ---------------------------------------------------------------------------

/// Command names accepted by the POST endpoint.
pub mod command_names {
    pub const REGISTER: &str = "register";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const MESSAGE: &str = "message";
    pub const RESPONSE: &str = "response";

    pub const ALL: [&str; 5] = [REGISTER, SUBSCRIBE, UNSUBSCRIBE, MESSAGE, RESPONSE];
}

/// The full command union, discriminated on the top-level `cmd` field.
///
/// `register` is the only command that does not require an `X-Client-ID`
/// header; the router enforces that, not the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Register {
        platform: String,
        client_name: String,
        #[serde(default)]
        client_version: String,
    },
    Subscribe {
        channel_ids: Vec<String>,
    },
    Unsubscribe {
        channel_ids: Vec<String>,
    },
    Message {
        channel_id: String,
        message: ReceiveMessage,
    },
    Response(ResponseEnvelope),
}

/// Reply to a successful `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub client_id: String,
    pub message: String,
}

/// Reply to `subscribe` / `unsubscribe` / `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReply {
    pub message: String,
}

/// Reply to `response`: whether a pending correlation slot consumed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseReply {
    pub success: bool,
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Body of every non-2xx JSON response from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_matches_text_framing() {
        let event = WireEvent::new(
            event_types::HEARTBEAT,
            &HeartbeatData { timestamp: 1700000000 },
        )
        .unwrap();
        assert_eq!(
            event.to_sse_frame(),
            "event: heartbeat\ndata: {\"timestamp\":1700000000}\n\n"
        );
    }

    #[test]
    fn segment_tag_selects_payload_shape() {
        let parsed: MessageSegment =
            serde_json::from_str(r#"{"type":"at","user_id":"u1","nickname":"Ada"}"#).unwrap();
        assert_eq!(parsed, MessageSegment::at("u1", "Ada"));

        let text = serde_json::to_value(MessageSegment::text("hi")).unwrap();
        assert_eq!(text["type"], "text");
        assert_eq!(text["content"], "hi");
    }

    #[test]
    fn optional_segment_fields_are_omitted_when_absent() {
        let seg = MessageSegment::Image {
            base64_url: None,
            url: Some("https://example.com/a.png".to_owned()),
            name: "a.png".to_owned(),
            mime_type: "image/png".to_owned(),
            suffix: ".png".to_owned(),
        };
        let json = serde_json::to_value(&seg).unwrap();
        assert!(json.get("base64_url").is_none());
        assert_eq!(json["url"], "https://example.com/a.png");
    }

    #[test]
    fn response_command_flattens_envelope_fields() {
        let cmd: Command = serde_json::from_str(
            r#"{"cmd":"response","request_id":"r1","success":true,"data":{"message_id":"m1"}}"#,
        )
        .unwrap();
        match cmd {
            Command::Response(env) => {
                assert_eq!(env.request_id, "r1");
                assert!(env.success);
                assert_eq!(env.data["message_id"], "m1");
            }
            other => panic!("expected response command, got {other:?}"),
        }
    }

    #[test]
    fn response_envelope_data_defaults_to_null() {
        let env: ResponseEnvelope =
            serde_json::from_str(r#"{"request_id":"r2","success":false}"#).unwrap();
        assert!(env.data.is_null());
    }
}

//! Conversion between the platform-neutral chat model and the SSE wire
//! segment model.
//!
//! Outbound, file contents are read from disk and packed into `data:`
//! base64 URLs; a failed read degrades to a text placeholder instead of
//! dropping the message.  Inbound, wire segments map onto the platform
//! model and the flattened text is accumulated alongside.

use crate::platform::{
    ChannelKind, InboundSegment, PlatformChannel, PlatformMessage, PlatformSendSegment,
    PlatformUser,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_protocol::{MessageSegment, ReceiveMessage, SendMessageRequest};
use std::path::Path;
use tracing::{error, warn};

/// Map a filename suffix to a MIME type; unknown suffixes fall back to
/// `application/octet-stream`.
pub fn mime_for_suffix(suffix: &str) -> &'static str {
    match suffix.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into `(mime, payload)`.
pub fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    Some((mime, payload))
}

fn file_name_and_suffix(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (name, suffix)
}

async fn read_as_data_url(path: &Path) -> std::io::Result<(String, &'static str, u64)> {
    let bytes = tokio::fs::read(path).await?;
    let (_, suffix) = file_name_and_suffix(path);
    let mime = mime_for_suffix(&suffix);
    let size = bytes.len() as u64;
    let data_url = format!("data:{mime};base64,{}", BASE64.encode(bytes));
    Ok((data_url, mime, size))
}

/// Convert platform send segments to a wire `send_message` request.
pub async fn platform_to_wire(
    channel_id: &str,
    segments: &[PlatformSendSegment],
) -> SendMessageRequest {
    let mut wire = Vec::with_capacity(segments.len());

    for segment in segments {
        match segment {
            PlatformSendSegment::Text { content } => {
                wire.push(MessageSegment::text(content.clone()));
            }
            PlatformSendSegment::Image { file_path } => {
                let (name, suffix) = file_name_and_suffix(file_path);
                match read_as_data_url(file_path).await {
                    Ok((base64_url, mime, _)) => wire.push(MessageSegment::Image {
                        base64_url: Some(base64_url),
                        url: None,
                        name,
                        mime_type: mime.to_owned(),
                        suffix,
                    }),
                    Err(e) => {
                        error!(path = %file_path.display(), error = %e, "image read failed");
                        wire.push(MessageSegment::text(format!("[image upload failed: {name}]")));
                    }
                }
            }
            PlatformSendSegment::File { file_path } => {
                let (name, suffix) = file_name_and_suffix(file_path);
                match read_as_data_url(file_path).await {
                    Ok((base64_url, mime, size)) => wire.push(MessageSegment::File {
                        base64_url: Some(base64_url),
                        url: None,
                        name,
                        size: Some(size),
                        mime_type: mime.to_owned(),
                        suffix,
                    }),
                    Err(e) => {
                        error!(path = %file_path.display(), error = %e, "file read failed");
                        wire.push(MessageSegment::text(format!("[file upload failed: {name}]")));
                    }
                }
            }
            PlatformSendSegment::At { user_id, nickname } => {
                wire.push(MessageSegment::at(user_id.clone(), nickname.clone()));
            }
        }
    }

    SendMessageRequest {
        channel_id: channel_id.to_owned(),
        channel_name: None,
        segments: wire,
    }
}

/// Convert an inbound wire message to the platform model the ingest
/// pipeline consumes.
pub fn inbound_to_platform(
    message: &ReceiveMessage,
) -> (PlatformChannel, PlatformUser, PlatformMessage) {
    let mut segments = Vec::with_capacity(message.segments.len());
    let mut content_text = String::new();

    for segment in &message.segments {
        match segment {
            MessageSegment::Text { content } => {
                content_text.push_str(content);
                segments.push(InboundSegment::Text {
                    text: content.clone(),
                });
            }
            MessageSegment::Image {
                base64_url,
                url,
                name,
                ..
            } => {
                segments.push(InboundSegment::Image {
                    name: name.clone(),
                    base64_url: base64_url.clone(),
                    url: url.clone(),
                });
            }
            MessageSegment::File {
                base64_url,
                url,
                name,
                ..
            } => {
                segments.push(InboundSegment::File {
                    name: name.clone(),
                    base64_url: base64_url.clone(),
                    url: url.clone(),
                });
            }
            MessageSegment::At { user_id, nickname } => {
                let shown = if nickname.is_empty() {
                    user_id.as_str()
                } else {
                    nickname.as_str()
                };
                content_text.push_str(&format!("@{shown} "));
                segments.push(InboundSegment::At {
                    user_id: user_id.clone(),
                    nickname: shown.to_owned(),
                });
            }
        }
    }

    if message.channel_id.is_empty() {
        warn!(msg_id = %message.msg_id, "inbound message without a channel id");
    }

    let channel = PlatformChannel {
        channel_id: message.channel_id.clone(),
        channel_name: message
            .channel_name
            .clone()
            .unwrap_or_else(|| message.channel_id.clone()),
        kind: ChannelKind::from_channel_id(&message.channel_id),
    };
    let user = PlatformUser {
        platform_name: message.platform_name.clone(),
        user_id: message.from_id.clone(),
        user_name: message.from_name.clone(),
        user_avatar: String::new(),
    };
    let platform_message = PlatformMessage {
        message_id: message.msg_id.clone(),
        sender_id: message.from_id.clone(),
        sender_name: message.from_name.clone(),
        sender_nickname: message
            .from_nickname
            .clone()
            .unwrap_or_else(|| message.from_name.clone()),
        segments,
        content_text,
        is_tome: message.is_to_me,
        is_self: message.is_self,
        timestamp: message.timestamp,
    };

    (channel, user, platform_message)
}

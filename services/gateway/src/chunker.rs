//! Chunk emitter: slices a large base64 payload into bounded SSE frames
//! followed by a transfer-complete marker.
//!
//! The event-stream transport cannot be trusted to carry arbitrarily large
//! events, so any attachment whose decoded size exceeds
//! [`CHUNK_THRESHOLD_BYTES`] travels as a `file_chunk` sequence instead of
//! inline message data.

use crate::registry::SseClient;
use bridge_protocol::{ChunkComplete, ChunkFrame, FileKind, WireEvent, event_types};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Base64 characters per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Decoded payloads above this size are chunked.
pub const CHUNK_THRESHOLD_BYTES: u64 = 1024 * 1024;
/// Pause between frames so slow consumers are not overrun.
pub const INTER_FRAME_DELAY: Duration = Duration::from_millis(10);

/// Estimated decoded size of a base64 payload (payload bytes ≈ chars * 3/4).
pub fn estimated_decoded_size(base64_len: usize) -> u64 {
    base64_len as u64 * 3 / 4
}

/// Whether a base64 payload must go through chunked transfer.
pub fn needs_chunking(base64_data: &str) -> bool {
    estimated_decoded_size(base64_data.len()) > CHUNK_THRESHOLD_BYTES
}

/// Slice `base64_data` into frames.  Base64 text is ASCII, so slicing at
/// fixed char offsets never splits a code point.
pub fn plan_chunks(
    chunk_id: &str,
    base64_data: &str,
    mime_type: &str,
    filename: &str,
    file_type: FileKind,
) -> Vec<ChunkFrame> {
    let total_size = estimated_decoded_size(base64_data.len());
    let total_chunks = base64_data.len().div_ceil(CHUNK_SIZE);
    let mut frames = Vec::with_capacity(total_chunks);

    for (index, start) in (0..base64_data.len()).step_by(CHUNK_SIZE).enumerate() {
        let end = (start + CHUNK_SIZE).min(base64_data.len());
        let chunk_data = &base64_data[start..end];
        frames.push(ChunkFrame {
            chunk_id: chunk_id.to_owned(),
            chunk_index: index as u32,
            total_chunks: total_chunks as u32,
            chunk_data: chunk_data.to_owned(),
            chunk_size: chunk_data.len() as u64,
            total_size,
            mime_type: mime_type.to_owned(),
            filename: filename.to_owned(),
            file_type,
        });
    }

    frames
}

/// The completion marker closing a transfer.
pub fn completion(chunk_id: &str, filename: &str, success: bool) -> ChunkComplete {
    let message = if success {
        format!("transfer finished: {filename}")
    } else {
        format!("transfer failed: {filename}")
    };
    ChunkComplete {
        chunk_id: chunk_id.to_owned(),
        success,
        message,
    }
}

/// Drive a full chunked transfer into one client's event queue.
///
/// Emits every frame with the inter-frame delay, then the success marker.
/// If any enqueue fails a `success=false` marker is emitted best-effort and
/// the transfer is reported as failed.
pub async fn send_chunked(
    client: &SseClient,
    base64_data: &str,
    mime_type: &str,
    filename: &str,
    file_type: FileKind,
) -> bool {
    let chunk_id = Uuid::new_v4().to_string();
    let frames = plan_chunks(&chunk_id, base64_data, mime_type, filename, file_type);
    info!(
        client_id = %client.client_id,
        filename,
        total_chunks = frames.len(),
        total_size = estimated_decoded_size(base64_data.len()),
        "starting chunked transfer"
    );

    for frame in frames {
        let index = frame.chunk_index;
        let Ok(event) = WireEvent::new(event_types::FILE_CHUNK, &frame) else {
            error!(client_id = %client.client_id, filename, "chunk frame serialization failed");
            emit_failure(client, &chunk_id, filename);
            return false;
        };
        if !client.send_event(event) {
            error!(
                client_id = %client.client_id,
                filename,
                chunk_index = index,
                "client unreachable mid-transfer"
            );
            emit_failure(client, &chunk_id, filename);
            return false;
        }
        debug!(client_id = %client.client_id, filename, chunk_index = index, "chunk enqueued");
        tokio::time::sleep(INTER_FRAME_DELAY).await;
    }

    match WireEvent::new(
        event_types::FILE_CHUNK_COMPLETE,
        &completion(&chunk_id, filename, true),
    ) {
        Ok(event) => {
            if client.send_event(event) {
                info!(client_id = %client.client_id, filename, "chunked transfer complete");
                true
            } else {
                error!(client_id = %client.client_id, filename, "completion marker not delivered");
                false
            }
        }
        _ => {
            error!(client_id = %client.client_id, filename, "completion marker not delivered");
            false
        }
    }
}

fn emit_failure(client: &SseClient, chunk_id: &str, filename: &str) {
    if let Ok(event) = WireEvent::new(
        event_types::FILE_CHUNK_COMPLETE,
        &completion(chunk_id, filename, false),
    ) {
        let _ = client.send_event(event);
    }
}

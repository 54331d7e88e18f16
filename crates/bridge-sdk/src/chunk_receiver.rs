//! Reassembly of chunked file transfers pushed over the event stream.
//!
//! Per `chunk_id`: a fixed-length slot array, a receive count, metadata
//! and a deadline 300 s after the first chunk.  Duplicate indices are
//! logged and ignored, so re-delivery inside a transfer is idempotent.
//! When the count reaches `total_chunks` the joined base64 is decoded and
//! returned to the caller; the state is freed either way.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_protocol::{ChunkComplete, ChunkFrame, FileKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Assemblies older than this are dropped by the sweep.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the owner should run [`ChunkReceiver::sweep_expired`].
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_type: FileKind,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("incomplete chunk frame: {0}")]
    Incomplete(String),
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),
}

struct ChunkBuffer {
    slots: Vec<Option<String>>,
    received: usize,
    filename: String,
    mime_type: String,
    file_type: FileKind,
    deadline: Instant,
}

/// Not internally synchronized; the owning client wraps it in its own lock
/// and drives the expiry sweep.
pub struct ChunkReceiver {
    buffers: HashMap<String, ChunkBuffer>,
}

impl Default for ChunkReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Accept one frame.  Returns the reassembled file when this frame
    /// completes the transfer, `None` for intermediate (or duplicate)
    /// frames.
    pub fn handle_chunk(&mut self, frame: &ChunkFrame) -> Result<Option<ReceivedFile>, ChunkError> {
        if frame.chunk_id.is_empty() || frame.total_chunks == 0 || frame.chunk_data.is_empty() {
            return Err(ChunkError::Incomplete(format!(
                "chunk_id={:?} total_chunks={} empty_data={}",
                frame.chunk_id,
                frame.total_chunks,
                frame.chunk_data.is_empty()
            )));
        }
        if frame.chunk_index >= frame.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: frame.chunk_index,
                total: frame.total_chunks,
            });
        }

        let buffer = self
            .buffers
            .entry(frame.chunk_id.clone())
            .or_insert_with(|| ChunkBuffer {
                slots: vec![None; frame.total_chunks as usize],
                received: 0,
                filename: frame.filename.clone(),
                mime_type: frame.mime_type.clone(),
                file_type: frame.file_type,
                deadline: Instant::now() + CHUNK_TIMEOUT,
            });

        let index = frame.chunk_index as usize;
        if index >= buffer.slots.len() {
            return Err(ChunkError::IndexOutOfRange {
                index: frame.chunk_index,
                total: buffer.slots.len() as u32,
            });
        }
        if buffer.slots[index].is_some() {
            warn!(
                chunk_id = %frame.chunk_id,
                chunk_index = frame.chunk_index,
                filename = %buffer.filename,
                "duplicate chunk ignored"
            );
            return Ok(None);
        }

        buffer.slots[index] = Some(frame.chunk_data.clone());
        buffer.received += 1;
        debug!(
            chunk_id = %frame.chunk_id,
            received = buffer.received,
            total = buffer.slots.len(),
            "chunk stored"
        );

        if buffer.received < buffer.slots.len() {
            return Ok(None);
        }

        // Complete: join, decode, free.
        let buffer = self
            .buffers
            .remove(&frame.chunk_id)
            .expect("buffer present: just completed");
        let joined: String = buffer.slots.into_iter().flatten().collect();
        let bytes = BASE64.decode(joined.as_bytes())?;
        Ok(Some(ReceivedFile {
            filename: buffer.filename,
            bytes,
            mime_type: buffer.mime_type,
            file_type: buffer.file_type,
        }))
    }

    /// Handle the transfer-complete marker.  A failed transfer discards
    /// any partial assembly.
    pub fn handle_complete(&mut self, complete: &ChunkComplete) {
        if complete.success {
            return;
        }
        warn!(
            chunk_id = %complete.chunk_id,
            message = %complete.message,
            "server reported transfer failure, discarding partial assembly"
        );
        self.buffers.remove(&complete.chunk_id);
    }

    /// Drop assemblies past their deadline; returns the dropped ids.
    pub fn sweep_expired(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| now > buffer.deadline)
            .map(|(chunk_id, _)| chunk_id.clone())
            .collect();
        for chunk_id in &expired {
            if let Some(buffer) = self.buffers.remove(chunk_id) {
                warn!(
                    chunk_id = %chunk_id,
                    filename = %buffer.filename,
                    "expired chunk assembly dropped"
                );
            }
        }
        expired
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

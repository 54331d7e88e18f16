//! Client SDK for the SSE bridge.
//!
//! A client keeps one event stream (server -> client) and one HTTP
//! command channel (client -> server) with the gateway.  The SDK covers
//! registration, channel subscriptions, the reconnecting stream consumer,
//! dispatch of server requests to an [`client::EventHandler`], chunked
//! file reassembly, and a retry queue that keeps delivering responses
//! across transient network failure — the server uses response timeouts
//! for liveness, so giving up early poisons its correlation layer.

pub mod chunk_receiver;
pub mod client;
pub mod retry;
pub mod sse_parser;

pub use chunk_receiver::{ChunkError, ChunkReceiver, ReceivedFile};
pub use client::{BridgeClient, ClientConfig, DefaultEventHandler, EventHandler, SdkError};
pub use retry::{RetryPolicy, with_retry};
pub use sse_parser::SseFrameParser;

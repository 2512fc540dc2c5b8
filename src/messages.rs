//! # Wire Protocol Messages
//!
//! This module defines the serializable message types of the filter protocols
//! and the framing used to move them over a stream.
//!
//! ## Protocol Types
//!
//! | Protocol | Direction | Message |
//! |----------|-----------|---------|
//! | Subscribe | light → full | `FilterSubscribeRequest` |
//! | Subscribe | full → light | `FilterSubscribeResponse` |
//! | Push | full → light | `MessagePush` (unsolicited, one per stream) |
//!
//! ## Framing
//!
//! Every frame is a 4-byte big-endian length followed by a bincode body.
//! Decoding is always bounded: the length prefix is checked against the
//! caller's limit before any allocation, and bincode enforces the same limit
//! while deserializing.
//!
//! ## Status Codes
//!
//! Replies carry a closed set of outcomes borrowed from the HTTP vocabulary.
//! The text table lives here so no outside status-text source is needed.

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of an inbound subscribe request (64 KiB).
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum message payload carried in a push (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum size of any other frame: a full payload plus framing overhead.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 4096;

/// Bytes of the big-endian length prefix in front of every frame body.
pub const FRAME_HEADER_LEN: usize = 4;

/// 32-byte content hash identifying an envelope.
pub type MessageHash = [u8; 32];

/// Returns bincode options with size limits enforced.
fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, bincode::Error> {
    bincode_options(limit as u64).deserialize(bytes)
}

/// Serialize `value` into a complete length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serialize(value).context("failed to serialize frame")?;
    let len = u32::try_from(body.len()).context("frame length exceeds u32")?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write a frame produced by [`encode_frame`] and flush it.
pub async fn write_encoded_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await.context("failed to write frame")?;
    writer.flush().await.context("failed to flush frame")?;
    Ok(())
}

pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let frame = encode_frame(value)?;
    write_encoded_frame(writer, &frame).await
}

/// Read one frame, rejecting bodies larger than `max_size` before allocating.
pub async fn read_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(reader: &mut R, max_size: usize) -> Result<T> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        anyhow::bail!("frame too large: {} bytes (max {})", len, max_size);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;

    deserialize_bounded(&body, max_size).context("failed to deserialize frame")
}

/// Outcome of a filter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    ServiceUnavailable,
}

impl StatusCode {
    pub const fn as_u32(self) -> u32 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub const fn text(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            200 => Some(StatusCode::Ok),
            400 => Some(StatusCode::BadRequest),
            404 => Some(StatusCode::NotFound),
            503 => Some(StatusCode::ServiceUnavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u32(), self.text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterSubscribeType {
    Subscribe,
    SubscriberPing,
    Unsubscribe,
    UnsubscribeAll,
}

impl FilterSubscribeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterSubscribeType::Subscribe => "SUBSCRIBE",
            FilterSubscribeType::SubscriberPing => "SUBSCRIBER_PING",
            FilterSubscribeType::Unsubscribe => "UNSUBSCRIBE",
            FilterSubscribeType::UnsubscribeAll => "UNSUBSCRIBE_ALL",
        }
    }
}

impl std::fmt::Display for FilterSubscribeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSubscribeRequest {
    pub request_id: String,
    pub filter_subscribe_type: FilterSubscribeType,
    pub pubsub_topic: String,
    pub content_topics: Vec<String>,
}

impl FilterSubscribeRequest {
    pub fn subscribe(
        request_id: impl Into<String>,
        pubsub_topic: impl Into<String>,
        content_topics: Vec<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            filter_subscribe_type: FilterSubscribeType::Subscribe,
            pubsub_topic: pubsub_topic.into(),
            content_topics,
        }
    }

    pub fn unsubscribe(
        request_id: impl Into<String>,
        pubsub_topic: impl Into<String>,
        content_topics: Vec<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            filter_subscribe_type: FilterSubscribeType::Unsubscribe,
            pubsub_topic: pubsub_topic.into(),
            content_topics,
        }
    }

    pub fn unsubscribe_all(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            filter_subscribe_type: FilterSubscribeType::UnsubscribeAll,
            pubsub_topic: String::new(),
            content_topics: Vec::new(),
        }
    }

    pub fn ping(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            filter_subscribe_type: FilterSubscribeType::SubscriberPing,
            pubsub_topic: String::new(),
            content_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSubscribeResponse {
    pub request_id: String,
    pub status_code: u32,
    pub status_desc: String,
}

impl FilterSubscribeResponse {
    /// Build a response; the description defaults to the status text.
    pub fn new(request_id: impl Into<String>, status: StatusCode, description: Option<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status_code: status.as_u32(),
            status_desc: description.unwrap_or_else(|| status.text().to_string()),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.status_code)
    }

    pub fn is_success(&self) -> bool {
        self.status_code == StatusCode::Ok.as_u32()
    }
}

/// A message as carried on the upstream network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Vec<u8>,
    pub content_topic: String,
    pub version: u32,
    /// Nanoseconds since the Unix epoch, when the sender set one.
    pub timestamp: Option<i64>,
    pub meta: Option<Vec<u8>>,
    pub ephemeral: bool,
}

impl Message {
    pub fn new(content_topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            content_topic: content_topic.into(),
            version: 0,
            timestamp: None,
            meta: None,
            ephemeral: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_meta(mut self, meta: impl Into<Vec<u8>>) -> Self {
        self.meta = Some(meta.into());
        self
    }
}

/// Unsolicited delivery of a matched message to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePush {
    pub pubsub_topic: String,
    pub message: Message,
}

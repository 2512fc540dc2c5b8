//! Light-node side of the filter protocol.
//!
//! [`FilterClient`] sends subscribe/unsubscribe/ping requests to a full node
//! (one stream per request) and exposes pushed messages as a channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::identity::PeerId;
use crate::messages::{
    FilterSubscribeRequest, FilterSubscribeResponse, MAX_FRAME_SIZE, MessagePush, read_frame, write_frame,
};
use crate::protocols::{FILTER_PUSH_PROTOCOL, FILTER_SUBSCRIBE_PROTOCOL, Host, InboundStream};

/// Deadline for one request/response exchange and for reading one push.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes buffered before the push reader applies back-pressure.
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// A message pushed by a full node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPush {
    pub from: PeerId,
    pub push: MessagePush,
}

pub struct FilterClient<H: Host> {
    host: Arc<H>,
    request_timeout: Duration,
}

impl<H: Host> FilterClient<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self {
            host,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    pub async fn subscribe(
        &self,
        full_node: &PeerId,
        pubsub_topic: &str,
        content_topics: &[&str],
    ) -> Result<FilterSubscribeResponse> {
        let request = FilterSubscribeRequest::subscribe(new_request_id(), pubsub_topic, owned(content_topics));
        self.request(full_node, request).await
    }

    pub async fn unsubscribe(
        &self,
        full_node: &PeerId,
        pubsub_topic: &str,
        content_topics: &[&str],
    ) -> Result<FilterSubscribeResponse> {
        let request = FilterSubscribeRequest::unsubscribe(new_request_id(), pubsub_topic, owned(content_topics));
        self.request(full_node, request).await
    }

    pub async fn unsubscribe_all(&self, full_node: &PeerId) -> Result<FilterSubscribeResponse> {
        self.request(full_node, FilterSubscribeRequest::unsubscribe_all(new_request_id()))
            .await
    }

    pub async fn ping(&self, full_node: &PeerId) -> Result<FilterSubscribeResponse> {
        self.request(full_node, FilterSubscribeRequest::ping(new_request_id()))
            .await
    }

    /// Send an arbitrary request. Any status is returned as-is; only
    /// transport, decode and id-mismatch problems are errors.
    pub async fn request(&self, full_node: &PeerId, request: FilterSubscribeRequest) -> Result<FilterSubscribeResponse> {
        let exchange = async {
            let mut stream = self
                .host
                .new_stream(full_node, FILTER_SUBSCRIBE_PROTOCOL)
                .await
                .context("failed to open filter stream")?;
            write_frame(&mut stream, &request).await?;
            let response: FilterSubscribeResponse = read_frame(&mut stream, MAX_FRAME_SIZE).await?;
            anyhow::Ok(response)
        };

        let response = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| anyhow!("filter request {} timed out", request.request_id))??;

        if response.request_id != request.request_id {
            bail!(
                "response id mismatch: sent {}, got {}",
                request.request_id,
                response.request_id
            );
        }
        Ok(response)
    }

    /// Accept push streams and forward decoded pushes to the returned channel.
    ///
    /// Calling again replaces the previous listener, whose channel then closes.
    pub fn listen_for_pushes(&self) -> mpsc::Receiver<ReceivedPush> {
        let (stream_tx, mut stream_rx) = mpsc::channel::<InboundStream>(PUSH_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        self.host.set_stream_handler(FILTER_PUSH_PROTOCOL, stream_tx);

        let read_timeout = self.request_timeout;
        tokio::spawn(async move {
            while let Some(InboundStream { remote, mut stream }) = stream_rx.recv().await {
                let push_tx = push_tx.clone();
                tokio::spawn(async move {
                    match timeout(read_timeout, read_frame::<_, MessagePush>(&mut stream, MAX_FRAME_SIZE)).await {
                        Ok(Ok(push)) => {
                            let _ = push_tx.send(ReceivedPush { from: remote, push }).await;
                        }
                        Ok(Err(e)) => debug!(peer = %remote.short(), error = %e, "failed to read push"),
                        Err(_) => debug!(peer = %remote.short(), "push read timed out"),
                    }
                });
            }
        });

        push_rx
    }

    pub fn stop_listening(&self) {
        self.host.remove_stream_handler(FILTER_PUSH_PROTOCOL);
    }
}

fn owned(content_topics: &[&str]) -> Vec<String> {
    content_topics.iter().map(|ct| ct.to_string()).collect()
}

fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

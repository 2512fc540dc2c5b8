//! # Filter Full Node
//!
//! Server side of the filter protocol: answers subscribe/unsubscribe/ping
//! requests from light peers and runs the tasks that push matching upstream
//! messages back to them.
//!
//! ## Request Handling
//!
//! Each inbound stream carries exactly one request:
//!
//! ```text
//! Idle ──► Reading ──► Dispatched ──► Replying ──► Closed
//!             │
//!             └── decode failure / read timeout ──► Closed (no reply)
//! ```
//!
//! | Request | Success | Failure |
//! |---------|---------|---------|
//! | `Subscribe` | 200 | 400 invalid criteria, 503 node or peer at capacity |
//! | `Unsubscribe` | 200 | 400 invalid criteria, 404 nothing to remove |
//! | `UnsubscribeAll` | 200 | 404 no subscriptions |
//! | `SubscriberPing` | 200 | 404 no subscriptions |
//!
//! Capacity checks and the subsequent `set` are separate registry calls, so
//! the limits are best-effort under concurrent bursts.
//!
//! ## Lifecycle
//!
//! [`FilterFullNode::start`] spawns three long-lived tasks on one
//! [`TaskTracker`]: the accept loop, the delivery dispatcher and the
//! maintenance loop that prunes expired subscribers. Request and push tasks
//! are spawned on the same tracker, so [`FilterFullNode::stop`] returns only
//! once every one of them has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{Subscription, Unsubscriber};
use crate::identity::PeerId;
use crate::messages::{
    FilterSubscribeRequest, FilterSubscribeResponse, FilterSubscribeType, MAX_REQUEST_SIZE, StatusCode,
    read_frame, write_frame,
};
use crate::protocols::{FILTER_SUBSCRIBE_PROTOCOL, Host, InboundStream};
use crate::push::{Dispatcher, PushFailure};
use crate::subscriptions::{DEFAULT_SUBSCRIPTION_TIMEOUT, NoSubscriptionError, SubscriberRegistry};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Maximum number of distinct subscribed peers.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 1000;

/// Maximum content topics in a single subscribe/unsubscribe request.
pub const DEFAULT_MAX_CONTENT_TOPICS_PER_REQUEST: usize = 30;

/// Maximum content topics one peer may hold across all pubsub topics.
pub const DEFAULT_MAX_CRITERIA_PER_SUBSCRIPTION: usize = 1000;

/// Deadline for one push, dial and write included.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for reading a request and for writing its reply.
pub const DEFAULT_REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between expired-subscriber sweeps.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound streams buffered between the host and the accept loop.
const INBOUND_STREAM_BUFFER: usize = 64;

const EMPTY_PUBSUB_TOPIC: &str = "pubsubtopic can't be empty";
const EMPTY_CONTENT_TOPICS: &str = "at least one contenttopic should be specified";
const NODE_AT_CAPACITY: &str = "node has reached maximum number of subscriptions";
const PEER_AT_CAPACITY: &str = "peer has reached maximum number of filter criteria";

#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Distinct subscribed peers before new peers are refused (503).
    pub max_subscriptions: usize,
    /// Content topics allowed in one request (400 above).
    pub max_content_topics_per_request: usize,
    /// Total content topics one peer may hold (503 above).
    pub max_criteria_per_subscription: usize,
    /// Inactivity / unreachability window before a subscriber is dropped.
    pub subscription_timeout: Duration,
    pub push_timeout: Duration,
    pub request_read_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Evict subscribers whose pushes keep failing for `subscription_timeout`.
    pub evict_unreachable: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            max_content_topics_per_request: DEFAULT_MAX_CONTENT_TOPICS_PER_REQUEST,
            max_criteria_per_subscription: DEFAULT_MAX_CRITERIA_PER_SUBSCRIPTION,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            request_read_timeout: DEFAULT_REQUEST_READ_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            evict_unreachable: true,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_subscriptions > 0, "max_subscriptions must be at least 1");
        ensure!(
            self.max_content_topics_per_request > 0,
            "max_content_topics_per_request must be at least 1"
        );
        ensure!(
            self.max_criteria_per_subscription >= self.max_content_topics_per_request,
            "max_criteria_per_subscription ({}) must not be below max_content_topics_per_request ({})",
            self.max_criteria_per_subscription,
            self.max_content_topics_per_request
        );
        ensure!(!self.subscription_timeout.is_zero(), "subscription_timeout must be non-zero");
        ensure!(!self.push_timeout.is_zero(), "push_timeout must be non-zero");
        ensure!(!self.request_read_timeout.is_zero(), "request_read_timeout must be non-zero");
        ensure!(!self.maintenance_interval.is_zero(), "maintenance_interval must be non-zero");
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Delivery and transport counters. Updated lock-free from any task.
#[derive(Debug, Default)]
pub struct FilterStats {
    requests_handled: AtomicU64,
    pushes_delivered: AtomicU64,
    dial_failures: AtomicU64,
    push_timeouts: AtomicU64,
    write_failures: AtomicU64,
    decode_failures: AtomicU64,
    response_write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStatsSnapshot {
    pub requests_handled: u64,
    pub pushes_delivered: u64,
    pub dial_failures: u64,
    pub push_timeouts: u64,
    pub write_failures: u64,
    pub decode_failures: u64,
    pub response_write_failures: u64,
}

impl FilterStats {
    pub(crate) fn record_request(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_push_delivered(&self) {
        self.pushes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_push_failure(&self, failure: PushFailure) {
        let counter = match failure {
            PushFailure::Dial => &self.dial_failures,
            PushFailure::Timeout => &self.push_timeouts,
            PushFailure::Write => &self.write_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_write_failure(&self) {
        self.response_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            pushes_delivered: self.pushes_delivered.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            push_timeouts: self.push_timeouts.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            response_write_failures: self.response_write_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Request Handler
// ============================================================================

type Reply = (StatusCode, Option<String>);

pub(crate) struct RequestHandler {
    subscriptions: Arc<SubscriberRegistry>,
    stats: Arc<FilterStats>,
    config: FilterConfig,
}

impl RequestHandler {
    pub(crate) fn new(subscriptions: Arc<SubscriberRegistry>, stats: Arc<FilterStats>, config: FilterConfig) -> Self {
        Self {
            subscriptions,
            stats,
            config,
        }
    }

    /// Read one request from `inbound`, answer it and close the stream.
    pub(crate) async fn handle_stream(&self, inbound: InboundStream) {
        let InboundStream { remote, mut stream } = inbound;
        let started = Instant::now();

        let read = timeout(
            self.config.request_read_timeout,
            read_frame::<_, FilterSubscribeRequest>(&mut stream, MAX_REQUEST_SIZE),
        )
        .await;
        let request = match read {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                self.stats.record_decode_failure();
                warn!(peer = %remote.short(), error = %e, "failed to read filter request");
                let _ = stream.shutdown().await;
                return;
            }
            Err(_) => {
                self.stats.record_decode_failure();
                warn!(peer = %remote.short(), "filter request read timed out");
                let _ = stream.shutdown().await;
                return;
            }
        };

        let (status, description) = self.process(&remote, &request);
        let response = FilterSubscribeResponse::new(request.request_id.clone(), status, description);

        match timeout(self.config.request_read_timeout, write_frame(&mut stream, &response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.record_response_write_failure();
                warn!(peer = %remote.short(), request_id = %request.request_id, error = %e, "failed to write filter response");
            }
            Err(_) => {
                self.stats.record_response_write_failure();
                warn!(peer = %remote.short(), request_id = %request.request_id, "filter response write timed out");
            }
        }
        let _ = stream.shutdown().await;

        self.stats.record_request();
        info!(
            peer = %remote.short(),
            request_id = %request.request_id,
            request_type = %request.filter_subscribe_type,
            status = status.as_u32(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "handled filter request"
        );
    }

    /// Apply `request` from `peer` to the registry and pick the reply.
    pub(crate) fn process(&self, peer: &PeerId, request: &FilterSubscribeRequest) -> Reply {
        match request.filter_subscribe_type {
            FilterSubscribeType::Subscribe => {
                self.subscribe(peer, &request.pubsub_topic, &request.content_topics)
            }
            FilterSubscribeType::Unsubscribe => {
                self.unsubscribe(peer, &request.pubsub_topic, &request.content_topics)
            }
            FilterSubscribeType::UnsubscribeAll => match self.subscriptions.delete_all(peer) {
                Ok(()) => (StatusCode::Ok, None),
                Err(e) => not_found(e),
            },
            FilterSubscribeType::SubscriberPing => {
                if self.subscriptions.refresh(peer) {
                    (StatusCode::Ok, None)
                } else {
                    not_found(NoSubscriptionError)
                }
            }
        }
    }

    fn validate_criteria(&self, pubsub_topic: &str, content_topics: &[String]) -> Result<(), String> {
        if pubsub_topic.is_empty() {
            return Err(EMPTY_PUBSUB_TOPIC.to_string());
        }
        if content_topics.is_empty() {
            return Err(EMPTY_CONTENT_TOPICS.to_string());
        }
        if content_topics.len() > self.config.max_content_topics_per_request {
            return Err(format!(
                "exceeds maximum content topics: {}",
                self.config.max_content_topics_per_request
            ));
        }
        Ok(())
    }

    fn subscribe(&self, peer: &PeerId, pubsub_topic: &str, content_topics: &[String]) -> Reply {
        if let Err(reason) = self.validate_criteria(pubsub_topic, content_topics) {
            return (StatusCode::BadRequest, Some(reason));
        }

        if !self.subscriptions.has(peer) && self.subscriptions.count() >= self.config.max_subscriptions {
            return (StatusCode::ServiceUnavailable, Some(NODE_AT_CAPACITY.to_string()));
        }

        let existing = self.subscriptions.criteria_count(peer);
        let added = self.subscriptions.count_new_criteria(peer, pubsub_topic, content_topics);
        if existing + added > self.config.max_criteria_per_subscription {
            return (StatusCode::ServiceUnavailable, Some(PEER_AT_CAPACITY.to_string()));
        }

        self.subscriptions.set(*peer, pubsub_topic, content_topics);
        (StatusCode::Ok, None)
    }

    fn unsubscribe(&self, peer: &PeerId, pubsub_topic: &str, content_topics: &[String]) -> Reply {
        if let Err(reason) = self.validate_criteria(pubsub_topic, content_topics) {
            return (StatusCode::BadRequest, Some(reason));
        }
        match self.subscriptions.delete(peer, pubsub_topic, content_topics) {
            Ok(()) => (StatusCode::Ok, None),
            Err(e) => not_found(e),
        }
    }
}

fn not_found(e: NoSubscriptionError) -> Reply {
    (StatusCode::NotFound, Some(e.to_string()))
}

// ============================================================================
// Lifecycle
// ============================================================================

struct Running {
    cancel: CancellationToken,
    unsubscriber: Unsubscriber,
}

/// A full node serving the filter protocol over `H`.
pub struct FilterFullNode<H: Host> {
    host: Arc<H>,
    config: FilterConfig,
    subscriptions: Arc<SubscriberRegistry>,
    stats: Arc<FilterStats>,
    tracker: TaskTracker,
    running: Mutex<Option<Running>>,
}

impl<H: Host> FilterFullNode<H> {
    pub fn new(host: Arc<H>, config: FilterConfig) -> Self {
        let subscriptions = Arc::new(
            SubscriberRegistry::new(config.subscription_timeout)
                .with_unreachable_eviction(config.evict_unreachable),
        );
        Self {
            host,
            config,
            subscriptions,
            stats: Arc::new(FilterStats::default()),
            tracker: TaskTracker::new(),
            running: Mutex::new(None),
        }
    }

    /// Start serving requests and dispatching envelopes from `subscription`.
    pub async fn start(&self, subscription: Subscription) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            bail!("filter full node is already running");
        }
        self.config.validate().context("invalid filter configuration")?;

        // Tasks from a previous run must be gone before the tracker is reused.
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let cancel = CancellationToken::new();
        let (stream_tx, stream_rx) = mpsc::channel(INBOUND_STREAM_BUFFER);
        self.host.set_stream_handler(FILTER_SUBSCRIBE_PROTOCOL, stream_tx);

        let handler = Arc::new(RequestHandler::new(
            self.subscriptions.clone(),
            self.stats.clone(),
            self.config.clone(),
        ));
        self.tracker.spawn(accept_loop(
            handler,
            stream_rx,
            cancel.clone(),
            self.tracker.clone(),
        ));

        let (envelopes, unsubscriber) = subscription.into_parts();
        let dispatcher = Arc::new(Dispatcher::new(
            self.host.clone(),
            self.subscriptions.clone(),
            self.stats.clone(),
            self.config.push_timeout,
        ));
        self.tracker
            .spawn(dispatcher.run(envelopes, cancel.clone(), self.tracker.clone()));

        self.tracker.spawn(maintenance_loop(
            self.subscriptions.clone(),
            self.config.maintenance_interval,
            cancel.clone(),
        ));

        *running = Some(Running { cancel, unsubscriber });
        info!(
            peer = %self.host.local_peer().short(),
            protocol = FILTER_SUBSCRIBE_PROTOCOL,
            "filter full node started"
        );
        Ok(())
    }

    /// Stop serving and wait for every spawned task. No-op when not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { cancel, unsubscriber }) = running.take() else {
            return;
        };

        self.host.remove_stream_handler(FILTER_SUBSCRIBE_PROTOCOL);
        cancel.cancel();
        unsubscriber.unsubscribe();

        self.tracker.close();
        self.tracker.wait().await;
        info!(peer = %self.host.local_peer().short(), "filter full node stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn subscriptions(&self) -> &SubscriberRegistry {
        &self.subscriptions
    }

    pub fn stats(&self) -> FilterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

async fn accept_loop(
    handler: Arc<RequestHandler>,
    mut inbound: mpsc::Receiver<InboundStream>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(stream) => stream,
                None => break,
            },
        };
        let handler = handler.clone();
        tracker.spawn(async move { handler.handle_stream(stream).await });
    }
    debug!("filter accept loop stopped");
}

async fn maintenance_loop(subscriptions: Arc<SubscriberRegistry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = subscriptions.prune_expired();
                for peer in &expired {
                    debug!(peer = %peer.short(), "subscriber expired");
                }
                if !expired.is_empty() {
                    info!(
                        expired = expired.len(),
                        remaining = subscriptions.count(),
                        "pruned expired subscribers"
                    );
                }
            }
        }
    }
}

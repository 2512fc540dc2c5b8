//! # Delivery Dispatcher
//!
//! Consumes the upstream envelope stream and pushes each envelope to every
//! peer whose criteria match it.
//!
//! ```text
//! bus ──► dispatcher loop ──► items(pubsub_topic, content_topic)
//!                                   │
//!                     ┌─────────────┼─────────────┐
//!                     ▼             ▼             ▼
//!                  push(p1)      push(p2)  ...  push(pN)     (tracked tasks)
//!                     │             │             │
//!                     └──► flag_as_success / flag_as_failure
//! ```
//!
//! The loop never awaits a push: a stalled subscriber only stalls its own
//! task. The `MessagePush` frame is encoded once per envelope and shared by
//! all of its pushes. Frames a receiver would reject as oversized are dropped
//! before any push starts.
//!
//! Each push runs under a single `push_timeout` deadline that covers both
//! dialing and writing. There are no retries; a failure is recorded in the
//! registry and in the per-category counters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::bus::Envelope;
use crate::identity::PeerId;
use crate::messages::{FRAME_HEADER_LEN, MAX_FRAME_SIZE, MessagePush, encode_frame, write_encoded_frame};
use crate::protocols::{FILTER_PUSH_PROTOCOL, Host};
use crate::server::FilterStats;
use crate::subscriptions::SubscriberRegistry;

/// Why a push did not reach its subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushFailure {
    /// The outbound stream could not be opened.
    Dial,
    /// The deadline elapsed while dialing or writing.
    Timeout,
    /// The stream opened but writing the frame failed.
    Write,
}

impl PushFailure {
    /// Counter label for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            PushFailure::Dial => "dial_failure",
            PushFailure::Timeout => "push_timeout_failure",
            PushFailure::Write => "write_failure",
        }
    }
}

impl std::fmt::Display for PushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for PushFailure {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Shutdown began before the push could start its next I/O step.
    Cancelled,
}

pub(crate) struct Dispatcher<H: Host> {
    host: Arc<H>,
    subscriptions: Arc<SubscriberRegistry>,
    stats: Arc<FilterStats>,
    push_timeout: Duration,
}

impl<H: Host> Dispatcher<H> {
    pub(crate) fn new(
        host: Arc<H>,
        subscriptions: Arc<SubscriberRegistry>,
        stats: Arc<FilterStats>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            host,
            subscriptions,
            stats,
            push_timeout,
        }
    }

    /// Dispatch envelopes until cancelled or the upstream channel closes.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut envelopes: mpsc::Receiver<Arc<Envelope>>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = envelopes.recv() => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!("upstream channel closed");
                        break;
                    }
                },
            };
            self.dispatch(&envelope, &cancel, &tracker);
        }
        debug!("filter dispatcher stopped");
    }

    /// Spawn one push per matching subscriber. Returns how many were spawned.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        envelope: &Envelope,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> usize {
        let message = envelope.message();
        let subscribers = self
            .subscriptions
            .items(envelope.pubsub_topic(), &message.content_topic);
        if subscribers.as_slice().is_empty() {
            return 0;
        }

        let push = MessagePush {
            pubsub_topic: envelope.pubsub_topic().to_string(),
            message: message.clone(),
        };
        let frame = match encode_frame(&push) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(
                    hash = hex::encode(&envelope.hash()[..8]),
                    error = %e,
                    "failed to encode message push"
                );
                return 0;
            }
        };
        if frame.len() > FRAME_HEADER_LEN + MAX_FRAME_SIZE {
            warn!(
                hash = hex::encode(&envelope.hash()[..8]),
                size = frame.len(),
                max = MAX_FRAME_SIZE,
                "message push too large, dropping"
            );
            return 0;
        }

        let count = subscribers.len();
        debug!(
            hash = hex::encode(&envelope.hash()[..8]),
            pubsub_topic = envelope.pubsub_topic(),
            content_topic = %message.content_topic,
            subscribers = count,
            "dispatching message"
        );

        for peer in subscribers {
            let dispatcher = Arc::clone(self);
            let frame = Arc::clone(&frame);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                dispatcher.push_and_record(peer, &frame, &cancel).await;
            });
        }
        count
    }

    async fn push_and_record(&self, peer: PeerId, frame: &[u8], cancel: &CancellationToken) {
        match self.push(&peer, frame, cancel).await {
            Ok(PushOutcome::Delivered) => {
                self.subscriptions.flag_as_success(&peer);
                self.stats.record_push_delivered();
                debug!(peer = %peer.short(), "message pushed");
            }
            Ok(PushOutcome::Cancelled) => {
                debug!(peer = %peer.short(), "push skipped: shutting down");
            }
            Err(failure) => {
                self.stats.record_push_failure(failure);
                let evicted = self.subscriptions.flag_as_failure(&peer);
                warn!(
                    peer = %peer.short(),
                    failure = %failure,
                    evicted,
                    "failed to push message"
                );
            }
        }
    }

    /// Deliver one encoded frame to `peer` on a fresh push stream.
    pub(crate) async fn push(
        &self,
        peer: &PeerId,
        frame: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PushOutcome, PushFailure> {
        if cancel.is_cancelled() {
            return Ok(PushOutcome::Cancelled);
        }
        let deadline = Instant::now() + self.push_timeout;

        let mut stream = match timeout_at(deadline, self.host.new_stream(peer, FILTER_PUSH_PROTOCOL)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), error = %e, "push dial failed");
                return Err(PushFailure::Dial);
            }
            Err(_) => return Err(PushFailure::Timeout),
        };

        if cancel.is_cancelled() {
            return Ok(PushOutcome::Cancelled);
        }

        let write = async {
            write_encoded_frame(&mut stream, frame).await?;
            stream.shutdown().await.context("failed to close push stream")?;
            anyhow::Ok(())
        };
        match timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(PushOutcome::Delivered),
            Ok(Err(e)) => {
                debug!(peer = %peer.short(), error = %e, "push write failed");
                Err(PushFailure::Write)
            }
            Err(_) => Err(PushFailure::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::{MAX_PAYLOAD_SIZE, Message, read_frame};
    use crate::protocols::InboundStream;
    use crate::server::DEFAULT_PUSH_TIMEOUT;
    use crate::testing::{DialBehavior, MemoryHost, MemoryNetwork};
    use crate::transport::{HANDSHAKE_TIMEOUT, TcpHost};
    use tokio::net::TcpListener;

    const TOPIC: &str = "/strainer/1/default";

    struct Fixture {
        network: MemoryNetwork,
        dispatcher: Arc<Dispatcher<MemoryHost>>,
        subscriptions: Arc<SubscriberRegistry>,
        stats: Arc<FilterStats>,
    }

    fn fixture(push_timeout: Duration, unreachable_after: Duration) -> Fixture {
        let network = MemoryNetwork::new();
        let full = network.host();
        let subscriptions = Arc::new(SubscriberRegistry::new(unreachable_after));
        let stats = Arc::new(FilterStats::default());
        let dispatcher = Arc::new(Dispatcher::new(
            full,
            subscriptions.clone(),
            stats.clone(),
            push_timeout,
        ));
        Fixture {
            network,
            dispatcher,
            subscriptions,
            stats,
        }
    }

    fn listen(host: &MemoryHost) -> mpsc::Receiver<InboundStream> {
        let (tx, rx) = mpsc::channel(16);
        host.set_stream_handler(FILTER_PUSH_PROTOCOL, tx);
        rx
    }

    fn envelope(content_topic: &str, payload: &[u8]) -> Envelope {
        Envelope::new(Message::new(content_topic, payload.to_vec()), TOPIC)
    }

    #[test]
    fn failure_labels() {
        assert_eq!(PushFailure::Dial.to_string(), "dial_failure");
        assert_eq!(PushFailure::Timeout.to_string(), "push_timeout_failure");
        assert_eq!(PushFailure::Write.to_string(), "write_failure");
    }

    #[tokio::test]
    async fn matching_subscribers_receive_one_push_each() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let light_a = f.network.host();
        let light_b = f.network.host();
        let mut inbound_a = listen(&light_a);
        let mut inbound_b = listen(&light_b);

        f.subscriptions.set(light_a.local_peer(), TOPIC, &["c1".to_string()]);
        f.subscriptions.set(light_b.local_peer(), TOPIC, &["c2".to_string()]);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        assert_eq!(f.dispatcher.dispatch(&envelope("c1", b"hello"), &cancel, &tracker), 1);

        tracker.close();
        tracker.wait().await;

        let mut stream = inbound_a.recv().await.unwrap();
        let push: MessagePush = read_frame(&mut stream.stream, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(push.pubsub_topic, TOPIC);
        assert_eq!(push.message.payload, b"hello");
        assert!(inbound_a.try_recv().is_err());
        assert!(inbound_b.try_recv().is_err());

        let health = f.subscriptions.health(&light_a.local_peer()).unwrap();
        assert!(health.last_success.is_some());
        assert_eq!(f.stats.snapshot().pushes_delivered, 1);
    }

    #[tokio::test]
    async fn no_match_spawns_nothing() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        assert_eq!(f.dispatcher.dispatch(&envelope("c1", b"x"), &cancel, &tracker), 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn refused_dial_is_a_dial_failure() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let light = f.network.host();
        f.network.set_behavior(light.local_peer(), DialBehavior::Refuse);

        let result = f
            .dispatcher
            .push(&light.local_peer(), b"frame", &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PushFailure::Dial));
    }

    #[tokio::test]
    async fn hanging_dial_times_out() {
        let f = fixture(Duration::from_millis(50), Duration::from_secs(60));
        let light = f.network.host();
        f.network.set_behavior(light.local_peer(), DialBehavior::Hang);

        let result = f
            .dispatcher
            .push(&light.local_peer(), b"frame", &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PushFailure::Timeout));
    }

    #[tokio::test]
    async fn stalled_reader_times_out_the_write() {
        let f = fixture(Duration::from_millis(200), Duration::from_secs(60));
        let light = f.network.host();
        let _unread = listen(&light);

        let frame = vec![0u8; 256 * 1024];
        let result = f
            .dispatcher
            .push(&light.local_peer(), &frame, &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PushFailure::Timeout));
    }

    #[tokio::test]
    async fn silent_tcp_subscriber_is_a_timeout_not_a_dial_failure() {
        let full = TcpHost::bind("127.0.0.1:0".parse().unwrap(), Keypair::generate())
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = listener.local_addr().unwrap();
        let silent_peer = Keypair::generate().peer_id();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        full.add_peer(silent_peer, silent_addr).await;

        let push_timeout = HANDSHAKE_TIMEOUT + Duration::from_secs(1);
        assert!(push_timeout < DEFAULT_PUSH_TIMEOUT);
        let dispatcher = Dispatcher::new(
            Arc::new(full),
            Arc::new(SubscriberRegistry::new(Duration::from_secs(60))),
            Arc::new(FilterStats::default()),
            push_timeout,
        );

        let started = Instant::now();
        let result = dispatcher
            .push(&silent_peer, b"frame", &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PushFailure::Timeout));
        assert!(started.elapsed() >= push_timeout);
    }

    #[tokio::test]
    async fn oversized_push_is_dropped() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let light = f.network.host();
        let mut inbound = listen(&light);
        f.subscriptions.set(light.local_peer(), TOPIC, &["c1".to_string()]);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        assert_eq!(f.dispatcher.dispatch(&envelope("c1", &huge), &cancel, &tracker), 0);
        assert!(tracker.is_empty());

        let largest = vec![0u8; MAX_PAYLOAD_SIZE];
        assert_eq!(f.dispatcher.dispatch(&envelope("c1", &largest), &cancel, &tracker), 1);

        let mut stream = inbound.recv().await.unwrap();
        let push: MessagePush = read_frame(&mut stream.stream, MAX_FRAME_SIZE).await.unwrap();
        tracker.close();
        tracker.wait().await;
        assert_eq!(push.message.payload.len(), MAX_PAYLOAD_SIZE);
        assert!(inbound.try_recv().is_err());
        assert_eq!(f.stats.snapshot().pushes_delivered, 1);
    }

    #[tokio::test]
    async fn broken_stream_is_a_write_failure() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let light = f.network.host();
        f.network.set_behavior(light.local_peer(), DialBehavior::BrokenWrite);

        let result = f
            .dispatcher
            .push(&light.local_peer(), b"frame", &CancellationToken::new())
            .await;
        assert_eq!(result, Err(PushFailure::Write));
    }

    #[tokio::test]
    async fn cancelled_push_does_nothing() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));
        let light = f.network.host();
        let mut inbound = listen(&light);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = f.dispatcher.push(&light.local_peer(), b"frame", &cancel).await;
        assert_eq!(result, Ok(PushOutcome::Cancelled));
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn failures_are_counted_and_flagged() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(3600));
        let light = f.network.host();
        let peer = light.local_peer();
        f.network.set_behavior(peer, DialBehavior::Refuse);
        f.subscriptions.set(peer, TOPIC, &["c1".to_string()]);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        f.dispatcher.dispatch(&envelope("c1", b"1"), &cancel, &tracker);
        f.dispatcher.dispatch(&envelope("c1", b"2"), &cancel, &tracker);
        tracker.close();
        tracker.wait().await;

        assert_eq!(f.subscriptions.health(&peer).unwrap().consecutive_failures, 2);
        let snapshot = f.stats.snapshot();
        assert_eq!(snapshot.dial_failures, 2);
        assert_eq!(snapshot.pushes_delivered, 0);
    }

    #[tokio::test]
    async fn persistently_unreachable_subscriber_is_evicted() {
        let f = fixture(Duration::from_secs(5), Duration::ZERO);
        let light = f.network.host();
        let peer = light.local_peer();
        f.network.set_behavior(peer, DialBehavior::Refuse);
        f.subscriptions.set(peer, TOPIC, &["c1".to_string()]);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        f.dispatcher.dispatch(&envelope("c1", b"1"), &cancel, &tracker);
        tracker.close();
        tracker.wait().await;

        assert!(!f.subscriptions.has(&peer));
    }

    #[tokio::test]
    async fn run_loop_exits_on_cancel_and_on_channel_close() {
        let f = fixture(Duration::from_secs(5), Duration::from_secs(60));

        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.dispatcher.clone().run(rx, cancel.clone(), TaskTracker::new()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(f.dispatcher.clone().run(rx, CancellationToken::new(), TaskTracker::new()));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}

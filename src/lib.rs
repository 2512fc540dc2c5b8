//! # Strainer - Content-Filtering Push Relay
//!
//! Strainer lets resource-constrained peers receive only the messages they
//! care about from a network they do not participate in directly:
//!
//! - **Light peers** register (pubsub topic, content topics) criteria with a
//!   full node over a request/response protocol.
//! - **The full node** already receives all upstream traffic; for every
//!   message it looks up matching subscribers and pushes a copy to each on a
//!   dedicated stream.
//!
//! ## Architecture
//!
//! ```text
//!  upstream ──► MessageBus ──► Dispatcher ──► push ──► light peer
//!                                  │
//!  light peer ──► request ──► RequestHandler ──► SubscriberRegistry
//! ```
//!
//! All long-lived work runs on one task tracker owned by [`FilterFullNode`],
//! so `stop()` returns only when every request and push task has ended.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key; the transport proves it in a handshake
//! - Registry state is keyed by the transport-authenticated identity, never
//!   by anything a peer writes into a message
//! - Every decode is size-bounded; every suspension point has a deadline
//! - Capacity limits bound peers, criteria per peer and topics per request
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `server` | Request handling, configuration, lifecycle (`FilterFullNode`) |
//! | `push` | Delivery dispatcher and per-push health recording |
//! | `subscriptions` | Concurrent subscriber registry with eviction |
//! | `bus` | In-process upstream message bus |
//! | `client` | Light-node side of the protocol |
//! | `transport` | TCP host with authenticated handshake |
//! | `protocols` | `Host` trait consumed by the filter protocols |
//! | `identity` | Keypairs and peer identifiers |
//! | `messages` | Wire types and length-prefixed framing |

mod bus;
mod client;
mod identity;
mod messages;
mod protocols;
mod push;
mod server;
mod subscriptions;
mod transport;

#[cfg(test)]
mod testing;

pub use bus::{DEFAULT_SUBSCRIPTION_BUFFER, Envelope, MessageBus, Subscription, Unsubscriber};
pub use client::{DEFAULT_REQUEST_TIMEOUT, FilterClient, ReceivedPush};
pub use identity::{Keypair, PeerId, SignatureError};
pub use messages::{
    FilterSubscribeRequest, FilterSubscribeResponse, FilterSubscribeType, FRAME_HEADER_LEN, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
    MAX_REQUEST_SIZE, Message, MessageHash, MessagePush, StatusCode,
};
pub use protocols::{BoxedStream, FILTER_PUSH_PROTOCOL, FILTER_SUBSCRIBE_PROTOCOL, Host, InboundStream, StreamIo};
pub use push::{PushFailure, PushOutcome};
pub use server::{
    DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_MAX_CONTENT_TOPICS_PER_REQUEST, DEFAULT_MAX_CRITERIA_PER_SUBSCRIPTION,
    DEFAULT_MAX_SUBSCRIPTIONS, DEFAULT_PUSH_TIMEOUT, DEFAULT_REQUEST_READ_TIMEOUT, FilterConfig, FilterFullNode,
    FilterStats, FilterStatsSnapshot,
};
pub use subscriptions::{DEFAULT_SUBSCRIPTION_TIMEOUT, NoSubscriptionError, PeerHealth, SubscriberRegistry};
pub use transport::{HANDSHAKE_TIMEOUT, MAX_KNOWN_PEERS, TcpHost};

//! Transport boundary consumed by the filter protocols.
//!
//! The filter server never touches sockets directly. It needs three things
//! from whatever carries its streams:
//!
//! | Capability | Method |
//! |------------|--------|
//! | Inbound streams for a protocol id | [`Host::set_stream_handler`] |
//! | Stop receiving them | [`Host::remove_stream_handler`] |
//! | Outbound stream to a peer | [`Host::new_stream`] |
//!
//! Inbound streams are delivered through an `mpsc` channel rather than a
//! callback, so the receiving side decides how many tasks to spawn and the
//! host never runs protocol code on its own accept path. Dropping the sender
//! (on `remove_stream_handler`) is what ends the receiver's accept loop.
//!
//! `new_stream` takes no deadline: callers bound it with their own
//! `tokio::time::timeout`, which lets them tell a timeout apart from a
//! refused dial.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// Protocol id for subscribe/unsubscribe/ping requests (light → full node).
pub const FILTER_SUBSCRIBE_PROTOCOL: &str = "/strainer/filter-subscribe/1.0.0";

/// Protocol id for message pushes (full → light node).
pub const FILTER_PUSH_PROTOCOL: &str = "/strainer/filter-push/1.0.0";

/// A bidirectional byte stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// A stream opened by a remote peer, authenticated by the host.
pub struct InboundStream {
    pub remote: PeerId,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Stream-oriented connection layer.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Identity this host authenticates as.
    fn local_peer(&self) -> PeerId;

    /// Route every inbound stream negotiated for `protocol` into `handler`.
    /// Replaces any handler already registered for the protocol.
    fn set_stream_handler(&self, protocol: &str, handler: mpsc::Sender<InboundStream>);

    /// Stop routing streams for `protocol` and drop its handler.
    fn remove_stream_handler(&self, protocol: &str);

    /// Open a new outbound stream to `peer` speaking `protocol`.
    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream>;
}

//! In-memory [`Host`] used by unit tests.
//!
//! Streams are `tokio::io::duplex` pairs. Each peer's dial behavior can be
//! overridden to simulate refused, hanging or broken connections.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::identity::{Keypair, PeerId};
use crate::protocols::{BoxedStream, Host, InboundStream};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// How dials *to* a given peer behave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialBehavior {
    Accept,
    /// `new_stream` fails immediately.
    Refuse,
    /// `new_stream` never completes.
    Hang,
    /// `new_stream` succeeds but the remote end is already gone.
    BrokenWrite,
}

#[derive(Default)]
struct HostState {
    handlers: DashMap<String, mpsc::Sender<InboundStream>>,
}

#[derive(Default)]
struct NetworkInner {
    hosts: DashMap<PeerId, Arc<HostState>>,
    behaviors: DashMap<PeerId, DialBehavior>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new host with a fresh identity.
    pub fn host(&self) -> Arc<MemoryHost> {
        let peer = Keypair::generate().peer_id();
        let state = Arc::new(HostState::default());
        self.inner.hosts.insert(peer, state.clone());
        Arc::new(MemoryHost {
            peer,
            state,
            network: self.clone(),
        })
    }

    pub fn set_behavior(&self, peer: PeerId, behavior: DialBehavior) {
        self.inner.behaviors.insert(peer, behavior);
    }

    fn behavior(&self, peer: &PeerId) -> DialBehavior {
        self.inner
            .behaviors
            .get(peer)
            .map_or(DialBehavior::Accept, |b| *b)
    }
}

pub struct MemoryHost {
    peer: PeerId,
    state: Arc<HostState>,
    network: MemoryNetwork,
}

impl MemoryHost {
    pub fn has_handler(&self, protocol: &str) -> bool {
        self.state.handlers.contains_key(protocol)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn set_stream_handler(&self, protocol: &str, handler: mpsc::Sender<InboundStream>) {
        self.state.handlers.insert(protocol.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.state.handlers.remove(protocol);
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream> {
        match self.network.behavior(peer) {
            DialBehavior::Refuse => bail!("connection refused"),
            DialBehavior::Hang => std::future::pending().await,
            DialBehavior::BrokenWrite => {
                let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
                drop(remote);
                Ok(Box::new(local))
            }
            DialBehavior::Accept => {
                let target = self
                    .network
                    .inner
                    .hosts
                    .get(peer)
                    .map(|state| state.clone())
                    .ok_or_else(|| anyhow!("unknown peer {}", peer.short()))?;
                let handler = target
                    .handlers
                    .get(protocol)
                    .map(|tx| tx.clone())
                    .ok_or_else(|| anyhow!("protocol not supported: {}", protocol))?;

                let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
                handler
                    .send(InboundStream {
                        remote: self.peer,
                        stream: Box::new(remote),
                    })
                    .await
                    .map_err(|_| anyhow!("stream handler closed"))?;
                Ok(Box::new(local))
            }
        }
    }
}

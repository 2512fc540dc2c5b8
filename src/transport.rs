//! # TCP Host
//!
//! A [`Host`] that carries every protocol stream on its own TCP connection
//! and authenticates both ends with their Ed25519 identities before any
//! protocol bytes flow.
//!
//! ## Handshake
//!
//! ```text
//! dialer                                   listener
//!   │ ──────────── TCP connect ───────────► │
//!   │ ◄─────────── Challenge{nonce_l} ───── │
//!   │ ── Hello{protocol, peer, port,        │
//!   │          nonce_d, sig_d} ───────────► │  verify sig_d over nonce_l || protocol
//!   │ ◄── Ack{accepted, peer, sig_l,        │
//!   │         reason} ───────────────────── │
//!   verify peer == expected,
//!   sig_l over nonce_d
//! ```
//!
//! Each signature is domain-separated (see [`crate::identity`]) and bound to
//! the other side's fresh nonce, so neither can be replayed. After the `Ack`
//! the connection is handed to the protocol untouched.
//!
//! ## Address Book
//!
//! Outbound streams need an address for the target `PeerId`. Addresses are
//! added explicitly with [`TcpHost::add_peer`] and learned from inbound
//! handshakes (remote IP plus the dialer's advertised listen port). The book
//! is an LRU cache bounded by [`MAX_KNOWN_PEERS`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::identity::{HANDSHAKE_DIALER_DOMAIN, HANDSHAKE_LISTENER_DOMAIN, Keypair, PeerId};
use crate::messages::{read_frame, write_frame};
use crate::protocols::{BoxedStream, Host, InboundStream};

/// Deadline for an inbound handshake. Outbound dials are bounded by the caller.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum entries in the peer address book.
pub const MAX_KNOWN_PEERS: usize = 10_000;

/// Upper bound on any handshake frame.
const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type Nonce = [u8; 32];

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Challenge {
        nonce: Nonce,
    },
    Hello {
        protocol: String,
        peer: PeerId,
        listen_port: u16,
        nonce: Nonce,
        signature: Vec<u8>,
    },
    Ack {
        accepted: bool,
        peer: PeerId,
        signature: Vec<u8>,
        reason: Option<String>,
    },
}

fn dialer_signed_data(listener_nonce: &Nonce, protocol: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(listener_nonce.len() + protocol.len());
    data.extend_from_slice(listener_nonce);
    data.extend_from_slice(protocol.as_bytes());
    data
}

struct HostInner {
    keypair: Keypair,
    listen_port: u16,
    handlers: StdRwLock<HashMap<String, mpsc::Sender<InboundStream>>>,
    peers: Mutex<LruCache<PeerId, SocketAddr>>,
}

pub struct TcpHost {
    inner: Arc<HostInner>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpHost {
    /// Bind a listener on `addr` and start accepting authenticated streams.
    pub async fn bind(addr: SocketAddr, keypair: Keypair) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr().context("failed to read local address")?;

        let peers_cap = NonZeroUsize::new(MAX_KNOWN_PEERS).expect("MAX_KNOWN_PEERS must be non-zero");
        let inner = Arc::new(HostInner {
            keypair,
            listen_port: local_addr.port(),
            handlers: StdRwLock::new(HashMap::new()),
            peers: Mutex::new(LruCache::new(peers_cap)),
        });

        let accept_task = tokio::spawn(accept_connections(inner.clone(), listener));
        info!(
            addr = %local_addr,
            peer = %inner.keypair.peer_id().short(),
            "tcp host listening"
        );

        Ok(Self {
            inner,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record (or replace) the address used to reach `peer`.
    pub async fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.inner.peers.lock().await.put(peer, addr);
    }

    pub async fn peer_addr(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.inner.peers.lock().await.get(peer).copied()
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl std::fmt::Debug for TcpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpHost")
            .field("peer", &self.inner.keypair.peer_id())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_connections(inner: Arc<HostInner>, listener: TcpListener) {
    loop {
        let (socket, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, inner.accept_handshake(socket, remote_addr)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(remote = %remote_addr, error = %e, "inbound handshake failed"),
                Err(_) => debug!(remote = %remote_addr, "inbound handshake timed out"),
            }
        });
    }
}

impl HostInner {
    fn handler_for(&self, protocol: &str) -> Option<mpsc::Sender<InboundStream>> {
        self.handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(protocol).cloned())
    }

    async fn accept_handshake(&self, mut socket: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        socket.set_nodelay(true).context("failed to set TCP_NODELAY")?;

        let challenge: Nonce = rand::random();
        write_frame(&mut socket, &Handshake::Challenge { nonce: challenge }).await?;

        let hello: Handshake = read_frame(&mut socket, MAX_HANDSHAKE_FRAME).await?;
        let Handshake::Hello {
            protocol,
            peer,
            listen_port,
            nonce,
            signature,
        } = hello
        else {
            bail!("expected hello frame");
        };

        peer.verify_with_domain(
            HANDSHAKE_DIALER_DOMAIN,
            &dialer_signed_data(&challenge, &protocol),
            &signature,
        )
        .with_context(|| format!("dialer {} failed authentication", peer.short()))?;

        let local = self.keypair.peer_id();
        let ack_signature = self.keypair.sign_with_domain(HANDSHAKE_LISTENER_DOMAIN, &nonce);

        let Some(handler) = self.handler_for(&protocol) else {
            let reason = format!("protocol not supported: {protocol}");
            let ack = Handshake::Ack {
                accepted: false,
                peer: local,
                signature: ack_signature,
                reason: Some(reason.clone()),
            };
            write_frame(&mut socket, &ack).await?;
            bail!(reason);
        };

        let ack = Handshake::Ack {
            accepted: true,
            peer: local,
            signature: ack_signature,
            reason: None,
        };
        write_frame(&mut socket, &ack).await?;

        self.peers
            .lock()
            .await
            .put(peer, SocketAddr::new(remote_addr.ip(), listen_port));

        debug!(
            peer = %peer.short(),
            remote = %remote_addr,
            protocol = %protocol,
            "accepted inbound stream"
        );
        handler
            .send(InboundStream {
                remote: peer,
                stream: Box::new(socket),
            })
            .await
            .map_err(|_| anyhow!("stream handler for {protocol} closed"))
    }

    async fn dial(&self, addr: SocketAddr, expected: &PeerId, protocol: &str) -> Result<BoxedStream> {
        let mut socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        socket.set_nodelay(true).context("failed to set TCP_NODELAY")?;

        let challenge: Handshake = read_frame(&mut socket, MAX_HANDSHAKE_FRAME).await?;
        let Handshake::Challenge { nonce: listener_nonce } = challenge else {
            bail!("expected challenge frame");
        };

        let nonce: Nonce = rand::random();
        let hello = Handshake::Hello {
            protocol: protocol.to_string(),
            peer: self.keypair.peer_id(),
            listen_port: self.listen_port,
            nonce,
            signature: self
                .keypair
                .sign_with_domain(HANDSHAKE_DIALER_DOMAIN, &dialer_signed_data(&listener_nonce, protocol)),
        };
        write_frame(&mut socket, &hello).await?;

        let ack: Handshake = read_frame(&mut socket, MAX_HANDSHAKE_FRAME).await?;
        let Handshake::Ack {
            accepted,
            peer,
            signature,
            reason,
        } = ack
        else {
            bail!("expected ack frame");
        };

        if peer != *expected {
            bail!(
                "connected to unexpected peer {} (wanted {})",
                peer.short(),
                expected.short()
            );
        }
        peer.verify_with_domain(HANDSHAKE_LISTENER_DOMAIN, &nonce, &signature)
            .with_context(|| format!("listener {} failed authentication", peer.short()))?;

        if !accepted {
            bail!("stream rejected: {}", reason.unwrap_or_default());
        }
        Ok(Box::new(socket))
    }
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    fn set_stream_handler(&self, protocol: &str, handler: mpsc::Sender<InboundStream>) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(protocol.to_string(), handler);
        }
    }

    fn remove_stream_handler(&self, protocol: &str) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.remove(protocol);
        }
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream> {
        let addr = self
            .peer_addr(peer)
            .await
            .ok_or_else(|| anyhow!("no known address for peer {}", peer.short()))?;

        self.inner.dial(addr, peer, protocol).await
    }
}

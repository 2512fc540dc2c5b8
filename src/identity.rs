//! # Peer Identity
//!
//! This module defines the identity types shared by every component:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! **PeerId = Ed25519 Public Key.** Possession of the secret key proves the
//! identity, so the transport handshake can authenticate the remote side of a
//! stream without any certificate authority. The subscription registry keys all
//! of its state by `PeerId`, which is why the value is established once by the
//! transport and never taken from message fields.
//!
//! ## Domain Separation
//!
//! Every signature is computed over `domain || data`. Each signed structure uses
//! its own prefix, so a signature produced for one purpose cannot be replayed
//! for another.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for the dialer's handshake signature.
pub const HANDSHAKE_DIALER_DOMAIN: &[u8] = b"strainer-handshake-dialer-v1:";

/// Domain separation prefix for the listener's handshake signature.
pub const HANDSHAKE_LISTENER_DOMAIN: &[u8] = b"strainer-handshake-listener-v1:";

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Parse a keypair from a 64-character hex secret key.
    pub fn from_secret_key_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self::from_secret_key_bytes(&secret))
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `data` prefixed with `domain`. Returns the 64-byte signature.
    pub fn sign_with_domain(&self, domain: &[u8], data: &[u8]) -> Vec<u8> {
        self.signing_key
            .sign(&domain_prefixed(domain, data))
            .to_bytes()
            .to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Unique identifier of a remote peer: its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verify a signature produced by [`Keypair::sign_with_domain`] for this peer.
    pub fn verify_with_domain(
        &self,
        domain: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let sig = Signature::from_bytes(&sig_bytes);

        let verifying_key = VerifyingKey::try_from(self.0.as_slice())
            .map_err(|_| SignatureError::InvalidPublicKey)?;

        verifying_key
            .verify_strict(&domain_prefixed(domain, data), &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn domain_prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    prefixed
}

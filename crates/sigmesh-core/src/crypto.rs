//! Node identity and signing primitives.
//!
//! A node's identity is its Ed25519 keypair. The 128-bit [`NodeId`] is
//! derived from the verifying key by hashing, so holding a public key is
//! enough to address its node, and a node can never claim an id that does
//! not match its key.
//!
//! [`Authorization`] is a delegated signing capability: an issuer signs a
//! statement binding a bearer-generated public key to the issuer's identity.
//! A message carrying a valid authorization is treated as acting on behalf
//! of the **issuer** for policy purposes, while still being signed by the
//! bearer key.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::types::type_hash;

/// Errors from identity and signature operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A signature did not verify under the expected key.
    #[error("signature verification failed: {context}")]
    BadSignature {
        /// What was being verified when the check failed.
        context: &'static str,
    },

    /// Raw key bytes were not a valid Ed25519 curve point.
    #[error("invalid public key bytes")]
    InvalidKey,

    /// A hex-encoded id could not be parsed.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

/// Length of a [`NodeId`] in bytes.
pub const NODE_ID_LEN: usize = 16;

/// A 128-bit node identifier derived from the node's verifying key.
///
/// The all-zero id is reserved and is never a valid destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// The reserved all-zero id.
    pub const ZERO: Self = Self([0u8; NODE_ID_LEN]);

    /// Derives the id for a verifying key.
    ///
    /// The id is the first sixteen bytes of the SHA-512 digest of the raw
    /// public key bytes, matching the eight-byte prefix rule used by
    /// [`type_hash`](crate::types::type_hash) but widened to 128 bits.
    #[must_use]
    pub fn from_key(key: &VerifyingKey) -> Self {
        use sha2::{Digest, Sha512};
        let digest = Sha512::digest(key.as_bytes());
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest[..NODE_ID_LEN]);
        Self(id)
    }

    /// Builds an id from raw bytes (storage and wire decode paths).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw id bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Returns true for the reserved all-zero id.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }

    /// Parses an id from its 32-character hex form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNodeId`] if the input is not exactly
    /// sixteen bytes of hex.
    pub fn parse(text: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(text).map_err(|_| CryptoError::InvalidNodeId(text.to_string()))?;
        let bytes: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidNodeId(text.to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A node's signing identity.
///
/// Wraps the Ed25519 signing key; secret bytes are only exposed through a
/// [`Zeroizing`] container for the persistence path.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    /// Generates a fresh keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuilds a key from its 32 secret bytes (the storage load path).
    #[must_use]
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// Returns the secret bytes in a zeroizing container.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Returns the verifying half of the keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Returns the node id this key addresses.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::from_key(&self.signing.verifying_key())
    }

    /// Signs arbitrary message bytes.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.debug_struct("NodeKey")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Domain separator mixed into authorization issuance signatures.
const AUTHORIZATION_DOMAIN: &str = "Authorization";

fn issuance_bytes(issued_at_nanos: u64, bearer: &VerifyingKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + 8 + 32);
    bytes.extend_from_slice(&type_hash(AUTHORIZATION_DOMAIN, "issue").to_be_bytes());
    bytes.extend_from_slice(&issued_at_nanos.to_be_bytes());
    bytes.extend_from_slice(bearer.as_bytes());
    bytes
}

/// A delegated signing capability carried inside a message.
///
/// The issuer signs `(issued_at ‖ bearer public key)`; the bearer of the
/// matching private key may then sign messages on the issuer's behalf. The
/// effective principal of such a message is the issuer, not the bearer.
#[derive(Debug, Clone)]
pub struct Authorization {
    /// Key of the node that granted the delegation.
    pub issuer: VerifyingKey,
    /// Issuance time, nanoseconds since the Unix epoch.
    pub issued_at_nanos: u64,
    /// Issuer signature over the issuance statement.
    pub signature: Signature,
    /// The bearer-generated public key the delegation binds.
    pub bearer: VerifyingKey,
}

impl Authorization {
    /// Verifies the issuance signature chain.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] if the issuer signature does
    /// not cover this authorization's issuance statement.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let statement = issuance_bytes(self.issued_at_nanos, &self.bearer);
        self.issuer
            .verify(&statement, &self.signature)
            .map_err(|_| CryptoError::BadSignature {
                context: "authorization issuance",
            })
    }

    /// Returns the principal a message under this authorization acts as.
    #[must_use]
    pub fn principal(&self) -> NodeId {
        NodeId::from_key(&self.issuer)
    }
}

/// The client half of an authorization: the public record plus the bearer
/// signing key.
pub struct ClientAuthorization {
    /// The public authorization record to embed in messages.
    pub authorization: Authorization,
    /// The bearer signing key used to sign messages.
    pub key: SigningKey,
}

impl ClientAuthorization {
    /// Issues a new delegation from `issuer`, generating a fresh bearer key.
    #[must_use]
    pub fn issue(issuer: &NodeKey) -> Self {
        let bearer_key = SigningKey::generate(&mut OsRng);
        let issued_at_nanos = unix_nanos(SystemTime::now());
        let bearer = bearer_key.verifying_key();
        let signature = issuer.sign(&issuance_bytes(issued_at_nanos, &bearer));
        Self {
            authorization: Authorization {
                issuer: issuer.verifying_key(),
                issued_at_nanos,
                signature,
                bearer,
            },
            key: bearer_key,
        }
    }
}

/// Converts a [`SystemTime`] to nanoseconds since the Unix epoch, clamping
/// pre-epoch times to zero.
#[must_use]
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

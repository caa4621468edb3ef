//! Signed message envelopes.
//!
//! A [`Message`] binds a signal to a destination under the sender's
//! Ed25519 signature. The signature covers
//! `dest ‖ sender ‖ canonical(signal) ‖ authorization-signature?`, so
//! neither the payload nor the addressing can be reattributed after
//! signing. The router never inspects signatures; verification happens in
//! the receiving node's run loop, which answers a failed check with
//! `Error("signature_invalid")`.

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::crypto::{Authorization, ClientAuthorization, CryptoError, NodeId, NodeKey};
use crate::signal::Signal;
use crate::wire::encode_signal;

/// Errors from building or verifying messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The envelope signature did not verify under the sender key.
    #[error("message signature invalid")]
    SignatureInvalid,

    /// The carried authorization failed its issuance check.
    #[error("authorization invalid: {0}")]
    Authorization(#[from] CryptoError),

    /// The message was signed by a key other than the authorization bearer.
    #[error("message signer does not match authorization bearer")]
    BearerMismatch,
}

/// A routed, signed signal.
#[derive(Debug, Clone)]
pub struct Message {
    /// Destination node.
    pub dest: NodeId,
    /// Sender's verifying key.
    pub source: VerifyingKey,
    /// Optional delegated signing capability.
    pub authorization: Option<Authorization>,
    /// The payload.
    pub signal: Signal,
    /// Signature over the canonical envelope bytes.
    pub signature: Signature,
}

fn signing_bytes(
    dest: NodeId,
    source: &VerifyingKey,
    signal: &Signal,
    authorization: Option<&Authorization>,
) -> BytesMut {
    let canonical = encode_signal(signal);
    let mut bytes = BytesMut::with_capacity(16 + 32 + canonical.len() + 64);
    bytes.put_slice(dest.as_bytes());
    bytes.put_slice(source.as_bytes());
    bytes.put_slice(&canonical);
    if let Some(auth) = authorization {
        bytes.put_slice(&auth.signature.to_bytes());
    }
    bytes
}

impl Message {
    /// Builds and signs a message from a node's own key.
    #[must_use]
    pub fn new(dest: NodeId, key: &NodeKey, signal: Signal) -> Self {
        let source = key.verifying_key();
        let signature = key.sign(&signing_bytes(dest, &source, &signal, None));
        Self {
            dest,
            source,
            authorization: None,
            signal,
            signature,
        }
    }

    /// Builds and signs a message under a delegated authorization.
    ///
    /// The bearer key signs; the embedded authorization names the issuer,
    /// which becomes the effective principal at the receiver.
    #[must_use]
    pub fn with_authorization(
        dest: NodeId,
        client: &ClientAuthorization,
        signal: Signal,
    ) -> Self {
        use ed25519_dalek::Signer;
        let source = client.key.verifying_key();
        let bytes = signing_bytes(dest, &source, &signal, Some(&client.authorization));
        let signature = client.key.sign(&bytes);
        Self {
            dest,
            source,
            authorization: Some(client.authorization.clone()),
            signal,
            signature,
        }
    }

    /// Verifies the envelope signature and any carried authorization.
    ///
    /// # Errors
    ///
    /// - [`MessageError::SignatureInvalid`] when the envelope signature
    ///   fails under the sender key.
    /// - [`MessageError::BearerMismatch`] when an authorization is present
    ///   but the message was not signed by its bearer key.
    /// - [`MessageError::Authorization`] when the issuance chain is broken.
    pub fn verify(&self) -> Result<(), MessageError> {
        let bytes = signing_bytes(
            self.dest,
            &self.source,
            &self.signal,
            self.authorization.as_ref(),
        );
        self.source
            .verify(&bytes, &self.signature)
            .map_err(|_| MessageError::SignatureInvalid)?;

        if let Some(auth) = &self.authorization {
            auth.verify()?;
            if auth.bearer != self.source {
                return Err(MessageError::BearerMismatch);
            }
        }
        Ok(())
    }

    /// The effective principal for policy checks: the authorization issuer
    /// when one is carried, otherwise the sender.
    #[must_use]
    pub fn principal(&self) -> NodeId {
        self.authorization
            .as_ref()
            .map_or_else(|| NodeId::from_key(&self.source), Authorization::principal)
    }

    /// The sender's node id (the reply address).
    #[must_use]
    pub fn sender_id(&self) -> NodeId {
        NodeId::from_key(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{codes, LockAction};

    #[test]
    fn signature_round_trip() {
        let key = NodeKey::generate();
        let dest = NodeKey::generate().node_id();
        let msg = Message::new(dest, &key, Signal::lock(LockAction::Lock));
        msg.verify().expect("valid signature");
        assert_eq!(msg.principal(), key.node_id());
    }

    #[test]
    fn tampered_destination_fails() {
        let key = NodeKey::generate();
        let msg = Message::new(NodeKey::generate().node_id(), &key, Signal::create());
        let mut tampered = msg.clone();
        tampered.dest = NodeKey::generate().node_id();
        assert!(matches!(
            tampered.verify(),
            Err(MessageError::SignatureInvalid)
        ));
    }

    #[test]
    fn tampered_signal_fails() {
        let key = NodeKey::generate();
        let dest = NodeKey::generate().node_id();
        let msg = Message::new(dest, &key, Signal::lock(LockAction::Lock));
        let mut tampered = msg.clone();
        tampered.signal = Signal::lock(LockAction::Unlock);
        assert!(matches!(
            tampered.verify(),
            Err(MessageError::SignatureInvalid)
        ));
    }

    #[test]
    fn reattributed_sender_fails() {
        let key = NodeKey::generate();
        let dest = NodeKey::generate().node_id();
        let msg = Message::new(dest, &key, Signal::error(uuid::Uuid::new_v4(), codes::ACL_DENIED));
        let mut tampered = msg.clone();
        tampered.source = NodeKey::generate().verifying_key();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn authorized_message_acts_as_issuer() {
        let issuer = NodeKey::generate();
        let client = ClientAuthorization::issue(&issuer);
        let dest = NodeKey::generate().node_id();
        let msg = Message::with_authorization(dest, &client, Signal::create());
        msg.verify().expect("valid authorized message");
        assert_eq!(msg.principal(), issuer.node_id());
        assert_ne!(msg.sender_id(), issuer.node_id());
    }

    #[test]
    fn stripped_authorization_fails() {
        let issuer = NodeKey::generate();
        let client = ClientAuthorization::issue(&issuer);
        let dest = NodeKey::generate().node_id();
        let msg = Message::with_authorization(dest, &client, Signal::create());
        // Dropping the authorization changes the signed bytes.
        let mut stripped = msg.clone();
        stripped.authorization = None;
        assert!(matches!(
            stripped.verify(),
            Err(MessageError::SignatureInvalid)
        ));
    }

    #[test]
    fn swapped_bearer_fails() {
        let issuer = NodeKey::generate();
        let client = ClientAuthorization::issue(&issuer);
        let other = ClientAuthorization::issue(&issuer);
        let dest = NodeKey::generate().node_id();
        let mut msg = Message::with_authorization(dest, &client, Signal::create());
        // Replace the authorization with one naming a different bearer; the
        // envelope signature breaks first since it covers the issuance
        // signature.
        msg.authorization = Some(other.authorization.clone());
        assert!(msg.verify().is_err());
    }
}

//! Envelope wire format.
//!
//! An envelope is the transport unit of a message: opaque ciphertext plus
//! routing and authenticity metadata. The node never inspects the
//! ciphertext; it only verifies the sender's signature over the canonical
//! payload before accepting the envelope into a conversation queue.

use crate::crypto::sign;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A signed message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Conversation this envelope belongs to.
    pub conversation_id: String,
    /// Message id, unique within the conversation.
    pub message_id: String,
    /// Opaque end-to-end ciphertext.
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over [`Envelope::canonical_payload`].
    pub signature: Vec<u8>,
    /// Send time (Unix seconds).
    pub sent_at_unix: i64,
    /// Sender user id.
    pub sender_id: String,
}

impl Envelope {
    /// Decode an envelope from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| Error::BadEnvelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("encode envelope: {}", e)))
    }

    /// Reject envelopes with missing required fields.
    pub fn validate(&self) -> Result<()> {
        if self.conversation_id.is_empty()
            || self.message_id.is_empty()
            || self.sender_id.is_empty()
            || self.signature.is_empty()
        {
            return Err(Error::BadEnvelope("missing required field".into()));
        }
        Ok(())
    }

    /// The canonical byte string covered by the signature:
    /// `conversation_id || message_id || sent_at (8 bytes BE) || ciphertext`.
    pub fn canonical_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            self.conversation_id.len() + self.message_id.len() + 8 + self.ciphertext.len(),
        );
        payload.extend_from_slice(self.conversation_id.as_bytes());
        payload.extend_from_slice(self.message_id.as_bytes());
        payload.extend_from_slice(&self.sent_at_unix.to_be_bytes());
        payload.extend_from_slice(&self.ciphertext);
        payload
    }

    /// Sign the canonical payload with the sender's identity key.
    pub fn sign(&mut self, identity: &sign::IdentityKeypair) {
        self.signature = identity.sign(&self.canonical_payload()).to_vec();
    }

    /// Verify the signature under the sender's registered public key.
    pub fn verify(&self, sender_public_key: &[u8]) -> Result<()> {
        sign::verify(
            sender_public_key,
            &self.canonical_payload(),
            &self.signature,
        )
    }
}

//! Messaging envelope service.
//!
//! Ingress path: decode the envelope, look up the sender's registered key,
//! verify the signature over the canonical payload, then append to the
//! durable conversation queue. The node never sees plaintext; ciphertext
//! is opaque end to end.

mod envelope;
mod queue;

pub use envelope::Envelope;
pub use queue::{EnvelopeQueue, Page, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

use crate::error::{Error, Result};
use crate::storage::Database;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Envelope ingress and pull service.
pub struct MessagingService {
    queue: EnvelopeQueue,
    db: Arc<Mutex<Database>>,
}

impl MessagingService {
    /// Create the service.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self {
            queue: EnvelopeQueue::new(db.clone()),
            db,
        }
    }

    /// Accept an envelope from a client or peer.
    ///
    /// Rejects with [`Error::BadEnvelope`] on decode/field problems,
    /// [`Error::UnknownSender`] when the sender has no registered key, and
    /// [`Error::BadSignature`] when the Ed25519 check fails. Accepted
    /// envelopes are enqueued idempotently.
    pub async fn send(&self, envelope_bytes: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(envelope_bytes)?;

        let sender_key = self
            .db
            .lock()
            .await
            .get_public_key(&envelope.sender_id)?
            .ok_or(Error::UnknownSender)?;

        if let Err(e) = envelope.verify(&sender_key) {
            warn!(
                conversation = %envelope.conversation_id,
                sender = %envelope.sender_id,
                "rejected envelope with bad signature"
            );
            return Err(e);
        }

        self.queue
            .enqueue(
                &envelope.conversation_id,
                &envelope.message_id,
                envelope_bytes,
                envelope.sent_at_unix,
            )
            .await?;

        debug!(
            conversation = %envelope.conversation_id,
            message = %envelope.message_id,
            "accepted envelope"
        );
        Ok(())
    }

    /// Plain pull: up to 100 envelopes since the given time.
    pub async fn pull(&self, conversation_id: &str, since_unix: i64) -> Result<Vec<Vec<u8>>> {
        self.queue
            .pull_since(conversation_id, since_unix, DEFAULT_PAGE_SIZE)
            .await
    }

    /// Page-cursor pull.
    pub async fn pull_page(
        &self,
        conversation_id: &str,
        since_unix: i64,
        limit: i64,
    ) -> Result<Page> {
        self.queue.pull_page(conversation_id, since_unix, limit).await
    }

    /// Delete a single envelope.
    pub async fn delete(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.queue.delete(conversation_id, message_id).await
    }
}

//! Durable conversation queue.
//!
//! Envelopes are appended once per (conversation, message) id and read
//! back with a page cursor ordered by send time. Retention is an external
//! concern; the queue only ever appends, pages, and deletes.

use crate::error::{Error, Result};
use crate::storage::Database;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default page size when the caller passes `limit <= 0`.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Hard cap on a single page.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// One page of envelopes.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Raw envelope bytes, oldest first.
    pub envelopes: Vec<Vec<u8>>,
    /// Cursor for the next call: `sent_at` of the last returned envelope.
    pub next_since: i64,
    /// Whether more envelopes exist past this page.
    pub has_more: bool,
}

/// Durable envelope queue over the node database.
pub struct EnvelopeQueue {
    db: Arc<Mutex<Database>>,
}

impl EnvelopeQueue {
    /// Create the queue.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Append an envelope. Idempotent on (conversation, message) id.
    pub async fn enqueue(
        &self,
        conversation_id: &str,
        message_id: &str,
        envelope: &[u8],
        sent_at: i64,
    ) -> Result<()> {
        self.db
            .lock()
            .await
            .insert_message(conversation_id, message_id, envelope, sent_at)
    }

    /// Envelopes with `sent_at >= since`, oldest first, up to `limit`.
    pub async fn pull_since(
        &self,
        conversation_id: &str,
        since_unix: i64,
        limit: i64,
    ) -> Result<Vec<Vec<u8>>> {
        let limit = clamp_limit(limit);
        let rows = self
            .db
            .lock()
            .await
            .select_messages(conversation_id, since_unix, limit)?;
        Ok(rows.into_iter().map(|(envelope, _)| envelope).collect())
    }

    /// Page-cursor read.
    ///
    /// Fetches `limit + 1` rows; when the extra row exists the page
    /// reports `has_more` and drops it. `next_since` is the `sent_at` of
    /// the last returned envelope.
    pub async fn pull_page(
        &self,
        conversation_id: &str,
        since_unix: i64,
        limit: i64,
    ) -> Result<Page> {
        let limit = clamp_limit(limit);
        let mut rows = self
            .db
            .lock()
            .await
            .select_messages(conversation_id, since_unix, limit + 1)?;

        let has_more = rows.len() as i64 > limit;
        if has_more {
            rows.truncate(limit as usize);
        }
        let next_since = rows.last().map(|(_, sent_at)| *sent_at).unwrap_or(since_unix);

        Ok(Page {
            envelopes: rows.into_iter().map(|(envelope, _)| envelope).collect(),
            next_since,
            has_more,
        })
    }

    /// Delete a single envelope.
    pub async fn delete(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        if self
            .db
            .lock()
            .await
            .delete_message(conversation_id, message_id)?
        {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }
}

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> EnvelopeQueue {
        EnvelopeQueue::new(Arc::new(Mutex::new(
            Database::open_in_memory().expect("open"),
        )))
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let q = queue();
        q.enqueue("c1", "m1", b"envelope", 100).await.expect("enqueue");
        q.enqueue("c1", "m1", b"different bytes", 100)
            .await
            .expect("duplicate enqueue");

        let page = q.pull_page("c1", 0, 10).await.expect("pull");
        assert_eq!(page.envelopes.len(), 1);
        assert_eq!(page.envelopes[0], b"envelope");
    }

    #[tokio::test]
    async fn test_page_cursor() {
        let q = queue();
        for i in 0..5 {
            q.enqueue("c1", &format!("m{}", i), format!("e{}", i).as_bytes(), 100 + i)
                .await
                .expect("enqueue");
        }

        let page = q.pull_page("c1", 0, 2).await.expect("pull");
        assert_eq!(page.envelopes, vec![b"e0".to_vec(), b"e1".to_vec()]);
        assert!(page.has_more);
        assert_eq!(page.next_since, 101);

        // Resuming from the cursor re-reads the boundary row.
        let page = q.pull_page("c1", page.next_since, 2).await.expect("pull");
        assert_eq!(page.envelopes, vec![b"e1".to_vec(), b"e2".to_vec()]);
        assert!(page.has_more);

        let page = q.pull_page("c1", 103, 10).await.expect("pull");
        assert_eq!(page.envelopes, vec![b"e3".to_vec(), b"e4".to_vec()]);
        assert!(!page.has_more);
        assert_eq!(page.next_since, 104);
    }

    #[tokio::test]
    async fn test_empty_page() {
        let q = queue();
        let page = q.pull_page("nothing-here", 0, 10).await.expect("pull");
        assert!(page.envelopes.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.next_since, 0);
    }

    #[tokio::test]
    async fn test_limit_defaults_and_caps() {
        let q = queue();
        for i in 0..120 {
            q.enqueue("c1", &format!("m{:03}", i), b"e", i).await.expect("enqueue");
        }

        // limit <= 0 falls back to the default page size.
        let page = q.pull_page("c1", 0, 0).await.expect("pull");
        assert_eq!(page.envelopes.len(), DEFAULT_PAGE_SIZE as usize);
        assert!(page.has_more);

        // Oversized limits are capped rather than honored.
        let rows = q.pull_since("c1", 0, 5000).await.expect("pull");
        assert_eq!(rows.len(), 120);
    }

    #[tokio::test]
    async fn test_delete() {
        let q = queue();
        q.enqueue("c1", "m1", b"e", 1).await.expect("enqueue");

        q.delete("c1", "m1").await.expect("delete");
        assert!(matches!(
            q.delete("c1", "m1").await,
            Err(Error::NotFound)
        ));
    }
}

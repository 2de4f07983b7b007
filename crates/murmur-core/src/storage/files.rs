//! Content-addressed file storage.
//!
//! Files travel as client-streamed CAR chunks. The service reassembles them
//! under a byte cap, verifies the declared BLAKE3 digest over the whole CAR,
//! hands the bytes to the external content store, pins when enabled, and
//! records a `files` row. Downloads re-chunk the exported CAR through a
//! bounded channel so a slow consumer throttles the export.

use super::Database;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Chunk size for streamed downloads (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default cap on a reconstructed CAR (256 MiB).
pub const DEFAULT_MAX_CAR_BYTES: u64 = 256 * 1024 * 1024;

/// External content store contract.
///
/// The IPFS-backed implementation lives outside this crate; tests use
/// [`MemoryContentStore`].
pub trait ContentStore: Send + Sync {
    /// Import a CAR and return its content id.
    fn add_car(&self, bytes: Vec<u8>) -> impl std::future::Future<Output = Result<String>> + Send;
    /// Export the CAR for a content id.
    fn export_car(&self, cid: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    /// Pin a content id so it survives garbage collection.
    fn pin_add(&self, cid: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// A stored file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// File identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Content id in the external store.
    pub cid: String,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// Size in bytes as declared by the uploader.
    pub size_bytes: i64,
    /// Creation time (Unix seconds).
    pub created_at: i64,
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// New file row id.
    pub file_id: String,
    /// Content id returned by the store.
    pub cid: String,
}

/// File service over an external content store.
pub struct FileService<S> {
    store: S,
    db: Arc<Mutex<Database>>,
    pinning_enabled: bool,
    max_car_bytes: u64,
}

impl<S: ContentStore> FileService<S> {
    /// Create a file service.
    pub fn new(store: S, db: Arc<Mutex<Database>>, pinning_enabled: bool) -> Self {
        Self {
            store,
            db,
            pinning_enabled,
            max_car_bytes: DEFAULT_MAX_CAR_BYTES,
        }
    }

    /// Override the reconstruction byte cap.
    pub fn with_max_car_bytes(mut self, max: u64) -> Self {
        self.max_car_bytes = max;
        self
    }

    /// Accept a client-streamed upload.
    ///
    /// Drains `chunks` until the sender closes it, enforcing the byte cap
    /// incrementally. When `expected_blake3` is non-empty, the digest of
    /// the reconstructed CAR must match or the upload is rejected with
    /// [`Error::Blake3Mismatch`] before anything reaches the store.
    pub async fn put_file(
        &self,
        user_id: &str,
        name: &str,
        mime: &str,
        declared_size: i64,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        expected_blake3: &[u8],
    ) -> Result<PutOutcome> {
        let mut car = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            if (car.len() + chunk.len()) as u64 > self.max_car_bytes {
                return Err(Error::SizeLimitExceeded);
            }
            car.extend_from_slice(&chunk);
        }

        if !expected_blake3.is_empty() {
            let digest = blake3::hash(&car);
            if !crate::crypto::constant_time_eq(digest.as_bytes(), expected_blake3) {
                return Err(Error::Blake3Mismatch);
            }
        }

        let cid = self.store.add_car(car).await?;
        if self.pinning_enabled {
            self.store.pin_add(&cid).await?;
        }

        let record = FileRecord {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            cid: cid.clone(),
            name: name.to_string(),
            mime: mime.to_string(),
            size_bytes: declared_size,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.db.lock().await.insert_file(&record)?;

        tracing::debug!(file_id = %record.id, size = declared_size, "stored file");
        Ok(PutOutcome {
            file_id: record.id,
            cid,
        })
    }

    /// Stream the CAR for a content id.
    ///
    /// The returned channel is bounded at capacity 2: a slow consumer
    /// blocks the producer instead of buffering the whole export.
    pub async fn get_file(&self, cid: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let car = self.store.export_car(cid).await?;
        let (tx, rx) = mpsc::channel(2);

        tokio::spawn(async move {
            for chunk in car.chunks(CHUNK_SIZE) {
                if tx.send(chunk.to_vec()).await.is_err() {
                    // Consumer went away; stop exporting.
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Look up a stored file row.
    pub async fn file_by_cid(&self, cid: &str) -> Result<Option<FileRecord>> {
        self.db.lock().await.file_by_cid(cid)
    }
}

/// In-memory content store used by tests.
#[derive(Default)]
pub struct MemoryContentStore {
    inner: tokio::sync::RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    cars: std::collections::HashMap<String, Vec<u8>>,
    pinned: std::collections::HashSet<String>,
}

impl MemoryContentStore {
    /// Whether a content id has been pinned.
    pub async fn is_pinned(&self, cid: &str) -> bool {
        self.inner.read().await.pinned.contains(cid)
    }
}

impl ContentStore for MemoryContentStore {
    async fn add_car(&self, bytes: Vec<u8>) -> Result<String> {
        let cid = blake3::hash(&bytes).to_hex().to_string();
        self.inner.write().await.cars.insert(cid.clone(), bytes);
        Ok(cid)
    }

    async fn export_car(&self, cid: &str) -> Result<Vec<u8>> {
        self.inner
            .read()
            .await
            .cars
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::Unavailable("unknown cid".into()))
    }

    async fn pin_add(&self, cid: &str) -> Result<()> {
        self.inner.write().await.pinned.insert(cid.to_string());
        Ok(())
    }
}

impl<S: ContentStore> ContentStore for Arc<S> {
    async fn add_car(&self, bytes: Vec<u8>) -> Result<String> {
        (**self).add_car(bytes).await
    }

    async fn export_car(&self, cid: &str) -> Result<Vec<u8>> {
        (**self).export_car(cid).await
    }

    async fn pin_add(&self, cid: &str) -> Result<()> {
        (**self).pin_add(cid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_in_memory().expect("open")))
    }

    async fn feed(chunks: Vec<Vec<u8>>) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let store = Arc::new(MemoryContentStore::default());
        let service = FileService::new(store.clone(), test_db(), true);

        let data = vec![7u8; 3 * 1024];
        let digest = blake3::hash(&data);
        let rx = feed(data.chunks(1024).map(|c| c.to_vec()).collect()).await;

        let outcome = service
            .put_file("u1", "photo.png", "image/png", data.len() as i64, rx, digest.as_bytes())
            .await
            .expect("put");
        assert!(store.is_pinned(&outcome.cid).await);

        let record = service
            .file_by_cid(&outcome.cid)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(record.name, "photo.png");
        assert_eq!(record.size_bytes, data.len() as i64);

        let mut rx = service.get_file(&outcome.cid).await.expect("get");
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_blake3_mismatch_rejected() {
        let store = Arc::new(MemoryContentStore::default());
        let service = FileService::new(store.clone(), test_db(), true);

        let rx = feed(vec![b"some car bytes".to_vec()]).await;
        let result = service
            .put_file("u1", "f", "application/octet-stream", 14, rx, &[0u8; 32])
            .await;
        assert!(matches!(result, Err(Error::Blake3Mismatch)));
        assert!(!store.is_pinned("anything").await);
    }

    #[tokio::test]
    async fn test_size_cap_enforced() {
        let store = Arc::new(MemoryContentStore::default());
        let service = FileService::new(store, test_db(), false).with_max_car_bytes(1024);

        let rx = feed(vec![vec![0u8; 600], vec![0u8; 600]]).await;
        let result = service
            .put_file("u1", "big", "application/octet-stream", 1200, rx, &[])
            .await;
        assert!(matches!(result, Err(Error::SizeLimitExceeded)));
    }

    #[tokio::test]
    async fn test_no_digest_skips_verification() {
        let store = Arc::new(MemoryContentStore::default());
        let service = FileService::new(store.clone(), test_db(), false);

        let rx = feed(vec![b"unverified".to_vec()]).await;
        let outcome = service
            .put_file("u1", "f", "text/plain", 10, rx, &[])
            .await
            .expect("put");
        assert!(!store.is_pinned(&outcome.cid).await);
    }

    #[tokio::test]
    async fn test_get_unknown_cid_fails() {
        let store = Arc::new(MemoryContentStore::default());
        let service = FileService::new(store, test_db(), false);
        assert!(service.get_file("missing").await.is_err());
    }
}

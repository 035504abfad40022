use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crucible_core::{ChatId, ContentHash, FileMetadata};

use crate::error::StoreError;

/// Outcome of a reclamation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Metadata sidecars removed (expired or exhausted).
    pub metadata_removed: u64,
    /// Blobs removed because no live sidecar references them.
    pub blobs_removed: u64,
    /// Abandoned temp files removed.
    pub temp_removed: u64,
}

/// Content-addressed blob store with per-(tenant, filename, hash) metadata.
///
/// Layout under the storage root:
///
/// ```text
/// blobs/<2-hex-shard>/<hash>        immutable blob bytes
/// meta/<tenant>/<hash>__<filename>.json   metadata sidecar
/// tmp/                              in-progress writes
/// ```
///
/// Blobs are published by atomic rename, so a blob path either does not
/// exist or holds complete bytes. All metadata mutation happens under a
/// per-key advisory lock.
pub struct FileStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Files in `blobs/` and `tmp/` younger than this are exempt from
    /// reclamation, so a sweep never races an in-flight `put` between
    /// blob publication and sidecar creation.
    reclaim_grace: Duration,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["blobs", "meta", "tmp"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            root,
            locks: DashMap::new(),
            reclaim_grace: Duration::from_secs(15 * 60),
        })
    }

    /// Override the reclamation grace window.
    #[must_use]
    pub fn with_reclaim_grace(mut self, grace: Duration) -> Self {
        self.reclaim_grace = grace;
        self
    }

    /// Store a blob and register metadata for it.
    ///
    /// Idempotent on the blob: re-putting identical bytes is a no-op at the
    /// blob layer. Metadata for an already-registered (tenant, filename,
    /// hash) is merged by taking the stricter policy: the smaller
    /// remaining-download count and the earlier expiry, never extending.
    pub async fn put(
        &self,
        tenant: &ChatId,
        filename: &str,
        data: Bytes,
        remaining_downloads: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ContentHash, FileMetadata), StoreError> {
        validate_component(tenant.as_str())?;
        validate_component(filename)?;

        let hash = ContentHash::of(&data);
        let size = data.len() as u64;

        // Stage the bytes in tmp/, then publish by rename. A blob that is
        // already present wins; bytes are immutable per hash.
        let blob = self.blob_path(&hash);
        if tokio::fs::metadata(&blob).await.is_err() {
            let staged = self.temp_path();
            let mut file = tokio::fs::File::create(&staged).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);

            tokio::fs::create_dir_all(blob.parent().expect("blob path has a shard dir")).await?;
            match tokio::fs::rename(&staged, &blob).await {
                Ok(()) => debug!(hash = %hash, size, "blob stored"),
                Err(e) => {
                    // Lost a race with a concurrent identical put.
                    let _ = tokio::fs::remove_file(&staged).await;
                    if tokio::fs::metadata(&blob).await.is_err() {
                        return Err(e.into());
                    }
                }
            }
        }

        let key = self.meta_key(tenant, filename, &hash);
        let _guard = self.lock_for(&key).lock_owned().await;

        let fresh = FileMetadata::new(size, Utc::now(), remaining_downloads, expires_at);
        let merged = match self.read_sidecar(tenant, filename, &hash).await? {
            Some(mut existing) => {
                existing.merge_stricter(&fresh);
                existing
            }
            None => fresh,
        };
        self.write_sidecar(tenant, filename, &hash, &merged).await?;
        info!(
            tenant = %tenant,
            filename,
            hash = %hash,
            remaining = ?merged.remaining_downloads,
            expires = ?merged.expires_at,
            "file registered"
        );
        Ok((hash, merged))
    }

    /// Read a blob back, enforcing expiry and quota.
    ///
    /// `decrement_quota` is set for user-facing downloads only; workspace
    /// projection reads with it unset and does not consume downloads.
    pub async fn get(
        &self,
        tenant: &ChatId,
        filename: &str,
        hash: &ContentHash,
        decrement_quota: bool,
    ) -> Result<(FileMetadata, Bytes), StoreError> {
        let key = self.meta_key(tenant, filename, hash);
        let _guard = self.lock_for(&key).lock_owned().await;

        let mut meta = self
            .read_sidecar(tenant, filename, hash)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let now = Utc::now();
        if meta.is_expired(now) {
            // Mark exhausted so reclamation picks the entry up even when
            // the clock is later wound back.
            if !meta.is_exhausted() {
                meta.remaining_downloads = Some(0);
                self.write_sidecar(tenant, filename, hash, &meta).await?;
            }
            return Err(StoreError::Expired(key));
        }
        if meta.is_exhausted() {
            return Err(StoreError::QuotaExhausted(key));
        }

        let bytes = match tokio::fs::read(self.blob_path(hash)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key))
            }
            Err(e) => return Err(e.into()),
        };

        if decrement_quota {
            meta.decrement();
            self.write_sidecar(tenant, filename, hash, &meta).await?;
            debug!(key, remaining = ?meta.remaining_downloads, "download counted");
        }
        Ok((meta, bytes))
    }

    /// Metadata for an identity without touching the quota.
    pub async fn metadata(
        &self,
        tenant: &ChatId,
        filename: &str,
        hash: &ContentHash,
    ) -> Result<FileMetadata, StoreError> {
        let key = self.meta_key(tenant, filename, hash);
        let _guard = self.lock_for(&key).lock_owned().await;
        self.read_sidecar(tenant, filename, hash)
            .await?
            .ok_or(StoreError::NotFound(key))
    }

    /// Kill an entry: zero the quota and pull the expiry to now. Idempotent;
    /// unknown entries are `NotFound`.
    pub async fn expire(
        &self,
        tenant: &ChatId,
        filename: &str,
        hash: &ContentHash,
    ) -> Result<(), StoreError> {
        let key = self.meta_key(tenant, filename, hash);
        let _guard = self.lock_for(&key).lock_owned().await;

        let mut meta = self
            .read_sidecar(tenant, filename, hash)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let now = Utc::now();
        meta.remaining_downloads = Some(0);
        meta.expires_at = Some(meta.expires_at.map_or(now, |at| at.min(now)));
        self.write_sidecar(tenant, filename, hash, &meta).await?;
        info!(key, "file expired");
        Ok(())
    }

    /// Background sweep: drop dead sidecars, then blobs no live sidecar
    /// references, then abandoned temp files. Fresh files (younger than the
    /// grace window) are never touched.
    pub async fn reclaim(&self) -> Result<ReclaimStats, StoreError> {
        let now = Utc::now();
        let mut stats = ReclaimStats::default();
        let mut live_hashes: HashSet<String> = HashSet::new();

        let meta_root = self.root.join("meta");
        let mut tenants = tokio::fs::read_dir(&meta_root).await?;
        while let Some(tenant_dir) = tenants.next_entry().await? {
            let mut entries = tokio::fs::read_dir(tenant_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(hash) = sidecar_hash(&path) else {
                    continue;
                };
                match read_sidecar_at(&path).await {
                    Ok(meta) if meta.is_live(now) => {
                        live_hashes.insert(hash);
                    }
                    Ok(_) => {
                        tokio::fs::remove_file(&path).await?;
                        stats.metadata_removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable sidecar left in place");
                    }
                }
            }
        }

        let blob_root = self.root.join("blobs");
        let mut shards = tokio::fs::read_dir(&blob_root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let name = blob.file_name().to_string_lossy().into_owned();
                if live_hashes.contains(&name) {
                    continue;
                }
                if self.is_within_grace(&blob.path()).await {
                    continue;
                }
                tokio::fs::remove_file(blob.path()).await?;
                stats.blobs_removed += 1;
            }
        }

        let mut temps = tokio::fs::read_dir(self.root.join("tmp")).await?;
        while let Some(temp) = temps.next_entry().await? {
            if self.is_within_grace(&temp.path()).await {
                continue;
            }
            tokio::fs::remove_file(temp.path()).await?;
            stats.temp_removed += 1;
        }

        if stats != ReclaimStats::default() {
            info!(
                metadata = stats.metadata_removed,
                blobs = stats.blobs_removed,
                temps = stats.temp_removed,
                "reclamation sweep finished"
            );
        }
        Ok(stats)
    }

    async fn is_within_grace(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return true;
        };
        let Ok(modified) = meta.modified() else {
            return true;
        };
        SystemTime::now()
            .duration_since(modified)
            .map_or(true, |age| age < self.reclaim_grace)
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let shard = &hash.as_str()[..2];
        self.root.join("blobs").join(shard).join(hash.as_str())
    }

    fn sidecar_path(&self, tenant: &ChatId, filename: &str, hash: &ContentHash) -> PathBuf {
        self.root
            .join("meta")
            .join(tenant.as_str())
            .join(format!("{hash}__{filename}.json"))
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join("tmp").join(Uuid::new_v4().to_string())
    }

    fn meta_key(&self, tenant: &ChatId, filename: &str, hash: &ContentHash) -> String {
        format!("{tenant}/{hash}/{filename}")
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_sidecar(
        &self,
        tenant: &ChatId,
        filename: &str,
        hash: &ContentHash,
    ) -> Result<Option<FileMetadata>, StoreError> {
        match read_sidecar_at(&self.sidecar_path(tenant, filename, hash)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_sidecar(
        &self,
        tenant: &ChatId,
        filename: &str,
        hash: &ContentHash,
        meta: &FileMetadata,
    ) -> Result<(), StoreError> {
        let path = self.sidecar_path(tenant, filename, hash);
        tokio::fs::create_dir_all(path.parent().expect("sidecar path has a tenant dir")).await?;
        let staged = self.temp_path();
        tokio::fs::write(&staged, serde_json::to_vec_pretty(meta)?).await?;
        tokio::fs::rename(&staged, &path).await?;
        Ok(())
    }
}

async fn read_sidecar_at(path: &Path) -> Result<FileMetadata, StoreError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Recover the blob hash from a sidecar file name (`<hash>__<name>.json`).
fn sidecar_hash(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (hash, _) = name.split_once("__")?;
    (hash.len() == 64).then(|| hash.to_owned())
}

/// Tenant ids and filenames become single path components on disk.
fn validate_component(value: &str) -> Result<(), StoreError> {
    if value.is_empty()
        || value.len() > 255
        || value == "."
        || value == ".."
        || value
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
    {
        return Err(StoreError::InvalidKey(format!(
            "not a valid storage key component: {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path())
            .await
            .unwrap()
            .with_reclaim_grace(Duration::ZERO);
        (dir, store)
    }

    fn tenant() -> ChatId {
        ChatId::from("chat-1")
    }

    #[tokio::test]
    async fn put_get_roundtrip_preserves_bytes_and_hash() {
        let (_dir, store) = store().await;
        let body = Bytes::from_static(b"a,b\n1,2\n");

        let (hash, meta) = store
            .put(&tenant(), "data.csv", body.clone(), None, None)
            .await
            .unwrap();
        assert_eq!(hash, ContentHash::of(&body));
        assert_eq!(meta.size, 8);

        let (_, bytes) = store
            .get(&tenant(), "data.csv", &hash, true)
            .await
            .unwrap();
        assert_eq!(bytes, body);
        assert_eq!(ContentHash::of(&bytes), hash);
    }

    #[tokio::test]
    async fn quota_allows_exactly_n_downloads() {
        let (_dir, store) = store().await;
        let (hash, _) = store
            .put(&tenant(), "f.txt", Bytes::from_static(b"x"), Some(2), None)
            .await
            .unwrap();

        for _ in 0..2 {
            store.get(&tenant(), "f.txt", &hash, true).await.unwrap();
        }
        let err = store.get(&tenant(), "f.txt", &hash, true).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExhausted(_)));
    }

    #[tokio::test]
    async fn projection_reads_do_not_consume_quota() {
        let (_dir, store) = store().await;
        let (hash, _) = store
            .put(&tenant(), "f.txt", Bytes::from_static(b"x"), Some(1), None)
            .await
            .unwrap();

        for _ in 0..3 {
            store.get(&tenant(), "f.txt", &hash, false).await.unwrap();
        }
        // The single user-facing download still works afterwards.
        store.get(&tenant(), "f.txt", &hash, true).await.unwrap();
    }

    #[tokio::test]
    async fn expired_files_are_never_served() {
        let (_dir, store) = store().await;
        let past = Utc::now() - chrono::Duration::seconds(1);
        let (hash, _) = store
            .put(&tenant(), "f.txt", Bytes::from_static(b"x"), None, Some(past))
            .await
            .unwrap();

        let err = store.get(&tenant(), "f.txt", &hash, true).await.unwrap_err();
        assert!(matches!(err, StoreError::Expired(_)));
    }

    #[tokio::test]
    async fn reput_merges_to_the_stricter_policy() {
        let (_dir, store) = store().await;
        let body = Bytes::from_static(b"same bytes");
        let later = Utc::now() + chrono::Duration::hours(2);
        let sooner = Utc::now() + chrono::Duration::hours(1);

        store
            .put(&tenant(), "f.txt", body.clone(), Some(5), Some(later))
            .await
            .unwrap();
        let (_, merged) = store
            .put(&tenant(), "f.txt", body, Some(3), Some(sooner))
            .await
            .unwrap();

        assert_eq!(merged.remaining_downloads, Some(3));
        assert_eq!(merged.expires_at, Some(sooner));
    }

    #[tokio::test]
    async fn same_bytes_different_tenants_share_the_blob() {
        let (dir, store) = store().await;
        let body = Bytes::from_static(b"shared");
        let (h1, _) = store
            .put(&ChatId::from("a"), "f.txt", body.clone(), None, None)
            .await
            .unwrap();
        let (h2, _) = store
            .put(&ChatId::from("b"), "g.txt", body, None, None)
            .await
            .unwrap();
        assert_eq!(h1, h2);

        let shard = dir.path().join("blobs").join(&h1.as_str()[..2]);
        let blobs: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn expire_is_idempotent_and_blocks_downloads() {
        let (_dir, store) = store().await;
        let (hash, _) = store
            .put(&tenant(), "f.txt", Bytes::from_static(b"x"), Some(5), None)
            .await
            .unwrap();

        store.expire(&tenant(), "f.txt", &hash).await.unwrap();
        store.expire(&tenant(), "f.txt", &hash).await.unwrap();

        let err = store.get(&tenant(), "f.txt", &hash, true).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Expired(_) | StoreError::QuotaExhausted(_)
        ));
    }

    #[tokio::test]
    async fn expire_unknown_entry_is_not_found() {
        let (_dir, store) = store().await;
        let hash = ContentHash::of(b"never stored");
        let err = store.expire(&tenant(), "f.txt", &hash).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn reclaim_removes_dead_entries_and_orphan_blobs() {
        let (dir, store) = store().await;
        let (dead_hash, _) = store
            .put(&tenant(), "dead.txt", Bytes::from_static(b"dead"), Some(0), None)
            .await
            .unwrap();
        let (live_hash, _) = store
            .put(&tenant(), "live.txt", Bytes::from_static(b"live"), None, None)
            .await
            .unwrap();

        let stats = store.reclaim().await.unwrap();
        assert_eq!(stats.metadata_removed, 1);
        assert_eq!(stats.blobs_removed, 1);

        assert!(!dir
            .path()
            .join("blobs")
            .join(&dead_hash.as_str()[..2])
            .join(dead_hash.as_str())
            .exists());
        assert!(dir
            .path()
            .join("blobs")
            .join(&live_hash.as_str()[..2])
            .join(live_hash.as_str())
            .exists());

        let err = store
            .get(&tenant(), "dead.txt", &dead_hash, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn grace_window_shields_fresh_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        // Orphan blob with no sidecar, but fresh: must survive the sweep.
        let (hash, _) = store
            .put(&tenant(), "f.txt", Bytes::from_static(b"fresh"), Some(0), None)
            .await
            .unwrap();
        let stats = store.reclaim().await.unwrap();
        assert_eq!(stats.blobs_removed, 0);
        assert!(dir
            .path()
            .join("blobs")
            .join(&hash.as_str()[..2])
            .join(hash.as_str())
            .exists());
    }

    #[tokio::test]
    async fn hostile_keys_are_rejected() {
        let (_dir, store) = store().await;
        let body = Bytes::from_static(b"x");
        assert!(store
            .put(&ChatId::from("../escape"), "f.txt", body.clone(), None, None)
            .await
            .is_err());
        assert!(store
            .put(&tenant(), "a/b.txt", body.clone(), None, None)
            .await
            .is_err());
        assert!(store.put(&tenant(), "", body, None, None).await.is_err());
    }
}

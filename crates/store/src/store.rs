use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{StoreError, validate::validate_identifier};

/// Tunables for the chunk store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Largest accepted chunk body; larger declarations are rejected before
    /// any byte is read.
    pub max_chunk_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024 * 1024,
        }
    }
}

/// Status resolution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// The artifact was already assembled; nothing needs uploading.
    Complete { location: PathBuf },
    /// No artifact yet; `stored` lists staged chunk indices in numeric order
    /// (empty when no chunk set exists).
    Partial { stored: Vec<u32> },
}

/// Filesystem-backed chunk store.
///
/// Chunk writes for distinct (fingerprint, index) pairs are independent;
/// the only serialized operation is the merge, which holds a per-fingerprint
/// mutex and rejects late chunk writes for that fingerprint while it runs.
pub struct ChunkStore {
    artifacts_root: PathBuf,
    staging_root: PathBuf,
    config: StoreConfig,
    merge_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    merging: Arc<StdMutex<HashSet<String>>>,
}

impl ChunkStore {
    /// Opens a store rooted at the given directories, creating them if absent.
    pub fn new(
        artifacts_root: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let artifacts_root = artifacts_root.into();
        let staging_root = staging_root.into();
        std::fs::create_dir_all(&artifacts_root)?;
        std::fs::create_dir_all(&staging_root)?;
        Ok(Self {
            artifacts_root,
            staging_root,
            config,
            merge_locks: StdMutex::new(HashMap::new()),
            merging: Arc::new(StdMutex::new(HashSet::new())),
        })
    }

    fn staging_dir(&self, fingerprint: &str) -> PathBuf {
        self.staging_root.join(fingerprint)
    }

    fn chunk_path(&self, fingerprint: &str, index: u32) -> PathBuf {
        self.staging_dir(fingerprint).join(index.to_string())
    }

    fn artifact_path(&self, name: &str) -> PathBuf {
        self.artifacts_root.join(name)
    }

    fn merge_lock(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.merge_locks.lock().unwrap();
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Removes a fingerprint's lock entry once no merge holds a clone of it,
    /// so the map does not grow with every fingerprint the server ever saw.
    fn prune_merge_lock(&self, fingerprint: &str) {
        let mut locks = self.merge_locks.lock().unwrap();
        if let Some(lock) = locks.get(fingerprint)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(fingerprint);
        }
    }

    fn is_merging(&self, fingerprint: &str) -> bool {
        self.merging.lock().unwrap().contains(fingerprint)
    }

    // -----------------------------------------------------------------------
    // Chunk receive
    // -----------------------------------------------------------------------

    /// Opens a staging slot for one chunk.
    ///
    /// The staging directory is created lazily; `create_dir_all` makes
    /// concurrent first-arrivals for the same fingerprint race-safe. Bytes
    /// go to a temporary file that only becomes the chunk on
    /// [`StagedChunk::commit`]; dropping the guard without committing
    /// deletes the partial file, so a merge can never observe truncated
    /// data. Re-receiving an index overwrites the previous chunk.
    pub async fn begin_chunk(
        &self,
        fingerprint: &str,
        index: u32,
        declared_size: u64,
        checksum: &str,
    ) -> Result<StagedChunk, StoreError> {
        validate_identifier(fingerprint, "fingerprint")?;

        if declared_size > self.config.max_chunk_size {
            return Err(StoreError::ChunkTooLarge {
                size: declared_size,
                max: self.config.max_chunk_size,
            });
        }

        if self.is_merging(fingerprint) {
            return Err(StoreError::MergeInProgress(fingerprint.to_string()));
        }

        let dir = self.staging_dir(fingerprint);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.chunk_path(fingerprint, index);
        let tmp_path = dir.join(format!("{index}.part"));
        let file = tokio::fs::File::create(&tmp_path).await?;

        debug!(fingerprint, index, declared_size, "chunk staging started");

        Ok(StagedChunk {
            file: Some(file),
            tmp_path,
            final_path,
            declared: declared_size,
            received: 0,
            hasher: if checksum.is_empty() {
                None
            } else {
                Some(Sha256::new())
            },
            expected_checksum: checksum.to_string(),
            committed: false,
        })
    }

    /// Stores a complete in-memory chunk. Convenience over
    /// [`begin_chunk`](Self::begin_chunk) for non-streaming callers.
    pub async fn put_chunk(
        &self,
        fingerprint: &str,
        index: u32,
        data: &[u8],
    ) -> Result<u64, StoreError> {
        let mut staged = self
            .begin_chunk(fingerprint, index, data.len() as u64, "")
            .await?;
        staged.write(data).await?;
        staged.commit().await
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Reports whether the artifact exists, or which chunk indices are
    /// staged. Read-only and safe under arbitrary concurrent callers; an
    /// absent chunk set is an empty result, not an error.
    pub async fn status(
        &self,
        fingerprint: &str,
        artifact_name: &str,
    ) -> Result<ArtifactStatus, StoreError> {
        validate_identifier(fingerprint, "fingerprint")?;
        validate_identifier(artifact_name, "artifactName")?;

        let artifact = self.artifact_path(artifact_name);
        if tokio::fs::try_exists(&artifact).await? {
            return Ok(ArtifactStatus::Complete { location: artifact });
        }

        Ok(ArtifactStatus::Partial {
            stored: self.stored_indices(fingerprint).await?,
        })
    }

    /// Lists staged chunk indices in numeric order.
    ///
    /// Only file names that parse as u32 count; in-flight `.part` files and
    /// anything else are ignored. Sorting is numeric — a lexicographic sort
    /// would order "10" before "2" and corrupt any merge past 9 chunks.
    async fn stored_indices(&self, fingerprint: &str) -> Result<Vec<u32>, StoreError> {
        let dir = self.staging_dir(fingerprint);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && let Ok(index) = name.parse::<u32>()
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Assembles all staged chunks, in numeric index order, into the named
    /// artifact.
    ///
    /// Holds the per-fingerprint merge lock for the whole pass and marks the
    /// fingerprint as merging so late chunk writes are rejected instead of
    /// changing the count mid-merge. On success the artifact appears
    /// atomically (rename from a `.part` temp) and the staging directory is
    /// removed. On I/O failure or cancellation only the partial destination
    /// is deleted; the chunk set stays intact so the client can retry the
    /// merge without re-uploading.
    pub async fn merge(
        &self,
        fingerprint: &str,
        artifact_name: &str,
        expected_chunks: u32,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StoreError> {
        validate_identifier(fingerprint, "fingerprint")?;
        validate_identifier(artifact_name, "artifactName")?;

        let lock = self.merge_lock(fingerprint);
        let result = {
            let _guard = lock.lock().await;
            self.merge_locked(fingerprint, artifact_name, expected_chunks, cancel)
                .await
        };
        drop(lock);
        self.prune_merge_lock(fingerprint);
        result
    }

    async fn merge_locked(
        &self,
        fingerprint: &str,
        artifact_name: &str,
        expected_chunks: u32,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StoreError> {
        let artifact = self.artifact_path(artifact_name);

        // A retried merge after a completed one is a success, not a
        // mismatch against the now-empty staging area.
        if tokio::fs::try_exists(&artifact).await? {
            return Ok(artifact);
        }

        let _marker = MergingMarker::set(&self.merging, fingerprint);

        let indices = self.stored_indices(fingerprint).await?;
        let actual = indices.len() as u32;
        if actual != expected_chunks {
            return Err(StoreError::CountMismatch {
                expected: expected_chunks,
                actual,
            });
        }

        let tmp = self.artifacts_root.join(format!("{artifact_name}.part"));
        match self
            .assemble(fingerprint, &indices, &tmp, cancel)
            .await
        {
            Ok(total_bytes) => {
                tokio::fs::rename(&tmp, &artifact).await?;
                if let Err(e) = tokio::fs::remove_dir_all(self.staging_dir(fingerprint)).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(fingerprint, error = %e, "failed to remove staging directory");
                }
                info!(
                    fingerprint,
                    artifact = artifact_name,
                    chunks = actual,
                    total_bytes,
                    "merge complete"
                );
                Ok(artifact)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&tmp).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(artifact = artifact_name, error = %rm, "failed to remove partial artifact");
                }
                warn!(fingerprint, artifact = artifact_name, error = %e, "merge rolled back");
                Err(e)
            }
        }
    }

    /// Streams every chunk into `dest`, checking cancellation at chunk
    /// boundaries.
    async fn assemble(
        &self,
        fingerprint: &str,
        indices: &[u32],
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let file = tokio::fs::File::create(dest).await?;
        let mut writer = BufWriter::new(file);
        let mut total: u64 = 0;

        for &index in indices {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let mut chunk = tokio::fs::File::open(self.chunk_path(fingerprint, index)).await?;
            total += tokio::io::copy(&mut chunk, &mut writer).await?;
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Deletes one staged chunk; deleting an absent chunk is a no-op.
    ///
    /// Removes the staging directory once its last chunk is gone, keeping
    /// the chunk-set-exists-iff-nonempty invariant.
    pub async fn cleanup(&self, fingerprint: &str, index: u32) -> Result<(), StoreError> {
        validate_identifier(fingerprint, "fingerprint")?;

        let path = self.chunk_path(fingerprint, index);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(fingerprint, index, "chunk removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let dir = self.staging_dir(fingerprint);
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await
            && entries.next_entry().await?.is_none()
        {
            // Another writer may recreate the directory concurrently; losing
            // that race is fine, so the error is ignored.
            let _ = tokio::fs::remove_dir(&dir).await;
        }
        Ok(())
    }
}

/// Marks a fingerprint as merging for the lifetime of the guard.
struct MergingMarker {
    merging: Arc<StdMutex<HashSet<String>>>,
    fingerprint: String,
}

impl MergingMarker {
    fn set(merging: &Arc<StdMutex<HashSet<String>>>, fingerprint: &str) -> Self {
        merging.lock().unwrap().insert(fingerprint.to_string());
        Self {
            merging: Arc::clone(merging),
            fingerprint: fingerprint.to_string(),
        }
    }
}

impl Drop for MergingMarker {
    fn drop(&mut self) {
        self.merging.lock().unwrap().remove(&self.fingerprint);
    }
}

/// In-flight chunk write.
///
/// Bytes land in a `.part` temp file; [`commit`](Self::commit) verifies the
/// declared size (and checksum, when one was announced) and renames it to
/// the chunk's final name. Dropping without commit deletes the temp file.
pub struct StagedChunk {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    declared: u64,
    received: u64,
    hasher: Option<Sha256>,
    expected_checksum: String,
    committed: bool,
}

impl StagedChunk {
    /// Appends the next slice of the chunk body.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.received += buf.len() as u64;
        if self.received > self.declared {
            return Err(StoreError::Truncated {
                declared: self.declared,
                received: self.received,
            });
        }
        if let Some(h) = &mut self.hasher {
            h.update(buf);
        }
        // The file is always Some until commit/abort consume self.
        self.file
            .as_mut()
            .expect("staged chunk already finalized")
            .write_all(buf)
            .await?;
        Ok(())
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Finalizes the chunk, making it visible to status and merge.
    pub async fn commit(mut self) -> Result<u64, StoreError> {
        if self.received != self.declared {
            return Err(StoreError::Truncated {
                declared: self.declared,
                received: self.received,
            });
        }

        if let Some(h) = self.hasher.take() {
            let actual = hex::encode(h.finalize());
            if actual != self.expected_checksum {
                return Err(StoreError::ChecksumMismatch);
            }
        }

        let mut file = self.file.take().expect("staged chunk already finalized");
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        self.committed = true;
        Ok(self.received)
    }

    /// Discards the partial chunk immediately.
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.tmp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove partial chunk");
        }
        self.committed = true;
    }
}

impl Drop for StagedChunk {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &Path) -> ChunkStore {
        ChunkStore::new(
            dir.join("artifacts"),
            dir.join("staging"),
            StoreConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_chunk_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"hello").await.unwrap();
        store.put_chunk("fp1", 2, b"world").await.unwrap();

        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![0, 2] });
    }

    #[tokio::test]
    async fn status_without_chunk_set_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let status = store.status("unknown", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![] });
    }

    #[tokio::test]
    async fn status_rejects_missing_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(matches!(
            store.status("", "out.bin").await,
            Err(StoreError::MissingIdentifier("fingerprint"))
        ));
        assert!(matches!(
            store.status("fp", "").await,
            Err(StoreError::MissingIdentifier("artifactName"))
        ));
    }

    #[tokio::test]
    async fn rereceiving_index_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 1, b"first").await.unwrap();
        store.put_chunk("fp1", 1, b"second").await.unwrap();

        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![1] });

        let content = std::fs::read(dir.path().join("staging/fp1/1")).unwrap();
        assert_eq!(&content, b"second");
    }

    #[tokio::test]
    async fn oversized_chunk_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(
            dir.path().join("artifacts"),
            dir.path().join("staging"),
            StoreConfig { max_chunk_size: 8 },
        )
        .unwrap();

        let result = store.begin_chunk("fp1", 0, 9, "").await;
        assert!(matches!(result, Err(StoreError::ChunkTooLarge { .. })));
        // No staging directory was created for the rejected chunk.
        assert!(!dir.path().join("staging/fp1").exists());
    }

    #[tokio::test]
    async fn dropped_staged_chunk_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let mut staged = store.begin_chunk("fp1", 3, 10, "").await.unwrap();
        staged.write(b"abc").await.unwrap();
        drop(staged); // transport aborted mid-body

        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![] });
        assert!(!dir.path().join("staging/fp1/3").exists());
        assert!(!dir.path().join("staging/fp1/3.part").exists());
    }

    #[tokio::test]
    async fn commit_verifies_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let mut staged = store.begin_chunk("fp1", 0, 10, "").await.unwrap();
        staged.write(b"short").await.unwrap();
        let result = staged.commit().await;
        assert!(matches!(result, Err(StoreError::Truncated { .. })));
        assert!(!dir.path().join("staging/fp1/0").exists());
    }

    #[tokio::test]
    async fn commit_verifies_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let good = hex::encode(Sha256::digest(b"payload"));
        let mut staged = store.begin_chunk("fp1", 0, 7, &good).await.unwrap();
        staged.write(b"payload").await.unwrap();
        staged.commit().await.unwrap();

        let bad = "0".repeat(64);
        let mut staged = store.begin_chunk("fp1", 1, 7, &bad).await.unwrap();
        staged.write(b"payload").await.unwrap();
        assert!(matches!(
            staged.commit().await,
            Err(StoreError::ChecksumMismatch)
        ));
        assert!(!dir.path().join("staging/fp1/1").exists());
    }

    #[tokio::test]
    async fn merge_orders_numerically_not_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        // 12 chunks uploaded in scrambled order; lexicographic ordering
        // would splice "10" and "11" between "1" and "2".
        let order = [7u32, 0, 11, 3, 10, 1, 9, 2, 8, 4, 6, 5];
        for index in order {
            let body = format!("<{index:02}>");
            store.put_chunk("fp1", index, body.as_bytes()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let location = store.merge("fp1", "out.bin", 12, &cancel).await.unwrap();

        let expected: String = (0..12).map(|i| format!("<{i:02}>")).collect();
        assert_eq!(std::fs::read_to_string(&location).unwrap(), expected);

        // Chunk set removed atomically with success.
        assert!(!dir.path().join("staging/fp1").exists());
        // No leftover temp.
        assert!(!dir.path().join("artifacts/out.bin.part").exists());
    }

    #[tokio::test]
    async fn merge_count_mismatch_reports_both_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"a").await.unwrap();
        store.put_chunk("fp1", 2, b"c").await.unwrap();

        let cancel = CancellationToken::new();
        let result = store.merge("fp1", "out.bin", 3, &cancel).await;
        match result {
            Err(StoreError::CountMismatch { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected CountMismatch, got {other:?}"),
        }

        // No partial artifact, chunk set untouched.
        assert!(!dir.path().join("artifacts/out.bin").exists());
        assert!(!dir.path().join("artifacts/out.bin.part").exists());
        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![0, 2] });
    }

    #[tokio::test]
    async fn merge_cancelled_keeps_chunk_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"a").await.unwrap();
        store.put_chunk("fp1", 1, b"b").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = store.merge("fp1", "out.bin", 2, &cancel).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));

        assert!(!dir.path().join("artifacts/out.bin").exists());
        assert!(!dir.path().join("artifacts/out.bin.part").exists());
        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![0, 1] });

        // Retry after cancellation succeeds without re-uploading.
        let cancel = CancellationToken::new();
        let location = store.merge("fp1", "out.bin", 2, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&location).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn merge_is_idempotent_once_artifact_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"data").await.unwrap();
        let cancel = CancellationToken::new();
        let first = store.merge("fp1", "out.bin", 1, &cancel).await.unwrap();

        // Staging is gone, but the retry still succeeds.
        let second = store.merge("fp1", "out.bin", 1, &cancel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_merges_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(dir.path()));

        for i in 0..4u32 {
            store.put_chunk("fp1", i, &[i as u8; 32]).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&store);
            let c = cancel.clone();
            handles.push(tokio::spawn(async move {
                s.merge("fp1", "out.bin", 4, &c).await
            }));
        }

        for h in handles {
            let location = h.await.unwrap().unwrap();
            assert_eq!(location, dir.path().join("artifacts/out.bin"));
        }
        assert_eq!(
            std::fs::read(dir.path().join("artifacts/out.bin"))
                .unwrap()
                .len(),
            128
        );
    }

    #[tokio::test]
    async fn merge_lock_map_is_pruned_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let cancel = CancellationToken::new();

        store.put_chunk("fp1", 0, b"a").await.unwrap();
        store.merge("fp1", "a.bin", 1, &cancel).await.unwrap();

        // A failed merge releases its lock entry too.
        store.put_chunk("fp2", 0, b"b").await.unwrap();
        let result = store.merge("fp2", "b.bin", 2, &cancel).await;
        assert!(matches!(result, Err(StoreError::CountMismatch { .. })));

        assert!(store.merge_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_write_rejected_during_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let marker = MergingMarker::set(&store.merging, "fp1");
        let result = store.begin_chunk("fp1", 0, 4, "").await;
        assert!(matches!(result, Err(StoreError::MergeInProgress(_))));
        drop(marker);

        assert!(store.begin_chunk("fp1", 0, 4, "").await.is_ok());
    }

    #[tokio::test]
    async fn merge_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let cancel = CancellationToken::new();
        let location = store.merge("fp0", "empty.bin", 0, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&location).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_prunes_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"a").await.unwrap();
        store.put_chunk("fp1", 1, b"b").await.unwrap();

        store.cleanup("fp1", 1).await.unwrap();
        let status = store.status("fp1", "out.bin").await.unwrap();
        assert_eq!(status, ArtifactStatus::Partial { stored: vec![0] });

        // Absent chunk: successful no-op.
        store.cleanup("fp1", 1).await.unwrap();
        store.cleanup("fp1", 7).await.unwrap();

        // Removing the last chunk drops the staging directory too.
        store.cleanup("fp1", 0).await.unwrap();
        assert!(!dir.path().join("staging/fp1").exists());
    }

    #[tokio::test]
    async fn cleanup_leaves_other_indices_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.put_chunk("fp1", 0, b"zero").await.unwrap();
        store.put_chunk("fp1", 1, b"one").await.unwrap();
        store.put_chunk("fp1", 2, b"two").await.unwrap();

        store.cleanup("fp1", 1).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("staging/fp1/0")).unwrap(),
            b"zero"
        );
        assert_eq!(
            std::fs::read(dir.path().join("staging/fp1/2")).unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn traversal_identifiers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(store.put_chunk("../escape", 0, b"x").await.is_err());
        let cancel = CancellationToken::new();
        assert!(
            store
                .merge("fp", "../../etc/passwd", 1, &cancel)
                .await
                .is_err()
        );
    }
}

//! Raw proof storage, keyed by `(period, checker index)`.
//!
//! A checker gets exactly one proof per period: the first write wins and
//! later writes for the same key fail with `Conflict`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use depin_protocol::payload::{ProofWithIndex, RawProof};
use depin_protocol::Period;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("proof for period {period}, checker {checker_index} already exists")]
    Conflict { period: Period, checker_index: u64 },

    #[error("proof store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proof encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ProofStore: Send + Sync {
    /// Store `proof` unless one already exists for the key.
    async fn put_if_absent(
        &self,
        period: Period,
        checker_index: u64,
        proof: &RawProof,
    ) -> Result<(), StoreError>;

    /// Every proof stored for `period`, ordered by checker index.
    async fn list(&self, period: Period) -> Result<Vec<ProofWithIndex>, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryProofStore {
    proofs: Mutex<BTreeMap<(Period, u64), RawProof>>,
}

impl MemoryProofStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProofStore for MemoryProofStore {
    async fn put_if_absent(
        &self,
        period: Period,
        checker_index: u64,
        proof: &RawProof,
    ) -> Result<(), StoreError> {
        let mut proofs = self.proofs.lock().unwrap_or_else(PoisonError::into_inner);
        if proofs.contains_key(&(period, checker_index)) {
            return Err(StoreError::Conflict { period, checker_index });
        }
        proofs.insert((period, checker_index), proof.clone());
        Ok(())
    }

    async fn list(&self, period: Period) -> Result<Vec<ProofWithIndex>, StoreError> {
        let proofs = self.proofs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(proofs
            .range((period, 0)..=(period, u64::MAX))
            .map(|(&(_, checker_index), proof)| ProofWithIndex {
                checker_index,
                proof: proof.clone(),
            })
            .collect())
    }
}

// ============================================================================
// Filesystem
// ============================================================================

/// One JSON file per proof at `<root>/<period>/<checkerIndex>.json`.
pub struct FsProofStore {
    root: PathBuf,
}

impl FsProofStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn period_dir(&self, period: Period) -> PathBuf {
        self.root.join(period.to_string())
    }
}

/// Checker index encoded in a `<n>.json` file name.
fn checker_index_of(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[async_trait]
impl ProofStore for FsProofStore {
    async fn put_if_absent(
        &self,
        period: Period,
        checker_index: u64,
        proof: &RawProof,
    ) -> Result<(), StoreError> {
        let dir = self.period_dir(period);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec(proof)?;

        // `create_new` makes the existence check and the create one step.
        let path = dir.join(format!("{checker_index}.json"));
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict { period, checker_index });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&body).await?;
        file.sync_all().await?;
        tracing::debug!(period, checker_index, bytes = body.len(), "Stored proof");
        Ok(())
    }

    async fn list(&self, period: Period) -> Result<Vec<ProofWithIndex>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.period_dir(period)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut proofs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(checker_index) = checker_index_of(&path) else {
                continue;
            };
            let body = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RawProof>(&body) {
                Ok(proof) => proofs.push(ProofWithIndex { checker_index, proof }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable proof: {e}");
                }
            }
        }
        proofs.sort_by_key(|p| p.checker_index);
        Ok(proofs)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::raw_proof;
    use super::*;
    use ed25519_dalek::SigningKey;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    async fn duplicate_is_a_conflict(store: &dyn ProofStore) {
        let first = raw_proof(&key(1), 7, 120.0, 100.0);
        let second = raw_proof(&key(2), 7, 50.0, 10.0);

        store.put_if_absent(7, 3, &first).await.unwrap();
        let err = store.put_if_absent(7, 3, &second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { period: 7, checker_index: 3 }));

        let stored = store.list(7).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].proof, first);
    }

    async fn lists_one_period_in_index_order(store: &dyn ProofStore) {
        for index in [12, 2, 40] {
            store
                .put_if_absent(9, index, &raw_proof(&key(index as u8), 9, 80.0, 99.0))
                .await
                .unwrap();
        }
        store.put_if_absent(10, 1, &raw_proof(&key(1), 10, 80.0, 99.0)).await.unwrap();

        let indices: Vec<u64> = store.list(9).await.unwrap().iter().map(|p| p.checker_index).collect();
        assert_eq!(indices, vec![2, 12, 40]);
        assert!(store.list(11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_conflict() {
        duplicate_is_a_conflict(&MemoryProofStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_listing() {
        lists_one_period_in_index_order(&MemoryProofStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_conflict() {
        let dir = tempfile::tempdir().unwrap();
        duplicate_is_a_conflict(&FsProofStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_store_listing() {
        let dir = tempfile::tempdir().unwrap();
        lists_one_period_in_index_order(&FsProofStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn fs_store_layout_and_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsProofStore::new(dir.path());
        store.put_if_absent(4, 17, &raw_proof(&key(3), 4, 1.0, 1.0)).await.unwrap();
        assert!(dir.path().join("4").join("17.json").is_file());

        std::fs::write(dir.path().join("4").join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("4").join("18.json"), b"{truncated").unwrap();

        let listed = store.list(4).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checker_index, 17);
    }

    #[test]
    fn checker_index_from_file_name() {
        assert_eq!(checker_index_of(Path::new("/p/7/42.json")), Some(42));
        assert_eq!(checker_index_of(Path::new("/p/7/42.tmp")), None);
        assert_eq!(checker_index_of(Path::new("/p/7/x.json")), None);
    }
}

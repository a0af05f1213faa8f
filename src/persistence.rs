//! Encrypted on-disk cache persistence (spec §6, §A.4).
//!
//! Grounded on the teacher's `storage/memory_storage.rs::persist` shape
//! (serialize, then atomic write via a temp file); adds ChaCha20-Poly1305
//! encryption of the serialized payload and zeroizes the key on drop.

use crate::error::{CacheError, Result};
use crate::types::{BlockMetadata, BlockOrigin, Cid};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

const FORMAT_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

/// On-disk record for one cached block's metadata (bytes are persisted
/// separately via the `BlockStore`; this tracks admission bookkeeping so a
/// restart doesn't need to reclassify personal vs. altruistic origins).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    cid: String,
    size: u64,
    origin_is_altruistic: bool,
    cached_at: u64,
    last_accessed: u64,
    popularity: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    entries: Vec<PersistedEntry>,
}

impl From<&BlockMetadata> for PersistedEntry {
    fn from(meta: &BlockMetadata) -> Self {
        Self {
            cid: meta.cid.as_str().to_string(),
            size: meta.size,
            origin_is_altruistic: meta.origin == BlockOrigin::Altruistic,
            cached_at: meta.cached_at,
            last_accessed: meta.last_accessed,
            popularity: meta.popularity,
        }
    }
}

/// Symmetric key for the on-disk cache, wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PersistenceKey([u8; 32]);

impl PersistenceKey {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CacheError::FatalRng(format!("failed to generate persistence key: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Encrypts and atomically writes the cache's metadata snapshot to disk,
/// and reads it back on startup.
pub struct PersistenceStore {
    key: PersistenceKey,
}

impl PersistenceStore {
    pub fn new(key: PersistenceKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        let key = Key::from_slice(&self.key.0);
        Ok(ChaCha20Poly1305::new(key))
    }

    /// Serialize, encrypt, and atomically persist the metadata snapshot.
    pub async fn save(&self, path: &Path, metadata: &[BlockMetadata]) -> Result<()> {
        let snapshot = PersistedSnapshot {
            version: FORMAT_VERSION,
            entries: metadata.iter().map(PersistedEntry::from).collect(),
        };
        let plaintext = bincode::serialize(&snapshot)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CacheError::FatalRng(format!("failed to generate nonce: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| CacheError::internal(format!("encryption failed: {e}")))?;

        let mut on_disk = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        on_disk.extend_from_slice(&nonce_bytes);
        on_disk.extend_from_slice(&ciphertext);

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &on_disk).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(path, permissions).await?;
        }
        Ok(())
    }

    /// Read, decrypt, and deserialize a persisted snapshot. Returns `None`
    /// if the file does not exist (first run).
    pub async fn load(&self, path: &Path) -> Result<Option<Vec<(Cid, u64, BlockOrigin, u64, u64, u64)>>> {
        let on_disk = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if on_disk.len() < NONCE_LEN {
            return Err(CacheError::internal("persisted cache file is truncated"));
        }
        let (nonce_bytes, ciphertext) = on_disk.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher()?
            .decrypt(nonce, ciphertext)
            .map_err(|e| CacheError::internal(format!("decryption failed: {e}")))?;

        let snapshot: PersistedSnapshot = bincode::deserialize(&plaintext)?;
        if snapshot.version != FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: FORMAT_VERSION,
                actual: snapshot.version,
            });
        }

        Ok(Some(
            snapshot
                .entries
                .into_iter()
                .map(|e| {
                    let origin = if e.origin_is_altruistic {
                        BlockOrigin::Altruistic
                    } else {
                        BlockOrigin::Personal
                    };
                    (Cid::new(e.cid), e.size, origin, e.cached_at, e.last_accessed, e.popularity)
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockMetadata;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("altruistic-cache-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cache.bin");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let key = PersistenceKey::generate().unwrap();
        let store = PersistenceStore::new(key);
        let meta = vec![BlockMetadata::new(Cid::new("a"), 10, BlockOrigin::Personal)];

        store.save(&path, &meta).await.unwrap();
        let loaded = store.load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, Cid::new("a"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let key = PersistenceKey::generate().unwrap();
        let store = PersistenceStore::new(key);
        let result = store.load(Path::new("/nonexistent/path/cache.bin")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let dir = std::env::temp_dir().join(format!("altruistic-cache-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cache.bin");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let store_a = PersistenceStore::new(PersistenceKey::generate().unwrap());
        let meta = vec![BlockMetadata::new(Cid::new("a"), 10, BlockOrigin::Personal)];
        store_a.save(&path, &meta).await.unwrap();

        let store_b = PersistenceStore::new(PersistenceKey::generate().unwrap());
        let result = store_b.load(&path).await;
        assert!(result.is_err());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

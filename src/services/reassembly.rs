use bytes::{Bytes, BytesMut};
use serde_json::json;
use std::sync::Arc;

use crate::error::{Issue, IssueCode};
use crate::models::FileAssembly;
use crate::services::storage::BlobStore;
use crate::utils::hash::{FileHash, calculate_hash};

#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub bytes: Bytes,
    pub size: u64,
    /// SHA-256 of the whole file
    pub sha256: String,
}

/// Stitches a complete file back together from its chunk blobs.
pub struct ReassemblyEngine {
    blobs: Arc<dyn BlobStore>,
}

/// Why a complete file could not be put back together.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// The stored chunks do not add up to the declared file
    #[error("{0}")]
    Corrupt(Issue),
    /// Storage could not be read; the chunks may still be intact
    #[error("chunk storage unavailable: {0}")]
    Storage(String),
}

fn corrupt(message: String, details: serde_json::Value) -> AssemblyError {
    AssemblyError::Corrupt(Issue::new(IssueCode::CorruptAssembly, message).with_details(details))
}

impl ReassemblyEngine {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Integrity failures come back as a `CORRUPT_ASSEMBLY` issue, read failures as
    /// `AssemblyError::Storage` so the file can be retried.
    pub async fn assemble(&self, assembly: &FileAssembly) -> Result<AssembledFile, AssemblyError> {
        let total = assembly.total_chunks.unwrap_or(0);
        if total == 0 || assembly.chunks.len() as u32 != total {
            return Err(corrupt(
                format!(
                    "expected {} chunks, have {}",
                    total,
                    assembly.chunks.len()
                ),
                json!({ "total_chunks": total, "received": assembly.chunks.len() }),
            ));
        }

        let mut buffer = BytesMut::with_capacity(assembly.received_bytes as usize);
        for index in 0..total {
            let Some(record) = assembly.chunks.get(&index) else {
                return Err(corrupt(
                    format!("chunk {} is missing", index),
                    json!({ "index": index }),
                ));
            };

            let payload = match self.blobs.get(&record.blob_key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    return Err(corrupt(
                        format!("payload of chunk {} is gone", index),
                        json!({ "index": index }),
                    ));
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to read chunk {} of {}: {:?}",
                        index,
                        assembly.key,
                        e
                    );
                    return Err(AssemblyError::Storage(e.to_string()));
                }
            };

            let actual = calculate_hash(&payload);
            if actual != record.checksum {
                return Err(corrupt(
                    format!("chunk {} no longer matches its checksum", index),
                    json!({ "index": index, "expected": record.checksum, "actual": actual }),
                ));
            }
            buffer.extend_from_slice(&payload);
        }

        let bytes = buffer.freeze();
        let size = bytes.len() as u64;

        if let Some(declared) = assembly.declaration.total_size {
            if declared != size {
                return Err(corrupt(
                    format!("assembled {} bytes, declared {}", size, declared),
                    json!({ "declared_size": declared, "actual_size": size }),
                ));
            }
        }

        if let Some(declared) = assembly.declaration.file_hash.as_deref() {
            let Some(expected) = FileHash::parse(declared) else {
                return Err(corrupt(
                    "declared file hash is neither SHA-256 nor XXH3-128".to_string(),
                    json!({ "declared_hash": declared }),
                ));
            };
            let actual = expected.compute(&bytes);
            if actual != expected.expected() {
                return Err(corrupt(
                    "assembled file does not match the declared hash".to_string(),
                    json!({ "expected": expected.expected(), "actual": actual }),
                ));
            }
        }

        let sha256 = calculate_hash(&bytes);
        tracing::debug!("Reassembled {} ({} bytes)", assembly.key, size);
        Ok(AssembledFile {
            bytes,
            size,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkBitmap, ChunkRecord, FileDeclaration, FileKey};
    use crate::services::storage::MemoryBlobStore;
    use crate::utils::hash::calculate_xxh3;
    use chrono::Utc;
    use uuid::Uuid;

    fn corrupt_issue(result: Result<AssembledFile, AssemblyError>) -> Issue {
        match result {
            Err(AssemblyError::Corrupt(issue)) => issue,
            other => panic!("expected a corrupt assembly, got {:?}", other),
        }
    }

    async fn stored_assembly(
        blobs: &MemoryBlobStore,
        parts: &[&[u8]],
        declaration: FileDeclaration,
    ) -> FileAssembly {
        let key = FileKey::new(Uuid::new_v4(), "page");
        let mut assembly = FileAssembly::new(key.clone(), declaration, Utc::now());
        let total = parts.len() as u32;
        assembly.total_chunks = Some(total);
        let mut bitmap = ChunkBitmap::new(total);
        for (i, part) in parts.iter().enumerate() {
            let index = i as u32;
            let blob_key = key.chunk_blob_key(index);
            blobs
                .put(&blob_key, Bytes::copy_from_slice(part))
                .await
                .unwrap();
            bitmap.set(index);
            assembly.received_bytes += part.len() as u64;
            assembly.chunks.insert(
                index,
                ChunkRecord {
                    index,
                    blob_key,
                    checksum: calculate_hash(part),
                    size: part.len() as u64,
                    received_at: Utc::now(),
                },
            );
        }
        assembly.bitmap = Some(bitmap);
        assembly
    }

    #[tokio::test]
    async fn test_assembles_in_index_order() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assembly = stored_assembly(
            &blobs,
            &[b"hello ", b"page ", b"world"],
            FileDeclaration {
                total_size: Some(16),
                file_hash: Some(calculate_xxh3(b"hello page world")),
                ..Default::default()
            },
        )
        .await;
        let engine = ReassemblyEngine::new(blobs);
        let file = engine.assemble(&assembly).await.unwrap();
        assert_eq!(&file.bytes[..], b"hello page world");
        assert_eq!(file.sha256, calculate_hash(b"hello page world"));
    }

    #[tokio::test]
    async fn test_declared_hash_mismatch_is_corrupt() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assembly = stored_assembly(
            &blobs,
            &[b"abc", b"def"],
            FileDeclaration {
                file_hash: Some(calculate_hash(b"abcdeg")),
                ..Default::default()
            },
        )
        .await;
        let issue = corrupt_issue(ReassemblyEngine::new(blobs).assemble(&assembly).await);
        assert_eq!(issue.code, IssueCode::CorruptAssembly);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_corrupt() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assembly = stored_assembly(
            &blobs,
            &[b"abc"],
            FileDeclaration {
                total_size: Some(4),
                ..Default::default()
            },
        )
        .await;
        let issue = corrupt_issue(ReassemblyEngine::new(blobs).assemble(&assembly).await);
        assert_eq!(issue.details["declared_size"], 4);
    }

    #[tokio::test]
    async fn test_tampered_chunk_is_corrupt() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assembly = stored_assembly(&blobs, &[b"abc", b"def"], FileDeclaration::default()).await;
        blobs
            .put(&assembly.key.chunk_blob_key(1), Bytes::from_static(b"xyz"))
            .await
            .unwrap();
        let issue = corrupt_issue(ReassemblyEngine::new(blobs.clone()).assemble(&assembly).await);
        assert_eq!(issue.details["index"], 1);

        blobs.delete(&assembly.key.chunk_blob_key(0)).await.unwrap();
        let issue = corrupt_issue(ReassemblyEngine::new(blobs).assemble(&assembly).await);
        assert_eq!(issue.details["index"], 0);
    }

    #[tokio::test]
    async fn test_unreadable_storage_is_not_corruption() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let assembly = stored_assembly(&blobs, &[b"abc", b"def"], FileDeclaration::default()).await;
        blobs.set_available(false);
        let err = ReassemblyEngine::new(blobs.clone())
            .assemble(&assembly)
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Storage(_)), "{:?}", err);

        blobs.set_available(true);
        let file = ReassemblyEngine::new(blobs).assemble(&assembly).await.unwrap();
        assert_eq!(&file.bytes[..], b"abcdef");
    }
}

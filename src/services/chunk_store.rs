use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use crate::config::IntakeConfig;
use crate::error::{IntakeError, Issue, IssueCode};
use crate::models::{
    ChunkAck, ChunkBitmap, ChunkRecord, FileAssembly, FileDeclaration, FileKey, FileStatus,
    FileStatusView, MissingChunks, SessionId, Verdict, session_prefix,
};
use crate::services::session_manager::SessionManager;
use crate::services::storage::BlobStore;
use crate::utils::hash::{calculate_hash, is_sha256_hex};
use crate::utils::keyed_mutex::KeyedMutex;
use crate::utils::validation::is_valid_file_id;

pub struct ChunkUpload {
    pub session_id: SessionId,
    pub file_id: String,
    pub index: u32,
    pub total_chunks: u32,
    /// Lowercase hex SHA-256 of `payload` as computed by the client
    pub checksum: String,
    pub payload: Bytes,
    pub declaration: Option<FileDeclaration>,
}

#[derive(Debug, Clone)]
pub struct ChunkAdmission {
    pub ack: ChunkAck,
    /// True exactly once per file: for the chunk that completed it
    pub newly_complete: bool,
}

/// Chunk bookkeeping for every file of every session.
pub struct ChunkStore {
    blobs: Arc<dyn BlobStore>,
    sessions: Arc<SessionManager>,
    assemblies: DashMap<FileKey, FileAssembly>,
    locks: KeyedMutex<FileKey>,
    max_chunk_size: u64,
    max_chunks_per_file: u32,
}

fn out_of_range(file_id: &str, index: Option<u32>, reason: impl Into<String>) -> IntakeError {
    IntakeError::OutOfRange {
        file_id: file_id.to_string(),
        index,
        reason: reason.into(),
    }
}

fn check_file_id(file_id: &str) -> Result<(), IntakeError> {
    if is_valid_file_id(file_id) {
        Ok(())
    } else {
        Err(IntakeError::InvalidRequest(format!(
            "file id '{}' must be 1-128 characters of [A-Za-z0-9._-]",
            file_id
        )))
    }
}

impl ChunkStore {
    pub fn new(config: &IntakeConfig, blobs: Arc<dyn BlobStore>, sessions: Arc<SessionManager>) -> Self {
        Self {
            blobs,
            sessions,
            assemblies: DashMap::new(),
            locks: KeyedMutex::new(),
            max_chunk_size: config.max_chunk_size,
            max_chunks_per_file: config.max_chunks_per_file,
        }
    }

    fn check_total(&self, file_id: &str, total_chunks: u32) -> Result<(), IntakeError> {
        if total_chunks == 0 {
            return Err(out_of_range(file_id, None, "total_chunks must be positive"));
        }
        if total_chunks > self.max_chunks_per_file {
            return Err(out_of_range(
                file_id,
                None,
                format!(
                    "total_chunks {} exceeds the limit of {}",
                    total_chunks, self.max_chunks_per_file
                ),
            ));
        }
        Ok(())
    }

    fn check_declaration(&self, file_id: &str, decl: &FileDeclaration) -> Result<(), IntakeError> {
        decl.validate()
            .map_err(|e| IntakeError::InvalidRequest(format!("invalid declaration: {}", e)))?;
        if let Some(total) = decl.total_chunks {
            self.check_total(file_id, total)?;
        }
        Ok(())
    }

    /// Records a quota refusal on the file so status queries can explain it.
    async fn reject_for_quota(&self, key: &FileKey, err: &IntakeError, decl: FileDeclaration) {
        let now = Utc::now();
        {
            let mut entry = self
                .assemblies
                .entry(key.clone())
                .or_insert_with(|| FileAssembly::new(key.clone(), decl, now));
            entry.status = FileStatus::Rejected;
            entry.verdict = Some(Verdict::Rejected);
            if let Some(issue) = err.to_issue() {
                entry.issues.push(issue);
            }
            entry.updated_at = now;
        }
        if let Err(e) = self.purge_chunks(key).await {
            tracing::warn!("Failed to purge chunks of refused file {}: {:?}", key, e);
        }
    }

    /// Creates the assembly for a file seen for the first time, consuming quota.
    async fn admit(
        &self,
        key: &FileKey,
        decl: FileDeclaration,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        let reserve = decl.total_size.unwrap_or(0);
        match self
            .sessions
            .admit_file(key.session_id, &key.file_id, reserve, now)
        {
            Ok(()) => {
                let mut assembly = FileAssembly::new(key.clone(), decl, now);
                assembly.charged_bytes = reserve;
                self.assemblies.insert(key.clone(), assembly);
                tracing::debug!("File {} admitted ({} bytes reserved)", key, reserve);
                Ok(())
            }
            Err(err @ IntakeError::QuotaExceeded { .. }) => {
                self.reject_for_quota(key, &err, decl).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Declares (or extends the declaration of) a file before its chunks arrive.
    pub async fn declare(
        &self,
        session_id: SessionId,
        file_id: &str,
        decl: FileDeclaration,
    ) -> Result<FileStatusView, IntakeError> {
        check_file_id(file_id)?;
        self.check_declaration(file_id, &decl)?;
        let key = FileKey::new(session_id, file_id);
        let _guard = self.locks.lock(&key).await;
        let now = Utc::now();

        self.sessions.ensure_accepting(session_id, now)?;

        let existing = self.assemblies.get(&key).map(|a| a.value().clone());
        let Some(mut assembly) = existing else {
            self.admit(&key, decl, now).await?;
            return self.view(&key);
        };

        if !assembly.status.accepts_chunks() {
            return Err(IntakeError::FileClosed {
                file_id: file_id.to_string(),
                status: assembly.status,
            });
        }
        assembly.declaration.merge(&decl).map_err(|field| {
            IntakeError::InvalidRequest(format!("{} conflicts with the earlier declaration", field))
        })?;
        if let (Some(known), Some(declared)) = (assembly.total_chunks, decl.total_chunks) {
            if known != declared {
                return Err(out_of_range(
                    file_id,
                    None,
                    format!("total_chunks {} differs from {}", declared, known),
                ));
            }
        }

        let received_bytes = assembly.received_bytes;
        self.charge_to(&key, &mut assembly, received_bytes, now)
            .await?;
        if assembly.total_chunks.is_none() {
            assembly.total_chunks = assembly.declaration.total_chunks;
            assembly.bitmap = assembly.total_chunks.map(ChunkBitmap::new);
        }
        assembly.updated_at = now;
        let view = assembly.view();
        self.assemblies.insert(key, assembly);
        Ok(view)
    }

    /// Charges whatever the file now owes the session beyond what it already paid.
    async fn charge_to(
        &self,
        key: &FileKey,
        assembly: &mut FileAssembly,
        received_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        let target = assembly.quota_target(received_bytes);
        let delta = target.saturating_sub(assembly.charged_bytes);
        if delta == 0 {
            self.sessions.touch(key.session_id, now);
            return Ok(());
        }
        match self
            .sessions
            .charge_bytes(key.session_id, &key.file_id, delta, now)
        {
            Ok(()) => {
                assembly.charged_bytes = target;
                // Persist the charge at once so a retry is never billed twice
                if let Some(mut stored) = self.assemblies.get_mut(key) {
                    stored.charged_bytes = target;
                }
                Ok(())
            }
            Err(err @ IntakeError::QuotaExceeded { .. }) => {
                self.reject_for_quota(key, &err, assembly.declaration.clone())
                    .await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn put_chunk(&self, upload: ChunkUpload) -> Result<ChunkAdmission, IntakeError> {
        let ChunkUpload {
            session_id,
            file_id,
            index,
            total_chunks,
            checksum,
            payload,
            declaration,
        } = upload;

        check_file_id(&file_id)?;
        let checksum = checksum.trim().to_ascii_lowercase();
        if !is_sha256_hex(&checksum) {
            return Err(IntakeError::InvalidRequest(
                "chunk checksum must be 64 hex characters (SHA-256)".to_string(),
            ));
        }

        let key = FileKey::new(session_id, file_id.clone());
        let _guard = self.locks.lock(&key).await;
        let now = Utc::now();

        // A retried chunk is answered from the record, even after the session moved on
        if let Some(assembly) = self.assemblies.get(&key) {
            if let Some(record) = assembly.chunks.get(&index) {
                if record.checksum == checksum && assembly.total_chunks == Some(total_chunks) {
                    let ack = assembly.ack(index);
                    drop(assembly);
                    self.sessions.ensure_not_abandoned(session_id)?;
                    self.sessions.touch(session_id, now);
                    tracing::debug!("Duplicate chunk {} of {} acknowledged", index, key);
                    return Ok(ChunkAdmission {
                        ack,
                        newly_complete: false,
                    });
                }
            }
        }

        self.sessions.ensure_accepting(session_id, now)?;

        self.check_total(&file_id, total_chunks)?;
        if index >= total_chunks {
            return Err(out_of_range(
                &file_id,
                Some(index),
                format!("index {} is outside [0, {})", index, total_chunks),
            ));
        }
        if payload.is_empty() {
            return Err(out_of_range(&file_id, Some(index), "chunk payload is empty"));
        }
        if payload.len() as u64 > self.max_chunk_size {
            return Err(out_of_range(
                &file_id,
                Some(index),
                format!(
                    "chunk of {} bytes exceeds the limit of {}",
                    payload.len(),
                    self.max_chunk_size
                ),
            ));
        }
        let mut incoming = declaration.unwrap_or_default();
        self.check_declaration(&file_id, &incoming)?;
        if incoming.total_chunks.is_some_and(|t| t != total_chunks) {
            return Err(out_of_range(
                &file_id,
                Some(index),
                "declared total_chunks differs from x-total-chunks",
            ));
        }
        incoming.total_chunks = Some(total_chunks);

        let actual = calculate_hash(&payload);
        if actual != checksum {
            return Err(IntakeError::ChecksumMismatch {
                file_id,
                index,
                expected: checksum,
                actual,
            });
        }

        if !self.assemblies.contains_key(&key) {
            self.admit(&key, incoming.clone(), now).await?;
        }

        let mut assembly = self
            .assemblies
            .get(&key)
            .map(|a| a.value().clone())
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id,
                file_id: file_id.clone(),
            })?;

        if !assembly.status.accepts_chunks() {
            return Err(IntakeError::FileClosed {
                file_id,
                status: assembly.status,
            });
        }
        if let Some(existing) = assembly.total_chunks {
            if existing != total_chunks {
                return Err(out_of_range(
                    &file_id,
                    Some(index),
                    format!(
                        "total_chunks {} differs from the declared {}",
                        total_chunks, existing
                    ),
                ));
            }
        }
        if let Some(record) = assembly.chunks.get(&index) {
            // Same index, different bytes: keep what we have
            return Err(IntakeError::ChecksumMismatch {
                file_id,
                index,
                expected: record.checksum.clone(),
                actual: checksum,
            });
        }
        assembly.declaration.merge(&incoming).map_err(|field| {
            IntakeError::InvalidRequest(format!("{} conflicts with the earlier declaration", field))
        })?;
        if assembly.total_chunks.is_none() {
            assembly.total_chunks = Some(total_chunks);
            assembly.bitmap = Some(ChunkBitmap::new(total_chunks));
        }

        let received_bytes = assembly.received_bytes + payload.len() as u64;
        self.charge_to(&key, &mut assembly, received_bytes, now)
            .await?;

        let blob_key = key.chunk_blob_key(index);
        let size = payload.len() as u64;
        self.blobs.put(&blob_key, payload).await.map_err(|e| {
            tracing::error!("❌ Failed to store chunk {} of {}: {:?}", index, key, e);
            IntakeError::StorageUnavailable(e.to_string())
        })?;

        // Cancelled while we were writing: the purge may already have run
        if let Err(err) = self.sessions.ensure_not_abandoned(session_id) {
            let _ = self.blobs.delete(&blob_key).await;
            return Err(err);
        }

        assembly.chunks.insert(
            index,
            ChunkRecord {
                index,
                blob_key,
                checksum,
                size,
                received_at: now,
            },
        );
        if let Some(bitmap) = assembly.bitmap.as_mut() {
            bitmap.set(index);
        }
        assembly.received_bytes = received_bytes;
        if assembly.status == FileStatus::Pending {
            assembly.status = FileStatus::Receiving;
        }
        assembly.updated_at = now;

        let newly_complete = assembly.is_complete() && !assembly.completion_signalled;
        if newly_complete {
            assembly.completion_signalled = true;
            tracing::info!("🧩 All {} chunks of {} received", total_chunks, key);
        }
        let ack = assembly.ack(index);
        self.assemblies.insert(key, assembly);

        Ok(ChunkAdmission {
            ack,
            newly_complete,
        })
    }

    pub fn list_missing(
        &self,
        session_id: SessionId,
        file_id: &str,
    ) -> Result<MissingChunks, IntakeError> {
        self.sessions.snapshot(session_id)?;
        let key = FileKey::new(session_id, file_id);
        let assembly = self
            .assemblies
            .get(&key)
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id,
                file_id: file_id.to_string(),
            })?;
        let (Some(total_chunks), Some(bitmap)) = (assembly.total_chunks, assembly.bitmap.as_ref())
        else {
            return Err(IntakeError::InvalidRequest(format!(
                "total chunk count of {} is not known yet",
                file_id
            )));
        };
        Ok(MissingChunks {
            file_id: file_id.to_string(),
            total_chunks,
            missing: bitmap.missing(),
        })
    }

    pub fn snapshot(&self, key: &FileKey) -> Option<FileAssembly> {
        self.assemblies.get(key).map(|a| a.value().clone())
    }

    fn view(&self, key: &FileKey) -> Result<FileStatusView, IntakeError> {
        self.assemblies
            .get(key)
            .map(|a| a.view())
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id: key.session_id,
                file_id: key.file_id.clone(),
            })
    }

    pub fn status_view(&self, key: &FileKey) -> Option<FileStatusView> {
        self.assemblies.get(key).map(|a| a.view())
    }

    /// Applies `f` to the stored assembly and bumps its timestamp.
    /// A discarded file is left alone and `None` is returned.
    pub fn update<R>(&self, key: &FileKey, f: impl FnOnce(&mut FileAssembly) -> R) -> Option<R> {
        let mut assembly = self.assemblies.get_mut(key)?;
        if assembly.status == FileStatus::Discarded {
            return None;
        }
        let result = f(&mut assembly);
        assembly.updated_at = Utc::now();
        Some(result)
    }

    /// Claims a complete file for reassembly.
    pub fn begin_assembly(&self, key: &FileKey) -> Result<FileAssembly, IntakeError> {
        let mut assembly = self
            .assemblies
            .get_mut(key)
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id: key.session_id,
                file_id: key.file_id.clone(),
            })?;
        if !assembly.is_complete() {
            return Err(IntakeError::InvalidRequest(format!(
                "file {} is missing chunks",
                key.file_id
            )));
        }
        if assembly.status != FileStatus::Receiving {
            return Err(IntakeError::FileClosed {
                file_id: key.file_id.clone(),
                status: assembly.status,
            });
        }
        assembly.status = FileStatus::Assembling;
        assembly.updated_at = Utc::now();
        Ok(assembly.value().clone())
    }

    /// Marks a file that never completed. Returns its view if it changed.
    /// Waits for any chunk write in flight, which may complete the file instead.
    pub async fn mark_incomplete(&self, key: &FileKey) -> Option<FileStatusView> {
        let _guard = self.locks.lock(key).await;
        let mut assembly = self.assemblies.get_mut(key)?;
        if !assembly.status.accepts_chunks() || assembly.is_complete() {
            return None;
        }
        let missing = assembly
            .bitmap
            .as_ref()
            .map(|b| b.missing())
            .unwrap_or_default();
        let total_chunks = assembly.total_chunks;
        assembly.status = FileStatus::Incomplete;
        assembly.verdict = Some(Verdict::Rejected);
        assembly.issues.push(
            Issue::new(
                IssueCode::Incomplete,
                format!("{} chunk(s) never arrived", missing.len()),
            )
            .with_details(json!({
                "total_chunks": total_chunks,
                "missing": missing,
            })),
        );
        assembly.updated_at = Utc::now();
        Some(assembly.view())
    }

    /// Marks every unfinished file of the session as discarded.
    pub fn discard_open_files(&self, session_id: SessionId) -> usize {
        let mut discarded = 0;
        for mut assembly in self.assemblies.iter_mut() {
            if assembly.key.session_id == session_id && !assembly.status.is_terminal() {
                assembly.status = FileStatus::Discarded;
                assembly.updated_at = Utc::now();
                discarded += 1;
            }
        }
        discarded
    }

    pub fn session_views(&self, session_id: SessionId, file_ids: &[String]) -> Vec<FileStatusView> {
        file_ids
            .iter()
            .filter_map(|f| self.status_view(&FileKey::new(session_id, f.clone())))
            .collect()
    }

    pub async fn purge_chunks(&self, key: &FileKey) -> anyhow::Result<usize> {
        self.blobs.delete_prefix(&key.chunk_prefix()).await
    }

    pub async fn purge_session(&self, session_id: SessionId) -> anyhow::Result<usize> {
        self.blobs.delete_prefix(&session_prefix(session_id)).await
    }

    /// Removes the partial state of an expired session. Assembled payloads of
    /// files that passed moderation stay until the session retires.
    pub async fn purge_partial(&self, session_id: SessionId) -> anyhow::Result<usize> {
        let files: Vec<(FileKey, bool)> = self
            .assemblies
            .iter()
            .filter(|a| a.key.session_id == session_id)
            .map(|a| {
                let moderated = matches!(a.status, FileStatus::Accepted | FileStatus::NeedsReview);
                (a.key.clone(), moderated)
            })
            .collect();

        let mut removed = 0;
        for (key, moderated) in files {
            removed += self.blobs.delete_prefix(&key.chunk_prefix()).await?;
            if !moderated {
                self.blobs.delete(&key.assembled_blob_key()).await?;
            }
        }
        Ok(removed)
    }

    /// Drops all bookkeeping of a retired session.
    pub fn forget_session(&self, session_id: SessionId) -> Vec<FileKey> {
        let keys: Vec<FileKey> = self
            .assemblies
            .iter()
            .filter(|a| a.key.session_id == session_id)
            .map(|a| a.key.clone())
            .collect();
        for key in &keys {
            self.assemblies.remove(key);
        }
        self.locks.cleanup();
        keys
    }
}

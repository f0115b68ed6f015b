use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::models::{
    ChunkAck, FileDeclaration, FileKey, FileStatus, FileStatusView, FinalizeReport,
    LimitOverrides, MissingChunks, SessionCreated, SessionId, SessionState, SessionStatusView,
    Verdict,
};
use crate::services::authorizer::CollectionAuthorizer;
use crate::services::chunk_store::{ChunkStore, ChunkUpload};
use crate::services::duplicate::DuplicateDetector;
use crate::services::pipeline::{FileOutcome, FilePipeline, verdict_event};
use crate::services::session_manager::SessionManager;
use crate::services::storage::BlobStore;
use crate::services::verdict_sink::VerdictSink;

/// Queued when the last missing chunk of a file arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAssembled {
    pub key: FileKey,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<SessionId>,
    /// Sessions whose interrupted finalize was completed by the sweep
    pub finalized: Vec<SessionId>,
    pub purged_blobs: usize,
    pub retired: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty()
            && self.finalized.is_empty()
            && self.purged_blobs == 0
            && self.retired.is_empty()
    }
}

/// Entry point for every intake operation.
pub struct IntakeService {
    config: IntakeConfig,
    sessions: Arc<SessionManager>,
    chunks: Arc<ChunkStore>,
    pipeline: Arc<FilePipeline>,
    blobs: Arc<dyn BlobStore>,
    sink: Arc<dyn VerdictSink>,
    events: mpsc::UnboundedSender<FileAssembled>,
}

impl IntakeService {
    pub fn new(
        config: IntakeConfig,
        blobs: Arc<dyn BlobStore>,
        authorizer: Arc<dyn CollectionAuthorizer>,
        sink: Arc<dyn VerdictSink>,
    ) -> (Self, mpsc::UnboundedReceiver<FileAssembled>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            authorizer,
            blobs.clone(),
        ));
        let chunks = Arc::new(ChunkStore::new(&config, blobs.clone(), sessions.clone()));
        let pipeline = Arc::new(FilePipeline::new(
            &config,
            chunks.clone(),
            sessions.clone(),
            blobs.clone(),
            Arc::new(DuplicateDetector::new(&config)),
            sink.clone(),
        ));

        let service = Self {
            config,
            sessions,
            chunks,
            pipeline,
            blobs,
            sink,
            events,
        };
        (service, receiver)
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    pub async fn storage_healthy(&self) -> bool {
        self.blobs.health_check().await.is_ok()
    }

    pub async fn create_session(
        &self,
        owner_id: &str,
        collection_ref: &str,
        overrides: LimitOverrides,
    ) -> Result<SessionCreated, IntakeError> {
        self.sessions
            .create_session(owner_id, collection_ref, overrides)
            .await
    }

    pub async fn declare_file(
        &self,
        session_id: SessionId,
        file_id: &str,
        declaration: FileDeclaration,
    ) -> Result<FileStatusView, IntakeError> {
        self.pipeline.validation().precheck(file_id, &declaration)?;
        let result = self.chunks.declare(session_id, file_id, declaration).await;
        self.after_write(&FileKey::new(session_id, file_id), &result)
            .await;
        result
    }

    pub async fn put_chunk(&self, upload: ChunkUpload) -> Result<ChunkAck, IntakeError> {
        if let Some(declaration) = upload.declaration.as_ref() {
            self.pipeline
                .validation()
                .precheck(&upload.file_id, declaration)?;
        }
        let key = FileKey::new(upload.session_id, upload.file_id.clone());

        let result = self.chunks.put_chunk(upload).await;
        self.after_write(&key, &result).await;
        let admission = result?;

        if admission.newly_complete && self.events.send(FileAssembled { key: key.clone() }).is_err() {
            tracing::debug!("No analysis worker listening; {} waits for finalize", key);
        }
        Ok(admission.ack)
    }

    /// Follow-up work for refusals that change more than the caller's request.
    async fn after_write<T>(&self, key: &FileKey, result: &Result<T, IntakeError>) {
        match result {
            Err(IntakeError::QuotaExceeded { .. }) => self.publish_recorded(key).await,
            Err(IntakeError::SessionExpired(session_id)) => self.abandon(*session_id),
            _ => {}
        }
    }

    pub fn list_missing(
        &self,
        session_id: SessionId,
        file_id: &str,
    ) -> Result<MissingChunks, IntakeError> {
        self.chunks.list_missing(session_id, file_id)
    }

    pub fn session_status(&self, session_id: SessionId) -> Result<SessionStatusView, IntakeError> {
        if self.sessions.expire_if_idle(session_id, Utc::now())? {
            self.abandon(session_id);
        }
        let session = self.sessions.snapshot(session_id)?;
        Ok(SessionStatusView {
            session_id: session.id,
            owner_id: session.owner_id,
            collection_ref: session.collection_ref,
            state: session.state,
            limits: session.limits,
            accepted_bytes: session.accepted_bytes,
            admitted_files: session.admitted_files,
            created_at: session.created_at,
            expires_at: session.expires_at,
            files: self.chunks.session_views(session_id, &session.file_ids),
        })
    }

    pub fn file_status(
        &self,
        session_id: SessionId,
        file_id: &str,
    ) -> Result<FileStatusView, IntakeError> {
        self.sessions.snapshot(session_id)?;
        self.chunks
            .status_view(&FileKey::new(session_id, file_id))
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id,
                file_id: file_id.to_string(),
            })
    }

    /// Closes the session to new chunks and waits for every complete file's verdict.
    /// Calling it again while a finalize is running joins that work.
    pub async fn finalize(&self, session_id: SessionId) -> Result<FinalizeReport, IntakeError> {
        let now = Utc::now();
        let snapshot = self.sessions.snapshot(session_id)?;
        if matches!(
            snapshot.state,
            SessionState::Completed | SessionState::PartiallyFailed
        ) {
            return Ok(self.report(session_id, snapshot.state, &snapshot.file_ids));
        }

        let file_ids = match self.sessions.begin_finalize(session_id, now) {
            Ok(ids) => ids,
            Err(err) => {
                if matches!(err, IntakeError::SessionExpired(_)) {
                    self.abandon(session_id);
                }
                return Err(err);
            }
        };
        tracing::info!("🏁 Finalizing session {} ({} files)", session_id, file_ids.len());

        let mut to_process = Vec::new();
        for file_id in &file_ids {
            let key = FileKey::new(session_id, file_id.clone());
            let Some(assembly) = self.chunks.snapshot(&key) else {
                continue;
            };
            if assembly.status.is_terminal() {
                continue;
            }
            if assembly.status.accepts_chunks()
                && !assembly.is_complete()
                && self.chunks.mark_incomplete(&key).await.is_some()
            {
                self.publish_recorded(&key).await;
                self.chunks.purge_chunks(&key).await.ok();
                continue;
            }
            // Marked by a concurrent finalize, or completed by a late chunk
            if self
                .chunks
                .snapshot(&key)
                .is_some_and(|a| a.is_complete() && !a.status.is_terminal())
            {
                to_process.push(key);
            }
        }

        let results = join_all(to_process.iter().map(|key| self.pipeline.process(key))).await;
        for (key, result) in to_process.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Processing {} during finalize failed: {}", key, e);
            }
        }

        let all_ok = file_ids.iter().all(|file_id| {
            self.chunks
                .snapshot(&FileKey::new(session_id, file_id.clone()))
                .and_then(|a| a.verdict)
                .is_some_and(|v| matches!(v, Verdict::Accepted | Verdict::NeedsReview))
        });
        let state = self
            .sessions
            .complete_finalize(session_id, all_ok, Utc::now())?;
        tracing::info!("📦 Session {} finalized as {:?}", session_id, state);
        Ok(self.report(session_id, state, &file_ids))
    }

    fn report(&self, session_id: SessionId, state: SessionState, file_ids: &[String]) -> FinalizeReport {
        FinalizeReport {
            session_id,
            state,
            files: self.chunks.session_views(session_id, file_ids),
        }
    }

    /// Cancels the session. In-flight analysis is discarded and blobs are purged
    /// in the background.
    pub fn cancel(&self, session_id: SessionId) -> Result<SessionState, IntakeError> {
        let state = self.sessions.cancel(session_id, Utc::now())?;
        self.abandon(session_id);
        Ok(state)
    }

    fn abandon(&self, session_id: SessionId) {
        let discarded = self.chunks.discard_open_files(session_id);
        if discarded > 0 {
            tracing::info!("🗑️  Discarded {} open file(s) of session {}", discarded, session_id);
        }

        let chunks = self.chunks.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            match purge_abandoned(&chunks, &sessions, session_id).await {
                Ok(removed) => {
                    sessions.mark_purged(session_id);
                    tracing::info!("🧹 Purged {} blob(s) of session {}", removed, session_id);
                }
                // Left for the expiry sweep to retry
                Err(e) => tracing::warn!("Purge of session {} failed: {:?}", session_id, e),
            }
        });
    }

    /// Expires idle sessions, purges abandoned ones and forgets retired ones.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            expired: self.sessions.sweep_idle(now),
            ..Default::default()
        };
        for session_id in &report.expired {
            self.chunks.discard_open_files(*session_id);
        }

        for session_id in self.sessions.stalled_finalizing(now) {
            tracing::info!("🔁 Resuming interrupted finalize of session {}", session_id);
            match self.finalize(session_id).await {
                Ok(_) => report.finalized.push(session_id),
                Err(e) => tracing::warn!("Finalize of session {} failed: {}", session_id, e),
            }
        }

        for session_id in self.sessions.sessions_pending_purge() {
            match purge_abandoned(&self.chunks, &self.sessions, session_id).await {
                Ok(removed) => {
                    report.purged_blobs += removed;
                    self.sessions.mark_purged(session_id);
                }
                Err(e) => tracing::warn!("Purge of session {} failed: {:?}", session_id, e),
            }
        }

        report.retired = self.sessions.drop_retired(now, self.config.retention());
        for session_id in &report.retired {
            if let Err(e) = self.chunks.purge_session(*session_id).await {
                tracing::warn!("Purge of retired session {} failed: {:?}", session_id, e);
            }
            let keys = self.chunks.forget_session(*session_id);
            self.pipeline.forget(&keys);
        }

        report
    }

    pub async fn process_file(&self, key: &FileKey) -> Result<FileOutcome, IntakeError> {
        self.pipeline.process(key).await
    }

    /// Bytes of a file that passed moderation, for the commit collaborator.
    pub async fn fetch_assembled(
        &self,
        session_id: SessionId,
        file_id: &str,
    ) -> Result<Bytes, IntakeError> {
        let key = FileKey::new(session_id, file_id);
        let assembly = self
            .chunks
            .snapshot(&key)
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id,
                file_id: file_id.to_string(),
            })?;
        let blob_key = match (assembly.status, assembly.assembled_key) {
            (FileStatus::Accepted | FileStatus::NeedsReview, Some(blob_key)) => blob_key,
            (status, _) => {
                return Err(IntakeError::FileClosed {
                    file_id: file_id.to_string(),
                    status,
                });
            }
        };
        self.blobs
            .get(&blob_key)
            .await
            .map_err(|e| IntakeError::StorageUnavailable(e.to_string()))?
            .ok_or_else(|| IntakeError::FileNotFound {
                session_id,
                file_id: file_id.to_string(),
            })
    }

    /// Publishes a verdict recorded outside the pipeline (quota, incomplete).
    async fn publish_recorded(&self, key: &FileKey) {
        let Ok(session) = self.sessions.snapshot(key.session_id) else {
            return;
        };
        if let Some(assembly) = self.chunks.snapshot(key) {
            if let Some(event) = verdict_event(&assembly, &session.collection_ref, assembly.issues.clone()) {
                self.sink.publish(event).await;
            }
        }
    }
}

/// Cancelled sessions lose every blob. Expired ones keep the payloads of
/// files that already passed moderation until they retire.
async fn purge_abandoned(
    chunks: &ChunkStore,
    sessions: &SessionManager,
    session_id: SessionId,
) -> anyhow::Result<usize> {
    match sessions.snapshot(session_id).map(|s| s.state) {
        Ok(SessionState::Expired) => chunks.purge_partial(session_id).await,
        _ => chunks.purge_session(session_id).await,
    }
}

use anyhow::anyhow;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::IntakeConfig;
use crate::error::{IntakeError, Issue};
use crate::models::{FileAssembly, FileKey, FileStatus, Verdict};
use crate::services::chunk_store::ChunkStore;
use crate::services::duplicate::{DuplicateDetector, Fingerprint};
use crate::services::moderation::{ModerationInput, decide};
use crate::services::quality::QualityAnalyzer;
use crate::services::reassembly::{AssemblyError, ReassemblyEngine};
use crate::services::session_manager::SessionManager;
use crate::services::storage::BlobStore;
use crate::services::validation::{ValidationOutcome, ValidationPipeline};
use crate::services::verdict_sink::{VerdictEvent, VerdictSink};

/// Where a file ended up after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOutcome {
    pub status: FileStatus,
    pub verdict: Option<Verdict>,
}

/// Runs reassembly, validation, analysis and moderation for one complete file.
pub struct FilePipeline {
    chunks: Arc<ChunkStore>,
    sessions: Arc<SessionManager>,
    blobs: Arc<dyn BlobStore>,
    reassembly: ReassemblyEngine,
    validation: Arc<ValidationPipeline>,
    quality: QualityAnalyzer,
    duplicates: Arc<DuplicateDetector>,
    sink: Arc<dyn VerdictSink>,
    permits: Arc<Semaphore>,
    /// One cell per file: whoever triggers first does the work
    outcomes: DashMap<FileKey, Arc<OnceCell<FileOutcome>>>,
}

fn join_error(e: tokio::task::JoinError) -> IntakeError {
    IntakeError::Internal(anyhow!("analysis task failed: {}", e))
}

impl FilePipeline {
    pub fn new(
        config: &IntakeConfig,
        chunks: Arc<ChunkStore>,
        sessions: Arc<SessionManager>,
        blobs: Arc<dyn BlobStore>,
        duplicates: Arc<DuplicateDetector>,
        sink: Arc<dyn VerdictSink>,
    ) -> Self {
        Self {
            chunks,
            sessions,
            reassembly: ReassemblyEngine::new(blobs.clone()),
            blobs,
            validation: Arc::new(ValidationPipeline::new(config)),
            quality: QualityAnalyzer::new(config.floor_pixels()),
            duplicates,
            sink,
            permits: Arc::new(Semaphore::new(config.analysis_concurrency.max(1))),
            outcomes: DashMap::new(),
        }
    }

    pub fn validation(&self) -> &ValidationPipeline {
        &self.validation
    }

    /// Processes the file once. Concurrent and later callers get the first outcome.
    /// The work runs on its own task, so a caller that goes away does not stop it.
    pub async fn process(self: &Arc<Self>, key: &FileKey) -> Result<FileOutcome, IntakeError> {
        let cell = self
            .outcomes
            .entry(key.clone())
            .or_default()
            .value()
            .clone();
        if let Some(outcome) = cell.get() {
            return Ok(*outcome);
        }

        let pipeline = self.clone();
        let key = key.clone();
        tokio::spawn(async move { cell.get_or_try_init(|| pipeline.run(&key)).await.copied() })
            .await
            .map_err(join_error)?
    }

    pub fn cached_outcome(&self, key: &FileKey) -> Option<FileOutcome> {
        self.outcomes.get(key).and_then(|c| c.get().copied())
    }

    pub fn forget(&self, keys: &[FileKey]) {
        for key in keys {
            self.outcomes.remove(key);
        }
    }

    async fn run(&self, key: &FileKey) -> Result<FileOutcome, IntakeError> {
        let session = self.sessions.snapshot(key.session_id)?;
        let token = self
            .sessions
            .cancellation_token(key.session_id)
            .unwrap_or_default();
        if token.is_cancelled() {
            return Ok(self.discard(key));
        }

        let assembly = self.chunks.begin_assembly(key)?;
        tracing::info!("🔧 Processing {}", key);

        let assembled = match self.reassembly.assemble(&assembly).await {
            Ok(file) => file,
            Err(AssemblyError::Storage(e)) => {
                tracing::error!("❌ Could not read chunks of {}: {}", key, e);
                // Nothing was lost: put the file back so it can be retried
                self.chunks
                    .update(key, |a| a.status = FileStatus::Receiving);
                return Err(IntakeError::StorageUnavailable(e));
            }
            Err(AssemblyError::Corrupt(issue)) => {
                tracing::warn!("💥 Reassembly of {} failed: {}", key, issue);
                let settled = self.settle(key, &token, |a| {
                    a.status = FileStatus::Corrupt;
                    a.verdict = Some(Verdict::Rejected);
                    a.issues.push(issue.clone());
                });
                if settled.is_none() {
                    return Ok(self.discard(key));
                }
                self.purge_chunks(key).await;
                return Ok(self.finish(key, &session.collection_ref, vec![issue]).await);
            }
        };

        self.chunks.update(key, |a| {
            a.status = FileStatus::Assembled;
            a.content_digest = Some(assembled.sha256.clone());
        });
        self.chunks
            .update(key, |a| a.status = FileStatus::Validating);

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| IntakeError::Internal(e.into()))?;

        let validation = self.validation.clone();
        let declaration = assembly.declaration.clone();
        let bytes = assembled.bytes.clone();
        let file_id = key.file_id.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            validation.validate(&file_id, &declaration, &bytes)
        })
        .await
        .map_err(join_error)?;

        let validated = match outcome {
            ValidationOutcome::Validated(validated) => validated,
            ValidationOutcome::Rejected(issues) => {
                drop(permit);
                tracing::info!("🚫 {} failed validation: {}", key, issues[0]);
                let decision = decide(ModerationInput {
                    validation_issues: &issues,
                    quality: None,
                    duplicates: &[],
                });
                let settled = self.settle(key, &token, |a| {
                    a.status = FileStatus::Rejected;
                    a.verdict = Some(decision.verdict);
                    a.issues.extend(decision.reasons.iter().cloned());
                });
                if settled.is_none() {
                    return Ok(self.discard(key));
                }
                self.purge_chunks(key).await;
                return Ok(self.finish(key, &session.collection_ref, decision.reasons).await);
            }
        };

        let warnings = validated.warnings;
        self.chunks.update(key, |a| {
            a.status = FileStatus::Validated;
            a.warnings = warnings;
        });
        self.chunks
            .update(key, |a| a.status = FileStatus::Analyzing);

        let image = Arc::new(validated.image);
        let analyzer = self.quality;
        let (quality, fingerprint) = {
            let for_quality = image.clone();
            let quality_id = key.file_id.clone();
            let for_hash = image.clone();
            tokio::join!(
                tokio::task::spawn_blocking(move || analyzer.analyze(&quality_id, &for_quality)),
                tokio::task::spawn_blocking(move || Fingerprint::of(&for_hash)),
            )
        };
        drop(permit);
        let quality = quality.map_err(join_error)?;
        let fingerprint = fingerprint.map_err(join_error)?;

        let candidates = self
            .duplicates
            .find_candidates(&session.collection_ref, key, &fingerprint)
            .await;
        let decision = decide(ModerationInput {
            validation_issues: &[],
            quality: Some(&quality),
            duplicates: &candidates,
        });

        if token.is_cancelled() {
            return Ok(self.discard(key));
        }

        let mut assembled_key = None;
        if decision.verdict != Verdict::Rejected {
            let blob_key = key.assembled_blob_key();
            if let Err(e) = self.blobs.put(&blob_key, assembled.bytes.clone()).await {
                tracing::error!("❌ Failed to store assembled {}: {:?}", key, e);
                // Chunks are still in place: put the file back so it can be retried
                self.chunks
                    .update(key, |a| a.status = FileStatus::Receiving);
                return Err(IntakeError::StorageUnavailable(e.to_string()));
            }
            assembled_key = Some(blob_key);
        }

        // The session may have been cancelled during the write
        let status = decision.verdict.as_status();
        let settled = self.settle(key, &token, |a| {
            a.status = status;
            a.verdict = Some(decision.verdict);
            a.quality = Some(quality);
            a.duplicates = candidates;
            a.assembled_key = assembled_key.clone();
            a.issues.extend(decision.reasons.iter().cloned());
        });
        if settled.is_none() {
            if let Some(blob_key) = assembled_key.as_deref() {
                if let Err(e) = self.blobs.delete(blob_key).await {
                    tracing::warn!("Failed to drop assembled {}: {:?}", key, e);
                }
            }
            return Ok(self.discard(key));
        }
        self.purge_chunks(key).await;

        if decision.verdict == Verdict::Accepted {
            self.duplicates
                .insert(&session.collection_ref, key.clone(), fingerprint)
                .await;
        }

        tracing::info!("✅ {} finished as {:?}", key, decision.verdict);
        Ok(self
            .finish(key, &session.collection_ref, decision.reasons)
            .await)
    }

    /// Records the verdict unless the session was abandoned first.
    fn settle(
        &self,
        key: &FileKey,
        token: &CancellationToken,
        f: impl FnOnce(&mut FileAssembly),
    ) -> Option<()> {
        if token.is_cancelled() {
            return None;
        }
        self.chunks.update(key, f)
    }

    /// Marks the file discarded. Nothing is published for it.
    fn discard(&self, key: &FileKey) -> FileOutcome {
        tracing::info!("🗑️  Discarding {}: session closed", key);
        self.chunks
            .update(key, |a| a.status = FileStatus::Discarded);
        FileOutcome {
            status: FileStatus::Discarded,
            verdict: None,
        }
    }

    async fn purge_chunks(&self, key: &FileKey) {
        if let Err(e) = self.chunks.purge_chunks(key).await {
            tracing::warn!("Failed to purge chunks of {}: {:?}", key, e);
        }
    }

    /// Publishes the recorded verdict and returns the outcome.
    async fn finish(&self, key: &FileKey, collection_ref: &str, reasons: Vec<Issue>) -> FileOutcome {
        let Some(assembly) = self.chunks.snapshot(key) else {
            return FileOutcome {
                status: FileStatus::Discarded,
                verdict: None,
            };
        };
        let outcome = FileOutcome {
            status: assembly.status,
            verdict: assembly.verdict,
        };
        if let Some(event) = verdict_event(&assembly, collection_ref, reasons) {
            self.sink.publish(event).await;
        }
        outcome
    }
}

/// The sink event for a file that reached a verdict.
pub fn verdict_event(
    assembly: &FileAssembly,
    collection_ref: &str,
    reasons: Vec<Issue>,
) -> Option<VerdictEvent> {
    let verdict = assembly.verdict?;
    Some(VerdictEvent {
        session_id: assembly.key.session_id,
        file_id: assembly.key.file_id.clone(),
        collection_ref: collection_ref.to_string(),
        status: assembly.status,
        verdict,
        reasons,
        quality: assembly.quality.clone(),
        duplicates: assembly.duplicates.clone(),
        content_digest: assembly.content_digest.clone(),
    })
}

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Issue;
use crate::models::{DuplicateCandidate, FileKey, FileStatus, QualityReport, Verdict};

/// Terminal outcome of one file, handed to whoever commits or reviews it.
#[derive(Debug, Clone, Serialize)]
pub struct VerdictEvent {
    pub session_id: uuid::Uuid,
    pub file_id: String,
    pub collection_ref: String,
    pub status: FileStatus,
    pub verdict: Verdict,
    pub reasons: Vec<Issue>,
    pub quality: Option<QualityReport>,
    pub duplicates: Vec<DuplicateCandidate>,
    pub content_digest: Option<String>,
}

impl VerdictEvent {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.session_id, self.file_id.clone())
    }
}

#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn publish(&self, event: VerdictEvent);
}

/// Writes verdicts to the `moderation` log target.
#[derive(Debug, Default, Clone)]
pub struct TracingVerdictSink;

#[async_trait]
impl VerdictSink for TracingVerdictSink {
    async fn publish(&self, event: VerdictEvent) {
        let codes: Vec<&str> = event.reasons.iter().map(|r| r.code.as_str()).collect();
        tracing::info!(
            target: "moderation",
            session_id = %event.session_id,
            file_id = %event.file_id,
            collection = %event.collection_ref,
            verdict = ?event.verdict,
            overall = event.quality.as_ref().map(|q| q.overall),
            duplicates = event.duplicates.len(),
            reasons = ?codes,
            "⚖️  Verdict recorded"
        );
    }
}

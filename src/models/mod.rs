use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::error::Issue;

pub type SessionId = Uuid;

/// Identity of a file within its session. File ids are chosen by the client,
/// so they are only unique per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    pub session_id: SessionId,
    pub file_id: String,
}

impl FileKey {
    pub fn new(session_id: SessionId, file_id: impl Into<String>) -> Self {
        Self {
            session_id,
            file_id: file_id.into(),
        }
    }

    pub fn file_prefix(&self) -> String {
        format!("{}files/{}/", session_prefix(self.session_id), self.file_id)
    }

    pub fn chunk_prefix(&self) -> String {
        format!("{}chunks/", self.file_prefix())
    }

    pub fn chunk_blob_key(&self, index: u32) -> String {
        format!("{}{:06}", self.chunk_prefix(), index)
    }

    pub fn assembled_blob_key(&self) -> String {
        format!("{}assembled", self.file_prefix())
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.file_id)
    }
}

pub fn session_prefix(session_id: SessionId) -> String {
    format!("sessions/{}/", session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Finalizing,
    Completed,
    PartiallyFailed,
    Expired,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::PartiallyFailed
                | SessionState::Expired
                | SessionState::Cancelled
        )
    }

    pub fn accepts_chunks(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionLimits {
    pub max_bytes: u64,
    pub max_files: u32,
    pub idle_ttl_secs: u64,
}

/// Per-session quota overrides; values above the configured ceilings are clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LimitOverrides {
    pub max_bytes: Option<u64>,
    pub max_files: Option<u32>,
    pub idle_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub owner_id: String,
    pub collection_ref: String,
    pub state: SessionState,
    pub limits: SessionLimits,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_bytes: u64,
    /// Files counted against the file quota
    pub admitted_files: u32,
    /// Every file id seen, in arrival order (refused files included)
    pub file_ids: Vec<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub purged: bool,
}

impl UploadSession {
    pub fn is_idle_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.accepts_chunks() && now >= self.expires_at
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.limits.max_bytes.saturating_sub(self.accepted_bytes)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.expires_at =
            now + chrono::Duration::seconds(self.limits.idle_ttl_secs.min(i64::MAX as u64) as i64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Receiving,
    Assembling,
    Assembled,
    Corrupt,
    Validating,
    Validated,
    Analyzing,
    Accepted,
    NeedsReview,
    Rejected,
    /// Session finalized before every chunk arrived
    Incomplete,
    /// Session cancelled while the file was being processed
    Discarded,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Corrupt
                | FileStatus::Accepted
                | FileStatus::NeedsReview
                | FileStatus::Rejected
                | FileStatus::Incomplete
                | FileStatus::Discarded
        )
    }

    pub fn accepts_chunks(&self) -> bool {
        matches!(self, FileStatus::Pending | FileStatus::Receiving)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected,
    NeedsReview,
}

impl Verdict {
    pub fn as_status(&self) -> FileStatus {
        match self {
            Verdict::Accepted => FileStatus::Accepted,
            Verdict::Rejected => FileStatus::Rejected,
            Verdict::NeedsReview => FileStatus::NeedsReview,
        }
    }
}

/// What the client tells us about a file up front. Every field is optional;
/// once set, a field cannot be changed for the same file id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema, Validate)]
pub struct FileDeclaration {
    #[validate(length(min = 1, max = 255, message = "File name must be 1-255 characters"))]
    pub name: Option<String>,
    #[validate(length(min = 3, max = 127, message = "Invalid MIME type"))]
    pub mime_type: Option<String>,
    pub total_size: Option<u64>,
    #[validate(range(min = 1, message = "Chunk count must be positive"))]
    pub total_chunks: Option<u32>,
    /// Whole-file hash: 64 hex chars for SHA-256, 32 for XXH3-128
    #[validate(length(min = 32, max = 64, message = "Invalid hash format"))]
    pub file_hash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl FileDeclaration {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fills unset fields from `other`. Returns the name of the first field
    /// whose value conflicts with what was declared before.
    pub fn merge(&mut self, other: &FileDeclaration) -> Result<(), &'static str> {
        fn fill<T: PartialEq + Clone>(
            slot: &mut Option<T>,
            incoming: &Option<T>,
            field: &'static str,
        ) -> Result<(), &'static str> {
            match (slot.as_ref(), incoming) {
                (Some(current), Some(next)) if current != next => Err(field),
                (None, Some(next)) => {
                    *slot = Some(next.clone());
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        let mut merged = self.clone();
        fill(&mut merged.name, &other.name, "name")?;
        fill(&mut merged.mime_type, &other.mime_type, "mime_type")?;
        fill(&mut merged.total_size, &other.total_size, "total_size")?;
        fill(&mut merged.total_chunks, &other.total_chunks, "total_chunks")?;
        fill(&mut merged.file_hash, &other.file_hash, "file_hash")?;
        fill(&mut merged.width, &other.width, "width")?;
        fill(&mut merged.height, &other.height, "height")?;
        *self = merged;
        Ok(())
    }
}

/// Fixed-length bitmap of received chunk indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    len: u32,
    words: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; (len as usize).div_ceil(64)],
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks `index` as received. Returns false if it was already set.
    pub fn set(&mut self, index: u32) -> bool {
        debug_assert!(index < self.len);
        let (word, bit) = ((index / 64) as usize, index % 64);
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    pub fn contains(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn received(&self) -> Vec<u32> {
        (0..self.len).filter(|i| self.contains(*i)).collect()
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.len).filter(|i| !self.contains(*i)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChunkRecord {
    pub index: u32,
    /// Where the payload lives in the blob store
    pub blob_key: String,
    pub checksum: String,
    pub size: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Reject,
    NeedsReview,
    Accept,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QualityMeasurements {
    pub width: u32,
    pub height: u32,
    pub mean_luminance: f64,
    pub luminance_std_dev: f64,
    /// Variance of the 4-neighbour Laplacian
    pub edge_energy: f64,
    /// Mean step across 8x8 block boundaries over the mean step elsewhere
    pub blockiness: f64,
    pub megapixels: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ComponentScores {
    pub sharpness: f64,
    pub contrast: f64,
    pub brightness: f64,
    pub compression_artifacts: f64,
    pub resolution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QualityReport {
    pub file_id: String,
    pub measurements: QualityMeasurements,
    pub scores: ComponentScores,
    pub overall: f64,
    pub tier: QualityTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMethod {
    HashDistance,
    HistogramCorrelation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DuplicateCandidate {
    pub file_id: String,
    pub matched_session_id: SessionId,
    pub matched_file_id: String,
    pub similarity: f64,
    pub hamming_distance: u32,
    pub histogram_correlation: f64,
    pub method: DuplicateMethod,
}

/// Per-file reassembly and moderation state.
#[derive(Debug, Clone)]
pub struct FileAssembly {
    pub key: FileKey,
    pub declaration: FileDeclaration,
    pub total_chunks: Option<u32>,
    pub bitmap: Option<ChunkBitmap>,
    pub chunks: BTreeMap<u32, ChunkRecord>,
    pub status: FileStatus,
    pub received_bytes: u64,
    /// Bytes counted against the session quota on behalf of this file
    pub charged_bytes: u64,
    pub issues: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub content_digest: Option<String>,
    pub assembled_key: Option<String>,
    pub quality: Option<QualityReport>,
    pub duplicates: Vec<DuplicateCandidate>,
    pub verdict: Option<Verdict>,
    pub completion_signalled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileAssembly {
    pub fn new(key: FileKey, declaration: FileDeclaration, now: DateTime<Utc>) -> Self {
        let total_chunks = declaration.total_chunks;
        Self {
            key,
            declaration,
            total_chunks,
            bitmap: total_chunks.map(ChunkBitmap::new),
            chunks: BTreeMap::new(),
            status: FileStatus::Pending,
            received_bytes: 0,
            charged_bytes: 0,
            issues: Vec::new(),
            warnings: Vec::new(),
            content_digest: None,
            assembled_key: None,
            quality: None,
            duplicates: Vec::new(),
            verdict: None,
            completion_signalled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.as_ref().is_some_and(|b| b.is_complete())
    }

    /// Bytes this file should have counted against the session quota.
    pub fn quota_target(&self, received_bytes: u64) -> u64 {
        self.declaration
            .total_size
            .unwrap_or(0)
            .max(received_bytes)
    }

    pub fn ack(&self, index: u32) -> ChunkAck {
        ChunkAck {
            file_id: self.key.file_id.clone(),
            index,
            total_chunks: self.total_chunks.unwrap_or(0),
            received: self
                .bitmap
                .as_ref()
                .map(|b| b.received())
                .unwrap_or_default(),
            complete: self.is_complete(),
        }
    }

    pub fn view(&self) -> FileStatusView {
        let (received, missing) = match &self.bitmap {
            Some(bitmap) => (bitmap.received(), bitmap.missing()),
            None => (Vec::new(), Vec::new()),
        };
        FileStatusView {
            file_id: self.key.file_id.clone(),
            status: self.status,
            total_chunks: self.total_chunks,
            received,
            missing,
            received_bytes: self.received_bytes,
            declaration: self.declaration.clone(),
            content_digest: self.content_digest.clone(),
            verdict: self.verdict,
            issues: self.issues.clone(),
            warnings: self.warnings.clone(),
            quality: self.quality.clone(),
            duplicates: self.duplicates.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChunkAck {
    pub file_id: String,
    pub index: u32,
    pub total_chunks: u32,
    /// Every index received so far, ascending
    pub received: Vec<u32>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub recommended_chunk_size: u64,
    pub expires_at: DateTime<Utc>,
    pub limits: SessionLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileStatusView {
    pub file_id: String,
    pub status: FileStatus,
    pub total_chunks: Option<u32>,
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub received_bytes: u64,
    pub declaration: FileDeclaration,
    pub content_digest: Option<String>,
    pub verdict: Option<Verdict>,
    pub issues: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub quality: Option<QualityReport>,
    pub duplicates: Vec<DuplicateCandidate>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub owner_id: String,
    pub collection_ref: String,
    pub state: SessionState,
    pub limits: SessionLimits,
    pub accepted_bytes: u64,
    pub admitted_files: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<FileStatusView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FinalizeReport {
    pub session_id: SessionId,
    pub state: SessionState,
    pub files: Vec<FileStatusView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MissingChunks {
    pub file_id: String,
    pub total_chunks: u32,
    pub missing: Vec<u32>,
}

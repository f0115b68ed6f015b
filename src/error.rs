use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{FileStatus, SessionState};

/// Machine-readable code attached to every recorded problem on a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    QuotaExceeded,
    InvalidFormat,
    FileTooLarge,
    InvalidDimensions,
    AspectRatio,
    DimensionMismatch,
    CorruptAssembly,
    DecodeFailure,
    Incomplete,
    LowQuality,
    QualityReview,
    PossibleDuplicate,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::QuotaExceeded => "QUOTA_EXCEEDED",
            IssueCode::InvalidFormat => "INVALID_FORMAT",
            IssueCode::FileTooLarge => "FILE_TOO_LARGE",
            IssueCode::InvalidDimensions => "INVALID_DIMENSIONS",
            IssueCode::AspectRatio => "ASPECT_RATIO",
            IssueCode::DimensionMismatch => "DIMENSION_MISMATCH",
            IssueCode::CorruptAssembly => "CORRUPT_ASSEMBLY",
            IssueCode::DecodeFailure => "DECODE_FAILURE",
            IssueCode::Incomplete => "INCOMPLETE",
            IssueCode::LowQuality => "LOW_QUALITY",
            IssueCode::QualityReview => "QUALITY_REVIEW",
            IssueCode::PossibleDuplicate => "POSSIBLE_DUPLICATE",
        }
    }
}

/// A rejection reason, warning or processing failure recorded on a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Issue {
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Bytes,
    Files,
}

/// Errors returned synchronously to the caller of an intake operation.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("{kind:?} quota exceeded for file {file_id}: limit {limit}, requested {requested}")]
    QuotaExceeded {
        file_id: String,
        kind: QuotaKind,
        limit: u64,
        requested: u64,
    },

    #[error("Invalid format for file {file_id}: {reason}")]
    InvalidFormat { file_id: String, reason: String },

    #[error("File {file_id} is too large: {size} bytes, limit {limit} bytes")]
    FileTooLarge {
        file_id: String,
        size: u64,
        limit: u64,
    },

    #[error("Invalid dimensions for file {file_id}: {width}x{height}")]
    InvalidDimensions {
        file_id: String,
        width: u32,
        height: u32,
        min: (u32, u32),
        max: (u32, u32),
    },

    #[error("Checksum mismatch for file {file_id} chunk {index}")]
    ChecksumMismatch {
        file_id: String,
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Session {0} has expired")]
    SessionExpired(Uuid),

    #[error("Out of range for file {file_id}: {reason}")]
    OutOfRange {
        file_id: String,
        index: Option<u32>,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("File {file_id} not found in session {session_id}")]
    FileNotFound { session_id: Uuid, file_id: String },

    #[error("Session {session_id} no longer accepts this operation (state: {state:?})")]
    SessionClosed {
        session_id: Uuid,
        state: SessionState,
    },

    #[error("File {file_id} no longer accepts chunks (status: {status:?})")]
    FileClosed { file_id: String, status: FileStatus },

    #[error("Owner {owner_id} may not write to collection {collection_ref}")]
    Unauthorized {
        owner_id: String,
        collection_ref: String,
    },

    #[error("Storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntakeError {
    pub fn code(&self) -> &'static str {
        match self {
            IntakeError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            IntakeError::InvalidFormat { .. } => "INVALID_FORMAT",
            IntakeError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            IntakeError::InvalidDimensions { .. } => "INVALID_DIMENSIONS",
            IntakeError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            IntakeError::SessionExpired(_) => "SESSION_EXPIRED",
            IntakeError::OutOfRange { .. } => "OUT_OF_RANGE",
            IntakeError::InvalidRequest(_) => "INVALID_REQUEST",
            IntakeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            IntakeError::FileNotFound { .. } => "FILE_NOT_FOUND",
            IntakeError::SessionClosed { .. } => "SESSION_CLOSED",
            IntakeError::FileClosed { .. } => "FILE_CLOSED",
            IntakeError::Unauthorized { .. } => "UNAUTHORIZED",
            IntakeError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            IntakeError::Internal(_) => "INTERNAL",
        }
    }

    /// Structured detail for the caller to self-correct.
    pub fn details(&self) -> Value {
        match self {
            IntakeError::QuotaExceeded {
                file_id,
                kind,
                limit,
                requested,
            } => json!({
                "file_id": file_id,
                "quota": kind,
                "limit": limit,
                "requested": requested,
            }),
            IntakeError::InvalidFormat { file_id, reason } => {
                json!({ "file_id": file_id, "reason": reason })
            }
            IntakeError::FileTooLarge {
                file_id,
                size,
                limit,
            } => json!({ "file_id": file_id, "size": size, "limit": limit }),
            IntakeError::InvalidDimensions {
                file_id,
                width,
                height,
                min,
                max,
            } => json!({
                "file_id": file_id,
                "width": width,
                "height": height,
                "min": { "width": min.0, "height": min.1 },
                "max": { "width": max.0, "height": max.1 },
            }),
            IntakeError::ChecksumMismatch {
                file_id,
                index,
                expected,
                actual,
            } => json!({
                "file_id": file_id,
                "index": index,
                "expected": expected,
                "actual": actual,
            }),
            IntakeError::SessionExpired(id) | IntakeError::SessionNotFound(id) => {
                json!({ "session_id": id })
            }
            IntakeError::OutOfRange {
                file_id,
                index,
                reason,
            } => json!({ "file_id": file_id, "index": index, "reason": reason }),
            IntakeError::FileNotFound {
                session_id,
                file_id,
            } => json!({ "session_id": session_id, "file_id": file_id }),
            IntakeError::SessionClosed { session_id, state } => {
                json!({ "session_id": session_id, "state": state })
            }
            IntakeError::FileClosed { file_id, status } => {
                json!({ "file_id": file_id, "status": status })
            }
            IntakeError::Unauthorized {
                owner_id,
                collection_ref,
            } => json!({ "owner_id": owner_id, "collection_ref": collection_ref }),
            IntakeError::InvalidRequest(_)
            | IntakeError::StorageUnavailable(_)
            | IntakeError::Internal(_) => Value::Null,
        }
    }

    /// The same problem as it is recorded on a file's status.
    pub fn to_issue(&self) -> Option<Issue> {
        let code = match self {
            IntakeError::QuotaExceeded { .. } => IssueCode::QuotaExceeded,
            IntakeError::InvalidFormat { .. } => IssueCode::InvalidFormat,
            IntakeError::FileTooLarge { .. } => IssueCode::FileTooLarge,
            IntakeError::InvalidDimensions { .. } => IssueCode::InvalidDimensions,
            _ => return None,
        };
        Some(Issue::new(code, self.to_string()).with_details(self.details()))
    }
}

use thiserror::Error;

use crate::diff::DiffError;
use crate::model::Platform;

/// Failure of one document's sync pass. Every variant leaves the tracking
/// cursor where it was.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {platform} document {document_id} failed: {source:#}")]
    Fetch {
        platform: Platform,
        document_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tracking state of {platform} document {document_id} is inconsistent: {reason}")]
    Consistency {
        platform: Platform,
        document_id: String,
        reason: String,
    },
    #[error("diff of {platform} document {document_id} unit {unit_id} failed: {source}")]
    Diff {
        platform: Platform,
        document_id: String,
        unit_id: String,
        #[source]
        source: DiffError,
    },
    #[error("persisting sync of {platform} document {document_id} failed: {source:#}")]
    Persistence {
        platform: Platform,
        document_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tracking cursor of {platform} document {document_id} moved during sync")]
    CursorConflict {
        platform: Platform,
        document_id: String,
    },
}

impl SyncError {
    pub fn document_id(&self) -> &str {
        match self {
            SyncError::Fetch { document_id, .. }
            | SyncError::Consistency { document_id, .. }
            | SyncError::Diff { document_id, .. }
            | SyncError::Persistence { document_id, .. }
            | SyncError::CursorConflict { document_id, .. } => document_id,
        }
    }

    /// Whether retrying later against the same state can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Fetch { .. } | SyncError::Persistence { .. } | SyncError::CursorConflict { .. }
        )
    }

    pub(crate) fn fetch(platform: Platform, document_id: &str, source: anyhow::Error) -> Self {
        SyncError::Fetch {
            platform,
            document_id: document_id.to_string(),
            source,
        }
    }

    pub(crate) fn persistence(platform: Platform, document_id: &str, source: anyhow::Error) -> Self {
        SyncError::Persistence {
            platform,
            document_id: document_id.to_string(),
            source,
        }
    }
}

/// Why a single unit was left out of an otherwise successful pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error("malformed upstream data: {0}")]
    Malformed(String),
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Platform {
    #[serde(rename = "google_drive")]
    GoogleDrive,
    #[serde(rename = "notion")]
    Notion,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GoogleDrive => "google_drive",
            Platform::Notion => "notion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google_drive" | "drive" => Some(Platform::GoogleDrive),
            "notion" => Some(Platform::Notion),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processed Drive revision. `plain_text` is already normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveRevision {
    pub document_id: String,
    pub revision_id: String,
    pub plain_text: String,
    pub editor_email: Option<String>,
    pub modified_time: DateTime<Utc>,
}

/// A single Notion block as fetched or as stored in the current snapshot set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotionBlock {
    pub page_id: String,
    pub block_id: String,
    pub block_type: String,
    pub plain_text: String,
    pub last_edited_time: DateTime<Utc>,
    pub last_edited_by: Option<String>,
    pub parent_block_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveTracking {
    pub document_id: String,
    pub document_title: Option<String>,
    pub last_processed_revision_id: Option<String>,
    pub last_check_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionTracking {
    pub page_id: String,
    pub page_title: Option<String>,
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub last_edited_time: Option<DateTime<Utc>>,
    pub last_check_time: DateTime<Utc>,
}

/// Text fragments introduced and removed by one change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }

    /// The same change seen from the other direction.
    pub fn mirrored(self) -> Self {
        ChangeSet {
            added: self.deleted,
            deleted: self.added,
        }
    }
}

/// One immutable audit entry, serialized in the downstream JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub platform: Platform,
    pub document_id: String,
    pub editor: String,
    pub timestamp: DateTime<Utc>,
    pub changes: ChangeSet,
}

/// Row id of a persisted `ChangeRecord` in `diff_history`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChangeRecordId(pub i64);

pub const UNKNOWN_EDITOR: &str = "unknown";

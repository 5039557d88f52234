//! Row-level view models returned by repositories.
//!
//! Domain types live in `crate::model`; these wrap them with storage
//! metadata that only readers of the history need.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{ChangeRecord, ChangeRecordId, NotionBlock, Platform};

/// A Notion block snapshot row, current or superseded.
#[derive(Debug, Clone)]
pub struct StoredNotionBlock {
    pub block: NotionBlock,
    pub snapshot_time: DateTime<Utc>,
    pub is_current: bool,
}

/// A `diff_history` row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChangeRecord {
    pub id: ChangeRecordId,
    #[serde(flatten)]
    pub record: ChangeRecord,
    pub created_at: String,
}

/// Filter for reading back `diff_history`.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecordFilter {
    pub platform: Option<Platform>,
    pub document_id: Option<String>,
    /// Only rows with an id strictly greater than this.
    pub since_id: Option<i64>,
    pub limit: Option<i64>,
}

//! Change recorder: the only writer of snapshots, history and cursors.
//!
//! Each commit is one SQLite transaction holding the snapshot writes, the
//! `diff_history` inserts and a compare-and-swap on the tracking cursor.
//! Either all of it lands or none of it does.
use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::{ChangeRecord, ChangeRecordId, DriveRevision, NotionBlock, Platform};

#[derive(Debug, Clone)]
pub struct DriveCommit {
    pub document_id: String,
    pub title: Option<String>,
    /// Cursor value read at the start of the pass.
    pub expected_cursor: Option<String>,
    pub snapshot: DriveRevision,
    pub record: Option<ChangeRecord>,
}

#[derive(Debug, Clone)]
pub struct NotionCommit {
    pub page_id: String,
    pub title: Option<String>,
    pub expected_cursor: Option<DateTime<Utc>>,
    pub new_cursor: Option<DateTime<Utc>>,
    /// Added and updated blocks; each becomes the current snapshot.
    pub upserts: Vec<NotionBlock>,
    /// Blocks gone upstream; their current snapshot is demoted.
    pub retired: Vec<String>,
    pub records: Vec<ChangeRecord>,
}

/// Stamp `last_check_time` for a Drive attempt. Leaves the cursor alone.
#[instrument(skip_all)]
pub async fn touch_drive_check(
    pool: &Pool,
    document_id: &str,
    now: DateTime<Utc>,
) -> Result<(), SyncError> {
    db::touch_drive_tracking(pool, document_id, now)
        .await
        .map_err(|e| SyncError::persistence(Platform::GoogleDrive, document_id, e))
}

#[instrument(skip_all)]
pub async fn touch_notion_check(
    pool: &Pool,
    page_id: &str,
    now: DateTime<Utc>,
) -> Result<(), SyncError> {
    db::touch_notion_tracking(pool, page_id, now)
        .await
        .map_err(|e| SyncError::persistence(Platform::Notion, page_id, e))
}

#[instrument(skip_all)]
pub async fn commit_drive(
    pool: &Pool,
    commit: &DriveCommit,
    now: DateTime<Utc>,
) -> Result<Vec<ChangeRecordId>, SyncError> {
    let platform = Platform::GoogleDrive;
    let doc = commit.document_id.as_str();
    let fail = |e: anyhow::Error| SyncError::persistence(platform, doc, e);

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin transaction")
        .map_err(fail)?;

    db::put_drive_snapshot_tx(&mut tx, &commit.snapshot, now)
        .await
        .map_err(fail)?;

    let mut ids = Vec::new();
    if let Some(record) = &commit.record {
        ids.push(db::insert_change_record_tx(&mut tx, record).await.map_err(fail)?);
    }

    let advanced = db::advance_drive_cursor_tx(
        &mut tx,
        doc,
        commit.expected_cursor.as_deref(),
        &commit.snapshot.revision_id,
        commit.title.as_deref(),
        now,
    )
    .await
    .map_err(fail)?;
    if !advanced {
        tx.rollback()
            .await
            .context("failed to roll back")
            .map_err(fail)?;
        return Err(SyncError::CursorConflict {
            platform,
            document_id: doc.to_string(),
        });
    }

    tx.commit()
        .await
        .context("failed to commit drive sync")
        .map_err(fail)?;
    debug!(document_id = doc, revision_id = %commit.snapshot.revision_id, records = ids.len(), "drive sync committed");
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn commit_notion(
    pool: &Pool,
    commit: &NotionCommit,
    now: DateTime<Utc>,
) -> Result<Vec<ChangeRecordId>, SyncError> {
    let platform = Platform::Notion;
    let page = commit.page_id.as_str();
    let fail = |e: anyhow::Error| SyncError::persistence(platform, page, e);

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin transaction")
        .map_err(fail)?;

    for block_id in &commit.retired {
        db::retire_notion_block_tx(&mut tx, page, block_id)
            .await
            .map_err(fail)?;
    }
    for block in &commit.upserts {
        db::put_notion_block_tx(&mut tx, block, now)
            .await
            .map_err(fail)?;
    }

    let mut ids = Vec::with_capacity(commit.records.len());
    for record in &commit.records {
        ids.push(db::insert_change_record_tx(&mut tx, record).await.map_err(fail)?);
    }

    let advanced = db::advance_notion_cursor_tx(
        &mut tx,
        page,
        commit.expected_cursor,
        commit.new_cursor,
        commit.title.as_deref(),
        now,
    )
    .await
    .map_err(fail)?;
    if !advanced {
        tx.rollback()
            .await
            .context("failed to roll back")
            .map_err(fail)?;
        return Err(SyncError::CursorConflict {
            platform,
            document_id: page.to_string(),
        });
    }

    tx.commit()
        .await
        .context("failed to commit notion sync")
        .map_err(fail)?;
    debug!(
        page_id = page,
        upserts = commit.upserts.len(),
        retired = commit.retired.len(),
        records = ids.len(),
        "notion sync committed"
    );
    Ok(ids)
}

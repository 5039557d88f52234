//! One sync pass per document: fetch, classify, diff, commit.
//!
//! Passes on the same `(platform, document_id)` are serialized through
//! [`DocumentLocks`]; passes on different documents run freely in parallel.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::diff::DiffOptions;
use crate::drive::DriveService;
use crate::error::{SkipReason, SyncError};
use crate::model::{ChangeRecord, ChangeRecordId, DriveRevision, Platform, UNKNOWN_EDITOR};
use crate::notion::NotionService;
use crate::reconcile::{self, ChangeKind, DriveDecision, UnitChange};
use crate::recorder::{self, DriveCommit, NotionCommit};
use crate::text;

/// Registry of per-document async mutexes. Entries are never evicted, so the
/// map grows with the number of distinct ids ever synced; callers are expected
/// to sync a bounded, configured set of documents.
#[derive(Debug, Clone, Default)]
pub struct DocumentLocks {
    inner: Arc<Mutex<HashMap<(Platform, String), Arc<Mutex<()>>>>>,
}

impl DocumentLocks {
    pub async fn acquire(&self, platform: Platform, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry((platform, document_id.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationCounts {
    pub added: usize,
    pub deleted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ClassificationCounts {
    fn bump(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Added => self.added += 1,
            ChangeKind::Deleted => self.deleted += 1,
            ChangeKind::Updated => self.updated += 1,
            ChangeKind::Unchanged => self.unchanged += 1,
        }
    }
}

/// A unit left out of a pass because it could not be parsed or diffed. Its
/// snapshot is left as it was, so the next pass retries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUnit {
    /// `None` when upstream returned a unit without an id.
    pub unit_id: Option<String>,
    pub error: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing changed upstream; nothing was written besides the check time.
    NoChange,
    /// Upstream returned a revision older than the processed one.
    Stale,
    Committed,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub sync_id: Uuid,
    pub platform: Platform,
    pub document_id: String,
    pub outcome: SyncOutcome,
    pub record_ids: Vec<ChangeRecordId>,
    pub records: Vec<ChangeRecord>,
    pub counts: ClassificationCounts,
    pub skipped: Vec<SkippedUnit>,
    /// Unit ids that appeared more than once in the fetch.
    pub duplicates: Vec<String>,
    pub cursor_advanced: bool,
}

impl SyncReport {
    fn new(sync_id: Uuid, platform: Platform, document_id: &str) -> Self {
        Self {
            sync_id,
            platform,
            document_id: document_id.to_string(),
            outcome: SyncOutcome::NoChange,
            record_ids: Vec::new(),
            records: Vec::new(),
            counts: ClassificationCounts::default(),
            skipped: Vec::new(),
            duplicates: Vec::new(),
            cursor_advanced: false,
        }
    }
}

#[derive(Clone)]
pub struct Syncer {
    pool: Pool,
    drive: Arc<dyn DriveService>,
    notion: Arc<dyn NotionService>,
    diff_opts: DiffOptions,
    locks: DocumentLocks,
}

impl Syncer {
    pub fn new(
        pool: Pool,
        drive: Arc<dyn DriveService>,
        notion: Arc<dyn NotionService>,
        diff_opts: DiffOptions,
    ) -> Self {
        Self {
            pool,
            drive,
            notion,
            diff_opts,
            locks: DocumentLocks::default(),
        }
    }

    pub async fn sync(&self, platform: Platform, document_id: &str) -> Result<SyncReport, SyncError> {
        match platform {
            Platform::GoogleDrive => self.sync_drive_document(document_id).await,
            Platform::Notion => self.sync_notion_page(document_id).await,
        }
    }

    /// Sync every target concurrently. Results come back in target order.
    pub async fn sync_all(&self, targets: &[(Platform, String)]) -> Vec<Result<SyncReport, SyncError>> {
        join_all(
            targets
                .iter()
                .map(|(platform, id)| self.sync(*platform, id)),
        )
        .await
    }

    pub async fn sync_drive_document(&self, document_id: &str) -> Result<SyncReport, SyncError> {
        let sync_id = Uuid::new_v4();
        let span = info_span!("drive_sync", document_id, sync_id = %sync_id);
        async {
            let _guard = self.locks.acquire(Platform::GoogleDrive, document_id).await;
            self.drive_pass(document_id, sync_id).await
        }
        .instrument(span)
        .await
    }

    pub async fn sync_notion_page(&self, page_id: &str) -> Result<SyncReport, SyncError> {
        let sync_id = Uuid::new_v4();
        let span = info_span!("notion_sync", page_id, sync_id = %sync_id);
        async {
            let _guard = self.locks.acquire(Platform::Notion, page_id).await;
            self.notion_pass(page_id, sync_id).await
        }
        .instrument(span)
        .await
    }

    async fn drive_pass(&self, document_id: &str, sync_id: Uuid) -> Result<SyncReport, SyncError> {
        let platform = Platform::GoogleDrive;
        let persist = |e: anyhow::Error| SyncError::persistence(platform, document_id, e);
        let fetch = |e: anyhow::Error| SyncError::fetch(platform, document_id, e);
        let mut report = SyncReport::new(sync_id, platform, document_id);

        recorder::touch_drive_check(&self.pool, document_id, Utc::now()).await?;

        let tracking = db::get_drive_tracking(&self.pool, document_id)
            .await
            .map_err(persist)?;
        let expected_cursor = tracking
            .as_ref()
            .and_then(|t| t.last_processed_revision_id.clone());
        let known_title = tracking.and_then(|t| t.document_title);

        let prior = match expected_cursor.as_deref() {
            Some(revision_id) => {
                let snapshot = db::get_drive_snapshot(&self.pool, document_id, revision_id)
                    .await
                    .map_err(persist)?;
                Some(snapshot.ok_or_else(|| SyncError::Consistency {
                    platform,
                    document_id: document_id.to_string(),
                    reason: format!("cursor {} has no stored snapshot", revision_id),
                })?)
            }
            None => None,
        };

        let revisions = self.drive.list_revisions(document_id).await.map_err(fetch)?;
        let Some(latest) = revisions.into_iter().max_by_key(|r| r.modified_time) else {
            debug!("document has no revisions yet");
            return Ok(report);
        };

        match reconcile::drive_decision(prior.as_ref(), &latest) {
            DriveDecision::UpToDate => {
                report.counts.bump(ChangeKind::Unchanged);
                debug!(revision_id = %latest.revision_id, "already processed");
                return Ok(report);
            }
            DriveDecision::Stale => {
                warn!(
                    revision_id = %latest.revision_id,
                    "latest listed revision is older than the processed one, skipping"
                );
                report.outcome = SyncOutcome::Stale;
                return Ok(report);
            }
            DriveDecision::Process => {}
        }

        let raw = self
            .drive
            .get_revision_text(document_id, &latest.revision_id)
            .await
            .map_err(fetch)?;
        let current = DriveRevision {
            document_id: document_id.to_string(),
            revision_id: latest.revision_id,
            plain_text: text::normalize(&raw),
            editor_email: latest.editor_email,
            modified_time: latest.modified_time,
        };

        let change = match &prior {
            Some(old) => UnitChange::Updated { old, new: &current },
            None => UnitChange::Added(&current),
        };
        report.counts.bump(change.kind());
        let changes = change
            .diff(&self.diff_opts)
            .map_err(|source| SyncError::Diff {
                platform,
                document_id: document_id.to_string(),
                unit_id: current.revision_id.clone(),
                source,
            })?;

        let record = (!changes.is_empty()).then(|| ChangeRecord {
            platform,
            document_id: document_id.to_string(),
            editor: current
                .editor_email
                .clone()
                .unwrap_or_else(|| UNKNOWN_EDITOR.to_string()),
            timestamp: current.modified_time,
            changes,
        });

        let title = match known_title {
            Some(title) => Some(title),
            None => self.drive.document_title(document_id).await.unwrap_or_else(|e| {
                warn!(error = %e, "could not read document title");
                None
            }),
        };

        let commit = DriveCommit {
            document_id: document_id.to_string(),
            title,
            expected_cursor,
            snapshot: current,
            record,
        };
        report.record_ids = recorder::commit_drive(&self.pool, &commit, Utc::now()).await?;
        report.records = commit.record.into_iter().collect();
        report.outcome = SyncOutcome::Committed;
        report.cursor_advanced = true;
        info!(
            revision_id = %commit.snapshot.revision_id,
            records = report.record_ids.len(),
            "drive document synced"
        );
        Ok(report)
    }

    async fn notion_pass(&self, page_id: &str, sync_id: Uuid) -> Result<SyncReport, SyncError> {
        let platform = Platform::Notion;
        let persist = |e: anyhow::Error| SyncError::persistence(platform, page_id, e);
        let mut report = SyncReport::new(sync_id, platform, page_id);

        recorder::touch_notion_check(&self.pool, page_id, Utc::now()).await?;

        let tracking = db::get_notion_tracking(&self.pool, page_id)
            .await
            .map_err(persist)?;
        let expected_cursor = tracking.as_ref().and_then(|t| t.last_edited_time);
        let known_title = tracking.and_then(|t| t.page_title);

        let stored = db::current_notion_blocks(&self.pool, page_id)
            .await
            .map_err(persist)?;
        let fetch = self
            .notion
            .list_blocks_recursive(page_id)
            .await
            .map_err(|e| SyncError::fetch(platform, page_id, e))?;
        let mut fetched = fetch.blocks;
        for block in &mut fetched {
            block.plain_text = text::normalize(&block.plain_text);
        }

        // A stored block whose fresh copy failed to parse is not gone. If a
        // failure has no id at all, no absence can be trusted this pass.
        let unparsed: HashSet<&str> = fetch
            .failures
            .iter()
            .filter_map(|f| f.block_id.as_deref())
            .collect();
        let unidentified = fetch.failures.iter().any(|f| f.block_id.is_none());
        for failure in &fetch.failures {
            report.skipped.push(SkippedUnit {
                unit_id: failure.block_id.clone(),
                error: SkipReason::Malformed(failure.reason.clone()),
            });
        }

        let classification = reconcile::classify(&stored, &fetched);
        for dup in &classification.duplicates {
            warn!(block_id = %dup.block_id, "block listed twice, keeping the first");
            report.duplicates.push(dup.block_id.clone());
        }

        let now = Utc::now();
        let mut upserts = Vec::new();
        let mut retired = Vec::new();
        let mut records = Vec::new();
        for change in &classification.changes {
            if let UnitChange::Deleted(old) = change {
                if unidentified || unparsed.contains(old.block_id.as_str()) {
                    debug!(block_id = %old.block_id, "not fetched cleanly, keeping snapshot");
                    continue;
                }
            }
            report.counts.bump(change.kind());
            if change.kind() == ChangeKind::Unchanged {
                continue;
            }
            let changes = match change.diff(&self.diff_opts) {
                Ok(changes) => changes,
                Err(error) => {
                    warn!(block_id = change.key(), %error, "skipping block");
                    report.skipped.push(SkippedUnit {
                        unit_id: Some(change.key().to_string()),
                        error: error.into(),
                    });
                    continue;
                }
            };
            // Block additions and removals are change events even when the
            // block carries no text; edits are only recorded when text moved.
            let record_empty = !matches!(change, UnitChange::Updated { .. });
            let (editor, timestamp) = match change {
                UnitChange::Added(new) | UnitChange::Updated { new, .. } => {
                    upserts.push((*new).clone());
                    (new.last_edited_by.clone(), new.last_edited_time)
                }
                UnitChange::Deleted(old) => {
                    retired.push(old.block_id.clone());
                    (None, now)
                }
                UnitChange::Unchanged(_) => continue,
            };
            if record_empty || !changes.is_empty() {
                records.push(ChangeRecord {
                    platform,
                    document_id: page_id.to_string(),
                    editor: editor.unwrap_or_else(|| UNKNOWN_EDITOR.to_string()),
                    timestamp,
                    changes,
                });
            }
        }

        let fetched_max = fetched.iter().map(|b| b.last_edited_time).max();
        let new_cursor = expected_cursor.max(fetched_max);

        if upserts.is_empty()
            && retired.is_empty()
            && records.is_empty()
            && new_cursor == expected_cursor
        {
            debug!(
                unchanged = report.counts.unchanged,
                skipped = report.skipped.len(),
                "page unchanged"
            );
            return Ok(report);
        }

        let title = match known_title {
            Some(title) => Some(title),
            None => self.notion.page_title(page_id).await.unwrap_or_else(|e| {
                warn!(error = %e, "could not read page title");
                None
            }),
        };

        let commit = NotionCommit {
            page_id: page_id.to_string(),
            title,
            expected_cursor,
            new_cursor,
            upserts,
            retired,
            records,
        };
        report.record_ids = recorder::commit_notion(&self.pool, &commit, Utc::now()).await?;
        report.records = commit.records;
        report.outcome = SyncOutcome::Committed;
        report.cursor_advanced = new_cursor != expected_cursor;
        info!(
            added = report.counts.added,
            updated = report.counts.updated,
            deleted = report.counts.deleted,
            records = report.record_ids.len(),
            skipped = report.skipped.len(),
            "notion page synced"
        );
        Ok(report)
    }
}

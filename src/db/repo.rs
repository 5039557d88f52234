use super::model::{ChangeRecordFilter, StoredChangeRecord, StoredNotionBlock};
use crate::model::{
    ChangeRecord, ChangeRecordId, ChangeSet, DriveRevision, DriveTracking, NotionBlock,
    NotionTracking, Platform,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'c> = Transaction<'c, Sqlite>;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL, make sure the parent
/// directory exists and ask SQLite to create the file. In-memory and
/// non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracking state

#[instrument(skip_all)]
pub async fn get_drive_tracking(pool: &Pool, document_id: &str) -> Result<Option<DriveTracking>> {
    let row = sqlx::query(
        "SELECT document_id, document_title, last_processed_revision_id, last_check_time \
         FROM drive_tracking WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(DriveTracking {
        document_id: row.get("document_id"),
        document_title: row.try_get("document_title")?,
        last_processed_revision_id: row.try_get("last_processed_revision_id")?,
        last_check_time: row.try_get("last_check_time")?,
    }))
}

#[instrument(skip_all)]
pub async fn get_notion_tracking(pool: &Pool, page_id: &str) -> Result<Option<NotionTracking>> {
    let row = sqlx::query(
        "SELECT page_id, page_title, last_snapshot_time, last_edited_time, last_check_time \
         FROM notion_tracking WHERE page_id = ?",
    )
    .bind(page_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(NotionTracking {
        page_id: row.get("page_id"),
        page_title: row.try_get("page_title")?,
        last_snapshot_time: row.try_get("last_snapshot_time")?,
        last_edited_time: row.try_get("last_edited_time")?,
        last_check_time: row.try_get("last_check_time")?,
    }))
}

/// Record a sync attempt without touching the cursor.
#[instrument(skip_all)]
pub async fn touch_drive_tracking(pool: &Pool, document_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO drive_tracking (document_id, last_check_time) VALUES (?, ?) \
         ON CONFLICT(document_id) DO UPDATE SET last_check_time = excluded.last_check_time",
    )
    .bind(document_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn touch_notion_tracking(pool: &Pool, page_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO notion_tracking (page_id, last_check_time) VALUES (?, ?) \
         ON CONFLICT(page_id) DO UPDATE SET last_check_time = excluded.last_check_time",
    )
    .bind(page_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move the Drive cursor from `expected` to `new_revision_id`. Returns false
/// when the stored cursor no longer equals `expected`.
pub async fn advance_drive_cursor_tx(
    tx: &mut Tx<'_>,
    document_id: &str,
    expected: Option<&str>,
    new_revision_id: &str,
    title: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO drive_tracking (document_id, document_title, last_processed_revision_id, last_check_time) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(document_id) DO UPDATE SET \
            document_title = COALESCE(excluded.document_title, drive_tracking.document_title), \
            last_processed_revision_id = excluded.last_processed_revision_id, \
            last_check_time = excluded.last_check_time \
         WHERE drive_tracking.last_processed_revision_id IS ?",
    )
    .bind(document_id)
    .bind(title)
    .bind(new_revision_id)
    .bind(now)
    .bind(expected)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Move the Notion cursor from `expected` to `new_edited_time`. Returns false
/// when the stored cursor no longer equals `expected`.
pub async fn advance_notion_cursor_tx(
    tx: &mut Tx<'_>,
    page_id: &str,
    expected: Option<DateTime<Utc>>,
    new_edited_time: Option<DateTime<Utc>>,
    title: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO notion_tracking (page_id, page_title, last_snapshot_time, last_edited_time, last_check_time) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(page_id) DO UPDATE SET \
            page_title = COALESCE(excluded.page_title, notion_tracking.page_title), \
            last_snapshot_time = excluded.last_snapshot_time, \
            last_edited_time = excluded.last_edited_time, \
            last_check_time = excluded.last_check_time \
         WHERE notion_tracking.last_edited_time IS ?",
    )
    .bind(page_id)
    .bind(title)
    .bind(now)
    .bind(new_edited_time)
    .bind(now)
    .bind(expected)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Drive snapshots

fn drive_revision_from_row(row: &SqliteRow) -> Result<DriveRevision> {
    Ok(DriveRevision {
        document_id: row.try_get("document_id")?,
        revision_id: row.try_get("revision_id")?,
        plain_text: row.try_get("plain_text")?,
        editor_email: row.try_get("editor_email")?,
        modified_time: row.try_get("modified_time")?,
    })
}

#[instrument(skip_all)]
pub async fn get_drive_snapshot(
    pool: &Pool,
    document_id: &str,
    revision_id: &str,
) -> Result<Option<DriveRevision>> {
    let row = sqlx::query(
        "SELECT document_id, revision_id, plain_text, editor_email, modified_time \
         FROM drive_revisions WHERE document_id = ? AND revision_id = ?",
    )
    .bind(document_id)
    .bind(revision_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(drive_revision_from_row).transpose()
}

/// All processed revisions of a document, oldest first.
pub async fn list_drive_snapshots(pool: &Pool, document_id: &str) -> Result<Vec<DriveRevision>> {
    let rows = sqlx::query(
        "SELECT document_id, revision_id, plain_text, editor_email, modified_time \
         FROM drive_revisions WHERE document_id = ? ORDER BY id",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(drive_revision_from_row).collect()
}

/// Upsert on `(document_id, revision_id)`.
pub async fn put_drive_snapshot_tx(
    tx: &mut Tx<'_>,
    revision: &DriveRevision,
    snapshot_time: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO drive_revisions (document_id, revision_id, plain_text, editor_email, modified_time, snapshot_time) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(document_id, revision_id) DO UPDATE SET \
            plain_text = excluded.plain_text, \
            editor_email = excluded.editor_email, \
            modified_time = excluded.modified_time, \
            snapshot_time = excluded.snapshot_time",
    )
    .bind(&revision.document_id)
    .bind(&revision.revision_id)
    .bind(&revision.plain_text)
    .bind(&revision.editor_email)
    .bind(revision.modified_time)
    .bind(snapshot_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notion snapshots

const NOTION_BLOCK_COLUMNS: &str = "page_id, block_id, block_type, plain_text, last_edited_time, \
     last_edited_by, parent_block_id, snapshot_time, is_current";

fn notion_block_from_row(row: &SqliteRow) -> Result<StoredNotionBlock> {
    Ok(StoredNotionBlock {
        block: NotionBlock {
            page_id: row.try_get("page_id")?,
            block_id: row.try_get("block_id")?,
            block_type: row.try_get("block_type")?,
            plain_text: row.try_get("plain_text")?,
            last_edited_time: row.try_get("last_edited_time")?,
            last_edited_by: row.try_get("last_edited_by")?,
            parent_block_id: row.try_get("parent_block_id")?,
        },
        snapshot_time: row.try_get("snapshot_time")?,
        is_current: row.try_get("is_current")?,
    })
}

/// Current snapshot of every block on a page, in insertion order.
#[instrument(skip_all)]
pub async fn current_notion_blocks(pool: &Pool, page_id: &str) -> Result<Vec<NotionBlock>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM notion_blocks WHERE page_id = ? AND is_current = 1 ORDER BY id",
        NOTION_BLOCK_COLUMNS
    ))
    .bind(page_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| notion_block_from_row(row).map(|stored| stored.block))
        .collect()
}

/// Every snapshot ever taken of one block, oldest first.
pub async fn notion_block_history(
    pool: &Pool,
    page_id: &str,
    block_id: &str,
) -> Result<Vec<StoredNotionBlock>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM notion_blocks WHERE page_id = ? AND block_id = ? ORDER BY id",
        NOTION_BLOCK_COLUMNS
    ))
    .bind(page_id)
    .bind(block_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notion_block_from_row).collect()
}

/// Demote the current snapshot of the block (if any) and insert `block` as
/// the new current one.
pub async fn put_notion_block_tx(
    tx: &mut Tx<'_>,
    block: &NotionBlock,
    snapshot_time: DateTime<Utc>,
) -> Result<()> {
    retire_notion_block_tx(tx, &block.page_id, &block.block_id).await?;
    sqlx::query(
        "INSERT INTO notion_blocks (page_id, block_id, block_type, plain_text, last_edited_time, \
            last_edited_by, parent_block_id, snapshot_time, is_current) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&block.page_id)
    .bind(&block.block_id)
    .bind(&block.block_type)
    .bind(&block.plain_text)
    .bind(block.last_edited_time)
    .bind(&block.last_edited_by)
    .bind(&block.parent_block_id)
    .bind(snapshot_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Mark the block's current snapshot as superseded. History is kept.
pub async fn retire_notion_block_tx(tx: &mut Tx<'_>, page_id: &str, block_id: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE notion_blocks SET is_current = 0 WHERE page_id = ? AND block_id = ? AND is_current = 1",
    )
    .bind(page_id)
    .bind(block_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Change history

pub async fn insert_change_record_tx(tx: &mut Tx<'_>, record: &ChangeRecord) -> Result<ChangeRecordId> {
    let diff_json =
        serde_json::to_string(&record.changes).context("failed to encode change set")?;
    let rec = sqlx::query(
        "INSERT INTO diff_history (platform, document_id, editor, timestamp, diff_json) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(record.platform.as_str())
    .bind(&record.document_id)
    .bind(&record.editor)
    .bind(record.timestamp)
    .bind(diff_json)
    .fetch_one(&mut **tx)
    .await?;
    Ok(ChangeRecordId(rec.get("id")))
}

#[instrument(skip_all)]
pub async fn list_change_records(
    pool: &Pool,
    filter: &ChangeRecordFilter,
) -> Result<Vec<StoredChangeRecord>> {
    let platform = filter.platform.map(|p| p.as_str());
    let rows = sqlx::query(
        "SELECT id, platform, document_id, editor, timestamp, diff_json, created_at \
         FROM diff_history \
         WHERE (? IS NULL OR platform = ?) AND (? IS NULL OR document_id = ?) AND id > ? \
         ORDER BY id LIMIT ?",
    )
    .bind(platform)
    .bind(platform)
    .bind(filter.document_id.as_deref())
    .bind(filter.document_id.as_deref())
    .bind(filter.since_id.unwrap_or(0))
    .bind(filter.limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let platform_str: String = row.get("platform");
            let platform = Platform::parse(&platform_str)
                .ok_or_else(|| anyhow!("change record {} has unknown platform {}", id, platform_str))?;
            let diff_json: String = row.get("diff_json");
            let changes: ChangeSet = serde_json::from_str(&diff_json)
                .with_context(|| format!("change record {} has invalid diff_json", id))?;
            Ok(StoredChangeRecord {
                id: ChangeRecordId(id),
                record: ChangeRecord {
                    platform,
                    document_id: row.get("document_id"),
                    editor: row.get("editor"),
                    timestamp: row.try_get("timestamp")?,
                    changes,
                },
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

pub async fn count_change_records(pool: &Pool, platform: Platform, document_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM diff_history WHERE platform = ? AND document_id = ?",
    )
    .bind(platform.as_str())
    .bind(document_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
    }

    fn block(id: &str, text: &str, minute: u32) -> NotionBlock {
        NotionBlock {
            page_id: "page-1".into(),
            block_id: id.into(),
            block_type: "paragraph".into(),
            plain_text: text.into(),
            last_edited_time: t(minute),
            last_edited_by: Some("user-1".into()),
            parent_block_id: None,
        }
    }

    #[test]
    fn prepare_sqlite_url_keeps_memory_and_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn notion_put_keeps_one_current_row_and_history() {
        let pool = setup_pool().await;

        let mut tx = pool.begin().await.unwrap();
        put_notion_block_tx(&mut tx, &block("b1", "v1", 1), t(2)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        put_notion_block_tx(&mut tx, &block("b1", "v2", 3), t(4)).await.unwrap();
        tx.commit().await.unwrap();

        let current = current_notion_blocks(&pool, "page-1").await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].plain_text, "v2");
        assert_eq!(current[0].last_edited_time, t(3));

        let history = notion_block_history(&pool, "page-1", "b1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_current);
        assert!(history[1].is_current);
        assert_eq!(history[0].block.plain_text, "v1");
    }

    #[tokio::test]
    async fn retire_hides_block_from_current_set() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        put_notion_block_tx(&mut tx, &block("b1", "v1", 1), t(2)).await.unwrap();
        assert_eq!(retire_notion_block_tx(&mut tx, "page-1", "b1").await.unwrap(), 1);
        assert_eq!(retire_notion_block_tx(&mut tx, "page-1", "b1").await.unwrap(), 0);
        tx.commit().await.unwrap();

        assert!(current_notion_blocks(&pool, "page-1").await.unwrap().is_empty());
        assert_eq!(notion_block_history(&pool, "page-1", "b1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drive_snapshot_upsert_is_unique_per_revision() {
        let pool = setup_pool().await;
        let mut rev = DriveRevision {
            document_id: "doc".into(),
            revision_id: "r1".into(),
            plain_text: "first".into(),
            editor_email: Some("a@example.com".into()),
            modified_time: t(1),
        };
        let mut tx = pool.begin().await.unwrap();
        put_drive_snapshot_tx(&mut tx, &rev, t(2)).await.unwrap();
        rev.plain_text = "first, refetched".into();
        put_drive_snapshot_tx(&mut tx, &rev, t(3)).await.unwrap();
        tx.commit().await.unwrap();

        let all = list_drive_snapshots(&pool, "doc").await.unwrap();
        assert_eq!(all.len(), 1);
        let got = get_drive_snapshot(&pool, "doc", "r1").await.unwrap().unwrap();
        assert_eq!(got, rev);
        assert!(get_drive_snapshot(&pool, "doc", "r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drive_cursor_compare_and_swap() {
        let pool = setup_pool().await;
        touch_drive_tracking(&pool, "doc", t(0)).await.unwrap();
        let tracking = get_drive_tracking(&pool, "doc").await.unwrap().unwrap();
        assert_eq!(tracking.last_processed_revision_id, None);
        assert_eq!(tracking.last_check_time, t(0));

        let mut tx = pool.begin().await.unwrap();
        assert!(advance_drive_cursor_tx(&mut tx, "doc", None, "r1", Some("Doc"), t(1))
            .await
            .unwrap());
        // Stale expectation loses.
        assert!(!advance_drive_cursor_tx(&mut tx, "doc", None, "r2", None, t(2))
            .await
            .unwrap());
        assert!(advance_drive_cursor_tx(&mut tx, "doc", Some("r1"), "r2", None, t(3))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let tracking = get_drive_tracking(&pool, "doc").await.unwrap().unwrap();
        assert_eq!(tracking.last_processed_revision_id.as_deref(), Some("r2"));
        assert_eq!(tracking.document_title.as_deref(), Some("Doc"));

        touch_drive_tracking(&pool, "doc", t(9)).await.unwrap();
        let tracking = get_drive_tracking(&pool, "doc").await.unwrap().unwrap();
        assert_eq!(tracking.last_processed_revision_id.as_deref(), Some("r2"));
        assert_eq!(tracking.last_check_time, t(9));
    }

    #[tokio::test]
    async fn notion_cursor_compare_and_swap() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        assert!(advance_notion_cursor_tx(&mut tx, "page-1", None, Some(t(5)), Some("Page"), t(6))
            .await
            .unwrap());
        assert!(!advance_notion_cursor_tx(&mut tx, "page-1", Some(t(4)), Some(t(7)), None, t(7))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let tracking = get_notion_tracking(&pool, "page-1").await.unwrap().unwrap();
        assert_eq!(tracking.last_edited_time, Some(t(5)));
        assert_eq!(tracking.last_snapshot_time, Some(t(6)));
        assert_eq!(tracking.page_title.as_deref(), Some("Page"));
    }

    #[tokio::test]
    async fn change_history_is_append_only() {
        let pool = setup_pool().await;
        let record = ChangeRecord {
            platform: Platform::Notion,
            document_id: "page-1".into(),
            editor: "user-1".into(),
            timestamp: t(1),
            changes: ChangeSet {
                added: vec!["hello".into()],
                deleted: vec![],
            },
        };
        let mut tx = pool.begin().await.unwrap();
        let id = insert_change_record_tx(&mut tx, &record).await.unwrap();
        tx.commit().await.unwrap();

        let listed = list_change_records(&pool, &ChangeRecordFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].record, record);

        let update = sqlx::query("UPDATE diff_history SET editor = 'x'")
            .execute(&pool)
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM diff_history").execute(&pool).await;
        assert!(delete.is_err());
        assert_eq!(count_change_records(&pool, Platform::Notion, "page-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_change_records_filters() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        for (platform, doc) in [
            (Platform::Notion, "p1"),
            (Platform::GoogleDrive, "d1"),
            (Platform::Notion, "p2"),
        ] {
            let record = ChangeRecord {
                platform,
                document_id: doc.into(),
                editor: "e".into(),
                timestamp: t(1),
                changes: ChangeSet::default(),
            };
            insert_change_record_tx(&mut tx, &record).await.unwrap();
        }
        tx.commit().await.unwrap();

        let notion = list_change_records(
            &pool,
            &ChangeRecordFilter {
                platform: Some(Platform::Notion),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(notion.len(), 2);

        let after_first = list_change_records(
            &pool,
            &ChangeRecordFilter {
                since_id: Some(notion[0].id.0),
                document_id: Some("p2".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].record.document_id, "p2");
    }
}

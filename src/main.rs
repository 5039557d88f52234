use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use revtrack::config;
use revtrack::db;
use revtrack::drive::DriveClient;
use revtrack::error::SyncError;
use revtrack::model::Platform;
use revtrack::notion::NotionClient;
use revtrack::sync::{SyncReport, Syncer};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sync every target once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let drive = Arc::new(DriveClient::new(cfg.drive.access_token.clone()));
    let notion = Arc::new(NotionClient::new(
        cfg.notion.token.clone(),
        cfg.notion.version.clone(),
    ));
    let syncer = Syncer::new(pool, drive, notion, cfg.diff_options());
    let targets = cfg.targets();

    if args.once {
        let results = syncer.sync_all(&targets).await;
        let mut failed = 0;
        for ((platform, id), result) in targets.iter().zip(&results) {
            log_result(*platform, id, result);
            failed += usize::from(result.is_err());
        }
        info!(targets = targets.len(), failed, "single pass finished");
        return Ok(());
    }

    let interval = Duration::from_millis(cfg.app.poll_interval_ms);
    let mut workers = Vec::with_capacity(targets.len());
    for (platform, id) in targets {
        let syncer = syncer.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let result = syncer.sync(platform, &id).await;
                log_result(platform, &id, &result);
                tokio::time::sleep(interval).await;
            }
        }));
    }
    info!(workers = workers.len(), "revision tracker started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    // An aborted pass drops its open transaction, which rolls back.
    for worker in workers {
        worker.abort();
    }
    Ok(())
}

fn log_result(platform: Platform, id: &str, result: &Result<SyncReport, SyncError>) {
    match result {
        Ok(report) => {
            for skipped in &report.skipped {
                warn!(
                    %platform,
                    document_id = id,
                    unit_id = ?skipped.unit_id,
                    error = %skipped.error,
                    "unit skipped"
                );
            }
            if report.record_ids.is_empty() {
                debug!(%platform, document_id = id, outcome = ?report.outcome, "no new changes");
            } else {
                info!(
                    %platform,
                    document_id = id,
                    sync_id = %report.sync_id,
                    records = report.record_ids.len(),
                    "changes recorded"
                );
            }
        }
        Err(err) => {
            error!(
                %platform,
                document_id = id,
                retryable = err.is_retryable(),
                "sync failed: {}",
                err
            );
        }
    }
}

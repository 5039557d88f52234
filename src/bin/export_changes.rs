use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use revtrack::config;
use revtrack::db::{self, ChangeRecordFilter};
use revtrack::model::Platform;

#[derive(Debug, Parser)]
#[command(about = "Print recorded changes as JSON lines, oldest first.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only this platform (`google_drive`/`drive` or `notion`)
    #[arg(long)]
    platform: Option<String>,

    /// Only this document or page id
    #[arg(long)]
    document: Option<String>,

    /// Only records with an id greater than this
    #[arg(long)]
    since_id: Option<i64>,

    /// Include the row id and insertion time in each line
    #[arg(long)]
    with_ids: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let platform = args
        .platform
        .as_deref()
        .map(|p| Platform::parse(p).ok_or_else(|| anyhow!("unknown platform '{}'", p)))
        .transpose()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let filter = ChangeRecordFilter {
        platform,
        document_id: args.document,
        since_id: args.since_id,
        limit: None,
    };
    let rows = db::list_change_records(&pool, &filter).await?;

    let mut out = BufWriter::new(io::stdout().lock());
    for row in &rows {
        let line = if args.with_ids {
            serde_json::to_string(row)?
        } else {
            serde_json::to_string(&row.record)?
        };
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use revtrack::config::Config;
use revtrack::model::NotionBlock;
use revtrack::notion::{NotionClient, NotionService};
use revtrack::text;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Page ID to inspect
    #[arg(long)]
    page_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config)?;
    let cfg: Config = serde_yaml::from_str(&raw)?;
    let client = NotionClient::new(cfg.notion.token.clone(), cfg.notion.version.clone());

    let title = client.page_title(&args.page_id).await?;
    let fetch = client.list_blocks_recursive(&args.page_id).await?;
    let blocks = fetch.blocks;

    println!("Page ID: {}", args.page_id);
    println!("Title: {}", title.as_deref().unwrap_or("(untitled)"));
    println!("Blocks: {}", blocks.len());

    let mut depth: HashMap<&str, usize> = HashMap::new();
    for block in &blocks {
        let level = block
            .parent_block_id
            .as_deref()
            .and_then(|p| depth.get(p))
            .map_or(0, |d| d + 1);
        depth.insert(block.block_id.as_str(), level);
        println!("{}{}", "  ".repeat(level + 1), describe(block));
    }
    for failure in &fetch.failures {
        println!(
            "Unreadable block {}: {}",
            failure.block_id.as_deref().unwrap_or("(no id)"),
            failure.reason
        );
    }
    Ok(())
}

fn describe(block: &NotionBlock) -> String {
    let text = text::normalize(&block.plain_text).replace('\n', " / ");
    format!(
        "[{}] {} @ {} -> {:?}",
        block.block_type,
        block.block_id,
        block.last_edited_time.to_rfc3339(),
        text
    )
}

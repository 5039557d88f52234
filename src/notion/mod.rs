use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::model::NotionBlock;
use crate::notion::model::{ListBlockChildrenResp, RetrievePageResp};

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";
const PAGE_SIZE: &str = "100";
const MAX_DEPTH: usize = 32;

/// Block types that are separate pages; their own content is tracked on
/// their own, so the walk does not descend into them.
const CHILD_PAGE_TYPES: &[&str] = &["child_page", "child_database"];

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// A block that came back from Notion but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    /// Absent when the raw object did not even carry an id.
    pub block_id: Option<String>,
    pub reason: String,
}

/// Result of walking a page: the parsed blocks plus the ones left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFetch {
    pub blocks: Vec<NotionBlock>,
    pub failures: Vec<BlockFailure>,
}

impl BlockFetch {
    pub fn from_blocks(blocks: Vec<NotionBlock>) -> Self {
        Self {
            blocks,
            failures: Vec::new(),
        }
    }
}

/// Block-level read access to Notion pages.
#[async_trait]
pub trait NotionService: Send + Sync {
    /// Every block under `page_id`, depth first in page order, with raw
    /// plain text extracted. Malformed blocks are reported in
    /// `BlockFetch::failures` instead of failing the page.
    async fn list_blocks_recursive(&self, page_id: &str) -> Result<BlockFetch>;

    async fn page_title(&self, page_id: &str) -> Result<Option<String>>;
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Self {
        let base_url = Url::parse(NOTION_API_BASE).expect("valid default Notion URL");
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent(concat!("revtrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            version,
        }
    }

    pub fn build_get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid Notion base URL")?;
        self.http
            .get(endpoint)
            .query(query)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
            .build()
            .context("failed to build Notion request")
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        debug!(url = %request.url(), "notion request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Notion")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Notion: {}", body);
            return Err(anyhow!("received 429 from Notion: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Notion API error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("notion error {}: {}", status, body));
        }

        let body = res.text().await.context("failed to read Notion response")?;
        serde_json::from_str(&body).context("invalid Notion response JSON")
    }

    /// All direct children of `container_id`, following pagination.
    pub async fn list_children(&self, container_id: &str) -> Result<Vec<Value>> {
        let path = format!("v1/blocks/{}/children", container_id);
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("page_size", PAGE_SIZE)];
            if let Some(c) = cursor.as_deref() {
                query.push(("start_cursor", c));
            }
            let request = self.build_get(&path, &query)?;
            let page: ListBlockChildrenResp = self
                .execute_json(request)
                .await
                .with_context(|| format!("failed to list children of {}", container_id))?;
            out.extend(page.results);
            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }

    fn collect_blocks<'a>(
        &'a self,
        page_id: &'a str,
        container_id: &'a str,
        parent_block_id: Option<&'a str>,
        depth: usize,
        out: &'a mut BlockFetch,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth > MAX_DEPTH {
                return Err(anyhow!(
                    "block nesting under {} exceeds {} levels",
                    page_id,
                    MAX_DEPTH
                ));
            }
            for raw in self.list_children(container_id).await? {
                if let Some(block_id) = absorb_block(page_id, parent_block_id, &raw, out) {
                    self.collect_blocks(page_id, &block_id, Some(&block_id), depth + 1, out)
                        .await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    pub async fn retrieve_page(&self, page_id: &str) -> Result<RetrievePageResp> {
        let request = self.build_get(&format!("v1/pages/{}", page_id), &[])?;
        self.execute_json(request)
            .await
            .with_context(|| format!("failed to retrieve page {}", page_id))
    }
}

#[async_trait]
impl NotionService for NotionClient {
    async fn list_blocks_recursive(&self, page_id: &str) -> Result<BlockFetch> {
        let mut out = BlockFetch::default();
        self.collect_blocks(page_id, page_id, None, 0, &mut out)
            .await?;
        debug!(
            page_id,
            blocks = out.blocks.len(),
            failures = out.failures.len(),
            "fetched notion blocks"
        );
        Ok(out)
    }

    async fn page_title(&self, page_id: &str) -> Result<Option<String>> {
        let page = self.retrieve_page(page_id).await?;
        Ok(page_title_from_properties(&page))
    }
}

/// Parse one raw child into `out`, recording a failure if it is malformed.
/// Returns the id of the block to descend into, if any. Children of a
/// malformed block are still walked when its id is known.
fn absorb_block(
    page_id: &str,
    parent_block_id: Option<&str>,
    raw: &Value,
    out: &mut BlockFetch,
) -> Option<String> {
    let has_children = raw["has_children"].as_bool().unwrap_or(false);
    let block_type = raw["type"].as_str().unwrap_or_default();
    let descend = has_children && !CHILD_PAGE_TYPES.contains(&block_type);
    match parse_block(page_id, parent_block_id, raw) {
        Ok((block, _)) => {
            let block_id = block.block_id.clone();
            out.blocks.push(block);
            descend.then_some(block_id)
        }
        Err(err) => {
            let block_id = raw["id"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            warn!(page_id, block_id = ?block_id, error = %err, "skipping malformed block");
            out.failures.push(BlockFailure {
                block_id: block_id.clone(),
                reason: format!("{:#}", err),
            });
            block_id.filter(|_| descend)
        }
    }
}

/// Turn one raw block object into a `NotionBlock`. Also returns the block's
/// `has_children` flag.
pub fn parse_block(
    page_id: &str,
    parent_block_id: Option<&str>,
    raw: &Value,
) -> Result<(NotionBlock, bool)> {
    let block_id = raw["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("block without id under page {}", page_id))?;
    let block_type = raw["type"]
        .as_str()
        .ok_or_else(|| anyhow!("block {} has no type", block_id))?;
    let edited = raw["last_edited_time"]
        .as_str()
        .ok_or_else(|| anyhow!("block {} has no last_edited_time", block_id))?;
    let last_edited_time = DateTime::parse_from_rfc3339(edited)
        .with_context(|| format!("block {} has invalid last_edited_time {}", block_id, edited))?
        .with_timezone(&Utc);

    let block = NotionBlock {
        page_id: page_id.to_string(),
        block_id: block_id.to_string(),
        block_type: block_type.to_string(),
        plain_text: block_plain_text(block_type, &raw[block_type]),
        last_edited_time,
        last_edited_by: raw["last_edited_by"]["id"].as_str().map(str::to_string),
        parent_block_id: parent_block_id.map(str::to_string),
    };
    Ok((block, raw["has_children"].as_bool().unwrap_or(false)))
}

/// Literal text of a block payload. Annotations, colors and links are dropped.
pub fn block_plain_text(block_type: &str, data: &Value) -> String {
    match block_type {
        "child_page" | "child_database" => data["title"].as_str().unwrap_or_default().to_string(),
        "equation" => data["expression"].as_str().unwrap_or_default().to_string(),
        "table_row" => data["cells"]
            .as_array()
            .map(|cells| {
                cells
                    .iter()
                    .map(rich_text_plain)
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .unwrap_or_default(),
        _ if data.get("rich_text").is_some() => rich_text_plain(&data["rich_text"]),
        _ if data.get("caption").is_some() => rich_text_plain(&data["caption"]),
        _ => String::new(),
    }
}

fn rich_text_plain(items: &Value) -> String {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["plain_text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn page_title_from_properties(page: &RetrievePageResp) -> Option<String> {
    page.properties
        .values()
        .find(|prop| prop["type"] == "title")
        .map(|prop| rich_text_plain(&prop["title"]))
        .filter(|title| !title.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_paragraph_block_drops_annotations() {
        let raw = json!({
            "object": "block",
            "id": "b1",
            "type": "paragraph",
            "has_children": true,
            "last_edited_time": "2024-01-02T03:04:00.000Z",
            "last_edited_by": { "object": "user", "id": "u1" },
            "paragraph": {
                "rich_text": [
                    { "plain_text": "Hello ", "annotations": { "bold": true } },
                    { "plain_text": "world", "href": "https://example.com" }
                ],
                "color": "default"
            }
        });
        let (block, has_children) = parse_block("page", Some("parent"), &raw).unwrap();
        assert!(has_children);
        assert_eq!(block.block_id, "b1");
        assert_eq!(block.block_type, "paragraph");
        assert_eq!(block.plain_text, "Hello world");
        assert_eq!(block.last_edited_by.as_deref(), Some("u1"));
        assert_eq!(block.parent_block_id.as_deref(), Some("parent"));
        assert_eq!(
            block.last_edited_time,
            DateTime::parse_from_rfc3339("2024-01-02T03:04:00Z").unwrap()
        );
    }

    #[test]
    fn parse_block_rejects_missing_fields() {
        let raw = json!({ "id": "b1", "type": "paragraph" });
        assert!(parse_block("page", None, &raw).is_err());
        let raw = json!({ "type": "paragraph", "last_edited_time": "2024-01-02T03:04:00.000Z" });
        assert!(parse_block("page", None, &raw).is_err());
    }

    #[test]
    fn malformed_block_is_isolated_from_its_siblings() {
        let mut out = BlockFetch::default();
        let good = json!({
            "id": "good",
            "type": "paragraph",
            "has_children": false,
            "last_edited_time": "2024-01-02T03:04:00.000Z",
            "paragraph": { "rich_text": [{ "plain_text": "fine" }] }
        });
        let bad = json!({
            "id": "bad",
            "type": "toggle",
            "has_children": true,
            "toggle": { "rich_text": [] }
        });
        let anonymous = json!({ "type": "paragraph" });

        assert_eq!(absorb_block("page", None, &good, &mut out), None);
        // Children of a broken block are still walked.
        assert_eq!(absorb_block("page", None, &bad, &mut out).as_deref(), Some("bad"));
        assert_eq!(absorb_block("page", None, &anonymous, &mut out), None);

        assert_eq!(out.blocks.len(), 1);
        assert_eq!(out.blocks[0].block_id, "good");
        assert_eq!(out.failures.len(), 2);
        assert_eq!(out.failures[0].block_id.as_deref(), Some("bad"));
        assert!(out.failures[0].reason.contains("last_edited_time"));
        assert_eq!(out.failures[1].block_id, None);
    }

    #[test]
    fn plain_text_for_special_block_types() {
        assert_eq!(
            block_plain_text("child_page", &json!({ "title": "Sub page" })),
            "Sub page"
        );
        assert_eq!(
            block_plain_text("equation", &json!({ "expression": "e=mc^2" })),
            "e=mc^2"
        );
        assert_eq!(
            block_plain_text(
                "table_row",
                &json!({ "cells": [[{ "plain_text": "a" }], [{ "plain_text": "b" }, { "plain_text": "c" }]] })
            ),
            "a | bc"
        );
        assert_eq!(
            block_plain_text("image", &json!({ "caption": [{ "plain_text": "diagram" }] })),
            "diagram"
        );
        assert_eq!(block_plain_text("divider", &json!({})), "");
    }

    #[test]
    fn page_title_found_by_property_type() {
        let page: RetrievePageResp = serde_json::from_value(json!({
            "id": "p1",
            "properties": {
                "Tags": { "type": "multi_select", "multi_select": [] },
                "Name": { "type": "title", "title": [{ "plain_text": "Roadmap" }] }
            }
        }))
        .unwrap();
        assert_eq!(page_title_from_properties(&page).as_deref(), Some("Roadmap"));
    }

    #[test]
    fn build_get_sets_headers_and_query() {
        let client = NotionClient::new("token".into(), "2022-06-28".into());
        let request = client
            .build_get("v1/blocks/abc/children", &[("page_size", "100")])
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/v1/blocks/abc/children");
        assert_eq!(request.url().query(), Some("page_size=100"));
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Notion-Version")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "2022-06-28"
        );
    }
}

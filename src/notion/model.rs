use serde::Deserialize;
use serde_json::Value;

/// One page of `GET /v1/blocks/{id}/children`. Blocks stay as raw JSON
/// because their payload shape depends on the block type.
#[derive(Deserialize, Debug)]
pub struct ListBlockChildrenResp {
    pub results: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RetrievePageResp {
    pub id: String,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, Value>,
}

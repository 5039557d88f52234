//! Google Drive revision access (Drive v3 REST).
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3/";
const REVISION_FIELDS: &str =
    "nextPageToken,revisions(id,modifiedTime,lastModifyingUser(emailAddress))";
const PLAIN_TEXT_MIME: &str = "text/plain";

/// Revision descriptor as listed by Drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMeta {
    pub revision_id: String,
    pub modified_time: DateTime<Utc>,
    pub editor_email: Option<String>,
}

#[async_trait]
pub trait DriveService: Send + Sync {
    /// Revisions of a document, oldest first.
    async fn list_revisions(&self, document_id: &str) -> Result<Vec<RevisionMeta>>;

    async fn get_revision_text(&self, document_id: &str, revision_id: &str) -> Result<String>;

    async fn document_title(&self, document_id: &str) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RevisionListResp {
    #[serde(default)]
    revisions: Vec<RevisionResp>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RevisionResp {
    id: String,
    modified_time: DateTime<Utc>,
    last_modifying_user: Option<UserResp>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UserResp {
    email_address: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RevisionExportResp {
    #[serde(default)]
    export_links: HashMap<String, String>,
}

#[derive(Deserialize, Debug)]
struct FileResp {
    name: Option<String>,
}

impl From<RevisionResp> for RevisionMeta {
    fn from(r: RevisionResp) -> Self {
        let editor_email = r.last_modifying_user.and_then(|u| u.email_address);
        RevisionMeta {
            revision_id: r.id,
            modified_time: r.modified_time,
            editor_email,
        }
    }
}

impl DriveClient {
    pub fn new(access_token: String) -> Self {
        let base_url = Url::parse(DRIVE_API_BASE).expect("valid default Drive URL");
        Self::with_base_url(access_token, base_url)
    }

    pub fn with_base_url(access_token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent(concat!("revtrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_token,
        }
    }

    pub fn build_get(&self, url: Url, query: &[(&str, &str)]) -> Result<reqwest::Request> {
        self.http
            .get(url)
            .query(query)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .build()
            .context("failed to build Drive request")
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("invalid Drive base URL")
    }

    async fn execute_text(&self, request: reqwest::Request) -> Result<String> {
        debug!(url = %request.url(), "drive request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Drive")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Drive: {}", body);
            return Err(anyhow!("received 429 from Drive: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Drive API error - Status: {}, Body: {}", status, body);
            return Err(anyhow!("drive error {}: {}", status, body));
        }
        res.text().await.context("failed to read Drive response")
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let body = self.execute_text(request).await?;
        serde_json::from_str(&body).context("invalid Drive response JSON")
    }
}

#[async_trait]
impl DriveService for DriveClient {
    async fn list_revisions(&self, document_id: &str) -> Result<Vec<RevisionMeta>> {
        let url = self.endpoint(&format!("files/{}/revisions", document_id))?;
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("fields", REVISION_FIELDS), ("pageSize", "200")];
            if let Some(t) = page_token.as_deref() {
                query.push(("pageToken", t));
            }
            let request = self.build_get(url.clone(), &query)?;
            let page: RevisionListResp = self
                .execute_json(request)
                .await
                .with_context(|| format!("failed to list revisions of {}", document_id))?;
            out.extend(page.revisions.into_iter().map(RevisionMeta::from));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    async fn get_revision_text(&self, document_id: &str, revision_id: &str) -> Result<String> {
        let url = self.endpoint(&format!("files/{}/revisions/{}", document_id, revision_id))?;
        let meta: RevisionExportResp = self
            .execute_json(self.build_get(url.clone(), &[("fields", "exportLinks")])?)
            .await
            .with_context(|| format!("failed to read revision {} of {}", revision_id, document_id))?;

        // Google Docs expose an export link; other files are downloaded as-is.
        let request = match meta.export_links.get(PLAIN_TEXT_MIME) {
            Some(link) => {
                let link = Url::parse(link).context("invalid Drive export link")?;
                self.build_get(link, &[])?
            }
            None => self.build_get(url, &[("alt", "media")])?,
        };
        self.execute_text(request)
            .await
            .with_context(|| format!("failed to export revision {} of {}", revision_id, document_id))
    }

    async fn document_title(&self, document_id: &str) -> Result<Option<String>> {
        let url = self.endpoint(&format!("files/{}", document_id))?;
        let file: FileResp = self
            .execute_json(self.build_get(url, &[("fields", "name")])?)
            .await?;
        Ok(file.name)
    }
}

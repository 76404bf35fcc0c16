//! Confluence REST client.
//!
//! Reports are produced by copying a template page and replacing its
//! `$$name$$` placeholders one at a time. Each replacement is a
//! read-modify-write of the whole page body, so concurrent writers collide
//! on the page version; those conflicts are retried with a fixed delay.

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use loadscribe_core::config::WikiConfig;
use loadscribe_core::markup::{replace_placeholder, MarkupError};

use crate::http::{self, StatusError};
use crate::providers::ApiCredential;

/// Stale-version retries unless configured otherwise.
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 3;

/// Errors from the wiki backend.
#[derive(Error, Debug)]
pub enum WikiError {
    #[error("Confluence request failed: {0}")]
    Http(String),

    #[error(transparent)]
    Status(StatusError),

    #[error("Page {page_id} changed while it was being updated")]
    StaleVersion { page_id: String },

    #[error("Placeholder '{placeholder}' not found on page {page_id}")]
    PlaceholderNotFound {
        page_id: String,
        placeholder: String,
    },

    #[error("Invalid Confluence response: {0}")]
    InvalidResponse(String),

    #[error("Wiki not configured: {0}")]
    NotConfigured(String),
}

impl WikiError {
    pub fn is_stale(&self) -> bool {
        matches!(self, WikiError::StaleVersion { .. })
    }

    fn from_status(err: StatusError, page_id: &str) -> Self {
        if err.status == 409 || err.snippet.to_lowercase().contains("stale data") {
            WikiError::StaleVersion {
                page_id: page_id.to_string(),
            }
        } else {
            WikiError::Status(err)
        }
    }
}

impl From<reqwest::Error> for WikiError {
    fn from(err: reqwest::Error) -> Self {
        WikiError::Http(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpaceRef {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageBody {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageBody {
    #[serde(default)]
    pub storage: StorageBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageVersion {
    #[serde(default)]
    pub number: u64,
}

/// A page as returned with `expand=body.storage,version,space`.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub space: Option<SpaceRef>,

    #[serde(default)]
    pub body: PageBody,

    #[serde(default)]
    pub version: PageVersion,
}

impl Page {
    pub fn storage(&self) -> &str {
        &self.body.storage.value
    }

    pub fn space_key(&self) -> Option<&str> {
        self.space.as_ref().map(|s| s.key.as_str()).filter(|k| !k.is_empty())
    }
}

/// Title of a report page copied from `template_title` at `at`.
pub fn report_title(template_title: &str, at: DateTime<FixedOffset>) -> String {
    format!("{} - report {}", template_title, at.format("%Y-%m-%d %H:%M"))
}

/// Basic-auth client for the Confluence content API.
#[derive(Debug)]
pub struct ConfluenceClient {
    base_url: String,
    username: String,
    password: ApiCredential,
    client: reqwest::Client,
    update_attempts: u32,
    retry_delay: Duration,
}

impl ConfluenceClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: ApiCredential,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password,
            client,
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &WikiConfig, client: reqwest::Client) -> Result<Self, WikiError> {
        if config.url.is_empty() {
            return Err(WikiError::NotConfigured("wiki.url is empty".to_string()));
        }
        let password = ApiCredential::from_config_secret(&config.password, "Confluence password");
        Ok(Self::new(&config.url, &config.username, password, client))
    }

    /// Attempts and delay for placeholder updates that hit a stale version.
    pub fn with_stale_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.update_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    fn content_url(&self, suffix: &str) -> String {
        format!("{}/rest/api/content{}", self.base_url, suffix)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose()))
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        page_id: &str,
    ) -> Result<Page, WikiError> {
        let response = request.send().await?;
        let response = http::check_status(response, "confluence")
            .await
            .map_err(|e| WikiError::from_status(e, page_id))?;
        response
            .json::<Page>()
            .await
            .map_err(|e| WikiError::InvalidResponse(e.to_string()))
    }

    pub async fn get_page(&self, page_id: &str) -> Result<Page, WikiError> {
        let url = self.content_url(&format!("/{}", page_id));
        let request = self
            .get(&url)
            .query(&[("expand", "body.storage,version,space")]);
        self.send_json(request, page_id).await
    }

    /// Replace the body of `page`, bumping its version as a minor edit.
    pub async fn update_page(&self, page: &Page, body: &str) -> Result<Page, WikiError> {
        let mut payload = json!({
            "id": page.id,
            "type": "page",
            "title": page.title,
            "body": {"storage": {"value": body, "representation": "storage"}},
            "version": {"number": page.version.number + 1, "minorEdit": true},
        });
        if let Some(key) = page.space_key() {
            payload["space"] = json!({"key": key});
        }

        let url = self.content_url(&format!("/{}", page.id));
        let request = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(self.password.expose()))
            .json(&payload);

        let updated = self.send_json(request, &page.id).await?;
        debug!(page_id = %page.id, version = updated.version.number, "Page updated");
        Ok(updated)
    }

    pub async fn create_page(
        &self,
        space_key: &str,
        title: &str,
        body: &str,
        parent_id: &str,
    ) -> Result<Page, WikiError> {
        let payload = json!({
            "type": "page",
            "title": title,
            "space": {"key": space_key},
            "ancestors": [{"id": parent_id}],
            "body": {"storage": {"value": body, "representation": "storage"}},
        });

        let request = self
            .client
            .post(self.content_url(""))
            .basic_auth(&self.username, Some(self.password.expose()))
            .json(&payload);

        let page = self.send_json(request, parent_id).await?;
        info!(page_id = %page.id, title, parent_id, "Page created");
        Ok(page)
    }

    /// Attach a file to a page.
    pub async fn upload_attachment(
        &self,
        page_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<(), WikiError> {
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = self.content_url(&format!("/{}/child/attachment", page_id));
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(self.password.expose()))
            .header("X-Atlassian-Token", "nocheck")
            .multipart(form)
            .send()
            .await?;
        http::check_status(response, "confluence")
            .await
            .map_err(WikiError::Status)?;

        debug!(page_id, filename, size, "Attachment uploaded");
        Ok(())
    }

    /// Copy a template page under `parent_id`, stamping the title with the
    /// current time in `offset`.
    pub async fn copy_page(
        &self,
        template_id: &str,
        parent_id: &str,
        offset: &FixedOffset,
    ) -> Result<Page, WikiError> {
        let template = self.get_page(template_id).await?;
        let space_key = template.space_key().ok_or_else(|| {
            WikiError::InvalidResponse(format!("template page {} has no space", template_id))
        })?;

        let title = report_title(&template.title, Utc::now().with_timezone(offset));
        self.create_page(space_key, &title, template.storage(), parent_id)
            .await
    }

    /// Fetch, substitute `$$name$$` and write back, once.
    async fn replace_once(
        &self,
        page_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Page, WikiError> {
        let page = self.get_page(page_id).await?;
        let body = replace_placeholder(page.storage(), name, content).map_err(
            |MarkupError::PlaceholderNotFound(placeholder)| WikiError::PlaceholderNotFound {
                page_id: page_id.to_string(),
                placeholder,
            },
        )?;
        self.update_page(&page, &body).await
    }

    /// Replace one placeholder, retrying when the page version went stale.
    pub async fn update_placeholder(
        &self,
        page_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Page, WikiError> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.retry_delay)
            .with_max_times(self.update_attempts.saturating_sub(1) as usize);

        let page = (|| self.replace_once(page_id, name, content))
            .retry(backoff)
            .when(WikiError::is_stale)
            .notify(|e: &WikiError, delay: Duration| {
                warn!(
                    page_id,
                    placeholder = name,
                    error = %e,
                    retry_in = %humantime::format_duration(delay),
                    "Stale page version, retrying"
                );
            })
            .await?;

        info!(page_id, placeholder = name, "Placeholder replaced");
        Ok(page)
    }
}

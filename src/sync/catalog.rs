//! Source catalog and payload fetching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::core::task::TaskError;

/// A published resource the catalog advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub url: String,
    /// Original file name, e.g. `valeursfoncieres-2024.txt.zip`.
    pub filename: String,
}

impl SourceItem {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
        }
    }

    /// Build an item whose file name is the last path segment of its URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self { url, filename }
    }
}

/// Which catalog resources to sync, matched against the resource URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    /// Required URL suffix, e.g. `.zip`.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Required URL substring, e.g. `valeursfoncieres`.
    #[serde(default)]
    pub keyword: Option<String>,
}

impl ResourceFilter {
    pub fn matches(&self, url: &str) -> bool {
        let suffix_ok = self.suffix.as_deref().is_none_or(|s| url.ends_with(s));
        let keyword_ok = self.keyword.as_deref().is_none_or(|k| url.contains(k));
        suffix_ok && keyword_ok
    }
}

/// Lists the items currently published at the source.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<SourceItem>, TaskError>;
}

/// Downloads the payload of one source item.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &SourceItem) -> Result<Vec<u8>, TaskError>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    resources: Vec<CatalogResource>,
}

#[derive(Debug, Deserialize)]
struct CatalogResource {
    url: String,
}

/// Catalog served as a JSON dataset document with a `resources` array.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    url: String,
    filter: ResourceFilter,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(url: impl Into<String>, filter: ResourceFilter) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            filter,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Select the matching resources of a catalog document.
    pub fn parse(body: &str, filter: &ResourceFilter) -> Result<Vec<SourceItem>, TaskError> {
        let doc: CatalogDocument = serde_json::from_str(body)
            .map_err(|e| TaskError::SourceUnavailable(format!("malformed catalog: {}", e)))?;
        Ok(doc
            .resources
            .into_iter()
            .filter(|r| filter.matches(&r.url))
            .map(|r| SourceItem::from_url(r.url))
            .collect())
    }
}

#[async_trait]
impl SourceCatalog for HttpCatalog {
    async fn list(&self) -> Result<Vec<SourceItem>, TaskError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TaskError::SourceUnavailable(format!("{}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(TaskError::SourceUnavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TaskError::SourceUnavailable(e.to_string()))?;
        let items = Self::parse(&body, &self.filter)?;
        debug!(catalog = %self.url, items = items.len(), "catalog listed");
        Ok(items)
    }
}

/// Fetches payloads over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, item: &SourceItem) -> Result<Vec<u8>, TaskError> {
        let response = self
            .client
            .get(&item.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TaskError::SourceUnavailable(format!("{}: {}", item.url, e)))?;

        if !response.status().is_success() {
            return Err(TaskError::SourceUnavailable(format!(
                "{} returned {}",
                item.url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TaskError::SourceUnavailable(format!("{}: {}", item.url, e)))?;
        Ok(bytes.to_vec())
    }
}

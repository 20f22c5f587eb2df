//! Helm chart repository downloader
//!
//! Reads the repository's `index.yaml`, picks the requested chart version and
//! downloads its first URL. Relative chart URLs resolve against the feed URI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion};
use url::Url;

use super::{DownloadRequest, PackageDownloader, Services, check_cache, exhausted, fetch_to_cache};
use crate::error::{FetchError, Result};
use crate::http::ensure_success;

const TGZ: &str = ".tgz";

/// Chart repository index
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default)]
    pub api_version: Option<String>,

    #[serde(default)]
    pub generated: Option<DateTime<Utc>>,

    /// Chart versions keyed by chart name
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

/// One chart version in the index
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    #[serde(default)]
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub app_version: Option<String>,

    /// Download URLs, absolute or relative to the repository
    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default)]
    pub digest: Option<String>,
}

impl ChartIndex {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FetchError::Serialization(format!("Invalid chart index: {}", e)))
    }

    /// Versions of a chart, matching the name case-insensitively
    pub fn get(&self, name: &str) -> Option<&[ChartEntry]> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, versions)| versions.as_slice())
    }

    /// The entry whose version matches exactly or semantically
    pub fn get_version(&self, name: &str, version: &PackageVersion) -> Option<&ChartEntry> {
        self.get(name)?.iter().find(|entry| {
            PackageVersion::parse(&entry.version, version.format())
                .is_ok_and(|v| version.matches(&v))
        })
    }
}

impl ChartEntry {
    pub fn download_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }
}

/// Index location for a feed URI
fn index_url(feed_uri: &str) -> String {
    if feed_uri.trim_end_matches('/').to_ascii_lowercase().ends_with(".yaml") {
        return feed_uri.to_string();
    }
    format!("{}/index.yaml", feed_uri.trim_end_matches('/'))
}

/// Absolute chart URL; relative ones are taken from the repository root
fn resolve_chart_url(feed_uri: &str, chart_url: &str) -> Result<String> {
    if let Ok(absolute) = Url::parse(chart_url) {
        return Ok(absolute.to_string());
    }

    let base = index_url(feed_uri);
    let base = Url::parse(&base).map_err(|e| FetchError::InvalidFeedUrl {
        url: feed_uri.to_string(),
        reason: e.to_string(),
    })?;
    Ok(base.join(chart_url)?.to_string())
}

pub struct HelmChartDownloader {
    services: Arc<Services>,
}

impl HelmChartDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn fetch_index(&self, request: &DownloadRequest, authorization: Option<&str>) -> Result<ChartIndex> {
        let url = index_url(&request.feed.feed_uri);
        tracing::debug!("Fetching chart index from {}", url);

        let http = &self.services.http;
        let url = url.as_str();
        let yaml = request
            .retry
            .execute_transient(move || async move {
                let mut req = http.get(url);
                if let Some(auth) = authorization {
                    req = req.header(reqwest::header::AUTHORIZATION, auth);
                }
                let response = ensure_success(req.send().await?, url).await?;
                Ok::<_, FetchError>(response.text().await?)
            })
            .await?;

        ChartIndex::from_yaml(&yaml)
    }
}

#[async_trait]
impl PackageDownloader for HelmChartDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &[TGZ]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading Helm chart {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let authorization = request.feed.credentials.basic_header();
        let authorization = authorization.as_deref();

        let index = self
            .fetch_index(request, authorization)
            .await
            .map_err(|e| exhausted(request, e))?;

        if index.get(&request.package_id).is_none() {
            return Err(FetchError::ResolutionFailed {
                message: format!(
                    "There was an error fetching the chart from the provided repository. The package id was not valid ({})",
                    request.package_id
                ),
            });
        }

        let chart_url = index
            .get_version(&request.package_id, &request.version)
            .and_then(ChartEntry::download_url)
            .ok_or_else(|| FetchError::ResolutionFailed {
                message: "Could not determine download url from chart repository. Please check associated index.yaml is correct.".to_string(),
            })?;

        let url = resolve_chart_url(&request.feed.feed_uri, chart_url)?;
        fetch_to_cache(&self.services, request, &url, authorization, TGZ)
            .await
            .map_err(|e| exhausted(request, e))
    }
}

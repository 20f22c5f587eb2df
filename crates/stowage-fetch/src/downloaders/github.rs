//! GitHub release archive downloader
//!
//! Package ids are `owner/repo`. Tags are paged through until one whose
//! name (minus a leading `v`) matches the requested version, then the tag's
//! zipball is downloaded and re-rooted so its files sit at the archive root.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion, archive};

use super::{DownloadRequest, PackageDownloader, Services, check_cache, exhausted};
use crate::error::{FetchError, Result};
use crate::http::{ensure_success, stream_to_file};

const ZIP: &str = ".zip";
const PAGE_SIZE: usize = 1000;
const MAX_PAGES: u32 = 100;
const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    zipball_url: Option<String>,
}

/// Version named by a tag, ignoring a leading `v` or `V`
fn tag_version(name: &str) -> Option<PackageVersion> {
    let trimmed = name.strip_prefix(['v', 'V']).unwrap_or(name);
    PackageVersion::semver(trimmed).ok()
}

fn split_package_id(package_id: &str) -> Result<(&str, &str)> {
    match package_id.split_once('/') {
        Some((owner, repo)) if !owner.trim().is_empty() && !repo.trim().is_empty() => Ok((owner, repo)),
        _ => Err(FetchError::InvalidPackageId {
            message: "Invalid PackageId for GitHub feed. Expecting format `<owner>/<repo>`".to_string(),
        }),
    }
}

/// Map a failed GitHub API response to an error, honouring rate limits
fn api_error(status: StatusCode, headers: &HeaderMap, url: &str) -> FetchError {
    match status {
        StatusCode::FORBIDDEN => {
            let remaining = headers.get("X-RateLimit-Remaining").and_then(|v| v.to_str().ok());
            if remaining == Some("0") {
                let seconds = headers
                    .get("X-RateLimit-Reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .map(|reset| reset - chrono::Utc::now().timestamp())
                    .unwrap_or(-1);
                return FetchError::RateLimited { seconds };
            }
            FetchError::HttpError {
                status: status.as_u16(),
                message: format!("Request to {} was forbidden", url),
            }
        }
        StatusCode::UNAUTHORIZED => FetchError::HttpError {
            status: status.as_u16(),
            message: "Failed to authenticate GitHub request".to_string(),
        },
        StatusCode::UNPROCESSABLE_ENTITY => FetchError::HttpError {
            status: status.as_u16(),
            message: "Error performing request".to_string(),
        },
        _ => FetchError::HttpError {
            status: status.as_u16(),
            message: format!(
                "Request to {} failed: {}",
                url,
                status.canonical_reason().unwrap_or("Unknown")
            ),
        },
    }
}

pub struct GitHubDownloader {
    services: Arc<Services>,
}

impl GitHubDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn get(&self, url: &str, authorization: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self
            .services
            .http
            .get(url)
            .header(USER_AGENT, &self.services.config.user_agent);
        if let Some(auth) = authorization {
            req = req.header(AUTHORIZATION, auth);
        }
        req
    }

    async fn tags_page(
        &self,
        request: &DownloadRequest,
        owner: &str,
        repo: &str,
        page: u32,
        authorization: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let url = format!(
            "{}/repos/{}/{}/tags?page={}&per_page={}",
            request.feed.base_uri(),
            owner,
            repo,
            page,
            PAGE_SIZE
        );
        let response = self
            .get(&url, authorization)
            .header(ACCEPT, GITHUB_ACCEPT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.headers(), &url));
        }
        Ok(response.json().await?)
    }

    /// Zipball URL of the first tag matching the requested version
    async fn find_zipball(&self, request: &DownloadRequest, authorization: Option<&str>) -> Result<String> {
        let (owner, repo) = split_package_id(&request.package_id)?;

        for page in 1..=MAX_PAGES {
            let tags = request
                .retry
                .execute_transient(|| self.tags_page(request, owner, repo, page, authorization))
                .await?;
            let count = tags.len();

            let found = tags.into_iter().find(|tag| {
                tag_version(&tag.name).is_some_and(|v| request.version.matches(&v))
            });
            if let Some(tag) = found {
                return tag.zipball_url.ok_or_else(|| FetchError::ResolutionFailed {
                    message: format!("Tag {} of {} has no archive", tag.name, request.package_id),
                });
            }

            if count < PAGE_SIZE {
                break;
            }
        }

        Err(FetchError::PackageNotFound {
            package_id: request.package_id.clone(),
            version: request.version.to_string(),
            feed: request.feed.feed_uri.clone(),
        })
    }

    async fn download_archive(
        &self,
        request: &DownloadRequest,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<PackagePhysicalFileMetadata> {
        let staging = self.services.cache.staging()?;
        let raw = staging.path().join("archive.zip");
        let denested = staging.path().join("denested.zip");

        let progress = &self.services.progress;
        let target = &raw;
        let label = request.package_id.as_str();
        request
            .retry
            .execute_transient(move || async move {
                let response = ensure_success(self.get(url, authorization).send().await?, url).await?;
                stream_to_file(response, target, label, progress).await
            })
            .await?;

        archive::denest_zip(&raw, &denested)?;
        self.services.cache.commit_and_hash(
            &request.feed.feed_id,
            &denested,
            &request.package_id,
            &request.version,
            ZIP,
        )
    }
}

#[async_trait]
impl PackageDownloader for GitHubDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &[ZIP]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading GitHub package {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let authorization = Some(request.feed.credentials.password())
            .filter(|p| !p.is_empty())
            .map(|p| format!("token {p}"));
        let authorization = authorization.as_deref();

        let url = self.find_zipball(request, authorization).await?;
        tracing::debug!("Downloading {} from {}", request.package_id, url);
        self.download_archive(request, &url, authorization)
            .await
            .map_err(|e| exhausted(request, e))
    }
}

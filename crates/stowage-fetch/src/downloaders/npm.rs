//! npm registry downloader

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;

use super::{DownloadRequest, PackageDownloader, Services, check_cache, exhausted, fetch_to_cache};
use crate::error::{FetchError, Result};

const TGZ: &str = ".tgz";

/// Registry path segment for a package id; scoped ids are encoded whole
fn encode_package_id(package_id: &str) -> String {
    url::form_urlencoded::byte_serialize(package_id.as_bytes()).collect()
}

/// `versions[<version>].dist.tarball` from a packument
fn tarball_url(packument: &Value, request: &DownloadRequest) -> Result<String> {
    let tarball = packument
        .get("versions")
        .and_then(|v| v.get(request.version.as_str()))
        .and_then(|v| v.get("dist"))
        .and_then(|d| d.get("tarball"))
        .ok_or_else(|| FetchError::ResolutionFailed {
            message: format!(
                "Unable to find tarball URL for NPM package {} version {} in metadata response",
                request.package_id, request.version
            ),
        })?;

    match tarball.as_str().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => Err(FetchError::ResolutionFailed {
            message: format!(
                "Tarball URL is empty for NPM package {} version {}",
                request.package_id, request.version
            ),
        }),
    }
}

pub struct NpmDownloader {
    services: Arc<Services>,
}

impl NpmDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn packument(&self, request: &DownloadRequest, authorization: Option<&str>) -> Result<Value> {
        let url = format!(
            "{}/{}",
            request.feed.base_uri(),
            encode_package_id(&request.package_id)
        );
        tracing::debug!("Fetching NPM package metadata from {}", url);

        let http = &self.services.http;
        let url = url.as_str();
        let body = request
            .retry
            .execute_transient(move || async move {
                let mut req = http.get(url).header(reqwest::header::ACCEPT, "application/json");
                if let Some(auth) = authorization {
                    req = req.header(reqwest::header::AUTHORIZATION, auth);
                }
                let response = req.send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::HttpError {
                        status: status.as_u16(),
                        message: format!(
                            "Failed to fetch NPM package metadata (Status Code {}). Reason: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown")
                        ),
                    });
                }
                Ok::<_, FetchError>(response.text().await?)
            })
            .await?;

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl PackageDownloader for NpmDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &[TGZ]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading NPM package {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let authorization = request.feed.credentials.bearer_or_basic_header();
        let authorization = authorization.as_deref();

        let packument = self
            .packument(request, authorization)
            .await
            .map_err(|e| exhausted(request, e))?;
        let url = tarball_url(&packument, request)?;
        tracing::debug!("Downloading NPM package from {}", url);

        fetch_to_cache(&self.services, request, &url, authorization, TGZ)
            .await
            .map_err(|e| exhausted(request, e))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{request, services};
    use super::*;
    use crate::credentials::FeedCredentials;
    use crate::feed::FeedType;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_encode_scoped_id() {
        assert_eq!(encode_package_id("@acme/widgets"), "%40acme%2Fwidgets");
        assert_eq!(encode_package_id("left-pad"), "left-pad");
    }

    #[tokio::test]
    async fn test_download_scoped_package_with_token() {
        let server = MockServer::start().await;
        let packument = serde_json::json!({
            "name": "@acme/widgets",
            "versions": {
                "1.4.0": {"dist": {"tarball": format!("{}/tarballs/widgets-1.4.0.tgz", server.uri())}}
            }
        });
        Mock::given(method("GET"))
            .and(path("/%40acme%2Fwidgets"))
            .and(header("authorization", "Bearer npm_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(packument))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tarballs/widgets-1.4.0.tgz"))
            .and(header("authorization", "Bearer npm_token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tarball".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NpmDownloader::new(Arc::new(services(&temp)));
        let mut request = request(FeedType::Npm, &server.uri(), "@acme/widgets", "1.4.0");
        request.feed.credentials = FeedCredentials::new(None, Some("npm_token".into()));

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.package_id, "@acme/widgets");
        assert_eq!(metadata.extension, ".tgz");
        assert_eq!(metadata.size, 7);
    }

    #[tokio::test]
    async fn test_missing_version_and_empty_tarball() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/left-pad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "versions": {"1.0.0": {"dist": {"tarball": "  "}}}
            })))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NpmDownloader::new(Arc::new(services(&temp)));

        let err = downloader
            .download(&request(FeedType::Npm, &server.uri(), "left-pad", "2.0.0"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Unable to find tarball URL for NPM package left-pad"));

        let err = downloader
            .download(&request(FeedType::Npm, &server.uri(), "left-pad", "1.0.0"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Tarball URL is empty for NPM package left-pad version 1.0.0");
    }

    #[tokio::test]
    async fn test_metadata_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NpmDownloader::new(Arc::new(services(&temp)));
        let err = downloader
            .download(&request(FeedType::Npm, &server.uri(), "left-pad", "1.0.0"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to fetch NPM package metadata (Status Code 403). Reason: Forbidden"));
    }
}

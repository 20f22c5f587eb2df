//! S3 and GCS bucket downloader
//!
//! Package ids take the form `<bucket>/<key prefix>`. The object is found by
//! listing `<prefix>.<version><ext>` for each known extension and accepting
//! the first listing that yields exactly one key.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;
use stowage_core::package_name::extension_of;
use url::Url;

use super::{DownloadRequest, PackageDownloader, Services, check_cache};
use crate::aws::{AwsCredentials, EMPTY_PAYLOAD_SHA256, SigV4, uri_encode};
use crate::error::{FetchError, Result};
use crate::feed::{FeedDescriptor, FeedType};
use crate::http::{Progress, ensure_success, stream_to_file};

/// Probed in order; `.` stands for a key with no extension
const KNOWN_EXTENSIONS: &[&str] = &[".", ".zip", ".tar.gz", ".tar.bz2", ".tgz", ".tar.bz"];

const DEFAULT_S3_ENDPOINT: &str = "https://s3.amazonaws.com";
const GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_REGION: &str = "us-east-1";

/// A bucket-addressed object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys in `bucket` starting with `prefix`
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Write one object to `dest`, returning the byte count
    async fn get(&self, bucket: &str, key: &str, dest: &Path, progress: &Progress) -> Result<u64>;
}

/// Opens a store for a feed and bucket
#[async_trait]
pub trait ObjectStoreFactory: Send + Sync {
    async fn open(&self, feed: &FeedDescriptor, bucket: &str) -> Result<Box<dyn ObjectStore>>;
}

#[derive(Debug, Deserialize)]
struct LocationConstraint {
    #[serde(rename = "$text", default)]
    region: String,
}

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ObjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    #[serde(rename = "Key")]
    key: String,
}

/// Map a `LocationConstraint` value to a signing region
fn normalize_region(constraint: &str) -> String {
    match constraint.trim() {
        "" => DEFAULT_REGION.to_string(),
        "EU" => "eu-west-1".to_string(),
        region => region.to_string(),
    }
}

/// Feed URI used as an S3-compatible endpoint, when one is configured
fn custom_endpoint(feed: &FeedDescriptor) -> Option<String> {
    let uri = feed.base_uri().trim();
    let parsed = Url::parse(uri).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || uri.eq_ignore_ascii_case(DEFAULT_S3_ENDPOINT) {
        return None;
    }
    Some(uri.to_string())
}

fn aws_credentials(feed: &FeedDescriptor) -> Option<AwsCredentials> {
    let access_key = feed.credentials.username();
    if access_key.is_empty() {
        return None;
    }
    Some(AwsCredentials::new(access_key, feed.credentials.password()))
}

/// Path-style S3 client signed with Signature V4
#[derive(Debug)]
pub struct S3Store {
    http: reqwest::Client,
    endpoint: String,
    signer: Option<SigV4>,
}

impl S3Store {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, signer: Option<SigV4>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            signer,
        }
    }

    fn url(&self, bucket: &str, rest: &str) -> Result<Url> {
        let raw = format!("{}/{}{}", self.endpoint, uri_encode(bucket, true), rest);
        Url::parse(&raw).map_err(|e| FetchError::InvalidFeedUrl {
            url: raw,
            reason: e.to_string(),
        })
    }

    async fn send(&self, url: &Url) -> Result<reqwest::Response> {
        let mut req = self.http.get(url.clone());
        if let Some(signer) = &self.signer {
            req = signer.apply(
                req,
                "GET",
                url,
                &[("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256)],
                EMPTY_PAYLOAD_SHA256,
            );
        }
        ensure_success(req.send().await?, url.as_str()).await
    }

    /// Region a bucket lives in, from its location constraint
    pub async fn bucket_region(&self, bucket: &str) -> Result<String> {
        let url = self.url(bucket, "?location")?;
        let body = self.send(&url).await?.text().await?;
        let location: LocationConstraint = quick_xml::de::from_str(&body)?;
        Ok(normalize_region(&location.region))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let url = self.url(bucket, &format!("?list-type=2&prefix={}", uri_encode(prefix, true)))?;
        let body = self.send(&url).await?.text().await?;
        let listing: ListBucketResult = quick_xml::de::from_str(&body)?;
        Ok(listing.contents.into_iter().map(|o| o.key).collect())
    }

    async fn get(&self, bucket: &str, key: &str, dest: &Path, progress: &Progress) -> Result<u64> {
        let url = self.url(bucket, &format!("/{}", uri_encode(key, false)))?;
        let response = self.send(&url).await?;
        stream_to_file(response, dest, key, progress).await
    }
}

/// Opens [`S3Store`]s for S3 and GCS feeds
///
/// GCS is reached through its XML interoperability API with HMAC keys, so
/// both feed types share one client.
#[derive(Debug, Clone)]
pub struct S3StoreFactory {
    http: reqwest::Client,
}

impl S3StoreFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ObjectStoreFactory for S3StoreFactory {
    async fn open(&self, feed: &FeedDescriptor, bucket: &str) -> Result<Box<dyn ObjectStore>> {
        let credentials = aws_credentials(feed);
        match feed.feed_type {
            FeedType::Gcs => {
                let endpoint = custom_endpoint(feed).unwrap_or_else(|| GCS_ENDPOINT.to_string());
                let signer = credentials.map(|c| SigV4::new(c, "auto", "s3"));
                Ok(Box::new(S3Store::new(self.http.clone(), endpoint, signer)))
            }
            FeedType::S3 => {
                let custom = custom_endpoint(feed);
                let discovery_endpoint = custom.clone().unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string());
                let discovery = S3Store::new(
                    self.http.clone(),
                    discovery_endpoint,
                    credentials.clone().map(|c| SigV4::new(c, DEFAULT_REGION, "s3")),
                );
                let region = discovery.bucket_region(bucket).await?;
                tracing::debug!("Bucket {} is in region {}", bucket, region);

                let endpoint = custom.unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
                let signer = credentials.map(|c| SigV4::new(c, region, "s3"));
                Ok(Box::new(S3Store::new(self.http.clone(), endpoint, signer)))
            }
            other => Err(FetchError::UnsupportedFeedType {
                feed_type: other.to_string(),
            }),
        }
    }
}

/// Split `<bucket>/<prefix>`; both halves must be present
fn split_package_id(package_id: &str) -> Result<(&str, &str)> {
    match package_id.split_once('/') {
        Some((bucket, prefix)) if !bucket.is_empty() && !prefix.is_empty() => Ok((bucket, prefix)),
        _ => Err(FetchError::InvalidPackageId {
            message: format!(
                "Invalid PackageId for S3 feed. Expecting format `<bucketName>/<packageId>`, but received {}",
                package_id
            ),
        }),
    }
}

/// Extension recorded in the cache for an object key
fn key_extension(key: &str) -> String {
    KNOWN_EXTENSIONS
        .iter()
        .filter(|ext| **ext != ".")
        .find(|ext| key.to_ascii_lowercase().ends_with(*ext))
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| extension_of(key))
}

pub struct ObjectStorageDownloader {
    services: Arc<Services>,
}

impl ObjectStorageDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn find_key(&self, store: &dyn ObjectStore, bucket: &str, prefix: &str, version: &str) -> Result<String> {
        for ext in KNOWN_EXTENSIONS {
            let suffix = if *ext == "." { "" } else { ext };
            let name = format!("{prefix}.{version}{suffix}");
            let mut keys = store.list(bucket, &name).await?;
            if keys.len() == 1 {
                return Ok(keys.remove(0));
            }
            tracing::debug!("{} objects match {}/{}", keys.len(), bucket, name);
        }
        Err(FetchError::Other("file not found".to_string()))
    }

    async fn attempt(
        &self,
        request: &DownloadRequest,
        bucket: &str,
        prefix: &str,
    ) -> Result<PackagePhysicalFileMetadata> {
        let store = self.services.object_stores.open(&request.feed, bucket).await?;
        let key = self
            .find_key(store.as_ref(), bucket, prefix, request.version.as_str())
            .await?;
        let stem = format!("{}.{}", prefix, request.version.as_str());
        let extension = if key == stem { String::new() } else { key_extension(&key) };

        if let Some(cached) = check_cache(&self.services, request, &[extension.as_str()]) {
            return Ok(cached);
        }

        tracing::debug!("Downloading object {}/{}", bucket, key);
        let staging = self.services.cache.staging()?;
        let staged = staging.path().join("download");
        store.get(bucket, &key, &staged, &self.services.progress).await?;

        self.services.cache.commit_and_hash(
            &request.feed.feed_id,
            &staged,
            &request.package_id,
            &request.version,
            &extension,
        )
    }
}

#[async_trait]
impl PackageDownloader for ObjectStorageDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        let (bucket, prefix) = split_package_id(&request.package_id)?;

        if let Some(cached) = check_cache(&self.services, request, &[]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading {} package {} v{} from bucket {}",
            request.feed.feed_type,
            request.package_id,
            request.version,
            bucket
        );

        request
            .retry
            .execute(
                move || async move { self.attempt(request, bucket, prefix).await },
                |_| true,
            )
            .await
            .map_err(|e| FetchError::DownloadFailed {
                package_id: request.package_id.clone(),
                version: request.version.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{request, services};
    use super::*;
    use crate::credentials::FeedCredentials;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing(keys: &[&str]) -> String {
        let contents: String = keys
            .iter()
            .map(|k| format!("<Contents><Key>{k}</Key><Size>3</Size></Contents>"))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>releases</Name><KeyCount>{}</KeyCount>{}</ListBucketResult>"#,
            keys.len(),
            contents
        )
    }

    async fn mount_listing(server: &MockServer, prefix: &str, keys: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/releases"))
            .and(query_param("list-type", "2"))
            .and(query_param("prefix", prefix))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(keys)))
            .mount(server)
            .await;
    }

    #[test]
    fn test_split_package_id() {
        assert_eq!(split_package_id("releases/app/web").unwrap(), ("releases", "app/web"));
        assert!(split_package_id("releases").is_err());
        assert!(split_package_id("/app").is_err());
        let err = split_package_id("releases/").unwrap_err();
        assert!(err.to_string().contains("Expecting format `<bucketName>/<packageId>`"));
    }

    #[test]
    fn test_key_extension_and_region() {
        assert_eq!(key_extension("app/web.1.0.0.tar.gz"), ".tar.gz");
        assert_eq!(key_extension("app/web.1.0.0.ZIP"), ".zip");
        assert_eq!(key_extension("app/web.1.0.0.jar"), ".jar");
        assert_eq!(normalize_region(""), "us-east-1");
        assert_eq!(normalize_region("EU"), "eu-west-1");
        assert_eq!(normalize_region("ap-southeast-2"), "ap-southeast-2");
    }

    #[tokio::test]
    async fn test_s3_download_discovers_region_and_skips_ambiguous_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .and(query_param("location", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/">eu-west-2</LocationConstraint>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        mount_listing(&server, "app/web.1.0.0", &["app/web.1.0.0.zip", "app/web.1.0.0.tgz"]).await;
        mount_listing(&server, "app/web.1.0.0.zip", &["app/web.1.0.0.zip"]).await;
        Mock::given(method("GET"))
            .and(path("/releases/app/web.1.0.0.zip"))
            .and(header("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = ObjectStorageDownloader::new(Arc::new(services(&temp)));
        let mut request = request(FeedType::S3, &server.uri(), "releases/app/web", "1.0.0");
        request.feed.credentials = FeedCredentials::basic("AKIDEXAMPLE", "secret");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.package_id, "releases/app/web");
        assert_eq!(metadata.extension, ".zip");
        assert_eq!(metadata.size, 3);

        let requests = server.received_requests().await.unwrap();
        let last = requests.last().unwrap();
        let authorization = last.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(authorization.contains("/eu-west-2/s3/aws4_request"));
    }

    #[tokio::test]
    async fn test_gcs_download_without_credentials_is_unsigned() {
        let server = MockServer::start().await;
        mount_listing(&server, "tools/cli.2.1.0", &["tools/cli.2.1.0"]).await;
        Mock::given(method("GET"))
            .and(path("/releases/tools/cli.2.1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"binary".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = ObjectStorageDownloader::new(Arc::new(services(&temp)));
        let request = request(FeedType::Gcs, &server.uri(), "releases/tools/cli", "2.1.0");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.extension, "");
        assert_eq!(metadata.size, 6);

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.headers.get("authorization").is_none()));
        assert!(requests.iter().all(|r| !r.url.query().unwrap_or_default().contains("location")));
    }

    #[tokio::test]
    async fn test_missing_object_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .and(query_param("location", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string("<LocationConstraint/>"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
            .expect(12)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = ObjectStorageDownloader::new(Arc::new(services(&temp)));
        let request = request(FeedType::S3, &server.uri(), "releases/app", "2.0.0");

        let err = downloader.download(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to download package releases/app 2.0.0: file not found");
    }
}

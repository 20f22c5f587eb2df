//! Feed-specific package downloaders
//!
//! Every downloader follows the same outline:
//!
//! 1. look in the cache unless the request forces a download
//! 2. resolve the package to something downloadable (a URL, a blob digest,
//!    an object key or an image reference)
//! 3. download through the request's [`RetryPolicy`] into a staging directory
//! 4. move the finished file into the cache and return its metadata
//!
//! Collaborators are shared through [`Services`] so tests can swap the
//! container engine or object store for fakes.

use async_trait::async_trait;
use std::sync::Arc;
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion, Variables};

use crate::cache::PackageCache;
use crate::config::FetchConfig;
use crate::credentials::build_http_client;
use crate::engine::{ContainerEngine, DockerCli};
use crate::error::{FetchError, Result};
use crate::feed::FeedDescriptor;
use crate::http::{Progress, ensure_success, stream_to_file};
use crate::retry::RetryPolicy;

pub mod artifactory;
pub mod docker;
pub mod github;
pub mod helm;
pub mod maven;
pub mod npm;
pub mod nuget;
pub mod object_storage;
pub mod oci;

pub use artifactory::ArtifactoryDownloader;
pub use docker::DockerImageDownloader;
pub use github::GitHubDownloader;
pub use helm::HelmChartDownloader;
pub use maven::MavenDownloader;
pub use npm::NpmDownloader;
pub use nuget::NuGetDownloader;
pub use object_storage::{ObjectStore, ObjectStoreFactory, ObjectStorageDownloader, S3StoreFactory};
pub use oci::OciDownloader;

/// One package to acquire
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub package_id: String,
    pub version: PackageVersion,
    pub feed: FeedDescriptor,
    /// Skip the cache lookup; the result is still written to the cache
    pub force_download: bool,
    pub retry: RetryPolicy,
}

impl DownloadRequest {
    pub fn new(package_id: impl Into<String>, version: PackageVersion, feed: FeedDescriptor) -> Self {
        Self {
            package_id: package_id.into(),
            version,
            feed,
            force_download: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn force(mut self, force_download: bool) -> Self {
        self.force_download = force_download;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Collaborators shared by every downloader
#[derive(Clone)]
pub struct Services {
    pub http: reqwest::Client,
    pub cache: PackageCache,
    pub engine: Arc<dyn ContainerEngine>,
    pub object_stores: Arc<dyn ObjectStoreFactory>,
    pub variables: Variables,
    pub progress: Progress,
    pub config: FetchConfig,
}

impl Services {
    /// Production collaborators: the shared HTTP client, the configured cache
    /// root, the `docker` CLI and the S3-compatible object store
    pub fn new(config: FetchConfig, variables: Variables) -> Result<Self> {
        let http = build_http_client(&config)?;
        Ok(Self {
            cache: PackageCache::new(config.cache_root()?),
            engine: Arc::new(DockerCli::new(config.docker_executable.clone())),
            object_stores: Arc::new(S3StoreFactory::new(http.clone())),
            http,
            variables,
            progress: None,
            config,
        })
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("cache", &self.cache)
            .field("variables", &self.variables.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Acquire one package from one kind of feed
#[async_trait]
pub trait PackageDownloader: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata>;
}

/// Cache lookup honouring `force_download`
pub(crate) fn check_cache(
    services: &Services,
    request: &DownloadRequest,
    extensions: &[&str],
) -> Option<PackagePhysicalFileMetadata> {
    if request.force_download {
        tracing::debug!("Forced download of {} v{}, skipping cache", request.package_id, request.version);
        return None;
    }
    services.cache.try_find(
        &request.feed.feed_id,
        &request.package_id,
        &request.version,
        extensions,
    )
}

/// GET `url` into the cache under the request's identifier
///
/// Transient failures are retried with the request's policy. The staging
/// directory is removed on every path.
pub(crate) async fn fetch_to_cache(
    services: &Services,
    request: &DownloadRequest,
    url: &str,
    authorization: Option<&str>,
    extension: &str,
) -> Result<PackagePhysicalFileMetadata> {
    let staging = services.cache.staging()?;
    let staged = staging.path().join("download");

    let http = &services.http;
    let progress = &services.progress;
    let target = &staged;
    let label = request.package_id.as_str();

    request
        .retry
        .execute_transient(move || async move {
            tracing::debug!("Downloading {}", url);
            let mut req = http.get(url);
            if let Some(auth) = authorization {
                req = req.header(reqwest::header::AUTHORIZATION, auth);
            }
            let response = ensure_success(req.send().await?, url).await?;
            stream_to_file(response, target, label, progress).await
        })
        .await?;

    services.cache.commit_and_hash(
        &request.feed.feed_id,
        &staged,
        &request.package_id,
        &request.version,
        extension,
    )
}

/// Wrap a failure that survived every retry
pub(crate) fn exhausted(request: &DownloadRequest, error: FetchError) -> FetchError {
    if error.is_transient() {
        FetchError::DownloadFailed {
            package_id: request.package_id.clone(),
            version: request.version.to_string(),
            message: error.to_string(),
        }
    } else {
        error
    }
}

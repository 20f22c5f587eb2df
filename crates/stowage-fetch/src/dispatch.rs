//! Feed type to downloader routing
//!
//! The table is built once from the shared [`Services`]; routing itself does
//! no caching or retrying, every downloader owns that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion};

use crate::downloaders::{
    ArtifactoryDownloader, DockerImageDownloader, DownloadRequest, GitHubDownloader, HelmChartDownloader,
    MavenDownloader, NpmDownloader, NuGetDownloader, ObjectStorageDownloader, OciDownloader, PackageDownloader,
    Services,
};
use crate::error::{FetchError, Result};
use crate::feed::{FeedDescriptor, FeedType};
use crate::retry::RetryPolicy;

/// Lookup table from feed type to downloader
pub struct Downloaders {
    table: HashMap<FeedType, Arc<dyn PackageDownloader>>,
}

impl Downloaders {
    /// Every supported feed type, sharing one set of collaborators
    pub fn new(services: Arc<Services>) -> Self {
        let object_storage: Arc<dyn PackageDownloader> = Arc::new(ObjectStorageDownloader::new(services.clone()));
        let images: Arc<dyn PackageDownloader> = Arc::new(DockerImageDownloader::new(services.clone()));

        let mut downloaders = Self::empty();
        downloaders.register(FeedType::NuGet, Arc::new(NuGetDownloader::new(services.clone())));
        downloaders.register(FeedType::Maven, Arc::new(MavenDownloader::new(services.clone())));
        downloaders.register(FeedType::Npm, Arc::new(NpmDownloader::new(services.clone())));
        downloaders.register(FeedType::GitHub, Arc::new(GitHubDownloader::new(services.clone())));
        downloaders.register(FeedType::Helm, Arc::new(HelmChartDownloader::new(services.clone())));
        downloaders.register(FeedType::S3, object_storage.clone());
        downloaders.register(FeedType::Gcs, object_storage);
        downloaders.register(FeedType::Artifactory, Arc::new(ArtifactoryDownloader::new(services.clone())));
        downloaders.register(FeedType::Docker, images.clone());
        downloaders.register(FeedType::AwsEcr, images);
        downloaders.register(FeedType::Oci, Arc::new(OciDownloader::new(services)));
        downloaders
    }

    /// A table with nothing registered
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    /// Route `feed_type` to `downloader`, replacing any previous entry
    pub fn register(&mut self, feed_type: FeedType, downloader: Arc<dyn PackageDownloader>) {
        self.table.insert(feed_type, downloader);
    }

    pub fn get(&self, feed_type: FeedType) -> Result<&dyn PackageDownloader> {
        self.table
            .get(&feed_type)
            .map(|d| d.as_ref())
            .ok_or_else(|| FetchError::UnsupportedFeedType {
                feed_type: feed_type.to_string(),
            })
    }

    pub fn supports(&self, feed_type: FeedType) -> bool {
        self.table.contains_key(&feed_type)
    }

    pub async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        let downloader = self.get(request.feed.feed_type)?;
        tracing::debug!(
            "Routing {} v{} to the {} downloader",
            request.package_id,
            request.version,
            request.feed.feed_type
        );
        downloader.download(request).await
    }

    /// Download with the retry settings spelled out
    pub async fn download_package(
        &self,
        package_id: &str,
        version: &PackageVersion,
        feed: FeedDescriptor,
        force_download: bool,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<PackagePhysicalFileMetadata> {
        let request = DownloadRequest::new(package_id, version.clone(), feed)
            .force(force_download)
            .with_retry(RetryPolicy::new(max_attempts, backoff));
        self.download(&request).await
    }
}

impl std::fmt::Debug for Downloaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.table.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("Downloaders").field("feed_types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloaders::testing::services;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use stowage_core::VersionFormat;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, u32, bool)>>,
    }

    #[async_trait]
    impl PackageDownloader for Recording {
        async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
            self.seen.lock().unwrap().push((
                request.package_id.clone(),
                request.retry.max_attempts(),
                request.force_download,
            ));
            Err(FetchError::Other("recorded".into()))
        }
    }

    #[test]
    fn test_every_feed_type_is_routed() {
        let temp = TempDir::new().unwrap();
        let downloaders = Downloaders::new(Arc::new(services(&temp)));
        for feed_type in FeedType::ALL {
            assert!(downloaders.supports(feed_type), "{feed_type} is not routed");
            assert!(downloaders.get(feed_type).is_ok());
        }
    }

    #[tokio::test]
    async fn test_unmapped_feed_type_is_rejected() {
        let downloaders = Downloaders::empty();
        let version = PackageVersion::parse("1.0.0", VersionFormat::Semver).unwrap();
        let err = downloaders
            .download_package(
                "Acme.Web",
                &version,
                FeedDescriptor::new("feeds-1", "https://f", FeedType::NuGet),
                false,
                3,
                Duration::ZERO,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported feed type: nuget");
    }

    #[tokio::test]
    async fn test_request_reaches_registered_downloader() {
        let recording = Arc::new(Recording::default());
        let mut downloaders = Downloaders::empty();
        downloaders.register(FeedType::Maven, recording.clone());

        let version = PackageVersion::parse("1.0", VersionFormat::Maven).unwrap();
        let feed = FeedDescriptor::new("feeds-2", "https://repo", FeedType::Maven);
        let err = downloaders
            .download_package("com.acme:app", &version, feed, true, 0, Duration::ZERO)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "recorded");
        let seen = recording.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("com.acme:app".to_string(), 1, true)]);
    }

    #[tokio::test]
    async fn test_cached_package_needs_no_network() {
        let temp = TempDir::new().unwrap();
        let services = services(&temp);
        let version = PackageVersion::parse("2.0.0", VersionFormat::Semver).unwrap();

        let staging = services.cache.staging().unwrap();
        let staged = staging.path().join("download");
        std::fs::write(&staged, b"cached").unwrap();
        services
            .cache
            .commit("feeds-3", &staged, "Acme.Web", &version, ".nupkg")
            .unwrap();

        let downloaders = Downloaders::new(Arc::new(services));
        let feed = FeedDescriptor::new("feeds-3", "http://127.0.0.1:9/unreachable", FeedType::NuGet);
        let metadata = downloaders
            .download_package("acme.web", &version, feed, false, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(metadata.size, 6);
        assert_eq!(metadata.extension, ".nupkg");
    }
}

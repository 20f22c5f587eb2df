//! OCI registry downloader for Helm charts and container images
//!
//! The manifest decides what an artifact is. Charts are stored in the cache
//! from their first layer blob; images, and anything that cannot be
//! classified, go to the container engine.

use async_trait::async_trait;
use std::sync::Arc;
use stowage_core::package_name::extension_of;
use stowage_core::{PackagePhysicalFileMetadata, compute_file_hash};

use super::{DockerImageDownloader, DownloadRequest, PackageDownloader, Services, check_cache, exhausted};
use crate::error::{FetchError, Result};
use crate::registry::{self, ArtifactKind, Descriptor, RegistryClient};

/// Archive formats a chart layer may be stored as
const PACKAGE_EXTENSIONS: &[&str] = &[
    ".tgz", ".tar.gz", ".tar", ".zip", ".nupkg", ".tar.bz2", ".tar.bz", ".tbz", ".jar", ".war",
];

/// Extension for a chart layer: from its title when recognised, else from its media type
fn layer_extension(layer: &Descriptor) -> String {
    let from_title = layer
        .title()
        .map(extension_of)
        .and_then(|ext| PACKAGE_EXTENSIONS.iter().find(|known| known.eq_ignore_ascii_case(&ext)));
    if let Some(ext) = from_title {
        return ext.to_string();
    }

    let tar_gzip = layer
        .media_type
        .as_deref()
        .is_some_and(|m| m.to_ascii_lowercase().ends_with("tar+gzip"));
    let ext = if tar_gzip { ".tgz" } else { ".tar" };
    ext.to_string()
}

pub struct OciDownloader {
    services: Arc<Services>,
    registry: RegistryClient,
    images: DockerImageDownloader,
}

impl OciDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            registry: RegistryClient::new(services.http.clone()),
            images: DockerImageDownloader::new(services.clone()),
            services,
        }
    }

    async fn download_chart(
        &self,
        request: &DownloadRequest,
        api_root: &str,
        tag: &str,
    ) -> Result<PackagePhysicalFileMetadata> {
        let registry = &self.registry;
        let credentials = &request.feed.credentials;
        let package_id = request.package_id.as_str();

        let manifest = request
            .retry
            .execute_transient(move || async move { registry.manifest(api_root, package_id, tag, credentials).await })
            .await?;
        let layer = manifest
            .first_layer()
            .ok_or_else(|| FetchError::ResolutionFailed {
                message: format!("The manifest for {}:{} has no layers", package_id, tag),
            })?;
        let extension = layer_extension(layer);

        let staging = self.services.cache.staging()?;
        let staged = staging.path().join("download");
        let target = &staged;
        let digest = layer.digest.as_str();
        let progress = &self.services.progress;
        request
            .retry
            .execute_transient(move || async move {
                tracing::debug!("Downloading blob {} of {}", digest, package_id);
                registry
                    .download_blob(api_root, package_id, digest, credentials, target, progress)
                    .await
            })
            .await?;

        let path = self.services.cache.commit(
            &request.feed.feed_id,
            &staged,
            package_id,
            &request.version,
            &extension,
        )?;
        let hash = match registry::digest_hash(digest) {
            Some(hash) => hash,
            None => compute_file_hash(&path)?,
        };
        Ok(PackagePhysicalFileMetadata::with_hash(
            &path,
            package_id,
            request.version.clone(),
            extension,
            hash,
        )?)
    }
}

#[async_trait]
impl PackageDownloader for OciDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, PACKAGE_EXTENSIONS) {
            return Ok(cached);
        }

        let api_root = registry::api_root(&request.feed.feed_uri)?;
        let tag = registry::fix_version(request.version.as_str());
        let kind = self
            .registry
            .classify(&api_root, &request.package_id, &tag, &request.feed.credentials)
            .await;
        tracing::debug!("{}:{} classified as {:?}", request.package_id, tag, kind);

        match kind {
            ArtifactKind::HelmChart => {
                tracing::info!(
                    "Downloading Helm chart {} v{} from feed: '{}'",
                    request.package_id,
                    request.version,
                    request.feed.feed_uri
                );
                self.download_chart(request, &api_root, &tag)
                    .await
                    .map_err(|e| exhausted(request, e))
            }
            ArtifactKind::ContainerImage | ArtifactKind::Unknown => self.images.download(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeEngine, request, services, services_with};
    use super::*;
    use crate::credentials::FeedCredentials;
    use crate::feed::FeedType;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHART_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"mediaType": "application/vnd.cncf.helm.config.v1+json", "digest": "sha256:aaaa", "size": 117},
        "layers": [{
            "mediaType": "application/vnd.cncf.helm.chart.content.v1.tar+gzip",
            "digest": "sha256:0123abcd",
            "size": 5,
            "annotations": {"org.opencontainers.image.title": "mychart-1.0.0.tgz"}
        }]
    }"#;

    const IMAGE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "sha256:bbbb", "size": 1469},
        "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "sha256:cccc", "size": 100}]
    }"#;

    /// Registry that challenges Basic requests and accepts the issued token
    async fn bearer_registry(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "registry-token"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(
                    "Bearer realm=\"{}/token\",service=\"registry\",scope=\"repository:charts:pull\"",
                    server.uri()
                )
                .as_str(),
            ))
            .mount(server)
            .await;
    }

    fn layer(media_type: &str, title: Option<&str>) -> Descriptor {
        let mut descriptor = Descriptor {
            media_type: Some(media_type.to_string()),
            ..Default::default()
        };
        if let Some(title) = title {
            descriptor
                .annotations
                .insert(registry::TITLE_ANNOTATION.to_string(), title.to_string());
        }
        descriptor
    }

    #[test]
    fn test_layer_extension() {
        assert_eq!(layer_extension(&layer("application/x-anything", Some("bundle-1.0.0.ZIP"))), ".zip");
        assert_eq!(layer_extension(&layer("application/x-anything", Some("bundle-1.0.0.tar.gz"))), ".tar.gz");
        assert_eq!(
            layer_extension(&layer("application/vnd.cncf.helm.chart.content.v1.tar+gzip", Some("notes.txt"))),
            ".tgz"
        );
        assert_eq!(layer_extension(&layer("application/vnd.oci.image.layer.v1.tar", None)), ".tar");
    }

    #[tokio::test]
    async fn test_chart_downloaded_from_blob() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/charts/mychart/manifests/1.0.0_build.1"))
            .and(header("authorization", "Bearer registry-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHART_MANIFEST))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/charts/mychart/blobs/sha256:0123abcd"))
            .and(header("authorization", "Bearer registry-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"chart".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        bearer_registry(&server).await;

        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let downloader = OciDownloader::new(Arc::new(services_with(&temp, engine.clone())));
        let mut request = request(FeedType::Oci, &server.uri(), "charts/mychart", "1.0.0+build.1");
        request.feed.credentials = FeedCredentials::basic("user", "pass");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.extension, ".tgz");
        assert_eq!(metadata.hash, "0123abcd");
        assert_eq!(metadata.size, 5);
        assert!(metadata.full_file_path.exists());
        assert!(engine.calls().is_empty());

        let again = downloader.download(&request).await.unwrap();
        assert_eq!(again.full_file_path, metadata.full_file_path);
    }

    #[tokio::test]
    async fn test_image_pulled_through_engine_after_bearer_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/acme/api/manifests/2.3.0"))
            .and(header("authorization", "Bearer registry-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Docker-Content-Digest", "sha256:d1d1")
                    .set_body_string(IMAGE_MANIFEST),
            )
            .mount(&server)
            .await;
        bearer_registry(&server).await;

        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new("sha256:d1d1", 4096));
        let downloader = OciDownloader::new(Arc::new(services_with(&temp, engine.clone())));
        let mut request = request(FeedType::Oci, &server.uri(), "acme/api", "2.3.0");
        request.feed.credentials = FeedCredentials::basic("user", "pass");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.hash, "sha256:d1d1");
        assert_eq!(metadata.size, 4096);

        let calls = engine.calls();
        assert!(calls[0].starts_with("login http://127.0.0.1:"));
        assert!(calls[0].ends_with(" user"));
        assert!(calls.iter().any(|c| c.starts_with("pull 127.0.0.1:") && c.ends_with("/acme/api:2.3.0")));
    }

    #[tokio::test]
    async fn test_unclassifiable_artifact_falls_back_to_image_pull() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new("sha256:e", 1));
        let downloader = OciDownloader::new(Arc::new(services_with(&temp, engine.clone())));

        downloader
            .download(&request(FeedType::Oci, &server.uri(), "mystery", "1.0.0"))
            .await
            .unwrap();
        assert!(engine.calls().iter().any(|c| c.starts_with("pull ")));
    }

    #[tokio::test]
    async fn test_blob_failure_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/charts/mychart/manifests/1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHART_MANIFEST))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/charts/mychart/blobs/sha256:0123abcd"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = OciDownloader::new(Arc::new(services(&temp)));
        let err = downloader
            .download(&request(FeedType::Oci, &server.uri(), "charts/mychart", "1.0.0"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to download artifact (Status Code 403). Reason: Forbidden"
        );
    }
}

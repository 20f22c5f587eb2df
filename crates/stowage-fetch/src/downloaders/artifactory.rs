//! Generic artifact repository downloader (Artifactory storage API)

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;
use stowage_core::package_name::extension_of;
use stowage_core::variables::known;

use super::{DownloadRequest, PackageDownloader, Services, check_cache, exhausted};
use crate::error::{FetchError, Result};
use crate::http::stream_to_file;
use crate::registry::RegistryClient;

const REGISTRY_LABEL: &str = "Artifactory";

#[derive(Debug, Deserialize)]
struct StorageListing {
    #[serde(default)]
    files: Vec<StorageFile>,
}

#[derive(Debug, Deserialize)]
struct StorageFile {
    /// Path relative to the listed folder, with a leading `/`
    uri: String,
    #[serde(default)]
    folder: bool,
}

impl StorageFile {
    fn file_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// Where an artifact lives in the repository
#[derive(Debug, PartialEq)]
struct ArtifactLocation<'a> {
    repository: &'a str,
    /// Folder path inside the repository, possibly empty
    path: String,
    name: &'a str,
}

impl ArtifactLocation<'_> {
    fn folder(&self) -> String {
        if self.path.is_empty() {
            self.repository.to_string()
        } else {
            format!("{}/{}", self.repository, self.path)
        }
    }
}

/// Split a package id into repository, folder and artifact name
///
/// Without a configured repository the first segment names it.
fn locate<'a>(package_id: &'a str, repository: Option<&'a str>) -> Result<ArtifactLocation<'a>> {
    let segments: Vec<&str> = package_id.split('/').filter(|s| !s.is_empty()).collect();
    let invalid = || FetchError::InvalidPackageId {
        message: format!(
            "Invalid PackageId for Artifactory feed. Expecting format `<repository>/<path>/<name>` when {} is not set, but received {}",
            known::ARTIFACTORY_REPOSITORY,
            package_id
        ),
    };

    let (repository, rest) = match repository {
        Some(repository) => (repository, segments.as_slice()),
        None => match segments.split_first() {
            Some((repository, rest)) if !rest.is_empty() => (*repository, rest),
            _ => return Err(invalid()),
        },
    };

    let (name, folders) = rest.split_last().ok_or_else(invalid)?;
    Ok(ArtifactLocation {
        repository,
        path: folders.join("/"),
        name: *name,
    })
}

pub struct ArtifactoryDownloader {
    services: Arc<Services>,
    registry: RegistryClient,
}

impl ArtifactoryDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        let registry = RegistryClient::new(services.http.clone()).with_label(REGISTRY_LABEL);
        Self { services, registry }
    }

    /// Relative URI of the single file matching the artifact name and version
    async fn find_artifact(&self, request: &DownloadRequest, location: &ArtifactLocation<'_>) -> Result<String> {
        let url = format!(
            "{}/api/storage/{}?list&deep=1&listFolders=0",
            request.feed.base_uri(),
            location.folder()
        );
        tracing::debug!("Listing artifacts at {}", url);

        let registry = &self.registry;
        let credentials = &request.feed.credentials;
        let url = url.as_str();
        let listing: StorageListing = request
            .retry
            .execute_transient(move || async move {
                let response = registry.get(url, credentials, Some("application/json")).await?;
                Ok::<_, FetchError>(response.json().await?)
            })
            .await?;

        let name = location.name.to_ascii_lowercase();
        let version = request.version.as_str().to_ascii_lowercase();
        let files: Vec<&StorageFile> = listing.files.iter().filter(|f| !f.folder).collect();
        let mut matches: Vec<&StorageFile> = files
            .iter()
            .copied()
            .filter(|f| {
                let file_name = f.file_name().to_ascii_lowercase();
                file_name.contains(&name) && file_name.contains(&version)
            })
            .collect();

        let found = matches.len();
        if found == 1 {
            return Ok(matches.remove(0).uri.clone());
        }

        let candidates = if matches.is_empty() { files } else { matches };
        let names: Vec<&str> = candidates.iter().map(|f| f.uri.trim_start_matches('/')).collect();
        Err(FetchError::Ambiguous {
            message: format!(
                "Expected exactly one artifact matching {} v{} in {}, found {}. Candidates: [{}]",
                location.name,
                request.version,
                location.folder(),
                found,
                names.join(", ")
            ),
        })
    }
}

#[async_trait]
impl PackageDownloader for ArtifactoryDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &[]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading package {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let repository = self.services.variables.get(known::ARTIFACTORY_REPOSITORY);
        let location = locate(&request.package_id, repository)?;

        let relative = self
            .find_artifact(request, &location)
            .await
            .map_err(|e| exhausted(request, e))?;
        let extension = extension_of(&relative);
        let url = format!("{}/{}{}", request.feed.base_uri(), location.folder(), relative);

        let staging = self.services.cache.staging()?;
        let staged = staging.path().join("download");

        let registry = &self.registry;
        let credentials = &request.feed.credentials;
        let progress = &self.services.progress;
        let target = &staged;
        let label = request.package_id.as_str();
        let url = url.as_str();
        request
            .retry
            .execute_transient(move || async move {
                tracing::debug!("Downloading {}", url);
                let response = registry.get(url, credentials, None).await?;
                stream_to_file(response, target, label, progress).await
            })
            .await
            .map_err(|e| exhausted(request, e))?;

        self.services.cache.commit_and_hash(
            &request.feed.feed_id,
            &staged,
            &request.package_id,
            &request.version,
            &extension,
        )
    }
}

//! Maven repository downloader
//!
//! Package ids are `group:artifact[:packaging[:classifier]]`. Without a
//! packaging the artifact type is discovered by probing each known extension
//! with a `HEAD` request. SNAPSHOT versions are resolved to their latest
//! timestamped build through the version-level `maven-metadata.xml`.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;

use super::{DownloadRequest, PackageDownloader, Services, check_cache, fetch_to_cache};
use crate::error::{FetchError, Result};

/// Extensions probed when the id does not name a packaging, in order
pub const MAVEN_EXTENSIONS: [&str; 13] = [
    ".jar", ".war", ".ear", ".rar", ".zip", ".nupkg", ".tar.bz2", ".tar.bz", ".tbz", ".tgz",
    ".tar.gz", ".tar.Z", ".tar",
];

/// Parsed `group:artifact[:packaging[:classifier]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavenCoordinate {
    pub group: String,
    pub artifact: String,
    pub packaging: Option<String>,
    pub classifier: Option<String>,
}

impl MavenCoordinate {
    pub fn parse(package_id: &str) -> Result<Self> {
        let parts: Vec<&str> = package_id.split(':').map(str::trim).collect();
        let non_empty = |s: Option<&&str>| s.filter(|s| !s.is_empty()).map(|s| s.to_string());

        if parts.len() < 2 || parts.len() > 4 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(FetchError::InvalidPackageId {
                message: format!(
                    "Maven package id '{}' must be in the format group:artifact[:packaging[:classifier]]",
                    package_id
                ),
            });
        }

        Ok(Self {
            group: parts[0].to_string(),
            artifact: parts[1].to_string(),
            packaging: non_empty(parts.get(2)),
            classifier: non_empty(parts.get(3)),
        })
    }

    fn version_dir(&self, version: &str) -> String {
        format!("/{}/{}/{}", self.group.replace('.', "/"), self.artifact, version)
    }

    /// `/group/path/artifact/version/maven-metadata.xml`
    pub fn metadata_path(&self, version: &str) -> String {
        format!("{}/maven-metadata.xml", self.version_dir(version))
    }

    /// Path of the artifact file; `file_version` differs from `version` for snapshots
    pub fn artifact_path(&self, version: &str, file_version: &str, extension: &str) -> String {
        let classifier = self
            .classifier
            .as_deref()
            .map(|c| format!("-{c}"))
            .unwrap_or_default();
        format!(
            "{}/{}-{}{}{}",
            self.version_dir(version),
            self.artifact,
            file_version,
            classifier,
            extension
        )
    }

    /// Extensions to probe, restricted to the packaging when one is named
    fn candidate_extensions(&self) -> Vec<String> {
        match &self.packaging {
            Some(packaging) => vec![format!(".{packaging}")],
            None => MAVEN_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotMetadata {
    #[serde(default)]
    versioning: Option<Versioning>,
}

#[derive(Debug, Default, Deserialize)]
struct Versioning {
    #[serde(rename = "snapshotVersions", default)]
    snapshot_versions: Option<SnapshotVersions>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotVersions {
    #[serde(rename = "snapshotVersion", default)]
    entries: Vec<SnapshotVersion>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotVersion {
    #[serde(default)]
    classifier: Option<String>,
    #[serde(default)]
    extension: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    updated: String,
}

impl SnapshotMetadata {
    fn from_xml(xml: &str) -> Result<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    /// Timestamped value of the most recently updated matching build
    fn latest(&self, extension: &str, classifier: Option<&str>) -> Option<&str> {
        let extension = extension.trim_start_matches('.');
        self.versioning
            .as_ref()?
            .snapshot_versions
            .as_ref()?
            .entries
            .iter()
            .filter(|v| v.extension.trim().eq_ignore_ascii_case(extension))
            .filter(|v| {
                let found = v.classifier.as_deref().unwrap_or("").trim();
                found.eq_ignore_ascii_case(classifier.unwrap_or("").trim())
            })
            .filter(|v| !v.value.trim().is_empty())
            .max_by(|a, b| a.updated.trim().cmp(b.updated.trim()))
            .map(|v| v.value.trim())
    }
}

pub struct MavenDownloader {
    services: Arc<Services>,
}

impl MavenDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn snapshot_metadata(
        &self,
        request: &DownloadRequest,
        coordinate: &MavenCoordinate,
        authorization: Option<&str>,
    ) -> Result<Option<SnapshotMetadata>> {
        let url = format!(
            "{}{}",
            request.feed.base_uri(),
            coordinate.metadata_path(request.version.as_str())
        );
        let http = &self.services.http;
        let url = url.as_str();

        let body = request
            .retry
            .execute_transient(move || async move {
                let mut req = http.get(url);
                if let Some(auth) = authorization {
                    req = req.header(reqwest::header::AUTHORIZATION, auth);
                }
                let response = req.send().await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = crate::http::ensure_success(response, url).await?;
                Ok::<_, FetchError>(Some(response.text().await?))
            })
            .await
            .map_err(|e| FetchError::ResolutionFailed {
                message: format!(
                    "Unable to retrieve Maven Snapshot Metadata.\nLast Exception Message: {}",
                    e
                ),
            })?;

        let Some(body) = body else {
            tracing::debug!("No snapshot metadata at {}", url);
            return Ok(None);
        };

        match SnapshotMetadata::from_xml(&body) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable snapshot metadata at {}: {}", url, e);
                Ok(None)
            }
        }
    }

    fn artifact_url(
        &self,
        request: &DownloadRequest,
        coordinate: &MavenCoordinate,
        extension: &str,
        snapshot: Option<&SnapshotMetadata>,
    ) -> String {
        let version = request.version.as_str();
        let file_version = snapshot
            .and_then(|m| m.latest(extension, coordinate.classifier.as_deref()))
            .unwrap_or(version);
        format!(
            "{}{}",
            request.feed.base_uri(),
            coordinate.artifact_path(version, file_version, extension)
        )
    }

    /// Find the first extension the repository answers a `HEAD` for
    async fn first_to_respond(
        &self,
        request: &DownloadRequest,
        coordinate: &MavenCoordinate,
        authorization: Option<&str>,
        snapshot: Option<&SnapshotMetadata>,
    ) -> Result<(String, String)> {
        let mut errors: Vec<String> = Vec::new();

        for extension in coordinate.candidate_extensions() {
            let url = self.artifact_url(request, coordinate, &extension, snapshot);
            let mut req = self.services.http.head(&url);
            if let Some(auth) = authorization {
                req = req.header(reqwest::header::AUTHORIZATION, auth);
            }

            let error = match req.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Found Maven artifact at {}", url);
                    return Ok((extension, url));
                }
                Ok(response) => format!("Failed to download {}\n{}", url, response.status()),
                Err(e) => format!("Failed to download {}\n{}", url, FetchError::from(e)),
            };
            if !errors.contains(&error) {
                errors.push(error);
            }
        }

        Err(FetchError::Ambiguous {
            message: format!(
                "Failed to find the Maven artifact.\nReceived Error(s):\n{}",
                errors.join("\n")
            ),
        })
    }
}

#[async_trait]
impl PackageDownloader for MavenDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &MAVEN_EXTENSIONS) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading Maven package {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let coordinate = MavenCoordinate::parse(&request.package_id)?;
        let authorization = request.feed.credentials.basic_header();
        let authorization = authorization.as_deref();

        let snapshot = self.snapshot_metadata(request, &coordinate, authorization).await?;
        let (extension, url) = self
            .first_to_respond(request, &coordinate, authorization, snapshot.as_ref())
            .await?;
        tracing::debug!("Found package {} v{}", request.package_id, request.version);

        fetch_to_cache(&self.services, request, &url, authorization, &extension)
            .await
            .map_err(|e| FetchError::ResolutionFailed {
                message: format!(
                    "Failed to download the Maven artifact.\nLast Exception Message: {}",
                    e
                ),
            })
    }
}

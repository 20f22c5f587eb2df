//! NuGet feed downloader
//!
//! Three kinds of feed are handled:
//!
//! - **v3**: the feed URI serves a service index; packages come from the
//!   `PackageBaseAddress/3.0.0` flat container, or from the registration
//!   leaf's `packageContent` when no flat container is advertised
//! - **v2**: anything else reachable over HTTP, using `{feed}/package/{id}/{version}`
//! - **local**: a `file://` URI or a plain directory holding `{id}.{version}.nupkg`

use async_trait::async_trait;
use indexmap::IndexSet;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_core::{PackagePhysicalFileMetadata, archive};
use url::Url;
use walkdir::WalkDir;

use super::{DownloadRequest, PackageDownloader, Services, check_cache, exhausted, fetch_to_cache};
use crate::error::{FetchError, Result};
use crate::http::ensure_success;

const NUPKG: &str = ".nupkg";
const PACKAGE_BASE_ADDRESS: &str = "PackageBaseAddress/3.0.0";
const REGISTRATIONS_BASE_URL: &str = "RegistrationsBaseUrl";

#[derive(Debug, Deserialize)]
struct ServiceIndex {
    #[serde(default)]
    version: String,
    #[serde(default)]
    resources: Vec<ServiceResource>,
}

#[derive(Debug, Deserialize)]
struct ServiceResource {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type", default)]
    resource_type: String,
}

impl ServiceIndex {
    fn is_v3(&self) -> bool {
        self.version.split('.').next() == Some("3")
    }

    fn resource(&self, prefix: &str) -> Option<&str> {
        self.resources
            .iter()
            .find(|r| r.resource_type.starts_with(prefix))
            .map(|r| r.id.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationIndex {
    #[serde(default)]
    items: Vec<RegistrationPage>,
}

#[derive(Debug, Deserialize)]
struct RegistrationPage {
    #[serde(rename = "@id", default)]
    id: String,
    /// Absent when the server pages leaves out
    #[serde(default)]
    items: Option<Vec<RegistrationLeaf>>,
}

#[derive(Debug, Deserialize)]
struct RegistrationLeaf {
    #[serde(rename = "catalogEntry")]
    catalog_entry: CatalogEntry,
    #[serde(rename = "packageContent", default)]
    package_content: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct Nuspec {
    #[serde(default)]
    metadata: NuspecMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct NuspecMetadata {
    #[serde(default)]
    dependencies: Option<NuspecDependencies>,
}

#[derive(Debug, Default, Deserialize)]
struct NuspecDependencies {
    #[serde(rename = "dependency", default)]
    direct: Vec<NuspecDependency>,
    #[serde(rename = "group", default)]
    groups: Vec<NuspecDependencyGroup>,
}

#[derive(Debug, Default, Deserialize)]
struct NuspecDependencyGroup {
    #[serde(rename = "dependency", default)]
    dependencies: Vec<NuspecDependency>,
}

#[derive(Debug, Deserialize)]
struct NuspecDependency {
    #[serde(rename = "@id")]
    id: String,
}

/// Ids of every dependency declared in a package's `.nuspec`
pub fn nuspec_dependencies(nupkg: &Path) -> Result<Vec<String>> {
    let entry = archive::read_entry(nupkg, |name| {
        !name.contains('/') && name.to_ascii_lowercase().ends_with(".nuspec")
    })?;
    let Some((_, data)) = entry else {
        return Ok(Vec::new());
    };

    let nuspec: Nuspec = quick_xml::de::from_str(&String::from_utf8_lossy(&data))?;
    let Some(dependencies) = nuspec.metadata.dependencies else {
        return Ok(Vec::new());
    };

    // Framework groups usually repeat the same ids
    let ids: IndexSet<String> = dependencies
        .direct
        .into_iter()
        .chain(dependencies.groups.into_iter().flat_map(|g| g.dependencies))
        .map(|d| d.id)
        .collect();
    Ok(ids.into_iter().collect())
}

/// Lower-case version without build metadata, as flat containers expect
fn normalized_version(version: &str) -> String {
    version
        .split('+')
        .next()
        .unwrap_or(version)
        .to_ascii_lowercase()
}

fn local_feed_dir(feed_uri: &str) -> Option<PathBuf> {
    if feed_uri.starts_with("file:") {
        return Url::parse(feed_uri).ok()?.to_file_path().ok();
    }
    if feed_uri.contains("://") {
        return None;
    }
    let path = PathBuf::from(feed_uri);
    path.is_dir().then_some(path)
}

pub struct NuGetDownloader {
    services: Arc<Services>,
}

impl NuGetDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn get_text(&self, request: &DownloadRequest, url: &str, authorization: Option<&str>) -> Result<String> {
        let http = &self.services.http;
        request
            .retry
            .execute_transient(move || async move {
                let mut req = http.get(url).header(reqwest::header::ACCEPT, "application/json");
                if let Some(auth) = authorization {
                    req = req.header(reqwest::header::AUTHORIZATION, auth);
                }
                let response = ensure_success(req.send().await?, url).await?;
                Ok::<_, FetchError>(response.text().await?)
            })
            .await
    }

    /// The service index, or `None` when the feed is not a v3 feed
    async fn service_index(&self, request: &DownloadRequest, authorization: Option<&str>) -> Result<Option<ServiceIndex>> {
        let body = match self.get_text(request, &request.feed.feed_uri, authorization).await {
            Ok(body) => body,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::debug!("Feed did not answer as a NuGet v3 feed: {}", e);
                return Ok(None);
            }
        };
        Ok(serde_json::from_str::<ServiceIndex>(&body)
            .ok()
            .filter(ServiceIndex::is_v3))
    }

    async fn registration_url(
        &self,
        request: &DownloadRequest,
        registrations: &str,
        authorization: Option<&str>,
    ) -> Result<Option<String>> {
        let id = request.package_id.to_ascii_lowercase();
        let version = request.version.as_str();
        let index_url = format!("{}/{}/index.json", registrations, id);
        let index: RegistrationIndex =
            serde_json::from_str(&self.get_text(request, &index_url, authorization).await?)?;

        for page in index.items {
            let leaves = match page.items {
                Some(leaves) => leaves,
                None => {
                    let page: RegistrationPage =
                        serde_json::from_str(&self.get_text(request, &page.id, authorization).await?)?;
                    page.items.unwrap_or_default()
                }
            };

            if let Some(leaf) = leaves
                .into_iter()
                .find(|l| l.catalog_entry.version.eq_ignore_ascii_case(version))
            {
                return Ok(Some(leaf.package_content).filter(|c| !c.is_empty()));
            }
        }
        Ok(None)
    }

    async fn download_url(&self, request: &DownloadRequest, authorization: Option<&str>) -> Result<String> {
        let Some(index) = self.service_index(request, authorization).await? else {
            return Ok(format!(
                "{}/package/{}/{}",
                request.feed.base_uri(),
                request.package_id,
                request.version
            ));
        };

        if let Some(base) = index.resource(PACKAGE_BASE_ADDRESS) {
            let id = request.package_id.to_ascii_lowercase();
            let version = normalized_version(request.version.as_str());
            return Ok(format!("{base}/{id}/{version}/{id}.{version}{NUPKG}"));
        }

        if let Some(registrations) = index.resource(REGISTRATIONS_BASE_URL) {
            if let Some(url) = self.registration_url(request, registrations, authorization).await? {
                return Ok(url);
            }
        }

        Err(FetchError::PackageNotFound {
            package_id: request.package_id.clone(),
            version: request.version.to_string(),
            feed: request.feed.feed_uri.clone(),
        })
    }

    fn copy_from_directory(&self, request: &DownloadRequest, dir: &Path) -> Result<PackagePhysicalFileMetadata> {
        let wanted = format!("{}.{}{}", request.package_id, request.version, NUPKG);
        let source = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| FetchError::PackageNotFound {
                package_id: request.package_id.clone(),
                version: request.version.to_string(),
                feed: dir.display().to_string(),
            })?;

        let staging = self.services.cache.staging()?;
        let staged = staging.path().join("download");
        std::fs::copy(source.path(), &staged)?;
        self.services.cache.commit_and_hash(
            &request.feed.feed_id,
            &staged,
            &request.package_id,
            &request.version,
            NUPKG,
        )
    }

    fn warn_on_dependencies(&self, metadata: &PackagePhysicalFileMetadata) {
        match nuspec_dependencies(&metadata.full_file_path) {
            Ok(dependencies) if !dependencies.is_empty() => tracing::warn!(
                "NuGet packages with dependencies are not supported, and dependencies won't be installed. The package '{} {}' appears to have the following dependencies: {}",
                metadata.package_id,
                metadata.version,
                dependencies.join(", ")
            ),
            Ok(_) => {}
            Err(e) => tracing::debug!(
                "Could not read dependencies of {}: {}",
                metadata.full_file_path.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl PackageDownloader for NuGetDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        if let Some(cached) = check_cache(&self.services, request, &[NUPKG]) {
            return Ok(cached);
        }

        tracing::info!(
            "Downloading NuGet package {} v{} from feed: '{}'",
            request.package_id,
            request.version,
            request.feed.feed_uri
        );

        let metadata = if let Some(dir) = local_feed_dir(&request.feed.feed_uri) {
            self.copy_from_directory(request, &dir)?
        } else {
            let authorization = request.feed.credentials.basic_header();
            let authorization = authorization.as_deref();
            let url = self
                .download_url(request, authorization)
                .await
                .map_err(|e| exhausted(request, e))?;
            tracing::debug!("Downloading package from '{}'", url);
            fetch_to_cache(&self.services, request, &url, authorization, NUPKG)
                .await
                .map_err(|e| exhausted(request, e))?
        };

        self.warn_on_dependencies(&metadata);
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{request, services};
    use super::*;
    use crate::feed::FeedType;
    use std::io::Write;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zip::write::SimpleFileOptions;

    const NUSPEC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://schemas.microsoft.com/packaging/2013/05/nuspec.xsd">
  <metadata>
    <id>Acme.Web</id>
    <version>1.2.3</version>
    <authors>Acme</authors>
    <dependencies>
      <group targetFramework="net8.0">
        <dependency id="Newtonsoft.Json" version="13.0.1" />
        <dependency id="Serilog" version="3.0.0" />
      </group>
    </dependencies>
  </metadata>
</package>"#;

    fn nupkg(nuspec: &str) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("Acme.Web.nuspec", SimpleFileOptions::default()).unwrap();
            zip.write_all(nuspec.as_bytes()).unwrap();
            zip.start_file("lib/net8.0/Acme.Web.dll", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"MZ").unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_nuspec_dependencies() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Acme.Web.1.2.3.nupkg");
        std::fs::write(&path, nupkg(NUSPEC)).unwrap();
        assert_eq!(nuspec_dependencies(&path).unwrap(), vec!["Newtonsoft.Json", "Serilog"]);

        let flat = r#"<package><metadata><id>A</id><dependencies><dependency id="B" /></dependencies></metadata></package>"#;
        std::fs::write(&path, nupkg(flat)).unwrap();
        assert_eq!(nuspec_dependencies(&path).unwrap(), vec!["B"]);

        let multi_target = r#"<package><metadata><id>A</id><dependencies>
            <group targetFramework="net6.0"><dependency id="Serilog" /><dependency id="Polly" /></group>
            <group targetFramework="net8.0"><dependency id="Polly" /><dependency id="Serilog" /></group>
        </dependencies></metadata></package>"#;
        std::fs::write(&path, nupkg(multi_target)).unwrap();
        assert_eq!(nuspec_dependencies(&path).unwrap(), vec!["Serilog", "Polly"]);

        let none = r#"<package><metadata><id>A</id></metadata></package>"#;
        std::fs::write(&path, nupkg(none)).unwrap();
        assert!(nuspec_dependencies(&path).unwrap().is_empty());
    }

    #[test]
    fn test_normalized_version() {
        assert_eq!(normalized_version("1.0.0-Beta+sha.5"), "1.0.0-beta");
        assert_eq!(normalized_version("2.1.0"), "2.1.0");
    }

    #[tokio::test]
    async fn test_v3_flat_container() {
        let server = MockServer::start().await;
        let index = format!(
            r#"{{"version": "3.0.0", "resources": [
                {{"@id": "{0}/v3/registration/", "@type": "RegistrationsBaseUrl/3.6.0"}},
                {{"@id": "{0}/v3/flat/", "@type": "PackageBaseAddress/3.0.0"}}
            ]}}"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/v3/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/flat/acme.web/1.2.3-beta/acme.web.1.2.3-beta.nupkg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(nupkg(NUSPEC)))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NuGetDownloader::new(Arc::new(services(&temp)));
        let feed = format!("{}/v3/index.json", server.uri());
        let request = request(FeedType::NuGet, &feed, "Acme.Web", "1.2.3-Beta+build.9");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.extension, ".nupkg");
        assert_eq!(metadata.version.as_str(), "1.2.3-Beta+build.9");
        assert!(metadata.full_file_path.exists());
    }

    #[tokio::test]
    async fn test_v3_registration_fallback() {
        let server = MockServer::start().await;
        let index = format!(
            r#"{{"version": "3.0.0", "resources": [
                {{"@id": "{}/reg", "@type": "RegistrationsBaseUrl"}}
            ]}}"#,
            server.uri()
        );
        let registration = format!(
            r#"{{"items": [{{"@id": "{0}/reg/acme.web/page/1.0.0/2.0.0.json", "lower": "1.0.0", "upper": "2.0.0"}}]}}"#,
            server.uri()
        );
        let page = format!(
            r#"{{"items": [
                {{"catalogEntry": {{"version": "1.0.0"}}, "packageContent": "{0}/content/acme.web.1.0.0.nupkg"}},
                {{"catalogEntry": {{"version": "1.2.3"}}, "packageContent": "{0}/content/acme.web.1.2.3.nupkg"}}
            ]}}"#,
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/reg/acme.web/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(registration))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/reg/acme.web/page/1.0.0/2.0.0.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/content/acme.web.1.2.3.nupkg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(nupkg(NUSPEC)))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NuGetDownloader::new(Arc::new(services(&temp)));
        let feed = format!("{}/index.json", server.uri());
        let request = request(FeedType::NuGet, &feed, "Acme.Web", "1.2.3");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.package_id, "Acme.Web");
    }

    #[tokio::test]
    async fn test_v2_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nuget"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<service/>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nuget/package/Acme.Web/1.2.3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(nupkg(NUSPEC)))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let downloader = NuGetDownloader::new(Arc::new(services(&temp)));
        let request = request(FeedType::NuGet, &format!("{}/nuget/", server.uri()), "Acme.Web", "1.2.3");

        let metadata = downloader.download(&request).await.unwrap();
        assert!(metadata.full_file_path.exists());
    }

    #[tokio::test]
    async fn test_local_directory_feed() {
        let temp = TempDir::new().unwrap();
        let feed_dir = temp.path().join("feed/nested");
        std::fs::create_dir_all(&feed_dir).unwrap();
        std::fs::write(feed_dir.join("acme.web.1.2.3.nupkg"), nupkg(NUSPEC)).unwrap();

        let downloader = NuGetDownloader::new(Arc::new(services(&temp)));
        let feed_uri = Url::from_directory_path(temp.path().join("feed")).unwrap();
        let request = request(FeedType::NuGet, feed_uri.as_str(), "Acme.Web", "1.2.3");

        let metadata = downloader.download(&request).await.unwrap();
        assert!(metadata.full_file_path.starts_with(temp.path().join("cache")));

        let missing = request.clone();
        let missing = DownloadRequest {
            package_id: "Acme.Missing".into(),
            ..missing
        };
        let err = downloader.download(&missing).await.unwrap_err();
        assert!(matches!(err, FetchError::PackageNotFound { .. }));
    }
}

//! Docker Registry V2 / OCI distribution client
//!
//! Implements the part of the distribution API needed to acquire artifacts:
//!
//! - **API root**: `oci://`, `https://` or bare host feed URIs become
//!   `https://host/.../v2` (plain `http` for loopback hosts)
//! - **Authentication**: requests go out with Basic credentials; a `401`
//!   carrying a `Bearer` challenge is exchanged for a token at the advertised
//!   realm and the request is replayed once
//! - **Manifests**: fetched with OCI/Docker accept headers and classified as a
//!   Helm chart, a container image or unknown
//! - **Blobs**: streamed to disk by digest

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use url::{Host, Url};

use crate::credentials::FeedCredentials;
use crate::error::{FetchError, Result};
use crate::http::{Progress, stream_to_file};

/// Registry API version path segment
pub const API_VERSION_SEGMENT: &str = "v2";

/// Media types used to classify manifests
pub mod media_types {
    pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    pub const HELM_CHART_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
}

/// Layer annotation carrying the original file name
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

const REGISTRY_LABEL: &str = "Docker";

static DIGEST_HASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)[A-Za-z0-9_+.-]+:(?P<hash>[A-Fa-f0-9]+)").expect("valid regex")
});

static CHALLENGE_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<key>[A-Za-z]+)=(?:"(?P<quoted>[^"]*)"|(?P<bare>[^,\s]*))"#)
        .expect("valid regex")
});

/// Derive the versioned API root (`.../v2`) from a feed URI
pub fn api_root(feed_uri: &str) -> Result<String> {
    let trimmed = feed_uri.trim().trim_end_matches('/');
    let rest = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };

    let probe = Url::parse(&format!("https://{rest}")).map_err(|e| FetchError::InvalidFeedUrl {
        url: feed_uri.to_string(),
        reason: e.to_string(),
    })?;
    let scheme = if is_loopback(&probe) { "http" } else { "https" };

    let root = format!("{scheme}://{rest}");
    if root.ends_with(&format!("/{API_VERSION_SEGMENT}")) {
        Ok(root)
    } else {
        Ok(format!("{root}/{API_VERSION_SEGMENT}"))
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Registries reject `+` in tags; use `_` on the wire
pub fn fix_version(version: &str) -> String {
    version.replace('+', "_")
}

/// The hex part of a `<algorithm>:<hex>` digest
pub fn digest_hash(digest: &str) -> Option<String> {
    DIGEST_HASH
        .captures(digest)
        .and_then(|c| c.name("hash"))
        .map(|m| m.as_str().to_string())
}

/// What an OCI artifact turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    HelmChart,
    ContainerImage,
    Unknown,
}

/// Content descriptor inside a manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// `org.opencontainers.image.title` annotation
    pub fn title(&self) -> Option<&str> {
        self.annotations.get(TITLE_ANNOTATION).map(String::as_str)
    }

    fn media_type_contains(&self, needle: &str) -> bool {
        contains_ignore_case(self.media_type.as_deref(), needle)
    }
}

/// An image or artifact manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// `Docker-Content-Digest` response header
    #[serde(skip)]
    pub digest: Option<String>,
}

impl RegistryManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn classify(&self) -> ArtifactKind {
        let config_has = |t: &str| self.config.as_ref().is_some_and(|c| c.media_type_contains(t));
        let layers_have = |t: &str| self.layers.iter().any(|l| l.media_type_contains(t));

        if layers_have(media_types::HELM_CHART_CONTENT) || config_has(media_types::HELM_CONFIG) {
            return ArtifactKind::HelmChart;
        }

        if contains_ignore_case(self.media_type.as_deref(), media_types::DOCKER_MANIFEST_V2)
            || config_has(media_types::DOCKER_IMAGE_CONFIG)
            || config_has(media_types::OCI_IMAGE_CONFIG)
            || layers_have(media_types::DOCKER_LAYER)
        {
            return ArtifactKind::ContainerImage;
        }

        ArtifactKind::Unknown
    }

    /// The first layer, which holds the artifact for single-layer charts
    pub fn first_layer(&self) -> Option<&Descriptor> {
        self.layers.first()
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl AuthChallenge {
    /// Bearer wins over Basic when both are advertised
    fn from_response(response: &reqwest::Response) -> Option<Self> {
        let values: Vec<&str> = response
            .headers()
            .get_all(reqwest::header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();

        values
            .iter()
            .find_map(|v| Self::parse_bearer(v))
            .or_else(|| {
                values
                    .iter()
                    .any(|v| scheme_of(v).eq_ignore_ascii_case("basic"))
                    .then_some(AuthChallenge::Basic)
            })
    }

    fn parse_bearer(header: &str) -> Option<Self> {
        let header = header.trim_start();
        if !scheme_of(header).eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params: HashMap<String, String> = HashMap::new();
        for caps in CHALLENGE_PARAM.captures_iter(&header[scheme_of(header).len()..]) {
            let value = caps
                .name("quoted")
                .or_else(|| caps.name("bare"))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            params.insert(caps["key"].to_ascii_lowercase(), value);
        }

        Some(AuthChallenge::Bearer {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

fn scheme_of(header: &str) -> &str {
    header.trim_start().split_whitespace().next().unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Low-level registry client, shared by OCI chart and container downloads
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    label: &'static str,
}

impl RegistryClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            label: REGISTRY_LABEL,
        }
    }

    /// Registry name used in error messages
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// GET with Basic auth, upgrading to Bearer on a `401` challenge
    ///
    /// Maps `404` to an unsupported-action error and any other failure status
    /// to a request failure carrying the body.
    pub async fn get(
        &self,
        url: &str,
        credentials: &FeedCredentials,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let response = self.send_authenticated(url, credentials, accept).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::UnsupportedAction {
                registry: self.label.to_string(),
                url: url.to_string(),
            });
        }

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
            let body = response.text().await.ok().filter(|b| !b.trim().is_empty());
            return Err(FetchError::RequestFailed {
                registry: self.label.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                reason,
                body,
            });
        }

        Ok(response)
    }

    async fn send_authenticated(
        &self,
        url: &str,
        credentials: &FeedCredentials,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let basic = credentials.basic_header();
        let response = self.send(url, basic.as_deref(), accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let authorization = match AuthChallenge::from_response(&response) {
            Some(AuthChallenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                tracing::debug!("Registry issued a Bearer challenge for {}", url);
                let token = self
                    .fetch_token(&realm, service.as_deref(), scope.as_deref(), basic.as_deref())
                    .await?;
                Some(format!("Bearer {}", token))
            }
            Some(AuthChallenge::Basic) => basic,
            None => {
                return Err(FetchError::UnknownAuthScheme {
                    url: url.to_string(),
                });
            }
        };

        let response = self.send(url, authorization.as_deref(), accept).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.ok().filter(|b| !b.trim().is_empty());
            return Err(FetchError::AuthenticationFailed {
                url: url.to_string(),
                body,
            });
        }

        Ok(response)
    }

    async fn send(
        &self,
        url: &str,
        authorization: Option<&str>,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some(auth) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
        basic: Option<&str>,
    ) -> Result<String> {
        let mut url = Url::parse(realm).map_err(|e| FetchError::InvalidFeedUrl {
            url: realm.to_string(),
            reason: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }

        let response = self.send(url.as_str(), basic, None).await?;
        if !response.status().is_success() {
            tracing::debug!("Token request to {} failed with {}", realm, response.status());
            return Err(FetchError::TokenUnavailable);
        }

        let body: TokenResponse = response.json().await.map_err(|_| FetchError::TokenUnavailable)?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or(FetchError::TokenUnavailable)
    }

    /// Fetch and parse the manifest for `package_id` at `version`
    pub async fn manifest(
        &self,
        api_root: &str,
        package_id: &str,
        version: &str,
        credentials: &FeedCredentials,
    ) -> Result<RegistryManifest> {
        let url = format!("{}/{}/manifests/{}", api_root, package_id, fix_version(version));
        let accept = format!(
            "{}, {}",
            media_types::OCI_IMAGE_MANIFEST,
            media_types::DOCKER_MANIFEST_V2
        );

        let response = self.get(&url, credentials, Some(&accept)).await?;
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await?;
        let mut manifest = RegistryManifest::from_json(&body)?;
        manifest.digest = digest;
        Ok(manifest)
    }

    /// Classify an artifact; any failure degrades to `Unknown`
    pub async fn classify(
        &self,
        api_root: &str,
        package_id: &str,
        version: &str,
        credentials: &FeedCredentials,
    ) -> ArtifactKind {
        match self.manifest(api_root, package_id, version, credentials).await {
            Ok(manifest) => manifest.classify(),
            Err(e) => {
                tracing::debug!(
                    "Could not classify {}:{}, treating as unknown: {}",
                    package_id,
                    version,
                    e
                );
                ArtifactKind::Unknown
            }
        }
    }

    /// Stream the blob `digest` into `dest`
    ///
    /// `404` maps to an unsupported-action error as in [`Self::get`].
    pub async fn download_blob(
        &self,
        api_root: &str,
        package_id: &str,
        digest: &str,
        credentials: &FeedCredentials,
        dest: &Path,
        progress: &Progress,
    ) -> Result<u64> {
        let url = format!("{}/{}/blobs/{}", api_root, package_id, digest);
        let response = self.send_authenticated(&url, credentials, None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::UnsupportedAction {
                registry: self.label.to_string(),
                url,
            });
        }
        if !status.is_success() {
            return Err(FetchError::ArtifactDownloadFailed {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        stream_to_file(response, dest, package_id, progress).await
    }
}

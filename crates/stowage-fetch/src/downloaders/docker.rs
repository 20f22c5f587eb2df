//! Container image downloader
//!
//! Images are pulled into the container engine's own store, so the returned
//! metadata has no file path: its hash is the image digest reported by the
//! engine. Credentials reach the engine through the encrypted credential
//! helper, which is torn down whatever the outcome.

use async_trait::async_trait;
use std::sync::Arc;
use stowage_core::PackagePhysicalFileMetadata;
use tempfile::TempDir;
use url::Url;

use super::{DownloadRequest, PackageDownloader, Services};
use crate::aws::{self, AwsCredentials};
use crate::credential_helper::{self, CredentialHelper, is_docker_hub};
use crate::engine::EngineEnv;
use crate::error::{FetchError, Result};
use crate::feed::FeedType;
use crate::registry::{self, RegistryClient};

const DOCKER_HUB_API: &str = "https://registry-1.docker.io/v2";

/// Feed URI as an absolute URL; `oci://` and bare hosts become `https://`
pub(crate) fn registry_url(feed_uri: &str) -> Result<Url> {
    let trimmed = feed_uri.trim().trim_end_matches('/');
    let absolute = match trimmed.split_once("://") {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {
            trimmed.to_string()
        }
        Some((_, rest)) => format!("https://{rest}"),
        None => format!("https://{trimmed}"),
    };
    parse(&absolute, feed_uri)
}

fn parse(raw: &str, feed_uri: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| FetchError::InvalidFeedUrl {
        url: feed_uri.to_string(),
        reason: e.to_string(),
    })
}

/// Where an image lives, as the engine and the registry API see it
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImageReference {
    /// Repository as passed to the engine, without tag
    pub repository: String,
    pub tag: String,
    /// Registry API root and repository path for manifest lookups
    pub api_root: String,
    pub api_repository: String,
}

impl ImageReference {
    pub fn resolve(feed: &Url, package_id: &str, version: &str) -> Result<Self> {
        let host = feed.host_str().unwrap_or_default();
        let tag = registry::fix_version(version);

        if is_docker_hub(host) {
            let api_repository = if package_id.contains('/') {
                package_id.to_string()
            } else {
                format!("library/{package_id}")
            };
            return Ok(Self {
                repository: package_id.to_string(),
                tag,
                api_root: DOCKER_HUB_API.to_string(),
                api_repository,
            });
        }

        let authority = match feed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = feed.path().trim_matches('/');
        let repository = if path.is_empty() {
            format!("{authority}/{package_id}")
        } else {
            format!("{authority}/{path}/{package_id}")
        };

        Ok(Self {
            repository,
            tag,
            api_root: registry::api_root(feed.as_str())?,
            api_repository: package_id.to_string(),
        })
    }

    pub fn image(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

pub struct DockerImageDownloader {
    services: Arc<Services>,
    registry: RegistryClient,
}

impl DockerImageDownloader {
    pub fn new(services: Arc<Services>) -> Self {
        let registry = RegistryClient::new(services.http.clone());
        Self { services, registry }
    }

    /// Username and password to log in with, exchanging ECR keys if needed
    async fn login_credentials(&self, request: &DownloadRequest, feed: &Url) -> Result<Option<(String, String)>> {
        let credentials = &request.feed.credentials;
        if request.feed.feed_type != FeedType::AwsEcr {
            if !credentials.has_any() {
                return Ok(None);
            }
            return Ok(Some((
                credentials.username().to_string(),
                credentials.password().to_string(),
            )));
        }

        if credentials.username().is_empty() || credentials.password().is_empty() {
            return Err(FetchError::InvalidConfig {
                message: "AWS ECR feeds require an access key and secret key".to_string(),
            });
        }
        let host = feed.host_str().unwrap_or_default();
        let region = aws::ecr_region(host).ok_or_else(|| FetchError::InvalidFeedUrl {
            url: request.feed.feed_uri.clone(),
            reason: "not an ECR registry host".to_string(),
        })?;

        let login = aws::ecr_login(
            &self.services.http,
            &AwsCredentials::new(credentials.username(), credentials.password()),
            region,
            self.services.config.ecr_endpoint.as_deref(),
        )
        .await?;
        Ok(Some((login.username, login.password)))
    }

    /// Log an informational note when the image does not look cached
    ///
    /// Never fails: any error means the image is assumed to be cached.
    async fn note_if_not_cached(&self, request: &DownloadRequest, reference: &ImageReference, env: &EngineEnv) {
        let engine = &self.services.engine;
        let local = match engine.local_digests(&reference.repository, env).await {
            Ok(local) => local,
            Err(e) => {
                tracing::debug!("Could not list local images, assuming cached: {}", e);
                return;
            }
        };

        let cached = if local.is_empty() {
            false
        } else {
            match self
                .registry
                .manifest(
                    &reference.api_root,
                    &reference.api_repository,
                    &reference.tag,
                    &request.feed.credentials,
                )
                .await
            {
                Ok(manifest) => match manifest.digest {
                    Some(digest) => local.iter().any(|d| d.eq_ignore_ascii_case(&digest)),
                    None => true,
                },
                Err(e) => {
                    tracing::debug!("Could not fetch manifest digest, assuming cached: {}", e);
                    true
                }
            }
        };

        if !cached {
            tracing::info!(
                "The docker image '{}' may not be cached. Please note images that have not been cached may take longer to be acquired than expected.",
                reference.image()
            );
        }
    }

    async fn pull(
        &self,
        request: &DownloadRequest,
        reference: &ImageReference,
        login: Option<&(String, String)>,
        env: &EngineEnv,
        server: &str,
    ) -> Result<PackagePhysicalFileMetadata> {
        let engine = &self.services.engine;
        if let Some((username, password)) = login {
            engine.login(server, username, password, env).await?;
        }

        self.note_if_not_cached(request, reference, env).await;

        let image = reference.image();
        let image_ref = image.as_str();
        request
            .retry
            .execute(
                move || async move { engine.pull(image_ref, env).await },
                |e: &FetchError| matches!(e, FetchError::ContainerEngine { .. }) || e.is_transient(),
            )
            .await?;

        let details = engine.inspect(&image, env).await?;
        tracing::info!("Pulled image {} ({})", image, details.digest);
        Ok(PackagePhysicalFileMetadata::for_image(
            request.package_id.clone(),
            request.version.clone(),
            details.digest,
            details.size,
        ))
    }
}

#[async_trait]
impl PackageDownloader for DockerImageDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PackagePhysicalFileMetadata> {
        let feed = registry_url(&request.feed.feed_uri)?;
        let reference = ImageReference::resolve(&feed, &request.package_id, request.version.as_str())?;
        tracing::info!(
            "Downloading Docker image {} from feed: '{}'",
            reference.image(),
            request.feed.feed_uri
        );

        let login = self.login_credentials(request, &feed).await?;

        let scratch = TempDir::new()?;
        let docker_config = scratch.path().join("docker");
        std::fs::create_dir_all(&docker_config)?;
        let mut env = EngineEnv {
            docker_config: Some(docker_config.clone()),
            ..Default::default()
        };

        let helper = match (&login, self.services.config.use_credential_helper) {
            (Some((username, password)), true) => {
                let encryption_password = credential_helper::encryption_password(&self.services.variables);
                let helper = CredentialHelper::new(&docker_config, encryption_password.clone());
                env.path_prefix = Some(helper.setup(&feed, username, password)?);
                env.vars
                    .push((credential_helper::PASSWORD_ENV.to_string(), encryption_password));
                if std::env::var_os(credential_helper::EXECUTABLE_ENV).is_none() {
                    if let Ok(exe) = std::env::current_exe() {
                        env.vars.push((
                            credential_helper::EXECUTABLE_ENV.to_string(),
                            exe.to_string_lossy().to_string(),
                        ));
                    }
                }
                Some(helper)
            }
            _ => None,
        };

        let server = credential_helper::server_url_for(&feed);
        let result = self.pull(request, &reference, login.as_ref(), &env, &server).await;

        if let Some(helper) = helper {
            helper.cleanup();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeEngine, request, services, services_with};
    use super::*;
    use crate::credentials::FeedCredentials;
    use base64::Engine;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_registry_url() {
        assert_eq!(registry_url("oci://registry.example.com/").unwrap().as_str(), "https://registry.example.com/");
        assert_eq!(registry_url("registry.example.com:5000").unwrap().as_str(), "https://registry.example.com:5000/");
        assert_eq!(registry_url("http://127.0.0.1:5000").unwrap().as_str(), "http://127.0.0.1:5000/");
    }

    #[test]
    fn test_image_reference() {
        let hub = ImageReference::resolve(&registry_url("https://index.docker.io").unwrap(), "nginx", "1.25").unwrap();
        assert_eq!(hub.image(), "nginx:1.25");
        assert_eq!(hub.api_root, "https://registry-1.docker.io/v2");
        assert_eq!(hub.api_repository, "library/nginx");

        let private = ImageReference::resolve(
            &registry_url("https://registry.example.com:5000/team").unwrap(),
            "api",
            "2.0.0+build.7",
        )
        .unwrap();
        assert_eq!(private.image(), "registry.example.com:5000/team/api:2.0.0_build.7");
        assert_eq!(private.api_root, "https://registry.example.com:5000/team/v2");
    }

    #[tokio::test]
    async fn test_pull_with_credential_helper_and_retry() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new("sha256:feedface", 7_048_192));
        *engine.fail_pulls.lock().unwrap() = 1;
        let downloader = DockerImageDownloader::new(Arc::new(services_with(&temp, engine.clone())));

        let mut request = request(FeedType::Docker, "https://registry.example.com", "api", "2.0.0");
        request.feed.credentials = FeedCredentials::basic("robot", "hunter2");

        let metadata = downloader.download(&request).await.unwrap();
        assert_eq!(metadata.hash, "sha256:feedface");
        assert_eq!(metadata.size, 7_048_192);
        assert!(metadata.full_file_path.as_os_str().is_empty());

        assert_eq!(
            engine.calls(),
            vec![
                "login https://registry.example.com robot",
                "images registry.example.com/api",
                "pull registry.example.com/api:2.0.0",
                "pull registry.example.com/api:2.0.0",
                "inspect registry.example.com/api:2.0.0",
            ]
        );
    }

    #[tokio::test]
    async fn test_anonymous_pull_skips_login() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new("sha256:1", 1));
        let downloader = DockerImageDownloader::new(Arc::new(services_with(&temp, engine.clone())));

        downloader
            .download(&request(FeedType::Docker, "https://index.docker.io", "nginx", "1.25"))
            .await
            .unwrap();
        assert!(!engine.calls().iter().any(|c| c.starts_with("login")));
        assert!(engine.calls().contains(&"pull nginx:1.25".to_string()));
    }

    #[tokio::test]
    async fn test_advisory_check_compares_registry_digest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/api/manifests/3.0.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Docker-Content-Digest", "sha256:new")
                    .set_body_string(r#"{"schemaVersion":2,"config":{"mediaType":"application/vnd.docker.container.image.v1+json","digest":"sha256:c","size":1},"layers":[]}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let mut engine = FakeEngine::new("sha256:new", 10);
        engine.local = vec!["sha256:old".to_string()];
        let engine = Arc::new(engine);
        let downloader = DockerImageDownloader::new(Arc::new(services_with(&temp, engine.clone())));

        let metadata = downloader
            .download(&request(FeedType::Docker, &server.uri(), "api", "3.0.0"))
            .await
            .unwrap();
        assert_eq!(metadata.hash, "sha256:new");
    }

    #[tokio::test]
    async fn test_ecr_exchanges_keys_for_login() {
        let server = MockServer::start().await;
        let token = base64::engine::general_purpose::STANDARD.encode("AWS:ecr-secret");
        Mock::given(method("POST"))
            .and(header(
                "x-amz-target",
                "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorizationData": [{"authorizationToken": token}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new("sha256:ecr", 5));
        let mut services = services_with(&temp, engine.clone());
        services.config.ecr_endpoint = Some(server.uri());
        let downloader = DockerImageDownloader::new(Arc::new(services));

        let mut request = request(
            FeedType::AwsEcr,
            "https://123456789012.dkr.ecr.eu-west-2.amazonaws.com",
            "payments",
            "1.4.2",
        );
        request.feed.credentials = FeedCredentials::basic("AKIDEXAMPLE", "secret");

        downloader.download(&request).await.unwrap();
        assert_eq!(
            engine.calls().first().unwrap(),
            "login https://123456789012.dkr.ecr.eu-west-2.amazonaws.com AWS"
        );
    }

    #[tokio::test]
    async fn test_ecr_requires_keys() {
        let temp = TempDir::new().unwrap();
        let downloader = DockerImageDownloader::new(Arc::new(services(&temp)));
        let err = downloader
            .download(&request(
                FeedType::AwsEcr,
                "https://123456789012.dkr.ecr.eu-west-2.amazonaws.com",
                "payments",
                "1.4.2",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidConfig { .. }));
    }
}

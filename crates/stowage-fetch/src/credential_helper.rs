//! Encrypted credential store for container engines
//!
//! Registry passwords are handed to the container engine through its
//! credential-helper protocol rather than command-line arguments or its own
//! plaintext config file:
//!
//! 1. credentials are encrypted into `<docker config>/credentials/<name>.cred`
//! 2. `config.json` maps the registry host(s) to the `stowage` helper
//! 3. a `docker-credential-stowage` script re-invokes this binary's
//!    `credential-helper` subcommand, which decrypts on demand
//! 4. the credentials directory is removed once the pull finishes
//!
//! Files are AES-256-GCM encrypted with a key derived from a deployment
//! password. The 12-byte nonce is stored in front of the ciphertext.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use stowage_core::Variables;
use stowage_core::variables::known;
use url::Url;

use crate::error::{FetchError, Result};

/// Name the engine appends to `docker-credential-`
pub const HELPER_NAME: &str = "stowage";

/// Subdirectory of the docker config directory holding encrypted files
pub const CREDENTIALS_DIR: &str = "credentials";

/// Server URL the engine uses for Docker Hub
pub const DOCKER_HUB_SERVER_URL: &str = "https://index.docker.io/v1/";

/// Host names Docker Hub is known by
pub const DOCKER_HUB_HOSTS: [&str; 3] = ["index.docker.io", "docker.io", "registry-1.docker.io"];

/// Environment variable carrying the encryption password to the helper
pub const PASSWORD_ENV: &str = "STOWAGE_CREDENTIAL_PASSWORD";

/// Environment variable naming the executable the helper script runs
pub const EXECUTABLE_ENV: &str = "STOWAGE_EXECUTABLE";

/// Used when no deployment password is available. Known weak: anyone with
/// this source can decrypt files written with it.
pub const FALLBACK_PASSWORD: &str = "StowageDefaultCredentialPassword";

const NONCE_BYTES: usize = 12;

/// Wire format of the credential-helper protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(rename = "ServerURL", default)]
    pub server_url: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Secret")]
    pub secret: String,
}

/// `config.json` written for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub cred_helpers: IndexMap<String, String>,
}

/// Pick the encryption password from the deployment variables
pub fn encryption_password(variables: &Variables) -> String {
    match variables.first_of(&[
        known::DOWNLOAD_ON_TARGET_PASSWORD,
        known::SENSITIVE_VARIABLES_PASSWORD,
    ]) {
        Some(password) => password.to_string(),
        None => {
            tracing::warn!(
                "No sensitive variables password is set; container registry credentials are encrypted with a built-in fallback password"
            );
            FALLBACK_PASSWORD.to_string()
        }
    }
}

/// Registry key a server URL is stored under: no scheme, no trailing `/`
///
/// The engine asks about `host:port` for most registries but passes a full
/// URL for Docker Hub, so both spellings must land on the same file.
pub fn credential_key(server_url: &str) -> &str {
    let trimmed = server_url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/')
}

/// URL-safe, reversible file name for a server URL
pub fn credential_file_name(server_url: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(credential_key(server_url).as_bytes())
        .replace('/', "_")
        .replace('+', "-")
        .replace('=', "");
    format!("{}.cred", encoded)
}

pub fn is_docker_hub(host: &str) -> bool {
    DOCKER_HUB_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Server URL the engine will ask the helper about
pub fn server_url_for(feed_uri: &Url) -> String {
    let host = feed_uri.host_str().unwrap_or_default();
    if is_docker_hub(host) {
        return DOCKER_HUB_SERVER_URL.to_string();
    }
    match feed_uri.port() {
        Some(port) => format!("{}://{}:{}", feed_uri.scheme(), host, port),
        None => format!("{}://{}", feed_uri.scheme(), host),
    }
}

/// `credHelpers` entries for a feed
pub fn cred_helpers_for(feed_uri: &Url) -> IndexMap<String, String> {
    let mut helpers = IndexMap::new();
    let host = feed_uri.host_str().unwrap_or_default();
    if is_docker_hub(host) {
        for alias in DOCKER_HUB_HOSTS {
            helpers.insert(alias.to_string(), HELPER_NAME.to_string());
        }
    } else {
        helpers.insert(host.to_string(), HELPER_NAME.to_string());
        if let Some(port) = feed_uri.port() {
            helpers.insert(format!("{}:{}", host, port), HELPER_NAME.to_string());
        }
    }
    helpers
}

fn cipher_for(password: &str) -> Result<Aes256Gcm> {
    let key = Sha256::digest(password.as_bytes());
    Aes256Gcm::new_from_slice(&key).map_err(|_| FetchError::CredentialHelper {
        message: "invalid encryption key".to_string(),
    })
}

/// Encrypt `plaintext`, returning nonce followed by ciphertext
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let cipher = cipher_for(password)?;
    let mut nonce_bytes = [0u8; NONCE_BYTES];
    rand::rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| FetchError::CredentialHelper {
            message: "encryption failed".to_string(),
        })?;

    let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    if data.len() < NONCE_BYTES {
        return Err(FetchError::CredentialHelper {
            message: "credential file is truncated".to_string(),
        });
    }
    let (nonce, ciphertext) = data.split_at(NONCE_BYTES);
    cipher_for(password)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| FetchError::CredentialHelper {
            message: "decryption failed".to_string(),
        })
}

/// Credential store scoped to one docker config directory
#[derive(Debug, Clone)]
pub struct CredentialHelper {
    docker_config: PathBuf,
    encryption_password: String,
}

impl CredentialHelper {
    pub fn new(docker_config: impl Into<PathBuf>, encryption_password: impl Into<String>) -> Self {
        Self {
            docker_config: docker_config.into(),
            encryption_password: encryption_password.into(),
        }
    }

    pub fn docker_config(&self) -> &Path {
        &self.docker_config
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.docker_config.join(CREDENTIALS_DIR)
    }

    fn credential_path(&self, server_url: &str) -> PathBuf {
        self.credentials_dir().join(credential_file_name(server_url))
    }

    pub fn store(&self, server_url: &str, username: &str, secret: &str) -> Result<()> {
        let dir = self.credentials_dir();
        std::fs::create_dir_all(&dir)?;

        let credential = StoredCredential {
            server_url: server_url.to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
        };
        let json = serde_json::to_vec(&credential)?;
        let encrypted = encrypt(&json, &self.encryption_password)?;

        let path = self.credential_path(server_url);
        std::fs::write(&path, encrypted)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        tracing::debug!("Stored encrypted credentials for {}", server_url);
        Ok(())
    }

    /// `None` when nothing is stored or the file cannot be decrypted
    pub fn get(&self, server_url: &str) -> Option<StoredCredential> {
        let path = self.credential_path(server_url);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(_) => {
                tracing::debug!("No stored credentials found for {}", server_url);
                return None;
            }
        };

        let decoded = decrypt(&data, &self.encryption_password)
            .and_then(|json| Ok(serde_json::from_slice::<StoredCredential>(&json)?));
        match decoded {
            Ok(mut credential) => {
                credential.server_url = server_url.to_string();
                tracing::debug!("Retrieved credentials for {}", server_url);
                Some(credential)
            }
            Err(e) => {
                tracing::debug!("Failed to decrypt credentials for {}: {}", server_url, e);
                None
            }
        }
    }

    pub fn erase(&self, server_url: &str) -> Result<()> {
        let path = self.credential_path(server_url);
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::debug!("Erased credentials for {}", server_url);
        }
        Ok(())
    }

    /// Write `config.json` routing the feed's hosts to the helper
    pub fn create_registry_config(&self, feed_uri: &Url) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.docker_config)?;
        let config = RegistryConfig {
            cred_helpers: cred_helpers_for(feed_uri),
        };
        let path = self.docker_config.join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }

    /// Write the `docker-credential-stowage` script, returning its directory
    pub fn install_helper_script(&self) -> Result<PathBuf> {
        let dir = self.docker_config.join("bin");
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.join(format!("docker-credential-{}", HELPER_NAME));
            let script = format!(
                "#!/bin/sh\nexec \"${{{}:-stowage}}\" credential-helper \"$@\"\n",
                EXECUTABLE_ENV
            );
            std::fs::write(&path, script)?;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms)?;
        }

        #[cfg(windows)]
        {
            let path = dir.join(format!("docker-credential-{}.cmd", HELPER_NAME));
            let script = format!(
                "@echo off\r\nif \"%{0}%\"==\"\" (set {0}=stowage)\r\n\"%{0}%\" credential-helper %*\r\n",
                EXECUTABLE_ENV
            );
            std::fs::write(&path, script)?;
        }

        Ok(dir)
    }

    /// Store credentials and write everything the engine needs to find them
    ///
    /// Returns the helper script directory to prepend to `PATH`.
    pub fn setup(&self, feed_uri: &Url, username: &str, secret: &str) -> Result<PathBuf> {
        let script_dir = self.install_helper_script()?;
        let server_url = server_url_for(feed_uri);
        self.store(&server_url, username, secret)?;
        self.create_registry_config(feed_uri)?;
        tracing::debug!("Configured container credential helper for {}", server_url);
        Ok(script_dir)
    }

    /// Remove every stored credential; failures are logged, never returned
    pub fn cleanup(&self) {
        let dir = self.credentials_dir();
        if !dir.exists() {
            return;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!("Cleaned up container credential files"),
            Err(e) => tracing::warn!("Failed to clean up credential files: {}", e),
        }
    }
}

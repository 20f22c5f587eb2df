//! AWS request signing and ECR credential exchange
//!
//! Only what acquisition needs: Signature Version 4 for S3-compatible object
//! stores (S3 itself, and GCS through HMAC interoperability keys) and the ECR
//! `GetAuthorizationToken` call that turns an access key into a registry login.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{FetchError, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SHA-256 of an empty payload
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const ECR_TARGET: &str = "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";

/// Access key pair used to sign requests
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl AwsCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

/// Percent-encode everything except RFC 3986 unreserved characters
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derived key for one day, region and service
pub fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, service);
    hmac(&k_service, "aws4_request")
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signature V4 signer for one region and service
#[derive(Debug, Clone)]
pub struct SigV4 {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl SigV4 {
    pub fn new(credentials: AwsCredentials, region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    /// Headers to add to a request, `Authorization` included
    ///
    /// `extra` headers are signed too. `host` and `x-amz-date` are always
    /// signed.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        extra: &[(&str, &str)],
        payload_sha256: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host_header(url)),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(
            extra
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string())),
        );
        headers.sort();

        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let path = if url.path().is_empty() { "/" } else { url.path() };
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            path,
            canonical_query(url),
            canonical_headers,
            signed_headers,
            payload_sha256
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let key = signing_key(&self.credentials.secret_key, &date, &self.region, &self.service);
        let signature = hex::encode(hmac(&key, &string_to_sign));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.credentials.access_key, scope, signed_headers, signature
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    /// Apply signed headers to a request builder
    pub fn apply(
        &self,
        mut builder: reqwest::RequestBuilder,
        method: &str,
        url: &Url,
        extra: &[(&str, &str)],
        payload_sha256: &str,
    ) -> reqwest::RequestBuilder {
        for (name, value) in self.sign(method, url, extra, payload_sha256, Utc::now()) {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationTokenResponse {
    #[serde(default)]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
    #[serde(default)]
    proxy_endpoint: Option<String>,
}

/// Registry login produced by an ECR token exchange
#[derive(Clone)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
    pub proxy_endpoint: Option<String>,
}

impl std::fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("username", &self.username)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .finish_non_exhaustive()
    }
}

/// Region of an ECR registry host such as `123.dkr.ecr.eu-west-2.amazonaws.com`
pub fn ecr_region(registry_host: &str) -> Option<&str> {
    let mut labels = registry_host.split('.');
    while let Some(label) = labels.next() {
        if label == "ecr" {
            return labels.next().filter(|r| !r.is_empty());
        }
    }
    None
}

/// Exchange an access key for an ECR registry password
///
/// `endpoint` defaults to `https://api.ecr.<region>.amazonaws.com/`.
pub async fn ecr_login(
    http: &reqwest::Client,
    credentials: &AwsCredentials,
    region: &str,
    endpoint: Option<&str>,
) -> Result<RegistryLogin> {
    let endpoint = endpoint
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://api.ecr.{region}.amazonaws.com/"));
    let url = Url::parse(&endpoint).map_err(|e| FetchError::InvalidFeedUrl {
        url: endpoint.clone(),
        reason: e.to_string(),
    })?;

    let body = "{}";
    let signer = SigV4::new(credentials.clone(), region, "ecr");
    let extra = [
        ("content-type", "application/x-amz-json-1.1"),
        ("x-amz-target", ECR_TARGET),
    ];
    let request = signer.apply(
        http.post(url.clone()).body(body),
        "POST",
        &url,
        &extra,
        &sha256_hex(body.as_bytes()),
    );

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(FetchError::AuthenticationFailed {
            url: endpoint,
            body: Some(format!("ECR GetAuthorizationToken failed with {}: {}", status, text.trim())),
        });
    }

    let token: AuthorizationTokenResponse = response.json().await?;
    let data = token
        .authorization_data
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::AuthenticationFailed {
            url: endpoint.clone(),
            body: Some("ECR returned no authorization data".to_string()),
        })?;

    let decoded = STANDARD
        .decode(data.authorization_token.trim())
        .map_err(|e| FetchError::Serialization(format!("Invalid ECR token: {}", e)))?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| FetchError::Serialization("Invalid ECR token: missing separator".to_string()))?;

    tracing::debug!("Obtained ECR authorization token for region {}", region);
    Ok(RegistryLogin {
        username: username.to_string(),
        password: password.to_string(),
        proxy_endpoint: data.proxy_endpoint,
    })
}

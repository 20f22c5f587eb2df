//! Error types for package acquisition

use stowage_core::CoreError;
use thiserror::Error;

/// Package acquisition errors
#[derive(Debug, Error)]
pub enum FetchError {
    // ============ Configuration Errors ============
    #[error("Unsupported feed type: {feed_type}")]
    UnsupportedFeedType { feed_type: String },

    #[error("{message}")]
    InvalidPackageId { message: String },

    #[error("Invalid feed URL: {url} - {reason}")]
    InvalidFeedUrl { url: String, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timeout: {message}")]
    Timeout { message: String },

    // ============ Registry Errors ============
    #[error("Authorization to `{url}` failed.{}", body_suffix(.body))]
    AuthenticationFailed { url: String, body: Option<String> },

    #[error("{registry} registry located at `{url}` does not support this action.")]
    UnsupportedAction { registry: String, url: String },

    #[error(
        "Request to {registry} registry located at `{url}` failed with {status}:{reason}.{}",
        body_suffix(.body)
    )]
    RequestFailed {
        registry: String,
        url: String,
        status: u16,
        reason: String,
        body: Option<String>,
    },

    #[error("Unknown Authentication scheme for Uri `{url}`")]
    UnknownAuthScheme { url: String },

    #[error("Unable to retrieve authentication token required to perform operation.")]
    TokenUnavailable,

    #[error("Failed to download artifact (Status Code {status}). Reason: {reason}")]
    ArtifactDownloadFailed { status: u16, reason: String },

    #[error(
        "GitHub request rate limit has been hit. Try operation again in {seconds} seconds. Unauthenticated users can perform 60 HTTP requests to GitHub per hour per IP address. Provide credentials to increase this limit."
    )]
    RateLimited { seconds: i64 },

    // ============ Resolution Errors ============
    #[error("Unable to find package {package_id} v{version} from feed: '{feed}'")]
    PackageNotFound {
        package_id: String,
        version: String,
        feed: String,
    },

    #[error("{message}")]
    Ambiguous { message: String },

    #[error("{message}")]
    ResolutionFailed { message: String },

    #[error("Unable to download package {package_id} {version}: {message}")]
    DownloadFailed {
        package_id: String,
        version: String,
        message: String,
    },

    // ============ Container Errors ============
    #[error("{message}")]
    ContainerEngine { message: String },

    #[error("Credential helper error: {message}")]
    CredentialHelper { message: String },

    // ============ Cache Errors ============
    #[error("Cache error: {message}")]
    CacheError { message: String },

    // ============ IO Errors ============
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ============ Other ============
    #[error("{0}")]
    Other(String),
}

fn body_suffix(body: &Option<String>) -> String {
    match body.as_deref().map(str::trim) {
        Some(b) if !b.is_empty() => format!("\n{b}"),
        _ => String::new(),
    }
}

impl FetchError {
    /// Whether retrying the same request could succeed
    ///
    /// Connection problems, timeouts, local I/O failures and 5xx/408/429
    /// responses are transient. Everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::NetworkError { .. } | FetchError::Timeout { .. } | FetchError::Io(_) => true,
            FetchError::HttpError { status, .. }
            | FetchError::RequestFailed { status, .. }
            | FetchError::ArtifactDownloadFailed { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Result type for acquisition operations
pub type Result<T> = std::result::Result<T, FetchError>;

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout {
                message: e.to_string(),
            }
        } else if e.is_connect() {
            FetchError::NetworkError {
                message: format!("Connection failed: {}", e),
            }
        } else if let Some(status) = e.status() {
            FetchError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            FetchError::NetworkError {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_yaml::Error> for FetchError {
    fn from(e: serde_yaml::Error) -> Self {
        FetchError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Serialization(e.to_string())
    }
}

impl From<quick_xml::DeError> for FetchError {
    fn from(e: quick_xml::DeError) -> Self {
        FetchError::Serialization(e.to_string())
    }
}

impl From<semver::Error> for FetchError {
    fn from(e: semver::Error) -> Self {
        FetchError::Core(CoreError::Semver(e))
    }
}

impl From<url::ParseError> for FetchError {
    fn from(e: url::ParseError) -> Self {
        FetchError::InvalidFeedUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}

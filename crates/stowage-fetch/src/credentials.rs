//! Feed credentials and the shared HTTP client
//!
//! Feeds take an optional username and password. How they are presented
//! depends on the protocol: most feeds use Basic, npm sends a lone password as
//! a Bearer token and GitHub uses its `token` scheme.

use base64::Engine;
use std::fmt;

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};

/// Username/password pair supplied with a feed
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FeedCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FeedCredentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            username: username.filter(|u| !u.trim().is_empty()),
            password: password.filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Some(username.into()), Some(password.into()))
    }

    /// No credentials (public feed)
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }

    /// Whether a username or a password is present
    pub fn has_any(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }

    /// `Basic base64(user:pass)`, only when something is set
    pub fn basic_header(&self) -> Option<String> {
        if !self.has_any() {
            return None;
        }
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username(), self.password()));
        Some(format!("Basic {}", encoded))
    }

    /// A password without a username is a bearer token; otherwise Basic
    pub fn bearer_or_basic_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (None, Some(token)) => Some(format!("Bearer {}", token)),
            _ => self.basic_header(),
        }
    }
}

/// Build the HTTP client shared by every downloader
///
/// Redirects are followed by reqwest; it drops the `Authorization` header
/// when a redirect leaves the original host.
pub fn build_http_client(config: &FetchConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.http_timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| FetchError::NetworkError {
            message: e.to_string(),
        })
}

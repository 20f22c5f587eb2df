//! Deployment variables consulted by downloaders
//!
//! The surrounding deployment tool owns variable evaluation. Downloaders only
//! read a handful of well-known names, so this is a flat, case-insensitive
//! string map.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Well-known variable names
pub mod known {
    /// Password protecting sensitive values for the current deployment target
    pub const DOWNLOAD_ON_TARGET_PASSWORD: &str = "Stowage.Action.Package.DownloadOnTarget";
    /// Password protecting the deployment's sensitive variables
    pub const SENSITIVE_VARIABLES_PASSWORD: &str = "SensitiveVariablesPassword";
    /// Repository searched by generic artifact registry feeds
    pub const ARTIFACTORY_REPOSITORY: &str = "ArtifactoryGenericFeed.Repository";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(IndexMap<String, String>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Value of `name`, ignoring case; blank values count as unset
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// First set value among `names`
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|n| self.get(n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

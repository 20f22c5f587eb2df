//! Feed types and descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use stowage_core::VersionFormat;

use crate::credentials::FeedCredentials;
use crate::error::FetchError;

/// Every kind of feed a package can be acquired from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedType {
    #[serde(rename = "nuget")]
    NuGet,
    Maven,
    Npm,
    #[serde(rename = "github")]
    GitHub,
    Helm,
    S3,
    Gcs,
    Artifactory,
    Docker,
    AwsEcr,
    /// Chart or image, unknown until the manifest is inspected
    Oci,
}

impl FeedType {
    pub const ALL: [FeedType; 11] = [
        FeedType::NuGet,
        FeedType::Maven,
        FeedType::Npm,
        FeedType::GitHub,
        FeedType::Helm,
        FeedType::S3,
        FeedType::Gcs,
        FeedType::Artifactory,
        FeedType::Docker,
        FeedType::AwsEcr,
        FeedType::Oci,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeedType::NuGet => "nuget",
            FeedType::Maven => "maven",
            FeedType::Npm => "npm",
            FeedType::GitHub => "github",
            FeedType::Helm => "helm",
            FeedType::S3 => "s3",
            FeedType::Gcs => "gcs",
            FeedType::Artifactory => "artifactory",
            FeedType::Docker => "docker",
            FeedType::AwsEcr => "aws-ecr",
            FeedType::Oci => "oci",
        }
    }

    /// Version format used to parse versions for this feed
    pub fn default_version_format(self) -> VersionFormat {
        match self {
            FeedType::Maven => VersionFormat::Maven,
            FeedType::Docker | FeedType::AwsEcr | FeedType::Oci => VersionFormat::Docker,
            _ => VersionFormat::Semver,
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        FeedType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| FetchError::UnsupportedFeedType {
                feed_type: s.to_string(),
            })
    }
}

/// Where a package comes from
#[derive(Debug, Clone)]
pub struct FeedDescriptor {
    /// Also the cache namespace for everything downloaded from this feed
    pub feed_id: String,
    pub feed_uri: String,
    pub feed_type: FeedType,
    pub credentials: FeedCredentials,
}

impl FeedDescriptor {
    pub fn new(feed_id: impl Into<String>, feed_uri: impl Into<String>, feed_type: FeedType) -> Self {
        Self {
            feed_id: feed_id.into(),
            feed_uri: feed_uri.into(),
            feed_type,
            credentials: FeedCredentials::anonymous(),
        }
    }

    pub fn with_credentials(mut self, credentials: FeedCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Feed URI without a trailing slash
    pub fn base_uri(&self) -> &str {
        self.feed_uri.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feed_types() {
        assert_eq!("nuget".parse::<FeedType>().unwrap(), FeedType::NuGet);
        assert_eq!("AWS_ECR".parse::<FeedType>().unwrap(), FeedType::AwsEcr);
        assert_eq!("GitHub".parse::<FeedType>().unwrap(), FeedType::GitHub);
        assert!(matches!(
            "svn".parse::<FeedType>(),
            Err(FetchError::UnsupportedFeedType { .. })
        ));
    }

    #[test]
    fn test_display_roundtrips() {
        for feed_type in FeedType::ALL {
            assert_eq!(feed_type.to_string().parse::<FeedType>().unwrap(), feed_type);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&FeedType::AwsEcr).unwrap();
        assert_eq!(json, "\"aws-ecr\"");
        let parsed: FeedType = serde_json::from_str("\"nuget\"").unwrap();
        assert_eq!(parsed, FeedType::NuGet);
    }

    #[test]
    fn test_version_formats() {
        assert_eq!(FeedType::Maven.default_version_format(), VersionFormat::Maven);
        assert_eq!(FeedType::Oci.default_version_format(), VersionFormat::Docker);
        assert_eq!(FeedType::Npm.default_version_format(), VersionFormat::Semver);
    }
}

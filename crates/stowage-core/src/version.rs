//! Package versions with exact and semantic matching
//!
//! A [`PackageVersion`] keeps the string it was created from. Two versions can
//! match in two independent ways:
//!
//! - **exactly**: the strings are equal ignoring ASCII case
//! - **semantically**: the strings normalize to the same value under the
//!   rules of the version's [`VersionFormat`]
//!
//! Ecosystems disagree on normalization (build metadata, trailing zeros,
//! qualifier aliases), so cache lookups accept either kind of match.

use semver::{BuildMetadata, Prerelease};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::{CoreError, Result};

/// How a version string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionFormat {
    /// Semantic versions, with NuGet-style 4-part releases allowed
    #[default]
    Semver,
    /// Maven versions (`1.0`, `2.3-SNAPSHOT`, `1.0.0.Final`)
    Maven,
    /// Container image tags
    Docker,
    /// Opaque strings compared without normalization
    Lexicographic,
}

impl VersionFormat {
    /// Single-letter code used in cached file names
    pub const fn prefix(self) -> char {
        match self {
            Self::Semver => 'S',
            Self::Maven => 'M',
            Self::Docker => 'D',
            Self::Lexicographic => 'L',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'S' => Some(Self::Semver),
            'M' => Some(Self::Maven),
            'D' => Some(Self::Docker),
            'L' => Some(Self::Lexicographic),
            _ => None,
        }
    }
}

impl fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Semver => "semver",
            Self::Maven => "maven",
            Self::Docker => "docker",
            Self::Lexicographic => "lexicographic",
        };
        f.write_str(name)
    }
}

/// A parsed, immutable package version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageVersion {
    raw: String,
    format: VersionFormat,
}

impl PackageVersion {
    /// Parse a version in the given format
    pub fn parse(raw: &str, format: VersionFormat) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidVersion {
                version: raw.to_string(),
                message: "version is empty".to_string(),
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidVersion {
                version: raw.to_string(),
                message: "version contains whitespace".to_string(),
            });
        }
        if format == VersionFormat::Semver && SemverKey::parse(trimmed).is_none() {
            return Err(CoreError::InvalidVersion {
                version: raw.to_string(),
                message: "not a semantic version".to_string(),
            });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            format,
        })
    }

    pub fn semver(raw: &str) -> Result<Self> {
        Self::parse(raw, VersionFormat::Semver)
    }

    pub fn maven(raw: &str) -> Result<Self> {
        Self::parse(raw, VersionFormat::Maven)
    }

    pub fn docker(raw: &str) -> Result<Self> {
        Self::parse(raw, VersionFormat::Docker)
    }

    /// The original version string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn format(&self) -> VersionFormat {
        self.format
    }

    /// Maven snapshot versions resolve through repository metadata
    pub fn is_snapshot(&self) -> bool {
        self.raw.to_ascii_uppercase().ends_with("-SNAPSHOT")
    }

    /// Case-insensitive string equality
    pub fn matches_exactly(&self, other: &PackageVersion) -> bool {
        self.raw.eq_ignore_ascii_case(&other.raw)
    }

    /// Equality after normalizing both strings with this version's format rules
    pub fn semantically_equals(&self, other: &PackageVersion) -> bool {
        match self.format {
            VersionFormat::Semver => match (SemverKey::parse(&self.raw), SemverKey::parse(&other.raw)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            VersionFormat::Maven => maven_tokens(&self.raw) == maven_tokens(&other.raw),
            VersionFormat::Docker | VersionFormat::Lexicographic => self.matches_exactly(other),
        }
    }

    /// Either kind of match
    pub fn matches(&self, other: &PackageVersion) -> bool {
        self.matches_exactly(other) || self.semantically_equals(other)
    }

    /// The semantic-version view of this version, ignoring build metadata
    pub fn to_semver(&self) -> Option<semver::Version> {
        SemverKey::parse(&self.raw).map(|k| k.version)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Normalized semantic version: release numbers, lower-cased pre-release,
/// no build metadata. A fourth release number is kept as `revision`.
#[derive(Debug, PartialEq, Eq)]
struct SemverKey {
    version: semver::Version,
    revision: u64,
}

impl SemverKey {
    fn parse(raw: &str) -> Option<Self> {
        let without_build = raw.split_once('+').map_or(raw, |(v, _)| v);
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() || parts.len() > 4 {
            return None;
        }

        let pre = match pre {
            Some(p) => Prerelease::new(&p.to_ascii_lowercase()).ok()?,
            None => Prerelease::EMPTY,
        };

        let part = |i: usize| parts.get(i).copied().unwrap_or(0);
        Some(Self {
            version: semver::Version {
                major: part(0),
                minor: part(1),
                patch: part(2),
                pre,
                build: BuildMetadata::EMPTY,
            },
            revision: part(3),
        })
    }
}

fn maven_tokens(raw: &str) -> Vec<String> {
    let mut tokens: Vec<String> = raw
        .to_ascii_lowercase()
        .split(['.', '-'])
        .filter(|t| !t.is_empty() && !matches!(*t, "ga" | "final" | "release"))
        .map(|t| {
            if t.bytes().all(|b| b.is_ascii_digit()) {
                let stripped = t.trim_start_matches('0');
                if stripped.is_empty() { "0".to_string() } else { stripped.to_string() }
            } else {
                t.to_string()
            }
        })
        .collect();

    while tokens.len() > 1 && tokens.last().is_some_and(|t| t == "0") {
        tokens.pop();
    }
    tokens
}

//! Package identity and the metadata of an acquired package file

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::package_name::{self, PackageFileName};
use crate::version::PackageVersion;

/// A package id paired with a version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentifier {
    pub package_id: String,
    pub version: PackageVersion,
}

impl PackageIdentifier {
    pub fn new(package_id: impl Into<String>, version: PackageVersion) -> Self {
        Self {
            package_id: package_id.into(),
            version,
        }
    }

    /// Case-insensitive id comparison plus exact-or-semantic version match
    pub fn matches(&self, package_id: &str, version: &PackageVersion) -> bool {
        self.package_id.eq_ignore_ascii_case(package_id) && version.matches(&self.version)
    }
}

impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.package_id, self.version)
    }
}

/// A package file that is fully written to disk
///
/// Container images are the one exception: they live in the container
/// engine's image store, so `full_file_path` is empty and `hash` is the
/// image digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagePhysicalFileMetadata {
    pub full_file_path: PathBuf,
    pub package_id: String,
    pub version: PackageVersion,
    pub extension: String,
    /// Registry digest hash or local SHA-256 hex
    pub hash: String,
    pub size: u64,
}

impl PackagePhysicalFileMetadata {
    /// Build metadata for a cached file by parsing its name and hashing it
    pub fn build(path: &Path) -> Result<Self> {
        let name = package_name::from_path(path)?;
        Self::build_from_name(path, name)
    }

    /// Build metadata for a file whose name was already parsed
    pub fn build_from_name(path: &Path, name: PackageFileName) -> Result<Self> {
        let hash = compute_file_hash(path)?;
        Self::with_hash(path, name.package_id, name.version, name.extension, hash)
    }

    /// Build metadata for a file whose hash is already known, e.g. a blob digest
    pub fn with_hash(
        path: &Path,
        package_id: impl Into<String>,
        version: PackageVersion,
        extension: impl Into<String>,
        hash: impl Into<String>,
    ) -> Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            full_file_path: path.to_path_buf(),
            package_id: package_id.into(),
            version,
            extension: extension.into(),
            hash: hash.into(),
            size,
        })
    }

    /// Metadata for an image held by a container engine
    pub fn for_image(
        package_id: impl Into<String>,
        version: PackageVersion,
        hash: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            full_file_path: PathBuf::new(),
            package_id: package_id.into(),
            version,
            extension: String::new(),
            hash: hash.into(),
            size,
        }
    }

    pub fn identifier(&self) -> PackageIdentifier {
        PackageIdentifier::new(self.package_id.clone(), self.version.clone())
    }
}

/// SHA-256 of a file as lowercase hex
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

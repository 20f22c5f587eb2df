//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid version '{version}': {message}")]
    InvalidVersion { version: String, message: String },

    #[error("Invalid package id: {message}")]
    InvalidPackageId { message: String },

    #[error(
        "Unexpected file format in {file_name}. Expected cached file format: `<PackageId>@<Version>@<CacheBuster>.<Extension>` or `<PackageId>.<SemverVersion>.<Extension>`"
    )]
    UnrecognisedFileName { file_name: String },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid semantic version: {0}")]
    Semver(#[from] semver::Error),
}

impl From<zip::result::ZipError> for CoreError {
    fn from(e: zip::result::ZipError) -> Self {
        CoreError::Archive {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

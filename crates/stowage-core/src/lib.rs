//! Stowage Core - package identity, versions and cache file naming
//!
//! This crate provides the foundational types shared by the Stowage crates:
//! - `PackageVersion`: versions with exact and semantic matching
//! - `PackageIdentifier` / `PackagePhysicalFileMetadata`: what was asked for and what landed on disk
//! - `package_name`: the deterministic, parseable cache file name format
//! - `archive`: zip helpers (root de-nesting, entry lookup)
//! - `Variables`: the deployment variables downloaders consult

pub mod archive;
pub mod error;
pub mod package;
pub mod package_name;
pub mod variables;
pub mod version;

pub use error::{CoreError, Result};
pub use package::{PackageIdentifier, PackagePhysicalFileMetadata, compute_file_hash};
pub use package_name::PackageFileName;
pub use variables::Variables;
pub use version::{PackageVersion, VersionFormat};

//! Cache command - offline lookups against the package cache

use std::path::PathBuf;
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion, VersionFormat};
use stowage_fetch::{FetchConfig, PackageCache};

use crate::display::{print_json, print_metadata};
use crate::error::{CliError, Result};

/// What `cache find` looks for
pub struct FindQuery<'a> {
    pub feed_id: &'a str,
    pub package_id: &'a str,
    pub version: &'a str,
    pub format: VersionFormat,
    pub extensions: &'a [String],
}

pub fn find(config: &FetchConfig, cache_dir: Option<PathBuf>, query: &FindQuery<'_>, json: bool) -> Result<()> {
    let root = match cache_dir {
        Some(dir) => dir,
        None => config.cache_root()?,
    };
    let metadata = lookup(&PackageCache::new(root), query)?;

    if json {
        print_json(&metadata)
    } else {
        print_metadata(&metadata);
        Ok(())
    }
}

fn lookup(cache: &PackageCache, query: &FindQuery<'_>) -> Result<PackagePhysicalFileMetadata> {
    let version = PackageVersion::parse(query.version, query.format)?;
    let extensions: Vec<&str> = query.extensions.iter().map(String::as_str).collect();

    cache
        .try_find(query.feed_id, query.package_id, &version, &extensions)
        .ok_or_else(|| {
            CliError::not_found(format!(
                "{} v{} is not cached for feed {}",
                query.package_id, version, query.feed_id
            ))
        })
}

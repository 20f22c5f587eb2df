//! Local package cache
//!
//! Layout: `<root>/<feed id>/<cached file name>`. Lookups only trust the file
//! name, never the directory structure below the feed directory, so packages
//! may be nested arbitrarily.

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use stowage_core::package_name::{self, escape};
use stowage_core::{PackagePhysicalFileMetadata, PackageVersion};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::{FetchError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Package cache rooted at a directory
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every package from one feed
    pub fn feed_dir(&self, feed_id: &str) -> PathBuf {
        self.root.join(escape(feed_id))
    }

    /// Find a cached file for `package_id` at `version`
    ///
    /// Candidates are filtered by glob on the id and each extension, then
    /// accepted on a case-insensitive id match plus an exact or semantic
    /// version match. Names that fail to parse are skipped.
    pub fn try_find(
        &self,
        feed_id: &str,
        package_id: &str,
        version: &PackageVersion,
        extensions: &[&str],
    ) -> Option<PackagePhysicalFileMetadata> {
        tracing::debug!(
            "Checking package cache for package {} v{}",
            package_id,
            version
        );

        let dir = self.feed_dir(feed_id);
        if !dir.is_dir() {
            return None;
        }

        let patterns: Vec<Pattern> = package_name::to_search_patterns(package_id, extensions)
            .into_iter()
            .chain(legacy_patterns(package_id, extensions))
            .filter_map(|p| Pattern::new(&p).ok())
            .collect();

        for entry in WalkDir::new(&dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let file_name = entry.file_name().to_string_lossy();
            if !patterns.iter().any(|p| p.matches_with(&file_name, MATCH_OPTIONS)) {
                continue;
            }

            let Ok(name) = package_name::parse_file_name(&file_name) else {
                tracing::debug!("Skipping unrecognised cache entry {}", entry.path().display());
                continue;
            };

            if !name.package_id.eq_ignore_ascii_case(package_id) || !version.matches(&name.version) {
                continue;
            }

            match PackagePhysicalFileMetadata::build_from_name(entry.path(), name) {
                Ok(metadata) => {
                    tracing::debug!(
                        "Package was found in cache. No need to download. Using file: '{}'",
                        metadata.full_file_path.display()
                    );
                    return Some(metadata);
                }
                Err(e) => {
                    tracing::debug!("Unable to read cached file {}: {}", entry.path().display(), e);
                }
            }
        }

        None
    }

    /// Scoped staging directory on the same volume as the cache
    ///
    /// Removed when dropped, whatever happened to the download.
    pub fn staging(&self) -> Result<TempDir> {
        std::fs::create_dir_all(&self.root)?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|e| FetchError::CacheError {
                message: format!("Could not create staging directory: {}", e),
            })
    }

    /// Move a fully written staging file into the feed directory
    pub fn commit(
        &self,
        feed_id: &str,
        staged: &Path,
        package_id: &str,
        version: &PackageVersion,
        extension: &str,
    ) -> Result<PathBuf> {
        let dir = self.feed_dir(feed_id);
        std::fs::create_dir_all(&dir)?;

        let target = dir.join(package_name::to_cached_file_name(package_id, version, extension));
        if std::fs::rename(staged, &target).is_err() {
            // Staging may sit on another volume when the cache root is a mount point
            copy_into_place(staged, &dir, &target)?;
        }

        tracing::debug!("Cached {} v{} at {}", package_id, version, target.display());
        Ok(target)
    }

    /// Commit a staged file and build its metadata from a local SHA-256
    pub fn commit_and_hash(
        &self,
        feed_id: &str,
        staged: &Path,
        package_id: &str,
        version: &PackageVersion,
        extension: &str,
    ) -> Result<PackagePhysicalFileMetadata> {
        let target = self.commit(feed_id, staged, package_id, version, extension)?;
        let hash = stowage_core::compute_file_hash(&target)?;
        Ok(PackagePhysicalFileMetadata::with_hash(
            &target,
            package_id,
            version.clone(),
            extension,
            hash,
        )?)
    }
}

/// Copy `staged` next to `target` under a temporary name, then rename it
///
/// The cached name only appears once the copy is complete. A failed copy
/// leaves nothing behind in `dir`.
fn copy_into_place(staged: &Path, dir: &Path, target: &Path) -> Result<()> {
    let mut partial = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)?;
    let mut source = std::fs::File::open(staged)?;
    std::io::copy(&mut source, partial.as_file_mut())?;
    partial.as_file().sync_all()?;
    partial.persist(target).map_err(|e| e.error)?;
    std::fs::remove_file(staged)?;
    Ok(())
}

/// Globs for files dropped into the cache as `<id>.<version><ext>`
fn legacy_patterns(package_id: &str, extensions: &[&str]) -> Vec<String> {
    let id = Pattern::escape(package_id);
    if extensions.is_empty() {
        return vec![format!("{id}.*")];
    }
    extensions.iter().map(|ext| format!("{id}.*{ext}")).collect()
}

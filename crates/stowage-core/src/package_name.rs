//! Cached package file names
//!
//! Every file in the package cache is named
//! `<id>@<format><version>@<cache buster><extension>`, where `id` and `version`
//! are escaped so the name is a valid file name on every platform and the `@`
//! delimiter never appears inside a section. The cache buster is 32 random hex
//! characters so re-downloads never collide with a file that is still in use.
//!
//! Names produced by [`to_cached_file_name`] parse back with
//! [`parse_file_name`] into the same id, version and extension. Files dropped
//! into the cache by hand in the legacy `<id>.<semver><extension>` form are
//! recognised as well.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::version::{PackageVersion, VersionFormat};

/// Separates the id, version and cache-buster sections
pub const SECTION_DELIMITER: char = '@';

const CACHE_BUSTER_LEN: usize = 32;

static TAR_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.*)(?P<ext>\.tar(\.[a-zA-Z0-9]+)?)$").expect("valid regex")
});

static LEGACY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?P<id>\w+([_.-]\w+)*?)\.(?P<version>\d+(\.\d+){0,3}(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?(\+[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?)(?P<ext>(\.[a-zA-Z0-9]+)+)?$",
    )
    .expect("valid regex")
});

/// Identity recovered from a cached file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileName {
    pub package_id: String,
    pub version: PackageVersion,
    /// Extension including the leading dot, e.g. `.tar.gz`
    pub extension: String,
}

/// Build a fresh cache file name for a package
pub fn to_cached_file_name(package_id: &str, version: &PackageVersion, extension: &str) -> String {
    let cache_buster = format!("{:032x}", rand::random::<u128>());
    format!(
        "{}{SECTION_DELIMITER}{}{SECTION_DELIMITER}{cache_buster}{extension}",
        escape(package_id),
        encode_version(version),
    )
}

/// Glob patterns matching every cached version of a package
///
/// The version section is a wildcard: candidates are filtered afterwards by
/// exact or semantic version match, which a glob cannot express.
pub fn to_search_patterns(package_id: &str, extensions: &[&str]) -> Vec<String> {
    let id = escape(package_id);
    if extensions.is_empty() {
        return vec![format!("{id}{SECTION_DELIMITER}*{SECTION_DELIMITER}*")];
    }

    let mut patterns: Vec<String> = Vec::with_capacity(extensions.len());
    for ext in extensions {
        let pattern = format!("{id}{SECTION_DELIMITER}*{SECTION_DELIMITER}*{ext}");
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }
    patterns
}

/// Parse the file name component of `path`
pub fn from_path(path: &Path) -> Result<PackageFileName> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    parse_file_name(&file_name)
}

/// Parse a cached (or legacy) package file name
pub fn parse_file_name(file_name: &str) -> Result<PackageFileName> {
    parse_encoded(file_name)
        .or_else(|| parse_legacy(file_name))
        .ok_or_else(|| CoreError::UnrecognisedFileName {
            file_name: file_name.to_string(),
        })
}

fn parse_encoded(file_name: &str) -> Option<PackageFileName> {
    let sections: Vec<&str> = file_name.split(SECTION_DELIMITER).collect();
    let [id, version, tail] = sections.as_slice() else {
        return None;
    };

    let package_id = unescape(id).ok()?;
    let version = decode_version(version)?;

    let ext_start = tail.find('.').unwrap_or(tail.len());
    let (cache_buster, extension) = tail.split_at(ext_start);
    if cache_buster.len() != CACHE_BUSTER_LEN || !cache_buster.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    Some(PackageFileName {
        package_id,
        version,
        extension: extension.to_string(),
    })
}

fn parse_legacy(file_name: &str) -> Option<PackageFileName> {
    // `.tar.*` is stripped first so `foo.1.0.0-rc.tar.gz` is not read as
    // pre-release `rc.tar` with extension `.gz`
    let (stem, tar_ext) = match match_tar_extension(file_name) {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file_name.to_string(), None),
    };

    let captures = LEGACY_NAME.captures(&stem)?;
    let extension = match tar_ext {
        Some(ext) => ext,
        None => captures.name("ext")?.as_str().to_string(),
    };

    let version = PackageVersion::semver(captures.name("version")?.as_str()).ok()?;
    Some(PackageFileName {
        package_id: captures.name("id")?.as_str().to_string(),
        version,
        extension,
    })
}

/// Split a `.tar` or `.tar.<compression>` extension off a file name
pub fn match_tar_extension(file_name: &str) -> Option<(String, String)> {
    let captures = TAR_EXTENSION.captures(file_name)?;
    Some((
        captures.name("name")?.as_str().to_string(),
        captures.name("ext")?.as_str().to_string(),
    ))
}

/// Extension of a remote file name, treating `.tar.*` as one extension
pub fn extension_of(file_name: &str) -> String {
    if let Some((_, ext)) = match_tar_extension(file_name) {
        return ext;
    }
    Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Last path segment of a package id such as `folder/chart`
pub fn package_name_from_pathed_id(package_id: &str) -> &str {
    package_id
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(package_id)
}

fn encode_version(version: &PackageVersion) -> String {
    format!("{}{}", version.format().prefix(), escape(version.as_str()))
}

fn decode_version(section: &str) -> Option<PackageVersion> {
    let mut chars = section.chars();
    let format = VersionFormat::from_prefix(chars.next()?)?;
    let raw = unescape(chars.as_str()).ok()?;
    PackageVersion::parse(&raw, format).ok()
}

/// Percent-encode everything outside `[A-Za-z0-9._-]`
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverse of [`escape`]
pub fn unescape(input: &str) -> Result<String> {
    let invalid = || CoreError::InvalidPackageId {
        message: format!("invalid escape sequence in '{input}'"),
    };

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3).ok_or_else(invalid)?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}

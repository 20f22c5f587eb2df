//! Zip archive helpers
//!
//! Source-hosting services wrap release archives in a single top-level
//! directory whose name embeds the commit. [`denest_zip`] rewrites such an
//! archive so its contents start at the root, which keeps the resulting file
//! byte-comparable with archives produced elsewhere from the same tree.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::error::Result;

/// Copy `src` to `dest`, dropping the first path segment of every file entry
///
/// Directory entries are skipped. Files sitting directly at the root of `src`
/// (no separator before the first entry's name) are copied unchanged. `dest`
/// must not exist yet.
pub fn denest_zip(src: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(src)?)?;
    let out = OpenOptions::new().write(true).create_new(true).open(dest)?;
    let mut writer = zip::ZipWriter::new(out);

    let mut root_len: Option<usize> = None;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let cut = *root_len.get_or_insert_with(|| name.find('/').map_or(0, |idx| idx + 1));
        let relocated = match name.get(cut..) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };

        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.start_file(relocated, options)?;
        std::io::copy(&mut entry, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}

/// Read the first file entry whose name satisfies `predicate`
pub fn read_entry<P>(archive_path: &Path, predicate: P) -> Result<Option<(String, Vec<u8>)>>
where
    P: Fn(&str) -> bool,
{
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !predicate(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        return Ok(Some((name, data)));
    }
    Ok(None)
}

/// Names of all file entries, in archive order
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in entries {
            let options = SimpleFileOptions::default();
            match content {
                Some(data) => {
                    zip.start_file(name.to_string(), options).unwrap();
                    zip.write_all(data).unwrap();
                }
                None => zip.add_directory(name.to_string(), options).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_denest_strips_root_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.zip");
        write_zip(
            &src,
            &[
                ("owner-repo-abc123/", None),
                ("owner-repo-abc123/README.md", Some(&b"readme"[..])),
                ("owner-repo-abc123/src/", None),
                ("owner-repo-abc123/src/main.rs", Some(&b"fn main() {}"[..])),
            ],
        );

        let dest = temp.path().join("dest.zip");
        denest_zip(&src, &dest).unwrap();

        let names = list_entries(&dest).unwrap();
        assert_eq!(names, vec!["README.md", "src/main.rs"]);

        let (_, data) = read_entry(&dest, |n| n == "src/main.rs").unwrap().unwrap();
        assert_eq!(data, b"fn main() {}");
    }

    #[test]
    fn test_denest_refuses_existing_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.zip");
        write_zip(&src, &[("root/a.txt", Some(&b"a"[..]))]);
        let dest = temp.path().join("dest.zip");
        std::fs::write(&dest, b"taken").unwrap();

        assert!(denest_zip(&src, &dest).is_err());
    }

    #[test]
    fn test_read_entry_missing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg.nupkg");
        write_zip(&src, &[("lib/net8.0/a.dll", Some(&b"x"[..]))]);

        assert!(read_entry(&src, |n| n.ends_with(".nuspec")).unwrap().is_none());
    }
}

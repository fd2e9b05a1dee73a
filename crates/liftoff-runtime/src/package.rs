//! Deterministic build-context packaging.
//!
//! The same source tree always yields byte-identical tar data: entries are
//! sorted, timestamps and ownership are zeroed, and modes are normalized to
//! `0644`/`0755`. The blake3 digest of that data identifies the source.

use crate::RuntimeError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SourcePackage {
    pub data: Vec<u8>,
    /// `blake3:{hex}` over `data`.
    pub digest: String,
    pub files: usize,
}

/// Pack `dir` into a tar archive, leaving out paths matched by `ignore`.
///
/// Ignore patterns: `*.ext` matches file names by suffix, a pattern with a
/// `/` matches a path prefix relative to `dir`, anything else matches any
/// single path component. Symlinks are skipped.
pub fn package_source(dir: &Path, ignore: &[String]) -> Result<SourcePackage, RuntimeError> {
    if !dir.is_dir() {
        return Err(RuntimeError::Package(format!(
            "build directory {} does not exist",
            dir.display()
        )));
    }
    let patterns: Vec<&str> = ignore
        .iter()
        .map(|p| p.trim().trim_end_matches('/'))
        .filter(|p| !p.is_empty())
        .collect();

    let mut entries = Vec::new();
    collect_entries(dir, dir, &patterns, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);
    let mut files = 0;
    for (rel_path, full_path, is_dir) in &entries {
        if *is_dir {
            append_dir(&mut ar, rel_path)?;
        } else {
            append_file(&mut ar, rel_path, full_path)?;
            files += 1;
        }
    }
    let data = ar.into_inner()?;
    let digest = format!("blake3:{}", blake3::hash(&data).to_hex());
    debug!(dir = %dir.display(), files, bytes = data.len(), %digest, "source packaged");
    Ok(SourcePackage {
        data,
        digest,
        files,
    })
}

fn is_ignored(rel_path: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix('*') {
            rel_path.rsplit('/').next().is_some_and(|name| name.ends_with(suffix))
        } else if pattern.contains('/') {
            let pattern = pattern.trim_start_matches("./");
            rel_path == pattern || rel_path.starts_with(&format!("{pattern}/"))
        } else {
            rel_path.split('/').any(|component| component == *pattern)
        }
    })
}

/// (relative path with `/` separators, full path, is_dir)
fn collect_entries(
    root: &Path,
    current: &Path,
    patterns: &[&str],
    out: &mut Vec<(String, PathBuf, bool)>,
) -> Result<(), RuntimeError> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| RuntimeError::Package(format!("path strip: {e}")))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if is_ignored(&rel, patterns) {
            continue;
        }
        let file_type = full.symlink_metadata()?.file_type();
        if file_type.is_dir() {
            out.push((rel, full.clone(), true));
            collect_entries(root, &full, patterns, out)?;
        } else if file_type.is_file() {
            out.push((rel, full, false));
        } else {
            warn!("skipping non-regular file in build context: {rel}");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn normalized_mode(full_path: &Path) -> Result<u32, RuntimeError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = full_path.metadata()?.permissions().mode();
    Ok(if mode & 0o111 != 0 { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn normalized_mode(_full_path: &Path) -> Result<u32, RuntimeError> {
    Ok(0o644)
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header.set_size(size);
    header.set_cksum();
    header
}

fn append_file(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &str,
    full_path: &Path,
) -> Result<(), RuntimeError> {
    let data = fs::read(full_path)?;
    let mut header = header(
        tar::EntryType::Regular,
        normalized_mode(full_path)?,
        data.len() as u64,
    );
    ar.append_data(&mut header, rel_path, data.as_slice())?;
    Ok(())
}

fn append_dir(ar: &mut tar::Builder<Vec<u8>>, rel_path: &str) -> Result<(), RuntimeError> {
    let mut header = header(tar::EntryType::Directory, 0o755, 0);
    ar.append_data(&mut header, format!("{rel_path}/"), &[] as &[u8])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.py"), "print('hi')\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/left-pad")).unwrap();
        fs::write(dir.path().join("node_modules/left-pad/index.js"), "x").unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        dir
    }

    fn names(pkg: &SourcePackage) -> Vec<String> {
        let mut ar = tar::Archive::new(pkg.data.as_slice());
        ar.entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_owned()
            })
            .collect()
    }

    #[test]
    fn packaging_is_deterministic() {
        let a = sample_tree();
        let b = sample_tree();
        let pa = package_source(a.path(), &[]).unwrap();
        let pb = package_source(b.path(), &[]).unwrap();
        assert_eq!(pa.digest, pb.digest);
        assert_eq!(pa.data, pb.data);
        assert!(pa.digest.starts_with("blake3:"));
    }

    #[test]
    fn content_change_changes_digest() {
        let dir = sample_tree();
        let before = package_source(dir.path(), &[]).unwrap();
        fs::write(dir.path().join("src/main.py"), "print('bye')\n").unwrap();
        let after = package_source(dir.path(), &[]).unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn ignore_patterns_drop_entries() {
        let dir = sample_tree();
        let ignore = vec!["node_modules/".to_owned(), "*.log".to_owned()];
        let pkg = package_source(dir.path(), &ignore).unwrap();
        assert_eq!(names(&pkg), vec!["Dockerfile", "src", "src/main.py"]);
        assert_eq!(pkg.files, 2);
    }

    #[test]
    fn entries_are_sorted_with_zeroed_metadata() {
        let dir = sample_tree();
        let pkg = package_source(dir.path(), &["node_modules".to_owned()]).unwrap();
        let mut ar = tar::Archive::new(pkg.data.as_slice());
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            let h = entry.header();
            assert_eq!(h.mtime().unwrap(), 0);
            assert_eq!(h.uid().unwrap(), 0);
            assert_eq!(h.gid().unwrap(), 0);
        }
        let listed = names(&pkg);
        let mut sorted = listed.clone();
        sorted.sort();
        assert_eq!(listed, sorted);
    }

    #[test]
    fn path_prefix_patterns() {
        assert!(is_ignored("build/out.bin", &["build"]));
        assert!(is_ignored("web/dist/app.js", &["web/dist"]));
        assert!(!is_ignored("dist/app.js", &["web/dist"]));
        assert!(is_ignored("a/b/.git", &[".git"]));
        assert!(!is_ignored("gitignore", &[".git"]));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            package_source(&dir.path().join("absent"), &[]),
            Err(RuntimeError::Package(_))
        ));
    }
}

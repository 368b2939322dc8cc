//! Module archive handling: guarded extraction of SCM source tarballs and
//! construction of the immutable registry tarball.
//!
//! Extraction applies two defenses against hostile archives: any entry whose
//! cleaned destination escapes the extraction root is an error, and any
//! single entry larger than the per-entry cap is an error. Only directories
//! and regular files are materialized.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::constants::{COMMIT_MANIFEST_NAME, MAX_TAR_ENTRY_BYTES};

/// Extract a gzip tarball into `dest`, applying the safety guards.
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().context("cannot read tar entries")? {
        let mut entry = entry.context("corrupt tar entry")?;
        let raw_path = entry.path().context("tar entry has invalid path")?.into_owned();

        let mut cleaned = PathBuf::new();
        for component in raw_path.components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::CurDir => {}
                _ => bail!("tar entry {} escapes the extraction root", raw_path.display()),
            }
        }
        let target = dest.join(&cleaned);
        if !target.starts_with(dest) {
            bail!("tar entry {} escapes the extraction root", raw_path.display());
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("cannot create {}", target.display()))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("cannot create {}", parent.display()))?;
                }
                let mut out = File::create(&target)
                    .with_context(|| format!("cannot create {}", target.display()))?;
                let copied = std::io::copy(&mut entry.by_ref().take(MAX_TAR_ENTRY_BYTES), &mut out)?;
                if copied >= MAX_TAR_ENTRY_BYTES {
                    // The cap truncated the copy; anything left marks the
                    // entry as oversized.
                    let mut probe = [0u8; 1];
                    if entry.read(&mut probe)? > 0 {
                        bail!(
                            "tar entry {} exceeds the {} byte limit",
                            raw_path.display(),
                            MAX_TAR_ENTRY_BYTES
                        );
                    }
                }
            }
            // Symlinks, hardlinks, and specials are dropped.
            _ => continue,
        }
    }
    Ok(())
}

/// Resolve the module directory inside an extracted source tree.
///
/// GitHub and GitLab archives wrap everything in a single
/// `<repo>-<ref>/` directory; descend into it before applying the
/// configured module subpath.
pub fn resolve_module_dir(root: &Path, module_path: &str) -> Result<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    let mut base = root.to_path_buf();
    if entries.len() == 1 && entries[0].is_dir() {
        base = entries.remove(0);
    }
    let resolved = if module_path.is_empty() {
        base
    } else {
        base.join(module_path.trim_matches('/'))
    };
    if !resolved.is_dir() {
        bail!("module path {module_path:?} not found in source archive");
    }
    Ok(resolved)
}

/// A Terraform module must carry at least one `.tf` file at its root.
pub fn validate_module_dir(dir: &Path) -> Result<()> {
    let has_tf = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .any(|e| e.path().extension().is_some_and(|ext| ext == "tf"));
    if !has_tf {
        bail!("no .tf files found at {}", dir.display());
    }
    Ok(())
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Build the immutable registry tarball for a published version.
///
/// The archive contains every regular file under `src` plus a synthetic
/// manifest recording the exact commit, and the returned checksum is the
/// SHA-256 of the final `.tar.gz` bytes.
pub fn build_module_archive(
    src: &Path,
    commit_sha: &str,
    published_at: DateTime<Utc>,
    out_path: &Path,
) -> Result<(u64, String)> {
    let file = File::create(out_path)
        .with_context(|| format!("cannot create {}", out_path.display()))?;
    let mut writer = HashingWriter::new(file);
    {
        let encoder = GzEncoder::new(&mut writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest = format!(
            "commit: {commit_sha}\npublished: {}\n",
            published_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(published_at.timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, COMMIT_MANIFEST_NAME, manifest.as_bytes())?;

        let mut files: Vec<PathBuf> = WalkDir::new(src)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        for path in files {
            let name = path
                .strip_prefix(src)
                .context("walked file outside source root")?;
            builder.append_path_with_name(&path, name)?;
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;
    }
    writer.flush()?;
    let sha256 = hex::encode(writer.hasher.finalize());
    Ok((writer.written, sha256))
}

/// First README at the module root, if any.
pub fn extract_readme(dir: &Path) -> Option<String> {
    for candidate in ["README.md", "README", "readme.md"] {
        let path = dir.join(candidate);
        if path.is_file() {
            return std::fs::read_to_string(path).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a gz tarball in memory from (name, contents, entry_type).
    ///
    /// Writes the entry name directly into the header's raw name field
    /// instead of going through `Builder::append_data`/`Header::set_path`,
    /// since the latter rejects `..` components outright -- and these tests
    /// need to be able to fabricate exactly that kind of malicious entry.
    fn make_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extract_roundtrip() {
        let archive = make_archive(&[
            ("repo-abc123/main.tf", b"resource {}"),
            ("repo-abc123/README.md", b"# vpc"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(&archive[..], dest.path()).unwrap();

        let module = resolve_module_dir(dest.path(), "").unwrap();
        assert!(module.ends_with("repo-abc123"));
        validate_module_dir(&module).unwrap();
        assert_eq!(extract_readme(&module).as_deref(), Some("# vpc"));
    }

    #[test]
    fn test_traversal_entry_rejected() {
        let archive = make_archive(&[("../../escape.tf", b"boom")]);
        let dest = tempfile::tempdir().unwrap();
        let err = extract_tar_gz(&archive[..], dest.path()).unwrap_err();
        assert!(err.to_string().contains("escapes the extraction root"));
    }

    #[test]
    fn test_module_without_tf_rejected() {
        let archive = make_archive(&[("repo/readme.txt", b"nope")]);
        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(&archive[..], dest.path()).unwrap();
        let module = resolve_module_dir(dest.path(), "").unwrap();
        assert!(validate_module_dir(&module).is_err());
    }

    #[test]
    fn test_subpath_resolution() {
        let archive = make_archive(&[
            ("repo/modules/vpc/main.tf", b"{}"),
            ("repo/main.tf", b"{}"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(&archive[..], dest.path()).unwrap();
        let module = resolve_module_dir(dest.path(), "modules/vpc").unwrap();
        validate_module_dir(&module).unwrap();
        assert!(resolve_module_dir(dest.path(), "modules/absent").is_err());
    }

    #[test]
    fn test_symlinks_dropped() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "repo/link.tf", "/etc/passwd")
            .unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(&archive[..], dest.path()).unwrap();
        assert!(!dest.path().join("repo/link.tf").exists());
    }

    // Writes the full per-entry cap to disk; run with --ignored.
    #[test]
    #[ignore]
    fn test_oversized_entry_rejected() {
        let oversized = MAX_TAR_ENTRY_BYTES + 100 * 1024 * 1024;
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(oversized);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                "repo/huge.bin",
                std::io::Read::take(std::io::repeat(0), oversized),
            )
            .unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let err = extract_tar_gz(&archive[..], dest.path()).unwrap_err();
        assert!(err.to_string().contains("byte limit"));
    }

    #[test]
    fn test_rebuilt_archive_carries_commit_manifest() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("main.tf"), "resource {}").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/outputs.tf"), "output {}").unwrap();

        let out = tempfile::tempdir().unwrap();
        let out_path = out.path().join("module-1.0.0.tar.gz");
        let published = Utc::now();
        let (size, sha256) =
            build_module_archive(src.path(), "abc123", published, &out_path).unwrap();
        assert!(size > 0);
        assert_eq!(
            sha256,
            hex::encode(Sha256::digest(std::fs::read(&out_path).unwrap()))
        );

        // Re-read the archive and check the manifest's first line.
        let file = File::open(&out_path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut names = Vec::new();
        let mut manifest = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            if name == COMMIT_MANIFEST_NAME {
                entry.read_to_string(&mut manifest).unwrap();
            }
            names.push(name);
        }
        assert!(names.contains(&COMMIT_MANIFEST_NAME.to_string()));
        assert!(names.contains(&"main.tf".to_string()));
        assert!(names.contains(&"sub/outputs.tf".to_string()));
        assert!(manifest.starts_with("commit: abc123\n"));
        assert!(manifest.contains("published: "));
    }
}

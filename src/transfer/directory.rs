//! Directory transfer on top of single-file transfer.
//!
//! Uploads pack the tree into one gzipped tarball, push it like any other
//! file, and unpack it on the instance. Downloads list the remote tree and
//! fetch each file over scp.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;

use super::{FileTransfer, TransferError};
use crate::direct;
use crate::remote::{ERROR_MARKER, MISSING_MARKER, SUCCESS_TOKEN, has_token, quote};
use crate::Result;

/// A local tarball that is deleted when dropped.
pub struct PackedArchive {
    file: NamedTempFile,
    /// Regular files in the archive.
    pub files: usize,
    /// Directories in the archive, excluding the root.
    pub dirs: usize,
}

impl PackedArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn archive_err(dir: &Path) -> impl Fn(std::io::Error) -> TransferError + '_ {
    move |e| TransferError::Archive(format!("{}: {e}", dir.display()))
}

/// Pack `dir` into a temporary `.tar.gz` with entry paths relative to `dir`.
pub fn pack_directory(dir: &Path) -> Result<PackedArchive> {
    let err = archive_err(dir);
    let mut file = tempfile::Builder::new()
        .prefix("relaycopy-")
        .suffix(".tar.gz")
        .tempfile()
        .map_err(&err)?;

    let mut files = 0;
    let mut dirs = 0;
    {
        let encoder = GzEncoder::new(BufWriter::new(file.as_file_mut()), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| err(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| TransferError::Archive(e.to_string()))?;
            if entry.file_type().is_dir() {
                builder.append_dir(rel, entry.path()).map_err(&err)?;
                dirs += 1;
            } else {
                builder
                    .append_path_with_name(entry.path(), rel)
                    .map_err(&err)?;
                files += 1;
            }
        }

        let encoder = builder.into_inner().map_err(&err)?;
        let mut writer = encoder.finish().map_err(&err)?;
        writer.flush().map_err(&err)?;
    }

    tracing::debug!(
        dir = %dir.display(),
        archive = %file.path().display(),
        files,
        dirs,
        "packed directory"
    );
    Ok(PackedArchive { file, files, dirs })
}

/// `cd <dir> && tar -xzf <archive> && rm <archive> && echo 'success'`
pub fn extract_command(remote_dir: &str, archive_name: &str) -> String {
    let archive = quote(archive_name);
    format!(
        "cd {} && tar -xzf {archive} && rm {archive} && echo '{SUCCESS_TOKEN}'",
        quote(remote_dir)
    )
}

/// `find <dir> -type f | sort`
pub fn listing_command(remote_dir: &str) -> String {
    format!("find {} -type f | sort", quote(remote_dir))
}

/// Parse `find` output into a sorted file list.
///
/// `None` means the directory is missing, unreadable or empty.
pub fn parse_listing(output: &str) -> Option<Vec<String>> {
    if output.starts_with(ERROR_MARKER) || output.contains(MISSING_MARKER) {
        return None;
    }
    let mut files: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if files.is_empty() {
        return None;
    }
    files.sort();
    Some(files)
}

/// Path of `file` relative to `remote_dir`, if it is strictly inside it.
pub fn relative_remote_path(remote_dir: &str, file: &str) -> Option<PathBuf> {
    let rel = Path::new(file).strip_prefix(Path::new(remote_dir)).ok()?;
    let clean = rel.components().all(|c| matches!(c, Component::Normal(_)));
    (clean && !rel.as_os_str().is_empty()).then(|| rel.to_path_buf())
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

impl FileTransfer {
    /// Upload the tree under `local_dir` so that it mirrors into `remote_dir`.
    ///
    /// The contents of `local_dir` land directly in `remote_dir`, not under
    /// `remote_dir/<basename of local_dir>`.
    pub fn upload_directory(
        &mut self,
        local_dir: &Path,
        remote_dir: &str,
        max_retries: u32,
    ) -> Result<()> {
        if !local_dir.is_dir() {
            return Err(TransferError::NotADirectory(local_dir.to_path_buf()));
        }
        self.ensure_access()?;
        self.make_remote_dir(remote_dir)?;

        // Dropping `archive` removes the local tarball on every path out of here.
        let archive = pack_directory(local_dir)?;
        tracing::info!(
            local = %local_dir.display(),
            files = archive.files,
            dirs = archive.dirs,
            "uploading directory archive"
        );

        let archive_name = format!(".relaycopy-{}.tar.gz", Uuid::new_v4().simple());
        let remote_archive = join_remote(remote_dir, &archive_name);
        self.push_with_fallback(archive.path(), &remote_archive, max_retries)?;

        let output = self.connection.execute(
            &extract_command(remote_dir, &archive_name),
            self.config.timeouts.small_fetch,
        )?;
        if !has_token(&output, SUCCESS_TOKEN) {
            return Err(TransferError::Extract(output.trim().to_string()));
        }

        tracing::info!(local = %local_dir.display(), remote = remote_dir, "directory upload complete");
        Ok(())
    }

    /// Download every file under `remote_dir` into `local_dir`, keeping the
    /// relative layout.
    pub fn download_directory(
        &mut self,
        remote_dir: &str,
        local_dir: &Path,
        max_retries: u32,
    ) -> Result<()> {
        self.ensure_access()?;
        fs::create_dir_all(local_dir)?;

        let output = self.connection.probe(&listing_command(remote_dir))?;
        let files = parse_listing(&output)
            .ok_or_else(|| TransferError::RemoteListing(remote_dir.to_string()))?;
        tracing::info!(remote = remote_dir, files = files.len(), "downloading directory");

        let target = self.ssh_target()?;
        let policy = self.policy(max_retries);
        for remote_file in &files {
            let Some(rel) = relative_remote_path(remote_dir, remote_file) else {
                tracing::warn!(remote_file = %remote_file, "listed file is outside the directory, skipping");
                continue;
            };
            let local_path = local_dir.join(rel);
            if let Some(parent) = local_path.parent() {
                fs::create_dir_all(parent)?;
            }
            direct::direct_download(
                self.copier.as_ref(),
                &target,
                remote_file,
                &local_path,
                policy,
            )?;
        }

        tracing::info!(remote = remote_dir, local = %local_dir.display(), "directory download complete");
        Ok(())
    }

    /// Files under `remote_dir`, sorted. Empty when the directory is missing.
    pub fn list_remote_files(&mut self, remote_dir: &str) -> Result<Vec<String>> {
        self.ensure_access()?;
        let output = self.connection.probe(&listing_command(remote_dir))?;
        Ok(parse_listing(&output).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn archive_entries(path: &Path) -> Vec<String> {
        let file = fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_pack_directory_relative_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("frames");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.txt"), "1").unwrap();
        fs::write(root.join("a/mid.txt"), "2").unwrap();
        fs::write(root.join("a/b/deep.txt"), "3").unwrap();

        let archive = pack_directory(&root).unwrap();
        assert_eq!(archive.files, 3);
        assert_eq!(archive.dirs, 2);

        let entries = archive_entries(archive.path());
        for expected in ["top.txt", "a/mid.txt", "a/b/deep.txt"] {
            assert!(entries.iter().any(|e| e == expected), "{expected} missing from {entries:?}");
        }
        assert!(entries.iter().all(|e| !e.starts_with("frames")));
    }

    #[test]
    fn test_packed_archive_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("x.txt"), "x").unwrap();
        let archive = pack_directory(tmp.path()).unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn test_parse_listing() {
        let out = "/d/b.txt\n/d/a.txt\n\n/d/sub/c.txt\n";
        assert_eq!(
            parse_listing(out).unwrap(),
            vec!["/d/a.txt", "/d/b.txt", "/d/sub/c.txt"]
        );
        assert_eq!(parse_listing(""), None);
        assert_eq!(parse_listing("  \n"), None);
        assert_eq!(
            parse_listing("find: '/nope': No such file or directory\n"),
            None
        );
        assert_eq!(parse_listing("Error: channel closed"), None);
    }

    #[test]
    fn test_relative_remote_path() {
        assert_eq!(
            relative_remote_path("/data/out", "/data/out/sub/x.png"),
            Some(PathBuf::from("sub/x.png"))
        );
        assert_eq!(
            relative_remote_path("/data/out/", "/data/out/x.png"),
            Some(PathBuf::from("x.png"))
        );
        assert_eq!(relative_remote_path("/data/out", "/data/other/x.png"), None);
        assert_eq!(relative_remote_path("/data/out", "/data/out"), None);
    }

    #[test]
    fn test_extract_and_listing_commands() {
        let command = extract_command("/data/my dir", ".relaycopy-1.tar.gz");
        let words = shell_words::split(&command).unwrap();
        assert_eq!(
            words,
            [
                "cd",
                "/data/my dir",
                "&&",
                "tar",
                "-xzf",
                ".relaycopy-1.tar.gz",
                "&&",
                "rm",
                ".relaycopy-1.tar.gz",
                "&&",
                "echo",
                "success"
            ]
        );
        assert_eq!(listing_command("/data/out"), "find /data/out -type f | sort");
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/data/", "a.tgz"), "/data/a.tgz");
        assert_eq!(join_remote("/data", "a.tgz"), "/data/a.tgz");
    }
}

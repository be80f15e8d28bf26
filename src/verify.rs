//! Post-restore verification: metadata (is the target a real btrfs
//! subvolume) and content (does it match the source snapshot tree).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::pathenv::ensure_sbin_on_command_path;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("restore target is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("restore target is not writable: {0}")]
    NotWritable(PathBuf),
    #[error("command failed: {0}")]
    Command(String),
    #[error("restore target has no valid UUID")]
    NoUuid,
    #[error("source snapshot missing: {0}")]
    SourceMissing(PathBuf),
    #[error("source snapshot is not a directory: {0}")]
    SourceNotADirectory(PathBuf),
    #[error("missing directory: {0}")]
    MissingDirectory(String),
    #[error("extra directory: {0}")]
    ExtraDirectory(String),
    #[error("missing file: {0}")]
    MissingFile(String),
    #[error("extra file: {0}")]
    ExtraFile(String),
    #[error("type mismatch for {0}")]
    TypeMismatch(String),
    #[error("symlink mismatch for {0}")]
    SymlinkMismatch(String),
    #[error("size mismatch for {0}")]
    SizeMismatch(String),
    #[error("hash mismatch for {0}")]
    HashMismatch(String),
    #[error("unknown verify mode: {0}")]
    UnknownMode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstraction over `btrfs subvolume show`, so tests can substitute a
/// fake runner instead of requiring a real btrfs filesystem.
#[async_trait]
pub trait SubvolumeShowRunner: Send + Sync {
    async fn show(&self, target: &Path) -> Result<String, VerifyError>;
}

pub struct ShellSubvolumeShowRunner;

#[async_trait]
impl SubvolumeShowRunner for ShellSubvolumeShowRunner {
    async fn show(&self, target: &Path) -> Result<String, VerifyError> {
        let mut command = tokio::process::Command::new("btrfs");
        command.arg("subvolume").arg("show").arg(target);
        ensure_sbin_on_command_path(&mut command);
        let output = command
            .output()
            .await
            .map_err(|e| VerifyError::Command(e.to_string()))?;
        if !output.status.success() {
            return Err(VerifyError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Confirms `target` is a writable directory whose `btrfs subvolume
/// show` output parses as a valid UUID.
pub async fn verify_metadata<R: SubvolumeShowRunner>(
    target: &Path,
    runner: &R,
) -> Result<(), VerifyError> {
    if !target.is_dir() {
        return Err(VerifyError::NotADirectory(target.to_path_buf()));
    }
    let metadata = std::fs::metadata(target)?;
    if metadata.permissions().readonly() {
        return Err(VerifyError::NotWritable(target.to_path_buf()));
    }
    let output = runner.show(target).await?;
    if parse_uuid(&output).is_none() {
        return Err(VerifyError::NoUuid);
    }
    Ok(())
}

/// Compares `source`'s tree against `target`'s per `mode` ("full",
/// "sample", or "none"). Directory and file listings must match
/// exactly; symlink targets must match; regular-file content is
/// compared by size and SHA-256 for the files selected by `mode`.
pub fn verify_content(
    source: &Path,
    target: &Path,
    mode: &str,
    sample_max_files: usize,
) -> Result<(), VerifyError> {
    if !source.exists() {
        return Err(VerifyError::SourceMissing(source.to_path_buf()));
    }
    if !source.is_dir() {
        return Err(VerifyError::SourceNotADirectory(source.to_path_buf()));
    }
    let (source_dirs, source_files) = collect_entries(source)?;
    let (target_dirs, target_files) = collect_entries(target)?;

    check_missing_extra(&source_dirs, &target_dirs, true)?;
    check_missing_extra(&source_files, &target_files, false)?;

    for rel_path in &source_files {
        let source_path = source.join(rel_path);
        let target_path = target.join(rel_path);
        let source_type = entry_type(&source_path);
        let target_type = entry_type(&target_path);
        if source_type != target_type {
            return Err(VerifyError::TypeMismatch(rel_path.clone()));
        }
        if source_type == EntryType::Symlink {
            let source_link = std::fs::read_link(&source_path)?;
            let target_link = std::fs::read_link(&target_path)?;
            if source_link != target_link {
                return Err(VerifyError::SymlinkMismatch(rel_path.clone()));
            }
        }
    }

    let regular_files: Vec<&String> = source_files
        .iter()
        .filter(|rel_path| entry_type(&source.join(rel_path)) == EntryType::File)
        .collect();

    let files_to_check: Vec<&String> = match mode {
        "full" => regular_files,
        "sample" => select_sample(&regular_files, sample_max_files),
        "none" => return Ok(()),
        other => return Err(VerifyError::UnknownMode(other.to_string())),
    };

    for rel_path in files_to_check {
        let source_path = source.join(rel_path);
        let target_path = target.join(rel_path);
        let source_len = std::fs::metadata(&source_path)?.len();
        let target_len = std::fs::metadata(&target_path)?.len();
        if source_len != target_len {
            return Err(VerifyError::SizeMismatch(rel_path.clone()));
        }
        if hash_file(&source_path)? != hash_file(&target_path)? {
            return Err(VerifyError::HashMismatch(rel_path.clone()));
        }
    }
    Ok(())
}

/// Runs metadata verification always (unless `mode == "none"`), then
/// content verification when `source` is known and still present.
pub async fn verify_restore<R: SubvolumeShowRunner>(
    source: Option<&Path>,
    target: &Path,
    mode: &str,
    sample_max_files: usize,
    runner: &R,
) -> Result<(), VerifyError> {
    if mode == "none" {
        return Ok(());
    }
    verify_metadata(target, runner).await?;
    let Some(source) = source else {
        return Ok(());
    };
    if !source.exists() {
        return Ok(());
    }
    verify_content(source, target, mode, sample_max_files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    Missing,
    Symlink,
    File,
    Dir,
    Other,
}

fn entry_type(path: &Path) -> EntryType {
    match std::fs::symlink_metadata(path) {
        Err(_) => EntryType::Missing,
        Ok(metadata) => {
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                EntryType::Symlink
            } else if file_type.is_file() {
                EntryType::File
            } else if file_type.is_dir() {
                EntryType::Dir
            } else {
                EntryType::Other
            }
        }
    }
}

/// Walks `base`, returning sorted, de-duplicated relative paths for
/// directories and for files (symlinks counted as files rather than
/// followed).
fn collect_entries(base: &Path) -> Result<(Vec<String>, Vec<String>), VerifyError> {
    let mut dirs = BTreeSet::new();
    let mut files = BTreeSet::new();
    if !base.exists() {
        return Ok((Vec::new(), Vec::new()));
    }
    for entry in WalkDir::new(base).min_depth(1).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            dirs.insert(relative(base, path));
        } else {
            files.insert(relative(base, path));
        }
    }
    Ok((dirs.into_iter().collect(), files.into_iter().collect()))
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

fn check_missing_extra(
    source_list: &[String],
    target_list: &[String],
    is_directory: bool,
) -> Result<(), VerifyError> {
    let source_set: BTreeSet<&String> = source_list.iter().collect();
    let target_set: BTreeSet<&String> = target_list.iter().collect();
    for path in source_list {
        if !target_set.contains(path) {
            return Err(if is_directory {
                VerifyError::MissingDirectory(path.clone())
            } else {
                VerifyError::MissingFile(path.clone())
            });
        }
    }
    for path in target_list {
        if !source_set.contains(path) {
            return Err(if is_directory {
                VerifyError::ExtraDirectory(path.clone())
            } else {
                VerifyError::ExtraFile(path.clone())
            });
        }
    }
    Ok(())
}

fn select_sample<'a>(paths: &[&'a String], sample_max_files: usize) -> Vec<&'a String> {
    if sample_max_files == 0 {
        return Vec::new();
    }
    let mut ordered = paths.to_vec();
    ordered.sort();
    ordered.truncate(sample_max_files);
    ordered
}

fn hash_file(path: &Path) -> Result<String, VerifyError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn parse_uuid(show_output: &str) -> Option<String> {
    for line in show_output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed
            .to_ascii_lowercase()
            .strip_prefix("uuid:")
            .map(|_| trimmed.splitn(2, ':').nth(1).unwrap_or("").trim())
        {
            return uuid::Uuid::parse_str(rest).ok().map(|u| u.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRunner {
        output: String,
    }

    #[async_trait]
    impl SubvolumeShowRunner for FakeRunner {
        async fn show(&self, _target: &Path) -> Result<String, VerifyError> {
            Ok(self.output.clone())
        }
    }

    #[test]
    fn parses_valid_uuid_line() {
        let output = "Name: \t\t\t\t-\nUUID: \t\t\t9d9da04c-9b31-4f5c-9c4a-0000000000aa\n";
        assert_eq!(
            parse_uuid(output),
            Some("9d9da04c-9b31-4f5c-9c4a-0000000000aa".to_string())
        );
    }

    #[test]
    fn rejects_missing_uuid_line() {
        assert_eq!(parse_uuid("Name: -\n"), None);
    }

    #[tokio::test]
    async fn verify_metadata_fails_on_non_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        std::fs::write(&file_path, b"x").unwrap();
        let runner = FakeRunner {
            output: String::new(),
        };
        let err = verify_metadata(&file_path, &runner).await.unwrap_err();
        assert!(matches!(err, VerifyError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn verify_metadata_fails_without_valid_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner {
            output: "Name: -\n".to_string(),
        };
        let err = verify_metadata(dir.path(), &runner).await.unwrap_err();
        assert!(matches!(err, VerifyError::NoUuid));
    }

    fn write_tree(base: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let path = base.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn verify_content_passes_for_identical_trees() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(source.path(), &[("a/b.txt", b"hello")]);
        write_tree(target.path(), &[("a/b.txt", b"hello")]);
        verify_content(source.path(), target.path(), "full", 100).unwrap();
    }

    #[test]
    fn verify_content_detects_hash_mismatch() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(source.path(), &[("a.txt", b"hello")]);
        write_tree(target.path(), &[("a.txt", b"world")]);
        let err = verify_content(source.path(), target.path(), "full", 100).unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch(_)));
    }

    #[test]
    fn verify_content_detects_missing_file() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(source.path(), &[("a.txt", b"hello")]);
        std::fs::create_dir_all(target.path()).unwrap();
        let err = verify_content(source.path(), target.path(), "full", 100).unwrap_err();
        assert!(matches!(err, VerifyError::MissingFile(_)));
    }

    #[test]
    fn verify_content_none_mode_skips_everything() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(source.path(), &[("a.txt", b"hello")]);
        std::fs::create_dir_all(target.path()).unwrap();
        verify_content(source.path(), target.path(), "none", 100).unwrap();
    }

    #[test]
    fn sample_mode_caps_files_checked() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write_tree(
            source.path(),
            &[("a.txt", b"1"), ("b.txt", b"2"), ("c.txt", b"3")],
        );
        write_tree(
            target.path(),
            &[("a.txt", b"1"), ("b.txt", b"2"), ("c.txt", b"X")],
        );
        // c.txt differs but sample_max_files=2 only checks a.txt, b.txt
        // (alphabetically first), so the mismatch is never inspected.
        verify_content(source.path(), target.path(), "sample", 2).unwrap();
    }
}

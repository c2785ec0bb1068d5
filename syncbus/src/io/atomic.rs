//! Atomic file publication.
//!
//! Every file the engine owns is written to a sibling temp file first and
//! then moved into place, so readers only ever see old or new contents.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = write_temp(path, contents)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("replace {}", path.display()));
    }
    Ok(())
}

/// Publish `contents` at `path` only if nothing exists there yet.
///
/// Returns `Ok(false)` when `path` is already taken; the existing file is
/// left untouched.
pub fn publish_new(path: &Path, contents: &str) -> Result<bool> {
    let tmp_path = write_temp(path, contents)?;
    let linked = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "publish target already exists");
            Ok(false)
        }
        Err(err) => Err(err).with_context(|| format!("publish {}", path.display())),
    }
}

fn write_temp(path: &Path, contents: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_sibling(path)?;

    let result = File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        })
        .with_context(|| format!("write temp file {}", tmp_path.display()));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.map(|()| tmp_path)
}

/// `.<name>.<pid>.<n>.tmp` next to `path`; unique across threads and processes.
fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(path.with_file_name(format!(".{name}.{}.{n}.tmp", process::id())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("file.md");

        write_atomic(&path, "one").expect("first write");
        write_atomic(&path, "two").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert_eq!(listing(path.parent().expect("parent")), vec!["file.md"]);
    }

    #[test]
    fn publish_new_never_clobbers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("packet.md");

        assert!(publish_new(&path, "first").expect("publish"));
        assert!(!publish_new(&path, "second").expect("publish again"));

        assert_eq!(fs::read_to_string(&path).expect("read"), "first");
        assert_eq!(listing(temp.path()), vec!["packet.md"]);
    }
}

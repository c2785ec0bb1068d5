//! Inbox enumeration.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::types::InboxEntry;

/// File name reserved for the operator template; never treated as input.
pub const TEMPLATE_NAME: &str = "_template.md";

/// Source of inbox entries.
pub trait InboxProvider {
    /// All current entries, sorted by path.
    fn entries(&self) -> Result<Vec<InboxEntry>>;
}

/// Flat directory of `*.md` files.
#[derive(Debug, Clone)]
pub struct DirInbox {
    dir: PathBuf,
}

impl DirInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl InboxProvider for DirInbox {
    fn entries(&self) -> Result<Vec<InboxEntry>> {
        let read_dir = fs::read_dir(&self.dir)
            .with_context(|| format!("read inbox {}", self.dir.display()))?;

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.with_context(|| format!("read inbox {}", self.dir.display()))?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                debug!(path = %item.path().display(), "skipping non-utf8 inbox name");
                continue;
            };
            if !name.ends_with(".md") || name == TEMPLATE_NAME || name.starts_with('.') {
                continue;
            }
            let path = item.path();
            let metadata = item
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?;
            if !metadata.is_file() {
                continue;
            }
            let content =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            entries.push(InboxEntry {
                path: name,
                content,
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(dir = %self.dir.display(), count = entries.len(), "inbox enumerated");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_markdown_entries_sorted_and_skips_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("b.md"), "beta").expect("write");
        fs::write(dir.join("a.md"), "alpha").expect("write");
        fs::write(dir.join(TEMPLATE_NAME), "template").expect("write");
        fs::write(dir.join("notes.txt"), "ignored").expect("write");
        fs::write(dir.join(".a.md.1.0.tmp"), "partial").expect("write");
        fs::create_dir(dir.join("sub.md")).expect("mkdir");

        let entries = DirInbox::new(dir).entries().expect("entries");
        let names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
        assert_eq!(entries[0].content, "alpha");
        assert!(entries[0].modified.is_some());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inbox = DirInbox::new(temp.path().join("inbox"));
        let err = inbox.entries().unwrap_err();
        assert!(err.to_string().contains("read inbox"));
    }
}

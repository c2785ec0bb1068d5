//! Reference material ("canon") scoped by thread.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::routing::ReferenceSnippet;
use crate::core::types::ThreadKey;

pub trait ReferenceProvider {
    /// Snippets visible to `thread` (shared material plus the thread's own),
    /// or only the shared material when `thread` is `None`.
    fn snippets(&self, thread: Option<&ThreadKey>) -> Result<Vec<ReferenceSnippet>>;
}

/// Reference files read from one directory.
///
/// Listed files that do not exist are skipped; any other read error is
/// reported so the caller can treat that thread's context as unavailable.
#[derive(Debug, Clone, Default)]
pub struct CanonDir {
    dir: PathBuf,
    shared: Vec<String>,
    per_thread: BTreeMap<ThreadKey, Vec<String>>,
}

impl CanonDir {
    pub fn new(dir: impl Into<PathBuf>, shared: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            shared,
            per_thread: BTreeMap::new(),
        }
    }

    pub fn with_thread(mut self, thread: ThreadKey, files: Vec<String>) -> Self {
        self.per_thread.insert(thread, files);
        self
    }

    fn read(&self, name: &str, out: &mut Vec<ReferenceSnippet>) -> Result<()> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => {
                out.push(ReferenceSnippet {
                    name: name.to_string(),
                    text,
                });
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "reference file missing, skipping");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("read reference {}", path.display())),
        }
    }
}

impl ReferenceProvider for CanonDir {
    fn snippets(&self, thread: Option<&ThreadKey>) -> Result<Vec<ReferenceSnippet>> {
        let mut out: Vec<ReferenceSnippet> = Vec::new();
        let own = thread
            .and_then(|key| self.per_thread.get(key))
            .map(Vec::as_slice)
            .unwrap_or_default();
        for name in own.iter().chain(&self.shared) {
            if out.iter().any(|snippet| &snippet.name == name) {
                continue;
            }
            self.read(name, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ThreadKey {
        ThreadKey::new(raw).expect("key")
    }

    #[test]
    fn thread_sees_own_and_shared_but_not_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("risk.md"), "risk rules").expect("write");
        fs::write(temp.path().join("tech.md"), "tech rules").expect("write");
        fs::write(temp.path().join("charter.md"), "charter").expect("write");

        let canon = CanonDir::new(temp.path(), vec!["charter.md".into()])
            .with_thread(key("risk_gate"), vec!["risk.md".into()])
            .with_thread(key("tech"), vec!["tech.md".into(), "charter.md".into()]);

        let risk = canon.snippets(Some(&key("risk_gate"))).expect("risk");
        let names: Vec<&str> = risk.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["risk.md", "charter.md"]);

        let tech = canon.snippets(Some(&key("tech"))).expect("tech");
        let names: Vec<&str> = tech.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["tech.md", "charter.md"]);

        let shared = canon.snippets(None).expect("shared");
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].text, "charter");
    }

    #[test]
    fn missing_files_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let canon = CanonDir::new(temp.path(), vec!["absent.md".into()]);
        assert!(canon.snippets(None).expect("snippets").is_empty());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("dir.md")).expect("mkdir");
        let canon = CanonDir::new(temp.path(), vec!["dir.md".into()]);
        assert!(canon.snippets(None).is_err());
    }
}

//! Per-thread directive files (`<outbox>/<thread>/next.md`).
//!
//! Unlike packet history these are overwritten in place, one per thread.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::frontmatter;
use crate::core::packet_id::PacketId;
use crate::core::types::{OutboxDirective, ThreadKey};
use crate::io::atomic::write_atomic;

const DIRECTIVE_NAME: &str = "next.md";

const PLACEHOLDER: &str = "No directive yet. Run a sync cycle.\n";

#[derive(Debug, Clone)]
pub struct OutboxStore {
    dir: PathBuf,
}

impl OutboxStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn directive_path(&self, thread: &ThreadKey) -> PathBuf {
        self.dir.join(thread.as_str()).join(DIRECTIVE_NAME)
    }

    /// Raw file contents, `None` when the file does not exist.
    pub fn read_raw(&self, thread: &ThreadKey) -> Result<Option<String>> {
        let path = self.directive_path(thread);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read directive {}", path.display())),
        }
    }

    /// The current directive for `thread`.
    ///
    /// Placeholders and hand-edited files without valid frontmatter read as
    /// `None`, which forces the next routing pass to regenerate them.
    pub fn read(&self, thread: &ThreadKey) -> Result<Option<OutboxDirective>> {
        let Some(contents) = self.read_raw(thread)? else {
            return Ok(None);
        };
        let Some(doc) = frontmatter::parse(&contents) else {
            return Ok(None);
        };
        let derived_from: Option<PacketId> = doc.get("derived_from").and_then(|v| v.parse().ok());
        let (Some(derived_from), Some(context_digest)) = (derived_from, doc.get("context")) else {
            debug!(thread = %thread, "directive has incomplete frontmatter");
            return Ok(None);
        };
        if doc.get("thread") != Some(thread.as_str()) {
            debug!(thread = %thread, "directive belongs to a different thread");
            return Ok(None);
        }
        Ok(Some(OutboxDirective {
            thread: thread.clone(),
            derived_from,
            context_digest: context_digest.to_string(),
            body: doc.body,
        }))
    }

    /// Atomically replace the directive for `directive.thread`.
    pub fn write(&self, directive: &OutboxDirective) -> Result<PathBuf> {
        let path = self.directive_path(&directive.thread);
        let rendered = frontmatter::render(
            &[
                ("thread", directive.thread.to_string()),
                ("derived_from", directive.derived_from.to_string()),
                ("context", directive.context_digest.clone()),
            ],
            &directive.body,
        );
        write_atomic(&path, &rendered)?;
        debug!(thread = %directive.thread, path = %path.display(), "directive written");
        Ok(path)
    }

    /// Create a placeholder directive when none exists (or always, with `force`).
    pub fn ensure_placeholder(&self, thread: &ThreadKey, force: bool) -> Result<bool> {
        let path = self.directive_path(thread);
        if path.exists() && !force {
            return Ok(false);
        }
        write_atomic(&path, PLACEHOLDER)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(thread: &str, body: &str) -> OutboxDirective {
        OutboxDirective {
            thread: ThreadKey::new(thread).expect("key"),
            body: body.to_string(),
            derived_from: "2026-02-11_143135".parse().expect("id"),
            context_digest: "0123456789abcdef".to_string(),
        }
    }

    #[test]
    fn write_then_read_returns_directive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = OutboxStore::new(temp.path());
        let written = directive("tech", "Ship the router.");

        let path = store.write(&written).expect("write");
        assert!(path.ends_with("tech/next.md"));
        assert_eq!(store.read(&written.thread).expect("read"), Some(written));
    }

    #[test]
    fn overwrite_replaces_previous_directive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = OutboxStore::new(temp.path());
        store.write(&directive("tech", "old")).expect("write old");
        store.write(&directive("tech", "new")).expect("write new");

        let read = store
            .read(&ThreadKey::new("tech").expect("key"))
            .expect("read")
            .expect("directive");
        assert_eq!(read.body, "new");
    }

    #[test]
    fn placeholder_reads_as_no_directive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = OutboxStore::new(temp.path());
        let thread = ThreadKey::new("risk_gate").expect("key");

        assert!(store.read(&thread).expect("missing").is_none());
        assert!(store.ensure_placeholder(&thread, false).expect("create"));
        assert!(!store.ensure_placeholder(&thread, false).expect("keep"));
        assert!(store.read(&thread).expect("placeholder").is_none());
        assert_eq!(
            store.read_raw(&thread).expect("raw").as_deref(),
            Some(PLACEHOLDER)
        );
    }

    #[test]
    fn placeholder_does_not_clobber_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = OutboxStore::new(temp.path());
        let written = directive("tech", "keep me");
        store.write(&written).expect("write");

        let thread = &written.thread;
        store.ensure_placeholder(thread, false).expect("ensure");
        assert_eq!(store.read(thread).expect("read"), Some(written.clone()));

        store.ensure_placeholder(thread, true).expect("force");
        assert!(store.read(thread).expect("read").is_none());
    }
}

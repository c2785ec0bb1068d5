//! Git publish collaborator.
//!
//! Publishing stages exactly the files a cycle wrote, never `add -A`, so
//! whatever else is in the working tree stays out of sync commits.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::process::isolate_process_group;

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Stage the given paths (absolute or relative to the workdir).
    pub fn add_paths(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let relative: Vec<String> = paths
            .iter()
            .map(|path| {
                path.strip_prefix(&self.workdir)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let mut args = vec!["add", "--"];
        args.extend(relative.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    pub fn head_short_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all)]
    pub fn push(&self) -> Result<()> {
        self.run_checked(&["push", "-q"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        isolate_process_group(&mut cmd);
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Files a cycle wrote plus the commit message to record them under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub paths: Vec<PathBuf>,
    pub message: String,
}

/// Pushes cycle output to a versioned store. Best-effort: the caller records
/// failures and carries on.
pub trait Publisher {
    /// Returns a one-line description of what was published.
    fn publish(&self, request: &PublishRequest) -> Result<String>;
}

pub struct GitPublisher {
    git: Git,
    push: bool,
}

impl GitPublisher {
    pub fn new(workdir: impl Into<PathBuf>, push: bool) -> Self {
        Self {
            git: Git::new(workdir),
            push,
        }
    }
}

impl Publisher for GitPublisher {
    #[instrument(skip_all, fields(paths = request.paths.len(), push = self.push))]
    fn publish(&self, request: &PublishRequest) -> Result<String> {
        self.git
            .add_paths(&request.paths)
            .context("stage cycle output")?;
        let committed = self
            .git
            .commit_staged(&request.message)
            .context("commit cycle output")?;
        if !committed {
            return Ok("nothing to commit".to_string());
        }
        let sha = self.git.head_short_sha()?;
        info!(commit = %sha, "cycle output committed");
        if self.push {
            self.git.push().context("push cycle output")?;
            return Ok(format!("committed {sha} and pushed"));
        }
        Ok(format!("committed {sha}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "bus@example.com"],
            vec!["config", "user.name", "Sync Bus"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        }
    }

    #[test]
    fn publish_stages_only_requested_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        init_repo(root);
        fs::write(root.join("packet.md"), "packet").expect("write");
        fs::write(root.join("scratch.txt"), "unrelated").expect("write");

        let publisher = GitPublisher::new(root, false);
        let request = PublishRequest {
            paths: vec![root.join("packet.md")],
            message: "Sync packet update (test)".to_string(),
        };
        let described = publisher.publish(&request).expect("publish");
        assert!(described.starts_with("committed "));

        let git = Git::new(root);
        let tracked = git.run_capture(&["ls-files"]).expect("ls-files");
        assert_eq!(tracked.trim(), "packet.md");
        let subject = git.run_capture(&["log", "-1", "--format=%s"]).expect("log");
        assert_eq!(subject.trim(), "Sync packet update (test)");

        assert_eq!(
            publisher.publish(&request).expect("again"),
            "nothing to commit"
        );
    }

    #[test]
    fn publish_outside_repo_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.md"), "a").expect("write");
        let publisher = GitPublisher::new(temp.path(), false);
        let request = PublishRequest {
            paths: vec![temp.path().join("a.md")],
            message: "m".to_string(),
        };
        assert!(publisher.publish(&request).is_err());
    }
}

//! Outbound notification after a changed cycle.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, instrument};

use crate::core::packet_id::PacketId;
use crate::io::process::{command_from_argv, run_command_with_timeout};

const OUTPUT_LIMIT: usize = 16 * 1024;

pub trait Notifier {
    /// Deliver `message`. Returns a one-line delivery note.
    fn notify(&self, message: &str) -> Result<String>;
}

/// Runs a configured command with the message on stdin (e.g. a webhook
/// script).
pub struct CommandNotifier {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            timeout,
        }
    }
}

impl Notifier for CommandNotifier {
    #[instrument(skip_all, fields(bytes = message.len()))]
    fn notify(&self, message: &str) -> Result<String> {
        let mut cmd = command_from_argv(&self.argv).context("notify command")?;
        cmd.current_dir(&self.workdir);
        let input = message.as_bytes();
        let output = run_command_with_timeout(cmd, Some(input), self.timeout, OUTPUT_LIMIT)
            .context("run notify command")?;
        if output.timed_out {
            bail!("notify command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "notify command exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            );
        }
        info!("notification sent");
        Ok("sent".to_string())
    }
}

/// Summary posted after a changed cycle: the first `top_n` written files and
/// the standing next actions.
pub fn render_notification(
    now: DateTime<Utc>,
    packet_id: &PacketId,
    changed: &[String],
    top_n: usize,
) -> String {
    let mut top: Vec<String> = changed
        .iter()
        .take(top_n)
        .map(|path| format!("- {path}"))
        .collect();
    if top.is_empty() {
        top.push("- (no file list)".to_string());
    }
    format!(
        "**sync cycle complete** ({})\n\n\
         **Packet** `{packet_id}`\n\n\
         **Top {top_n} changed files**\n{}\n\n\
         **Next actions**\n\
         - Check the latest sync packet in `sync/packets/latest.md`\n\
         - Pick up your directive in `sync/outbox/<thread>/next.md`\n\
         - Add a new inbox note if needed\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        top.join("\n"),
    )
}

/// Append a failed delivery to the notify error log.
pub fn record_notify_failure(log_path: &Path, now: DateTime<Utc>, error: &str) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    writeln!(
        file,
        "{} {}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        error.replace('\n', " ")
    )
    .with_context(|| format!("append {}", log_path.display()))
}

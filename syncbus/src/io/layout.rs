//! Canonical bus paths and `syncbus init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{EngineConfig, load_config, write_config};
use crate::io::inbox::TEMPLATE_NAME;
use crate::io::outbox::OutboxStore;

/// All canonical paths within a bus root.
#[derive(Debug, Clone)]
pub struct BusPaths {
    pub root: PathBuf,
    pub inbox_dir: PathBuf,
    pub canon_dir: PathBuf,
    pub packets_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub control_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub cycle_log_path: PathBuf,
    pub notify_errors_path: PathBuf,
    pub stop_path: PathBuf,
}

impl BusPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sync_dir = root.join("sync");
        let logs_dir = root.join("logs");
        let control_dir = root.join("control");
        Self {
            inbox_dir: root.join("inbox"),
            canon_dir: root.join("canon"),
            packets_dir: sync_dir.join("packets"),
            outbox_dir: sync_dir.join("outbox"),
            config_path: sync_dir.join("config.toml"),
            state_path: logs_dir.join("state.json"),
            cycle_log_path: logs_dir.join("cycles.jsonl"),
            notify_errors_path: logs_dir.join("notify_errors.log"),
            stop_path: control_dir.join("STOP"),
            logs_dir,
            control_dir,
            root,
        }
    }

    /// Path relative to the bus root, `/`-separated, for logs and messages.
    pub fn display_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Options for [`init_layout`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite the inbox template and directive placeholders.
    pub force: bool,
}

/// What [`init_layout`] created.
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub created: Vec<PathBuf>,
}

/// Create the bus layout under `root`.
///
/// Idempotent: existing files (including `sync/config.toml` and any
/// directive) are kept unless `force` is set. The config is never
/// overwritten.
pub fn init_layout(root: &Path, options: &InitOptions) -> Result<InitReport> {
    let paths = BusPaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!("init: {} is not a directory", paths.root.display()));
    }
    let mut report = InitReport::default();

    for dir in [
        &paths.inbox_dir,
        &paths.canon_dir,
        &paths.packets_dir,
        &paths.outbox_dir,
        &paths.logs_dir,
        &paths.control_dir,
    ] {
        if !dir.is_dir() {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
            report.created.push(dir.clone());
        }
    }

    if !paths.config_path.exists() {
        write_config(&paths.config_path, &EngineConfig::default())?;
        report.created.push(paths.config_path.clone());
    }
    let config = load_config(&paths.config_path)?;

    let template = paths.inbox_dir.join(TEMPLATE_NAME);
    if options.force || !template.exists() {
        fs::write(&template, INBOX_TEMPLATE)
            .with_context(|| format!("write file {}", template.display()))?;
        report.created.push(template);
    }

    let outbox = OutboxStore::new(&paths.outbox_dir);
    for key in config.thread_keys() {
        if outbox.ensure_placeholder(&key, options.force)? {
            report.created.push(outbox.directive_path(&key));
        }
    }

    info!(root = %paths.root.display(), created = report.created.len(), "bus layout initialized");
    Ok(report)
}

const INBOX_TEMPLATE: &str = "\
# Inbox note

Copy this file to `YYYY-MM-DD_HHMMSS_<source>.md` and fill it in.
Text before the first `## TO:` heading is shared with every thread.

## FROM: <source>

- what changed
- what should happen next

## TO:tech
- anything only the tech thread should see
";

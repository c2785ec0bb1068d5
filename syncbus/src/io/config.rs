//! Engine configuration stored at `sync/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::ThreadKey;
use crate::io::atomic::write_atomic;

/// Engine configuration (TOML).
///
/// Edited by humans. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between loop iterations.
    pub interval_secs: u64,

    /// A BUSY state untouched for this long is treated as a crashed run.
    pub stale_after_secs: u64,

    pub generator: GeneratorConfig,
    pub inbox: InboxConfig,
    pub references: ReferenceConfig,
    pub publish: PublishConfig,
    pub notify: NotifyConfig,

    /// Routing destinations, in routing order.
    pub threads: Vec<ThreadConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and writes text to stdout.
    pub command: Vec<String>,
    /// Per-call budget; a thread whose call exceeds it keeps its old directive.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InboxConfig {
    /// Newest entries included in generation context.
    pub excerpt_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Canon files visible to every thread and to packet generation.
    pub shared: Vec<String>,
    pub snippet_chars: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    /// Receives the message on stdin.
    pub command: Vec<String>,
    pub top_n: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadConfig {
    pub key: ThreadKey,
    /// Canon files private to this thread.
    #[serde(default)]
    pub references: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["ollama".into(), "run".into(), "llama3.2:3b".into()],
            timeout_secs: 120,
            output_limit_bytes: 64 * 1024,
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self { excerpt_limit: 3 }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            shared: vec!["FEATURES_TRACKER.md".into()],
            snippet_chars: 1500,
            max_chars: 6000,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            top_n: 3,
            timeout_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            stale_after_secs: 30 * 60,
            generator: GeneratorConfig::default(),
            inbox: InboxConfig::default(),
            references: ReferenceConfig::default(),
            publish: PublishConfig::default(),
            notify: NotifyConfig::default(),
            threads: default_threads(),
        }
    }
}

fn default_threads() -> Vec<ThreadConfig> {
    [
        ("gulf_chain_index", Some("gulf_chain_index.md")),
        ("spy_backtest", Some("spy_backtest_pipeline.md")),
        ("risk_gate", Some("risk_gate_spec.md")),
        ("tech", None),
    ]
    .into_iter()
    .filter_map(|(key, reference)| {
        Some(ThreadConfig {
            key: ThreadKey::new(key).ok()?,
            references: reference.into_iter().map(String::from).collect(),
        })
    })
    .collect()
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be > 0"));
        }
        if self.stale_after_secs == 0 {
            return Err(anyhow!("stale_after_secs must be > 0"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if !is_command(&self.generator.command) {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.inbox.excerpt_limit == 0 {
            return Err(anyhow!("inbox.excerpt_limit must be > 0"));
        }
        if self.references.snippet_chars == 0 || self.references.max_chars == 0 {
            return Err(anyhow!("references.snippet_chars and max_chars must be > 0"));
        }
        if self.notify.enabled && !is_command(&self.notify.command) {
            return Err(anyhow!("notify.command must be a non-empty array when notify is enabled"));
        }
        if self.notify.timeout_secs == 0 {
            return Err(anyhow!("notify.timeout_secs must be > 0"));
        }
        if self.threads.is_empty() {
            return Err(anyhow!("at least one [[threads]] entry is required"));
        }
        let mut seen = BTreeSet::new();
        for thread in &self.threads {
            if !seen.insert(&thread.key) {
                return Err(anyhow!("duplicate thread key '{}'", thread.key));
            }
            for name in &thread.references {
                validate_reference_name(name)?;
            }
        }
        for name in &self.references.shared {
            validate_reference_name(name)?;
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator.timeout_secs)
    }

    pub fn thread_keys(&self) -> Vec<ThreadKey> {
        self.threads
            .iter()
            .map(|thread| thread.key.clone())
            .collect()
    }
}

fn is_command(argv: &[String]) -> bool {
    argv.first().is_some_and(|p| !p.trim().is_empty())
}

/// Reference names are plain relative paths inside the canon directory.
fn validate_reference_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(anyhow!("reference '{name}' must be a relative path inside canon/"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

//! Shared deterministic types for the sync cycle engine.
//!
//! These types define stable contracts between the change detector, the
//! packet store, the router and the control plane. They must not depend on
//! external state or I/O.

use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::packet_id::PacketId;

/// One unit of operator/agent input found in the inbox.
///
/// Entries are created by external participants only; the engine never
/// mutates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    /// Path relative to the inbox directory, `/`-separated.
    pub path: String,
    pub content: String,
    /// Filesystem modification time. Informational only, never hashed.
    pub modified: Option<DateTime<Utc>>,
}

impl InboxEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            modified: None,
        }
    }
}

/// Order-independent digest of the inbox (hex-encoded SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxSignature(String);

impl InboxSignature {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for InboxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable history snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: PacketId,
    pub created_at: DateTime<Utc>,
    /// Inbox signature this packet was derived from.
    pub source_signature: InboxSignature,
    pub body: String,
}

/// Stable identifier of a routing destination.
///
/// The set of valid keys is configuration, never inferred from content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadKey(String);

impl ThreadKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_thread_key(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Thread keys double as directory names under the outbox, so keep them to
/// `[a-z0-9_-]`.
pub fn validate_thread_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(anyhow!("thread key must not be empty"));
    }
    if key
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'))
    {
        return Err(anyhow!("thread key must be [a-z0-9_-] only (got '{key}')"));
    }
    Ok(())
}

impl TryFrom<String> for ThreadKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ThreadKey> for String {
    fn from(value: ThreadKey) -> Self {
        value.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Targeted, overwritable "next message" for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxDirective {
    pub thread: ThreadKey,
    pub body: String,
    pub derived_from: PacketId,
    /// Digest of the generation context the body was produced from.
    pub context_digest: String,
}

/// Soft-stop state as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Clear,
    SoftStop,
}

/// How the body of a newly created packet was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum PacketSource {
    Generated,
    /// Generator unavailable; the deterministic fallback body was used.
    Fallback(String),
}

/// Per-thread result of one routing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ThreadOutcome {
    /// Directive rewritten from the current packet.
    Updated,
    /// Directive already derived from the current packet and context.
    Current,
    /// Generator failed or timed out; the previous directive was kept.
    GeneratorFailure(String),
    /// Reference material for the thread could not be read; directive kept.
    ContextUnavailable(String),
}

impl ThreadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ThreadOutcome::GeneratorFailure(_) | ThreadOutcome::ContextUnavailable(_)
        )
    }
}

/// Result of calling a best-effort collaborator (publish, notify).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CollaboratorOutcome {
    Skipped,
    Done(String),
    Failed(String),
}

//! Context assembly for packet and directive generation.
//!
//! Everything here is pure: given the same packet, inbox entries and
//! reference snippets the assembled contexts (and their digests) are
//! byte-identical across runs.
//!
//! Inbox entries may address sections to a thread with a `## TO:<thread>`
//! heading. Text under such a heading is private to that thread; text before
//! the first heading is broadcast to every thread.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::types::{InboxEntry, ThreadKey};

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^##[ \t]*TO:[ \t]*([A-Za-z0-9_-]+)[ \t]*$").expect("address regex is valid")
});

/// What a generation request produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "thread", rename_all = "snake_case")]
pub enum GenerationTarget {
    Packet,
    Thread(ThreadKey),
}

/// Input bundle handed to the content generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationContext {
    pub target: GenerationTarget,
    /// Empty when generating the packet itself.
    pub packet_body: String,
    pub inbox_excerpt: String,
    pub reference_excerpt: String,
}

impl GenerationContext {
    /// Thread key for directives, `packet` for the packet.
    pub fn label(&self) -> &str {
        self.thread_key().map_or("packet", ThreadKey::as_str)
    }

    pub fn thread_key(&self) -> Option<&ThreadKey> {
        match &self.target {
            GenerationTarget::Thread(key) => Some(key),
            GenerationTarget::Packet => None,
        }
    }

    /// Short digest identifying this exact context (16 hex chars).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let target = match &self.target {
            GenerationTarget::Packet => "packet".to_string(),
            GenerationTarget::Thread(key) => format!("thread:{key}"),
        };
        for part in [
            target.as_str(),
            &self.packet_body,
            &self.inbox_excerpt,
            &self.reference_excerpt,
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// A named piece of long-lived reference material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSnippet {
    pub name: String,
    pub text: String,
}

/// Newest `limit` entries, by file name descending.
///
/// Inbox files are named with a leading timestamp, so name order is
/// creation order.
pub fn newest_entries(entries: &[InboxEntry], limit: usize) -> Vec<&InboxEntry> {
    let mut sorted: Vec<&InboxEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.path.cmp(&a.path));
    sorted.truncate(limit);
    sorted
}

/// An inbox entry split into broadcast text and addressed sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedEntry {
    pub broadcast: String,
    /// `(thread, text)` in document order. Thread names are lowercased.
    pub sections: Vec<(String, String)>,
}

pub fn split_addressed(content: &str) -> AddressedEntry {
    let headings: Vec<_> = ADDRESS_RE.captures_iter(content).collect();
    let Some(first) = headings.first().and_then(|caps| caps.get(0)) else {
        return AddressedEntry {
            broadcast: content.trim().to_string(),
            sections: Vec::new(),
        };
    };

    let broadcast = content[..first.start()].trim().to_string();
    let mut sections = Vec::new();
    for (i, caps) in headings.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(content.len(), |m| m.start());
        let text = content[whole.end()..end].trim().to_string();
        sections.push((name.as_str().to_ascii_lowercase(), text));
    }
    AddressedEntry {
        broadcast,
        sections,
    }
}

/// Full inbox excerpt for packet generation.
pub fn packet_inbox_excerpt(entries: &[&InboxEntry]) -> String {
    let mut buf = String::new();
    for entry in entries {
        push_source(&mut buf, &entry.path, entry.content.trim());
    }
    buf.trim().to_string()
}

/// Inbox excerpt for one thread: broadcast text plus sections addressed to
/// `thread`. Sections addressed to other threads never appear.
pub fn thread_inbox_excerpt(entries: &[&InboxEntry], thread: &ThreadKey) -> String {
    let mut buf = String::new();
    for entry in entries {
        let addressed = split_addressed(&entry.content);
        let own: Vec<&str> = addressed
            .sections
            .iter()
            .filter(|(name, text)| name == thread.as_str() && !text.is_empty())
            .map(|(_, text)| text.as_str())
            .collect();
        if addressed.broadcast.is_empty() && own.is_empty() {
            continue;
        }
        let mut text = addressed.broadcast.clone();
        if !own.is_empty() {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&format!("## TO:{thread}\n"));
            text.push_str(&own.join("\n\n"));
        }
        push_source(&mut buf, &entry.path, &text);
    }
    buf.trim().to_string()
}

fn push_source(buf: &mut String, path: &str, text: &str) {
    buf.push_str("\n\n---\nSOURCE: ");
    buf.push_str(path);
    buf.push_str("\n---\n");
    buf.push_str(text);
    buf.push('\n');
}

/// Join snippets as `## <name>` sections, each capped at `snippet_chars`
/// and the whole excerpt capped at `max_chars`.
pub fn reference_excerpt(
    snippets: &[ReferenceSnippet],
    snippet_chars: usize,
    max_chars: usize,
) -> String {
    let parts: Vec<String> = snippets
        .iter()
        .filter_map(|snippet| {
            let text = snippet.text.trim();
            if text.is_empty() {
                return None;
            }
            let text = truncate_chars(text, snippet_chars);
            Some(format!("## {}\n{text}", snippet.name))
        })
        .collect();
    truncate_chars(parts.join("\n\n").trim(), max_chars).to_string()
}

/// Size caps applied to reference material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceLimits {
    pub snippet_chars: usize,
    pub max_chars: usize,
}

/// Context for generating a new packet body.
pub fn packet_context(
    newest: &[&InboxEntry],
    shared: &[ReferenceSnippet],
    limits: ReferenceLimits,
) -> GenerationContext {
    GenerationContext {
        target: GenerationTarget::Packet,
        packet_body: String::new(),
        inbox_excerpt: packet_inbox_excerpt(newest),
        reference_excerpt: reference_excerpt(shared, limits.snippet_chars, limits.max_chars),
    }
}

/// Context for one thread's directive. Only `snippets` scoped to `thread`
/// and inbox text visible to `thread` are included.
pub fn thread_context(
    thread: &ThreadKey,
    packet_body: &str,
    newest: &[&InboxEntry],
    snippets: &[ReferenceSnippet],
    limits: ReferenceLimits,
) -> GenerationContext {
    GenerationContext {
        target: GenerationTarget::Thread(thread.clone()),
        packet_body: packet_body.trim().to_string(),
        inbox_excerpt: thread_inbox_excerpt(newest, thread),
        reference_excerpt: reference_excerpt(snippets, limits.snippet_chars, limits.max_chars),
    }
}

/// Truncate on a character boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Deterministic packet body used when the generator is unavailable.
pub fn fallback_packet_body(label: &str, entries: &[&InboxEntry], reason: &str) -> String {
    let names = if entries.is_empty() {
        "none".to_string()
    } else {
        entries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "### Sync Packet — {label}\n\n\
         **Top changes (planned)**\n\
         - (generator unavailable) Review inbox files: {names}\n\
         - Publish updates\n\n\
         **Next actions**\n\
         - Check the generator command in sync/config.toml\n\
         - This packet is kept as is; add or edit an inbox note to trigger a new one\n\n\
         **Notes**\n\
         - Error: {reason}\n"
    )
}

//! Per-thread directive routing.
//!
//! For each configured thread: assemble the thread's context, skip it when
//! its directive is already derived from this exact context, otherwise ask
//! the generator for a body and overwrite the directive atomically. A thread
//! whose context or generator fails keeps its previous directive and does not
//! hold up the others. Only a failed directive write aborts routing.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::routing::{ReferenceLimits, newest_entries, thread_context};
use crate::core::types::{InboxEntry, OutboxDirective, Packet, ThreadKey, ThreadOutcome};
use crate::error::CycleError;
use crate::io::generator::{ContentGenerator, generate_with_deadline};
use crate::io::outbox::OutboxStore;
use crate::io::reference::ReferenceProvider;

/// Body written when the generator has nothing for a thread.
pub const NO_ACTION_BODY: &str = "No action needed.";

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub excerpt_limit: usize,
    pub limits: ReferenceLimits,
    pub timeout: Duration,
}

/// Result of routing one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadRoute {
    pub thread: ThreadKey,
    pub outcome: ThreadOutcome,
    /// The directive now on disk, when it is known to be current.
    #[serde(skip)]
    pub directive: Option<OutboxDirective>,
    /// Set when this pass rewrote the directive file.
    #[serde(skip)]
    pub written: Option<PathBuf>,
}

pub struct Router<'a> {
    pub outbox: &'a OutboxStore,
    pub references: &'a dyn ReferenceProvider,
    pub generator: &'a dyn ContentGenerator,
    pub settings: RouterSettings,
}

impl Router<'_> {
    /// Route `packet` to every thread in `threads`, in order.
    ///
    /// `progress` is called before each thread is handled.
    pub fn route(
        &self,
        packet: &Packet,
        entries: &[InboxEntry],
        threads: &[ThreadKey],
        mut progress: impl FnMut(&ThreadKey),
    ) -> Result<Vec<ThreadRoute>, CycleError> {
        let newest = newest_entries(entries, self.settings.excerpt_limit);
        let mut routes = Vec::with_capacity(threads.len());
        for thread in threads {
            progress(thread);
            routes.push(self.route_thread(packet, &newest, thread)?);
        }
        Ok(routes)
    }

    fn route_thread(
        &self,
        packet: &Packet,
        newest: &[&InboxEntry],
        thread: &ThreadKey,
    ) -> Result<ThreadRoute, CycleError> {
        let unchanged = |outcome: ThreadOutcome| ThreadRoute {
            thread: thread.clone(),
            outcome,
            directive: None,
            written: None,
        };

        let snippets = match self.references.snippets(Some(thread)) {
            Ok(snippets) => snippets,
            Err(err) => {
                warn!(
                    thread = %thread,
                    err = %format!("{err:#}"),
                    "reference material unavailable"
                );
                return Ok(unchanged(ThreadOutcome::ContextUnavailable(format!("{err:#}"))));
            }
        };
        let limits = self.settings.limits;
        let ctx = thread_context(thread, &packet.body, newest, &snippets, limits);
        let digest = ctx.digest();

        let existing = match self.outbox.read(thread) {
            Ok(existing) => existing,
            Err(err) => {
                warn!(thread = %thread, err = %format!("{err:#}"), "current directive unreadable");
                return Ok(unchanged(ThreadOutcome::ContextUnavailable(format!("{err:#}"))));
            }
        };
        let current = existing
            .filter(|d| d.derived_from == packet.id && d.context_digest == digest);
        if let Some(current) = current {
            debug!(thread = %thread, "directive already current");
            return Ok(ThreadRoute {
                thread: thread.clone(),
                outcome: ThreadOutcome::Current,
                directive: Some(current),
                written: None,
            });
        }

        let text = match generate_with_deadline(self.generator, &ctx, self.settings.timeout) {
            Ok(text) => text,
            Err(err) => {
                warn!(thread = %thread, err = %err, "generator failed, keeping previous directive");
                return Ok(unchanged(ThreadOutcome::GeneratorFailure(err.to_string())));
            }
        };
        let body = if text.trim().is_empty() {
            NO_ACTION_BODY.to_string()
        } else {
            text.trim().to_string()
        };
        let directive = OutboxDirective {
            thread: thread.clone(),
            body,
            derived_from: packet.id,
            context_digest: digest,
        };
        let context = format!("write directive for {thread}");
        let path = self
            .outbox
            .write(&directive)
            .map_err(|err| CycleError::WriteFailure(err.context(context)))?;
        info!(thread = %thread, packet_id = %packet.id, "directive updated");
        Ok(ThreadRoute {
            thread: thread.clone(),
            outcome: ThreadOutcome::Updated,
            directive: Some(directive),
            written: Some(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InboxSignature;
    use crate::io::reference::CanonDir;
    use crate::test_support::StubGenerator;
    use chrono::Utc;

    fn keys(raw: &[&str]) -> Vec<ThreadKey> {
        raw.iter()
            .map(|k| ThreadKey::new(*k).expect("key"))
            .collect()
    }

    fn packet(id: &str, body: &str) -> Packet {
        Packet {
            id: id.parse().expect("id"),
            created_at: Utc::now(),
            source_signature: InboxSignature::from_hex("00"),
            body: body.to_string(),
        }
    }

    fn settings() -> RouterSettings {
        RouterSettings {
            excerpt_limit: 3,
            limits: ReferenceLimits {
                snippet_chars: 1500,
                max_chars: 6000,
            },
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn failure_on_one_thread_leaves_it_and_updates_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outbox = OutboxStore::new(temp.path().join("outbox"));
        let canon = CanonDir::new(temp.path().join("canon"), Vec::new());
        let threads = keys(&["a", "b", "c", "d"]);

        let first = StubGenerator::new();
        let router = Router {
            outbox: &outbox,
            references: &canon,
            generator: &first,
            settings: settings(),
        };
        let p1 = packet("2026-02-11_143135", "first packet");
        router.route(&p1, &[], &threads, |_| {}).expect("route p1");
        let before_c = outbox.read_raw(&threads[2]).expect("read");

        let second = StubGenerator::new().timeout_for("c");
        let router = Router {
            generator: &second,
            ..router
        };
        let p2 = packet("2026-02-11_143200", "second packet");
        let routes = router.route(&p2, &[], &threads, |_| {}).expect("route p2");

        let outcomes: Vec<&ThreadOutcome> = routes.iter().map(|r| &r.outcome).collect();
        assert_eq!(outcomes[0], &ThreadOutcome::Updated);
        assert_eq!(outcomes[1], &ThreadOutcome::Updated);
        assert!(matches!(outcomes[2], ThreadOutcome::GeneratorFailure(_)));
        assert_eq!(outcomes[3], &ThreadOutcome::Updated);
        assert_eq!(outbox.read_raw(&threads[2]).expect("read"), before_c);
        let d = outbox.read(&threads[3]).expect("read").expect("directive");
        assert_eq!(d.derived_from, p2.id);
    }

    #[test]
    fn rerouting_same_packet_skips_generator() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outbox = OutboxStore::new(temp.path().join("outbox"));
        let canon = CanonDir::new(temp.path().join("canon"), Vec::new());
        let generator = StubGenerator::new();
        let router = Router {
            outbox: &outbox,
            references: &canon,
            generator: &generator,
            settings: settings(),
        };
        let threads = keys(&["tech"]);
        let p = packet("2026-02-11_143135", "body");

        router.route(&p, &[], &threads, |_| {}).expect("first");
        let routes = router.route(&p, &[], &threads, |_| {}).expect("second");

        assert_eq!(routes[0].outcome, ThreadOutcome::Current);
        assert!(routes[0].written.is_none());
        assert_eq!(generator.calls().len(), 1);
    }

    #[test]
    fn empty_generator_output_means_no_action() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outbox = OutboxStore::new(temp.path().join("outbox"));
        let canon = CanonDir::new(temp.path().join("canon"), Vec::new());
        let generator = StubGenerator::new().reply_for("tech", "   ");
        let router = Router {
            outbox: &outbox,
            references: &canon,
            generator: &generator,
            settings: settings(),
        };
        let threads = keys(&["tech"]);
        router
            .route(&packet("2026-02-11_143135", "body"), &[], &threads, |_| {})
            .expect("route");
        let d = outbox.read(&threads[0]).expect("read").expect("directive");
        assert_eq!(d.body, NO_ACTION_BODY);
    }

    #[test]
    fn progress_reports_each_thread_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outbox = OutboxStore::new(temp.path().join("outbox"));
        let canon = CanonDir::new(temp.path().join("canon"), Vec::new());
        let generator = StubGenerator::new();
        let router = Router {
            outbox: &outbox,
            references: &canon,
            generator: &generator,
            settings: settings(),
        };
        let threads = keys(&["x", "y"]);
        let mut seen = Vec::new();
        router
            .route(&packet("2026-02-11_143135", "b"), &[], &threads, |t| seen.push(t.to_string()))
            .expect("route");
        assert_eq!(seen, vec!["x", "y"]);
    }
}

//! One sync cycle: detect → (create packet) → refresh pointer → route →
//! publish/notify, bracketed by BUSY/IDLE.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::packet_id::PacketId;
use crate::core::routing::{ReferenceLimits, fallback_packet_body, newest_entries, packet_context};
use crate::core::run_status::StaleRecovery;
use crate::core::signature::{has_changed, signature};
use crate::core::types::{
    CollaboratorOutcome, InboxEntry, InboxSignature, PacketSource, ThreadOutcome,
};
use crate::error::CycleError;
use crate::io::config::{EngineConfig, load_config};
use crate::io::control::FileControl;
use crate::io::cycle_log::append_record;
use crate::io::generator::{CommandGenerator, ContentGenerator, generate_with_deadline};
use crate::io::git::{GitPublisher, PublishRequest, Publisher};
use crate::io::inbox::{DirInbox, InboxProvider};
use crate::io::layout::BusPaths;
use crate::io::notify::{CommandNotifier, Notifier, record_notify_failure, render_notification};
use crate::io::outbox::OutboxStore;
use crate::io::packet_store::PacketStore;
use crate::io::reference::{CanonDir, ReferenceProvider};
use crate::io::run_state::{FileRunStateStore, RunStateStore, RunStateTracker};
use crate::router::{Router, RouterSettings, ThreadRoute};

/// A bus root together with its loaded configuration.
#[derive(Debug, Clone)]
pub struct SyncBus {
    paths: BusPaths,
    config: EngineConfig,
}

impl SyncBus {
    /// Open the bus at `root`, loading `sync/config.toml` (defaults if absent).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = BusPaths::new(root);
        let config = load_config(&paths.config_path)?;
        Ok(Self { paths, config })
    }

    pub fn with_config(root: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            paths: BusPaths::new(root),
            config,
        })
    }

    pub fn paths(&self) -> &BusPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn packet_store(&self) -> PacketStore {
        PacketStore::new(&self.paths.packets_dir)
    }

    pub fn outbox(&self) -> OutboxStore {
        OutboxStore::new(&self.paths.outbox_dir)
    }

    pub fn control(&self) -> FileControl {
        FileControl::new(&self.paths.stop_path)
    }

    pub fn run_state_store(&self) -> FileRunStateStore {
        FileRunStateStore::new(&self.paths.state_path)
    }

    pub fn inbox(&self) -> DirInbox {
        DirInbox::new(&self.paths.inbox_dir)
    }

    pub fn references(&self) -> CanonDir {
        self.config.threads.iter().fold(
            CanonDir::new(&self.paths.canon_dir, self.config.references.shared.clone()),
            |canon, thread| canon.with_thread(thread.key.clone(), thread.references.clone()),
        )
    }

    fn reference_limits(&self) -> ReferenceLimits {
        ReferenceLimits {
            snippet_chars: self.config.references.snippet_chars,
            max_chars: self.config.references.max_chars,
        }
    }
}

/// Everything a cycle talks to outside the packet and outbox stores.
pub struct Collaborators<'a> {
    pub inbox: &'a dyn InboxProvider,
    pub references: &'a dyn ReferenceProvider,
    pub generator: &'a dyn ContentGenerator,
    pub run_state: &'a dyn RunStateStore,
    pub publisher: Option<&'a dyn Publisher>,
    pub notifier: Option<&'a dyn Notifier>,
}

/// Production collaborators built from the bus configuration.
pub struct StandardCollaborators {
    inbox: DirInbox,
    references: CanonDir,
    generator: CommandGenerator,
    run_state: FileRunStateStore,
    publisher: Option<GitPublisher>,
    notifier: Option<CommandNotifier>,
}

impl StandardCollaborators {
    pub fn from_bus(bus: &SyncBus) -> Result<Self> {
        let config = bus.config();
        let root = &bus.paths().root;
        Ok(Self {
            inbox: bus.inbox(),
            references: bus.references(),
            generator: CommandGenerator::new(
                config.generator.command.clone(),
                root,
                config.generator.output_limit_bytes,
            )?,
            run_state: bus.run_state_store(),
            publisher: config
                .publish
                .enabled
                .then(|| GitPublisher::new(root, config.publish.push)),
            notifier: config.notify.enabled.then(|| {
                CommandNotifier::new(
                    config.notify.command.clone(),
                    root,
                    Duration::from_secs(config.notify.timeout_secs),
                )
            }),
        })
    }

    pub fn borrow(&self) -> Collaborators<'_> {
        Collaborators {
            inbox: &self.inbox,
            references: &self.references,
            generator: &self.generator,
            run_state: &self.run_state,
            publisher: self.publisher.as_ref().map(|p| p as &dyn Publisher),
            notifier: self.notifier.as_ref().map(|n| n as &dyn Notifier),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    /// A new packet was created.
    pub changed: bool,
    /// The packet the pointer and directives now reflect.
    pub packet_id: PacketId,
    pub signature: InboxSignature,
    /// Set only when a packet was created.
    pub packet_source: Option<PacketSource>,
    pub pointer_refreshed: bool,
    pub routing: Vec<ThreadRoute>,
    pub publish: CollaboratorOutcome,
    pub notify: CollaboratorOutcome,
    /// A crashed run's BUSY state was cleared before this cycle.
    pub recovered: Option<StaleRecovery>,
    /// Files written, relative to the bus root.
    pub written: Vec<String>,
    pub duration_ms: u64,
}

impl CycleSummary {
    pub fn generator_failures(&self) -> usize {
        self.routing
            .iter()
            .filter(|route| matches!(route.outcome, ThreadOutcome::GeneratorFailure(_)))
            .count()
    }

    pub fn failed_threads(&self) -> impl Iterator<Item = &ThreadRoute> {
        self.routing
            .iter()
            .filter(|route| route.outcome.is_failure())
    }
}

#[derive(Serialize)]
struct CycleRecord<'a> {
    finished_at: DateTime<Utc>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    summary: Option<&'a CycleSummary>,
}

/// Run one cycle against `bus`.
///
/// Refuses with [`CycleError::AlreadyBusy`] (touching nothing) when another
/// cycle holds a fresh BUSY state. Every other exit path returns the run
/// state to IDLE and appends a record to the cycle log.
pub fn run_cycle(bus: &SyncBus, collab: &Collaborators<'_>) -> Result<CycleSummary, CycleError> {
    let tracker = RunStateTracker::new(collab.run_state, bus.config().stale_after());
    let recovered = match tracker.acquire() {
        Ok(recovered) => recovered,
        Err(err) => {
            warn!(err = %err, "cycle not started");
            return Err(err);
        }
    };

    let result = run_acquired(bus, collab, &tracker, recovered);

    let released = match &result {
        Ok(_) => tracker.mark_idle(),
        Err(err) => tracker.mark_failed(&err.to_string()),
    };
    let result = match (result, released) {
        (result, Ok(())) => result,
        (Ok(_), Err(err)) => Err(CycleError::StateUnavailable(err)),
        (Err(err), Err(release_err)) => {
            warn!(err = %format!("{release_err:#}"), "failed to clear BUSY after aborted cycle");
            Err(err)
        }
    };

    log_cycle(&bus.paths().cycle_log_path, &result);
    result
}

fn run_acquired(
    bus: &SyncBus,
    collab: &Collaborators<'_>,
    tracker: &RunStateTracker<'_>,
    recovered: Option<StaleRecovery>,
) -> Result<CycleSummary, CycleError> {
    let started = Instant::now();
    let started_at = Utc::now();
    let config = bus.config();
    let store = bus.packet_store();
    let step = |name: &str| {
        tracker
            .begin_step(name)
            .map_err(CycleError::StateUnavailable)
    };
    let mut written: Vec<PathBuf> = Vec::new();

    step("detect")?;
    let entries = collab
        .inbox
        .entries()
        .map_err(CycleError::SourceUnavailable)?;
    let current = signature(&entries);
    let newest = store.newest().map_err(CycleError::WriteFailure)?;
    let changed = has_changed(newest.as_ref().map(|p| &p.source_signature), &current);
    debug!(entries = entries.len(), signature = %current.short(), changed, "inbox scanned");

    let (packet, packet_source) = match newest {
        Some(packet) if !changed => (packet, None),
        _ => {
            step("packet")?;
            let (body, source) = packet_body(bus, collab, &entries, started_at);
            let packet = store
                .create(&current, &body, started_at)
                .map_err(CycleError::WriteFailure)?;
            written.push(store.packet_path(&packet.id));
            (packet, Some(source))
        }
    };

    step("pointer")?;
    let pointer_refreshed = store
        .refresh_latest_pointer(&packet)
        .map_err(CycleError::WriteFailure)?;
    if pointer_refreshed {
        written.push(store.latest_path());
    }

    let outbox = bus.outbox();
    let router = Router {
        outbox: &outbox,
        references: collab.references,
        generator: collab.generator,
        settings: RouterSettings {
            excerpt_limit: config.inbox.excerpt_limit,
            limits: bus.reference_limits(),
            timeout: config.generator_timeout(),
        },
    };
    let mut progress_err = None;
    let routing = router.route(&packet, &entries, &config.thread_keys(), |thread| {
        if let Err(err) = tracker.begin_step(&format!("route:{thread}")) {
            progress_err.get_or_insert(err);
        }
    })?;
    if let Some(err) = progress_err {
        return Err(CycleError::StateUnavailable(err));
    }
    written.extend(routing.iter().filter_map(|route| route.written.clone()));

    let paths = bus.paths();
    let written_rel: Vec<String> = written.iter().map(|p| paths.display_relative(p)).collect();

    let publish = match collab.publisher {
        Some(publisher) if !written.is_empty() => {
            step("publish")?;
            let request = PublishRequest {
                paths: written.clone(),
                message: format!(
                    "Sync packet update ({})",
                    started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            };
            match publisher.publish(&request) {
                Ok(note) => CollaboratorOutcome::Done(note),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "publish failed");
                    CollaboratorOutcome::Failed(format!("{err:#}"))
                }
            }
        }
        _ => CollaboratorOutcome::Skipped,
    };

    let notify = match collab.notifier {
        Some(notifier) if changed => {
            step("notify")?;
            let top_n = config.notify.top_n;
            let message = render_notification(started_at, &packet.id, &written_rel, top_n);
            match notifier.notify(&message) {
                Ok(note) => CollaboratorOutcome::Done(note),
                Err(err) => {
                    let detail = format!("{err:#}");
                    warn!(err = %detail, "notify failed");
                    let log_path = &paths.notify_errors_path;
                    if let Err(log_err) = record_notify_failure(log_path, Utc::now(), &detail) {
                        warn!(err = %format!("{log_err:#}"), "failed to record notify failure");
                    }
                    CollaboratorOutcome::Failed(detail)
                }
            }
        }
        _ => CollaboratorOutcome::Skipped,
    };

    tracker.end_step().map_err(CycleError::StateUnavailable)?;

    let summary = CycleSummary {
        started_at,
        changed,
        packet_id: packet.id,
        signature: current,
        packet_source,
        pointer_refreshed,
        routing,
        publish,
        notify,
        recovered,
        written: written_rel,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(
        changed = summary.changed,
        packet_id = %summary.packet_id,
        generator_failures = summary.generator_failures(),
        duration_ms = summary.duration_ms,
        "cycle finished"
    );
    Ok(summary)
}

/// Generated packet body, or the deterministic fallback when the generator
/// is unavailable.
fn packet_body(
    bus: &SyncBus,
    collab: &Collaborators<'_>,
    entries: &[InboxEntry],
    now: DateTime<Utc>,
) -> (String, PacketSource) {
    let newest = newest_entries(entries, bus.config().inbox.excerpt_limit);
    let shared = collab.references.snippets(None).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "shared reference material unavailable");
        Vec::new()
    });
    let ctx = packet_context(&newest, &shared, bus.reference_limits());
    let result = generate_with_deadline(collab.generator, &ctx, bus.config().generator_timeout());
    match result {
        Ok(text) if !text.trim().is_empty() => (text, PacketSource::Generated),
        Ok(_) => fallback(now, &newest, "generator returned an empty packet"),
        Err(err) => {
            warn!(err = %err, "packet generation failed, using fallback body");
            fallback(now, &newest, &err.to_string())
        }
    }
}

fn fallback(now: DateTime<Utc>, newest: &[&InboxEntry], reason: &str) -> (String, PacketSource) {
    let label = now.format("%Y-%m-%d %H:%M UTC").to_string();
    (
        fallback_packet_body(&label, newest, reason),
        PacketSource::Fallback(reason.to_string()),
    )
}

fn log_cycle(path: &Path, result: &Result<CycleSummary, CycleError>) {
    let record = match result {
        Ok(summary) => CycleRecord {
            finished_at: Utc::now(),
            ok: true,
            error_kind: None,
            error: None,
            summary: Some(summary),
        },
        Err(err) => CycleRecord {
            finished_at: Utc::now(),
            ok: false,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
            summary: None,
        },
    };
    if let Err(err) = append_record(path, &record) {
        warn!(err = %format!("{err:#}"), "failed to append cycle log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run_status::RunStatus;
    use crate::io::run_state::RunState;
    use crate::test_support::{MemoryRunState, StubGenerator, TestBus};

    #[test]
    fn unreadable_run_state_refuses_before_any_write() {
        let bus = TestBus::new(&["tech"]);
        bus.write_inbox("2026-02-11_143000_ops.md", "note");
        let harness = bus.harness();
        let state = MemoryRunState::new();
        state.fail_loads(true);
        let collab = Collaborators {
            run_state: &state,
            ..harness.collaborators()
        };

        let err = run_cycle(&bus.bus, &collab).expect_err("state offline");

        assert!(matches!(err, CycleError::StateUnavailable(_)));
        assert!(bus.history().is_empty());
        assert_eq!(harness.generator.calls().len(), 0);
    }

    #[test]
    fn clean_cycle_leaves_state_idle_and_forgets_old_error() {
        let bus = TestBus::new(&["tech"]);
        let harness = bus.harness();
        let state = MemoryRunState::with_state(RunState {
            last_error: Some("inbox unavailable".to_string()),
            ..RunState::default()
        });
        let collab = Collaborators {
            run_state: &state,
            ..harness.collaborators()
        };

        run_cycle(&bus.bus, &collab).expect("cycle");

        let after = state.state();
        assert_eq!(after.status, RunStatus::Idle);
        assert_eq!(after.current_step, None);
        assert_eq!(after.pid, None);
        assert_eq!(after.last_error, None);
        assert_ne!(after.updated_at, RunState::default().updated_at);
    }

    #[test]
    fn thread_context_carries_packet_and_scoped_reference() {
        let bus = TestBus::new(&["tech"]);
        bus.write_canon("FEATURES_TRACKER.md", "feature list");
        bus.write_inbox("2026-02-11_143000_ops.md", "note");
        let harness = bus
            .harness()
            .with_generator(StubGenerator::new().reply_packet("PACKET BODY"));

        let summary = run_cycle(&bus.bus, &harness.collaborators()).expect("cycle");

        assert_eq!(summary.packet_source, Some(PacketSource::Generated));
        assert_eq!(harness.generator.packet_calls(), 1);
        assert_eq!(harness.generator.thread_calls("tech"), 1);
        let calls = harness.generator.calls();
        let thread_ctx = calls
            .iter()
            .find(|ctx| ctx.thread_key().is_some())
            .expect("thread call");
        assert_eq!(thread_ctx.packet_body, "PACKET BODY");
        let excerpt = &thread_ctx.reference_excerpt;
        assert!(excerpt.contains("## FEATURES_TRACKER.md\nfeature list"));
    }

    #[test]
    fn failed_thread_is_reported_but_cycle_succeeds() {
        let bus = TestBus::new(&["tech", "ops"]);
        let harness = bus
            .harness()
            .with_generator(StubGenerator::new().fail_for("ops", "model crashed"));

        let summary = run_cycle(&bus.bus, &harness.collaborators()).expect("cycle");

        let failed: Vec<&str> = summary
            .failed_threads()
            .map(|r| r.thread.as_str())
            .collect();
        assert_eq!(failed, vec!["ops"]);
        assert!(bus.directive("ops").starts_with("No directive yet."));
        assert_eq!(summary.written.len(), 3);
    }
}

//! In-memory collaborators and a throwaway bus for tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::packet_id::PacketId;
use crate::core::routing::{GenerationContext, GenerationTarget};
use crate::core::types::{StopSignal, ThreadKey};
use crate::cycle::{Collaborators, SyncBus};
use crate::io::config::{EngineConfig, ThreadConfig, write_config};
use crate::io::control::ControlFlags;
use crate::io::generator::{ContentGenerator, GeneratorError};
use crate::io::git::{PublishRequest, Publisher};
use crate::io::inbox::DirInbox;
use crate::io::layout::{InitOptions, init_layout};
use crate::io::notify::Notifier;
use crate::io::reference::CanonDir;
use crate::io::run_state::{FileRunStateStore, RunState, RunStateStore};

const PACKET_KEY: &str = "";

#[derive(Debug, Clone)]
enum Rule {
    Timeout,
    Fail(String),
    Reply(String),
}

/// Deterministic generator: the default reply is a pure function of the
/// context, with per-target overrides.
#[derive(Debug, Default)]
pub struct StubGenerator {
    rules: HashMap<String, Rule>,
    calls: RefCell<Vec<GenerationContext>>,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rule(mut self, key: &str, rule: Rule) -> Self {
        self.rules.insert(key.to_string(), rule);
        self
    }

    /// Time out for `thread`.
    pub fn timeout_for(self, thread: &str) -> Self {
        self.with_rule(thread, Rule::Timeout)
    }

    pub fn fail_for(self, thread: &str, message: &str) -> Self {
        self.with_rule(thread, Rule::Fail(message.to_string()))
    }

    pub fn reply_for(self, thread: &str, reply: &str) -> Self {
        self.with_rule(thread, Rule::Reply(reply.to_string()))
    }

    pub fn fail_packet(self, message: &str) -> Self {
        self.with_rule(PACKET_KEY, Rule::Fail(message.to_string()))
    }

    pub fn reply_packet(self, reply: &str) -> Self {
        self.with_rule(PACKET_KEY, Rule::Reply(reply.to_string()))
    }

    /// Every context passed in, oldest first.
    pub fn calls(&self) -> Vec<GenerationContext> {
        self.calls.borrow().clone()
    }

    pub fn thread_calls(&self, thread: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|ctx| ctx.thread_key().is_some_and(|key| key.as_str() == thread))
            .count()
    }

    pub fn packet_calls(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|ctx| ctx.target == GenerationTarget::Packet)
            .count()
    }
}

impl ContentGenerator for StubGenerator {
    fn generate(
        &self,
        ctx: &GenerationContext,
        timeout: Duration,
    ) -> Result<String, GeneratorError> {
        self.calls.borrow_mut().push(ctx.clone());
        let key = ctx.thread_key().map_or(PACKET_KEY, ThreadKey::as_str);
        match self.rules.get(key) {
            Some(Rule::Timeout) => Err(GeneratorError::TimedOut(timeout)),
            Some(Rule::Fail(message)) => Err(GeneratorError::Failed(message.clone())),
            Some(Rule::Reply(reply)) => Ok(reply.clone()),
            None => Ok(default_reply(ctx)),
        }
    }
}

fn default_reply(ctx: &GenerationContext) -> String {
    match &ctx.target {
        GenerationTarget::Packet => {
            let digest = ctx.digest();
            let head: Vec<&str> = ctx.inbox_excerpt.lines().take(6).collect();
            let head = head.join("\n");
            format!("### Sync Packet\n\n**Inbox digest** {digest}\n\n{head}")
        }
        GenerationTarget::Thread(thread) => format!(
            "Directive for {thread}\n\n- context {}\n- packet: {}",
            ctx.digest(),
            ctx.packet_body.lines().next().unwrap_or_default()
        ),
    }
}

/// Run state held in memory.
#[derive(Debug, Default)]
pub struct MemoryRunState {
    state: RefCell<RunState>,
    fail_loads: Cell<bool>,
}

impl MemoryRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: RefCell::new(state),
            fail_loads: Cell::new(false),
        }
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.set(fail);
    }
}

impl RunStateStore for MemoryRunState {
    fn load(&self) -> Result<RunState> {
        if self.fail_loads.get() {
            return Err(anyhow!("state store offline"));
        }
        Ok(self.state.borrow().clone())
    }

    fn store(&self, state: &RunState) -> Result<()> {
        *self.state.borrow_mut() = state.clone();
        Ok(())
    }
}

/// Stop flag held in memory, optionally raising itself after a number of
/// checks.
#[derive(Debug, Default)]
pub struct MemoryControl {
    raised: Cell<bool>,
    checks: Cell<usize>,
    stop_after: Option<usize>,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `checks` reads see a clear flag; later reads see it raised.
    pub fn stop_after_checks(checks: usize) -> Self {
        Self {
            stop_after: Some(checks),
            ..Self::default()
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.get()
    }
}

impl ControlFlags for MemoryControl {
    fn stop_signal(&self) -> Result<StopSignal> {
        let checks = self.checks.get() + 1;
        self.checks.set(checks);
        if self.stop_after.is_some_and(|limit| checks > limit) {
            self.raised.set(true);
        }
        Ok(if self.raised.get() {
            StopSignal::SoftStop
        } else {
            StopSignal::Clear
        })
    }

    fn request_stop(&self, _reason: &str) -> Result<()> {
        self.raised.set(true);
        Ok(())
    }

    fn clear_stop(&self) -> Result<bool> {
        Ok(self.raised.replace(false))
    }
}

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    requests: RefCell<Vec<PublishRequest>>,
    failure: Option<String>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.borrow().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, request: &PublishRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match &self.failure {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(format!("recorded {} paths", request.paths.len())),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: RefCell<Vec<String>>,
    failure: Option<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) -> Result<String> {
        self.messages.borrow_mut().push(message.to_string());
        match &self.failure {
            Some(failure) => Err(anyhow!("{failure}")),
            None => Ok("recorded".to_string()),
        }
    }
}

/// An initialized bus in a temp directory, configured with the given
/// threads and no reference files.
pub struct TestBus {
    pub bus: SyncBus,
    _temp: TempDir,
}

impl TestBus {
    pub fn new(threads: &[&str]) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            threads: threads
                .iter()
                .map(|key| ThreadConfig {
                    key: ThreadKey::new(*key).expect("thread key"),
                    references: Vec::new(),
                })
                .collect(),
            ..EngineConfig::default()
        };
        let config_path = crate::io::layout::BusPaths::new(temp.path()).config_path;
        write_config(&config_path, &config).expect("write config");
        init_layout(temp.path(), &InitOptions::default()).expect("init layout");
        let bus = SyncBus::open(temp.path()).expect("open bus");
        Self { bus, _temp: temp }
    }

    pub fn write_inbox(&self, name: &str, content: &str) -> PathBuf {
        let path = self.bus.paths().inbox_dir.join(name);
        fs::write(&path, content).expect("write inbox entry");
        path
    }

    /// Packet ids in the history, oldest first.
    pub fn history(&self) -> Vec<PacketId> {
        self.bus.packet_store().history().expect("history")
    }

    pub fn remove_inbox(&self, name: &str) {
        fs::remove_file(self.bus.paths().inbox_dir.join(name)).expect("remove inbox entry");
    }

    pub fn write_canon(&self, name: &str, content: &str) {
        let path = self.bus.paths().canon_dir.join(name);
        fs::write(path, content).expect("write canon file");
    }

    pub fn directive(&self, thread: &str) -> String {
        let path = self
            .bus
            .outbox()
            .directive_path(&ThreadKey::new(thread).expect("thread key"));
        fs::read_to_string(path).expect("read directive")
    }

    pub fn harness(&self) -> Harness {
        Harness {
            inbox: self.bus.inbox(),
            references: self.bus.references(),
            generator: StubGenerator::new(),
            run_state: self.bus.run_state_store(),
            publisher: None,
            notifier: None,
        }
    }
}

/// Owned collaborators for a [`TestBus`]; real filesystem inbox, canon and
/// run state, stub generator and optional recording publisher/notifier.
pub struct Harness {
    pub inbox: DirInbox,
    pub references: CanonDir,
    pub generator: StubGenerator,
    pub run_state: FileRunStateStore,
    pub publisher: Option<RecordingPublisher>,
    pub notifier: Option<RecordingNotifier>,
}

impl Harness {
    pub fn with_generator(mut self, generator: StubGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_publisher(mut self, publisher: RecordingPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_notifier(mut self, notifier: RecordingNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
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

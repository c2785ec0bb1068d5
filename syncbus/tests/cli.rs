//! CLI tests: spawn the `syncbus` binary against a temp bus and check
//! output files and exit codes.
#![cfg(unix)]

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::Value;
use syncbus::core::run_status::RunStatus;
use syncbus::exit_codes;
use syncbus::io::cycle_log::last_record;
use syncbus::io::layout::BusPaths;
use syncbus::io::run_state::{RunState, load_run_state, write_run_state};

const CONFIG: &str = r#"
interval_secs = 1

[generator]
command = ["sh", "-c", "cat >/dev/null; echo generated text"]
timeout_secs = 10

[[threads]]
key = "tech"
"#;

/// Generation sleeps while a `slow` marker exists in the bus root.
const SLOW_CONFIG: &str = r#"
interval_secs = 60

[generator]
command = ["sh", "-c", "cat >/dev/null; if [ -e slow ]; then sleep 2; fi; echo generated text"]
timeout_secs = 30

[[threads]]
key = "tech"
"#;

fn syncbus(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_syncbus"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn syncbus")
}

fn init_bus(root: &Path) -> BusPaths {
    init_bus_with(root, CONFIG)
}

fn init_bus_with(root: &Path, config: &str) -> BusPaths {
    let paths = BusPaths::new(root);
    fs::create_dir_all(paths.config_path.parent().expect("parent")).expect("mkdir");
    fs::write(&paths.config_path, config).expect("write config");
    let out = syncbus(root, &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    paths
}

#[test]
fn run_creates_packet_then_reports_unchanged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_bus(temp.path());
    fs::write(paths.inbox_dir.join("2026-02-11_143000_ops.md"), "note").expect("write inbox");

    let first = syncbus(temp.path(), &["run"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("created"), "{stdout}");
    assert!(stdout.contains("tech=updated"), "{stdout}");
    let latest = fs::read_to_string(paths.packets_dir.join("latest.md")).expect("latest");
    assert!(latest.contains("generated text"));

    let second = syncbus(temp.path(), &["run"]);
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("unchanged"), "{stdout}");
    assert!(stdout.contains("tech=current"), "{stdout}");
}

#[test]
fn run_exits_busy_when_another_cycle_holds_the_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_bus(temp.path());
    write_run_state(
        &paths.state_path,
        &RunState {
            status: RunStatus::Busy,
            updated_at: Utc::now(),
            ..RunState::default()
        },
    )
    .expect("seed state");

    let out = syncbus(temp.path(), &["run"]);

    assert_eq!(out.status.code(), Some(exit_codes::BUSY));
    let mut packets = fs::read_dir(&paths.packets_dir).expect("packets");
    assert!(packets.next().is_none());
}

#[test]
fn stop_then_status_then_bounded_loop() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_bus(temp.path());

    let out = syncbus(temp.path(), &["stop"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(paths.stop_path.exists());

    let out = syncbus(temp.path(), &["status", "--json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let report: Value = serde_json::from_slice(&out.stdout).expect("status json");
    assert_eq!(report["status"], "IDLE");
    assert_eq!(report["stop_requested"], true);

    let out = syncbus(temp.path(), &["loop", "--max-cycles", "1"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("stopped after 0 cycles"));

    let out = syncbus(temp.path(), &["loop", "--max-cycles", "1", "--clear-stop"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("finished 1 cycles"));
    assert!(!paths.stop_path.exists());
}

/// Start `loop` as its own job, the way an interactive shell would, so a
/// signal to its process group stands in for Ctrl-C at the terminal.
fn spawn_loop(root: &Path) -> Child {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_syncbus"));
    cmd.arg("--root")
        .arg(root)
        .arg("loop")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0);
    cmd.spawn().expect("spawn loop")
}

fn interrupt_job(child: &Child) {
    let pgid = Pid::from_raw(i32::try_from(child.id()).expect("pid"));
    killpg(pgid, Signal::SIGINT).expect("send SIGINT");
}

fn wait_for_step(paths: &BusPaths, step: &str) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let state = load_run_state(&paths.state_path).expect("state");
        if state.current_step.as_deref() == Some(step) {
            return;
        }
        assert!(Instant::now() < deadline, "cycle never reached step {step}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn ctrl_c_mid_generation_lets_the_cycle_finish_with_generated_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_bus_with(temp.path(), SLOW_CONFIG);
    fs::write(temp.path().join("slow"), "").expect("slow marker");
    fs::write(paths.inbox_dir.join("2026-02-11_143000_ops.md"), "note").expect("write inbox");

    let child = spawn_loop(temp.path());
    wait_for_step(&paths, "packet");
    interrupt_job(&child);
    let out = child.wait_with_output().expect("wait loop");

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("tech=updated"), "{stdout}");
    assert!(stdout.contains("stopped after 1 cycles"), "{stdout}");
    let record = last_record(&paths.cycle_log_path)
        .expect("log")
        .expect("record");
    assert_eq!(record["ok"], true);
    assert_eq!(record["packet_source"]["kind"], "generated");
    let latest = fs::read_to_string(paths.packets_dir.join("latest.md")).expect("latest");
    assert!(latest.contains("generated text"));
    assert!(paths.stop_path.exists());
    let state = load_run_state(&paths.state_path).expect("state");
    assert_eq!(state.status, RunStatus::Idle);
}

#[test]
fn second_ctrl_c_exits_busy_until_the_state_goes_stale() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_bus_with(temp.path(), SLOW_CONFIG);
    let marker = temp.path().join("slow");
    fs::write(&marker, "").expect("slow marker");

    let mut child = spawn_loop(temp.path());
    wait_for_step(&paths, "packet");
    interrupt_job(&child);
    thread::sleep(Duration::from_millis(200));
    interrupt_job(&child);
    let status = child.wait().expect("wait loop");

    assert_eq!(status.code(), Some(exit_codes::HARD_STOP));
    let mut state = load_run_state(&paths.state_path).expect("state");
    assert_eq!(state.status, RunStatus::Busy);
    fs::remove_file(&marker).expect("remove marker");

    let refused = syncbus(temp.path(), &["run"]);
    assert_eq!(refused.status.code(), Some(exit_codes::BUSY));

    state.updated_at = Utc::now() - TimeDelta::hours(2);
    write_run_state(&paths.state_path, &state).expect("backdate state");
    let recovered = syncbus(temp.path(), &["run"]);

    assert_eq!(recovered.status.code(), Some(exit_codes::OK));
    let state = load_run_state(&paths.state_path).expect("state");
    assert_eq!(state.status, RunStatus::Idle);
    let recovery = state.last_recovery.expect("recovery noted");
    assert_eq!(recovery.step.as_deref(), Some("packet"));
}

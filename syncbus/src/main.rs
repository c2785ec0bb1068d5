//! File-tree coordination bus.
//!
//! Folds `inbox/` notes into timestamped sync packets and routes a
//! directive to each configured thread under `sync/outbox/`.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use syncbus::core::types::ThreadOutcome;
use syncbus::cycle::{CycleSummary, StandardCollaborators, SyncBus, run_cycle};
use syncbus::error::CycleError;
use syncbus::exit_codes;
use syncbus::io::control::{ControlFlags, install_signal_handlers};
use syncbus::io::layout::{InitOptions, init_layout};
use syncbus::logging;
use syncbus::looping::{LoopConfig, LoopStop, run_loop};
use syncbus::status::read_status;

#[derive(Parser)]
#[command(name = "syncbus", version, about = "File-tree coordination bus")]
struct Cli {
    /// Bus root directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the bus layout, inbox template and directive placeholders.
    Init {
        /// Overwrite the template and placeholders.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one sync cycle.
    Run {
        #[command(flatten)]
        toggles: Toggles,
        /// Print the cycle summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run sync cycles on an interval until stopped.
    Loop {
        /// Seconds between cycles (default: `interval_secs` from config).
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Remove a leftover stop flag before starting.
        #[arg(long)]
        clear_stop: bool,
        #[command(flatten)]
        toggles: Toggles,
    },
    /// Show run state, stop flag and latest packet.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Ask a running loop to stop after its current cycle.
    Stop {
        /// Remove the stop flag instead of creating it.
        #[arg(long)]
        clear: bool,
    },
}

/// Overrides for the collaborator switches in `sync/config.toml`.
#[derive(Args, Debug, Clone, Copy, Default)]
struct Toggles {
    /// Commit the files each cycle writes.
    #[arg(long)]
    publish: bool,
    /// Push after committing (implies --publish).
    #[arg(long)]
    push: bool,
    /// Run the notify command after changed cycles.
    #[arg(long)]
    notify: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(cli.root, force),
        Command::Run { toggles, json } => cmd_run(cli.root, toggles, json),
        Command::Loop {
            interval,
            max_cycles,
            clear_stop,
            toggles,
        } => cmd_loop(cli.root, interval, max_cycles, clear_stop, toggles),
        Command::Status { json } => cmd_status(cli.root, json),
        Command::Stop { clear } => cmd_stop(cli.root, clear),
    }
}

fn cmd_init(root: PathBuf, force: bool) -> Result<i32> {
    let report = init_layout(&root, &InitOptions { force })?;
    for path in &report.created {
        println!("created {}", path.display());
    }
    Ok(exit_codes::OK)
}

fn open_bus(root: PathBuf, toggles: Toggles) -> Result<SyncBus> {
    let mut bus = SyncBus::open(&root)
        .with_context(|| format!("open bus at {}", root.display()))?;
    let config = bus.config_mut();
    config.publish.enabled |= toggles.publish || toggles.push;
    config.publish.push |= toggles.push;
    config.notify.enabled |= toggles.notify;
    bus.config().validate()?;
    Ok(bus)
}

fn cmd_run(root: PathBuf, toggles: Toggles, json: bool) -> Result<i32> {
    let bus = open_bus(root, toggles)?;
    let collaborators = StandardCollaborators::from_bus(&bus)?;
    let result = run_cycle(&bus, &collaborators.borrow());
    match &result {
        Ok(summary) if json => println!("{}", serde_json::to_string_pretty(summary)?),
        _ => print_cycle(&result),
    }
    Ok(match result {
        Ok(_) => exit_codes::OK,
        Err(CycleError::AlreadyBusy { .. }) => exit_codes::BUSY,
        Err(_) => exit_codes::FAILED,
    })
}

fn cmd_loop(
    root: PathBuf,
    interval: Option<u64>,
    max_cycles: Option<u32>,
    clear_stop: bool,
    toggles: Toggles,
) -> Result<i32> {
    let mut bus = open_bus(root, toggles)?;
    if let Some(secs) = interval {
        bus.config_mut().interval_secs = secs;
        bus.config().validate()?;
    }
    let control = bus.control();
    if clear_stop && control.clear_stop()? {
        println!("cleared stop flag");
    }
    install_signal_handlers(control.clone())?;

    let collaborators = StandardCollaborators::from_bus(&bus)?;
    let cfg = LoopConfig::new(bus.config().interval()).with_max_cycles(max_cycles);
    let outcome = run_loop(&bus, &collaborators.borrow(), &control, &cfg, print_cycle)?;
    match outcome.stop {
        LoopStop::SoftStop => println!(
            "stopped after {} cycles ({} failed); remove {} or pass --clear-stop to resume",
            outcome.cycles_run,
            outcome.failures,
            bus.paths().display_relative(control.stop_path())
        ),
        LoopStop::MaxCycles => println!(
            "finished {} cycles ({} failed)",
            outcome.cycles_run, outcome.failures
        ),
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: PathBuf, json: bool) -> Result<i32> {
    let bus = SyncBus::open(&root)?;
    let report = read_status(&bus)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(exit_codes::OK)
}

fn cmd_stop(root: PathBuf, clear: bool) -> Result<i32> {
    let bus = SyncBus::open(&root)?;
    let control = bus.control();
    if clear {
        if control.clear_stop()? {
            println!("stop flag cleared");
        } else {
            println!("no stop flag");
        }
    } else {
        control.request_stop("requested via cli")?;
        println!("stop requested");
    }
    Ok(exit_codes::OK)
}

fn print_cycle(result: &Result<CycleSummary, CycleError>) {
    match result {
        Ok(summary) => {
            let verb = if summary.changed { "created" } else { "unchanged" };
            let threads: Vec<String> = summary
                .routing
                .iter()
                .map(|route| format!("{}={}", route.thread, outcome_label(&route.outcome)))
                .collect();
            println!(
                "packet {} {verb}; {}",
                summary.packet_id,
                if threads.is_empty() {
                    "no threads".to_string()
                } else {
                    threads.join(" ")
                }
            );
        }
        Err(err) => eprintln!("cycle failed: {err}"),
    }
}

fn outcome_label(outcome: &ThreadOutcome) -> &'static str {
    match outcome {
        ThreadOutcome::Updated => "updated",
        ThreadOutcome::Current => "current",
        ThreadOutcome::GeneratorFailure(_) => "generator-failed",
        ThreadOutcome::ContextUnavailable(_) => "context-unavailable",
    }
}

//! Read-only view of the bus for `syncbus status`.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::packet_id::PacketId;
use crate::core::run_status::{RunStatus, StaleRecovery};
use crate::core::types::{StopSignal, ThreadKey};
use crate::cycle::SyncBus;
use crate::io::control::ControlFlags;
use crate::io::cycle_log::last_record;
use crate::io::run_state::RunStateStore;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadStatus {
    pub thread: ThreadKey,
    /// Packet the directive was derived from; `None` for a placeholder.
    pub derived_from: Option<PacketId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub pid: Option<u32>,
    /// BUSY for longer than the stale threshold.
    pub stale: bool,
    pub last_error: Option<String>,
    pub last_recovery: Option<StaleRecovery>,
    pub stop_requested: bool,
    pub packets: usize,
    pub latest_packet: Option<PacketId>,
    /// Packet `latest.md` currently mirrors.
    pub pointer: Option<PacketId>,
    pub threads: Vec<ThreadStatus>,
    pub last_cycle: Option<Value>,
}

/// Gather status without taking BUSY or writing anything.
pub fn read_status(bus: &SyncBus) -> Result<StatusReport> {
    let state = bus.run_state_store().load()?;
    let stale = state.is_stale(Utc::now(), bus.config().stale_after());
    let store = bus.packet_store();
    let history = store.history()?;
    let pointer = store.read_latest_pointer()?.map(|packet| packet.id);
    let outbox = bus.outbox();
    let threads = bus
        .config()
        .thread_keys()
        .into_iter()
        .map(|thread| {
            let derived_from = outbox.read(&thread)?.map(|d| d.derived_from);
            Ok(ThreadStatus {
                thread,
                derived_from,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StatusReport {
        status: state.status,
        current_step: state.current_step,
        updated_at: state.updated_at,
        pid: state.pid,
        stale,
        last_error: state.last_error,
        last_recovery: state.last_recovery,
        stop_requested: bus.control().stop_signal()? == StopSignal::SoftStop,
        packets: history.len(),
        latest_packet: history.last().copied(),
        pointer,
        threads,
        last_cycle: last_record(&bus.paths().cycle_log_path)?,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state: {}", self.status.as_str())?;
        if let Some(step) = &self.current_step {
            write!(f, " ({step})")?;
        }
        if self.stale {
            write!(f, " [stale]")?;
        }
        writeln!(f)?;
        writeln!(f, "updated: {}", stamp(&self.updated_at))?;
        if let Some(err) = &self.last_error {
            writeln!(f, "last error: {err}")?;
        }
        if let Some(recovery) = &self.last_recovery {
            let recovered = stamp(&recovery.recovered_at);
            let since = stamp(&recovery.stale_since);
            writeln!(f, "last recovery: {recovered} (busy since {since})")?;
        }
        let stop = if self.stop_requested { "yes" } else { "no" };
        writeln!(f, "stop requested: {stop}")?;
        match &self.latest_packet {
            Some(id) => writeln!(f, "packets: {} (latest {id})", self.packets)?,
            None => writeln!(f, "packets: none")?,
        }
        for thread in &self.threads {
            match &thread.derived_from {
                Some(id) => writeln!(f, "  {}: {id}", thread.thread)?,
                None => writeln!(f, "  {}: (no directive)", thread.thread)?,
            }
        }
        Ok(())
    }
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

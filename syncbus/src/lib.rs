//! File-tree coordination bus.
//!
//! Participants drop notes into `inbox/`; each sync cycle folds a changed
//! inbox into an immutable, timestamped packet, mirrors it to
//! `sync/packets/latest.md`, and routes a per-thread directive into
//! `sync/outbox/<thread>/next.md`. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (signatures, packet ids, context
//!   assembly, staleness). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem stores, process
//!   execution, git). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`router`], [`cycle`], [`looping`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod router;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

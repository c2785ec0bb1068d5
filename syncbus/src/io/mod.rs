//! Side-effecting collaborators: filesystem stores, processes, git.

pub mod atomic;
pub mod config;
pub mod control;
pub mod cycle_log;
pub mod generator;
pub mod git;
pub mod inbox;
pub mod layout;
pub mod notify;
pub mod outbox;
pub mod packet_store;
pub mod process;
pub mod prompt;
pub mod reference;
pub mod run_state;

//! Deterministic, pure logic shared by the sync cycle.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod frontmatter;
pub mod packet_id;
pub mod routing;
pub mod run_status;
pub mod signature;
pub mod types;

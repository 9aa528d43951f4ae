//! EmberDB Core - Embedded Log-Structured Key-Value Storage Engine
//!
//! EmberDB is an LSM-tree based key-value store. This crate carries the
//! engine's write-ahead-log machinery:
//!
//! - **WAL writer**: appends logical records to segment files as
//!   checksummed, block-aligned physical records
//! - **WAL reader**: parses a segment back into its logical records,
//!   detecting and reporting corruption
//! - **Transaction-log iterator**: a seekable, forward-only cursor over
//!   write batches spanning the live and archived WAL directories

pub mod wal;

mod error;
mod types;

pub use error::{EmberError, Result};
pub use types::*;

/// EmberDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

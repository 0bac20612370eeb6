//! Dual-mode transaction control over a sorted key-value engine.
//!
//! This crate wraps the two engine flavors in [`tandem_engine`] behind a
//! single transaction handle. A [`TxHandle`] is configured, started,
//! driven through reads, writes, savepoints, and iteration, and finally
//! committed or rolled back; the concurrency discipline (validate at
//! commit versus lock at access) is chosen once, at handle construction,
//! and every later call is flavor-agnostic.
//!
//! Outcomes travel as [`TxResult`] values. For callers that want a flat
//! record instead of a sum type, [`Status`] and [`StatusKind`] project
//! any outcome onto a fixed taxonomy.

mod handle;
mod iter;
mod options;
mod status;

pub use handle::{EngineRef, TxHandle, TxStage};
pub use iter::TxIter;
pub use options::{ReadOptions, StartOptions, WriteOptions};
pub use status::{Status, StatusKind, TxError, TxResult};

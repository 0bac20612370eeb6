//! # Tandem Engine
//!
//! A sorted, versioned, in-memory key-value engine with two transaction
//! flavors over one shared [`Store`]:
//!
//! - [`OptimisticEngine`] validates at commit: reads are tracked, writes
//!   buffered, and commit fails with a conflict when a tracked read went
//!   stale (first committer wins).
//! - [`PessimisticEngine`] locks at access: exclusive per-key locks are
//!   taken on for-update reads and on writes, so commit never conflicts.
//!
//! Both flavors share the same transaction surface: buffered writes with
//! read-your-own-writes, savepoints, snapshots, and sorted range scans.
//! Keys and values are opaque byte sequences ([`bytes::Bytes`]); the engine
//! does not interpret their contents.

mod buffer;
mod error;
mod optimistic;
mod pessimistic;
mod store;

pub use error::{EngineError, EngineResult};
pub use optimistic::{OptimisticEngine, OptimisticTx, OptimisticTxOptions};
pub use pessimistic::{
    PessimisticConfig, PessimisticEngine, PessimisticTx, PessimisticTxOptions,
};
pub use store::{compute_crc32, ReadFlags, Store, VersionedRead, WriteFlags};

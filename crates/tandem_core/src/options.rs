//! Read, write, and transaction-start options.

use tandem_engine::{OptimisticTxOptions, PessimisticTxOptions, ReadFlags, WriteFlags};

/// Options applied to every put/delete of a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync to durable storage before a commit returns.
    pub sync: bool,
}

impl WriteOptions {
    pub(crate) fn flags(&self) -> WriteFlags {
        WriteFlags { sync: self.sync }
    }
}

/// Options applied to every get/iterator call of a transaction.
///
/// Range-deletion entries are always ignored: the field is fixed at
/// construction and has no mutator.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify stored checksums on read.
    pub verify_checksums: bool,
    /// Populate caches on read.
    pub fill_cache: bool,
    /// Skip range-deletion entries. Always true.
    pub ignore_range_deletions: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            ignore_range_deletions: true,
        }
    }
}

impl ReadOptions {
    pub(crate) fn flags(&self) -> ReadFlags {
        ReadFlags {
            verify_checksums: self.verify_checksums,
            fill_cache: self.fill_cache,
        }
    }
}

/// Start options for the transaction a handle will create.
///
/// Exactly one variant exists per handle, matching its engine reference:
/// a sum type rather than a pair of nullable fields, so "both set" and
/// "both absent" are unrepresentable.
#[derive(Debug, Clone, Copy)]
pub enum StartOptions {
    /// Options for beginning an optimistic transaction.
    Optimistic(OptimisticTxOptions),
    /// Options for beginning a pessimistic transaction.
    Pessimistic(PessimisticTxOptions),
}

impl StartOptions {
    /// Records whether a snapshot is taken atomically with `start()`.
    pub fn set_snapshot(&mut self, value: bool) {
        match self {
            Self::Optimistic(opts) => opts.set_snapshot = value,
            Self::Pessimistic(opts) => opts.set_snapshot = value,
        }
    }
}

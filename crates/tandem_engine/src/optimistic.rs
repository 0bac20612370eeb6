//! Optimistic (validate-at-commit) transactions.
//!
//! An optimistic transaction never blocks: reads record the version they
//! observed, writes are buffered, and commit validates the whole read set
//! against the store under its write lock. The first committer wins; a
//! later committer whose read set went stale gets [`EngineError::Conflict`]
//! and nothing is applied.

use crate::buffer::WriteBuffer;
use crate::error::{EngineError, EngineResult};
use crate::store::{ReadFlags, Store, WriteFlags};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Options for beginning an optimistic transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticTxOptions {
    /// Take a snapshot atomically with transaction creation.
    pub set_snapshot: bool,
}

/// An engine handing out optimistic transactions over a shared [`Store`].
#[derive(Debug)]
pub struct OptimisticEngine {
    store: Arc<Store>,
}

impl OptimisticEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Begins a transaction with the given start options.
    #[must_use]
    pub fn begin(&self, opts: &OptimisticTxOptions) -> OptimisticTx {
        let snapshot = opts.set_snapshot.then(|| self.store.committed_version());
        debug!(?snapshot, "begin optimistic transaction");
        OptimisticTx {
            store: Arc::clone(&self.store),
            snapshot,
            reads: HashMap::new(),
            buffer: WriteBuffer::new(),
            closed: false,
        }
    }
}

/// A live optimistic transaction.
///
/// Reads observe the snapshot (when one is set) and record versions for
/// commit-time validation. Writes are buffered and visible only to this
/// transaction until commit. Commit and rollback are terminal: every
/// operation afterwards reports [`EngineError::TxClosed`].
#[derive(Debug)]
pub struct OptimisticTx {
    store: Arc<Store>,
    snapshot: Option<u64>,
    /// Observed versions per key, first read wins (0 = key was absent).
    reads: HashMap<Bytes, u64>,
    buffer: WriteBuffer,
    closed: bool,
}

impl OptimisticTx {
    /// Reads `key`, seeing this transaction's own buffered writes first.
    ///
    /// Reads that reach the store are tracked for commit-time validation.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] after commit/rollback, or
    /// [`EngineError::Corruption`] on a verified checksum mismatch.
    pub fn get(&mut self, key: &[u8], flags: ReadFlags) -> EngineResult<Option<Bytes>> {
        self.ensure_open("get")?;
        if let Some(pending) = self.buffer.get(key) {
            return Ok(pending.clone());
        }
        let read = self.store.get(key, self.snapshot, flags)?;
        self.track_read(key, read.version);
        Ok(read.value)
    }

    /// Reads `key` and marks it for conflict detection even when the value
    /// comes from this transaction's own buffer.
    ///
    /// # Errors
    ///
    /// Same conditions as [`OptimisticTx::get`].
    pub fn get_for_update(&mut self, key: &[u8], flags: ReadFlags) -> EngineResult<Option<Bytes>> {
        self.ensure_open("get_for_update")?;
        let read = self.store.get(key, self.snapshot, flags)?;
        self.track_read(key, read.version);
        if let Some(pending) = self.buffer.get(key) {
            return Ok(pending.clone());
        }
        Ok(read.value)
    }

    /// Buffers a write.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn put(&mut self, key: Bytes, value: Bytes) -> EngineResult<()> {
        self.ensure_open("put")?;
        self.buffer.put(key, value);
        Ok(())
    }

    /// Buffers a delete.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn delete(&mut self, key: Bytes) -> EngineResult<()> {
        self.ensure_open("delete")?;
        self.buffer.delete(key);
        Ok(())
    }

    /// Takes (or refreshes) a snapshot at the current committed version.
    pub fn set_snapshot(&mut self) {
        self.snapshot = Some(self.store.committed_version());
    }

    /// Removes the active snapshot; later reads see the latest state.
    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// The pinned snapshot version, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<u64> {
        self.snapshot
    }

    /// Pushes a savepoint.
    pub fn set_savepoint(&mut self) {
        self.buffer.set_savepoint();
    }

    /// Reverts buffered writes to the most recent savepoint, keeping it.
    ///
    /// Reads tracked since the savepoint stay tracked; that can only make
    /// validation stricter, never unsound.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSavepoint`] on an empty stack,
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn rollback_to_savepoint(&mut self) -> EngineResult<()> {
        self.ensure_open("rollback_to_savepoint")?;
        self.buffer.rollback_to_savepoint()
    }

    /// Discards the most recent savepoint without reverting writes.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSavepoint`] on an empty stack,
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn pop_savepoint(&mut self) -> EngineResult<()> {
        self.ensure_open("pop_savepoint")?;
        self.buffer.pop_savepoint()
    }

    /// Validates the read set and applies buffered writes atomically.
    ///
    /// Terminal regardless of outcome: a conflicting transaction cannot be
    /// retried, a new one must be started.
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] when a read-set version changed, in which
    /// case nothing was applied; [`EngineError::TxClosed`] on reuse.
    pub fn commit(&mut self, flags: WriteFlags) -> EngineResult<u64> {
        self.ensure_open("commit")?;
        self.closed = true;
        let result = self
            .store
            .validate_and_apply(self.reads.iter(), self.buffer.iter(), flags);
        match &result {
            Ok(version) => debug!(version, "optimistic commit applied"),
            Err(err) => debug!(%err, "optimistic commit rejected"),
        }
        result
    }

    /// Discards all buffered writes. Terminal.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] on reuse.
    pub fn rollback(&mut self) -> EngineResult<()> {
        self.ensure_open("rollback")?;
        self.closed = true;
        self.buffer.clear();
        debug!("optimistic transaction rolled back");
        Ok(())
    }

    /// Scans `[start, end)` over the merged view: the store at this
    /// transaction's snapshot overlaid with its buffered writes.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] after commit/rollback, or
    /// [`EngineError::Corruption`] on a verified checksum mismatch.
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        flags: ReadFlags,
    ) -> EngineResult<Vec<(Bytes, Bytes)>> {
        if self.closed {
            return Err(EngineError::tx_closed("scan"));
        }
        let base = self.store.scan(start, end, self.snapshot, flags)?;
        Ok(merge_scan(base, &self.buffer, start, end))
    }

    /// Whether the transaction has been committed or rolled back.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn track_read(&mut self, key: &[u8], version: u64) {
        if let Entry::Vacant(slot) = self.reads.entry(Bytes::copy_from_slice(key)) {
            slot.insert(version);
        }
    }

    fn ensure_open(&self, context: &'static str) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::tx_closed(context))
        } else {
            Ok(())
        }
    }
}

/// Overlays a transaction's buffered writes onto a base scan result.
pub(crate) fn merge_scan(
    base: Vec<(Bytes, Bytes)>,
    buffer: &WriteBuffer,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Vec<(Bytes, Bytes)> {
    if buffer.is_empty() {
        return base;
    }
    let mut merged: std::collections::BTreeMap<Bytes, Bytes> = base.into_iter().collect();
    for (key, pending) in buffer.iter() {
        let in_range = start.map_or(true, |s| key.as_ref() >= s)
            && end.map_or(true, |e| key.as_ref() < e);
        if !in_range {
            continue;
        }
        match pending {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> OptimisticEngine {
        OptimisticEngine::new(Arc::new(Store::new()))
    }

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    #[test]
    fn read_your_own_writes() {
        let engine = engine();
        let mut tx = engine.begin(&OptimisticTxOptions::default());
        tx.put(b(b"k"), b(b"v")).unwrap();
        let got = tx.get(b"k", ReadFlags::default()).unwrap();
        assert_eq!(got, Some(b(b"v")));
    }

    #[test]
    fn buffered_delete_reads_as_absent() {
        let engine = engine();
        let mut setup = engine.begin(&OptimisticTxOptions::default());
        setup.put(b(b"k"), b(b"v")).unwrap();
        setup.commit(WriteFlags::default()).unwrap();

        let mut tx = engine.begin(&OptimisticTxOptions::default());
        tx.delete(b(b"k")).unwrap();
        assert_eq!(tx.get(b"k", ReadFlags::default()).unwrap(), None);
    }

    #[test]
    fn writes_invisible_until_commit() {
        let engine = engine();
        let mut writer = engine.begin(&OptimisticTxOptions::default());
        writer.put(b(b"k"), b(b"v")).unwrap();

        let mut reader = engine.begin(&OptimisticTxOptions::default());
        assert_eq!(reader.get(b"k", ReadFlags::default()).unwrap(), None);

        writer.commit(WriteFlags::default()).unwrap();
        let mut late = engine.begin(&OptimisticTxOptions::default());
        assert_eq!(
            late.get(b"k", ReadFlags::default()).unwrap(),
            Some(b(b"v"))
        );
    }

    #[test]
    fn first_committer_wins() {
        let engine = engine();
        let mut t1 = engine.begin(&OptimisticTxOptions::default());
        let mut t2 = engine.begin(&OptimisticTxOptions::default());

        t1.get(b"k", ReadFlags::default()).unwrap();
        t2.get(b"k", ReadFlags::default()).unwrap();
        t1.put(b(b"k"), b(b"t1")).unwrap();
        t2.put(b(b"k"), b(b"t2")).unwrap();

        t1.commit(WriteFlags::default()).unwrap();
        let result = t2.commit(WriteFlags::default());
        assert!(matches!(result, Err(EngineError::Conflict { .. })));

        // Loser's write must not be visible.
        let mut check = engine.begin(&OptimisticTxOptions::default());
        assert_eq!(
            check.get(b"k", ReadFlags::default()).unwrap(),
            Some(b(b"t1"))
        );
    }

    #[test]
    fn conflicting_tx_is_closed_after_commit() {
        let engine = engine();
        let mut t1 = engine.begin(&OptimisticTxOptions::default());
        let mut t2 = engine.begin(&OptimisticTxOptions::default());
        t1.get(b"k", ReadFlags::default()).unwrap();
        t2.get(b"k", ReadFlags::default()).unwrap();
        t1.put(b(b"k"), b(b"1")).unwrap();
        t2.put(b(b"k"), b(b"2")).unwrap();
        t1.commit(WriteFlags::default()).unwrap();
        assert!(t2.commit(WriteFlags::default()).is_err());
        assert!(t2.is_closed());
        assert!(matches!(
            t2.commit(WriteFlags::default()),
            Err(EngineError::TxClosed { .. })
        ));
    }

    #[test]
    fn blind_writes_do_not_conflict() {
        let engine = engine();
        let mut t1 = engine.begin(&OptimisticTxOptions::default());
        let mut t2 = engine.begin(&OptimisticTxOptions::default());
        t1.put(b(b"k"), b(b"1")).unwrap();
        t2.put(b(b"k"), b(b"2")).unwrap();
        t1.commit(WriteFlags::default()).unwrap();
        // No reads were tracked, so the blind overwrite succeeds.
        t2.commit(WriteFlags::default()).unwrap();
    }

    #[test]
    fn get_for_update_marks_buffered_key() {
        let engine = engine();
        let mut t1 = engine.begin(&OptimisticTxOptions::default());
        let mut t2 = engine.begin(&OptimisticTxOptions::default());

        // t2 writes blind, then reads for update: the key is now tracked.
        t2.put(b(b"k"), b(b"2")).unwrap();
        let seen = t2.get_for_update(b"k", ReadFlags::default()).unwrap();
        assert_eq!(seen, Some(b(b"2")));

        t1.put(b(b"k"), b(b"1")).unwrap();
        t1.commit(WriteFlags::default()).unwrap();

        assert!(matches!(
            t2.commit(WriteFlags::default()),
            Err(EngineError::Conflict { .. })
        ));
    }

    #[test]
    fn snapshot_taken_at_begin_pins_reads() {
        let engine = engine();
        let mut setup = engine.begin(&OptimisticTxOptions::default());
        setup.put(b(b"k"), b(b"old")).unwrap();
        setup.commit(WriteFlags::default()).unwrap();

        let opts = OptimisticTxOptions { set_snapshot: true };
        let mut pinned = engine.begin(&opts);

        let mut writer = engine.begin(&OptimisticTxOptions::default());
        writer.put(b(b"k"), b(b"new")).unwrap();
        writer.commit(WriteFlags::default()).unwrap();

        assert_eq!(
            pinned.get(b"k", ReadFlags::default()).unwrap(),
            Some(b(b"old"))
        );
    }

    #[test]
    fn clear_snapshot_sees_latest() {
        let engine = engine();
        let opts = OptimisticTxOptions { set_snapshot: true };
        let mut tx = engine.begin(&opts);

        let mut writer = engine.begin(&OptimisticTxOptions::default());
        writer.put(b(b"k"), b(b"v")).unwrap();
        writer.commit(WriteFlags::default()).unwrap();

        assert_eq!(tx.get(b"k", ReadFlags::default()).unwrap(), None);
        tx.clear_snapshot();
        assert!(tx.snapshot().is_none());
        assert_eq!(
            tx.get(b"k", ReadFlags::default()).unwrap(),
            Some(b(b"v"))
        );
    }

    #[test]
    fn rollback_discards_writes() {
        let engine = engine();
        let mut tx = engine.begin(&OptimisticTxOptions::default());
        tx.put(b(b"k"), b(b"v")).unwrap();
        tx.rollback().unwrap();

        let mut check = engine.begin(&OptimisticTxOptions::default());
        assert_eq!(check.get(b"k", ReadFlags::default()).unwrap(), None);
    }

    #[test]
    fn scan_merges_buffered_writes() {
        let engine = engine();
        let mut setup = engine.begin(&OptimisticTxOptions::default());
        setup.put(b(b"a"), b(b"1")).unwrap();
        setup.put(b(b"b"), b(b"2")).unwrap();
        setup.commit(WriteFlags::default()).unwrap();

        let mut tx = engine.begin(&OptimisticTxOptions::default());
        tx.put(b(b"c"), b(b"3")).unwrap();
        tx.delete(b(b"a")).unwrap();

        let items = tx.scan(None, None, ReadFlags::default()).unwrap();
        let keys: Vec<_> = items.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![b"b".as_ref(), b"c".as_ref()]);
    }
}

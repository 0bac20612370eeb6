//! Pessimistic (lock-at-access) transactions.
//!
//! A pessimistic transaction acquires an exclusive per-key lock the moment
//! a key is read for update, written, or deleted. Contended acquisitions
//! block the calling thread until the owner terminates or the configured
//! timeout elapses. Because conflicts are prevented up front, commit never
//! validates and never reports a conflict.

use crate::buffer::WriteBuffer;
use crate::error::{EngineError, EngineResult};
use crate::optimistic::merge_scan;
use crate::store::{ReadFlags, Store, WriteFlags};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Configuration for a pessimistic engine.
#[derive(Debug, Clone)]
pub struct PessimisticConfig {
    /// How long a lock acquisition may block before failing.
    pub lock_timeout: Duration,
}

impl Default for PessimisticConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
        }
    }
}

impl PessimisticConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, value: Duration) -> Self {
        self.lock_timeout = value;
        self
    }
}

/// Options for beginning a pessimistic transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PessimisticTxOptions {
    /// Take a snapshot atomically with transaction creation.
    pub set_snapshot: bool,
    /// Per-transaction lock timeout, overriding the engine default.
    pub lock_timeout: Option<Duration>,
}

/// Exclusive per-key locks shared by all transactions of one engine.
#[derive(Debug, Default)]
struct LockTable {
    owners: Mutex<HashMap<Bytes, u64>>,
    released: Condvar,
}

impl LockTable {
    /// Blocks until `owner` holds the lock on `key` or `timeout` elapses.
    ///
    /// Re-acquisition by the current owner returns immediately.
    fn acquire(&self, owner: u64, key: &[u8], timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let mut owners = self.owners.lock();
        loop {
            match owners.get(key) {
                None => {
                    owners.insert(Bytes::copy_from_slice(key), owner);
                    trace!(owner, ?key, "lock acquired");
                    return Ok(());
                }
                Some(&holder) if holder == owner => return Ok(()),
                Some(&holder) => {
                    trace!(owner, holder, ?key, "lock contended, waiting");
                    if self.released.wait_until(&mut owners, deadline).timed_out() {
                        return Err(EngineError::lock_timeout(Bytes::copy_from_slice(key)));
                    }
                }
            }
        }
    }

    /// Releases every lock held by `owner` and wakes all waiters.
    fn release_all(&self, owner: u64) {
        let mut owners = self.owners.lock();
        owners.retain(|_, holder| *holder != owner);
        self.released.notify_all();
    }
}

/// An engine handing out pessimistic transactions over a shared [`Store`].
#[derive(Debug)]
pub struct PessimisticEngine {
    store: Arc<Store>,
    locks: Arc<LockTable>,
    config: PessimisticConfig,
    next_txid: AtomicU64,
}

impl PessimisticEngine {
    /// Creates an engine over `store` with the given configuration.
    #[must_use]
    pub fn new(store: Arc<Store>, config: PessimisticConfig) -> Self {
        Self {
            store,
            locks: Arc::new(LockTable::default()),
            config,
            next_txid: AtomicU64::new(1),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Begins a transaction with the given start options.
    #[must_use]
    pub fn begin(&self, opts: &PessimisticTxOptions) -> PessimisticTx {
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let snapshot = opts.set_snapshot.then(|| self.store.committed_version());
        debug!(txid, ?snapshot, "begin pessimistic transaction");
        PessimisticTx {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            txid,
            lock_timeout: opts.lock_timeout.unwrap_or(self.config.lock_timeout),
            snapshot,
            buffer: WriteBuffer::new(),
            closed: false,
        }
    }
}

/// A live pessimistic transaction.
///
/// Locks acquired on access are held until commit, rollback, or drop.
/// Savepoint rollback reverts buffered writes but keeps the locks, matching
/// how lock-based engines behave: a lock once granted stays with the
/// transaction until it terminates.
#[derive(Debug)]
pub struct PessimisticTx {
    store: Arc<Store>,
    locks: Arc<LockTable>,
    txid: u64,
    lock_timeout: Duration,
    snapshot: Option<u64>,
    buffer: WriteBuffer,
    closed: bool,
}

impl PessimisticTx {
    /// Reads `key` without locking, seeing this transaction's own buffered
    /// writes first.
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
        Ok(self.store.get(key, self.snapshot, flags)?.value)
    }

    /// Acquires the exclusive lock on `key`, then reads it.
    ///
    /// Blocks while another transaction holds the lock.
    ///
    /// # Errors
    ///
    /// [`EngineError::LockTimeout`] when the wait exceeds the configured
    /// timeout; otherwise the same conditions as [`PessimisticTx::get`].
    pub fn get_for_update(&mut self, key: &[u8], flags: ReadFlags) -> EngineResult<Option<Bytes>> {
        self.ensure_open("get_for_update")?;
        self.locks.acquire(self.txid, key, self.lock_timeout)?;
        if let Some(pending) = self.buffer.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.store.get(key, self.snapshot, flags)?.value)
    }

    /// Acquires the key lock, then buffers a write.
    ///
    /// # Errors
    ///
    /// [`EngineError::LockTimeout`] on contention past the timeout,
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn put(&mut self, key: Bytes, value: Bytes) -> EngineResult<()> {
        self.ensure_open("put")?;
        self.locks.acquire(self.txid, &key, self.lock_timeout)?;
        self.buffer.put(key, value);
        Ok(())
    }

    /// Acquires the key lock, then buffers a delete.
    ///
    /// # Errors
    ///
    /// [`EngineError::LockTimeout`] on contention past the timeout,
    /// [`EngineError::TxClosed`] after commit/rollback.
    pub fn delete(&mut self, key: Bytes) -> EngineResult<()> {
        self.ensure_open("delete")?;
        self.locks.acquire(self.txid, &key, self.lock_timeout)?;
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

    /// Reverts buffered writes to the most recent savepoint, keeping both
    /// the savepoint and all acquired locks.
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

    /// Applies buffered writes at a new commit version and releases all
    /// locks. Terminal; conflicts cannot occur here because every written
    /// key was locked at access time.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] on reuse.
    pub fn commit(&mut self, flags: WriteFlags) -> EngineResult<u64> {
        self.ensure_open("commit")?;
        self.closed = true;
        let version = self.store.apply(self.buffer.iter(), flags);
        self.locks.release_all(self.txid);
        debug!(txid = self.txid, version, "pessimistic commit applied");
        Ok(version)
    }

    /// Discards buffered writes and releases all locks. Terminal.
    ///
    /// # Errors
    ///
    /// [`EngineError::TxClosed`] on reuse.
    pub fn rollback(&mut self) -> EngineResult<()> {
        self.ensure_open("rollback")?;
        self.closed = true;
        self.buffer.clear();
        self.locks.release_all(self.txid);
        debug!(txid = self.txid, "pessimistic transaction rolled back");
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

    fn ensure_open(&self, context: &'static str) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::tx_closed(context))
        } else {
            Ok(())
        }
    }
}

impl Drop for PessimisticTx {
    /// A dropped transaction must never leave its locks behind.
    fn drop(&mut self) {
        if !self.closed {
            self.locks.release_all(self.txid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn engine() -> PessimisticEngine {
        PessimisticEngine::new(Arc::new(Store::new()), PessimisticConfig::default())
    }

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    #[test]
    fn put_commit_get() {
        let engine = engine();
        let mut tx = engine.begin(&PessimisticTxOptions::default());
        tx.put(b(b"k"), b(b"v")).unwrap();
        tx.commit(WriteFlags::default()).unwrap();

        let mut check = engine.begin(&PessimisticTxOptions::default());
        assert_eq!(check.get(b"k", ReadFlags::default()).unwrap(), Some(b(b"v")));
    }

    #[test]
    fn lock_contention_times_out() {
        let engine = PessimisticEngine::new(
            Arc::new(Store::new()),
            PessimisticConfig::new().lock_timeout(Duration::from_millis(50)),
        );
        let mut holder = engine.begin(&PessimisticTxOptions::default());
        holder.get_for_update(b"k", ReadFlags::default()).unwrap();

        let mut waiter = engine.begin(&PessimisticTxOptions::default());
        let result = waiter.get_for_update(b"k", ReadFlags::default());
        assert!(matches!(result, Err(EngineError::LockTimeout { .. })));
    }

    #[test]
    fn reacquisition_by_owner_is_free() {
        let engine = engine();
        let mut tx = engine.begin(&PessimisticTxOptions::default());
        tx.get_for_update(b"k", ReadFlags::default()).unwrap();
        tx.put(b(b"k"), b(b"v")).unwrap();
        tx.get_for_update(b"k", ReadFlags::default()).unwrap();
        tx.commit(WriteFlags::default()).unwrap();
    }

    #[test]
    fn commit_releases_locks() {
        let engine = engine();
        let mut first = engine.begin(&PessimisticTxOptions::default());
        first.put(b(b"k"), b(b"1")).unwrap();
        first.commit(WriteFlags::default()).unwrap();

        let mut second = engine.begin(&PessimisticTxOptions::default());
        second.get_for_update(b"k", ReadFlags::default()).unwrap();
    }

    #[test]
    fn rollback_releases_locks_and_discards_writes() {
        let engine = engine();
        let mut first = engine.begin(&PessimisticTxOptions::default());
        first.put(b(b"k"), b(b"1")).unwrap();
        first.rollback().unwrap();

        let mut second = engine.begin(&PessimisticTxOptions::default());
        assert_eq!(second.get(b"k", ReadFlags::default()).unwrap(), None);
        second.get_for_update(b"k", ReadFlags::default()).unwrap();
    }

    #[test]
    fn drop_releases_locks() {
        let engine = engine();
        {
            let mut tx = engine.begin(&PessimisticTxOptions::default());
            tx.get_for_update(b"k", ReadFlags::default()).unwrap();
        }
        let mut next = engine.begin(&PessimisticTxOptions::default());
        next.get_for_update(b"k", ReadFlags::default()).unwrap();
    }

    #[test]
    fn second_for_update_blocks_until_first_terminates() {
        let store = Arc::new(Store::new());
        let engine = Arc::new(PessimisticEngine::new(
            store,
            PessimisticConfig::new().lock_timeout(Duration::from_secs(5)),
        ));

        let mut first = engine.begin(&PessimisticTxOptions::default());
        first.get_for_update(b"k", ReadFlags::default()).unwrap();
        first.put(b(b"k"), b(b"first")).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let engine2 = Arc::clone(&engine);
        let waiter = thread::spawn(move || {
            let mut tx = engine2.begin(&PessimisticTxOptions::default());
            started_tx.send(()).unwrap();
            // Blocks until the first transaction commits.
            let seen = tx.get_for_update(b"k", ReadFlags::default()).unwrap();
            tx.rollback().unwrap();
            seen
        });

        started_rx.recv().unwrap();
        // Give the waiter time to reach the contended acquire.
        thread::sleep(Duration::from_millis(50));
        first.commit(WriteFlags::default()).unwrap();

        let seen = waiter.join().unwrap();
        assert_eq!(seen, Some(b(b"first")));
    }

    #[test]
    fn per_transaction_timeout_overrides_engine_default() {
        let engine = engine();
        let mut holder = engine.begin(&PessimisticTxOptions::default());
        holder.get_for_update(b"k", ReadFlags::default()).unwrap();

        let opts = PessimisticTxOptions {
            lock_timeout: Some(Duration::from_millis(10)),
            ..PessimisticTxOptions::default()
        };
        let mut waiter = engine.begin(&opts);
        let start = Instant::now();
        let result = waiter.get_for_update(b"k", ReadFlags::default());
        assert!(matches!(result, Err(EngineError::LockTimeout { .. })));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn savepoint_rollback_keeps_locks() {
        let engine = PessimisticEngine::new(
            Arc::new(Store::new()),
            PessimisticConfig::new().lock_timeout(Duration::from_millis(50)),
        );
        let mut tx = engine.begin(&PessimisticTxOptions::default());
        tx.set_savepoint();
        tx.put(b(b"k"), b(b"v")).unwrap();
        tx.rollback_to_savepoint().unwrap();
        assert_eq!(tx.get(b"k", ReadFlags::default()).unwrap(), None);

        // The lock from the reverted put is still held.
        let mut other = engine.begin(&PessimisticTxOptions::default());
        let result = other.get_for_update(b"k", ReadFlags::default());
        assert!(matches!(result, Err(EngineError::LockTimeout { .. })));
    }
}

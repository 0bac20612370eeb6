//! The transaction handle.
//!
//! A [`TxHandle`] drives one transaction against one engine, optimistic or
//! pessimistic, behind a single interface. It owns the option set and the
//! engine transaction object; the engine itself is only borrowed. The
//! handle moves through an explicit state machine:
//!
//! ```text
//! Configuring --start()--> Active --commit()/rollback()--> Terminated
//! ```
//!
//! Option mutators are valid while configuring and while active; reads,
//! writes, savepoints, and iterators require `Active`; nothing leaves
//! `Terminated`. The handle is single-threaded: operations take `&mut
//! self` and there is no internal locking. Distinct handles over the same
//! engine may run concurrently; isolation between them is the engine's
//! job, the handle only configures and drives it.

use crate::options::{ReadOptions, StartOptions, WriteOptions};
use crate::status::{TxError, TxResult};
use bytes::Bytes;
use tandem_engine::{
    OptimisticEngine, OptimisticTx, OptimisticTxOptions, PessimisticEngine, PessimisticTx,
    PessimisticTxOptions, ReadFlags, WriteFlags,
};
use tracing::debug;

/// A borrowed reference to one of the two engine flavors.
///
/// Exactly one variant exists per handle; the handle never owns the engine
/// and must not outlive it.
#[derive(Debug, Clone, Copy)]
pub enum EngineRef<'a> {
    /// A validate-at-commit engine.
    Optimistic(&'a OptimisticEngine),
    /// A lock-at-access engine.
    Pessimistic(&'a PessimisticEngine),
}

/// The live engine transaction, matching the handle's engine variant.
#[derive(Debug)]
pub(crate) enum TxInner {
    /// An optimistic engine transaction.
    Optimistic(OptimisticTx),
    /// A pessimistic engine transaction.
    Pessimistic(PessimisticTx),
}

impl TxInner {
    fn get(&mut self, key: &[u8], for_update: bool, flags: ReadFlags) -> TxResult<Option<Bytes>> {
        let value = match self {
            Self::Optimistic(tx) if for_update => tx.get_for_update(key, flags)?,
            Self::Optimistic(tx) => tx.get(key, flags)?,
            Self::Pessimistic(tx) if for_update => tx.get_for_update(key, flags)?,
            Self::Pessimistic(tx) => tx.get(key, flags)?,
        };
        Ok(value)
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.put(key, value)?,
            Self::Pessimistic(tx) => tx.put(key, value)?,
        }
        Ok(())
    }

    fn delete(&mut self, key: Bytes) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.delete(key)?,
            Self::Pessimistic(tx) => tx.delete(key)?,
        }
        Ok(())
    }

    fn commit(&mut self, flags: WriteFlags) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.commit(flags)?,
            Self::Pessimistic(tx) => tx.commit(flags)?,
        };
        Ok(())
    }

    fn rollback(&mut self) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.rollback()?,
            Self::Pessimistic(tx) => tx.rollback()?,
        }
        Ok(())
    }

    fn set_snapshot(&mut self) {
        match self {
            Self::Optimistic(tx) => tx.set_snapshot(),
            Self::Pessimistic(tx) => tx.set_snapshot(),
        }
    }

    fn clear_snapshot(&mut self) {
        match self {
            Self::Optimistic(tx) => tx.clear_snapshot(),
            Self::Pessimistic(tx) => tx.clear_snapshot(),
        }
    }

    fn set_savepoint(&mut self) {
        match self {
            Self::Optimistic(tx) => tx.set_savepoint(),
            Self::Pessimistic(tx) => tx.set_savepoint(),
        }
    }

    fn rollback_to_savepoint(&mut self) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.rollback_to_savepoint()?,
            Self::Pessimistic(tx) => tx.rollback_to_savepoint()?,
        }
        Ok(())
    }

    fn pop_savepoint(&mut self) -> TxResult<()> {
        match self {
            Self::Optimistic(tx) => tx.pop_savepoint()?,
            Self::Pessimistic(tx) => tx.pop_savepoint()?,
        }
        Ok(())
    }

    pub(crate) fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        flags: ReadFlags,
    ) -> TxResult<Vec<(Bytes, Bytes)>> {
        let items = match self {
            Self::Optimistic(tx) => tx.scan(start, end, flags)?,
            Self::Pessimistic(tx) => tx.scan(start, end, flags)?,
        };
        Ok(items)
    }
}

/// Where a handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// Options may be configured; the engine transaction does not exist yet.
    Configuring,
    /// `start()` has run; reads, writes, and savepoints are valid.
    Active,
    /// Commit or rollback has run; no operation is valid anymore.
    Terminated,
}

/// Internal state: the engine transaction is absent before `start()` and
/// after termination, and its presence is what the enum encodes.
#[derive(Debug)]
enum TxState {
    Configuring,
    Active(TxInner),
    Terminated,
}

/// A dual-mode transaction handle.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tandem_core::TxHandle;
/// use tandem_engine::{OptimisticEngine, Store};
///
/// let engine = OptimisticEngine::new(Arc::new(Store::new()));
/// let mut tx = TxHandle::optimistic(&engine);
/// tx.start()?;
/// tx.put(b"greeting".as_ref(), b"hello".as_ref())?;
/// assert!(tx.get(b"greeting", false)?.is_some());
/// tx.commit()?;
/// # Ok::<(), tandem_core::TxError>(())
/// ```
#[derive(Debug)]
pub struct TxHandle<'a> {
    engine: EngineRef<'a>,
    start_options: StartOptions,
    write_options: WriteOptions,
    read_options: ReadOptions,
    state: TxState,
}

impl<'a> TxHandle<'a> {
    /// Creates a handle over an optimistic engine with defaulted options.
    #[must_use]
    pub fn optimistic(engine: &'a OptimisticEngine) -> Self {
        Self {
            engine: EngineRef::Optimistic(engine),
            start_options: StartOptions::Optimistic(OptimisticTxOptions::default()),
            write_options: WriteOptions::default(),
            read_options: ReadOptions::default(),
            state: TxState::Configuring,
        }
    }

    /// Creates a handle over a pessimistic engine with defaulted options.
    #[must_use]
    pub fn pessimistic(engine: &'a PessimisticEngine) -> Self {
        Self {
            engine: EngineRef::Pessimistic(engine),
            start_options: StartOptions::Pessimistic(PessimisticTxOptions::default()),
            write_options: WriteOptions::default(),
            read_options: ReadOptions::default(),
            state: TxState::Configuring,
        }
    }

    /// The handle's current lifecycle stage.
    #[must_use]
    pub fn stage(&self) -> TxStage {
        match self.state {
            TxState::Configuring => TxStage::Configuring,
            TxState::Active(_) => TxStage::Active,
            TxState::Terminated => TxStage::Terminated,
        }
    }

    /// The borrowed engine reference.
    #[must_use]
    pub fn engine(&self) -> EngineRef<'a> {
        self.engine
    }

    // === Option mutators ===

    /// Sets whether reads verify stored checksums.
    pub fn verify_checksums(&mut self, value: bool) {
        self.read_options.verify_checksums = value;
    }

    /// Sets whether reads populate caches.
    pub fn fill_cache(&mut self, value: bool) {
        self.read_options.fill_cache = value;
    }

    /// Sets whether commits sync to durable storage before returning.
    pub fn sync_writes(&mut self, value: bool) {
        self.write_options.sync = value;
    }

    /// Requests or releases snapshot semantics.
    ///
    /// Before `start()`, this records the flag in the start options so the
    /// snapshot is taken atomically with transaction creation. After
    /// `start()`, `true` takes a snapshot on the live transaction
    /// immediately; `false` is a no-op, since an active snapshot is sticky
    /// and only [`TxHandle::clear_snapshot`] removes it.
    pub fn set_snapshot(&mut self, value: bool) {
        match &mut self.state {
            TxState::Configuring => self.start_options.set_snapshot(value),
            TxState::Active(inner) => {
                if value {
                    inner.set_snapshot();
                }
            }
            TxState::Terminated => {}
        }
    }

    /// Removes the active snapshot from the live transaction.
    ///
    /// # Errors
    ///
    /// `InvalidState` when no live transaction exists.
    pub fn clear_snapshot(&mut self) -> TxResult<()> {
        self.active_mut("clear_snapshot")?.clear_snapshot();
        Ok(())
    }

    // === Lifecycle ===

    /// Materializes the engine transaction from the current start options.
    ///
    /// # Errors
    ///
    /// `InvalidState` when called twice or on a terminated handle.
    pub fn start(&mut self) -> TxResult<()> {
        match self.state {
            TxState::Configuring => {}
            TxState::Active(_) => {
                return Err(TxError::invalid_state("start() called twice"));
            }
            TxState::Terminated => {
                return Err(TxError::invalid_state(
                    "start() on a terminated transaction",
                ));
            }
        }
        let inner = match (self.engine, &self.start_options) {
            (EngineRef::Optimistic(engine), StartOptions::Optimistic(opts)) => {
                TxInner::Optimistic(engine.begin(opts))
            }
            (EngineRef::Pessimistic(engine), StartOptions::Pessimistic(opts)) => {
                TxInner::Pessimistic(engine.begin(opts))
            }
            // Unreachable by construction: both fields are set together.
            _ => {
                return Err(TxError::invalid_state(
                    "start options do not match the engine variant",
                ));
            }
        };
        self.state = TxState::Active(inner);
        debug!("transaction started");
        Ok(())
    }

    /// Atomically applies all buffered writes.
    ///
    /// The handle is terminated regardless of the outcome: a `Conflict`
    /// (optimistic validation failure) or any engine error still leaves
    /// the state `Terminated`, and retrying is not a valid recovery path;
    /// start a new transaction instead.
    ///
    /// # Errors
    ///
    /// `Conflict` when optimistic validation fails; `InvalidState` before
    /// `start()` or on a second commit; engine errors are surfaced
    /// verbatim.
    pub fn commit(&mut self) -> TxResult<()> {
        let flags = self.write_options.flags();
        match std::mem::replace(&mut self.state, TxState::Terminated) {
            TxState::Active(mut inner) => {
                let result = inner.commit(flags);
                debug!(ok = result.is_ok(), "transaction commit");
                result
            }
            TxState::Configuring => {
                self.state = TxState::Configuring;
                Err(TxError::invalid_state("commit before start()"))
            }
            TxState::Terminated => Err(TxError::invalid_state(
                "commit on a terminated transaction",
            )),
        }
    }

    /// Discards all buffered writes and releases held locks. Terminal.
    ///
    /// # Errors
    ///
    /// `InvalidState` before `start()` or after termination.
    pub fn rollback(&mut self) -> TxResult<()> {
        match std::mem::replace(&mut self.state, TxState::Terminated) {
            TxState::Active(mut inner) => {
                let result = inner.rollback();
                debug!("transaction rolled back");
                result
            }
            TxState::Configuring => {
                self.state = TxState::Configuring;
                Err(TxError::invalid_state("rollback before start()"))
            }
            TxState::Terminated => Err(TxError::invalid_state(
                "rollback on a terminated transaction",
            )),
        }
    }

    // === Reads and writes ===

    /// Looks up `key` with the current read options.
    ///
    /// `for_update` acquires the exclusive key lock (pessimistic) or marks
    /// the key for conflict detection (optimistic) as part of the read.
    /// Absence is reported as `Ok(None)`, never as an empty value.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; `Busy` on pessimistic lock
    /// timeout; `Corruption` on a verified checksum mismatch.
    pub fn get(&mut self, key: &[u8], for_update: bool) -> TxResult<Option<Bytes>> {
        let flags = self.read_options.flags();
        self.active_mut("get")?.get(key, for_update, flags)
    }

    /// Buffers a write, visible to this transaction's own reads and to no
    /// one else until commit.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; `Busy` when the pessimistic key
    /// lock cannot be acquired in time.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> TxResult<()> {
        let (key, value) = (key.into(), value.into());
        self.active_mut("put")?.put(key, value)
    }

    /// Buffers a deletion, with the same visibility rule as [`TxHandle::put`].
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; `Busy` when the pessimistic key
    /// lock cannot be acquired in time.
    pub fn del(&mut self, key: impl Into<Bytes>) -> TxResult<()> {
        let key = key.into();
        self.active_mut("del")?.delete(key)
    }

    // === Savepoints ===

    /// Pushes a rollback marker onto the savepoint stack.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`.
    pub fn set_savepoint(&mut self) -> TxResult<()> {
        self.active_mut("set_savepoint")?.set_savepoint();
        Ok(())
    }

    /// Reverts all writes since the most recent savepoint, leaving the
    /// marker active and the transaction usable.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active` or when the savepoint stack is
    /// empty (engine-reported).
    pub fn rollback_to_savepoint(&mut self) -> TxResult<()> {
        self.active_mut("rollback_to_savepoint")?
            .rollback_to_savepoint()
    }

    /// Discards the most recent savepoint without reverting writes.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active` or when the savepoint stack is
    /// empty (engine-reported).
    pub fn pop_savepoint(&mut self) -> TxResult<()> {
        self.active_mut("pop_savepoint")?.pop_savepoint()
    }

    pub(crate) fn active_ref(&self, context: &'static str) -> TxResult<&TxInner> {
        match &self.state {
            TxState::Active(inner) => Ok(inner),
            TxState::Configuring => Err(TxError::invalid_state(format!(
                "{context} before start()"
            ))),
            TxState::Terminated => Err(TxError::invalid_state(format!(
                "{context} on a terminated transaction"
            ))),
        }
    }

    pub(crate) fn read_flags(&self) -> ReadFlags {
        self.read_options.flags()
    }

    fn active_mut(&mut self, context: &'static str) -> TxResult<&mut TxInner> {
        match &mut self.state {
            TxState::Active(inner) => Ok(inner),
            TxState::Configuring => Err(TxError::invalid_state(format!(
                "{context} before start()"
            ))),
            TxState::Terminated => Err(TxError::invalid_state(format!(
                "{context} on a terminated transaction"
            ))),
        }
    }
}

impl Drop for TxHandle<'_> {
    /// Destruction releases the engine transaction: a still-active handle
    /// rolls back so held locks and buffered writes never outlive it.
    fn drop(&mut self) {
        if let TxState::Active(inner) = &mut self.state {
            let _ = inner.rollback();
        }
    }
}

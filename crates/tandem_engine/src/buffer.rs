//! Buffered writes and savepoints for an engine transaction.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use std::collections::BTreeMap;

/// A buffered write: `None` is a pending delete.
pub(crate) type Pending = Option<Bytes>;

/// Uncommitted writes for one transaction, plus its savepoint stack.
///
/// Writes are kept in key order so commits and scans over the merged view
/// stay sorted. A savepoint is a mark of the buffer state at the time it
/// was set; rolling back to it restores that state and leaves the mark in
/// place, popping discards the mark without touching the buffer.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    writes: BTreeMap<Bytes, Pending>,
    savepoints: Vec<BTreeMap<Bytes, Pending>>,
}

impl WriteBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a put, overwriting any earlier write to the same key.
    pub(crate) fn put(&mut self, key: Bytes, value: Bytes) {
        self.writes.insert(key, Some(value));
    }

    /// Records a delete.
    pub(crate) fn delete(&mut self, key: Bytes) {
        self.writes.insert(key, None);
    }

    /// Looks up a buffered write for `key`.
    ///
    /// `Some(Some(v))` = pending put, `Some(None)` = pending delete,
    /// `None` = the transaction has not touched this key.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Pending> {
        self.writes.get(key)
    }

    /// Buffered entries in key order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Bytes, &Pending)> {
        self.writes.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.writes.clear();
        self.savepoints.clear();
    }

    /// Pushes a savepoint marking the current buffer state.
    pub(crate) fn set_savepoint(&mut self) {
        self.savepoints.push(self.writes.clone());
    }

    /// Restores the buffer to the most recent savepoint, keeping the mark.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoSavepoint`] when the stack is empty.
    pub(crate) fn rollback_to_savepoint(&mut self) -> EngineResult<()> {
        let mark = self.savepoints.last().ok_or(EngineError::NoSavepoint)?;
        self.writes = mark.clone();
        Ok(())
    }

    /// Discards the most recent savepoint without reverting writes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoSavepoint`] when the stack is empty.
    pub(crate) fn pop_savepoint(&mut self) -> EngineResult<()> {
        self.savepoints.pop().ok_or(EngineError::NoSavepoint)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_sees_pending_value() {
        let mut buf = WriteBuffer::new();
        buf.put(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        assert_eq!(
            buf.get(b"k"),
            Some(&Some(Bytes::from_static(b"v"))),
        );
    }

    #[test]
    fn delete_shadows_earlier_put() {
        let mut buf = WriteBuffer::new();
        buf.put(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        buf.delete(Bytes::from_static(b"k"));
        assert_eq!(buf.get(b"k"), Some(&None));
    }

    #[test]
    fn untouched_key_is_none() {
        let buf = WriteBuffer::new();
        assert_eq!(buf.get(b"k"), None);
    }

    #[test]
    fn rollback_restores_state_and_keeps_mark() {
        let mut buf = WriteBuffer::new();
        buf.put(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        buf.set_savepoint();
        buf.put(Bytes::from_static(b"b"), Bytes::from_static(b"2"));

        buf.rollback_to_savepoint().unwrap();
        assert_eq!(buf.get(b"b"), None);
        assert!(buf.get(b"a").is_some());

        // The mark survives, so a second rollback still succeeds.
        buf.put(Bytes::from_static(b"c"), Bytes::from_static(b"3"));
        buf.rollback_to_savepoint().unwrap();
        assert_eq!(buf.get(b"c"), None);
    }

    #[test]
    fn pop_discards_mark_without_reverting() {
        let mut buf = WriteBuffer::new();
        buf.set_savepoint();
        buf.put(Bytes::from_static(b"k"), Bytes::from_static(b"v"));

        buf.pop_savepoint().unwrap();
        assert!(buf.get(b"k").is_some());
        assert!(matches!(
            buf.rollback_to_savepoint(),
            Err(EngineError::NoSavepoint)
        ));
    }

    #[test]
    fn savepoint_ops_on_empty_stack_fail() {
        let mut buf = WriteBuffer::new();
        assert!(matches!(
            buf.rollback_to_savepoint(),
            Err(EngineError::NoSavepoint)
        ));
        assert!(matches!(buf.pop_savepoint(), Err(EngineError::NoSavepoint)));
    }

    #[test]
    fn nested_savepoints_unwind_in_order() {
        let mut buf = WriteBuffer::new();
        buf.put(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        buf.set_savepoint();
        buf.put(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        buf.set_savepoint();
        buf.put(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        buf.rollback_to_savepoint().unwrap();
        assert!(buf.get(b"b").is_some());
        assert_eq!(buf.get(b"c"), None);

        buf.pop_savepoint().unwrap();
        buf.rollback_to_savepoint().unwrap();
        assert!(buf.get(b"a").is_some());
        assert_eq!(buf.get(b"b"), None);
    }
}

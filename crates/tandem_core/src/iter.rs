//! Iteration over a transaction's merged view.
//!
//! An iterator sees committed storage overlaid with the transaction's own
//! buffered writes: pending puts appear, pending deletions hide their
//! keys, and a pinned snapshot bounds the committed side. The view is
//! captured when the iterator is created; later writes on the same handle
//! do not show up in an already-created iterator.

use crate::handle::TxHandle;
use crate::status::TxResult;
use bytes::Bytes;

/// An ordered iterator over key-value pairs, ascending by key bytes.
#[derive(Debug)]
pub struct TxIter {
    items: std::vec::IntoIter<(Bytes, Bytes)>,
}

impl Iterator for TxIter {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for TxIter {}

impl<'a> TxHandle<'a> {
    /// An iterator over every visible key-value pair.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; read errors surface as for
    /// [`TxHandle::get`].
    pub fn iterator(&self) -> TxResult<TxIter> {
        self.range(None, None)
    }

    /// An iterator over the half-open range `[start, end)`.
    ///
    /// `None` leaves the corresponding side unbounded.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; read errors surface as for
    /// [`TxHandle::get`].
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> TxResult<TxIter> {
        let flags = self.read_flags();
        let items = self.active_ref("range")?.scan(start, end, flags)?;
        Ok(TxIter {
            items: items.into_iter(),
        })
    }

    /// An iterator over every visible key beginning with `prefix`.
    ///
    /// # Errors
    ///
    /// `InvalidState` outside `Active`; read errors surface as for
    /// [`TxHandle::get`].
    pub fn prefix(&self, prefix: &[u8]) -> TxResult<TxIter> {
        let end = prefix_successor(prefix);
        self.range(Some(prefix), end.as_deref())
    }
}

/// The smallest byte string greater than every string with this prefix,
/// or `None` when no such bound exists (all bytes are `0xff`).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

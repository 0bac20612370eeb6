//! The shared sorted key-value store.
//!
//! `Store` is the substrate both engine flavors commit into. It keeps a
//! sorted map of keys to version histories, so transactions can read a
//! consistent view at a snapshot version while later commits stack newer
//! entries on top. Every stored value carries a CRC32 so reads can
//! optionally verify integrity.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-call read behavior, threaded into every read the engine performs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// Verify the stored checksum before returning a value.
    pub verify_checksums: bool,
    /// Populate caches on read. Accepted for interface parity; the
    /// in-memory store has no cache to fill.
    pub fill_cache: bool,
}

/// Per-call write behavior, threaded into every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Sync to durable storage before the commit returns. Accepted for
    /// interface parity; the in-memory store has nothing to sync.
    pub sync: bool,
}

/// A value observed at a particular version.
///
/// `version` is 0 when the key has never been written; a tombstone entry
/// reports its own version with `value = None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRead {
    /// The visible value, or `None` for absent/deleted keys.
    pub value: Option<Bytes>,
    /// The version of the visible entry (0 = never written).
    pub version: u64,
}

/// One committed entry in a key's history.
#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    /// `None` is a tombstone.
    value: Option<Bytes>,
    crc: u32,
}

/// Version history for a single key, newest last.
#[derive(Debug, Clone, Default)]
struct Slot {
    history: Vec<Entry>,
}

impl Slot {
    /// Newest entry visible at `snapshot` (or the newest overall).
    fn visible(&self, snapshot: Option<u64>) -> Option<&Entry> {
        match snapshot {
            None => self.history.last(),
            Some(v) => self.history.iter().rev().find(|e| e.version <= v),
        }
    }

    fn latest_version(&self) -> u64 {
        self.history.last().map_or(0, |e| e.version)
    }
}

/// A sorted, versioned, in-memory key-value store.
///
/// The store is shared between engines via `Arc` and is thread-safe: reads
/// take the map read lock, commits take the write lock so validation and
/// application are atomic with respect to each other.
///
/// # Example
///
/// ```rust
/// use tandem_engine::{ReadFlags, Store};
///
/// let store = Store::new();
/// let read = store.get(b"missing", None, ReadFlags::default()).unwrap();
/// assert!(read.value.is_none());
/// assert_eq!(read.version, 0);
/// ```
#[derive(Debug, Default)]
pub struct Store {
    map: RwLock<BTreeMap<Bytes, Slot>>,
    /// Next commit version to allocate.
    next_version: AtomicU64,
    /// Highest committed version, for snapshots.
    committed_version: AtomicU64,
}

impl Store {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            committed_version: AtomicU64::new(0),
        }
    }

    /// Returns the highest committed version.
    ///
    /// This is the version a snapshot taken now would pin.
    #[must_use]
    pub fn committed_version(&self) -> u64 {
        self.committed_version.load(Ordering::SeqCst)
    }

    /// Reads the value visible for `key` at `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Corruption`] when `flags.verify_checksums` is
    /// set and the stored bytes no longer match their recorded checksum.
    pub fn get(
        &self,
        key: &[u8],
        snapshot: Option<u64>,
        flags: ReadFlags,
    ) -> EngineResult<VersionedRead> {
        let map = self.map.read();
        let Some(entry) = map.get(key).and_then(|slot| slot.visible(snapshot)) else {
            return Ok(VersionedRead {
                value: None,
                version: 0,
            });
        };
        if flags.verify_checksums {
            if let Some(value) = &entry.value {
                let actual = compute_crc32(value);
                if actual != entry.crc {
                    return Err(EngineError::Corruption {
                        expected: entry.crc,
                        actual,
                    });
                }
            }
        }
        Ok(VersionedRead {
            value: entry.value.clone(),
            version: entry.version,
        })
    }

    /// Returns the latest committed version for `key` (0 = never written).
    #[must_use]
    pub fn latest_version(&self, key: &[u8]) -> u64 {
        self.map.read().get(key).map_or(0, Slot::latest_version)
    }

    /// Collects the live `(key, value)` pairs visible at `snapshot` within
    /// the half-open range `[start, end)`, in key order.
    ///
    /// Tombstoned keys are skipped. `None` bounds are unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Corruption`] on a checksum mismatch when
    /// `flags.verify_checksums` is set.
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        snapshot: Option<u64>,
        flags: ReadFlags,
    ) -> EngineResult<Vec<(Bytes, Bytes)>> {
        let map = self.map.read();
        let lower = start.map_or(Bound::Unbounded, |s| {
            Bound::Included(Bytes::copy_from_slice(s))
        });
        let upper = end.map_or(Bound::Unbounded, |e| {
            Bound::Excluded(Bytes::copy_from_slice(e))
        });
        let mut out = Vec::new();
        for (key, slot) in map.range::<Bytes, _>((lower, upper)) {
            let Some(entry) = slot.visible(snapshot) else {
                continue;
            };
            let Some(value) = &entry.value else {
                continue;
            };
            if flags.verify_checksums {
                let actual = compute_crc32(value);
                if actual != entry.crc {
                    return Err(EngineError::Corruption {
                        expected: entry.crc,
                        actual,
                    });
                }
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }

    /// Applies a write batch at a freshly allocated commit version.
    ///
    /// All entries in the batch land at the same version. Returns the
    /// version assigned to the batch.
    pub fn apply<'a, I>(&self, writes: I, _flags: WriteFlags) -> u64
    where
        I: IntoIterator<Item = (&'a Bytes, &'a Option<Bytes>)>,
    {
        let mut map = self.map.write();
        self.apply_locked(&mut map, writes)
    }

    /// Validates a read set and applies a write batch atomically.
    ///
    /// This is the optimistic commit path: while holding the map write
    /// lock, every `(key, observed_version)` pair is checked against the
    /// key's current latest version. Any mismatch aborts the commit.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] naming the first key whose version
    /// changed since it was read. Nothing is applied in that case.
    pub fn validate_and_apply<'a, R, I>(
        &self,
        reads: R,
        writes: I,
        _flags: WriteFlags,
    ) -> EngineResult<u64>
    where
        R: IntoIterator<Item = (&'a Bytes, &'a u64)>,
        I: IntoIterator<Item = (&'a Bytes, &'a Option<Bytes>)>,
    {
        let mut map = self.map.write();
        for (key, observed) in reads {
            let current = map.get(key).map_or(0, Slot::latest_version);
            if current != *observed {
                return Err(EngineError::conflict(key.clone()));
            }
        }
        Ok(self.apply_locked(&mut map, writes))
    }

    fn apply_locked<'a, I>(&self, map: &mut BTreeMap<Bytes, Slot>, writes: I) -> u64
    where
        I: IntoIterator<Item = (&'a Bytes, &'a Option<Bytes>)>,
    {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        for (key, value) in writes {
            let crc = value.as_ref().map_or(0, |v| compute_crc32(v));
            map.entry(key.clone()).or_default().history.push(Entry {
                version,
                value: value.clone(),
                crc,
            });
        }
        self.committed_version.store(version, Ordering::SeqCst);
        version
    }

    /// Corrupts the newest stored value for `key` without updating its
    /// checksum. Returns false if the key has no live value.
    ///
    /// Fault injection hook for tests: a subsequent verified read reports
    /// [`EngineError::Corruption`], an unverified read returns the mangled
    /// bytes.
    pub fn corrupt(&self, key: &[u8]) -> bool {
        let mut map = self.map.write();
        let Some(entry) = map.get_mut(key).and_then(|slot| slot.history.last_mut()) else {
            return false;
        };
        let Some(value) = &entry.value else {
            return false;
        };
        let mut mangled = value.to_vec();
        match mangled.first_mut() {
            Some(byte) => *byte = byte.wrapping_add(1),
            None => mangled.push(0xFF),
        }
        entry.value = Some(Bytes::from(mangled));
        true
    }
}

/// Computes the CRC32 (IEEE polynomial) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

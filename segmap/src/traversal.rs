//! Scoped, per-segment access: explicit locking and entry traversal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Result, SegmapError};
use crate::lock::SegmentLock;
use crate::segment::{SegmentRegion, SegmentStats, SegmentStore};
use crate::segment_map::SegmentMap;
use crate::types::Codec;

/// Zero-copy view of one live entry, valid only inside the predicate call
/// that received it.
pub struct EntryView<'a, KC, VC> {
    segment: usize,
    key: &'a [u8],
    value: &'a [u8],
    key_codec: &'a KC,
    value_codec: &'a VC,
}

impl<KC: Codec, VC: Codec> EntryView<'_, KC, VC> {
    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn key_bytes(&self) -> &[u8] {
        self.key
    }

    pub fn value_bytes(&self) -> &[u8] {
        self.value
    }

    pub fn key(&self) -> Result<KC::Item> {
        self.key_codec
            .read(self.key)
            .map_err(|e| SegmapError::Decoding(e.to_string()))
    }

    pub fn value(&self) -> Result<VC::Item> {
        self.value_codec
            .read(self.value)
            .map_err(|e| SegmapError::Decoding(e.to_string()))
    }
}

/// Marks a segment as being traversed for as long as it is alive
struct ActiveTraversal<'a>(&'a AtomicUsize);

impl<'a> ActiveTraversal<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveTraversal<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle on one segment of a map.
///
/// The explicit `lock`/`unlock` calls pair up like the raw segment lock
/// (reentrant, owner checked). Traversals take the lock themselves and
/// always release it before returning.
pub struct SegmentContext<'m, KC: Codec, VC: Codec> {
    map: &'m SegmentMap<KC, VC>,
    segment: usize,
}

impl<'m, KC: Codec, VC: Codec> SegmentContext<'m, KC, VC> {
    pub(crate) fn new(map: &'m SegmentMap<KC, VC>, segment: usize) -> Self {
        Self { map, segment }
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    fn with_lock<R>(&self, f: impl FnOnce(SegmentLock<'_>) -> R) -> Result<R> {
        self.map.check_segment(self.segment)?;
        let mapping = self.map.mapping.read_recursive();
        let region = SegmentRegion::new(&mapping.file, &mapping.layout, self.segment);
        Ok(f(SegmentLock::new(
            self.segment,
            region.header,
            self.map.config.lock_spin_limit,
        )))
    }

    pub fn lock(&self) -> Result<()> {
        self.with_lock(|lock| lock.lock())
    }

    pub fn try_lock(&self, timeout: Duration) -> Result<()> {
        self.with_lock(|lock| lock.try_lock(timeout))?
    }

    pub fn unlock(&self) -> Result<()> {
        self.with_lock(|lock| lock.unlock())?
    }

    pub fn is_locked(&self) -> Result<bool> {
        self.with_lock(|lock| lock.is_locked())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.with_lock(|lock| lock.is_dirty())
    }

    pub fn hold_count(&self) -> Result<u64> {
        self.with_lock(|lock| lock.hold_count())
    }

    /// Live entries in this segment
    pub fn len(&self) -> Result<usize> {
        self.map.segment_len(self.segment)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<SegmentStats> {
        self.map.segment_stats(self.segment)
    }

    /// Calls `f` for each live entry in storage order until it returns
    /// `Ok(false)` or an error, holding the segment lock throughout.
    ///
    /// Returns `Ok(true)` when every entry was visited and `Ok(false)` when
    /// `f` stopped early. The lock is released exactly once on every exit,
    /// including a panic inside `f`. From within `f`, lookups on this map
    /// are allowed; mutating this segment fails with `TraversalInProgress`.
    pub fn for_each_segment_entry_while<E, F>(&self, mut f: F) -> std::result::Result<bool, E>
    where
        E: From<SegmapError>,
        F: FnMut(&EntryView<'_, KC, VC>) -> std::result::Result<bool, E>,
    {
        let map = self.map;
        map.check_segment(self.segment)?;
        let mapping = map.mapping.read_recursive();
        let region = SegmentRegion::new(&mapping.file, &mapping.layout, self.segment);
        let _guard =
            SegmentLock::new(self.segment, region.header, map.config.lock_spin_limit).guard();
        // dropped before the guard, so the mark is gone once the lock is free
        let _active = ActiveTraversal::enter(&map.traversals[self.segment]);

        // SAFETY: the segment lock is held and, while `_active` is set, this
        // thread refuses to create a mutable view of the segment.
        let bytes = unsafe { region.bytes() };
        let store = SegmentStore::new(self.segment, region.header, mapping.layout, bytes);

        let mut off = mapping.layout.slots_start();
        while let Some((at, hdr)) = store.next_live(off)? {
            let view = EntryView {
                segment: self.segment,
                key: store.key_at(at, &hdr),
                value: store.value_at(at, &hdr),
                key_codec: &map.key_codec,
                value_codec: &map.value_codec,
            };
            if !f(&view)? {
                return Ok(false);
            }
            off = at + hdr.size as usize;
        }
        Ok(true)
    }

    /// Visits every live entry. Convenience over `for_each_segment_entry_while`.
    pub fn for_each_segment_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&EntryView<'_, KC, VC>),
    {
        self.for_each_segment_entry_while(|entry| {
            f(entry);
            Ok::<_, SegmapError>(true)
        })
        .map(|_| ())
    }
}

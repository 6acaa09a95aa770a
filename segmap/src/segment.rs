//! Entry store for one segment's data region.
//!
//! The region starts with a bucket table of chain-head offsets followed by
//! variable-size slots. Each slot carries its own size and the size of its
//! physical predecessor, which lets a freed slot merge with free neighbours
//! on both sides. Free blocks are kept on doubly linked, size-classed lists
//! whose heads live in the segment header. Space past `high_water` has never
//! been handed out (or was returned when the last slot was freed).

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::byte_store::MMapFile;
use crate::error::{Result, SegmapError};
use crate::layout::{
    size_class, slot_size_for, Layout, SegmentHeader, SlotHeader, GRANULE, MIN_SLOT_SIZE,
    NUM_SIZE_CLASSES, SLOT_HEADER_SIZE, STATE_FREE, STATE_LIVE, STATE_TOMBSTONE,
};

/// Header and data region of one segment inside a mapped file
pub(crate) struct SegmentRegion<'a> {
    pub header: &'a SegmentHeader,
    data: NonNull<u8>,
    len: usize,
    _file: PhantomData<&'a MMapFile>,
}

impl<'a> SegmentRegion<'a> {
    pub fn new(file: &'a MMapFile, layout: &Layout, segment: usize) -> Self {
        debug_assert!(layout.total_len() <= file.len());
        let base = file.base_ptr().as_ptr();
        // SAFETY: the layout was validated against the file length, header
        // offsets are 8-byte aligned (the mapping is page aligned and headers
        // are 128 bytes), and SegmentHeader is made only of atomics.
        let header = unsafe {
            &*(base.add(layout.segment_header_offset(segment)) as *const SegmentHeader)
        };
        // SAFETY: in bounds per the validated layout; never null.
        let data = unsafe { NonNull::new_unchecked(base.add(layout.segment_data_offset(segment))) };
        Self {
            header,
            data,
            len: layout.segment_size,
            _file: PhantomData,
        }
    }

    /// # Safety
    /// The caller holds the segment lock and no mutable view of this region
    /// is alive for the returned lifetime.
    pub unsafe fn bytes(&self) -> &'a [u8] {
        // SAFETY: in bounds per the validated layout; exclusivity is the caller's
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// # Safety
    /// The caller holds the segment lock and no other view of this region is
    /// alive for the returned lifetime.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &'a mut [u8] {
        // SAFETY: in bounds per the validated layout; exclusivity is the caller's
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

/// Result of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
}

/// Occupancy figures for one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub entries: usize,
    /// Bytes available for slots (region size minus bucket table)
    pub capacity: usize,
    pub high_water: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    pub off: usize,
    /// Chain predecessor, 0 when the slot is the bucket head
    pub prev: usize,
    pub bucket: usize,
    pub hdr: SlotHeader,
}

/// Typed access to one segment's header and data region.
///
/// `D` is `&[u8]` for lookups and `&mut [u8]` for mutations, the same
/// `AsRef`/`AsMut` split the byte stores use.
pub struct SegmentStore<'h, D> {
    pub(crate) segment: usize,
    pub(crate) header: &'h SegmentHeader,
    pub(crate) layout: Layout,
    pub(crate) data: D,
}

impl<'h, D: AsRef<[u8]>> SegmentStore<'h, D> {
    pub fn new(segment: usize, header: &'h SegmentHeader, layout: Layout, data: D) -> Self {
        Self {
            segment,
            header,
            layout,
            data,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> SegmapError {
        SegmapError::corrupt(self.segment, reason)
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn len(&self) -> usize {
        self.header.entry_count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water(&self) -> usize {
        (self.header.high_water.load(Ordering::Relaxed) as usize).min(self.bytes().len())
    }

    pub(crate) fn read_u64(&self, at: usize) -> u64 {
        bytemuck::pod_read_unaligned(&self.bytes()[at..at + 8])
    }

    pub(crate) fn bucket_head(&self, bucket: usize) -> usize {
        self.read_u64(bucket * 8) as usize
    }

    /// Longest walk any list or chain can take in a well-formed segment
    pub(crate) fn walk_limit(&self) -> usize {
        self.high_water().saturating_sub(self.layout.slots_start()) / MIN_SLOT_SIZE + 1
    }

    /// Reads and bounds-checks the slot header at `off`.
    pub(crate) fn slot(&self, off: usize) -> Result<SlotHeader> {
        let hw = self.high_water();
        if off < self.layout.slots_start() || off % GRANULE != 0 || off + SLOT_HEADER_SIZE > hw {
            return Err(self.corrupt(format!(
                "slot offset {off} outside [{}, {hw})",
                self.layout.slots_start()
            )));
        }
        let hdr: SlotHeader =
            bytemuck::pod_read_unaligned(&self.bytes()[off..off + SLOT_HEADER_SIZE]);
        let size = hdr.size as usize;
        if size < MIN_SLOT_SIZE || size % GRANULE != 0 || off + size > hw {
            return Err(self.corrupt(format!("slot at {off} has invalid length {size}")));
        }
        match hdr.state {
            STATE_LIVE => {
                if SLOT_HEADER_SIZE + hdr.payload_len() > size {
                    return Err(self.corrupt(format!(
                        "slot at {off} holds {} payload bytes in {size}",
                        hdr.payload_len()
                    )));
                }
            }
            STATE_FREE | STATE_TOMBSTONE => {}
            other => {
                return Err(self.corrupt(format!("slot at {off} has unknown state {other:#x}")));
            }
        }
        Ok(hdr)
    }

    pub(crate) fn key_at(&self, off: usize, hdr: &SlotHeader) -> &[u8] {
        let start = off + SLOT_HEADER_SIZE;
        &self.bytes()[start..start + hdr.key_len as usize]
    }

    pub(crate) fn value_at(&self, off: usize, hdr: &SlotHeader) -> &[u8] {
        let start = off + SLOT_HEADER_SIZE + hdr.key_len as usize;
        &self.bytes()[start..start + hdr.value_len as usize]
    }

    pub(crate) fn find(&self, key: &[u8], hash: u32) -> Result<Option<Found>> {
        let bucket = self.layout.bucket_for_hash(hash);
        let limit = self.walk_limit();
        let mut prev = 0;
        let mut cur = self.bucket_head(bucket);
        let mut steps = 0;
        while cur != 0 {
            steps += 1;
            if steps > limit {
                return Err(self.corrupt(format!("cycle in collision chain of bucket {bucket}")));
            }
            let hdr = self.slot(cur)?;
            if hdr.state != STATE_LIVE {
                return Err(self.corrupt(format!("bucket {bucket} links non-live slot {cur}")));
            }
            if hdr.hash == hash && self.key_at(cur, &hdr) == key {
                return Ok(Some(Found {
                    off: cur,
                    prev,
                    bucket,
                    hdr,
                }));
            }
            prev = cur;
            cur = hdr.next as usize;
        }
        Ok(None)
    }

    pub fn get(&self, key: &[u8], hash: u32) -> Result<Option<&[u8]>> {
        Ok(self
            .find(key, hash)?
            .map(|found| self.value_at(found.off, &found.hdr)))
    }

    /// First live slot at or after `off`, in storage order
    pub(crate) fn next_live(&self, mut off: usize) -> Result<Option<(usize, SlotHeader)>> {
        let hw = self.high_water();
        while off < hw {
            let hdr = self.slot(off)?;
            if hdr.state == STATE_LIVE {
                return Ok(Some((off, hdr)));
            }
            off += hdr.size as usize;
        }
        Ok(None)
    }

    pub fn stats(&self) -> Result<SegmentStats> {
        let hw = self.high_water();
        let mut stats = SegmentStats {
            entries: self.len(),
            capacity: self.bytes().len() - self.layout.slots_start(),
            high_water: hw,
            ..SegmentStats::default()
        };
        let mut off = self.layout.slots_start();
        while off < hw {
            let hdr = self.slot(off)?;
            if hdr.state == STATE_FREE {
                stats.free_bytes += hdr.size as usize;
                stats.free_blocks += 1;
            }
            off += hdr.size as usize;
        }
        Ok(stats)
    }
}

impl<'h, D: AsRef<[u8]> + AsMut<[u8]>> SegmentStore<'h, D> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub(crate) fn write_u64(&mut self, at: usize, value: u64) {
        self.bytes_mut()[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn set_bucket_head(&mut self, bucket: usize, off: usize) {
        self.write_u64(bucket * 8, off as u64);
    }

    pub(crate) fn write_slot(&mut self, off: usize, hdr: &SlotHeader) {
        self.bytes_mut()[off..off + SLOT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(hdr));
    }

    pub(crate) fn set_high_water(&self, hw: usize, tail_size: usize) {
        self.header.high_water.store(hw as u64, Ordering::Relaxed);
        self.header.tail_size.store(tail_size as u64, Ordering::Relaxed);
    }

    fn next_seq(&self) -> u64 {
        self.header.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Forgets every bucket chain and free list without touching the slots.
    pub(crate) fn reset_index(&mut self) {
        let table = self.layout.slots_start();
        self.bytes_mut()[..table].fill(0);
        for head in &self.header.free_heads {
            head.store(0, Ordering::Relaxed);
        }
    }

    /// Empties the segment: no entries, no free blocks, nothing allocated.
    pub fn clear(&mut self) {
        self.reset_index();
        self.header.entry_count.store(0, Ordering::Relaxed);
        self.set_high_water(self.layout.slots_start(), 0);
    }

    /// Tells the slot that physically follows a block ending at `end` that
    /// its predecessor is now `size` bytes.
    fn set_following_prev(&mut self, end: usize, size: usize) -> Result<()> {
        let hw = self.high_water();
        if end == hw {
            self.header.tail_size.store(size as u64, Ordering::Relaxed);
        } else if end < hw {
            let mut next = self.slot(end)?;
            next.prev_size = size as u32;
            self.write_slot(end, &next);
        }
        Ok(())
    }

    pub(crate) fn push_free(&mut self, off: usize, size: usize, prev_size: usize) -> Result<()> {
        let class = size_class(size);
        let head = self.header.free_heads[class].load(Ordering::Relaxed) as usize;
        self.write_slot(
            off,
            &SlotHeader {
                size: size as u32,
                prev_size: prev_size as u32,
                state: STATE_FREE,
                next: head as u64,
                ..SlotHeader::default()
            },
        );
        if head != 0 {
            let mut first = self.slot(head)?;
            first.seq = off as u64;
            self.write_slot(head, &first);
        }
        self.header.free_heads[class].store(off as u64, Ordering::Relaxed);
        Ok(())
    }

    fn unlink_free(&mut self, off: usize, hdr: &SlotHeader) -> Result<()> {
        let class = size_class(hdr.size as usize);
        let (prev, next) = (hdr.seq as usize, hdr.next as usize);
        if prev == 0 {
            if self.header.free_heads[class].load(Ordering::Relaxed) as usize != off {
                return Err(self.corrupt(format!("free block {off} is not its list head")));
            }
            self.header.free_heads[class].store(next as u64, Ordering::Relaxed);
        } else {
            let mut p = self.slot(prev)?;
            p.next = next as u64;
            self.write_slot(prev, &p);
        }
        if next != 0 {
            let mut n = self.slot(next)?;
            n.seq = prev as u64;
            self.write_slot(next, &n);
        }
        Ok(())
    }

    /// Hands out a block of at least `size` bytes, returning its offset and
    /// actual size. The block is stamped as a tombstone until the caller
    /// writes a live entry into it.
    pub(crate) fn allocate(&mut self, size: usize) -> Result<(usize, usize)> {
        let limit = self.walk_limit();
        for class in size_class(size)..NUM_SIZE_CLASSES {
            let mut cur = self.header.free_heads[class].load(Ordering::Relaxed) as usize;
            let mut steps = 0;
            while cur != 0 {
                steps += 1;
                if steps > limit {
                    return Err(self.corrupt(format!("cycle in free list {class}")));
                }
                let hdr = self.slot(cur)?;
                if hdr.state != STATE_FREE {
                    return Err(self.corrupt(format!("free list {class} links used slot {cur}")));
                }
                if hdr.size as usize >= size {
                    return self.take_free(cur, hdr, size);
                }
                cur = hdr.next as usize;
            }
        }

        let hw = self.high_water();
        if hw + size > self.bytes().len() {
            return Err(SegmapError::CapacityExceeded {
                segment: self.segment,
                requested: size,
            });
        }
        let tail = self.header.tail_size.load(Ordering::Relaxed) as usize;
        self.write_slot(hw, &placeholder(size, tail));
        self.set_high_water(hw + size, size);
        trace!(segment = self.segment, off = hw, size, "bump allocated slot");
        Ok((hw, size))
    }

    fn take_free(&mut self, off: usize, hdr: SlotHeader, size: usize) -> Result<(usize, usize)> {
        self.unlink_free(off, &hdr)?;
        let total = hdr.size as usize;
        let remainder = total - size;
        if remainder >= MIN_SLOT_SIZE {
            // remainder first: until `off` shrinks, the walk steps over it
            self.push_free(off + size, remainder, size)?;
            self.write_slot(off, &placeholder(size, hdr.prev_size as usize));
            self.set_following_prev(off + total, remainder)?;
            trace!(segment = self.segment, off, size, remainder, "split free block");
            Ok((off, size))
        } else {
            self.write_slot(off, &placeholder(total, hdr.prev_size as usize));
            trace!(segment = self.segment, off, size = total, "reused free block");
            Ok((off, total))
        }
    }

    /// Returns the slot at `off` to the free lists, merging it with free
    /// physical neighbours and giving space back to the bump area when it
    /// reaches `high_water`.
    pub(crate) fn free_block(&mut self, off: usize) -> Result<()> {
        let hdr = self.slot(off)?;
        let mut start = off;
        let mut size = hdr.size as usize;
        let mut prev_size = hdr.prev_size as usize;

        let end = off + size;
        if end < self.high_water() {
            let next = self.slot(end)?;
            if next.state == STATE_FREE {
                self.unlink_free(end, &next)?;
                size += next.size as usize;
            }
        }
        if prev_size != 0 {
            let Some(prev_off) = off
                .checked_sub(prev_size)
                .filter(|p| *p >= self.layout.slots_start())
            else {
                return Err(self.corrupt(format!("slot at {off} has bad predecessor size")));
            };
            let prev = self.slot(prev_off)?;
            if prev.state == STATE_FREE {
                self.unlink_free(prev_off, &prev)?;
                start = prev_off;
                size += prev.size as usize;
                prev_size = prev.prev_size as usize;
            }
        }

        if start + size == self.high_water() {
            self.set_high_water(start, prev_size);
            trace!(segment = self.segment, high_water = start, "returned tail space");
        } else {
            self.push_free(start, size, prev_size)?;
            self.set_following_prev(start + size, size)?;
        }
        Ok(())
    }

    /// Extent of the free block `free_block(off)` would produce, and whether
    /// it would be handed back to the bump area.
    fn reclaimable(&self, off: usize, hdr: &SlotHeader) -> Result<(usize, usize, bool)> {
        let mut start = off;
        let mut size = hdr.size as usize;
        let end = off + size;
        if end < self.high_water() {
            let next = self.slot(end)?;
            if next.state == STATE_FREE {
                size += next.size as usize;
            }
        }
        let prev_size = hdr.prev_size as usize;
        if prev_size != 0 {
            if let Some(prev_off) = off
                .checked_sub(prev_size)
                .filter(|p| *p >= self.layout.slots_start())
            {
                let prev = self.slot(prev_off)?;
                if prev.state == STATE_FREE {
                    start = prev_off;
                    size += prev.size as usize;
                }
            }
        }
        Ok((start, size, start + size == self.high_water()))
    }

    fn write_entry(
        &mut self,
        off: usize,
        key: &[u8],
        value: &[u8],
        hash: u32,
        next: usize,
    ) -> Result<()> {
        let mut hdr = self.slot(off)?;
        let start = off + SLOT_HEADER_SIZE;
        let bytes = self.bytes_mut();
        bytes[start..start + key.len()].copy_from_slice(key);
        bytes[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);
        hdr.state = STATE_LIVE;
        hdr.key_len = key.len() as u32;
        hdr.value_len = value.len() as u32;
        hdr.hash = hash;
        hdr.next = next as u64;
        hdr.seq = self.next_seq();
        self.write_slot(off, &hdr);
        Ok(())
    }

    fn relink(&mut self, found: &Found, target: usize) -> Result<()> {
        if found.prev == 0 {
            self.set_bucket_head(found.bucket, target);
        } else {
            let mut prev = self.slot(found.prev)?;
            prev.next = target as u64;
            self.write_slot(found.prev, &prev);
        }
        Ok(())
    }

    /// Inserts or replaces the value stored for `key`.
    ///
    /// A value that fits the existing slot is overwritten in place. Otherwise
    /// a new slot is written and linked before the old one is freed, so an
    /// interrupted relocation leaves two copies rather than none; recovery
    /// keeps the one with the higher sequence number. When only the old
    /// slot's own space can hold the new value, the old entry is removed
    /// first and the key is absent until the new slot is linked. On
    /// `CapacityExceeded` nothing has been modified.
    pub fn put(&mut self, key: &[u8], hash: u32, value: &[u8]) -> Result<PutOutcome> {
        let needed = slot_size_for(key.len() + value.len());
        let capacity = self.bytes().len() - self.layout.slots_start();
        if needed > capacity {
            return Err(SegmapError::CapacityExceeded {
                segment: self.segment,
                requested: needed,
            });
        }

        match self.find(key, hash)? {
            Some(found) if found.hdr.size as usize >= needed => {
                let start = found.off + SLOT_HEADER_SIZE + key.len();
                self.bytes_mut()[start..start + value.len()].copy_from_slice(value);
                let mut hdr = found.hdr;
                hdr.value_len = value.len() as u32;
                hdr.seq = self.next_seq();
                self.write_slot(found.off, &hdr);
                Ok(PutOutcome::Replaced)
            }
            Some(found) => {
                let off = match self.allocate(needed) {
                    Ok((off, _)) => off,
                    Err(e @ SegmapError::CapacityExceeded { .. }) => {
                        return self.replace_in_reclaimed(found, key, hash, value, needed, e);
                    }
                    Err(e) => return Err(e),
                };
                self.write_entry(off, key, value, hash, found.hdr.next as usize)?;
                self.relink(&found, off)?;
                // re-read: allocation may have updated the old slot's prev_size
                let mut old = self.slot(found.off)?;
                old.state = STATE_TOMBSTONE;
                self.write_slot(found.off, &old);
                self.free_block(found.off)?;
                Ok(PutOutcome::Replaced)
            }
            None => {
                let (off, _) = self.allocate(needed)?;
                let bucket = self.layout.bucket_for_hash(hash);
                let head = self.bucket_head(bucket);
                self.write_entry(off, key, value, hash, head)?;
                self.set_bucket_head(bucket, off);
                self.header.entry_count.fetch_add(1, Ordering::Relaxed);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    /// Relocation for a segment too full to hold both copies: frees the old
    /// slot, then allocates from the space it returned.
    fn replace_in_reclaimed(
        &mut self,
        found: Found,
        key: &[u8],
        hash: u32,
        value: &[u8],
        needed: usize,
        full: SegmapError,
    ) -> Result<PutOutcome> {
        let (start, size, at_tail) = self.reclaimable(found.off, &found.hdr)?;
        let fits = size >= needed || (at_tail && self.bytes().len() - start >= needed);
        if !fits {
            return Err(full);
        }
        let mut old = found.hdr;
        old.state = STATE_TOMBSTONE;
        self.write_slot(found.off, &old);
        self.relink(&found, old.next as usize)?;
        self.free_block(found.off)?;

        let (off, _) = self.allocate(needed)?;
        let bucket = self.layout.bucket_for_hash(hash);
        let head = self.bucket_head(bucket);
        self.write_entry(off, key, value, hash, head)?;
        self.set_bucket_head(bucket, off);
        trace!(segment = self.segment, from = found.off, to = off, "relocated into freed space");
        Ok(PutOutcome::Replaced)
    }

    /// Tombstones, unlinks and frees the entry for `key`. Returns whether an
    /// entry was present; removing an absent key is not an error.
    pub fn remove(&mut self, key: &[u8], hash: u32) -> Result<bool> {
        let Some(found) = self.find(key, hash)? else {
            return Ok(false);
        };
        let mut hdr = found.hdr;
        hdr.state = STATE_TOMBSTONE;
        self.write_slot(found.off, &hdr);
        self.relink(&found, hdr.next as usize)?;
        self.free_block(found.off)?;
        self.header.entry_count.fetch_sub(1, Ordering::Relaxed);
        Ok(true)
    }
}

fn placeholder(size: usize, prev_size: usize) -> SlotHeader {
    SlotHeader {
        size: size as u32,
        prev_size: prev_size as u32,
        state: STATE_TOMBSTONE,
        ..SlotHeader::default()
    }
}

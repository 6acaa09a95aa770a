//! Verification and rebuild of segments left behind by a crashed writer.
//!
//! A segment whose lock word is non-zero at open was being modified when its
//! owner died. Its bucket chains and free lists may be half updated, but the
//! slots themselves are always well formed (size, state, payload), because a
//! slot header is written before anything links to it. Rebuild therefore
//! trusts only the physical slot sequence and derives everything else from it.

use std::collections::hash_map::Entry;
use std::sync::atomic::Ordering;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::layout::{key_hash, size_class, GRANULE, NUM_SIZE_CLASSES, STATE_FREE, STATE_LIVE};
use crate::lock::SegmentLock;
use crate::segment::SegmentStore;

/// Outcome of opening one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Lock word was clear and the segment passed (or skipped) verification
    Clean,
    /// The segment was dirty and has been rebuilt from its slots
    Recovered {
        entries: usize,
        free_blocks: usize,
        /// Stale copies left by an interrupted relocation
        dropped_duplicates: usize,
    },
    /// The segment could not be trusted and is unavailable until repaired
    Excluded { reason: String },
}

/// What happened to each segment when the map was opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments: Vec<SegmentStatus>,
    /// Other processes were attached, so no segment was inspected
    pub skipped: bool,
}

impl RecoveryReport {
    pub fn skipped(segment_count: usize) -> Self {
        Self {
            segments: vec![SegmentStatus::Clean; segment_count],
            skipped: true,
        }
    }

    pub fn recovered(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, SegmentStatus::Recovered { .. }))
            .map(|(i, _)| i)
    }

    pub fn excluded(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, SegmentStatus::Excluded { .. }))
            .map(|(i, _)| i)
    }

    pub fn is_clean(&self) -> bool {
        self.segments.iter().all(|s| *s == SegmentStatus::Clean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RebuildSummary {
    pub entries: usize,
    pub free_blocks: usize,
    pub dropped_duplicates: usize,
}

impl<D: AsRef<[u8]>> SegmentStore<'_, D> {
    fn checked_high_water(&self) -> Result<usize> {
        let hw = self.header.high_water.load(Ordering::Relaxed) as usize;
        if hw < self.layout.slots_start() || hw > self.bytes().len() || hw % GRANULE != 0 {
            return Err(self.corrupt(format!("high water mark {hw} is out of range")));
        }
        Ok(hw)
    }

    /// Read-only structural check of a segment that is not being modified.
    ///
    /// Walks the slots in storage order, then every free list and every
    /// bucket chain, and cross-checks the counts. Each walk is bounded by
    /// what the slot walk found, so cycles are reported instead of looping.
    pub fn verify(&self) -> Result<()> {
        let hw = self.checked_high_water()?;

        let mut off = self.layout.slots_start();
        let mut prev_size = 0;
        let mut prev_free = false;
        let (mut live, mut free_blocks) = (0usize, 0usize);
        while off < hw {
            let hdr = self.slot(off)?;
            if hdr.prev_size as usize != prev_size {
                return Err(self.corrupt(format!(
                    "slot at {off} records predecessor size {} but follows {prev_size}",
                    hdr.prev_size
                )));
            }
            match hdr.state {
                STATE_LIVE => {
                    let hash = key_hash(self.key_at(off, &hdr));
                    if hash as u32 != hdr.hash || self.layout.segment_for_hash(hash) != self.segment
                    {
                        return Err(self.corrupt(format!("slot at {off} has a mismatched key hash")));
                    }
                    live += 1;
                }
                STATE_FREE => {
                    if prev_free {
                        return Err(self.corrupt(format!("free block at {off} was not merged")));
                    }
                    free_blocks += 1;
                }
                _ => return Err(self.corrupt(format!("unreleased tombstone at {off}"))),
            }
            prev_free = hdr.state == STATE_FREE;
            prev_size = hdr.size as usize;
            off += prev_size;
        }
        if prev_free {
            return Err(self.corrupt("free block sits below the high water mark"));
        }
        let tail = self.header.tail_size.load(Ordering::Relaxed) as usize;
        if tail != prev_size {
            return Err(self.corrupt(format!("tail size {tail} but last slot is {prev_size}")));
        }
        if live != self.len() {
            return Err(self.corrupt(format!(
                "entry count {} but {live} live slots",
                self.len()
            )));
        }

        let mut listed = 0;
        for class in 0..NUM_SIZE_CLASSES {
            let mut prev = 0;
            let mut cur = self.header.free_heads[class].load(Ordering::Relaxed) as usize;
            while cur != 0 {
                listed += 1;
                if listed > free_blocks {
                    return Err(self.corrupt(format!("free list {class} is cyclic or overlong")));
                }
                let hdr = self.slot(cur)?;
                if hdr.state != STATE_FREE || size_class(hdr.size as usize) != class {
                    return Err(self.corrupt(format!("free list {class} links slot {cur} wrongly")));
                }
                if hdr.seq as usize != prev {
                    return Err(self.corrupt(format!("free block {cur} has a broken back link")));
                }
                prev = cur;
                cur = hdr.next as usize;
            }
        }
        if listed != free_blocks {
            return Err(self.corrupt(format!(
                "{free_blocks} free blocks but {listed} on free lists"
            )));
        }

        let mut chained = 0;
        for bucket in 0..self.layout.bucket_count {
            let mut cur = self.bucket_head(bucket);
            while cur != 0 {
                chained += 1;
                if chained > live {
                    return Err(self.corrupt(format!("chain of bucket {bucket} is cyclic")));
                }
                let hdr = self.slot(cur)?;
                if hdr.state != STATE_LIVE || self.layout.bucket_for_hash(hdr.hash) != bucket {
                    return Err(self.corrupt(format!("bucket {bucket} links slot {cur} wrongly")));
                }
                cur = hdr.next as usize;
            }
        }
        if chained != live {
            return Err(self.corrupt(format!("{live} live slots but {chained} chained")));
        }
        Ok(())
    }
}

impl<D: AsRef<[u8]> + AsMut<[u8]>> SegmentStore<'_, D> {
    /// Reconstructs chains, free lists, counters and the tail from the slot
    /// sequence. Tombstones become free space, adjacent free space is merged,
    /// and when two live slots carry the same key the higher sequence wins.
    pub(crate) fn rebuild(&mut self) -> Result<RebuildSummary> {
        let hw = self.checked_high_water()?;

        let mut slots = Vec::new();
        let mut off = self.layout.slots_start();
        while off < hw {
            let hdr = self.slot(off)?;
            slots.push((off, hdr));
            off += hdr.size as usize;
        }

        let mut winners: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
        let mut dropped_duplicates = 0;
        for (i, (off, hdr)) in slots.iter().enumerate() {
            if hdr.state != STATE_LIVE {
                continue;
            }
            let key = self.key_at(*off, hdr);
            let owner = self.layout.segment_for_hash(key_hash(key));
            if owner != self.segment {
                return Err(self.corrupt(format!(
                    "slot at {off} holds a key belonging to segment {owner}"
                )));
            }
            match winners.entry(key.to_vec()) {
                Entry::Vacant(e) => {
                    e.insert(i);
                }
                Entry::Occupied(mut e) => {
                    dropped_duplicates += 1;
                    if hdr.seq > slots[*e.get()].1.seq {
                        e.insert(i);
                    }
                }
            }
        }
        let mut keep = vec![false; slots.len()];
        for i in winners.values() {
            keep[*i] = true;
        }

        // (offset, size, live) with neighbouring free space merged
        let mut runs: Vec<(usize, usize, bool)> = Vec::with_capacity(slots.len());
        for (i, (off, hdr)) in slots.iter().enumerate() {
            let size = hdr.size as usize;
            match runs.last_mut() {
                Some(last) if !keep[i] && !last.2 => last.1 += size,
                _ => runs.push((*off, size, keep[i])),
            }
        }
        let mut top = hw;
        if let Some(&(off, _, false)) = runs.last() {
            runs.pop();
            top = off;
        }

        self.reset_index();
        self.set_high_water(top, runs.last().map_or(0, |r| r.1));

        let mut prev_size = 0;
        let mut free_blocks = 0;
        let mut max_seq = 0;
        for (off, size, live) in runs {
            if live {
                let mut hdr = self.slot(off)?;
                let hash = key_hash(self.key_at(off, &hdr)) as u32;
                let bucket = self.layout.bucket_for_hash(hash);
                hdr.prev_size = prev_size as u32;
                hdr.hash = hash;
                hdr.next = self.bucket_head(bucket) as u64;
                max_seq = max_seq.max(hdr.seq);
                self.write_slot(off, &hdr);
                self.set_bucket_head(bucket, off);
            } else {
                self.push_free(off, size, prev_size)?;
                free_blocks += 1;
            }
            prev_size = size;
        }

        self.header
            .entry_count
            .store(winners.len() as u64, Ordering::Relaxed);
        self.header.next_seq.fetch_max(max_seq, Ordering::Relaxed);

        Ok(RebuildSummary {
            entries: winners.len(),
            free_blocks,
            dropped_duplicates,
        })
    }
}

/// Brings one segment to a usable state at open.
///
/// Must only run while no other process or thread can touch the segment.
pub(crate) fn recover_segment<D>(
    store: &mut SegmentStore<'_, D>,
    verify_clean: bool,
) -> SegmentStatus
where
    D: AsRef<[u8]> + AsMut<[u8]>,
{
    let segment = store.segment();
    let lock = SegmentLock::new(segment, store.header, 0);

    if lock.is_locked() {
        warn!(segment, dirty = lock.is_dirty(), "segment was left locked, rebuilding");
        let rebuilt = store
            .rebuild()
            .and_then(|summary| store.verify().map(|_| summary));
        return match rebuilt {
            Ok(summary) => {
                lock.reset();
                info!(
                    segment,
                    entries = summary.entries,
                    free_blocks = summary.free_blocks,
                    dropped = summary.dropped_duplicates,
                    "segment rebuilt"
                );
                SegmentStatus::Recovered {
                    entries: summary.entries,
                    free_blocks: summary.free_blocks,
                    dropped_duplicates: summary.dropped_duplicates,
                }
            }
            Err(e) => {
                warn!(segment, error = %e, "segment rebuild failed");
                SegmentStatus::Excluded {
                    reason: e.to_string(),
                }
            }
        };
    }

    if verify_clean {
        if let Err(e) = store.verify() {
            warn!(segment, error = %e, "clean segment failed verification");
            return SegmentStatus::Excluded {
                reason: e.to_string(),
            };
        }
        debug!(segment, "segment verified");
    }
    SegmentStatus::Clean
}

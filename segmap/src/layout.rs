//! Byte layout of the backing file.
//!
//! ```text
//! [MapHeader (128 B)]
//! [SegmentHeader; segment_count] (128 B each)
//! <pad to 4 KiB>
//! [segment data region; segment_count] (segment_size B each)
//!     [bucket table: u64 chain heads][slots ... high_water][unused]
//! ```
//!
//! Every link stored inside a data region is a byte offset from the start of
//! that region, so regions can be moved or remapped without fixups.

use std::hash::BuildHasher;
use std::sync::atomic::AtomicU64;

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxBuildHasher;

use crate::config::MapConfig;
use crate::error::{Result, SegmapError};

pub const MAGIC: [u8; 8] = *b"SEGMAP\0\x01";
pub const FORMAT_VERSION: u32 = 1;

pub const MAP_HEADER_SIZE: usize = 128;
pub const SEGMENT_HEADER_SIZE: usize = 128;
pub const PAGE_SIZE: usize = 4096;

/// Slot sizes are multiples of this
pub const GRANULE: usize = 16;
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();
pub const MIN_SLOT_SIZE: usize = 48;
pub const NUM_SIZE_CLASSES: usize = 10;

pub const ALIAS_LEN: usize = 32;

pub const MAX_SEGMENTS: usize = 1 << 20;
/// Slot sizes are stored as u32, so a data region never exceeds this
pub const MAX_SEGMENT_SIZE: usize = (u32::MAX as usize) & !(PAGE_SIZE - 1);

/// Map header flag: a grow was in progress and did not finish
pub const FLAG_RESIZING: u32 = 1;

pub const STATE_FREE: u32 = u32::from_le_bytes(*b"FREE");
pub const STATE_LIVE: u32 = u32::from_le_bytes(*b"LIVE");
pub const STATE_TOMBSTONE: u32 = u32::from_le_bytes(*b"TOMB");

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MapHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub segment_count: u64,
    pub segment_size: u64,
    pub bucket_count: u64,
    pub key_alias: [u8; ALIAS_LEN],
    pub value_alias: [u8; ALIAS_LEN],
    pub reserved: [u64; 3],
}

const _: () = assert!(std::mem::size_of::<MapHeader>() == MAP_HEADER_SIZE);

/// Per-segment bookkeeping, stored in the file.
///
/// Only `lock_word` is touched without holding the lock; the other fields
/// are atomics so that shared references into the mapping stay sound.
#[repr(C)]
pub struct SegmentHeader {
    pub lock_word: AtomicU64,
    pub recursion: AtomicU64,
    pub entry_count: AtomicU64,
    pub high_water: AtomicU64,
    pub next_seq: AtomicU64,
    /// Size of the last slot below `high_water`, 0 when there is none
    pub tail_size: AtomicU64,
    pub free_heads: [AtomicU64; NUM_SIZE_CLASSES],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

/// Header at the start of every slot, live or free
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct SlotHeader {
    /// Total slot size including this header
    pub size: u32,
    /// Size of the physically preceding slot, 0 for the first slot
    pub prev_size: u32,
    pub state: u32,
    pub key_len: u32,
    pub value_len: u32,
    pub hash: u32,
    /// Collision chain link for live slots, next free block for free slots
    pub next: u64,
    /// Write sequence for live slots, previous free block for free slots
    pub seq: u64,
}

impl SlotHeader {
    pub fn payload_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }
}

pub fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Slot size needed for a key and value of the given lengths
pub fn slot_size_for(payload: usize) -> usize {
    round_up(SLOT_HEADER_SIZE + payload, GRANULE).max(MIN_SLOT_SIZE)
}

/// Free-list class for a block of `size` bytes: class k holds sizes in
/// `[MIN_SLOT_SIZE << k, MIN_SLOT_SIZE << (k + 1))`, the last class is open ended.
pub fn size_class(size: usize) -> usize {
    let ratio = (size / MIN_SLOT_SIZE).max(1);
    (ratio.ilog2() as usize).min(NUM_SIZE_CLASSES - 1)
}

/// Deterministic key hash; the same on every run and in every process
pub fn key_hash(key: &[u8]) -> u64 {
    FxBuildHasher.hash_one(key)
}

/// Geometry of a map file, derived from its header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub segment_count: usize,
    pub segment_size: usize,
    pub bucket_count: usize,
}

impl Layout {
    pub fn from_config(config: &MapConfig) -> Result<Self> {
        let segment_count = config.segment_count();
        if segment_count == 0 || segment_count > MAX_SEGMENTS {
            return Err(SegmapError::InvalidInput(format!(
                "segment count must be in 1..={MAX_SEGMENTS}, got {segment_count}"
            )));
        }
        let per_segment = config.entries_per_segment();
        let bucket_count = per_segment.next_power_of_two();
        let slot = slot_size_for(config.average_key_size + config.average_value_size);
        let slots = per_segment
            .checked_mul(slot)
            .and_then(|n| n.checked_mul(3))
            .map(|n| n / 2)
            .ok_or_else(|| SegmapError::InvalidInput("segment size overflows".into()))?;

        let layout = Self {
            segment_count,
            segment_size: 0,
            bucket_count,
        };
        let segment_size = round_up(layout.slots_start() + slots, PAGE_SIZE);
        if segment_size > MAX_SEGMENT_SIZE {
            return Err(SegmapError::InvalidInput(format!(
                "segments of {segment_size} bytes exceed {MAX_SEGMENT_SIZE}; use more segments"
            )));
        }
        Ok(Self {
            segment_size,
            ..layout
        })
    }

    pub fn from_header(header: &MapHeader) -> Self {
        Self {
            segment_count: header.segment_count as usize,
            segment_size: header.segment_size as usize,
            bucket_count: header.bucket_count as usize,
        }
    }

    pub fn segment_header_offset(&self, segment: usize) -> usize {
        MAP_HEADER_SIZE + segment * SEGMENT_HEADER_SIZE
    }

    pub fn data_start(&self) -> usize {
        round_up(
            MAP_HEADER_SIZE + self.segment_count * SEGMENT_HEADER_SIZE,
            PAGE_SIZE,
        )
    }

    pub fn segment_data_offset(&self, segment: usize) -> usize {
        self.data_start() + segment * self.segment_size
    }

    /// Offset of the first slot within a data region, just past the bucket table
    pub fn slots_start(&self) -> usize {
        round_up(self.bucket_count * 8, GRANULE)
    }

    pub fn total_len(&self) -> usize {
        self.data_start() + self.segment_count * self.segment_size
    }

    pub fn segment_for_hash(&self, hash: u64) -> usize {
        ((hash >> 32) as usize) % self.segment_count
    }

    pub fn bucket_for_hash(&self, hash: u32) -> usize {
        hash as usize & (self.bucket_count - 1)
    }

    /// Checks a layout read from disk before anything is dereferenced
    pub fn validate(&self, file_len: usize) -> Result<()> {
        if self.segment_count == 0 {
            return Err(SegmapError::Format("segment count is zero".into()));
        }
        if !self.bucket_count.is_power_of_two() || self.bucket_count > MAX_SEGMENT_SIZE / 8 {
            return Err(SegmapError::Format(format!(
                "bucket count {} is invalid",
                self.bucket_count
            )));
        }
        if self.segment_count > MAX_SEGMENTS {
            return Err(SegmapError::Format(format!(
                "segment count {} exceeds {MAX_SEGMENTS}",
                self.segment_count
            )));
        }
        if self.segment_size % GRANULE != 0
            || self.segment_size < self.slots_start()
            || self.segment_size > MAX_SEGMENT_SIZE
        {
            return Err(SegmapError::Format(format!(
                "segment size {} is invalid",
                self.segment_size
            )));
        }
        if self.total_len() > file_len {
            return Err(SegmapError::Format(format!(
                "file is {file_len} bytes but layout needs {}",
                self.total_len()
            )));
        }
        Ok(())
    }
}

impl MapHeader {
    pub fn new(layout: &Layout, key_alias: &str, value_alias: &str) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            segment_count: layout.segment_count as u64,
            segment_size: layout.segment_size as u64,
            bucket_count: layout.bucket_count as u64,
            key_alias: encode_alias(key_alias),
            value_alias: encode_alias(value_alias),
            reserved: [0; 3],
        }
    }

    pub fn validate(&self, key_alias: &str, value_alias: &str) -> Result<()> {
        if self.magic != MAGIC {
            return Err(SegmapError::Format(format!(
                "bad magic {:?}",
                self.magic
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(SegmapError::Format(format!(
                "unsupported version {} (expected {FORMAT_VERSION})",
                self.version
            )));
        }
        if self.flags & FLAG_RESIZING != 0 {
            return Err(SegmapError::Format(
                "a resize was interrupted; segment regions are inconsistent".into(),
            ));
        }
        if self.key_alias != encode_alias(key_alias) {
            return Err(SegmapError::Format(format!(
                "key type mismatch: file has {:?}, caller uses {key_alias:?}",
                decode_alias(&self.key_alias)
            )));
        }
        if self.value_alias != encode_alias(value_alias) {
            return Err(SegmapError::Format(format!(
                "value type mismatch: file has {:?}, caller uses {value_alias:?}",
                decode_alias(&self.value_alias)
            )));
        }
        Ok(())
    }
}

/// Aliases longer than the header field keep their tail, which is the
/// distinguishing part of a fully qualified type name.
fn encode_alias(alias: &str) -> [u8; ALIAS_LEN] {
    let bytes = alias.as_bytes();
    let tail = &bytes[bytes.len().saturating_sub(ALIAS_LEN)..];
    let mut out = [0u8; ALIAS_LEN];
    out[..tail.len()].copy_from_slice(tail);
    out
}

fn decode_alias(raw: &[u8; ALIAS_LEN]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(ALIAS_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

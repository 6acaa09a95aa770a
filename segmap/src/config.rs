//! Open-time configuration for a segmented map.

use crate::byte_store::Durability;
use crate::types::CodecRegistry;

/// What to do when a segment fails verification or rebuild at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Any corrupt segment aborts the open
    #[default]
    Strict,
    /// Corrupt segments are excluded; the others stay usable
    Permissive,
}

/// Sizing and behaviour of a map, consumed once when the file is created or opened
#[derive(Debug, Clone)]
pub struct MapConfig {
    // -------------------------------------------------------------------------
    // Sizing (only used when the file is created)
    // -------------------------------------------------------------------------
    /// Expected number of entries across all segments
    pub entries: usize,

    /// Average encoded key size in bytes
    pub average_key_size: usize,

    /// Average encoded value size in bytes
    pub average_value_size: usize,

    /// Fixed number of segments; derived from `entries` when `None`
    pub actual_segments: Option<usize>,

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------
    pub strictness: Strictness,

    /// Verify clean segments on open, not only dirty ones
    pub verify_on_open: bool,

    // -------------------------------------------------------------------------
    // Runtime
    // -------------------------------------------------------------------------
    /// Grow the file when a segment runs out of space (single process only)
    pub resizable: bool,

    /// Flush level applied by `close()`
    pub close_durability: Durability,

    /// Backoff rounds before a blocked locker starts yielding its time slice
    pub lock_spin_limit: u32,

    /// Aliases recorded for the key and value item types
    pub codecs: CodecRegistry,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            entries: 1024,
            average_key_size: 8,
            average_value_size: 64,
            actual_segments: None,
            strictness: Strictness::Strict,
            verify_on_open: true,
            resizable: false,
            close_durability: Durability::Sync,
            lock_spin_limit: 64,
            codecs: CodecRegistry::new(),
        }
    }
}

impl MapConfig {
    pub fn builder() -> MapConfigBuilder {
        MapConfigBuilder::default()
    }

    /// Segment count used when `actual_segments` is not set: one segment per
    /// 256 expected entries, rounded to a power of two and capped at 1024.
    pub fn segment_count(&self) -> usize {
        match self.actual_segments {
            Some(n) => n,
            None => (self.entries / 256).clamp(1, 1024).next_power_of_two(),
        }
    }

    pub fn entries_per_segment(&self) -> usize {
        self.entries.div_ceil(self.segment_count()).max(1)
    }
}

/// Builder for MapConfig
#[derive(Default)]
pub struct MapConfigBuilder {
    config: MapConfig,
}

impl MapConfigBuilder {
    pub fn entries(mut self, entries: usize) -> Self {
        self.config.entries = entries;
        self
    }

    pub fn average_key_size(mut self, size: usize) -> Self {
        self.config.average_key_size = size;
        self
    }

    pub fn average_value_size(mut self, size: usize) -> Self {
        self.config.average_value_size = size;
        self
    }

    pub fn actual_segments(mut self, segments: usize) -> Self {
        self.config.actual_segments = Some(segments);
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.config.strictness = strictness;
        self
    }

    pub fn verify_on_open(mut self, verify: bool) -> Self {
        self.config.verify_on_open = verify;
        self
    }

    pub fn resizable(mut self, resizable: bool) -> Self {
        self.config.resizable = resizable;
        self
    }

    pub fn close_durability(mut self, durability: Durability) -> Self {
        self.config.close_durability = durability;
        self
    }

    pub fn lock_spin_limit(mut self, rounds: u32) -> Self {
        self.config.lock_spin_limit = rounds;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.config.codecs = codecs;
        self
    }

    pub fn build(self) -> MapConfig {
        self.config
    }
}

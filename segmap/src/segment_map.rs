//! The public map: a file-backed hash map split into independently locked
//! segments.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::byte_store::{Durability, MMapFile};
use crate::config::{MapConfig, Strictness};
use crate::error::{Result, SegmapError};
use crate::layout::{
    key_hash, Layout, MapHeader, FLAG_RESIZING, MAP_HEADER_SIZE, MAX_SEGMENT_SIZE,
};
use crate::lock::SegmentLock;
use crate::recovery::{recover_segment, RecoveryReport, SegmentStatus};
use crate::segment::{PutOutcome, SegmentRegion, SegmentStats, SegmentStore};
use crate::traversal::SegmentContext;
use crate::types::Codec;

pub(crate) struct Mapping {
    pub file: MMapFile,
    pub layout: Layout,
}

impl Mapping {
    fn read_header(&self) -> MapHeader {
        bytemuck::pod_read_unaligned(&self.file.as_ref()[..MAP_HEADER_SIZE])
    }

    fn write_header(&self, header: &MapHeader) {
        // SAFETY: the first MAP_HEADER_SIZE bytes of the mapping belong to the
        // header and callers hold the map exclusively (creation or grow).
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(header).as_ptr(),
                self.file.base_ptr().as_ptr(),
                MAP_HEADER_SIZE,
            );
        }
    }

    fn region(&self, segment: usize) -> SegmentRegion<'_> {
        SegmentRegion::new(&self.file, &self.layout, segment)
    }

    /// # Safety
    /// No other thread or process may access `segment` while the returned
    /// store is alive.
    unsafe fn exclusive_store(&self, segment: usize) -> SegmentStore<'_, &mut [u8]> {
        let region = self.region(segment);
        // SAFETY: forwarded from the caller
        SegmentStore::new(segment, region.header, self.layout, unsafe { region.bytes_mut() })
    }
}

/// A persistent hash map partitioned into segments.
///
/// Keys are routed to a segment by hash; every operation locks only the
/// segment it touches. The backing file can be shared by several processes,
/// each opening its own `SegmentMap`.
pub struct SegmentMap<KC: Codec, VC: Codec> {
    pub(crate) mapping: RwLock<Mapping>,
    pub(crate) config: MapConfig,
    pub(crate) key_codec: KC,
    pub(crate) value_codec: VC,
    pub(crate) traversals: Box<[CachePadded<AtomicUsize>]>,
    segment_count: usize,
    report: RecoveryReport,
}

impl<KC, VC> SegmentMap<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: 'static,
    VC::Item: 'static,
{
    /// Opens the map stored at `path`, creating it when the file is missing
    /// or empty.
    ///
    /// When this handle is the only one attached to the file, segments left
    /// locked by a dead owner are rebuilt and, with `verify_on_open`, clean
    /// segments are checked. Corrupt segments abort the open under
    /// `Strictness::Strict` and are excluded under `Strictness::Permissive`.
    pub fn open_or_create_or_recover(
        path: impl AsRef<Path>,
        config: MapConfig,
        key_codec: KC,
        value_codec: VC,
    ) -> Result<Self> {
        let path = path.as_ref();
        let key_alias = config.codecs.alias_for(&key_codec);
        let value_alias = config.codecs.alias_for(&value_codec);

        let existing = path.exists() && std::fs::metadata(path)?.len() > 0;
        let (mapping, report) = if existing {
            Self::open_existing(path, &config, &key_alias, &value_alias)?
        } else {
            Self::create(path, &config, &key_alias, &value_alias)?
        };

        let segment_count = mapping.layout.segment_count;
        let traversals = (0..segment_count)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();

        Ok(Self {
            mapping: RwLock::new(mapping),
            config,
            key_codec,
            value_codec,
            traversals,
            segment_count,
            report,
        })
    }

    fn create(
        path: &Path,
        config: &MapConfig,
        key_alias: &str,
        value_alias: &str,
    ) -> Result<(Mapping, RecoveryReport)> {
        let layout = Layout::from_config(config)?;
        let file = MMapFile::new(path, layout.total_len())?;
        if !file.try_lock_exclusive() {
            return Err(SegmapError::Format(format!(
                "{} is being created by another process",
                path.display()
            )));
        }
        let mapping = Mapping { file, layout };
        for segment in 0..layout.segment_count {
            // SAFETY: the file was just created and is locked exclusively
            unsafe { mapping.exclusive_store(segment) }.clear();
        }
        // header last: a file without magic is never mistaken for a map
        mapping.write_header(&MapHeader::new(&layout, key_alias, value_alias));
        mapping.file.flush(Durability::Sync)?;
        Self::attach(&mapping.file, config, true)?;

        info!(
            path = %path.display(),
            segments = layout.segment_count,
            segment_size = layout.segment_size,
            buckets = layout.bucket_count,
            "created segment map"
        );
        Ok((mapping, RecoveryReport {
            segments: vec![SegmentStatus::Clean; layout.segment_count],
            skipped: false,
        }))
    }

    fn open_existing(
        path: &Path,
        config: &MapConfig,
        key_alias: &str,
        value_alias: &str,
    ) -> Result<(Mapping, RecoveryReport)> {
        let file = MMapFile::from_file(path)?;
        if file.len() < MAP_HEADER_SIZE {
            return Err(SegmapError::Format(format!(
                "file is {} bytes, too small for a map header",
                file.len()
            )));
        }
        let header: MapHeader = bytemuck::pod_read_unaligned(&file.as_ref()[..MAP_HEADER_SIZE]);
        header.validate(key_alias, value_alias)?;
        let layout = Layout::from_header(&header);
        layout.validate(file.len())?;

        let exclusive = file.try_lock_exclusive();
        let mapping = Mapping { file, layout };
        let report = if exclusive {
            let segments = (0..layout.segment_count)
                .map(|segment| {
                    // SAFETY: no other process is attached and this handle is
                    // not shared yet
                    let mut store = unsafe { mapping.exclusive_store(segment) };
                    recover_segment(&mut store, config.verify_on_open)
                })
                .collect();
            RecoveryReport {
                segments,
                skipped: false,
            }
        } else {
            debug!(path = %path.display(), "other attachers present, skipping recovery");
            RecoveryReport::skipped(layout.segment_count)
        };

        if let Some(segment) = report.excluded().next() {
            if config.strictness == Strictness::Strict {
                let reason = match &report.segments[segment] {
                    SegmentStatus::Excluded { reason } => reason.clone(),
                    _ => String::new(),
                };
                return Err(SegmapError::CorruptSegment { segment, reason });
            }
            for segment in report.excluded() {
                warn!(segment, "segment excluded from use");
            }
        }

        Self::attach(&mapping.file, config, exclusive)?;
        info!(
            path = %path.display(),
            segments = layout.segment_count,
            recovered = report.recovered().count(),
            excluded = report.excluded().count(),
            "opened segment map"
        );
        Ok((mapping, report))
    }

    /// Settles the advisory file lock for normal operation: resizable maps
    /// keep the exclusive lock, everything else holds a shared one.
    fn attach(file: &MMapFile, config: &MapConfig, exclusive: bool) -> Result<()> {
        match (exclusive, config.resizable) {
            (true, true) => Ok(()),
            (true, false) => {
                file.unlock_file()?;
                Ok(file.lock_shared()?)
            }
            (false, true) => Err(SegmapError::InvalidInput(
                "a resizable map must be the only handle on its file".into(),
            )),
            (false, false) => Ok(file.lock_shared()?),
        }
    }
}

impl<KC: Codec, VC: Codec> SegmentMap<KC, VC> {
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn layout(&self) -> Layout {
        self.mapping.read_recursive().layout
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Per-segment outcome of the recovery pass run at open
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    pub(crate) fn check_segment(&self, segment: usize) -> Result<()> {
        match self.report.segments.get(segment) {
            None => Err(SegmapError::InvalidInput(format!(
                "segment {segment} out of range (map has {})",
                self.segment_count
            ))),
            Some(SegmentStatus::Excluded { reason }) => Err(SegmapError::CorruptSegment {
                segment,
                reason: reason.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn read_segment<R>(
        &self,
        segment: usize,
        f: impl FnOnce(&SegmentStore<'_, &[u8]>) -> Result<R>,
    ) -> Result<R> {
        self.check_segment(segment)?;
        let mapping = self.mapping.read_recursive();
        let region = mapping.region(segment);
        let _guard = SegmentLock::new(segment, region.header, self.config.lock_spin_limit).guard();
        // SAFETY: the segment lock is held; a traversal on this thread may
        // hold another shared view, never a mutable one.
        let store = SegmentStore::new(segment, region.header, mapping.layout, unsafe {
            region.bytes()
        });
        f(&store)
    }

    fn write_segment<R>(
        &self,
        segment: usize,
        f: impl FnOnce(&mut SegmentStore<'_, &mut [u8]>) -> Result<R>,
    ) -> Result<R> {
        self.check_segment(segment)?;
        let mapping = self.mapping.read_recursive();
        let region = mapping.region(segment);
        let _guard = SegmentLock::new(segment, region.header, self.config.lock_spin_limit).guard();
        // holding the lock means any traversal of this segment is our own
        if self.traversals[segment].load(Ordering::Acquire) > 0 {
            return Err(SegmapError::TraversalInProgress { segment });
        }
        // SAFETY: the segment lock is held and no traversal on this thread
        // has a view of the segment.
        let mut store = SegmentStore::new(segment, region.header, mapping.layout, unsafe {
            region.bytes_mut()
        });
        f(&mut store)
    }

    fn encode<C: Codec>(codec: &C, item: &C::Item) -> Result<Vec<u8>> {
        let size = codec.size(item);
        let mut buf = vec![0u8; size];
        let written = codec
            .write(item, &mut buf)
            .map_err(|e| SegmapError::Encoding(e.to_string()))?;
        if written != size {
            return Err(SegmapError::Encoding(format!(
                "codec declared {size} bytes but wrote {written}"
            )));
        }
        Ok(buf)
    }

    fn route(&self, key: &[u8]) -> (usize, u32) {
        let hash = key_hash(key);
        let segment = self.mapping.read_recursive().layout.segment_for_hash(hash);
        (segment, hash as u32)
    }

    /// Whether the calling thread owns the lock of any segment of this map
    fn holds_any_segment(&self) -> bool {
        let mapping = self.mapping.read_recursive();
        (0..self.segment_count).any(|segment| {
            SegmentLock::new(segment, mapping.region(segment).header, 0)
                .is_held_by_current_thread()
        })
    }

    /// Segment that holds (or would hold) `key`
    pub fn segment_for_key(&self, key: &KC::Item) -> Result<usize> {
        let key = Self::encode(&self.key_codec, key)?;
        Ok(self.route(&key).0)
    }

    pub fn segment_context(&self, segment: usize) -> Result<SegmentContext<'_, KC, VC>> {
        if segment >= self.segment_count {
            return Err(SegmapError::InvalidInput(format!(
                "segment {segment} out of range (map has {})",
                self.segment_count
            )));
        }
        Ok(SegmentContext::new(self, segment))
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// Key and value are encoded before the segment is locked, so a codec
    /// failure leaves the map untouched. A resizable map grows its segments
    /// and retries when the target segment is full.
    pub fn put(&self, key: &KC::Item, value: &VC::Item) -> Result<PutOutcome> {
        let key = Self::encode(&self.key_codec, key)?;
        let value = Self::encode(&self.value_codec, value)?;
        let (segment, hash) = self.route(&key);
        loop {
            let seen = self.mapping.read_recursive().layout.segment_size;
            match self.write_segment(segment, |s| s.put(&key, hash, &value)) {
                Err(e @ SegmapError::CapacityExceeded { .. }) if self.config.resizable => {
                    if !self.grow(seen)? {
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    pub fn get(&self, key: &KC::Item) -> Result<Option<VC::Item>> {
        let key = Self::encode(&self.key_codec, key)?;
        let (segment, hash) = self.route(&key);
        self.read_segment(segment, |s| {
            s.get(&key, hash)?
                .map(|bytes| {
                    self.value_codec
                        .read(bytes)
                        .map_err(|e| SegmapError::Decoding(e.to_string()))
                })
                .transpose()
        })
    }

    pub fn contains_key(&self, key: &KC::Item) -> Result<bool> {
        let key = Self::encode(&self.key_codec, key)?;
        let (segment, hash) = self.route(&key);
        self.read_segment(segment, |s| Ok(s.find(&key, hash)?.is_some()))
    }

    /// Removes `key`, returning whether it was present
    pub fn remove(&self, key: &KC::Item) -> Result<bool> {
        let key = Self::encode(&self.key_codec, key)?;
        let (segment, hash) = self.route(&key);
        self.write_segment(segment, |s| s.remove(&key, hash))
    }

    pub fn segment_len(&self, segment: usize) -> Result<usize> {
        self.read_segment(segment, |s| Ok(s.len()))
    }

    /// Live entries across all usable segments
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for segment in self.usable_segments() {
            total += self.segment_len(segment)?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn segment_stats(&self, segment: usize) -> Result<SegmentStats> {
        self.read_segment(segment, |s| s.stats())
    }

    /// Drops every entry of one segment
    pub fn clear_segment(&self, segment: usize) -> Result<()> {
        self.write_segment(segment, |s| {
            s.clear();
            Ok(())
        })
    }

    /// Structural check of every usable segment, each under its lock
    pub fn verify(&self) -> Result<()> {
        for segment in self.usable_segments() {
            self.read_segment(segment, |s| s.verify())?;
        }
        Ok(())
    }

    pub fn flush(&self, durability: Durability) -> Result<()> {
        Ok(self.mapping.read_recursive().file.flush(durability)?)
    }

    fn usable_segments(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.segment_count).filter(|s| self.check_segment(*s).is_ok())
    }

    /// Doubles every segment's data region. Returns false when the regions
    /// cannot grow further or the calling thread holds a segment lock.
    fn grow(&self, seen_segment_size: usize) -> Result<bool> {
        if self.holds_any_segment() {
            debug!("not growing while this thread holds a segment lock");
            return Ok(false);
        }
        let mut mapping = self.mapping.write();
        let old = mapping.layout;
        if old.segment_size > seen_segment_size {
            // another thread already grew the map
            return Ok(true);
        }
        let Some(new_size) = old
            .segment_size
            .checked_mul(2)
            .filter(|size| *size <= MAX_SEGMENT_SIZE)
        else {
            return Ok(false);
        };
        let new = Layout {
            segment_size: new_size,
            ..old
        };

        let mut header = mapping.read_header();
        header.flags |= FLAG_RESIZING;
        mapping.write_header(&header);
        mapping.file.flush(Durability::Sync)?;

        mapping.file.grow(new.total_len())?;
        let base = mapping.file.base_ptr().as_ptr();
        for segment in (0..old.segment_count).rev() {
            let from = old.segment_data_offset(segment);
            let to = new.segment_data_offset(segment);
            // SAFETY: both ranges lie inside the grown mapping; higher
            // segments move first, so no source is overwritten before it is
            // copied. The write lock excludes every other user of the map.
            unsafe {
                std::ptr::copy(base.add(from), base.add(to), old.segment_size);
                std::ptr::write_bytes(
                    base.add(to + old.segment_size),
                    0,
                    new_size - old.segment_size,
                );
            }
        }

        header.segment_size = new_size as u64;
        header.flags &= !FLAG_RESIZING;
        mapping.write_header(&header);
        mapping.file.flush(Durability::Sync)?;
        mapping.layout = new;

        info!(
            from = old.segment_size,
            to = new_size,
            file_len = new.total_len(),
            "grew segments"
        );
        Ok(true)
    }

    /// Flushes with the configured durability and releases any segment
    /// locks still held by the calling thread.
    pub fn close(self) -> Result<()> {
        let mapping = self.mapping.read();
        let mut released = 0;
        for segment in 0..self.segment_count {
            let region = mapping.region(segment);
            if SegmentLock::new(segment, region.header, 0).release_all_held() {
                released += 1;
            }
        }
        if released > 0 {
            warn!(released, "released segment locks still held at close");
        }
        mapping.file.flush(self.config.close_durability)?;
        info!(path = %mapping.file.path().display(), "closed segment map");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MAX_SEGMENT_SIZE, PAGE_SIZE};
    use crate::types::{Bincode, BoxError, CodecRegistry, Native, Str};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::io::{Seek, SeekFrom, Write};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct MyDto {
        s1: Option<String>,
        s2: Option<String>,
    }

    impl MyDto {
        fn new(i: u32) -> Self {
            Self {
                s1: Some(format!("left-{i}")),
                s2: (i % 2 == 0).then(|| format!("right-{i}")),
            }
        }
    }

    type DtoMap = SegmentMap<Native<u32>, Bincode<MyDto>>;

    fn dto_config() -> MapConfig {
        MapConfig::builder()
            .entries(256)
            .average_value_size(128)
            .actual_segments(1)
            .codecs(CodecRegistry::new().register::<MyDto>("MyDto"))
            .build()
    }

    fn open_dto(path: &Path, config: MapConfig) -> Result<DtoMap> {
        SegmentMap::open_or_create_or_recover(path, config, Native::default(), Bincode::default())
    }

    fn open_str(path: &Path, config: MapConfig) -> Result<SegmentMap<Str, Str>> {
        SegmentMap::open_or_create_or_recover(path, config, Str, Str)
    }

    #[test]
    fn put_get_remove_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let map = open_dto(&dir.path().join("map.bin"), dto_config())?;

        assert_eq!(map.put(&1, &MyDto::new(1))?, PutOutcome::Inserted);
        assert_eq!(map.put(&1, &MyDto::new(11))?, PutOutcome::Replaced);
        assert_eq!(map.get(&1)?, Some(MyDto::new(11)));
        assert!(map.contains_key(&1)?);
        assert_eq!(map.get(&2)?, None);

        assert!(map.remove(&1)?);
        assert!(!map.remove(&1)?);
        assert_eq!(map.get(&1)?, None);
        assert!(map.is_empty()?);
        map.verify()?;
        map.close()
    }

    #[test]
    fn entries_survive_close_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let config = MapConfig::builder().entries(2000).build();
        {
            let map = open_str(&path, config.clone())?;
            assert_eq!(map.segment_count(), 8);
            for i in 0..500 {
                map.put(&format!("key-{i}"), &format!("value-{i}"))?;
            }
            map.close()?;
        }
        let map = open_str(&path, config)?;
        assert!(map.recovery_report().is_clean());
        assert_eq!(map.len()?, 500);
        for i in (0..500).step_by(37) {
            assert_eq!(map.get(&format!("key-{i}"))?, Some(format!("value-{i}")));
        }
        map.verify()?;
        map.close()
    }

    #[test]
    fn mismatched_value_type_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        open_dto(&path, dto_config())?.close()?;

        let other = SegmentMap::open_or_create_or_recover(
            &path,
            dto_config(),
            Native::<u32>::default(),
            Str,
        );
        assert!(matches!(other, Err(SegmapError::Format(_))));
        Ok(())
    }

    #[test]
    fn garbage_file_is_a_format_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        std::fs::write(&path, vec![0xAAu8; 4096])?;
        assert!(matches!(
            open_str(&path, MapConfig::default()),
            Err(SegmapError::Format(_))
        ));
        Ok(())
    }

    #[test]
    fn encoding_failure_leaves_map_untouched() -> Result<()> {
        struct Failing;
        impl Codec for Failing {
            type Item = String;
            fn size(&self, item: &String) -> usize {
                item.len()
            }
            fn write(&self, _item: &String, _out: &mut [u8]) -> std::result::Result<usize, BoxError> {
                Err("refusing to encode".into())
            }
            fn read(&self, bytes: &[u8]) -> std::result::Result<String, BoxError> {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }

        let dir = tempdir()?;
        let map = SegmentMap::open_or_create_or_recover(
            dir.path().join("map.bin"),
            MapConfig::default(),
            Str,
            Failing,
        )?;
        assert!(matches!(
            map.put(&"k".to_string(), &"v".to_string()),
            Err(SegmapError::Encoding(_))
        ));
        assert!(map.is_empty()?);
        map.close()
    }

    #[test]
    fn codec_writing_fewer_bytes_than_declared_is_rejected() -> Result<()> {
        struct Padded;
        impl Codec for Padded {
            type Item = String;
            fn size(&self, item: &String) -> usize {
                item.len() + 4
            }
            fn write(&self, item: &String, out: &mut [u8]) -> std::result::Result<usize, BoxError> {
                out[..item.len()].copy_from_slice(item.as_bytes());
                Ok(item.len())
            }
            fn read(&self, bytes: &[u8]) -> std::result::Result<String, BoxError> {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }

        let dir = tempdir()?;
        let map = SegmentMap::open_or_create_or_recover(
            dir.path().join("map.bin"),
            MapConfig::default(),
            Str,
            Padded,
        )?;
        let put = map.put(&"k".to_string(), &"v".to_string());
        assert!(matches!(put, Err(SegmapError::Encoding(ref msg)) if msg.contains("declared 5")));
        assert_eq!(map.get(&"k".to_string())?, None);
        assert!(map.is_empty()?);
        map.close()
    }

    /// A writer on another thread blocks on the segment while a slow
    /// traversal holds it, and everything it wrote is visible afterwards.
    #[test]
    fn traversal_blocks_writers_on_same_segment() -> Result<()> {
        let dir = tempdir()?;
        let map = open_dto(&dir.path().join("map.bin"), dto_config())?;
        for i in 0..50 {
            map.put(&i, &MyDto::new(i))?;
        }

        let map = &map;
        let (seen, expected) = thread::scope(move |scope| -> Result<(usize, usize)> {
            let (started_tx, started_rx) = mpsc::channel();
            let writer = scope.spawn(move || -> Result<()> {
                // a closed channel means the traversal failed; nothing to do
                if started_rx.recv().is_err() {
                    return Ok(());
                }
                for i in 1000..1100 {
                    map.put(&i, &MyDto::new(i))?;
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });

            let context = map.segment_context(0)?;
            let mut seen = 0;
            let mut expected = 0;
            let traversed = context.for_each_segment_entry_while(|entry| {
                if seen == 0 {
                    // reentrant read of the locked segment
                    expected = context.len()?;
                    let _ = started_tx.send(());
                }
                let key = entry.key()?;
                assert_eq!(entry.value()?, MyDto::new(key));
                seen += 1;
                thread::sleep(Duration::from_millis(2));
                Ok::<_, SegmapError>(true)
            });
            drop(started_tx);

            writer
                .join()
                .map_err(|_| SegmapError::InvalidInput("writer panicked".into()))??;
            assert!(traversed?);
            Ok((seen, expected))
        })?;

        assert_eq!(expected, 50);
        assert_eq!(seen, expected);
        for i in 1000..1100 {
            assert_eq!(map.get(&i)?, Some(MyDto::new(i)));
        }
        assert_eq!(map.len()?, 150);
        Ok(())
    }

    fn assert_unlocked_elsewhere(map: &DtoMap) {
        thread::scope(|scope| {
            scope
                .spawn(|| {
                    let context = map.segment_context(0).unwrap();
                    context.try_lock(Duration::ZERO).unwrap();
                    context.unlock().unwrap();
                })
                .join()
                .unwrap();
        });
    }

    #[test]
    fn traversal_releases_lock_on_every_exit() -> Result<()> {
        let dir = tempdir()?;
        let map = open_dto(&dir.path().join("map.bin"), dto_config())?;
        for i in 0..10 {
            map.put(&i, &MyDto::new(i))?;
        }
        let context = map.segment_context(0)?;

        // early stop
        let mut visits = 0;
        let finished = context.for_each_segment_entry_while(|_| {
            visits += 1;
            Ok::<_, SegmapError>(visits < 3)
        })?;
        assert!(!finished);
        assert_eq!(visits, 3);
        assert_eq!(context.hold_count()?, 0);
        assert_unlocked_elsewhere(&map);

        // exhaustion
        assert!(context.for_each_segment_entry_while(|_| Ok::<_, SegmapError>(true))?);
        assert_unlocked_elsewhere(&map);

        // error from the predicate
        let failed = context.for_each_segment_entry_while(|_| {
            Err::<bool, _>(SegmapError::InvalidInput("stop".into()))
        });
        assert!(matches!(failed, Err(SegmapError::InvalidInput(_))));
        assert_unlocked_elsewhere(&map);

        // panic inside the predicate
        let panicked = catch_unwind(AssertUnwindSafe(|| {
            context.for_each_segment_entry_while(|_| -> Result<bool> { panic!("predicate") })
        }));
        assert!(panicked.is_err());
        assert!(!context.is_locked()?);
        assert_unlocked_elsewhere(&map);

        // the traversal mark is gone too, so mutation works again
        map.put(&99, &MyDto::new(99))?;
        map.close()
    }

    #[test]
    fn mutation_inside_own_traversal_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let map = open_dto(&dir.path().join("map.bin"), dto_config())?;
        map.put(&1, &MyDto::new(1))?;

        let context = map.segment_context(0)?;
        context.for_each_segment_entry(|entry| {
            assert!(map.get(&entry.key().unwrap()).unwrap().is_some());
            assert!(matches!(
                map.put(&2, &MyDto::new(2)),
                Err(SegmapError::TraversalInProgress { segment: 0 })
            ));
            assert!(matches!(
                map.remove(&1),
                Err(SegmapError::TraversalInProgress { segment: 0 })
            ));
        })?;
        assert_eq!(map.len()?, 1);
        map.close()
    }

    #[test]
    fn explicit_lock_is_reentrant_and_owner_checked() -> Result<()> {
        let dir = tempdir()?;
        let map = open_dto(&dir.path().join("map.bin"), dto_config())?;
        let context = map.segment_context(0)?;

        assert!(matches!(context.unlock(), Err(SegmapError::NotLockOwner { segment: 0 })));
        context.lock()?;
        // operations from the holder re-enter the lock
        map.put(&1, &MyDto::new(1))?;
        assert_eq!(context.hold_count()?, 1);
        assert!(context.is_dirty()?);

        let timed_out = thread::scope(|scope| {
            scope
                .spawn(|| map.segment_context(0)?.try_lock(Duration::from_millis(20)))
                .join()
                .unwrap()
        });
        assert!(matches!(timed_out, Err(SegmapError::LockTimeout { .. })));

        context.unlock()?;
        assert!(!context.is_locked()?);
        assert!(matches!(map.segment_context(1), Err(SegmapError::InvalidInput(_))));
        map.close()
    }

    #[test]
    fn close_releases_locks_held_by_caller() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let map = open_dto(&path, dto_config())?;
        let context = map.segment_context(0)?;
        context.lock()?;
        context.lock()?;
        drop(context);
        map.close()?;

        let map = open_dto(&path, dto_config())?;
        assert!(map.recovery_report().is_clean());
        assert!(!map.segment_context(0)?.is_locked()?);
        map.close()
    }

    #[test]
    fn writers_on_different_segments_run_concurrently() -> Result<()> {
        let dir = tempdir()?;
        let config = MapConfig::builder().entries(4096).actual_segments(16).build();
        let map = open_str(&dir.path().join("map.bin"), config)?;
        let threads = 8;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for t in 0..threads {
                let map = &map;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for i in 0..200 {
                        map.put(&format!("{t}-{i}"), &format!("v{i}")).unwrap();
                    }
                });
            }
        });

        assert_eq!(map.len()?, threads * 200);
        assert_eq!(map.get(&"3-150".to_string())?, Some("v150".to_string()));
        map.verify()?;
        map.close()
    }

    #[test]
    fn segment_held_by_one_thread_does_not_block_others() -> Result<()> {
        let dir = tempdir()?;
        let config = MapConfig::builder().entries(1024).actual_segments(4).build();
        let map = open_str(&dir.path().join("map.bin"), config)?;

        let keys: Vec<String> = (0..64).map(|i| format!("k{i}")).collect();
        let mut by_segment: HashMap<usize, Vec<&String>> = HashMap::new();
        for key in &keys {
            by_segment.entry(map.segment_for_key(key)?).or_default().push(key);
        }
        let held = *by_segment.keys().min().unwrap();
        let other_key = by_segment
            .iter()
            .find(|(s, _)| **s != held)
            .map(|(_, k)| k[0].clone())
            .unwrap();

        let context = map.segment_context(held)?;
        context.lock()?;
        thread::scope(|scope| {
            scope
                .spawn(|| map.put(&other_key, &"free".to_string()).unwrap())
                .join()
                .unwrap();
        });
        context.unlock()?;
        assert_eq!(map.get(&other_key)?, Some("free".to_string()));
        map.close()
    }

    #[test]
    fn dirty_segment_is_rebuilt_on_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        {
            let map = open_dto(&path, dto_config())?;
            for i in 0..40 {
                map.put(&i, &MyDto::new(i))?;
            }
            map.remove(&7)?;
            // the owner dies with the lock held: no unlock, no close
            map.segment_context(0)?.lock()?;
            assert!(map.segment_context(0)?.is_dirty()?);
            drop(map);
        }

        let map = open_dto(&path, dto_config())?;
        assert_eq!(
            map.recovery_report().recovered().collect::<Vec<_>>(),
            vec![0]
        );
        assert!(matches!(
            map.recovery_report().segments[0],
            SegmentStatus::Recovered { entries: 39, .. }
        ));
        assert!(!map.segment_context(0)?.is_locked()?);
        assert_eq!(map.len()?, 39);
        assert_eq!(map.get(&7)?, None);
        assert_eq!(map.get(&8)?, Some(MyDto::new(8)));
        map.put(&7, &MyDto::new(7))?;
        map.verify()?;
        map.close()
    }

    #[test]
    fn only_the_abandoned_segment_is_rebuilt() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let config = MapConfig::builder().entries(1024).actual_segments(4).build();
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        let held;
        {
            let map = open_str(&path, config.clone())?;
            for key in &keys {
                map.put(key, key)?;
            }
            held = map.segment_for_key(&keys[0])?;
            map.remove(&keys[0])?;
            map.segment_context(held)?.lock()?;
            drop(map);
        }

        let map = open_str(&path, config)?;
        let report = map.recovery_report();
        assert_eq!(report.recovered().collect::<Vec<_>>(), vec![held]);
        for (segment, status) in report.segments.iter().enumerate() {
            if segment != held {
                assert_eq!(*status, SegmentStatus::Clean, "segment {segment}");
            }
        }
        assert!(!map.segment_context(held)?.is_locked()?);
        assert_eq!(map.get(&keys[0])?, None);
        for key in &keys[1..] {
            assert_eq!(map.get(key)?.as_ref(), Some(key));
        }
        assert_eq!(map.len()?, keys.len() - 1);
        map.verify()?;
        map.close()
    }

    /// Writes a bogus slot size into the first slot of `segment`
    fn corrupt_first_slot(path: &Path, layout: &Layout, segment: usize) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        let at = layout.segment_data_offset(segment) + layout.slots_start();
        file.seek(SeekFrom::Start(at as u64))?;
        file.write_all(&7u32.to_le_bytes())?;
        file.sync_all()
    }

    fn populated_four_segment_map(path: &Path) -> Result<(Layout, Vec<String>)> {
        let config = MapConfig::builder().entries(1024).actual_segments(4).build();
        let map = open_str(path, config)?;
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            map.put(key, key)?;
        }
        let layout = map.layout();
        map.close()?;
        Ok((layout, keys))
    }

    #[test]
    fn corrupt_segment_fails_strict_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let (layout, _) = populated_four_segment_map(&path)?;
        corrupt_first_slot(&path, &layout, 2)?;

        let config = MapConfig::builder().strictness(Strictness::Strict).build();
        assert!(matches!(
            open_str(&path, config),
            Err(SegmapError::CorruptSegment { segment: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn corrupt_segment_is_excluded_when_permissive() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let (layout, keys) = populated_four_segment_map(&path)?;
        corrupt_first_slot(&path, &layout, 2)?;

        let config = MapConfig::builder()
            .strictness(Strictness::Permissive)
            .build();
        let map = open_str(&path, config)?;
        assert_eq!(map.recovery_report().excluded().collect::<Vec<_>>(), vec![2]);

        let mut healthy = 0;
        for key in &keys {
            if map.segment_for_key(key)? == 2 {
                assert!(matches!(
                    map.get(key),
                    Err(SegmapError::CorruptSegment { segment: 2, .. })
                ));
                assert!(matches!(
                    map.put(key, key),
                    Err(SegmapError::CorruptSegment { segment: 2, .. })
                ));
            } else {
                assert_eq!(map.get(key)?.as_ref(), Some(key));
                healthy += 1;
            }
        }
        assert_eq!(map.len()?, healthy);
        map.verify()?;
        map.close()
    }

    #[test]
    fn unverified_corruption_surfaces_on_access() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let (layout, _) = populated_four_segment_map(&path)?;
        corrupt_first_slot(&path, &layout, 1)?;

        let config = MapConfig::builder().verify_on_open(false).build();
        let map = open_str(&path, config)?;
        assert!(map.recovery_report().is_clean());
        assert!(matches!(
            map.verify(),
            Err(SegmapError::CorruptSegment { segment: 1, .. })
        ));
        let stats = map.segment_stats(1);
        assert!(matches!(stats, Err(SegmapError::CorruptSegment { .. })));
        map.close()
    }

    #[test]
    fn resizable_map_grows_when_full() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let config = MapConfig::builder()
            .entries(8)
            .actual_segments(2)
            .resizable(true)
            .build();
        let before;
        {
            let map = open_str(&path, config.clone())?;
            before = map.layout().segment_size;
            for i in 0..400 {
                map.put(&format!("key-{i}"), &"x".repeat(40))?;
            }
            assert!(map.layout().segment_size > before);
            assert_eq!(map.len()?, 400);
            map.verify()?;
            map.close()?;
        }
        let map = open_str(&path, config)?;
        assert!(map.layout().segment_size > before);
        assert_eq!(map.get(&"key-399".to_string())?, Some("x".repeat(40)));
        assert_eq!(map.len()?, 400);
        map.close()
    }

    fn resizable_config() -> MapConfig {
        MapConfig::builder()
            .entries(8)
            .actual_segments(2)
            .resizable(true)
            .build()
    }

    #[test]
    fn abandoned_lock_in_another_map_does_not_block_growth() -> Result<()> {
        let dir = tempdir()?;
        let first = open_dto(&dir.path().join("first.bin"), dto_config())?;
        first.segment_context(0)?.lock()?;
        drop(first);

        let map = open_str(&dir.path().join("second.bin"), resizable_config())?;
        let before = map.layout().segment_size;
        for i in 0..400 {
            map.put(&format!("key-{i}"), &"x".repeat(40))?;
        }
        assert!(map.layout().segment_size > before);
        assert_eq!(map.len()?, 400);
        map.close()
    }

    #[test]
    fn holder_of_a_segment_lock_gets_capacity_exceeded_instead_of_growing() -> Result<()> {
        let dir = tempdir()?;
        let map = open_str(&dir.path().join("map.bin"), resizable_config())?;
        let before = map.layout().segment_size;
        let context = map.segment_context(0)?;
        context.lock()?;

        let mut full = None;
        for i in 0..400 {
            let key = format!("key-{i}");
            if map.segment_for_key(&key)? != 0 {
                continue;
            }
            if let Err(e) = map.put(&key, &"x".repeat(40)) {
                full = Some(e);
                break;
            }
        }
        assert!(matches!(full, Some(SegmapError::CapacityExceeded { segment: 0, .. })));
        assert_eq!(map.layout().segment_size, before);

        context.unlock()?;
        map.put(&"after".to_string(), &"x".repeat(40))?;
        map.close()
    }

    #[test]
    fn layout_is_readable_inside_traversal_while_grow_waits() -> Result<()> {
        let dir = tempdir()?;
        let map = open_str(&dir.path().join("map.bin"), resizable_config())?;
        let mut traversed = None;
        let mut writer_keys = Vec::new();
        for i in 0..4000 {
            let key = format!("key-{i}");
            if map.segment_for_key(&key)? == 0 {
                traversed.get_or_insert(key);
            } else {
                writer_keys.push(key);
            }
        }
        let traversed = traversed.unwrap();
        map.put(&traversed, &"v".to_string())?;
        let before = map.layout().segment_size;

        let map = &map;
        let writer_keys = &writer_keys;
        let (inside, written) = thread::scope(|scope| -> Result<(usize, usize)> {
            let mut writer = None;
            let mut inside = 0;
            map.segment_context(0)?.for_each_segment_entry_while(|_| {
                // fills segment 1 until it grows; grow queues behind this traversal
                writer = Some(scope.spawn(move || -> Result<usize> {
                    for (n, key) in writer_keys.iter().enumerate() {
                        map.put(key, &"x".repeat(40))?;
                        if map.layout().segment_size > before {
                            return Ok(n + 1);
                        }
                    }
                    Ok(writer_keys.len())
                }));
                thread::sleep(Duration::from_millis(200));
                inside = map.layout().segment_size;
                Ok::<_, SegmapError>(false)
            })?;
            let written = writer
                .ok_or_else(|| SegmapError::InvalidInput("no entry traversed".into()))?
                .join()
                .map_err(|_| SegmapError::InvalidInput("writer panicked".into()))??;
            Ok((inside, written))
        })?;

        assert_eq!(inside, before);
        assert!(map.layout().segment_size > before);
        for key in &writer_keys[..written] {
            assert_eq!(map.get(key)?, Some("x".repeat(40)));
        }
        assert_eq!(map.get(&traversed)?, Some("v".to_string()));
        Ok(())
    }

    #[test]
    fn fixed_size_map_reports_capacity_exceeded() -> Result<()> {
        let dir = tempdir()?;
        let config = MapConfig::builder().entries(8).actual_segments(1).build();
        let map = open_str(&dir.path().join("map.bin"), config)?;
        let mut stored = 0;
        let err = loop {
            match map.put(&format!("key-{stored}"), &"y".repeat(64)) {
                Ok(_) => stored += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, SegmapError::CapacityExceeded { segment: 0, .. }));
        assert!(err.is_retryable());
        assert_eq!(map.len()?, stored);
        assert!(map.layout().segment_size <= MAX_SEGMENT_SIZE);
        assert_eq!(map.layout().segment_size % PAGE_SIZE, 0);

        map.clear_segment(0)?;
        assert!(map.is_empty()?);
        assert_eq!(map.segment_stats(0)?.free_bytes, 0);
        map.put(&"again".to_string(), &"y".to_string())?;
        map.close()
    }

    #[test]
    fn second_handle_skips_recovery_and_shares_data() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map.bin");
        let first = open_str(&path, MapConfig::default())?;
        first.put(&"shared".to_string(), &"yes".to_string())?;

        let second = open_str(&path, MapConfig::default())?;
        assert!(second.recovery_report().skipped);
        assert_eq!(second.get(&"shared".to_string())?, Some("yes".to_string()));
        second.put(&"back".to_string(), &"too".to_string())?;
        assert_eq!(first.get(&"back".to_string())?, Some("too".to_string()));

        let resizable = MapConfig::builder().resizable(true).build();
        assert!(matches!(
            open_str(&path, resizable),
            Err(SegmapError::InvalidInput(_))
        ));
        second.close()?;
        first.flush(Durability::Async)?;
        first.close()
    }

    #[derive(Debug, Clone)]
    enum MapOp {
        Put(u16, String),
        Remove(u16),
        Reopen,
    }

    fn map_op() -> impl Strategy<Value = MapOp> {
        prop_oneof![
            4 => (0u16..64, "[a-z]{0,40}").prop_map(|(k, v)| MapOp::Put(k, v)),
            2 => (0u16..64).prop_map(MapOp::Remove),
            1 => Just(MapOp::Reopen),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn map_matches_model_across_reopens(ops in proptest::collection::vec(map_op(), 1..120)) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("map.bin");
            let config = MapConfig::builder().entries(256).actual_segments(4).build();
            let open = || {
                SegmentMap::open_or_create_or_recover(&path, config.clone(), Native::<u16>::default(), Str)
                    .unwrap()
            };
            let mut map = open();
            let mut model: HashMap<u16, String> = HashMap::new();

            for op in ops {
                match op {
                    MapOp::Put(k, v) => {
                        map.put(&k, &v).unwrap();
                        model.insert(k, v);
                    }
                    MapOp::Remove(k) => {
                        prop_assert_eq!(map.remove(&k).unwrap(), model.remove(&k).is_some());
                    }
                    MapOp::Reopen => {
                        map.close().unwrap();
                        map = open();
                    }
                }
            }

            map.verify().unwrap();
            prop_assert_eq!(map.len().unwrap(), model.len());
            for (k, v) in &model {
                let got = map.get(k).unwrap();
                prop_assert_eq!(got.as_ref(), Some(v));
            }
            map.close().unwrap();
        }
    }
}

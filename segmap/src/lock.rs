//! Reentrant, crash-detectable lock stored in a segment header.
//!
//! The lock word packs the owner token with a dirty bit. Acquisition is a
//! single CAS from `0` to `owner | dirty`, so a segment is marked dirty in the
//! same instruction that grants ownership. The outermost unlock stores `0`.
//! A process that dies while holding the lock leaves the word non-zero, which
//! the next exclusive opener treats as "rebuild this segment".

use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_utils::Backoff;
use modular_bitfield::prelude::*;
use rustc_hash::FxBuildHasher;
use tracing::debug;

use crate::error::{Result, SegmapError};
use crate::layout::SegmentHeader;

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWord {
    pub owner: B63,
    pub dirty: bool,
}

impl From<LockWord> for u64 {
    fn from(word: LockWord) -> u64 {
        u64::from_le_bytes(word.into_bytes())
    }
}

impl From<u64> for LockWord {
    fn from(value: u64) -> Self {
        LockWord::from_bytes(value.to_le_bytes())
    }
}

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);
static PROCESS_TAG: OnceLock<u64> = OnceLock::new();

/// 31-bit tag for one process lifetime. Mixing in the start time keeps a
/// recycled pid from reproducing a dead process's owner tokens.
fn process_tag(pid: u32, started: Duration) -> u64 {
    FxBuildHasher.hash_one((pid, started.as_nanos())) & 0x7FFF_FFFF
}

thread_local! {
    static OWNER_TOKEN: u64 = {
        let tag = *PROCESS_TAG.get_or_init(|| {
            let started = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            process_tag(std::process::id(), started)
        });
        let seq = NEXT_THREAD.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF;
        (tag << 32) | seq
    };
}

/// Token identifying the calling thread as a lock owner, unique across
/// the processes attached to one file.
pub fn current_owner() -> u64 {
    OWNER_TOKEN.with(|t| *t)
}

/// View of one segment's lock word and recursion counter
#[derive(Clone, Copy)]
pub struct SegmentLock<'a> {
    segment: usize,
    header: &'a SegmentHeader,
    spin_limit: u32,
}

impl<'a> SegmentLock<'a> {
    pub(crate) fn new(segment: usize, header: &'a SegmentHeader, spin_limit: u32) -> Self {
        Self {
            segment,
            header,
            spin_limit,
        }
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    fn word(&self) -> LockWord {
        LockWord::from(self.header.lock_word.load(Ordering::Acquire))
    }

    pub fn is_locked(&self) -> bool {
        self.header.lock_word.load(Ordering::Acquire) != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.word().dirty()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let raw = self.header.lock_word.load(Ordering::Acquire);
        raw != 0 && LockWord::from(raw).owner() == current_owner()
    }

    /// Reentrant depth, meaningful only to the holder
    pub fn hold_count(&self) -> u64 {
        if self.is_held_by_current_thread() {
            self.header.recursion.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    fn try_acquire(&self) -> bool {
        let me = current_owner();
        let raw = self.header.lock_word.load(Ordering::Acquire);
        if raw != 0 {
            if LockWord::from(raw).owner() != me {
                return false;
            }
            self.header.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let held = LockWord::new().with_owner(me).with_dirty(true);
        if self
            .header
            .lock_word
            .compare_exchange(0, held.into(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.header.recursion.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn wait(&self, backoff: &Backoff, rounds: &mut u32) {
        if *rounds < self.spin_limit {
            *rounds += 1;
            backoff.snooze();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        let mut rounds = 0;
        while !self.try_acquire() {
            self.wait(&backoff, &mut rounds);
        }
    }

    /// Tries to acquire the lock, giving up after `timeout`.
    /// A zero timeout makes exactly one attempt.
    pub fn try_lock(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut rounds = 0;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                debug!(segment = self.segment, ?waited, "segment lock timed out");
                return Err(SegmapError::LockTimeout {
                    segment: self.segment,
                    waited,
                });
            }
            self.wait(&backoff, &mut rounds);
        }
    }

    /// Releases one level of ownership. The lock word is cleared, together
    /// with the dirty bit, only when the outermost level is released.
    pub fn unlock(&self) -> Result<()> {
        if !self.is_held_by_current_thread() {
            return Err(SegmapError::NotLockOwner {
                segment: self.segment,
            });
        }
        let depth = self.header.recursion.load(Ordering::Relaxed);
        if depth > 1 {
            self.header.recursion.store(depth - 1, Ordering::Relaxed);
        } else {
            self.header.recursion.store(0, Ordering::Relaxed);
            self.header.lock_word.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Drops every level the calling thread holds. Returns whether anything
    /// was released.
    pub(crate) fn release_all_held(&self) -> bool {
        if !self.is_held_by_current_thread() {
            return false;
        }
        self.header.recursion.store(0, Ordering::Relaxed);
        self.header.lock_word.store(0, Ordering::Release);
        true
    }

    /// Clears whatever a dead holder left behind. Only for recovery, while
    /// no other attacher can be using the segment.
    pub(crate) fn reset(&self) {
        self.header.recursion.store(0, Ordering::Relaxed);
        self.header.lock_word.store(0, Ordering::Release);
    }

    pub fn guard(self) -> SegmentGuard<'a> {
        self.lock();
        SegmentGuard::new(self)
    }

    pub fn try_guard(self, timeout: Duration) -> Result<SegmentGuard<'a>> {
        self.try_lock(timeout)?;
        Ok(SegmentGuard::new(self))
    }
}

/// Scoped ownership of a segment lock. Dropping the guard releases exactly
/// one level, on every exit path including unwinding.
pub struct SegmentGuard<'a> {
    lock: SegmentLock<'a>,
    // ownership belongs to the acquiring thread
    _not_send: PhantomData<*const ()>,
}

impl<'a> SegmentGuard<'a> {
    fn new(lock: SegmentLock<'a>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    pub fn segment(&self) -> usize {
        self.lock.segment
    }

    pub fn lock(&self) -> &SegmentLock<'a> {
        &self.lock
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        let released = self.lock.unlock();
        debug_assert!(released.is_ok(), "guard dropped by a non-owner");
    }
}

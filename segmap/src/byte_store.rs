use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use fs2::FileExt;
use memmap2::MmapMut;
use tracing::{debug, info};

/// How hard `flush` pushes dirty pages toward the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Leave write-back to the OS
    None,
    /// Schedule write-back and return immediately
    Async,
    /// Block until the pages reach stable storage
    #[default]
    Sync,
}

/// A file mapped read-write into the address space.
///
/// Callers never see the base address; everything stored in the file is
/// addressed by byte offset so a remap at a different base stays valid.
pub struct MMapFile {
    mmap: MmapMut,
    base: NonNull<u8>,
    file: File,
    path: PathBuf,
}

// SAFETY: `base` points into `mmap`, which is owned by this struct and only
// replaced through `&mut self`. Concurrent access to the bytes it covers is
// coordinated by the segment locks and the map-wide RwLock.
unsafe impl Send for MMapFile {}
unsafe impl Sync for MMapFile {}

impl MMapFile {
    /// Creates (or truncates) `path` to `len` zeroed bytes and maps it.
    pub fn new(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        info!(path = %path.display(), len, "created backing file");
        Self::map(file, path)
    }

    /// Maps an existing file at its current length.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map(file, path)
    }

    fn map(file: File, path: &Path) -> io::Result<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping; other
        // processes attached to it follow the same segment locking protocol.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty mapping"))?;
        Ok(Self {
            mmap,
            base,
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw pointer to byte 0 of the mapping, valid until the next `grow`.
    pub(crate) fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Extends the file to `new_len` bytes and remaps it. Existing bytes keep
    /// their offsets; the tail is zero-filled by the filesystem.
    pub fn grow(&mut self, new_len: usize) -> io::Result<()> {
        let current = self.mmap.len();
        if new_len <= current {
            return Ok(());
        }
        self.mmap.flush()?;
        self.file.set_len(new_len as u64)?;
        // SAFETY: see `map`; the old mapping is dropped on assignment.
        let mut mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty mapping"))?;
        self.mmap = mmap;
        info!(path = %self.path.display(), from = current, to = new_len, "grew backing file");
        Ok(())
    }

    pub fn flush(&self, durability: Durability) -> io::Result<()> {
        match durability {
            Durability::None => Ok(()),
            Durability::Async => self.mmap.flush_async(),
            Durability::Sync => {
                self.mmap.flush()?;
                self.file.sync_all()
            }
        }
    }

    /// Tries to become the only process attached to the file.
    pub(crate) fn try_lock_exclusive(&self) -> bool {
        FileExt::try_lock_exclusive(&self.file).is_ok()
    }

    /// Registers this handle as one of possibly many attachers.
    pub(crate) fn lock_shared(&self) -> io::Result<()> {
        FileExt::lock_shared(&self.file)?;
        debug!(path = %self.path.display(), "attached with shared file lock");
        Ok(())
    }

    pub(crate) fn unlock_file(&self) -> io::Result<()> {
        FileExt::unlock(&self.file)
    }
}

impl AsRef<[u8]> for MMapFile {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

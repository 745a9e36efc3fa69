//! The memory-mapped region backing one store file.
//!
//! The region owns the file handle and the current raw byte view. Growth
//! truncates the file to the next size step and remaps; flushes are page
//! aligned and may cover sub-ranges. Callers coordinate access externally:
//! readers and writers share the view, a resize or compaction excludes
//! everyone (the store wraps the region in a reader/writer lock).

use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::MmapRaw;

use crate::{
    codec,
    error::corruption,
    repr::{
        Metadata, LEAF_HEADER_LEN, META_LEN, META_NEXT_FREE_AT, META_ROOT_AT, META_VERSION_AT,
        NODE_HEADER_LEN,
    },
    Error,
};

/// Size of a freshly created file.
pub(crate) const INITIAL_REGION_LEN: u64 = 64 * 1024 * 1024;
/// Doubling stops here; later growth adds this much per step.
pub(crate) const MAX_GROWTH_STEP: u64 = 1024 * 1024 * 1024;

fn os_page_size() -> u64 {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static PAGE: OnceLock<u64> = OnceLock::new();
        *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(1) as u64 })
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// The next file length after growing a region of length `len`.
pub(crate) fn next_region_len(len: u64) -> u64 {
    if len == 0 {
        INITIAL_REGION_LEN
    } else if len >= MAX_GROWTH_STEP {
        len + MAX_GROWTH_STEP
    } else {
        len * 2
    }
}

pub(crate) struct MappedRegion {
    file: File,
    path: PathBuf,
    map: MmapRaw,
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}

impl MappedRegion {
    /// Opens (or creates) the store file at `path` and maps it. A fresh file
    /// is sized to [`INITIAL_REGION_LEN`] before mapping. Returns the region
    /// and whether the file was newly created.
    pub fn open(path: &Path) -> Result<(Self, bool), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let created = file.metadata()?.len() == 0;
        if created {
            file.set_len(INITIAL_REGION_LEN)?;
        }
        let map = MmapRaw::map_raw(&file)?;
        if map.len() < META_LEN {
            return Err(corruption!(
                "existing file {path:?} is shorter than the metadata header"
            ));
        }
        Ok((
            MappedRegion {
                file,
                path: path.to_path_buf(),
                map,
            },
            created,
        ))
    }

    /// Creates a fresh region at `path`, discarding any previous contents.
    /// Used for the compaction temp file.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(INITIAL_REGION_LEN)?;
        let map = MmapRaw::map_raw(&file)?;
        Ok(MappedRegion {
            file,
            path: path.to_path_buf(),
            map,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the current view in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Current length of the backing file.
    pub fn file_len(&self) -> Result<u64, Error> {
        Ok(self.file.metadata()?.len())
    }

    /// Grows the file one size step. The caller must hold the region
    /// exclusively.
    pub fn grow(&mut self) -> Result<u64, Error> {
        self.grow_to(self.len() + 1)
    }

    /// Grows the file through as many size steps as needed to reach at least
    /// `min` bytes, then remaps. No-op if the region is already large enough.
    pub fn grow_to(&mut self, min: u64) -> Result<u64, Error> {
        let mut target = self.len();
        if target >= min {
            return Ok(target);
        }
        while target < min {
            target = next_region_len(target);
        }
        self.map.flush()?;
        self.file.set_len(target)?;
        self.map = MmapRaw::map_raw(&self.file)?;
        debug_assert_eq!(self.len(), target);
        Ok(target)
    }

    /// Flushes `[start, end)` to the file, with `start` rounded down to the
    /// OS page. Safe to call with an empty range.
    pub fn flush_range(&self, start: u64, end: u64) -> Result<(), Error> {
        let end = end.min(self.len());
        let start = start & !(os_page_size() - 1);
        if start >= end {
            return Ok(());
        }
        self.map.flush_range(start as usize, (end - start) as usize)?;
        Ok(())
    }

    /// Flushes the whole view to the file.
    pub fn flush_all(&self) -> Result<(), Error> {
        self.map.flush()?;
        Ok(())
    }

    /// The full byte view of the region.
    ///
    /// Safety of the shared slice: the only concurrent mutation is the
    /// publisher appending at `[E, E')`, a range no reader dereferences
    /// before the root offset pointing into it is published (which happens
    /// after the copy completes). Resizes and compaction replace the map
    /// only while holding the region exclusively.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), self.map.len()) }
    }

    /// Copies `data` into the view at `offset`. Only the publisher and the
    /// initializer write here, always above the published next-free offset.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| corruption!("write range overflows at offset {offset}"))?;
        if end > self.len() {
            return Err(corruption!(
                "write of {} bytes at {offset} past mapped length {}",
                data.len(),
                self.len()
            ));
        }
        // Safety: in bounds per the check above; see `bytes` for the aliasing
        // discipline.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_mut_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn meta_word(&self, at: usize) -> &AtomicU64 {
        debug_assert!(at + 8 <= META_LEN && at % 8 == 0);
        // Safety: the map is at least META_LEN bytes (it is never below the
        // initial region size), page aligned, and lives as long as `self`.
        unsafe { AtomicU64::from_ptr(self.map.as_mut_ptr().add(at) as *mut u64) }
    }

    /// The version word of the metadata header.
    #[inline]
    pub fn version_word(&self) -> &AtomicU64 {
        self.meta_word(META_VERSION_AT)
    }

    /// The root offset word of the metadata header.
    #[inline]
    pub fn root_word(&self) -> &AtomicU64 {
        self.meta_word(META_ROOT_AT)
    }

    /// The next-free (append tail) word of the metadata header.
    #[inline]
    pub fn next_free_word(&self) -> &AtomicU64 {
        self.meta_word(META_NEXT_FREE_AT)
    }

    /// Loads a consistent snapshot of the metadata trio: the three words are
    /// re-read until the version did not move in between.
    pub fn load_metadata(&self) -> Metadata {
        loop {
            let version = self.version_word().load(Ordering::Acquire);
            let root_offset = self.root_word().load(Ordering::Acquire);
            let next_free = self.next_free_word().load(Ordering::Acquire);
            if self.version_word().load(Ordering::Acquire) == version {
                return Metadata {
                    version,
                    root_offset,
                    next_free,
                };
            }
        }
    }

    /// Stores all three metadata words. Only used at file initialization and
    /// by the compactor, both of which hold the region exclusively.
    pub fn store_metadata(&self, meta: Metadata) {
        self.version_word().store(meta.version, Ordering::Release);
        self.root_word().store(meta.root_offset, Ordering::Release);
        self.next_free_word()
            .store(meta.next_free, Ordering::Release);
    }

    /// Validates the metadata of an existing file against the basic layout
    /// invariants before the store starts trusting it.
    pub fn validate_metadata(&self) -> Result<Metadata, Error> {
        let meta = codec::read_metadata(&self.bytes()[..META_LEN])?;
        let min_root_end = (META_LEN + NODE_HEADER_LEN + LEAF_HEADER_LEN) as u64;
        if meta.root_offset < META_LEN as u64
            || meta.next_free < meta.root_offset.saturating_add(min_root_end - META_LEN as u64)
            || meta.next_free > self.len()
        {
            return Err(corruption!(
                "inconsistent metadata header: {meta:?} (mapped length {})",
                self.len()
            ));
        }
        Ok(meta)
    }

    /// Swaps the compacted `temp_path` file in as the live file, using
    /// `swap_path` as the intermediate name, then reopens and remaps. The
    /// caller must hold the region exclusively and have synced the temp file.
    pub fn swap_in(&mut self, temp_path: &Path, swap_path: &Path) -> Result<(), Error> {
        self.map.flush()?;
        std::fs::rename(&self.path, swap_path)?;
        if let Err(err) = std::fs::rename(temp_path, &self.path) {
            // put the live file back before surfacing the error
            let _ = std::fs::rename(swap_path, &self.path);
            return Err(err.into());
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let map = MmapRaw::map_raw(&file)?;
        self.file = file;
        self.map = map;
        std::fs::remove_file(swap_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> (tempfile::TempDir, MappedRegion) {
        let dir = tempfile::tempdir().unwrap();
        let (region, created) = MappedRegion::open(&dir.path().join("data")).unwrap();
        assert!(created);
        (dir, region)
    }

    #[test]
    fn growth_policy() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(next_region_len(0), 64 * MIB);
        assert_eq!(next_region_len(64 * MIB), 128 * MIB);
        assert_eq!(next_region_len(512 * MIB), 1024 * MIB);
        assert_eq!(next_region_len(1024 * MIB), 2048 * MIB);
        assert_eq!(next_region_len(2048 * MIB), 3072 * MIB);
    }

    #[test]
    fn write_read_and_metadata() {
        let (_dir, region) = region();
        assert_eq!(region.len(), INITIAL_REGION_LEN);
        region.write_at(100, b"abcdef").unwrap();
        assert_eq!(&region.bytes()[100..106], b"abcdef");
        assert!(region.write_at(region.len() - 3, b"abcdef").is_err());

        let meta = Metadata {
            version: 9,
            root_offset: 24,
            next_free: 400,
        };
        region.store_metadata(meta);
        assert_eq!(region.load_metadata(), meta);
        region.flush_range(0, META_LEN as u64).unwrap();
        region.flush_range(0, 0).unwrap();
    }

    #[test]
    fn grow_remaps_and_keeps_contents() {
        let (_dir, mut region) = region();
        region.write_at(24, b"sticky").unwrap();
        let grown = region.grow().unwrap();
        assert_eq!(grown, 2 * INITIAL_REGION_LEN);
        assert_eq!(region.file_len().unwrap(), grown);
        assert_eq!(&region.bytes()[24..30], b"sticky");
        // already large enough, not grown further
        assert_eq!(region.grow_to(1024).unwrap(), grown);
    }

    #[test]
    fn validate_rejects_bad_headers() {
        let (_dir, region) = region();
        region.store_metadata(Metadata {
            version: 0,
            root_offset: 8,
            next_free: 200,
        });
        assert!(region.validate_metadata().is_err());
        region.store_metadata(Metadata {
            version: 0,
            root_offset: 24,
            next_free: region.len() + 1,
        });
        assert!(region.validate_metadata().is_err());
        region.store_metadata(Metadata {
            version: 0,
            root_offset: 24,
            next_free: 114,
        });
        assert!(region.validate_metadata().is_ok());
    }
}

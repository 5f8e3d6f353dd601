//! Memory-mapped file region shared between one writer and many
//! readers.
//!
//! The region is reserved at the geometry's `size_upper` once at open,
//! so physical file growth (truncate) never moves it. The writer only
//! touches bytes at or past the published `size`; readers only read
//! bytes below it. That discipline is what makes the raw-pointer
//! accessors here sound.

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::AofError;

enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A fixed-address mapping over an append-only file.
pub struct Mapping {
    map: Map,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain memory. Mutation goes through the
// writer's mutex; readers only dereference bytes below the
// release-published size, which the writer never touches again.
unsafe impl Send for Mapping {}
// SAFETY: see above.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps `len` bytes of `file` read-write. The file may be shorter
    /// than `len`; it must be truncated up before bytes past its
    /// physical end are touched.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the mmap syscall fails.
    pub fn open_rw(file: &File, len: u64) -> Result<Self, AofError> {
        let len = usize::try_from(len).map_err(|_| {
            AofError::InvalidGeometry(format!("mapping of {len} bytes exceeds address space"))
        })?;
        // SAFETY: the file stays open for the lifetime of the mapping
        // and is only resized upward while mapped.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            map: Map::ReadWrite(map),
            ptr,
            len,
        })
    }

    /// Maps `len` bytes of `file` read-only, for finished files.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the mmap syscall fails.
    pub fn open_ro(file: &File, len: u64) -> Result<Self, AofError> {
        let len = usize::try_from(len).map_err(|_| {
            AofError::InvalidGeometry(format!("mapping of {len} bytes exceeds address space"))
        })?;
        // SAFETY: the file stays open for the lifetime of the mapping
        // and is never resized while mapped read-only.
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        let ptr = map.as_ptr().cast_mut();
        Ok(Self {
            map: Map::ReadOnly(map),
            ptr,
            len,
        })
    }

    /// Total mapped length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the mapping was opened read-write.
    #[must_use]
    pub fn writable(&self) -> bool {
        matches!(self.map, Map::ReadWrite(_))
    }

    /// Immutable view of `[begin, end)`.
    ///
    /// Callers must only read bytes below the published size (those are
    /// immutable until the file is destructed).
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or inverted.
    #[must_use]
    pub fn slice(&self, begin: usize, end: usize) -> &[u8] {
        assert!(begin <= end && end <= self.len, "range out of bounds");
        // SAFETY: in bounds; the region below the published size is
        // never written again.
        unsafe { std::slice::from_raw_parts(self.ptr.add(begin), end - begin) }
    }

    /// Copies `bytes` into the mapping at `offset`. Writer only, under
    /// the write mutex.
    ///
    /// # Panics
    ///
    /// Panics on a read-only mapping or an out-of-bounds range.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(self.writable(), "write on read-only mapping");
        assert!(offset + bytes.len() <= self.len, "write out of bounds");
        // SAFETY: in bounds, writable, and the write mutex excludes
        // concurrent writers; readers never touch bytes at or past the
        // published size.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    /// Mutable view of `[begin, end)` for zero-copy appends. Writer
    /// only, under the write mutex; the range must lie at or past the
    /// published size.
    ///
    /// # Panics
    ///
    /// Panics on a read-only mapping or an out-of-bounds range.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, begin: usize, end: usize) -> &mut [u8] {
        assert!(self.writable(), "write on read-only mapping");
        assert!(begin <= end && end <= self.len, "range out of bounds");
        // SAFETY: in bounds, writable; the write mutex makes this the
        // only mutable view, and readers stay below the published size.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(begin), end - begin) }
    }

    /// Stores a little-endian word at `offset`. Writer only, under the
    /// write mutex.
    pub fn store_u64_le(&self, offset: usize, value: u64) {
        self.write_at(offset, &value.to_le_bytes());
    }

    /// Loads a little-endian word from `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word extends past the mapping.
    #[must_use]
    pub fn load_u64_le(&self, offset: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.slice(offset, offset + 8));
        u64::from_le_bytes(word)
    }

    /// Asynchronously flushes `[0, len)` to the underlying file.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the msync syscall fails.
    pub fn flush_range(&self, len: usize) -> Result<(), AofError> {
        match &self.map {
            Map::ReadWrite(map) => map.flush_async_range(0, len.min(self.len))?,
            Map::ReadOnly(_) => {}
        }
        Ok(())
    }

    /// Synchronously flushes `[0, len)` to the underlying file.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the msync syscall fails.
    pub fn sync_range(&self, len: usize) -> Result<(), AofError> {
        match &self.map {
            Map::ReadWrite(map) => map.flush_range(0, len.min(self.len))?,
            Map::ReadOnly(_) => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("len", &self.len)
            .field("writable", &self.writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(len: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        file
    }

    #[test]
    fn write_then_read_round_trips() {
        let file = temp_file(4096);
        let map = Mapping::open_rw(&file, 4096).unwrap();
        map.write_at(100, b"hello");
        assert_eq!(map.slice(100, 105), b"hello");
    }

    #[test]
    fn word_store_is_little_endian() {
        let file = temp_file(4096);
        let map = Mapping::open_rw(&file, 4096).unwrap();
        map.store_u64_le(8, 0x0102_0304_0506_0708);
        assert_eq!(map.slice(8, 16), &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(map.load_u64_le(8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn mapping_can_exceed_file_length() {
        // Reserve a large region over a one-page file; only the
        // backed prefix is touched.
        let file = temp_file(4096);
        let map = Mapping::open_rw(&file, 1024 * 1024).unwrap();
        assert_eq!(map.len(), 1024 * 1024);
        map.write_at(0, &[1, 2, 3]);
        file.set_len(8192).unwrap();
        map.write_at(5000, &[4, 5, 6]);
        assert_eq!(map.slice(5000, 5003), &[4, 5, 6]);
    }

    #[test]
    fn read_only_mapping_reports_not_writable() {
        let file = temp_file(4096);
        {
            let map = Mapping::open_rw(&file, 4096).unwrap();
            map.write_at(0, b"abc");
            map.sync_range(4096).unwrap();
        }
        let map = Mapping::open_ro(&file, 4096).unwrap();
        assert!(!map.writable());
        assert_eq!(map.slice(0, 3), b"abc");
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libscm contributors
//
// Storage-Class Memory: a single-file persistent heap, mmapped at a fixed
// virtual address so that pointers stored inside it remain valid across
// process restarts. Exposes a malloc/free/strdup-style allocator over the
// mapped region, plus a designated base pointer (the "anchor") at which the
// caller's root structure lives.
//
// Ported from the original `scm.c` (see `examples/original_source/scm.c`),
// with header mutation moved from fd-based `lseek`+`write` calls onto direct
// pointer writes through the mapping itself — the mapping is `MAP_SHARED`
// over the same file, so the two approaches are observably identical, and
// going through the mapping is the same style `platform/posix.rs` in the
// donor crate uses for its own shared-memory header (`ChunkInfo`, the shm
// ref-counter).

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::error::Error;
use crate::Result;

/// `allocated: u8` + `block_size: i64`.
const HEADER_SIZE: usize = 9;

#[inline]
unsafe fn read_header(mem: *const u8, offset: usize) -> (u8, i64) {
    let allocated = *mem.add(offset);
    let block_size = (mem.add(offset + 1) as *const i64).read_unaligned();
    (allocated, block_size)
}

#[inline]
unsafe fn write_header(mem: *mut u8, offset: usize, allocated: u8, block_size: i64) {
    *mem.add(offset) = allocated;
    (mem.add(offset + 1) as *mut i64).write_unaligned(block_size);
}

#[inline]
unsafe fn set_allocated_flag(mem: *mut u8, offset: usize, allocated: u8) {
    *mem.add(offset) = allocated;
}

/// A storage-class-memory region: a regular file mmapped at the fixed
/// virtual address [`crate::VIRTUAL_ADDRESS`], with a linear first-fit
/// allocator over the mapped bytes.
///
/// Deliberately not `Send`/`Sync`: only the thread that opened the handle
/// may call operations against it (single-writer, single-threaded, as the
/// source design requires).
pub struct Scm {
    mem: *mut u8,
    capacity: usize,
    utilized: bool,
}

impl Scm {
    /// Opens (or creates-and-truncates) an SCM region backed by `path`.
    ///
    /// `truncate` zeroes the existing file contents (preserving file length)
    /// before mapping; pass `false` to reattach to a region from a prior run.
    #[cfg(unix)]
    pub fn open(path: impl AsRef<Path>, truncate: bool) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        // Reject if the program break has already grown past the address we
        // need to map at — a later mmap(MAP_FIXED) there would either fail
        // or silently clobber live heap memory.
        let brk = unsafe { libc::sbrk(0) };
        if brk as usize >= crate::VIRTUAL_ADDRESS {
            return Err(Error::AddressUnavailable);
        }

        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(Error::NotRegularFile);
        }
        let capacity = metadata.len() as usize;
        let fd = file.as_raw_fd();

        let mem = unsafe {
            libc::mmap(
                crate::VIRTUAL_ADDRESS as *mut libc::c_void,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io_last_error());
        }
        let mem = mem as *mut u8;

        // `file` (and its fd) can be closed now: the mapping stays valid
        // independently of the fd that created it, same as
        // `PlatformShm::mmap_and_finish` does for named shm segments.
        drop(file);

        if truncate {
            unsafe { ptr::write_bytes(mem, 0, capacity) };
            log::debug!("scm: truncated region ({capacity} bytes zeroed)");
        }

        let utilized = unsafe { *mem } != 0;

        log::trace!("scm: opened region, capacity={capacity}, utilized={utilized}");

        Ok(Self {
            mem,
            capacity,
            utilized,
        })
    }

    #[cfg(not(unix))]
    pub fn open(_path: impl AsRef<Path>, _truncate: bool) -> Result<Self> {
        Err(Error::UnsupportedPlatform)
    }

    /// Finds a block suitable for `n` payload bytes (linear first-fit scan)
    /// and marks it allocated, returning a pointer to its payload.
    pub fn allocate(&self, n: usize) -> Result<NonNull<u8>> {
        let mut offset = 0usize;
        loop {
            if offset + HEADER_SIZE > self.capacity {
                return Err(Error::RegionExhausted);
            }
            let (allocated, block_size) = unsafe { read_header(self.mem, offset) };
            if allocated == 0 {
                if block_size == 0 {
                    // Unused tail: grow the block list here.
                    if offset + HEADER_SIZE + n > self.capacity {
                        return Err(Error::RegionExhausted);
                    }
                    unsafe { write_header(self.mem, offset, 1, n as i64) };
                    let payload = offset + HEADER_SIZE;
                    log::trace!("scm: allocate {n} bytes at new block offset {offset}");
                    return Ok(unsafe { NonNull::new_unchecked(self.mem.add(payload)) });
                }
                if block_size >= n as i64 {
                    // Reuse a freed slot; its block_size is left untouched —
                    // the allocator never coalesces or compacts.
                    unsafe { set_allocated_flag(self.mem, offset, 1) };
                    let payload = offset + HEADER_SIZE;
                    log::trace!("scm: reuse {block_size}-byte block at offset {offset} for {n} bytes");
                    return Ok(unsafe { NonNull::new_unchecked(self.mem.add(payload)) });
                }
            }
            offset += HEADER_SIZE + block_size as usize;
        }
    }

    /// Marks the block whose payload starts at `p` as free.
    ///
    /// # Safety
    /// `p` must be a pointer previously returned by [`Scm::allocate`] or
    /// [`Scm::duplicate_string`] on this same handle, and must not have
    /// already been freed.
    pub unsafe fn free(&self, p: NonNull<u8>) {
        let offset = (p.as_ptr() as usize) - (self.mem as usize) - HEADER_SIZE;
        set_allocated_flag(self.mem, offset, 0);
        log::trace!("scm: free block at offset {offset}");
    }

    /// Allocates `len(s)+1` bytes and copies `s` plus a NUL terminator.
    pub fn duplicate_string(&self, s: &str) -> Result<NonNull<u8>> {
        if let Some(pos) = s.bytes().position(|b| b == 0) {
            return Err(Error::InvalidKey(pos));
        }
        let bytes = s.as_bytes();
        let ptr = self.allocate(bytes.len() + 1)?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            *ptr.as_ptr().add(bytes.len()) = 0;
        }
        Ok(ptr)
    }

    /// The payload address of the very first block — the persistent root
    /// anchor, stable across `open` calls as long as the backing file isn't
    /// truncated.
    pub fn base(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.mem.add(HEADER_SIZE)) }
    }

    /// Whether the region had already been initialized (its first block
    /// allocated) when this handle was opened. This is a flag, not a byte
    /// count: the original C `scm_utilized` returns the raw `allocated` byte
    /// of the first block, used only to decide whether to reinitialize the
    /// anchor on open.
    pub fn utilized(&self) -> bool {
        self.utilized
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn flush(&self) -> Result<()> {
        if self.mem.is_null() {
            return Ok(());
        }
        let ret = unsafe {
            libc::msync(
                self.mem as *mut libc::c_void,
                self.capacity,
                libc::MS_SYNC,
            )
        };
        if ret != 0 {
            return Err(io_last_error());
        }
        Ok(())
    }

    /// Flushes the mapping to disk, unmaps, and drops the handle.
    ///
    /// Equivalent to letting the handle drop, except flush errors are
    /// surfaced to the caller instead of only being logged.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.unmap();
        result
    }

    fn unmap(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.capacity) };
        self.mem = ptr::null_mut();
    }
}

impl Drop for Scm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        if let Err(e) = self.flush() {
            log::error!("scm: flush on drop failed: {e}");
        }
        self.unmap();
    }
}

#[cfg(unix)]
fn io_last_error() -> Error {
    Error::Io(std::io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized_tempfile(len: u64) -> tempfile::TempPath {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(len).expect("set_len");
        file.into_temp_path()
    }

    #[test]
    fn allocate_then_free_then_allocate_reuses_pointer() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(4096);
        let scm = Scm::open(&path, true).expect("open");
        let p1 = scm.allocate(32).expect("alloc1");
        unsafe { scm.free(p1) };
        let p2 = scm.allocate(32).expect("alloc2");
        assert_eq!(p1.as_ptr(), p2.as_ptr());
    }

    #[test]
    fn base_equals_first_allocation_after_fresh_truncate() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(4096);
        let scm = Scm::open(&path, true).expect("open");
        let base = scm.base();
        let p = scm.allocate(16).expect("alloc");
        assert_eq!(base.as_ptr(), p.as_ptr());
    }

    #[test]
    fn reuse_keeps_original_block_size_on_fragmentation() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(4096);
        let scm = Scm::open(&path, true).expect("open");
        let p1 = scm.allocate(64).expect("alloc 64");
        unsafe { scm.free(p1) };
        // A smaller request reuses the 64-byte slot rather than growing the
        // tail; the allocator never shrinks `block_size` on reuse.
        let p2 = scm.allocate(8).expect("alloc 8");
        assert_eq!(p1.as_ptr(), p2.as_ptr());
    }

    #[test]
    fn duplicate_string_round_trips() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(4096);
        let scm = Scm::open(&path, true).expect("open");
        let p = scm.duplicate_string("hello").expect("strdup");
        let s = unsafe { std::ffi::CStr::from_ptr(p.as_ptr() as *const i8) };
        assert_eq!(s.to_str().unwrap(), "hello");
    }

    #[test]
    fn exhaustion_returns_error_without_panicking() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(64);
        let scm = Scm::open(&path, true).expect("open");
        assert!(scm.allocate(1024).is_err());
    }

    #[test]
    fn utilized_false_on_fresh_truncate_true_on_reattach() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        let path = sized_tempfile(4096);
        {
            let scm = Scm::open(&path, true).expect("open");
            assert!(!scm.utilized());
            scm.allocate(8).expect("alloc");
            scm.close().expect("close");
        }
        {
            let scm = Scm::open(&path, false).expect("reopen");
            assert!(scm.utilized());
        }
    }

    #[test]
    fn not_a_regular_file_is_rejected() {
        let _guard = crate::__fixed_address_test_lock().lock().unwrap();
        // Opening a directory for read/write fails before mmap is attempted.
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Scm::open(dir.path(), false);
        assert!(result.is_err());
    }
}

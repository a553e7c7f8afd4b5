//! Anonymous memory mappings.
//!
//! [`MemMap`] owns one `mmap`'d range for its whole lifetime and unmaps it on
//! drop. Protection changes and page release go through the free functions so
//! that spaces can operate on sub-ranges of a mapping they own.

#![allow(unsafe_code)]

use std::io;

/// Page granularity assumed by every space.
pub const PAGE_SIZE: usize = 4096;

/// Round `n` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Like [`round_up`], but `None` on overflow.
#[inline]
#[must_use]
pub fn checked_round_up(n: usize, align: usize) -> Option<usize> {
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[inline]
#[must_use]
pub const fn is_aligned(n: usize, align: usize) -> bool {
    n & (align - 1) == 0
}

/// Page protection applied through `mprotect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    const fn bits(self) -> libc::c_int {
        match self {
            Self::None => libc::PROT_NONE,
            Self::Read => libc::PROT_READ,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Runtime page size as reported by the kernel.
#[must_use]
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 { PAGE_SIZE } else { raw as usize }
}

/// An owned anonymous private mapping.
///
/// Addresses are stored as integers; the mapping is only ever touched through
/// explicit raw accessors in the owning space.
#[derive(Debug)]
pub struct MemMap {
    name: String,
    begin: usize,
    size: usize,
}

impl MemMap {
    /// Map `size` bytes (rounded up to [`PAGE_SIZE`]) of zeroed, private memory.
    pub fn map_anonymous(name: &str, size: usize, prot: Protection) -> io::Result<Self> {
        if PAGE_SIZE % os_page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("kernel page size {} does not divide {PAGE_SIZE}", os_page_size()),
            ));
        }
        let size = checked_round_up(size.max(1), PAGE_SIZE)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        // SAFETY: anonymous mapping at a kernel-chosen address; no existing
        // memory is affected.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot.bits(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            name: name.to_string(),
            begin: ptr as usize,
            size,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.begin + self.size
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end()
    }

    fn check_range(&self, addr: usize, len: usize) -> io::Result<()> {
        if addr < self.begin || addr.saturating_add(len) > self.end() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {addr:#x}+{len:#x} outside mapping {} [{:#x}, {:#x})",
                    self.name,
                    self.begin,
                    self.end()
                ),
            ));
        }
        Ok(())
    }

    /// Change protection of `[addr, addr + len)`, which must lie in this mapping.
    pub fn protect(&self, addr: usize, len: usize, prot: Protection) -> io::Result<()> {
        self.check_range(addr, len)?;
        protect_range(addr, len, prot)
    }

    /// Hand `[addr, addr + len)` back to the kernel. The pages read as zero afterwards.
    pub fn release_pages(&self, addr: usize, len: usize) -> io::Result<()> {
        self.check_range(addr, len)?;
        release_range(addr, len)
    }

    /// Zero `[addr, addr + len)` with a plain memset.
    pub fn zero(&self, addr: usize, len: usize) -> io::Result<()> {
        self.check_range(addr, len)?;
        // SAFETY: range checked against this live, writable mapping above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
        Ok(())
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        // SAFETY: `begin`/`size` describe a mapping created by `map_anonymous`
        // and owned exclusively by `self`.
        let rc = unsafe { libc::munmap(self.begin as *mut libc::c_void, self.size) };
        debug_assert_eq!(rc, 0, "munmap of {} failed", self.name);
    }
}

pub(crate) fn protect_range(addr: usize, len: usize, prot: Protection) -> io::Result<()> {
    // SAFETY: callers pass page-aligned ranges inside a mapping they own.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

pub(crate) fn release_range(addr: usize, len: usize) -> io::Result<()> {
    // SAFETY: MADV_DONTNEED on a private anonymous range owned by the caller
    // only discards its contents.
    let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

use std::io;

use crate::code::cache::invalidate_icache;
use crate::code::page_size;

/// A private anonymous mapping that starts out RW and can be flipped to RX.
///
/// Used for generated code fixtures and scratch targets; unmapped on drop.
#[derive(Debug)]
pub struct CodePage {
    base: *mut u8,
    len: usize,
    executable: bool,
}

// The mapping is exclusively owned; mutation requires `&mut self`.
unsafe impl Send for CodePage {}
unsafe impl Sync for CodePage {}

impl CodePage {
    /// Maps at least `len` bytes, rounded up to whole pages.
    pub fn new(len: usize) -> io::Result<Self> {
        let page = page_size();
        let len = len.max(1).div_ceil(page) * page;

        #[cfg(unix)]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { base: ptr as *mut u8, len, executable: false })
        }

        #[cfg(not(unix))]
        {
            let _ = len;
            Err(io::Error::new(io::ErrorKind::Unsupported, "code pages need a unix host"))
        }
    }

    pub fn address(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copies `bytes` in at `offset`. Only valid before [`make_executable`](Self::make_executable).
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        if self.executable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "code page is already RX"));
        }
        if offset.checked_add(bytes.len()).map_or(true, |end| end > self.len) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "write past end of code page"));
        }
        // SAFETY: bounds checked above and the mapping is RW.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Mutable view of the page while it is still writable.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.executable {
            return None;
        }
        // SAFETY: RW mapping of `len` bytes owned by `self`.
        Some(unsafe { core::slice::from_raw_parts_mut(self.base, self.len) })
    }

    pub fn make_executable(&mut self) -> io::Result<()> {
        if self.executable {
            return Ok(());
        }
        #[cfg(unix)]
        unsafe {
            if libc::mprotect(
                self.base as *mut libc::c_void,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            invalidate_icache(self.base, self.len);
        }
        self.executable = true;
        Ok(())
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

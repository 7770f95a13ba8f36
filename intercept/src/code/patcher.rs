use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::code::cache::invalidate_icache;
use crate::code::page_size;
use crate::error::PatchError;

const PAGE_STRIPES: usize = 64;

/// Protection changes are not reentrant per page: two writers sharing a page
/// could otherwise restore RX underneath each other. Pages hash onto a fixed
/// set of stripes.
static PAGE_LOCKS: [Mutex<()>; PAGE_STRIPES] = [const { Mutex::new(()) }; PAGE_STRIPES];

struct PageRange {
    start: usize,
    len: usize,
}

impl PageRange {
    fn covering(addr: usize, size: usize) -> Self {
        let page = page_size();
        let start = addr & !(page - 1);
        let end = addr.saturating_add(size).saturating_add(page - 1) & !(page - 1);
        Self { start, len: (end - start).max(page) }
    }

    /// Locks every stripe the range touches, in ascending stripe order.
    fn lock(&self) -> Vec<MutexGuard<'static, ()>> {
        let page = page_size();
        let mut stripes: Vec<usize> = (0..self.len / page)
            .map(|i| ((self.start / page) + i) % PAGE_STRIPES)
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes
            .into_iter()
            .map(|i| PAGE_LOCKS[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

/// Copy `len` bytes of code starting at `addr`.
///
/// # Safety
/// `addr..addr + len` must be mapped and readable.
pub unsafe fn read_code(addr: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    core::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
    out
}

/// Overwrite code at `addr` with `bytes`, temporarily lifting write
/// protection on the containing pages.
///
/// # Safety
/// `addr..addr + bytes.len()` must be mapped code that no thread is executing
/// through the overwritten bytes while this runs.
pub unsafe fn patch_code(addr: usize, bytes: &[u8]) -> Result<(), PatchError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let range = PageRange::covering(addr, bytes.len());
    let _stripes = range.lock();

    #[cfg(target_os = "linux")]
    {
        linux::write_protected(&range, addr, bytes)
    }
    #[cfg(target_os = "macos")]
    {
        darwin::write_protected(&range, addr, bytes)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = bytes;
        Err(PatchError::UnwritableMemory { address: addr })
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub(super) unsafe fn write_protected(
        range: &PageRange,
        addr: usize,
        bytes: &[u8],
    ) -> Result<(), PatchError> {
        // RWX so neighbouring code on the page keeps running.
        if libc::mprotect(
            range.start as *mut libc::c_void,
            range.len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            log::debug!(
                "mprotect RWX failed at {:#x}: {}",
                range.start,
                std::io::Error::last_os_error()
            );
            return Err(PatchError::UnwritableMemory { address: addr });
        }

        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());

        if libc::mprotect(
            range.start as *mut libc::c_void,
            range.len,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            log::warn!(
                "could not restore RX on {:#x}+{:#x}: {}",
                range.start,
                range.len,
                std::io::Error::last_os_error()
            );
        }

        invalidate_icache(range.start as *mut u8, range.len);
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_protect;
    use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    pub(super) unsafe fn write_protected(
        range: &PageRange,
        addr: usize,
        bytes: &[u8],
    ) -> Result<(), PatchError> {
        let task = mach_task_self();

        // VM_PROT_COPY gives us a private writable copy of a shared text page.
        let kr = mach_vm_protect(
            task,
            range.start as mach_vm_address_t,
            range.len as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
        );
        if kr != KERN_SUCCESS {
            log::debug!("mach_vm_protect RW failed kr={} page={:#x}", kr, range.start);
            return Err(PatchError::UnwritableMemory { address: addr });
        }

        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        invalidate_icache(addr as *mut u8, bytes.len());

        let kr = mach_vm_protect(
            task,
            range.start as mach_vm_address_t,
            range.len as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_EXECUTE,
        );
        if kr != KERN_SUCCESS {
            log::warn!("could not restore RX on {:#x}: kr={}", range.start, kr);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::code::allocator::CodePage;

    #[test]
    fn patch_code_writes_are_visible_at_original_address() {
        let mut page = CodePage::new(64).expect("map");
        page.write(0, &[0x90, 0x90, 0x90, 0xC3]).expect("write");
        page.make_executable().expect("rx");

        unsafe {
            patch_code(page.address(), &[0xCC, 0xCC]).expect("patch");
            assert_eq!(read_code(page.address(), 4), vec![0xCC, 0xCC, 0x90, 0xC3]);
        }
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn patched_page_still_executes() {
        let mut page = CodePage::new(16).expect("map");
        // nop; ret
        page.write(0, &[0x90, 0xC3]).expect("write");
        page.make_executable().expect("rx");

        unsafe {
            // Skip the nop by turning it into a ret.
            patch_code(page.address(), &[0xC3]).expect("patch");
            let f: extern "C" fn() = core::mem::transmute(page.address());
            f();
        }
    }

    #[test]
    fn patch_spanning_two_pages() {
        let sz = page_size();
        let mut page = CodePage::new(sz * 2).expect("map");
        page.make_executable().expect("rx");

        let at = page.address() + sz - 2;
        unsafe {
            patch_code(at, &[1, 2, 3, 4]).expect("patch");
            assert_eq!(read_code(at, 4), vec![1, 2, 3, 4]);
        }
    }

    #[test]
    fn page_range_rounds_to_whole_pages() {
        let sz = page_size();
        let r = PageRange::covering(sz * 3 + 10, 5);
        assert_eq!(r.start, sz * 3);
        assert_eq!(r.len, sz);

        let r = PageRange::covering(sz * 4 - 1, 2);
        assert_eq!(r.start, sz * 3);
        assert_eq!(r.len, sz * 2);
        assert_eq!(r.lock().len(), 2);
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        unsafe { assert_eq!(patch_code(0, &[]), Ok(())) };
    }
}

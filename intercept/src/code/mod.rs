//! Raw access to executable memory. Nothing outside this module writes to
//! code pages.

pub mod allocator;
pub mod cache;
pub mod patcher;

pub use allocator::CodePage;

#[inline]
pub(crate) fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

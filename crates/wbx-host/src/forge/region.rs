//! Executable memory regions with write-then-execute discipline.

use crate::error::{HostError, Result};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Retired regions kept mapped as `PROT_NONE` in debug builds. Past this
/// many, the oldest is unmapped so the process stays clear of the kernel's
/// map count limit.
pub(crate) const MAX_RETIRED: usize = 256;

/// Debug-build graveyard of released regions, oldest first, as (base, len).
static RETIRED: Mutex<VecDeque<(usize, usize)>> = Mutex::new(VecDeque::new());

/// Number of regions currently retired but still mapped.
#[cfg(test)]
pub(crate) fn retired_count() -> usize {
    RETIRED.lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Park a `PROT_NONE` region, unmapping the oldest one if the graveyard is full.
fn retire(base: NonNull<c_void>, len: usize) -> Result<()> {
    let evicted = {
        let mut retired = RETIRED.lock().unwrap_or_else(|e| e.into_inner());
        retired.push_back((base.as_ptr() as usize, len));
        if retired.len() > MAX_RETIRED {
            retired.pop_front()
        } else {
            None
        }
    };

    if let Some((addr, len)) = evicted {
        if let Some(oldest) = NonNull::new(addr as *mut c_void) {
            unsafe { munmap(oldest, len) }
                .map_err(|e| HostError::AllocationFailure(format!("failed to unmap retired stub: {}", e)))?;
        }
    }
    Ok(())
}

/// Page-granular region that is writable while code is copied in and
/// read+execute afterwards. The two are never held at once.
#[derive(Debug)]
pub(crate) struct ExecRegion {
    base: NonNull<c_void>,
    len: usize,
    released: bool,
}

// The region is immutable once built; its address may be used from any thread.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

impl ExecRegion {
    /// Map a fresh region, copy `code` into it and make it executable.
    pub(crate) fn with_code(code: &[u8]) -> Result<Self> {
        let page = page_size();
        let len = code.len().max(1).div_ceil(page) * page;
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| HostError::AllocationFailure("zero-sized region".to_string()))?;

        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| HostError::AllocationFailure(format!("failed to map stub: {}", e)))?;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base.as_ptr() as *mut u8, code.len());
        }

        if let Err(e) = unsafe { mprotect(base, len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC) } {
            if let Err(unmap_err) = unsafe { munmap(base, len) } {
                tracing::warn!("failed to unmap rejected stub: {}", unmap_err);
            }
            return Err(HostError::MemoryProtectionFailure(format!(
                "failed to mark stub as executable: {}",
                e
            )));
        }

        Ok(Self {
            base,
            len,
            released: false,
        })
    }

    /// Base address.
    pub(crate) fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Release the region. Idempotent.
    ///
    /// Debug builds retire the pages to `PROT_NONE` instead of unmapping them,
    /// so a call through a stale address faults instead of landing in memory
    /// the allocator handed out again. Only the last [`MAX_RETIRED`] regions
    /// are kept that way.
    pub(crate) fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if cfg!(debug_assertions) {
            unsafe { mprotect(self.base, self.len, ProtFlags::PROT_NONE) }.map_err(|e| {
                HostError::MemoryProtectionFailure(format!("failed to retire stub: {}", e))
            })?;
            retire(self.base, self.len)
        } else {
            unsafe { munmap(self.base, self.len) }
                .map_err(|e| HostError::AllocationFailure(format!("failed to unmap stub: {}", e)))
        }
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            crate::error::fatal(&e);
        }
    }
}

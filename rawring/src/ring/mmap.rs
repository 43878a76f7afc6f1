use std::io;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

/// A shared mapping of one of the ring's kernel regions. Unmapped on drop.
#[derive(Debug)]
pub(crate) struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    pub(crate) fn map(fd: RawFd, len: usize, offset: libc::off_t) -> io::Result<Self> {
        // SAFETY: a fresh shared mapping at a kernel-chosen address; nothing
        // else aliases it yet.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        Ok(Self { ptr, len })
    }

    /// Pointer to `T` at byte `offset` inside the region.
    ///
    /// # Safety
    ///
    /// `offset + size_of::<T>()` must be within the region and suitably
    /// aligned for `T`; the kernel-provided ring offsets satisfy both.
    pub(crate) unsafe fn at<T>(&self, offset: u32) -> *mut T {
        debug_assert!(offset as usize + size_of::<T>() <= self.len);
        unsafe { self.ptr.as_ptr().add(offset as usize).cast::<T>() }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created in `map` and never
        // unmapped elsewhere.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "munmap of ring region failed");
        }
    }
}

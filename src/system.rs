use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps an anonymous, zero-filled, read-write region of `size` bytes.
///
/// Returns `None` when the mapping fails. The region is page aligned.
#[must_use]
pub fn map_region(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no file descriptor, zero offset.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

/// Unmaps a region previously returned by [`map_region`].
///
/// `size` must be the size the region was mapped with.
pub fn unmap_region(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr comes from map_region with the same size.
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), size);
    }
}

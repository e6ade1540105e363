//! Aligned memory for direct packets
//!
//! A `DirectBuffer` owns an aligned allocation made straight from the global
//! allocator. Packets backed by it must free it explicitly before the packet
//! handle is released; `Drop` only catches buffers that were never freed.

use blockio_common::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Alignment of direct buffers (one page)
pub const ALIGNMENT: usize = 4096;

/// Explicitly freed, page-aligned buffer
#[derive(Debug)]
pub struct DirectBuffer {
    ptr: Option<NonNull<u8>>,
    layout: Layout,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for DirectBuffer {}
unsafe impl Sync for DirectBuffer {}

impl DirectBuffer {
    /// Allocate a zeroed buffer holding `len` bytes
    pub fn new(len: usize) -> Result<Self> {
        Self::with_alignment(len, ALIGNMENT)
    }

    /// Allocate a zeroed buffer with custom alignment
    ///
    /// The allocation is rounded up to a multiple of `alignment`, with at
    /// least one aligned unit so zero-length buffers stay valid.
    pub fn with_alignment(len: usize, alignment: usize) -> Result<Self> {
        let capacity = len
            .max(1)
            .checked_next_multiple_of(alignment)
            .ok_or_else(|| Error::invalid_argument(format!("buffer size {len} overflows")))?;
        let layout = Layout::from_size_align(capacity, alignment).map_err(|e| {
            Error::invalid_argument(format!(
                "invalid layout for {capacity} bytes aligned to {alignment}: {e}"
            ))
        })?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        Ok(Self {
            ptr: Some(ptr),
            layout,
            len,
        })
    }

    /// Number of usable bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying allocation
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Check whether the memory has been returned to the allocator
    #[must_use]
    pub const fn is_freed(&self) -> bool {
        self.ptr.is_none()
    }

    /// View the buffer contents; empty once freed
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: ptr is live for `layout.size() >= len` initialized bytes.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Mutable view of the buffer contents; empty once freed
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: as above, and `&mut self` guarantees exclusive access.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// Return the memory to the allocator
    ///
    /// Idempotent. Returns the number of bytes released by this call.
    pub fn free(&mut self) -> usize {
        match self.ptr.take() {
            Some(ptr) => {
                // SAFETY: ptr was allocated with `layout` and is freed only once.
                unsafe { dealloc(ptr.as_ptr(), self.layout) };
                self.len = 0;
                self.layout.size()
            }
            None => 0,
        }
    }
}

impl Drop for DirectBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

impl AsRef<[u8]> for DirectBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DirectBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

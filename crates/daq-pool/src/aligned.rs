#![allow(unsafe_code)]
//! Aligned byte buffers.
//!
//! Frame payloads that end up on disk through unbuffered (direct) I/O must
//! start on a page boundary and span a whole number of pages. The allocator
//! variants here hand out zeroed buffers aligned to 16, 32 or 4096 bytes, or
//! with the platform's natural alignment.
//!
//! ```
//! use daq_pool::AllocatorType;
//!
//! let buf = AllocatorType::Align4k.allocate(10_000).unwrap();
//! assert_eq!(buf.as_ptr() as usize % 4096, 0);
//! assert_eq!(AllocatorType::Align4k.aligned_size(10_000), 12_288);
//! ```

use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use thiserror::Error;

/// Page size assumed when the platform cannot be queried.
pub const PAGE_SIZE: usize = 4096;

/// Minimum alignment used for the natural variant. Matches what `malloc`
/// guarantees for scalar types.
const NATURAL_ALIGNMENT: usize = std::mem::align_of::<u64>();

/// Allocation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },

    #[error("alignment {0} is not a power of two")]
    UnsupportedAlignment(usize),
}

/// Rounds `n` up to the next multiple of `align`.
///
/// `align` must be a power of two; 0 and 1 both mean "natural" and return `n`.
#[inline]
#[must_use]
pub const fn aligned_size(n: usize, align: usize) -> usize {
    if align <= 1 {
        return n;
    }
    (n + align - 1) & !(align - 1)
}

/// The four allocator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AllocatorType {
    /// Natural alignment (sizes are not padded).
    #[default]
    #[serde(rename = "default", alias = "Default")]
    Default,
    #[serde(rename = "16")]
    Align16,
    #[serde(rename = "32")]
    Align32,
    /// Page alignment, required for direct I/O.
    #[serde(rename = "4k", alias = "4096")]
    Align4k,
}

impl AllocatorType {
    /// Boundary the variant aligns to. The natural variant reports 1.
    #[must_use]
    pub const fn alignment(self) -> usize {
        match self {
            AllocatorType::Default => 1,
            AllocatorType::Align16 => 16,
            AllocatorType::Align32 => 32,
            AllocatorType::Align4k => PAGE_SIZE,
        }
    }

    #[inline]
    #[must_use]
    pub const fn aligned_size(self, n: usize) -> usize {
        aligned_size(n, self.alignment())
    }

    /// Allocate a zeroed buffer of `size` bytes on this variant's boundary.
    pub fn allocate(self, size: usize) -> Result<AlignedBuf, AllocError> {
        AlignedBuf::zeroed(size, self.alignment().max(NATURAL_ALIGNMENT))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AllocatorType::Default => "default",
            AllocatorType::Align16 => "16",
            AllocatorType::Align32 => "32",
            AllocatorType::Align4k => "4k",
        }
    }
}

impl fmt::Display for AllocatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned, zero-initialised, aligned heap block.
///
/// Released through the same layout it was allocated with, so callers never
/// pass a size when freeing.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

// SAFETY: AlignedBuf uniquely owns its allocation, like Vec<u8>.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only hands out &[u8].
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `align`.
    pub fn zeroed(len: usize, align: usize) -> Result<Self, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::UnsupportedAlignment(align));
        }
        if len == 0 {
            // Dangling but aligned; never dereferenced for reads past len 0.
            let ptr = NonNull::new(align as *mut u8)
                .ok_or(AllocError::UnsupportedAlignment(align))?;
            return Ok(Self { ptr, len, align });
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| AllocError::OutOfMemory { size: len, align })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory { size: len, align })?;
        Ok(Self { ptr, len, align })
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.align
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes (zeroed at allocation).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: unique borrow of an allocation valid for len bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        // SAFETY: allocated in zeroed() with exactly this layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, self.align);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}

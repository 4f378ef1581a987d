//! Memory allocation strategy seam.
//!
//! The fuzzer needs one large physically contiguous, `1<<30`-aligned region
//! to hammer in; how that region is obtained (hugepages, custom kernel
//! help) is behind the [`RegionAllocator`] trait. Implementations live in
//! their own crates, e.g. `sledge-hugepage`.

use crate::memory::Memory;
use crate::util::Size;

/// Trait for allocators that provide the contiguous hammering region.
///
/// The returned region must be physically contiguous and aligned to the
/// region size so that DRAM address translation of offsets inside it is
/// meaningful. The region stays valid until deallocated by the caller.
pub trait RegionAllocator {
    /// The error type returned by allocation operations.
    type Error: std::error::Error;

    /// Returns the size of individual blocks managed by this allocator
    /// (e.g. 1 GB for hugepages).
    fn block_size(&self) -> Size;

    /// Allocates a contiguous region of the specified size.
    ///
    /// # Errors
    ///
    /// May return an error if the backing mechanism is unavailable or out
    /// of capacity.
    fn alloc_region(&mut self, size: Size) -> Result<Memory, Self::Error>;
}

/// Allocate the hammering region using an allocation strategy.
///
/// Entry point for callers that just need a region of `size` bytes.
///
/// # Panics
///
/// Panics if `size` is zero or not a multiple of the allocator block size;
/// both are configuration bugs.
///
/// # Errors
///
/// Propagates the allocator's error.
pub fn alloc_region<E: std::error::Error>(
    allocator: &mut dyn RegionAllocator<Error = E>,
    size: Size,
) -> Result<Memory, E> {
    assert_eq!(
        size.bytes() % allocator.block_size().bytes(),
        0,
        "Size {} must be a multiple of block size {}",
        size,
        allocator.block_size()
    );
    assert!(size.bytes() > 0, "Size must be greater than 0");
    allocator.alloc_region(size)
}

//! 1 GiB hugepage allocator for the Sledge hammering region.
//!
//! Implements [`sledge_core::allocator::RegionAllocator`] by mapping a
//! single 1 GB hugepage at a fixed, region-aligned address. A hugepage is
//! physically contiguous by construction, which makes the DRAM address
//! translation of offsets inside the region exact.

#![warn(missing_docs)]

mod hugepage;

pub use hugepage::{HugepageAllocator, HugepageSize};

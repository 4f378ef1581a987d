//! Utility functions and types used throughout the Sledge framework.
//!
//! This module provides:
//! - [`Size`] - Memory size representation
//! - Constants for memory operations ([`PAGE_SIZE`], [`ROW_SIZE`], etc.)
//! - [`Rng`] - Seedable random number generation
//! - Raw mmap helpers, including executable mappings for the hammering JIT

mod alloc_util;
mod constants;
mod rng;
mod size;

pub use self::alloc_util::*;
pub use self::constants::*;
pub use self::rng::Rng;
pub use self::size::Size;

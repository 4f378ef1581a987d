//! # Sledge Core
//!
//! `sledge-core` is the foundational library of the Sledge Rowhammer
//! fuzzing framework. It provides the memory model and DRAM address
//! translation that the fuzzer builds on.
//!
//! ## Main Components
//!
//! - [`memory`] module - Memory management abstractions: the
//!   [`memory::Memory`] region, DRAM address translation via
//!   [`memory::DRAMAddr`] / [`memory::MemConfiguration`], data-pattern
//!   initialization and bit-flip scanning, and access-time measurement.
//!
//! - [`config`] module - Per-DIMM geometry configuration loaded from JSON,
//!   describing the reverse-engineered bank/row/column bit functions.
//!
//! - [`allocator`] module - The [`allocator::RegionAllocator`] trait behind
//!   which hammering-region allocation strategies live.
//!
//! - [`hammerer`] module - The [`hammerer::Hammering`] trait implemented by
//!   hammering backends.
//!
//! - [`util`] module - Size types, memory constants, seeded randomness and
//!   raw mapping helpers.
//!
//! ## Platform Support
//!
//! The framework targets x86_64 Linux. Address translation and pattern
//! handling are portable, but timing and hammering rely on `rdtscp`,
//! `clflushopt` and friends.

#![warn(missing_docs)]

pub mod allocator;
pub mod config;
pub mod hammerer;
pub mod memory;
pub mod util;

//! Memory model of the hammering region.
//!
//! This module provides the abstractions the fuzzer core works against:
//! - [`Memory`]: a raw memory region borrowed from an allocator.
//! - [`DRAMAddr`] / [`MemConfiguration`]: DRAM address translation.
//! - [`BytePointer`]: byte-granular access to a region.
//! - [`Initializable`]: writing data patterns into a region.
//! - [`Checkable`]: comparing a region against its expected pattern and
//!   collecting [`BitFlip`]s, including the row-granular victim scan.
//! - [`MemoryTupleTimer`]: access-time measurement used for bank-conflict
//!   checks and refresh-interval calibration.

mod dram_addr;
mod mem_configuration;
mod memblock;
mod timer;

pub use self::dram_addr::DRAMAddr;
pub use self::mem_configuration::{MTX_SIZE, MemConfigKey, MemConfiguration};
pub use self::memblock::Memory;
pub use self::timer::{MemoryTupleTimer, TimerError, construct_memory_tuple_timer};

use crate::util::{CL_SIZE, PAGE_SIZE, ROW_MASK, Rng};
use libc::{c_void, memcmp};
use log::{debug, info};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::arch::x86_64::{_mm_clflush, _mm_mfence};
use std::fmt;

/// Pointer type for aggressor row addresses.
///
/// Used to identify memory rows that are hammered to induce bit flips
/// in adjacent victim rows.
pub type AggressorPtr = *const u8;

/// Combined trait for memory regions that can be attacked and checked.
pub trait VictimMemory: BytePointer + Initializable + Checkable {}

/// Trait for accessing memory as a byte pointer.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the memory region exists.
    /// Dereferencing requires unsafe code and proper synchronization.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// Data written into the hammering region before an attack.
///
/// The pattern determines the charge state of victim cells and thereby
/// which flip directions can be observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DataPattern {
    /// Random data pattern using a seeded RNG
    Random(Box<Rng>),
    /// All zeros (0x00)
    Zero,
    /// All ones (0xFF)
    One,
}

impl DataPattern {
    /// Returns the expected page content at the next position.
    ///
    /// The random variant is stateful: callers must request pages in
    /// ascending offset order, one call per page, to stay aligned with the
    /// RNG stream.
    fn get(&mut self) -> [u8; PAGE_SIZE] {
        match self {
            DataPattern::Random(rng) => {
                let mut arr = [0u8; PAGE_SIZE];
                for byte in arr.iter_mut() {
                    *byte = rng.random();
                }
                arr
            }
            DataPattern::Zero => [0x00; PAGE_SIZE],
            DataPattern::One => [0xFF; PAGE_SIZE],
        }
    }
}

/// Represents a bit flip detected in memory.
///
/// A bit flip is a change in memory where one or more bits differ from their
/// expected value. This is the primary indicator of a successful Rowhammer
/// attack.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BitFlip {
    /// Virtual address where the bit flip occurred
    pub addr: usize,
    /// Bitmask indicating which bits flipped (1 = bit flipped)
    pub bitmask: u8,
    /// The expected data value (before the flip)
    pub data: u8,
}

impl fmt::Debug for BitFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitFlip")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("bitmask", &format_args!("{:#x}", self.bitmask))
            .field("data", &format_args!("{:#x}", self.data))
            .finish()
    }
}

impl BitFlip {
    /// Constructor for BitFlip
    pub fn new(addr: *const u8, bitmask: u8, data: u8) -> Self {
        BitFlip {
            addr: addr as usize,
            bitmask,
            data,
        }
    }

    /// Calculate the FlipDirection (1->0 or 0->1 or Multiple) observed in this BitFlip
    pub fn flip_direction(&self) -> FlipDirection {
        match self.bitmask.count_ones() {
            0 => FlipDirection::None,
            1 => {
                let flipped = self.bitmask & self.data;
                match flipped {
                    0 => FlipDirection::ZeroToOne,
                    _ => FlipDirection::OneToZero,
                }
            }
            2.. => FlipDirection::Multiple(
                (0..8)
                    .filter_map(|i| {
                        if self.bitmask & (1 << i) != 0 {
                            Some(if self.data & (1 << i) != 0 {
                                FlipDirection::OneToZero
                            } else {
                                FlipDirection::ZeroToOne
                            })
                        } else {
                            None
                        }
                    })
                    .collect(),
            ),
        }
    }
}

/// Direction of bit flip transitions.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub enum FlipDirection {
    /// Bit flipped from 0 to 1
    ZeroToOne,
    /// Bit flipped from 1 to 0
    OneToZero,
    /// Multiple bits flipped in (potentially) different directions
    Multiple(Vec<FlipDirection>),
    /// No bit flip occurred
    None,
}

/// Trait for initializing memory with specific patterns.
pub trait Initializable {
    /// Initializes memory with the given data pattern.
    fn initialize(&self, pattern: DataPattern);

    /// Initializes memory using a callback function.
    ///
    /// The callback receives a page offset and returns optional page data;
    /// `None` leaves the page untouched.
    fn initialize_cb(&self, f: &mut dyn FnMut(usize) -> Option<[u8; PAGE_SIZE]>);
}

/// Trait for checking memory regions for bit flips.
pub trait Checkable {
    /// Checks the whole region against a pattern and returns detected bit flips.
    fn check(&self, pattern: DataPattern) -> Vec<BitFlip>;

    /// Checks only the pages belonging to the given row base addresses.
    ///
    /// This is the victim scan: after hammering, the rows adjacent to the
    /// aggressors are compared against their pre-hammer contents. The whole
    /// pattern stream is replayed so that the random variant stays aligned,
    /// but only pages inside `rows` are read back from memory.
    fn check_rows(&self, pattern: DataPattern, rows: &[AggressorPtr]) -> Vec<BitFlip>;

    /// Checks memory using a callback function to generate expected values.
    fn check_cb(&self, f: &mut dyn FnMut(usize) -> Option<[u8; PAGE_SIZE]>) -> Vec<BitFlip>;
}

impl<T> Initializable for T
where
    T: VictimMemory,
{
    fn initialize(&self, mut pattern: DataPattern) {
        info!(
            "initialize buffer with pattern {}",
            match &pattern {
                DataPattern::Random(rng) => format!("random (seed {:#x})", rng.seed()),
                DataPattern::Zero => "zero".into(),
                DataPattern::One => "one".into(),
            }
        );
        self.initialize_cb(&mut |_| Some(pattern.get()));
    }

    fn initialize_cb(&self, f: &mut dyn FnMut(usize) -> Option<[u8; PAGE_SIZE]>) {
        let len = self.len();
        if !len.is_multiple_of(PAGE_SIZE) {
            panic!(
                "memory len ({}) must be divisible by PAGE_SIZE ({})",
                len, PAGE_SIZE
            );
        }

        debug!("initialize {} bytes", len);

        for offset in (0..len).step_by(PAGE_SIZE) {
            if let Some(value) = f(offset) {
                unsafe {
                    std::ptr::write_volatile(self.addr(offset) as *mut [u8; PAGE_SIZE], value);
                }
            }
        }
        debug!("memory init done");
    }
}

impl<T> Checkable for T
where
    T: VictimMemory,
{
    fn check(&self, mut pattern: DataPattern) -> Vec<BitFlip> {
        self.check_cb(&mut |_| Some(pattern.get()))
    }

    fn check_rows(&self, mut pattern: DataPattern, rows: &[AggressorPtr]) -> Vec<BitFlip> {
        self.check_cb(&mut |offset: usize| {
            let addr = self.addr(offset);
            // pattern RNG is stateful, consume the page even if we skip it
            let val = pattern.get();
            let in_scope = rows
                .iter()
                .any(|&row| row as usize == addr as usize & !ROW_MASK);
            in_scope.then_some(val)
        })
    }

    fn check_cb(&self, f: &mut dyn FnMut(usize) -> Option<[u8; PAGE_SIZE]>) -> Vec<BitFlip> {
        let len = self.len();
        if !len.is_multiple_of(PAGE_SIZE) {
            panic!(
                "memory len ({}) must be divisible by PAGE_SIZE ({})",
                len, PAGE_SIZE
            );
        }

        let mut ret = vec![];
        for offset in (0..len).step_by(PAGE_SIZE) {
            if let Some(expected) = f(offset) {
                unsafe {
                    for byte_offset in (0..PAGE_SIZE).step_by(CL_SIZE) {
                        _mm_clflush(self.addr(offset + byte_offset));
                    }
                    _mm_mfence();
                    let cmp = memcmp(
                        self.addr(offset) as *const c_void,
                        expected.as_ptr() as *const c_void,
                        PAGE_SIZE,
                    );
                    if cmp == 0 {
                        continue;
                    }
                    debug!(
                        "Found bitflip in page at offset {:#x}. Determining exact flip position",
                        offset
                    );
                    for (i, &expected) in expected.iter().enumerate() {
                        let addr = self.addr(offset + i);
                        _mm_clflush(addr);
                        _mm_mfence();
                        if *addr != expected {
                            ret.push(BitFlip::new(addr, *addr ^ expected, expected));
                        }
                    }
                }
            }
        }
        ret
    }
}

impl VictimMemory for Memory {}

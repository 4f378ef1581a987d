use thiserror::Error;

/// Errors constructing or using a memory timer.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The current architecture has no timer implementation.
    #[error("No memory timer available for this architecture")]
    Unsupported,
}

/// Measures the access time of address pairs served from DRAM.
///
/// Accessing two addresses in the same bank but different rows forces a
/// row-buffer conflict, which is measurably slower than a row hit. This is
/// the primitive behind bank-function verification and refresh-interval
/// calibration.
pub trait MemoryTupleTimer {
    /// Times `rounds` subsequent accesses to `a` and `b`, flushing both
    /// from the cache hierarchy before every round, and returns the median
    /// round latency in cycles.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for reads for the lifetime of the call.
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64;
}

/// rdtscp-based timer for x86_64.
#[cfg(target_arch = "x86_64")]
pub struct DefaultMemoryTupleTimer;

#[cfg(target_arch = "x86_64")]
impl MemoryTupleTimer for DefaultMemoryTupleTimer {
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64 {
        use std::arch::asm;
        use std::arch::x86_64::{__rdtscp, _mm_mfence};

        let mut timings = Vec::with_capacity(rounds);
        let mut aux = 0u32;
        for _ in 0..rounds {
            unsafe {
                asm!(
                    "clflushopt [{a}]",
                    "clflushopt [{b}]",
                    a = in(reg) a,
                    b = in(reg) b,
                );
                _mm_mfence();
                let start = __rdtscp(&mut aux);
                std::ptr::read_volatile(a);
                std::ptr::read_volatile(b);
                let end = __rdtscp(&mut aux);
                _mm_mfence();
                timings.push(end - start);
            }
        }
        timings.sort_unstable();
        timings[timings.len() / 2]
    }
}

/// Constructs the platform timer.
///
/// # Errors
///
/// Returns [`TimerError::Unsupported`] on non-x86_64 targets.
pub fn construct_memory_tuple_timer() -> Result<Box<dyn MemoryTupleTimer>, TimerError> {
    #[cfg(target_arch = "x86_64")]
    {
        Ok(Box::new(DefaultMemoryTupleTimer))
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(TimerError::Unsupported)
    }
}

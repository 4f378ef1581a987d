use log::{debug, info};
use sledge_core::memory::{
    AggressorPtr, DRAMAddr, MemConfiguration, MemoryTupleTimer, construct_memory_tuple_timer,
};
use thiserror::Error;

/// Errors surfaced by the DRAM analyzer.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// No timer available on this platform.
    #[error(transparent)]
    Timer(#[from] sledge_core::memory::TimerError),
    /// Same-bank accesses did not show row-conflict latency; the selected
    /// memory configuration does not match the module.
    #[error(
        "bank conflict check failed: same-bank latency {measured} below threshold {threshold}; \
         wrong MemConfiguration for this DIMM?"
    )]
    MemConfigMismatch {
        /// Median same-bank access latency in cycles
        measured: u64,
        /// Configured conflict threshold in cycles
        threshold: u64,
    },
    /// Too few refresh latency spikes observed to derive a stable count.
    #[error("refresh detection collected only {0} samples")]
    TooFewSamples(usize),
}

/// Number of timed rounds per latency measurement.
const MEASUREMENT_ROUNDS: usize = 1000;

/// Refresh-interval samples collected by [`DramAnalyzer::count_acts_per_ref`].
const ACT_SAMPLES: usize = 1024;

/// Measurement routines characterizing the module under attack.
///
/// The fuzzer core consumes only two scalars from here: the verified bank
/// conflict property and the activation count per refresh interval.
pub struct DramAnalyzer {
    base_msb: AggressorPtr,
    mem_config: MemConfiguration,
    threshold: u64,
    timer: Box<dyn MemoryTupleTimer>,
}

impl DramAnalyzer {
    /// Creates an analyzer over the hammering region starting at `base_msb`.
    ///
    /// # Errors
    ///
    /// Fails if no access timer is available on this platform.
    pub fn new(
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
        threshold: u64,
    ) -> Result<Self, AnalyzerError> {
        Ok(DramAnalyzer {
            base_msb,
            mem_config,
            threshold,
            timer: construct_memory_tuple_timer()?,
        })
    }

    /// Verifies that the configured bank functions match the module.
    ///
    /// Two rows in the same bank must show row-conflict latency above the
    /// threshold; a mismatch means the address matrices decode the wrong
    /// bank bits and hammering would scatter across banks.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::MemConfigMismatch`] for the operator to fix
    /// the geometry config.
    pub fn verify_bank_conflicts(&self) -> Result<(), AnalyzerError> {
        let row_count = self.mem_config.get_row_count();
        let a = DRAMAddr::new(0, 0, 0).to_virt(self.base_msb, self.mem_config);
        let b = DRAMAddr::new(0, row_count / 2, 0).to_virt(self.base_msb, self.mem_config);
        let same_bank = unsafe {
            self.timer
                .time_subsequent_access_from_ram(a, b, MEASUREMENT_ROUNDS)
        };
        debug!("same-bank, different-row latency: {} cycles", same_bank);
        if same_bank < self.threshold {
            return Err(AnalyzerError::MemConfigMismatch {
                measured: same_bank,
                threshold: self.threshold,
            });
        }
        Ok(())
    }

    /// Counts row activations fitting into one refresh interval.
    ///
    /// Alternates between two same-bank rows with cacheline flushes and
    /// watches for latency spikes: an access delayed past the conflict
    /// threshold right after a refresh marks the interval boundary. The
    /// activation count is twice the median number of access pairs between
    /// consecutive spikes.
    ///
    /// # Errors
    ///
    /// Fails if too few spikes were observed, e.g. under heavy preemption.
    pub fn count_acts_per_ref(&self) -> Result<usize, AnalyzerError> {
        use std::arch::asm;
        use std::arch::x86_64::{__rdtscp, _mm_mfence};

        let row_count = self.mem_config.get_row_count();
        let a = DRAMAddr::new(0, 0, 0).to_virt(self.base_msb, self.mem_config);
        let b = DRAMAddr::new(0, row_count / 2, 0).to_virt(self.base_msb, self.mem_config);

        let mut intervals: Vec<usize> = Vec::with_capacity(ACT_SAMPLES);
        let mut aux = 0u32;
        let mut last_spike_pair: usize = 0;
        let mut pair: usize = 0;
        // bail out eventually on machines where no spike ever shows up
        const MAX_PAIRS: usize = 64_000_000;
        unsafe {
            let mut before = __rdtscp(&mut aux);
            while intervals.len() < ACT_SAMPLES && pair < MAX_PAIRS {
                let _ = std::ptr::read_volatile(a);
                let _ = std::ptr::read_volatile(b);
                asm!(
                    "clflushopt [{a}]",
                    "clflushopt [{b}]",
                    a = in(reg) a,
                    b = in(reg) b,
                );
                _mm_mfence();
                let after = __rdtscp(&mut aux);
                if after - before > self.threshold {
                    // first spike after startup has no valid predecessor
                    if last_spike_pair != 0 {
                        intervals.push((pair - last_spike_pair) * 2);
                    }
                    last_spike_pair = pair;
                }
                before = after;
                pair += 1;
            }
        }
        if intervals.len() < ACT_SAMPLES / 2 {
            return Err(AnalyzerError::TooFewSamples(intervals.len()));
        }
        intervals.sort_unstable();
        let acts = intervals[intervals.len() / 2];
        info!("measured {} activations per refresh interval", acts);
        Ok(acts)
    }
}

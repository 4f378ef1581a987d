use crate::jitter::{CodeJitter, JitError, Program};
use log::{debug, info};
use sledge_core::hammerer::Hammering;
use sledge_core::memory::AggressorPtr;
use sledge_core::util::REF_INTERVAL_LEN_US;
use std::time::Instant;
use thiserror::Error;

/// Errors preparing or running a pattern hammerer.
#[derive(Debug, Error)]
pub enum HammerError {
    /// Code emission failed; fatal for the fuzzing iteration.
    #[error(transparent)]
    Jit(#[from] JitError),
}

/// Upper bound on pattern-shortening iterations.
const MAX_OPTIMIZATION_ROUNDS: usize = 25;

/// Trailing probe accesses per interval considered "aligned enough".
const MAX_TRAILING_ACTS: usize = 10;

/// Executes a jitted hammering pattern.
///
/// Construction compiles the mapped address sequence; [`tune`] optionally
/// shortens the sequence until it fits one refresh interval. Implements
/// [`Hammering`] for the attack phase proper.
///
/// [`tune`]: PatternHammerer::tune
pub struct PatternHammerer {
    jitter: CodeJitter,
    addresses: Vec<AggressorPtr>,
    sync_rows: Vec<AggressorPtr>,
    warmup_rows: Vec<AggressorPtr>,
    wait_until_start_hammering_us: u128,
    num_activations_per_ref: usize,
    program: Program,
}

impl PatternHammerer {
    /// Compiles `addresses` into an executable hammer program.
    ///
    /// `warmup_rows` are touched in a busy loop for
    /// `wait_until_start_hammering_refs` refresh intervals before each
    /// hammer call, desynchronizing the pattern start from allocator noise.
    ///
    /// # Errors
    ///
    /// Fails if code emission fails.
    pub fn new(
        jitter: CodeJitter,
        addresses: Vec<AggressorPtr>,
        sync_rows: Vec<AggressorPtr>,
        warmup_rows: Vec<AggressorPtr>,
        wait_until_start_hammering_refs: usize,
        num_activations_per_ref: usize,
    ) -> Result<Self, HammerError> {
        let program = jitter.jit(&addresses, &sync_rows)?;
        Ok(PatternHammerer {
            jitter,
            addresses,
            sync_rows,
            warmup_rows,
            wait_until_start_hammering_us: (wait_until_start_hammering_refs as f32
                * REF_INTERVAL_LEN_US) as u128,
            num_activations_per_ref,
            program,
        })
    }

    /// Length of the (possibly shortened) executed address sequence.
    pub fn sequence_len(&self) -> usize {
        self.addresses.len()
    }

    /// Total activations one hammer call performs.
    pub fn expected_activations(&self) -> usize {
        self.jitter.expected_activations(self.addresses.len())
    }

    /// Shortens the pattern until it ends right before a refresh.
    ///
    /// Hammers once per round and inspects the returned probe count: the
    /// trailing probe accesses measure how far the pattern end missed the
    /// refresh boundary. Trailing aggressors are removed with a shrinking
    /// quantum and the program is re-emitted, up to
    /// [`MAX_OPTIMIZATION_ROUNDS`] rounds or until fewer than
    /// [`MAX_TRAILING_ACTS`] trailing accesses remain.
    ///
    /// # Safety
    ///
    /// Calls the jitted program; the mapped region must stay valid.
    ///
    /// # Errors
    ///
    /// Fails if re-emission fails.
    pub unsafe fn tune(&mut self) -> Result<usize, HammerError> {
        let num_refresh_intervals = self.jitter.num_refresh_intervals.max(1);
        let mut optimization_rounds = 0;
        loop {
            optimization_rounds += 1;
            let probe_count = unsafe { self.program.call() } as usize;
            let acts_after_last_refresh =
                (probe_count / num_refresh_intervals) % self.num_activations_per_ref;
            let acts_to_next_refresh = self.num_activations_per_ref - acts_after_last_refresh;
            info!(
                "tuning round {}: avg {} probe acts to next REFRESH",
                optimization_rounds, acts_to_next_refresh
            );
            if acts_to_next_refresh <= MAX_TRAILING_ACTS
                || optimization_rounds >= MAX_OPTIMIZATION_ROUNDS
            {
                info!(
                    "pattern tuned in {} rounds ({} accesses remain)",
                    optimization_rounds,
                    self.addresses.len()
                );
                return Ok(acts_to_next_refresh);
            }
            let remove = (acts_to_next_refresh / (2 * optimization_rounds)).max(1);
            let new_len = self.addresses.len().saturating_sub(remove).max(1);
            self.addresses.truncate(new_len);
            debug!(
                "removed {} trailing accesses, rebuilding pattern ({} remain)",
                remove,
                self.addresses.len()
            );
            self.program = self.jitter.jit(&self.addresses, &self.sync_rows)?;
        }
    }

    fn do_random_accesses(&self, rows: &[AggressorPtr], wait_until_start_hammering_us: u128) {
        let start = Instant::now();
        let mut _x = 0;
        while start.elapsed().as_micros() < wait_until_start_hammering_us {
            for &row in rows {
                _x = std::hint::black_box(unsafe { std::ptr::read_volatile(row) });
            }
        }
    }
}

impl Hammering for PatternHammerer {
    type Error = HammerError;

    fn hammer(&self) -> Result<(), Self::Error> {
        if !self.warmup_rows.is_empty() {
            debug!(
                "random warm-up accesses for {} us before running jitted code",
                self.wait_until_start_hammering_us
            );
            self.do_random_accesses(&self.warmup_rows, self.wait_until_start_hammering_us);
        }
        let start = Instant::now();
        let probes = unsafe { self.program.call() };
        debug!(
            "jit call done: {} probe accesses, {} expected activations, {:?} elapsed",
            probes,
            self.expected_activations(),
            start.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FencingStrategy, FlushingStrategy, HammeringStrategy};
    use sledge_core::memory::{BytePointer, Memory};
    use sledge_core::util::CL_SIZE;

    fn nosync_jitter(intervals: usize, rounds: usize) -> CodeJitter {
        CodeJitter {
            flushing_strategy: FlushingStrategy::EarliestPossible,
            fencing_strategy: FencingStrategy::LatestPossible,
            hammering_strategy: HammeringStrategy::Original,
            num_refresh_intervals: intervals,
            agg_rounds: rounds,
            num_aggs_for_sync: 0,
            sync_each_ref: true,
        }
    }

    #[test]
    fn test_hammer_runs_without_sync() {
        let mem = Memory::mmap(1 << 16).expect("mmap");
        let addrs: Vec<AggressorPtr> = (0..8)
            .map(|i| mem.addr(i * CL_SIZE) as AggressorPtr)
            .collect();
        let hammerer = PatternHammerer::new(nosync_jitter(4, 2), addrs, vec![], vec![], 0, 64)
            .expect("hammerer");
        assert_eq!(hammerer.expected_activations(), 4 * 2 * 8);
        hammerer.hammer().expect("hammer");
        mem.dealloc();
    }

    #[test]
    fn test_tune_terminates_without_refresh_signal() {
        // without sync probes the trailing count stays at the full interval,
        // so tuning must stop at the round cap while shrinking the sequence
        let mem = Memory::mmap(1 << 16).expect("mmap");
        let addrs: Vec<AggressorPtr> = (0..64)
            .map(|i| mem.addr((i * CL_SIZE) % (1 << 16)) as AggressorPtr)
            .collect();
        let mut hammerer =
            PatternHammerer::new(nosync_jitter(2, 1), addrs, vec![], vec![], 0, 8192)
                .expect("hammerer");
        let before = hammerer.sequence_len();
        let trailing = unsafe { hammerer.tune() }.expect("tune");
        assert!(trailing > 0);
        assert!(hammerer.sequence_len() < before);
        assert!(hammerer.sequence_len() >= 1);
        mem.dealloc();
    }
}

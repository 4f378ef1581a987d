use crate::params::FuzzingParameterSet;
use crate::pattern::{Aggressor, AggressorAccessPattern, HammeringPattern};
use log::{debug, info};
use rand_distr::{Distribution, Normal};
use sledge_core::util::Rng;
use thiserror::Error;

/// Errors during pattern composition.
#[derive(Debug, Error)]
pub enum PatternBuildError {
    /// The parameters cannot produce a pattern of the requested length.
    #[error(
        "could not fit {total_acts} activations with {num_aggressors} aggressors in {tries} tries"
    )]
    DoesNotFit {
        /// Requested pattern length
        total_acts: usize,
        /// Available aggressor pool size
        num_aggressors: usize,
        /// Attempts made before giving up
        tries: usize,
    },
}

/// Composes the access sequence of a [`HammeringPattern`].
///
/// The builder owns the cyclic aggressor ID counter and its own RNG stream,
/// so two builds with the same seed and parameters produce byte-identical
/// sequences.
pub struct PatternBuilder<'a> {
    pattern: &'a mut HammeringPattern,
    aggressor_id_counter: u64,
    rng: Rng,
}

/// Maximum attempts to assemble a tuple set before the build is abandoned.
const MAX_TRIES: usize = 20;

impl<'a> PatternBuilder<'a> {
    /// Creates a builder writing into `pattern`.
    pub fn new(pattern: &'a mut HammeringPattern, rng: Rng) -> Self {
        PatternBuilder {
            pattern,
            aggressor_id_counter: 1,
            rng,
        }
    }

    /// Builds the pattern selected by `params.use_sequential_aggressors`.
    pub fn build(&mut self, params: &FuzzingParameterSet) -> Result<(), PatternBuildError> {
        if params.use_sequential_aggressors {
            self.generate_sequential_pattern(params)
        } else {
            self.generate_frequency_based_pattern(params);
            Ok(())
        }
    }

    /// Draws an index into `list` with a Gaussian preference for the middle.
    ///
    /// Negative and out-of-range draws are rejection-sampled away.
    fn random_gaussian_index(&mut self, len: usize) -> usize {
        let mean = if len % 2 == 0 { len / 2 - 1 } else { (len - 1) / 2 };
        let normal = Normal::new(mean as f64, 1.0).expect("valid normal distribution");
        loop {
            let x = normal.sample(&mut self.rng);
            if x >= 0.0 && (x as usize) < len {
                return x as usize;
            }
        }
    }

    fn remove_smaller_than(vec: &mut Vec<usize>, m: usize) {
        vec.retain(|&x| x >= m);
    }

    /// Returns the first unfilled slot of the `base_period`-strided
    /// subsequence starting at `offset`, or `None` if it is saturated.
    fn find_first_empty(offset: usize, base_period: usize, accesses: &[Aggressor]) -> Option<usize> {
        let num_steps = accesses.len() / base_period;
        (0..num_steps)
            .map(|i| (offset + i * base_period) % accesses.len())
            .find(|&idx| accesses[idx].is_placeholder())
    }

    /// Fills every occurrence of an access pattern into the slot array.
    ///
    /// Claims slots `start + j*period + a` for amplitude repetition and
    /// tuple position, truncating at the pattern end.
    fn fill_slots(
        start: usize,
        period: usize,
        amplitude: usize,
        aggressors: &[Aggressor],
        accesses: &mut [Aggressor],
    ) {
        for idx in (start..accesses.len()).step_by(period) {
            for j in 0..amplitude {
                for (a, agg) in aggressors.iter().enumerate() {
                    let next_target = idx + aggressors.len() * j + a;
                    if next_target >= accesses.len() {
                        return;
                    }
                    debug_assert!(
                        accesses[next_target].is_placeholder(),
                        "slot {} claimed twice",
                        next_target
                    );
                    accesses[next_target] = *agg;
                }
            }
        }
    }

    /// Takes `n` aggressors from the cyclic ID counter.
    fn get_n_aggressors(&mut self, n: usize, max_num_aggressors: usize) -> Vec<Aggressor> {
        let mut aggs = Vec::with_capacity(n);
        while aggs.len() < n {
            aggs.push(Aggressor::new(self.aggressor_id_counter));
            self.aggressor_id_counter = (self.aggressor_id_counter + 1) % max_num_aggressors as u64;
        }
        aggs
    }

    /// Frequency-based composition: aliases periodic access patterns of
    /// power-of-two periods and varying amplitudes into one refresh-window
    /// schedule.
    pub fn generate_frequency_based_pattern(&mut self, params: &FuzzingParameterSet) {
        info!(
            "Generating frequency-based hammering pattern {}",
            self.pattern.id
        );

        let pattern_length = params.total_acts_pattern;
        let base_period = params.base_period;
        let num_base_periods = params.num_base_periods();
        assert!(
            base_period > 0 && pattern_length.is_multiple_of(base_period),
            "base_period must divide total_acts_pattern"
        );

        debug!("pattern_length: {}", pattern_length);
        debug!("base_period: {}", base_period);
        debug!("num_base_periods: {}", num_base_periods);

        self.pattern.base_period = base_period;
        self.pattern.total_activations = pattern_length;
        self.pattern.num_refresh_intervals = params.num_refresh_intervals;
        self.pattern.access_ids = vec![Aggressor::PLACEHOLDER; pattern_length];
        self.pattern.agg_access_patterns.clear();

        // powers of two up to the number of base periods
        let mut allowed_multiplicators = vec![];
        let mut m = 1;
        while m <= num_base_periods {
            allowed_multiplicators.push(m);
            m *= 2;
        }
        self.pattern.max_period = allowed_multiplicators.last().unwrap() * base_period;

        for k in 0..base_period {
            if !self.pattern.access_ids[k].is_placeholder() {
                continue;
            }

            let mut cur_multiplicators = allowed_multiplicators.clone();
            let idx = self.random_gaussian_index(cur_multiplicators.len());
            let cur_m = cur_multiplicators[idx];
            Self::remove_smaller_than(&mut cur_multiplicators, cur_m);
            let mut cur_period = base_period * cur_m;

            let num_aggressors = if base_period - k == 1 {
                1
            } else {
                params.n_sided.sample(base_period - k, &mut self.rng)
            };
            let cur_amplitude = params
                .amplitude
                .random_number_upper((base_period - k) / num_aggressors, &mut self.rng)
                .unwrap_or(1);

            let aggressors = self.get_n_aggressors(num_aggressors, params.num_aggressors);
            self.pattern.agg_access_patterns.push(AggressorAccessPattern {
                period: cur_period,
                amplitude: cur_amplitude,
                aggressors: aggressors.clone(),
                start_offset: k,
            });
            Self::fill_slots(
                k,
                cur_period,
                cur_amplitude,
                &aggressors,
                &mut self.pattern.access_ids,
            );

            // uncovered occurrences of this column get their own access
            // patterns with strictly nesting (larger or equal) periods
            while let Some(next_slot) =
                Self::find_first_empty(k, base_period, &self.pattern.access_ids)
            {
                let idx = self.random_gaussian_index(cur_multiplicators.len());
                let cur_m = cur_multiplicators[idx];
                Self::remove_smaller_than(&mut cur_multiplicators, cur_m);
                cur_period = base_period * cur_m;
                let aggressors = self.get_n_aggressors(num_aggressors, params.num_aggressors);
                self.pattern.agg_access_patterns.push(AggressorAccessPattern {
                    period: cur_period,
                    amplitude: cur_amplitude,
                    aggressors: aggressors.clone(),
                    start_offset: next_slot,
                });
                Self::fill_slots(
                    next_slot,
                    cur_period,
                    cur_amplitude,
                    &aggressors,
                    &mut self.pattern.access_ids,
                );
            }
        }

        debug!(
            "Generated {} access patterns over {} slots",
            self.pattern.agg_access_patterns.len(),
            self.pattern.access_ids.len()
        );
    }

    /// Sequential baseline: row-linear aggressor tuples appended in order
    /// until the pattern is full.
    pub fn generate_sequential_pattern(
        &mut self,
        params: &FuzzingParameterSet,
    ) -> Result<(), PatternBuildError> {
        info!(
            "Generating sequential hammering pattern {}",
            self.pattern.id
        );

        let pattern_length = params.total_acts_pattern;
        self.pattern.base_period = params.base_period;
        self.pattern.max_period = params.base_period;
        self.pattern.total_activations = pattern_length;
        self.pattern.num_refresh_intervals = params.num_refresh_intervals;
        self.pattern.access_ids = Vec::with_capacity(pattern_length);
        self.pattern.agg_access_patterns.clear();

        // carve the aggressor pool into tuples, smallest N first
        let mut tuples: Vec<Vec<Aggressor>> = vec![];
        let mut allocated = 0;
        let mut failed_tries = 0;
        while allocated < params.num_aggressors && failed_tries < MAX_TRIES {
            let n = params
                .n_sided
                .sample(params.num_aggressors - allocated, &mut self.rng);
            if n == 0 {
                failed_tries += 1;
                continue;
            }
            tuples.push(self.get_n_aggressors(n, params.num_aggressors));
            allocated += n;
        }
        if tuples.is_empty() {
            return Err(PatternBuildError::DoesNotFit {
                total_acts: pattern_length,
                num_aggressors: params.num_aggressors,
                tries: MAX_TRIES,
            });
        }

        // enforce agg_frequency on both ends: while tuples are still short
        // of their minimum appearance count, amplitude draws are clamped so
        // the remaining slots can still serve every tuple at least
        // agg_frequency.min times; the maximum caps appearances outright,
        // and once every tuple is at its cap the pattern simply ends shorter
        let min_required = allocated * params.agg_frequency.min;
        let mut accesses_until_min_freq = if pattern_length >= min_required {
            min_required
        } else {
            // the minimum cannot be met at all, do not steer towards it
            0
        };
        let mut appearances = vec![0usize; tuples.len()];
        let mut tuple_idx = 0;
        while self.pattern.access_ids.len() < pattern_length {
            if appearances.iter().all(|&c| c >= params.agg_frequency.max) {
                debug!(
                    "tuple frequency cap reached, pattern ends at {} of {} slots",
                    self.pattern.access_ids.len(),
                    pattern_length
                );
                break;
            }
            let idx = tuple_idx % tuples.len();
            tuple_idx += 1;
            if appearances[idx] >= params.agg_frequency.max {
                continue;
            }
            appearances[idx] += 1;
            let tuple = &tuples[idx];
            let remaining = pattern_length - self.pattern.access_ids.len();
            let mut amplitude_upper = remaining.div_ceil(tuple.len());
            if accesses_until_min_freq > 0 {
                amplitude_upper =
                    amplitude_upper.min((remaining / accesses_until_min_freq).max(1));
                if appearances[idx] <= params.agg_frequency.min {
                    accesses_until_min_freq =
                        accesses_until_min_freq.saturating_sub(tuple.len());
                }
            }
            let amplitude = params
                .amplitude
                .random_number_upper(amplitude_upper, &mut self.rng)
                .unwrap_or(1);
            let start_offset = self.pattern.access_ids.len();
            for _ in 0..amplitude {
                for agg in tuple {
                    if self.pattern.access_ids.len() == pattern_length {
                        break;
                    }
                    self.pattern.access_ids.push(*agg);
                }
            }
            self.pattern.agg_access_patterns.push(AggressorAccessPattern {
                period: pattern_length,
                amplitude,
                aggressors: tuple.clone(),
                start_offset,
            });
        }
        self.pattern.total_activations = self.pattern.access_ids.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{
        FencingStrategy, FlushingStrategy, FuzzingParameterSet, HammeringStrategy,
        NSidedDistribution, Range,
    };

    fn test_params(base_period: usize, num_refresh_intervals: usize) -> FuzzingParameterSet {
        FuzzingParameterSet {
            num_activations_per_ref: base_period,
            num_refresh_intervals,
            base_period,
            total_acts_pattern: base_period * num_refresh_intervals,
            n_sided: NSidedDistribution::new(vec![(1, 2), (2, 8)]),
            amplitude: Range::new(1, 7),
            agg_frequency: Range::new(1, 20),
            agg_inter_distance: 4,
            agg_intra_distance: 2,
            num_aggressors: 8,
            agg_rounds: 5,
            flushing_strategy: FlushingStrategy::EarliestPossible,
            fencing_strategy: FencingStrategy::LatestPossible,
            hammering_strategy: HammeringStrategy::Original,
            use_sequential_aggressors: false,
            sync_each_ref: true,
            wait_until_start_hammering_refs: 16,
            distance_to_sync_pair: 100,
        }
    }

    fn build_pattern(params: &FuzzingParameterSet, seed: u64) -> HammeringPattern {
        let mut pattern = HammeringPattern::new("test".into());
        let mut builder = PatternBuilder::new(&mut pattern, Rng::from_seed(seed));
        builder.build(params).expect("build");
        pattern
    }

    #[test]
    fn test_all_slots_filled() {
        let params = test_params(64, 4);
        let pattern = build_pattern(&params, 0x1234);
        assert_eq!(pattern.access_ids.len(), 256);
        assert!(pattern.access_ids.iter().all(|a| !a.is_placeholder()));
    }

    #[test]
    fn test_periods_are_power_of_two_multiples() {
        let params = test_params(64, 4);
        let pattern = build_pattern(&params, 0x1234);
        assert!(!pattern.agg_access_patterns.is_empty());
        assert_eq!(pattern.max_period, 256);
        for aap in &pattern.agg_access_patterns {
            assert!([64, 128, 256].contains(&aap.period), "period {}", aap.period);
            let m = aap.period / params.base_period;
            assert!(m.is_power_of_two());
        }
    }

    #[test]
    fn test_claimed_slots_disjoint_and_in_bounds() {
        let params = test_params(64, 8);
        let pattern = build_pattern(&params, 0xBEEF);
        let len = pattern.access_ids.len();
        let mut claimed = vec![false; len];
        for aap in &pattern.agg_access_patterns {
            let mut start = aap.start_offset;
            'outer: while start < len {
                for j in 0..aap.amplitude {
                    for (a, agg) in aap.aggressors.iter().enumerate() {
                        let target = start + aap.aggressors.len() * j + a;
                        if target >= len {
                            break 'outer;
                        }
                        assert!(!claimed[target], "slot {} claimed twice", target);
                        claimed[target] = true;
                        assert_eq!(pattern.access_ids[target], *agg);
                    }
                }
                start += aap.period;
            }
        }
        assert!(claimed.iter().all(|&c| c), "unclaimed slots remain");
    }

    #[test]
    fn test_same_seed_same_pattern() {
        let params = test_params(64, 4);
        let a = build_pattern(&params, 42);
        let b = build_pattern(&params, 42);
        assert_eq!(a.access_ids, b.access_ids);
        assert_eq!(a.agg_access_patterns, b.agg_access_patterns);
    }

    #[test]
    fn test_different_seed_different_pattern() {
        let params = test_params(64, 4);
        let a = build_pattern(&params, 1);
        let b = build_pattern(&params, 2);
        assert_ne!(a.access_ids, b.access_ids);
    }

    #[test]
    fn test_base_period_one() {
        // every slot becomes its own single-aggressor access pattern
        let mut params = test_params(1, 8);
        params.amplitude = Range::new(1, 1);
        let pattern = build_pattern(&params, 7);
        assert_eq!(pattern.access_ids.len(), 8);
        assert!(pattern.access_ids.iter().all(|a| !a.is_placeholder()));
        for aap in &pattern.agg_access_patterns {
            assert_eq!(aap.aggressors.len(), 1);
            assert_eq!(aap.amplitude, 1);
        }
    }

    #[test]
    fn test_single_n_sided_value() {
        let mut params = test_params(64, 2);
        params.n_sided = NSidedDistribution::new(vec![(2, 1)]);
        let pattern = build_pattern(&params, 3);
        for aap in &pattern.agg_access_patterns {
            // the final column can only hold a 1-sided tuple
            if aap.start_offset % params.base_period < params.base_period - 1 {
                assert_eq!(aap.aggressors.len(), 2);
            }
        }
    }

    #[test]
    fn test_sequential_variant_reaches_min_frequency() {
        let mut params = test_params(64, 4);
        params.use_sequential_aggressors = true;
        params.agg_frequency = Range::new(3, 20);
        let pattern = build_pattern(&params, 13);
        assert_eq!(pattern.access_ids.len(), 256);
        let mut counts = std::collections::HashMap::new();
        for agg in &pattern.access_ids {
            *counts.entry(*agg).or_insert(0usize) += 1;
        }
        for (agg, count) in counts {
            assert!(
                count >= params.agg_frequency.min,
                "aggressor {:?} appears only {} times",
                agg,
                count
            );
        }
    }

    #[test]
    fn test_aggressor_ids_within_pool() {
        let params = test_params(64, 4);
        let pattern = build_pattern(&params, 11);
        for agg in &pattern.access_ids {
            assert!(agg.id() < params.num_aggressors as u64);
        }
    }

    #[test]
    fn test_sequential_variant_fills() {
        let mut params = test_params(64, 4);
        params.use_sequential_aggressors = true;
        let a = build_pattern(&params, 5);
        let b = build_pattern(&params, 5);
        assert_eq!(a.access_ids.len(), 256);
        assert_eq!(a.total_activations, a.access_ids.len());
        assert!(a.access_ids.iter().all(|x| !x.is_placeholder()));
        assert_eq!(a.access_ids, b.access_ids);
    }
}

use crate::jitter::CodeJitter;
use crate::params::FuzzingParameterSet;
use crate::pattern::{Aggressor, AggressorAccessPattern};
use itertools::Itertools;
use log::{debug, info};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sledge_core::memory::{
    AggressorPtr, BitFlip, Checkable, DRAMAddr, DataPattern, MemConfiguration, VictimMemory,
};
use sledge_core::util::Rng;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors binding a pattern to concrete addresses.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The bank ran out of unused rows before all aggressors were placed.
    #[error("candidate rows exhausted: needed {needed}, bank has {available} rows")]
    CandidatesExhausted {
        /// Distinct aggressors requiring rows
        needed: usize,
        /// Rows available in the bank
        available: usize,
    },
    /// The pattern references an aggressor this mapping never bound.
    #[error("no address bound for aggressor {0}")]
    UnboundAggressor(u64),
}

/// Maps aggressor row identifiers to concrete DRAM addresses.
///
/// One pattern may be mapped multiple times (different banks and row
/// ranges); each mapping records the bit flips it produced. The owning
/// pattern is referenced by `pattern_id` and resolved through the fuzz
/// report.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PatternAddressMapper {
    /// Mapping identifier
    pub id: String,
    /// Identifier of the pattern this mapping belongs to
    pub pattern_id: String,
    /// Minimum row number used by this mapping
    pub min_row: usize,
    /// Maximum row number used by this mapping (exclusive)
    pub max_row: usize,
    /// Bank number all aggressors of this mapping live in
    pub bank_no: usize,
    /// Map from aggressor IDs to their DRAM addresses
    #[serde_as(as = "Vec<(_, _)>")]
    aggressor_to_addr: HashMap<Aggressor, DRAMAddr>,
    /// Rows adjacent to aggressor rows, checked for flips after hammering
    victim_rows: Vec<usize>,
    /// The two bank-colocated rows used as refresh-sync timing probes
    sync_rows: Vec<usize>,
    /// Bit flips detected per hammering run
    pub bit_flips: Vec<Vec<BitFlip>>,
    /// JIT parameters used to compile this mapping's hammer function
    pub code_jitter: CodeJitter,
}

impl PatternAddressMapper {
    /// Creates an empty mapping for the given pattern.
    pub fn new(pattern_id: String, code_jitter: CodeJitter, rng: &mut Rng) -> Self {
        PatternAddressMapper {
            id: format!("{:016x}", rng.random::<u64>()),
            pattern_id,
            min_row: 0,
            max_row: 0,
            bank_no: 0,
            aggressor_to_addr: HashMap::new(),
            victim_rows: vec![],
            sync_rows: vec![],
            bit_flips: vec![],
            code_jitter,
        }
    }

    /// Chooses fresh addresses for all aggressors of the referenced pattern.
    ///
    /// Walks the access patterns in order, placing each not-yet-bound
    /// aggressor `agg_inter_distance` rows after the previous tuple and
    /// `agg_intra_distance` rows after its tuple predecessor, wrapping at
    /// the bank's row count. Distinct aggressors always end up in distinct
    /// rows of the same bank. The draw sequence is fully determined by
    /// `rng`, so a mapping can be reproduced from its seed.
    ///
    /// # Errors
    ///
    /// Fails with [`MappingError::CandidatesExhausted`] if the bank has
    /// fewer free rows than the pattern has distinct aggressors.
    pub fn randomize_addresses(
        &mut self,
        params: &FuzzingParameterSet,
        agg_access_patterns: &[AggressorAccessPattern],
        mem_config: &MemConfiguration,
        rng: &mut Rng,
    ) -> Result<(), MappingError> {
        let row_count = mem_config.get_row_count();
        self.bank_no = rng.random_range(0..mem_config.get_bank_count());
        self.aggressor_to_addr.clear();
        self.victim_rows.clear();
        self.sync_rows.clear();

        let needed = agg_access_patterns
            .iter()
            .flat_map(|aap| aap.aggressors.iter())
            .unique()
            .count();
        // sync pair also needs two free rows
        if needed + 2 > row_count {
            return Err(MappingError::CandidatesExhausted {
                needed,
                available: row_count,
            });
        }

        let mut used_rows: HashSet<usize> = HashSet::new();
        let mut cur_row: usize = rng.random_range(0..row_count);

        let mut claim_row = |start: usize, used: &mut HashSet<usize>| -> usize {
            let mut row = start % row_count;
            while used.contains(&row) {
                row = (row + 1) % row_count;
            }
            used.insert(row);
            row
        };

        for aap in agg_access_patterns {
            for (i, agg) in aap.aggressors.iter().enumerate() {
                if self.aggressor_to_addr.contains_key(agg) {
                    continue;
                }
                let distance = if i == 0 {
                    params.agg_inter_distance
                } else {
                    params.agg_intra_distance
                };
                cur_row = claim_row(cur_row + distance, &mut used_rows);
                self.aggressor_to_addr
                    .insert(*agg, DRAMAddr::new(self.bank_no, cur_row, 0));
            }
        }

        self.min_row = self
            .aggressor_to_addr
            .values()
            .map(|a| a.row)
            .min()
            .unwrap_or(0);
        self.max_row = self
            .aggressor_to_addr
            .values()
            .map(|a| a.row)
            .max()
            .map(|r| r + 1)
            .unwrap_or(0);

        // sync probes go well past the aggressors so they never alias a row
        // the pattern hammers
        let first_sync = claim_row(cur_row + params.distance_to_sync_pair, &mut used_rows);
        let second_sync = claim_row(first_sync + params.agg_intra_distance, &mut used_rows);
        self.sync_rows = vec![first_sync, second_sync];

        self.victim_rows = self.compute_victim_rows(row_count);

        info!(
            "Mapped {} aggressors to bank {} rows [{}, {})",
            self.aggressor_to_addr.len(),
            self.bank_no,
            self.min_row,
            self.max_row
        );
        Ok(())
    }

    fn compute_victim_rows(&self, row_count: usize) -> Vec<usize> {
        let agg_rows: HashSet<usize> = self.aggressor_to_addr.values().map(|a| a.row).collect();
        agg_rows
            .iter()
            .flat_map(|&r| {
                [(r + row_count - 1) % row_count, (r + 1) % row_count].into_iter()
            })
            .filter(|r| !agg_rows.contains(r))
            .unique()
            .sorted()
            .collect()
    }

    /// Rows adjacent to any aggressor row of this mapping.
    pub fn victim_rows(&self) -> &[usize] {
        &self.victim_rows
    }

    /// Lowers the abstract access sequence into virtual addresses.
    ///
    /// Duplicates are preserved: every occurrence of an aggressor maps to
    /// the same address.
    pub fn export_pattern(
        &self,
        access_ids: &[Aggressor],
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
    ) -> Result<Vec<AggressorPtr>, MappingError> {
        access_ids
            .iter()
            .map(|agg| {
                self.aggressor_to_addr
                    .get(agg)
                    .map(|addr| addr.to_virt(base_msb, mem_config))
                    .ok_or(MappingError::UnboundAggressor(agg.id()))
            })
            .collect()
    }

    /// Virtual addresses of the sync probe rows.
    pub fn sync_addresses(
        &self,
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
    ) -> Vec<AggressorPtr> {
        self.sync_rows
            .iter()
            .map(|&row| DRAMAddr::new(self.bank_no, row, 0).to_virt(base_msb, mem_config))
            .collect()
    }

    /// Virtual addresses of the victim rows.
    pub fn victim_addresses(
        &self,
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
    ) -> Vec<AggressorPtr> {
        self.victim_rows
            .iter()
            .map(|&row| DRAMAddr::new(self.bank_no, row, 0).to_virt(base_msb, mem_config))
            .collect()
    }

    /// Draws rows in `[min_row, row_upper_bound)` that no aggressor of this
    /// mapping occupies. Used as additional victim candidates by the
    /// bit-flip scan.
    pub fn get_random_nonaccessed_rows(
        &self,
        row_upper_bound: usize,
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
        rng: &mut Rng,
    ) -> Vec<AggressorPtr> {
        let agg_rows: HashSet<usize> = self.aggressor_to_addr.values().map(|a| a.row).collect();
        let mut addresses = vec![];
        if row_upper_bound <= self.min_row {
            return addresses;
        }
        for _ in 0..1024 {
            let row = rng.random_range(self.min_row..row_upper_bound);
            if agg_rows.contains(&row) {
                continue;
            }
            addresses.push(DRAMAddr::new(self.bank_no, row, 0).to_virt(base_msb, mem_config));
        }
        addresses
    }

    /// Scans the victim rows (plus `extra_rows`) for bit flips against the
    /// data pattern the region was initialized with, and records the result.
    ///
    /// Returns the number of flips found in this scan.
    pub fn scan_victims<M: VictimMemory>(
        &mut self,
        memory: &M,
        pattern: DataPattern,
        extra_rows: &[AggressorPtr],
        base_msb: AggressorPtr,
        mem_config: MemConfiguration,
    ) -> usize {
        let mut rows = self.victim_addresses(base_msb, mem_config);
        rows.extend_from_slice(extra_rows);
        let flips = memory.check_rows(pattern, &rows);
        for flip in &flips {
            debug!(
                "Bit flip at {:#x}: {:?} ({:?})",
                flip.addr,
                flip,
                DRAMAddr::from_virt(flip.addr as AggressorPtr, &mem_config)
            );
        }
        let count = flips.len();
        self.bit_flips.push(flips);
        count
    }

    /// Returns the total number of bit flips recorded on this mapping.
    pub fn count_bitflips(&self) -> usize {
        self.bit_flips.iter().map(|b| b.len()).sum()
    }

    /// Moves the whole mapping into another bank, keeping the row layout.
    ///
    /// Used by replay to probe the same pattern geometry at a different
    /// physical location.
    pub fn relocate_to_bank(&mut self, bank_no: usize, mem_config: &MemConfiguration) {
        assert!(
            bank_no < mem_config.get_bank_count(),
            "bank {} out of range",
            bank_no
        );
        self.bank_no = bank_no;
        for addr in self.aggressor_to_addr.values_mut() {
            addr.bank = bank_no;
        }
    }
}

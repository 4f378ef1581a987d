use crate::mapper::PatternAddressMapper;
use crate::params::FuzzingParameterSet;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// Represents an aggressor row identifier in a hammering pattern.
///
/// Aggressors are rows that are repeatedly accessed to induce bit flips
/// in nearby victim rows. The ID is abstract; binding to a concrete DRAM
/// row happens in [`PatternAddressMapper`].
#[derive(Serialize, Deserialize, Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Aggressor(u64);

impl Aggressor {
    /// Marks a pattern slot that has not been assigned an aggressor yet.
    pub const PLACEHOLDER: Aggressor = Aggressor(u64::MAX);

    /// Creates an aggressor with the given ID.
    pub fn new(id: u64) -> Self {
        Aggressor(id)
    }

    /// Returns the raw aggressor ID.
    pub fn id(&self) -> u64 {
        self.0
    }

    /// Whether this is the unfilled-slot sentinel.
    pub fn is_placeholder(&self) -> bool {
        *self == Self::PLACEHOLDER
    }
}

/// One periodic component of a hammering pattern.
///
/// Within each window of length `base_period`, starting at column
/// `start_offset mod base_period`, the tuple is emitted `amplitude` times
/// back-to-back; the window repeats every `period` slots, where `period` is
/// a power-of-two multiple of the base period.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AggressorAccessPattern {
    /// Repetition period in pattern slots
    pub period: usize,
    /// Back-to-back repetitions of the tuple per occurrence
    pub amplitude: usize,
    /// The aggressor tuple, in access order
    pub aggressors: Vec<Aggressor>,
    /// First slot this access pattern occupies
    pub start_offset: usize,
}

/// An abstract hammering pattern over aggressor IDs.
///
/// Contains the flattened slot sequence, the periodic components it was
/// composed from, and the address mappings that bound it to memory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HammeringPattern {
    /// Unique identifier for this pattern
    pub id: String,
    /// Finest placement granularity, in activations
    pub base_period: usize,
    /// Largest period among the contained access patterns
    pub max_period: usize,
    /// Total number of row activations in this pattern
    pub total_activations: usize,
    /// Number of DRAM refresh intervals spanned
    pub num_refresh_intervals: usize,
    /// Aggressor row access sequence (one entry per activation)
    pub access_ids: Vec<Aggressor>,
    /// The periodic components this pattern was composed from
    pub agg_access_patterns: Vec<AggressorAccessPattern>,
    /// Address mappings tried for this pattern
    pub address_mappings: Vec<PatternAddressMapper>,
    /// The parameter set this pattern was generated from; needed to remap
    /// the pattern during replay
    #[serde(default)]
    pub params: Option<FuzzingParameterSet>,
}

impl HammeringPattern {
    /// Creates an empty pattern shell with the given identifier.
    pub fn new(id: String) -> Self {
        HammeringPattern {
            id,
            base_period: 0,
            max_period: 0,
            total_activations: 0,
            num_refresh_intervals: 0,
            access_ids: vec![],
            agg_access_patterns: vec![],
            address_mappings: vec![],
            params: None,
        }
    }

    /// Finds the address mapping with the most bit flips.
    pub fn determine_most_effective_mapping(&self) -> Option<&PatternAddressMapper> {
        self.address_mappings
            .iter()
            .max_by_key(|m| m.count_bitflips())
    }

    /// Finds an address mapping by its identifier.
    pub fn find_mapping(&self, mapping_id: &str) -> Option<&PatternAddressMapper> {
        self.address_mappings.iter().find(|m| m.id == mapping_id)
    }

    /// Total bit flips over all mappings of this pattern.
    pub fn count_bitflips(&self) -> usize {
        self.address_mappings
            .iter()
            .map(|m| m.count_bitflips())
            .sum()
    }
}

/// Errors that can occur when loading or storing fuzz reports.
#[derive(Debug, Error)]
pub enum ReportError {
    /// I/O error reading or writing the report file
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Pattern with the given ID not found
    #[error("Did not find pattern with id {0}")]
    PatternNotFound(String),
}

/// Container for the results of a fuzzing campaign.
///
/// This is the persisted form: patterns with their access sequences,
/// periodic components and address mappings round-trip losslessly through
/// JSON. It also acts as the registry resolving a mapping's `pattern_id`
/// back to its pattern.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct FuzzReport {
    /// ISO 8601 timestamp of the campaign run
    #[serde(default)]
    pub date: Option<String>,
    /// Campaign RNG seed, for reproduction
    #[serde(default)]
    pub seed: Option<u64>,
    /// CLI arguments the campaign ran with, for provenance
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    /// All hammering patterns generated during the campaign
    pub hammering_patterns: Vec<HammeringPattern>,
}

impl FuzzReport {
    /// Loads a report from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FuzzReport, ReportError> {
        let f = File::open(path)?;
        let reader = BufReader::new(f);
        let report: FuzzReport = serde_json::from_reader(reader)?;
        info!("Loaded {} hammering patterns", report.hammering_patterns.len());
        Ok(report)
    }

    /// Writes the report to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), ReportError> {
        let f = File::create(path)?;
        let writer = BufWriter::new(f);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Resolves a pattern by its instance ID.
    pub fn find_pattern(&self, pattern_id: &str) -> Result<&HammeringPattern, ReportError> {
        self.hammering_patterns
            .iter()
            .find(|p| p.id == pattern_id)
            .ok_or_else(|| ReportError::PatternNotFound(pattern_id.into()))
    }

    /// Returns the pattern with the most bit flips over all its mappings.
    pub fn most_effective_pattern(&self) -> Option<&HammeringPattern> {
        self.hammering_patterns
            .iter()
            .max_by_key(|p| p.count_bitflips())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder() {
        assert!(Aggressor::PLACEHOLDER.is_placeholder());
        assert!(!Aggressor::new(0).is_placeholder());
    }

    #[test]
    fn test_find_pattern_missing() {
        let report = FuzzReport::default();
        assert!(matches!(
            report.find_pattern("nope"),
            Err(ReportError::PatternNotFound(_))
        ));
    }
}

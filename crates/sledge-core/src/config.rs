use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Defines which address bits feed one DRAM mapping function.
///
/// Can specify a single bit or the XOR of multiple bits.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BitDef {
    /// Single bit function
    Single(u64),
    /// XOR of multiple bits
    Multi(Vec<u64>),
}

impl BitDef {
    /// Converts bit definition to a bitmask.
    pub fn to_bitstr(&self) -> usize {
        let mut res: usize = 0;
        match self {
            BitDef::Single(bit) => {
                res |= 1 << bit;
            }
            BitDef::Multi(bits) => {
                bits.iter().for_each(|bit| {
                    res |= 1 << bit;
                });
            }
        }
        res
    }
}

/// Errors that can occur when loading a DIMM configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Result type for DimmConfig constructors.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-DIMM configuration specifying DRAM geometry and timing parameters.
///
/// Loaded from JSON files containing the reverse-engineered addressing bit
/// functions of the module under test.
#[derive(Serialize, Deserialize)]
pub struct DimmConfig {
    /// Human-readable module identifier
    pub name: String,
    /// Timing threshold for bank conflict detection (in CPU cycles)
    pub threshold: u64,
    /// Address bits used for DRAM row selection
    pub row_bits: Vec<BitDef>,
    /// Address bits used for DRAM column selection
    pub col_bits: Vec<BitDef>,
    /// Address bits used for DRAM bank selection
    pub bank_bits: Vec<BitDef>,
}

impl DimmConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<DimmConfig> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: DimmConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MTX_SIZE, MemConfiguration};

    const CONFIG_JSON: &str = r#"{
        "name": "test-dimm",
        "threshold": 495,
        "bank_bits": [[16, 19], [15, 18], [14, 17], [6, 13]],
        "col_bits": [12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
        "row_bits": [29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17]
    }"#;

    #[test]
    fn test_parse_config() {
        let config: DimmConfig = serde_json::from_str(CONFIG_JSON).expect("parse");
        assert_eq!(config.threshold, 495);
        assert_eq!(
            MTX_SIZE,
            config.bank_bits.len() + config.col_bits.len() + config.row_bits.len()
        );
    }

    #[test]
    fn test_config_matches_builtin() {
        use crate::memory::MemConfigKey;
        let config: DimmConfig = serde_json::from_str(CONFIG_JSON).expect("parse");
        let from_file =
            MemConfiguration::from_bitdefs(config.bank_bits, config.row_bits, config.col_bits);
        let builtin =
            MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 1, 16)).unwrap();
        assert_eq!(from_file, builtin);
    }

    #[test]
    fn test_bank_function_period() {
        let config: DimmConfig = serde_json::from_str(CONFIG_JSON).expect("parse");
        let mem_config =
            MemConfiguration::from_bitdefs(config.bank_bits, config.row_bits, config.col_bits);
        assert_eq!(mem_config.bank_function_period(), 128);
    }
}

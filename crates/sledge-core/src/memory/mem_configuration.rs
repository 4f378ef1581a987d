use crate::config::BitDef;
use crate::util::ROW_SHIFT;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of DRAM addressing matrices
pub const MTX_SIZE: usize = 30;

/// DRAM addressing configuration.
///
/// Defines how addresses inside the hammering region map to the physical
/// DRAM organization (bank, row, column) using a pair of GF(2) bit matrices
/// that are inverses of each other.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemConfiguration {
    /// Bit shift for bank extraction
    pub bk_shift: usize,
    /// Bit mask for bank extraction
    pub bk_mask: usize,
    /// Bit shift for row extraction
    pub row_shift: usize,
    /// Bit mask for row extraction
    pub row_mask: usize,
    /// Bit shift for column extraction
    pub col_shift: usize,
    /// Bit mask for column extraction
    pub col_mask: usize,
    /// DRAM addressing matrix (virtual to DRAM)
    pub dram_mtx: [usize; MTX_SIZE],
    /// Address reconstruction matrix (DRAM to virtual)
    pub addr_mtx: [usize; MTX_SIZE],
    /// Maximum bank bit position
    pub max_bank_bit: u64,
}

/// Identifies a built-in DRAM geometry by its module population.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemConfigKey {
    /// Number of populated channels
    pub channels: usize,
    /// Number of DIMMs per channel
    pub dimms: usize,
    /// Number of ranks per DIMM
    pub ranks: usize,
    /// Number of banks per rank
    pub banks: usize,
}

impl MemConfigKey {
    /// Creates a config key from `(channels, dimms, ranks, banks)`.
    pub fn new(channels: usize, dimms: usize, ranks: usize, banks: usize) -> Self {
        MemConfigKey {
            channels,
            dimms,
            ranks,
            banks,
        }
    }
}

impl fmt::Display for MemConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}ch/{}dimm/{}rk/{}bk",
            self.channels, self.dimms, self.ranks, self.banks
        )
    }
}

impl MemConfiguration {
    /// Builds a configuration from per-function bit definitions.
    ///
    /// The DRAM matrix rows are laid out bank, column, row (highest result
    /// bits first), so `bk_shift`/`col_shift`/`row_shift` follow from the
    /// list lengths alone. The address matrix is computed as the inverse of
    /// the DRAM matrix.
    ///
    /// # Panics
    ///
    /// Panics if the bit definitions do not cover all [`MTX_SIZE`] result
    /// bits or do not form an invertible matrix. Both indicate a broken
    /// geometry config, not a runtime condition.
    pub fn from_bitdefs(
        bank_bits: Vec<BitDef>,
        row_bits: Vec<BitDef>,
        col_bits: Vec<BitDef>,
    ) -> Self {
        let mut out = MemConfiguration::default();
        let mut i = 0;

        assert_eq!(MTX_SIZE, bank_bits.len() + col_bits.len() + row_bits.len());

        out.bk_shift = MTX_SIZE - bank_bits.len();
        out.bk_mask = (1 << bank_bits.len()) - 1;
        out.col_shift = MTX_SIZE - bank_bits.len() - col_bits.len();
        out.col_mask = (1 << col_bits.len()) - 1;
        out.row_shift = MTX_SIZE - bank_bits.len() - col_bits.len() - row_bits.len();
        out.row_mask = (1 << row_bits.len()) - 1;
        out.max_bank_bit = bank_bits
            .iter()
            .map(|b| match b {
                BitDef::Single(bit) => *bit,
                BitDef::Multi(bits) => *bits.iter().max().unwrap(),
            })
            .max()
            .unwrap();

        // construct dram matrix
        let mut dram_mtx: [usize; MTX_SIZE] = [0; MTX_SIZE];
        let mut update_dram_mtx = |def: &BitDef| {
            dram_mtx[i] = def.to_bitstr();
            i += 1;
        };
        // bank
        bank_bits.iter().for_each(&mut update_dram_mtx);
        // col
        col_bits.iter().for_each(&mut update_dram_mtx);
        // row
        row_bits.iter().for_each(&mut update_dram_mtx);
        out.dram_mtx = dram_mtx;

        // construct addr matrix
        let mut addr_mtx: [usize; MTX_SIZE] = [0; MTX_SIZE];
        // create dram matrix in nalgebra
        let mut matrix = SMatrix::<u8, 30, 30>::zeros();
        for row in 0..MTX_SIZE {
            for col in 0..MTX_SIZE {
                matrix[(row, col)] = ((dram_mtx[row] >> (MTX_SIZE - col - 1)) & 1) as u8;
            }
        }
        // invert dram matrix, assign addr matrix
        let matrix_inv = matrix
            .cast::<f64>()
            .try_inverse()
            .expect("the configured DRAM matrix is not invertible")
            .try_cast::<i8>()
            .expect("inverse cast to i8 failed")
            .map(|e| e.abs());

        for row in 0..MTX_SIZE {
            for col in 0..MTX_SIZE {
                if matrix_inv[(row, col)] != 0 && matrix_inv[(row, col)] != 1 {
                    panic!(
                        "expected element to be 0 or 1, got {}",
                        matrix_inv[(row, col)]
                    );
                }
                addr_mtx[row] |= (matrix_inv[(row, col)] as usize) << (MTX_SIZE - col - 1);
            }
        }
        out.addr_mtx = addr_mtx;
        out
    }

    /// Looks up a built-in geometry by module population key.
    ///
    /// The bank functions are listed so that bit `i` of a decoded bank
    /// number corresponds to the `i`-th XOR function of the key's geometry.
    ///
    /// Returns `None` for populations without a built-in matrix pair; those
    /// require an explicit geometry config file.
    pub fn from_memconfig_key(key: MemConfigKey) -> Option<Self> {
        let single_desc = |hi: u64, lo: u64| (lo..=hi).rev().map(BitDef::Single).collect::<Vec<_>>();
        match (key.channels, key.dimms, key.ranks, key.banks) {
            // one single-rank DIMM, 16 banks: 13 row bits, 13 column bits,
            // 4 bank functions
            (1, 1, 1, 16) => Some(Self::from_bitdefs(
                vec![
                    BitDef::Multi(vec![16, 19]),
                    BitDef::Multi(vec![15, 18]),
                    BitDef::Multi(vec![14, 17]),
                    BitDef::Multi(vec![6, 13]),
                ],
                single_desc(29, 17),
                single_desc(12, 0),
            )),
            // one dual-rank DIMM, 16 banks per rank: 12 row bits, 13 column
            // bits, 5 bank functions (rank select folded into the bank bits)
            (1, 1, 2, 16) => Some(Self::from_bitdefs(
                vec![
                    BitDef::Multi(vec![17, 21]),
                    BitDef::Multi(vec![16, 20]),
                    BitDef::Multi(vec![15, 19]),
                    BitDef::Multi(vec![14, 18]),
                    BitDef::Multi(vec![6, 13]),
                ],
                single_desc(29, 18),
                single_desc(12, 0),
            )),
            _ => None,
        }
    }

    /// Returns the periodicity of the bank function in rows.
    ///
    /// Indicates how many rows must be iterated before the bank function repeats.
    pub fn bank_function_period(&self) -> u64 {
        1 << (self.max_bank_bit + 1 - ROW_SHIFT as u64)
    }
}

impl MemConfiguration {
    /// Returns the number of banks in this DRAM configuration.
    pub fn get_bank_count(&self) -> usize {
        (1 << self.bk_mask.count_ones()) as usize
    }

    /// Returns the number of rows in this DRAM configuration.
    pub fn get_row_count(&self) -> usize {
        1_usize << (self.row_mask.count_ones() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_single_rank_shape() {
        let cfg = MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 1, 16))
            .expect("built-in config");
        assert_eq!(cfg.bk_shift, 26);
        assert_eq!(cfg.bk_mask, 0b1111);
        assert_eq!(cfg.col_shift, 13);
        assert_eq!(cfg.row_shift, 0);
        assert_eq!(cfg.get_bank_count(), 16);
        assert_eq!(cfg.get_row_count(), 8192);
    }

    #[test]
    fn test_builtin_dual_rank_shape() {
        let cfg = MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 2, 16))
            .expect("built-in config");
        assert_eq!(cfg.bk_shift, 25);
        assert_eq!(cfg.get_bank_count(), 32);
        assert_eq!(cfg.get_row_count(), 4096);
    }

    #[test]
    fn test_unknown_key() {
        assert!(MemConfiguration::from_memconfig_key(MemConfigKey::new(2, 2, 2, 8)).is_none());
    }

    #[test]
    fn test_matrices_are_inverses() {
        // multiplying dram_mtx by addr_mtx over GF(2) must give the identity
        let cfg = MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 1, 16)).unwrap();
        for i in 0..MTX_SIZE {
            let mut row = 0usize;
            for j in 0..MTX_SIZE {
                let mut acc = 0;
                for k in 0..MTX_SIZE {
                    let a = (cfg.dram_mtx[i] >> (MTX_SIZE - k - 1)) & 1;
                    let b = (cfg.addr_mtx[k] >> (MTX_SIZE - j - 1)) & 1;
                    acc ^= a & b;
                }
                row |= acc << (MTX_SIZE - j - 1);
            }
            assert_eq!(row, 1 << (MTX_SIZE - i - 1), "row {} of product", i);
        }
    }
}

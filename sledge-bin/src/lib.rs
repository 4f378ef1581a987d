//! # Sledge
//!
//! Sledge is a DRAM Rowhammer fuzzer working in the frequency domain. It
//! composes hammering patterns out of periodic aggressor access patterns,
//! binds them to DRAM rows, compiles them to refresh-synchronized native
//! code, and scans neighboring rows for bit flips.
//!
//! ## Quickstart guide
//!
//! The fuzzer needs a 1 GB hugepage and the DRAM geometry of the module
//! under test:
//!
//! ```sh
//! # reserve a 1 GB hugepage (kernel boot parameters also work)
//! echo 1 | sudo tee /proc/sys/vm/nr_hugepages_1G 2>/dev/null \
//!   || echo 1 | sudo tee /sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages
//! sudo mkdir -p /dev/hugepages
//!
//! # run a two-minute fuzzing campaign
//! cargo run --release --bin=fuzz -- --config config/ddr4-1r-x16.json --runtime 120
//!
//! # replay the most effective pattern from the report
//! cargo run --release --bin=replay -- --report fuzz-report.json
//! ```
//!
//! ## Crates
//!
//! - `sledge-core`: memory model, DRAM address translation, measurement.
//! - `sledge-fuzzer`: parameters, pattern builder, address mapper, JIT.
//! - `sledge-hugepage`: hugepage-backed hammering region allocator.

use indicatif::{MultiProgress, ProgressStyle};
use indicatif_log_bridge::LogWrapper;

/// Initializes env_logger behind an indicatif progress multiplexer so that
/// log lines and progress bars do not interleave.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a name label.
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let mut fmt = name.to_string();
        for _ in 0..(32 - name.len() as i64 - 1) {
            fmt += " ";
        }
        fmt +=
            "{wide_bar:40.cyan/blue} {pos:>3}/{len:<3} [{elapsed_precise} ({eta} remaining)] {msg}";
        ProgressStyle::default_bar()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_bar())
    }
}

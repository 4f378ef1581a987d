use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use sledge_core::allocator::alloc_region;
use sledge_core::config::DimmConfig;
use sledge_core::memory::{
    AggressorPtr, BytePointer, DataPattern, Initializable, MemConfiguration,
};
use sledge_core::util::{Rng, Size};
use sledge_fuzzer::{FuzzReport, PatternHammerer};
use sledge_hugepage::HugepageAllocator;

/// CLI arguments for the `replay` binary.
#[derive(Debug, Parser)]
struct CliArgs {
    /// Fuzz report to replay from.
    #[clap(long = "report", default_value = "fuzz-report.json")]
    report: String,
    /// The DIMM geometry config file.
    #[clap(long = "config", default_value = "config/ddr4-1r-x16.json")]
    config: String,
    /// Pattern to replay; defaults to the most effective one.
    #[clap(long = "pattern-id")]
    pattern_id: Option<String>,
    /// Mapping to replay; defaults to the most effective one.
    #[clap(long = "mapping-id")]
    mapping_id: Option<String>,
    /// Redraw fresh addresses instead of reusing the stored mapping.
    #[clap(long = "remap")]
    remap: bool,
    /// Force the mapping into this bank.
    #[clap(long = "bank")]
    bank: Option<usize>,
    /// Hammer/scan repetitions.
    #[clap(long = "hammer-reps", default_value = "10")]
    hammer_reps: usize,
    /// RNG seed for remapping and data patterns.
    #[clap(long = "seed", default_value = "0")]
    seed: u64,
}

fn main() -> Result<()> {
    let _progress = sledge::init_logging_with_progress()?;
    let args = CliArgs::parse();

    let dimm_config = DimmConfig::from_jsonfile(&args.config)
        .with_context(|| format!("failed to load geometry config {}", args.config))?;
    let mem_config = MemConfiguration::from_bitdefs(
        dimm_config.bank_bits,
        dimm_config.row_bits,
        dimm_config.col_bits,
    );

    let report = FuzzReport::load(&args.report)?;
    let pattern = match &args.pattern_id {
        Some(id) => report.find_pattern(id)?,
        None => report
            .most_effective_pattern()
            .context("report contains no patterns")?,
    };
    info!("replaying pattern {}", pattern.id);

    let stored = match &args.mapping_id {
        Some(id) => pattern
            .find_mapping(id)
            .with_context(|| format!("no mapping {} in pattern {}", id, pattern.id))?,
        None => pattern
            .determine_most_effective_mapping()
            .context("pattern contains no mappings")?,
    };
    let mut mapping = stored.clone();
    mapping.bit_flips.clear();

    let params = pattern
        .params
        .clone()
        .context("report predates parameter persistence; cannot replay")?;

    let mut rng = Rng::from_seed(args.seed);
    if args.remap {
        mapping
            .randomize_addresses(&params, &pattern.agg_access_patterns, &mem_config, &mut rng)
            .context("remapping failed")?;
    }
    if let Some(bank) = args.bank {
        mapping.relocate_to_bank(bank, &mem_config);
        info!("relocated mapping to bank {}", bank);
    }

    let mut allocator = HugepageAllocator::default();
    let memory = alloc_region(&mut allocator, Size::GB(1))
        .context("failed to allocate the hammering region")?;
    let base_msb = memory.ptr() as AggressorPtr;

    let addresses = mapping.export_pattern(&pattern.access_ids, base_msb, mem_config)?;
    let sync_rows = mapping.sync_addresses(base_msb, mem_config);
    let warmup_rows = mapping.get_random_nonaccessed_rows(
        mem_config.get_row_count(),
        base_msb,
        mem_config,
        &mut rng,
    );

    let hammerer = PatternHammerer::new(
        mapping.code_jitter.clone(),
        addresses,
        sync_rows,
        warmup_rows,
        params.wait_until_start_hammering_refs,
        params.num_activations_per_ref,
    )?;

    use rand::Rng as _;
    use sledge_core::hammerer::Hammering;
    let mut total_flips = 0;
    for rep in 0..args.hammer_reps {
        let data_pattern = DataPattern::Random(Box::new(Rng::from_seed(rng.random())));
        memory.initialize(data_pattern.clone());
        hammerer.hammer()?;
        let extra_victims = mapping.get_random_nonaccessed_rows(
            mem_config.get_row_count(),
            base_msb,
            mem_config,
            &mut rng,
        );
        let flips = mapping.scan_victims(
            &memory,
            data_pattern,
            &extra_victims,
            base_msb,
            mem_config,
        );
        info!("replay round {}: {} bit flips", rep, flips);
        total_flips += flips;
    }

    info!(
        "replay done: {} bit flips over {} rounds",
        total_flips, args.hammer_reps
    );
    memory.dealloc();
    Ok(())
}

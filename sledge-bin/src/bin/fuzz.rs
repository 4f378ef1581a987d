use anyhow::{Context, Result};
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};
use serde::Serialize;
use sledge::NamedProgress;
use sledge_core::allocator::alloc_region;
use sledge_core::config::DimmConfig;
use sledge_core::hammerer::Hammering;
use sledge_core::memory::{
    AggressorPtr, BytePointer, DataPattern, Initializable, MemConfiguration, Memory,
};
use sledge_core::util::{Rng, Size};
use sledge_fuzzer::mapper::MappingError;
use sledge_fuzzer::{
    CodeJitter, DramAnalyzer, FuzzReport, FuzzingParameterSet, HammeringPattern,
    PatternAddressMapper, PatternBuilder, PatternHammerer,
};
use sledge_hugepage::HugepageAllocator;
use std::time::{Duration, Instant};

/// CLI arguments for the `fuzz` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The DIMM geometry config file.
    #[clap(long = "config", default_value = "config/ddr4-1r-x16.json")]
    config: String,
    /// Campaign runtime limit in seconds.
    #[clap(long = "runtime", default_value = "120")]
    runtime_s: u64,
    /// Address mappings (locations) probed per pattern.
    #[clap(long = "probes-per-pattern", default_value = "3")]
    probes_per_pattern: usize,
    /// Hammer/scan repetitions per mapping.
    #[clap(long = "hammer-reps", default_value = "5")]
    hammer_reps: usize,
    /// Measured activations per refresh interval; skips measurement.
    #[clap(long = "acts-per-ref")]
    acts_per_ref: Option<usize>,
    /// RNG seed for a reproducible campaign.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Output file for the fuzz report (JSON).
    #[clap(long = "output", default_value = "fuzz-report.json")]
    output: String,
    /// Skip the bank-conflict sanity check.
    #[clap(long = "skip-conflict-check")]
    skip_conflict_check: bool,
    /// Disable refresh-alignment tuning of the pattern length.
    #[clap(long = "no-tuning")]
    no_tuning: bool,
}

fn main() -> Result<()> {
    let progress = sledge::init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("starting fuzzing campaign with {:?}", args);

    let dimm_config = DimmConfig::from_jsonfile(&args.config)
        .with_context(|| format!("failed to load geometry config {}", args.config))?;
    info!("target module: {}", dimm_config.name);
    let threshold = dimm_config.threshold;
    let mem_config = MemConfiguration::from_bitdefs(
        dimm_config.bank_bits,
        dimm_config.row_bits,
        dimm_config.col_bits,
    );

    let mut allocator = HugepageAllocator::default();
    let memory = alloc_region(&mut allocator, Size::GB(1))
        .context("failed to allocate the hammering region")?;
    let base_msb = memory.ptr() as AggressorPtr;

    let analyzer = DramAnalyzer::new(base_msb, mem_config, threshold)?;
    if !args.skip_conflict_check {
        // a failed conflict check means the matrices do not fit the module;
        // fuzzing would hammer random banks, so stop here
        analyzer
            .verify_bank_conflicts()
            .context("bank conflict verification failed")?;
    }
    let acts_per_ref = match args.acts_per_ref {
        Some(acts) => acts,
        None => analyzer
            .count_acts_per_ref()
            .context("failed to measure activations per refresh interval")?,
    };
    info!("using {} activations per refresh interval", acts_per_ref);

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("campaign seed: {:#x}", seed);
    let mut rng = Rng::from_seed(seed);

    let mut report = FuzzReport {
        date: Some(chrono::Local::now().to_rfc3339()),
        seed: Some(seed),
        args: Some(serde_json::to_value(&args).context("failed to serialize CLI arguments")?),
        hammering_patterns: vec![],
    };

    let runtime = Duration::from_secs(args.runtime_s);
    let start = Instant::now();
    let bar = progress.add(ProgressBar::new(args.runtime_s));
    bar.set_style(indicatif::ProgressStyle::named_bar("Fuzzing"));

    let mut total_flips = 0usize;
    while start.elapsed() < runtime {
        bar.set_position(start.elapsed().as_secs());
        match fuzz_one_pattern(&args, &memory, mem_config, base_msb, acts_per_ref, &mut rng) {
            Ok(pattern) => {
                total_flips += pattern.count_bitflips();
                report.hammering_patterns.push(pattern);
                report
                    .store(&args.output)
                    .context("failed to write fuzz report")?;
            }
            Err(IterationError::Recoverable(msg)) => {
                warn!("fuzzing iteration abandoned: {}", msg);
            }
            Err(IterationError::Fatal(e)) => {
                memory.dealloc();
                return Err(e);
            }
        }
    }
    bar.finish();

    info!(
        "campaign done: {} patterns, {} bit flips, report written to {}",
        report.hammering_patterns.len(),
        total_flips,
        args.output
    );
    memory.dealloc();
    Ok(())
}

/// Error split per recovery policy: recoverable errors abandon the current
/// pattern and re-randomize, fatal errors abort the campaign.
enum IterationError {
    Recoverable(String),
    Fatal(anyhow::Error),
}

fn fuzz_one_pattern(
    args: &CliArgs,
    memory: &Memory,
    mem_config: MemConfiguration,
    base_msb: AggressorPtr,
    acts_per_ref: usize,
    rng: &mut Rng,
) -> Result<HammeringPattern, IterationError> {
    use rand::Rng as _;

    let params = FuzzingParameterSet::randomize(acts_per_ref, rng);
    let mut pattern = HammeringPattern::new(format!("{:016x}", rng.random::<u64>()));
    PatternBuilder::new(&mut pattern, rng.fork())
        .build(&params)
        .map_err(|e| IterationError::Recoverable(e.to_string()))?;
    pattern.params = Some(params.clone());

    for probe in 0..args.probes_per_pattern {
        let mut mapping =
            PatternAddressMapper::new(pattern.id.clone(), CodeJitter::new(&params), rng);
        match mapping.randomize_addresses(&params, &pattern.agg_access_patterns, &mem_config, rng)
        {
            Ok(()) => {}
            Err(e @ MappingError::CandidatesExhausted { .. }) => {
                // this bank cannot host the pattern; try the next location
                warn!("mapping {} failed: {}", probe, e);
                continue;
            }
            Err(e) => return Err(IterationError::Fatal(e.into())),
        }

        match hammer_mapping(args, memory, mem_config, base_msb, &params, &pattern, &mut mapping, rng)
        {
            Ok(flips) => {
                if flips > 0 {
                    info!(
                        "pattern {} mapping {} produced {} bit flips",
                        pattern.id, mapping.id, flips
                    );
                }
            }
            // JIT failures indicate a codegen bug; abort the campaign
            Err(e) => return Err(IterationError::Fatal(e)),
        }
        pattern.address_mappings.push(mapping);
    }
    Ok(pattern)
}

#[allow(clippy::too_many_arguments)]
fn hammer_mapping(
    args: &CliArgs,
    memory: &Memory,
    mem_config: MemConfiguration,
    base_msb: AggressorPtr,
    params: &FuzzingParameterSet,
    pattern: &HammeringPattern,
    mapping: &mut PatternAddressMapper,
    rng: &mut Rng,
) -> Result<usize> {
    use rand::Rng as _;

    let addresses = mapping.export_pattern(&pattern.access_ids, base_msb, mem_config)?;
    let sync_rows = mapping.sync_addresses(base_msb, mem_config);
    let warmup_rows =
        mapping.get_random_nonaccessed_rows(mem_config.get_row_count(), base_msb, mem_config, rng);

    let mut hammerer = PatternHammerer::new(
        mapping.code_jitter.clone(),
        addresses,
        sync_rows,
        warmup_rows,
        params.wait_until_start_hammering_refs,
        params.num_activations_per_ref,
    )?;

    let data_pattern = DataPattern::Random(Box::new(Rng::from_seed(rng.random())));
    if !args.no_tuning {
        memory.initialize(data_pattern.clone());
        let trailing = unsafe { hammerer.tune() }?;
        info!(
            "pattern length tuned: {} accesses, {} trailing probes",
            hammerer.sequence_len(),
            trailing
        );
    }

    let mut flips = 0;
    for _ in 0..args.hammer_reps {
        memory.initialize(data_pattern.clone());
        hammerer.hammer()?;
        let extra_victims = mapping.get_random_nonaccessed_rows(
            mem_config.get_row_count(),
            base_msb,
            mem_config,
            rng,
        );
        flips += mapping.scan_victims(
            memory,
            data_pattern.clone(),
            &extra_victims,
            base_msb,
            mem_config,
        );
    }
    // hammerer (and with it the jitted code pages) is released here, before
    // the next mapping emits its program
    Ok(flips)
}

//! End-to-end pipeline tests: parameters -> pattern -> mapping -> JIT ->
//! execution -> victim scan.
//!
//! The non-ignored tests run against a lazily backed anonymous region with
//! refresh synchronization disabled, so they work on any x86_64 Linux
//! machine. The sync-enabled variants need a real hammering setup and are
//! marked `#[ignore]`.

use sledge_core::hammerer::Hammering;
use sledge_core::memory::{
    AggressorPtr, BytePointer, DataPattern, Memory, MemConfigKey, MemConfiguration,
};
use sledge_core::util::{REGION_SHIFT, Rng};
use sledge_fuzzer::jitter::CodeJitter;
use sledge_fuzzer::params::FuzzingParameterSet;
use sledge_fuzzer::{HammeringPattern, PatternAddressMapper, PatternBuilder, PatternHammerer};

const REGION_SIZE: usize = 1 << REGION_SHIFT;

/// Maps a lazily-backed region and returns a 1 GiB-aligned window into it.
///
/// Only touched pages get committed, so the address scatter of a full
/// geometry stays cheap.
fn map_aligned_region() -> Memory {
    let len = 2 * REGION_SIZE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
    let aligned = (ptr as usize).next_multiple_of(REGION_SIZE);
    Memory::new(aligned as *mut u8, REGION_SIZE)
}

fn pipeline_fixture(
    seed: u64,
) -> (
    FuzzingParameterSet,
    HammeringPattern,
    PatternAddressMapper,
    MemConfiguration,
) {
    let mem_config = MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 1, 16)).unwrap();
    let mut rng = Rng::from_seed(seed);
    let mut params = FuzzingParameterSet::randomize(64, &mut rng);
    params.num_refresh_intervals = 4;
    params.total_acts_pattern = params.num_activations_per_ref * params.num_refresh_intervals;
    params.agg_rounds = 2;
    params.use_sequential_aggressors = false;

    let mut pattern = HammeringPattern::new(format!("{:016x}", seed));
    PatternBuilder::new(&mut pattern, rng.fork())
        .build(&params)
        .expect("build");

    let mut mapping =
        PatternAddressMapper::new(pattern.id.clone(), CodeJitter::new(&params), &mut rng);
    // sync probes are not usable without a real refresh signal
    mapping.code_jitter.num_aggs_for_sync = 0;
    mapping
        .randomize_addresses(&params, &pattern.agg_access_patterns, &mem_config, &mut rng)
        .expect("mapping");
    (params, pattern, mapping, mem_config)
}

#[test]
fn test_pipeline_hammer_and_scan() {
    let (params, pattern, mut mapping, mem_config) = pipeline_fixture(0x1234);
    let region = map_aligned_region();
    let base_msb = region.ptr() as AggressorPtr;

    let addresses = mapping
        .export_pattern(&pattern.access_ids, base_msb, mem_config)
        .expect("export");
    assert_eq!(addresses.len(), pattern.access_ids.len());
    for &addr in &addresses {
        let offset = addr as usize - base_msb as usize;
        assert!(offset < REGION_SIZE, "address escaped the region");
    }

    let hammerer = PatternHammerer::new(
        mapping.code_jitter.clone(),
        addresses,
        vec![],
        vec![],
        0,
        params.num_activations_per_ref,
    )
    .expect("hammerer");
    assert_eq!(
        hammerer.expected_activations(),
        params.num_refresh_intervals * 2 * pattern.access_ids.len()
    );
    hammerer.hammer().expect("hammer");

    // anonymous memory does not flip; the scan must come back clean and
    // the result must be recorded on the mapping
    let flips = mapping.scan_victims(&region, DataPattern::Zero, &[], base_msb, mem_config);
    assert_eq!(flips, 0);
    assert_eq!(mapping.bit_flips.len(), 1);
    assert_eq!(mapping.count_bitflips(), 0);
}

#[test]
fn test_pipeline_detects_seeded_flip() {
    // corrupt one victim row by hand; the scan pipeline must find exactly
    // that flip and attribute it to the right address
    let (_, _, mut mapping, mem_config) = pipeline_fixture(0x5678);
    let region = map_aligned_region();
    let base_msb = region.ptr() as AggressorPtr;

    let victims = mapping.victim_addresses(base_msb, mem_config);
    assert!(!victims.is_empty());
    let target = victims[0];
    unsafe { *(target as *mut u8).byte_add(3) = 0x20 };

    let flips = mapping.scan_victims(&region, DataPattern::Zero, &[], base_msb, mem_config);
    assert_eq!(flips, 1);
    let flip = mapping.bit_flips[0][0];
    assert_eq!(flip.addr, target as usize + 3);
    assert_eq!(flip.bitmask, 0x20);
}

#[test]
#[ignore]
fn test_pipeline_with_refresh_sync() {
    // requires a hugepage-backed region and a quiet core; the probe count
    // reflects how many sync accesses fit before each refresh
    env_logger::init();
    let (params, pattern, mut mapping, mem_config) = pipeline_fixture(0x1234);
    mapping.code_jitter.num_aggs_for_sync = 2;
    let region = map_aligned_region();
    let base_msb = region.ptr() as AggressorPtr;

    let addresses = mapping
        .export_pattern(&pattern.access_ids, base_msb, mem_config)
        .expect("export");
    let sync_rows = mapping.sync_addresses(base_msb, mem_config);
    let mut hammerer = PatternHammerer::new(
        mapping.code_jitter.clone(),
        addresses,
        sync_rows,
        vec![],
        0,
        params.num_activations_per_ref,
    )
    .expect("hammerer");

    let trailing = unsafe { hammerer.tune() }.expect("tune");
    assert!(trailing < params.num_activations_per_ref);
    hammerer.hammer().expect("hammer");
}

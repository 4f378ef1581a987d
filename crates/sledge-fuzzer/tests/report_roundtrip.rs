use sledge_core::memory::{MemConfigKey, MemConfiguration};
use sledge_core::util::Rng;
use sledge_fuzzer::jitter::CodeJitter;
use sledge_fuzzer::params::FuzzingParameterSet;
use sledge_fuzzer::{FuzzReport, HammeringPattern, PatternAddressMapper, PatternBuilder};

fn build_report(seed: u64) -> (FuzzReport, MemConfiguration) {
    let mem_config = MemConfiguration::from_memconfig_key(MemConfigKey::new(1, 1, 1, 16)).unwrap();
    let mut rng = Rng::from_seed(seed);
    let mut params = FuzzingParameterSet::randomize(64, &mut rng);
    params.use_sequential_aggressors = false;

    let mut pattern = HammeringPattern::new("pattern-under-test".into());
    PatternBuilder::new(&mut pattern, rng.fork())
        .build(&params)
        .expect("build");
    pattern.params = Some(params.clone());

    let mut mapping =
        PatternAddressMapper::new(pattern.id.clone(), CodeJitter::new(&params), &mut rng);
    mapping
        .randomize_addresses(&params, &pattern.agg_access_patterns, &mem_config, &mut rng)
        .expect("mapping");
    pattern.address_mappings.push(mapping);

    let report = FuzzReport {
        date: Some("2026-08-02T12:00:00+02:00".into()),
        seed: Some(seed),
        args: None,
        hammering_patterns: vec![pattern],
    };
    (report, mem_config)
}

#[test]
fn test_report_roundtrip_is_lossless() {
    let (report, mem_config) = build_report(0x1234);
    let path = std::env::temp_dir().join("sledge_report_roundtrip.json");
    report.store(&path).expect("store");
    let loaded = FuzzReport::load(&path).expect("load");
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.seed, report.seed);
    let orig = &report.hammering_patterns[0];
    let read = loaded.find_pattern("pattern-under-test").expect("pattern");

    // the access sequence must reproduce bit for bit
    assert_eq!(read.access_ids, orig.access_ids);
    assert_eq!(read.agg_access_patterns, orig.agg_access_patterns);
    assert_eq!(read.base_period, orig.base_period);
    assert_eq!(read.max_period, orig.max_period);
    assert_eq!(read.num_refresh_intervals, orig.num_refresh_intervals);

    // mappings keep their addresses: exporting from the loaded mapping
    // yields the same virtual address sequence
    let base = 0x40000000 as *const u8;
    let orig_addrs = orig.address_mappings[0]
        .export_pattern(&orig.access_ids, base, mem_config)
        .expect("export");
    let read_addrs = read.address_mappings[0]
        .export_pattern(&read.access_ids, base, mem_config)
        .expect("export");
    assert_eq!(orig_addrs, read_addrs);
    assert_eq!(
        read.address_mappings[0].bank_no,
        orig.address_mappings[0].bank_no
    );
    assert_eq!(
        read.address_mappings[0].min_row,
        orig.address_mappings[0].min_row
    );
    assert_eq!(
        read.address_mappings[0].max_row,
        orig.address_mappings[0].max_row
    );
}

#[test]
fn test_roundtripped_pattern_still_satisfies_invariants() {
    let (report, _) = build_report(0xCAFE);
    let json = serde_json::to_string(&report).expect("serialize");
    let loaded: FuzzReport = serde_json::from_str(&json).expect("deserialize");
    let pattern = &loaded.hammering_patterns[0];
    assert!(pattern.access_ids.iter().all(|a| !a.is_placeholder()));
    for aap in &pattern.agg_access_patterns {
        assert!(aap.start_offset < pattern.access_ids.len());
        assert!(aap.period.is_multiple_of(pattern.base_period));
    }
}

#[test]
fn test_two_builds_same_seed_identical() {
    let (a, _) = build_report(7);
    let (b, _) = build_report(7);
    assert_eq!(
        a.hammering_patterns[0].access_ids,
        b.hammering_patterns[0].access_ids
    );
}

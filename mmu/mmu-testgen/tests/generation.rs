use mmu_testgen::{
    Attributes, Config, ErrorKind, ErrorSpec, Flag, GeneratedCase, GenerationError,
    GenerationReport, Generator, PageRange, PageSize, PagingMode, PhysicalAddress, Probability,
    PteSpec, SatpSpec, Space, TestCaseSpec, VirtualAddress,
};

fn sv39() -> Config {
    Config::new(PagingMode::Sv39)
        .with_lower_bound(PhysicalAddress::new(0x8000_0000))
        .with_memory_size(0x1000_0000_u64)
}

fn run(config: Config, seed: u64) -> GenerationReport {
    Generator::new(config, seed).run().unwrap()
}

/// Check that the walk of `case` is what a hardware walker would follow.
fn assert_walk_consistent(case: &GeneratedCase) {
    let mode = case.mode;
    assert_eq!(case.entries.len(), mode.walk_len(case.pagesize).unwrap());

    let mut table = case.satp.root();
    for (i, entry) in case.entries.iter().enumerate() {
        assert_eq!(entry.table, table, "entry {i} of {case}");
        assert_eq!(entry.index, case.va.vpn(mode, entry.level));
        assert_eq!(entry.address, table + entry.index * mode.pte_bytes());
        if i + 1 < case.entries.len() {
            assert!(entry.pte.is_pointer(), "entry {i} of {case}");
            table = entry.pte.target(mode);
        }
    }

    assert_eq!(
        case.va.offset(case.pagesize),
        case.pa.offset(case.pagesize),
        "page offset of {case}"
    );

    let leaf = case.leaf().unwrap();
    assert_eq!(
        leaf.level,
        mode.leaf_level(case.pagesize).unwrap(),
        "leaf level of {case}"
    );
    if case.error.is_none() {
        assert!(leaf.pte.is_leaf());
        assert!(leaf.pte.flag(Flag::V));
        assert_eq!(leaf.pte.target(mode), case.pa.align_down(case.pagesize));
    }
}

#[test]
fn sv39_repeats_yield_independent_walks() {
    let config = sv39().with_test_cases(vec![TestCaseSpec::default().with_repeats(4_u32)]);
    let report = run(config, 2024);

    assert_eq!(report.cases.len(), 4);
    assert_eq!(report.failures().count(), 0);
    for case in report.generated() {
        assert_eq!(case.mode, PagingMode::Sv39);
        assert_eq!(case.pagesize, PageSize::Size4K);
        assert_eq!(case.entries.len(), 3);
        assert!(case.entries.iter().all(|e| !e.shared));
        assert_walk_consistent(case);
    }

    let vas: std::collections::BTreeSet<_> = report.generated().map(|c| c.va).collect();
    assert_eq!(vas.len(), 4);
}

#[test]
fn same_seed_same_output() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default().with_repeats(6_u32),
        TestCaseSpec::default()
            .with_pagesize(vec![PageSize::Size4K, PageSize::Size2M, PageSize::Size1G])
            .with_repeats(4_u32)
            .with_reuse_pte(0.5),
        TestCaseSpec::default()
            .with_errors(ErrorSpec::default().with_p(0.5))
            .with_repeats(4_u32),
    ]);

    let a = serde_json::to_string(&run(config.clone(), 99)).unwrap();
    let b = serde_json::to_string(&run(config.clone(), 99)).unwrap();
    assert_eq!(a, b);

    let c = serde_json::to_string(&run(config, 100)).unwrap();
    assert_ne!(a, c);
}

#[test]
fn reservations_never_overlap() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default().with_repeats(16_u32),
        TestCaseSpec::default()
            .with_pagesize(PageSize::Size2M)
            .with_repeats(8_u32),
    ]);
    let report = run(config, 5);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(cases.len(), 24);

    let span = |base: u64, size: PageSize| base..base + size.bytes();
    for (i, a) in cases.iter().enumerate() {
        let a_va = span(a.va.align_down(a.pagesize).as_u64(), a.pagesize);
        let a_pa = span(a.pa.align_down(a.pagesize).as_u64(), a.pagesize);
        for b in &cases[i + 1..] {
            let b_va = span(b.va.align_down(b.pagesize).as_u64(), b.pagesize);
            let b_pa = span(b.pa.align_down(b.pagesize).as_u64(), b.pagesize);
            assert!(a_va.end <= b_va.start || b_va.end <= a_va.start, "{a} / {b}");
            assert!(a_pa.end <= b_pa.start || b_pa.end <= a_pa.start, "{a} / {b}");
        }
    }

    // Table frames never share memory with data pages.
    for entry in report.generated().flat_map(|c| c.entries.iter()) {
        for case in &cases {
            let page = span(case.pa.align_down(case.pagesize).as_u64(), case.pagesize);
            assert!(!page.contains(&entry.table.as_u64()), "table {} inside {case}", entry.table);
        }
    }
}

#[test]
fn everything_stays_within_bounds() {
    let config = sv39()
        .with_pte_min(PhysicalAddress::new(0x8f00_0000))
        .with_pte_max(PhysicalAddress::new(0x8f10_0000))
        .with_test_cases(vec![TestCaseSpec::default().with_repeats(12_u32)]);
    let report = run(config, 8);
    assert_eq!(report.data, 0x8000_0000..0x9000_0000);
    assert_eq!(report.tables, 0x8f00_0000..0x8f10_0000);

    for case in report.generated() {
        assert!(report.data.contains(&case.pa.as_u64()));
        assert!(case.va.as_u64() < PagingMode::Sv39.va_limit());
        for entry in &case.entries {
            assert!(report.tables.contains(&entry.table.as_u64()));
        }
    }
    for entry in &report.page_tables {
        assert!(report.tables.contains(&entry.address.as_u64()));
    }
}

#[test]
fn forced_values_are_honored() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_satp(SatpSpec::default().with_ppn(0x8_0100_u64).with_asid(9_u16))
            .with_va(VirtualAddress::new(0x1234_5000))
            .with_pa(PhysicalAddress::new(0x8765_4000))
            .with_attributes(Attributes::from([
                (Flag::U, Probability::ALWAYS),
                (Flag::X, Probability::NEVER),
            ])),
    ]);
    let report = run(config, 13);
    let case = report.generated().next().unwrap();

    assert_eq!(case.satp.ppn, 0x8_0100);
    assert_eq!(case.satp.asid, 9);
    assert_eq!(case.va, VirtualAddress::new(0x1234_5000));
    assert_eq!(case.pa, PhysicalAddress::new(0x8765_4000));
    let leaf = case.leaf().unwrap().pte;
    assert!(leaf.flag(Flag::U));
    assert!(!leaf.flag(Flag::X));
    assert!(leaf.flag(Flag::R));
    assert_walk_consistent(case);
}

#[test]
fn forced_entry_addresses_fix_the_walk() {
    let config = sv39().with_test_cases(vec![TestCaseSpec::default().with_ptes(vec![
        PteSpec::default().with_address(PhysicalAddress::new(0x8000_0ff8)),
        PteSpec::default().with_address(PhysicalAddress::new(0x8000_1010)),
    ])]);
    let report = run(config, 21);
    let case = report.generated().next().unwrap();

    assert_eq!(case.satp.root(), PhysicalAddress::new(0x8000_0000));
    assert_eq!(case.entries[0].address, PhysicalAddress::new(0x8000_0ff8));
    assert_eq!(case.entries[1].address, PhysicalAddress::new(0x8000_1010));
    assert_eq!(case.va.vpn(PagingMode::Sv39, 2), 0x1ff);
    assert_eq!(case.va.vpn(PagingMode::Sv39, 1), 2);
    assert_walk_consistent(case);
}

#[test]
fn probability_edges_are_exact() {
    let never = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_repeats(8_u32)
            .with_attributes(Attributes::from([
                (Flag::G, Probability::NEVER),
                (Flag::D, Probability::ALWAYS),
            ]))
            .with_same_va_pa(0.0)
            .with_errors(ErrorSpec::default().with_p(0.0)),
    ]);
    for case in run(never, 31).generated() {
        let leaf = case.leaf().unwrap().pte;
        assert!(!leaf.flag(Flag::G));
        assert!(leaf.flag(Flag::D));
        assert_eq!(case.error, None);
    }

    let always = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_repeats(8_u32)
            .with_same_va_pa(1.0)
            .with_errors(ErrorSpec::default().with_p(1.0)),
    ]);
    let report = run(always, 31);
    assert_eq!(report.generated().count(), 8);
    for case in report.generated() {
        assert_eq!(case.va.as_u64(), case.pa.as_u64());
        assert!(case.error.is_some());
    }
}

#[test]
fn superpages_are_aligned_and_shallow() {
    let config = Config::new(PagingMode::Sv48)
        .with_lower_bound(PhysicalAddress::new(0x8000_0000))
        .with_memory_size(0x1_0000_0000_u64)
        .with_pte_max(PhysicalAddress::new(0x8010_0000))
        .with_test_cases(vec![
            TestCaseSpec::default().with_pagesize(PageSize::Size1G).with_repeats(2_u32),
            TestCaseSpec::default().with_pagesize(PageSize::Size2M).with_repeats(3_u32),
        ]);
    let report = run(config, 17);
    assert_eq!(report.generated().count(), 5);

    for case in report.generated() {
        assert!(case.pa.is_aligned(case.pagesize));
        assert!(case.va.is_aligned(case.pagesize));
        let expected = match case.pagesize {
            PageSize::Size2M => 3,
            PageSize::Size1G => 2,
            other => panic!("unexpected page size {other}"),
        };
        assert_eq!(case.entries.len(), expected);
        assert_walk_consistent(case);
    }
}

#[test]
fn injected_errors_only_touch_the_leaf() {
    let cases = |p: f64| {
        sv39().with_test_cases(vec![
            TestCaseSpec::default()
                .with_repeats(6_u32)
                .with_errors(ErrorSpec::default().with_p(p).with_types(vec![ErrorKind::MarkInvalid])),
        ])
    };
    let clean = run(cases(0.0), 77);
    let broken = run(cases(1.0), 77);

    for (good, bad) in clean.generated().zip(broken.generated()) {
        assert_eq!(good.error, None);
        assert_eq!(bad.error, Some(ErrorKind::MarkInvalid));
        assert_eq!(good.va, bad.va);
        assert_eq!(good.pa, bad.pa);
        assert_eq!(good.satp, bad.satp);
        assert_eq!(good.pointers(), bad.pointers());

        let (g, b) = (good.leaf().unwrap(), bad.leaf().unwrap());
        assert_eq!(g.address, b.address);
        assert_eq!(g.pte.with_flag(Flag::V, false), b.pte);
    }
    assert_eq!(clean.page_tables.len(), broken.page_tables.len());
}

#[test]
fn reused_pointers_are_shared_unchanged() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default(),
        TestCaseSpec::default().with_reuse_pte(1.0).with_repeats(3_u32),
    ]);
    let report = run(config, 3);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(cases.len(), 4);

    let first = cases[0];
    for case in &cases[1..] {
        assert_eq!(case.satp.root(), first.satp.root());
        let shared: Vec<_> = case.entries.iter().filter(|e| e.shared).collect();
        assert!(!shared.is_empty(), "{case}");
        assert!(case.entries[0].shared);
        assert!(!case.leaf().unwrap().shared);
        for entry in shared {
            let stored = report
                .page_tables
                .iter()
                .find(|t| t.address == entry.address)
                .unwrap();
            assert_eq!(stored.pte, entry.pte);
        }
        assert_walk_consistent(case);
    }
}

#[test]
fn reused_roots_keep_their_entries() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default(),
        TestCaseSpec::default().with_reuse_satp(1.0).with_repeats(3_u32),
    ]);
    let report = run(config, 6);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(cases.len(), 4);

    let first = cases[0];
    for case in &cases[1..] {
        assert_eq!(case.satp.root(), first.satp.root());
        assert_walk_consistent(case);
    }
    for entry in &first.entries {
        let stored = report
            .page_tables
            .iter()
            .find(|t| t.address == entry.address)
            .unwrap();
        assert_eq!(stored.pte, entry.pte);
    }
}

#[test]
fn aliasing_maps_a_page_twice() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default(),
        TestCaseSpec::default().with_aliasing(1.0),
    ]);
    let report = run(config, 12);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(cases.len(), 2);
    assert!(!cases[0].aliased);
    assert!(cases[1].aliased);
    assert_eq!(cases[0].pa, cases[1].pa);
    assert_ne!(cases[0].va, cases[1].va);
}

#[test]
fn conflicting_requests_fail_alone() {
    let va = VirtualAddress::new(0x4000_0000);
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default().with_va(va),
        TestCaseSpec::default().with_va(va),
        TestCaseSpec::default().with_repeats(2_u32),
    ]);
    let report = run(config, 1);
    assert_eq!(report.cases.len(), 4);
    assert_eq!(report.generated().count(), 3);

    let failure = report.failures().next().unwrap();
    assert_eq!(failure.ordinal, 1);
    assert!(matches!(
        failure.error,
        GenerationError::AddressConflict { space: Space::Virtual, .. }
    ));
    assert!(failure.to_string().starts_with("request #1"));
}

#[test]
fn json_config_end_to_end() {
    let config: Config = serde_json::from_str(
        r#"{
            "mode": "Sv32",
            "lower_bound": "0x8000_0000",
            "memory_size": "0x0100_0000",
            "pte_min": "0x8080_0000",
            "pte_max": "0x8090_0000",
            "satp": { "ppn": 526336, "asid": 1 },
            "test_cases": [
                {
                    "page_range": { "start": "0x8040_0000", "num_pages": 4 },
                    "special": [{ "index": 2, "attributes": { "X": 1 } }]
                },
                { "pagesize": "4M", "pa": "0x80c0_0000" },
                { "repeats": 3, "attributes": { "U": 1, "A": 1, "D": 0 } },
                { "errors": { "types": ["write_no_read", "leaf_as_pointer"], "weights": [1, 0] } }
            ]
        }"#,
    )
    .unwrap();

    let report = run(config, 0);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(report.failures().count(), 0);
    assert_eq!(cases.len(), 9);

    for case in &cases {
        assert_eq!(case.satp.ppn, 0x8_0800);
        assert_eq!(case.satp.asid, 1);
    }

    let range: Vec<u64> = cases[..4].iter().map(|c| c.pa.as_u64()).collect();
    assert_eq!(range, [0x8040_0000, 0x8040_1000, 0x8040_2000, 0x8040_3000]);
    assert!(cases[2].leaf().unwrap().pte.flag(Flag::X));

    assert_eq!(cases[4].pagesize, PageSize::Size4M);
    assert_eq!(cases[4].entries.len(), 1);
    assert_eq!(cases[4].pa, PhysicalAddress::new(0x80c0_0000));

    for case in &cases[5..8] {
        let leaf = case.leaf().unwrap().pte;
        assert!(leaf.flag(Flag::U) && leaf.flag(Flag::A) && !leaf.flag(Flag::D));
    }
    for case in &cases[..8] {
        assert_walk_consistent(case);
    }

    assert_eq!(cases[8].error, Some(ErrorKind::WriteNoRead));
    assert_eq!(cases[8].leaf().unwrap().pte.xwr() & 0b011, 0b010);

    let text = report.to_string();
    assert!(text.starts_with("Mode: Sv32"));
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["cases"].as_array().unwrap().len(), 9);
}

#[test]
fn repeated_root_and_va_walk_the_same_mapping() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_satp(SatpSpec::default().with_ppn(0x8_0100_u64))
            .with_va(VirtualAddress::new(0xf00f_b00f))
            .with_repeats(2_u32),
    ]);
    let report = run(config, 5);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(report.failures().count(), 0);
    assert_eq!(cases.len(), 2);

    assert_eq!(cases[0].va, cases[1].va);
    assert_eq!(cases[0].pa, cases[1].pa);
    assert!(cases[0].entries.iter().all(|e| !e.shared));
    assert!(cases[1].entries.iter().all(|e| e.shared));
    for (first, again) in cases[0].entries.iter().zip(&cases[1].entries) {
        assert_eq!((first.address, first.pte), (again.address, again.pte));
    }
    assert_eq!(report.page_tables.len(), 3);
    for case in &cases {
        assert_walk_consistent(case);
    }
}

#[test]
fn superpage_leaves_are_never_misaligned() {
    let config = sv39()
        .with_pte_min(PhysicalAddress::new(0x8f00_0000))
        .with_test_cases(vec![
            TestCaseSpec::default()
                .with_pagesize(PageSize::Size2M)
                .with_pa(PhysicalAddress::new(0x8000_1000)),
            TestCaseSpec::default()
                .with_pagesize(PageSize::Size2M)
                .with_page_range(
                    PageRange::default()
                        .with_start(PhysicalAddress::new(0x8800_3000))
                        .with_num_pages(2_u64),
                ),
            TestCaseSpec::default()
                .with_pagesize(vec![PageSize::Size4K, PageSize::Size2M])
                .with_page_range(
                    PageRange::default()
                        .with_start(PhysicalAddress::new(0x8900_3000))
                        .with_num_pages(4_u64),
                ),
        ]);
    let report = run(config, 11);
    assert_eq!(report.cases.len(), 7);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 3);
    for failure in &failures {
        assert!(failure.spec_index < 2);
        assert!(matches!(
            failure.error,
            GenerationError::MisalignedSuperpage { size: PageSize::Size2M, .. }
        ));
    }
    for case in report.generated() {
        assert_eq!(case.pagesize, PageSize::Size4K);
        assert_walk_consistent(case);
    }
}

#[test]
fn fixed_offsets_carry_to_the_other_address() {
    let config = sv39()
        .with_pte_min(PhysicalAddress::new(0x8f00_0000))
        .with_test_cases(vec![
            TestCaseSpec::default()
                .with_pagesize(PageSize::Size2M)
                .with_pa(PhysicalAddress::new(0x8120_0567)),
            TestCaseSpec::default().with_va(VirtualAddress::new(0x4000_1234)),
            TestCaseSpec::default()
                .with_va(VirtualAddress::new(0x4080_0123))
                .with_pa(PhysicalAddress::new(0x8300_0456)),
        ]);
    let report = run(config, 19);

    let va_fixed = report.cases[1].as_ref().unwrap();
    assert_eq!(va_fixed.pa.offset(PageSize::Size4K), 0x234);
    assert_walk_consistent(va_fixed);

    let pa_fixed = report.cases[0].as_ref().unwrap();
    assert_eq!(pa_fixed.pa, PhysicalAddress::new(0x8120_0567));
    assert_eq!(pa_fixed.va.offset(PageSize::Size2M), 0x567);
    assert_walk_consistent(pa_fixed);

    let failure = report.cases[2].as_ref().unwrap_err();
    assert_eq!(
        failure.error,
        GenerationError::OffsetMismatch {
            va: 0x4080_0123,
            pa: 0x8300_0456,
        }
    );
}

#[test]
fn global_nonglobal_marks_the_deepest_own_pointer() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_repeats(4_u32)
            .with_attributes(Attributes::from([(Flag::G, Probability::ALWAYS)]))
            .with_errors(ErrorSpec::default().with_types(vec![ErrorKind::GlobalNonglobal])),
    ]);
    let report = run(config, 23);
    assert_eq!(report.generated().count(), 4);

    for case in report.generated() {
        assert_eq!(case.error, Some(ErrorKind::GlobalNonglobal));
        let pointer = case.pointers().iter().rev().find(|e| !e.shared).unwrap();
        assert!(pointer.pte.global(), "{case}");
        assert!(!case.leaf().unwrap().pte.global(), "{case}");
        let stored = report
            .page_tables
            .iter()
            .find(|t| t.address == pointer.address)
            .unwrap();
        assert_eq!(stored.pte, pointer.pte);
    }
}

#[test]
fn uncleared_superpage_sets_low_ppn_bits() {
    let config = sv39().with_test_cases(vec![
        TestCaseSpec::default()
            .with_pagesize(PageSize::Size2M)
            .with_repeats(3_u32)
            .with_errors(ErrorSpec::default().with_types(vec![ErrorKind::UnclearedSuperpage])),
        TestCaseSpec::default()
            .with_errors(ErrorSpec::default().with_types(vec![ErrorKind::UnclearedSuperpage])),
    ]);
    let report = run(config, 29);
    assert_eq!(report.cases.len(), 4);

    for case in report.generated() {
        assert_eq!(case.error, Some(ErrorKind::UnclearedSuperpage));
        let leaf = case.leaf().unwrap().pte;
        assert!(leaf.is_leaf());
        assert_ne!(leaf.ppn_field(PagingMode::Sv39, 0), 0, "{case}");
        assert!(case.pa.is_aligned(PageSize::Size2M));
    }
    let failure = report.cases[3].as_ref().unwrap_err();
    assert_eq!(failure.error, GenerationError::NoApplicableError);
}

#[test]
fn dotted_satp_keys_and_partial_addresses() {
    let config: Config = serde_json::from_str(
        r#"{
            "mode": "Sv39",
            "lower_bound": "0x8000_0000",
            "memory_size": "0x1000_0000",
            "satp.ppn": "0x80100",
            "satp.asid": 5,
            "test_cases": [
                { "repeats": 2 },
                { "satp.ppn": "0x80200", "va": { "vpn": [null, 3], "offset": "0x10" } },
                { "errors": { "mark_invalid": 1, "write_no_read": 0 } }
            ]
        }"#,
    )
    .unwrap();

    let report = run(config, 3);
    let cases: Vec<&GeneratedCase> = report.generated().collect();
    assert_eq!(report.failures().count(), 0);
    assert_eq!(cases.len(), 4);

    for case in [cases[0], cases[1], cases[3]] {
        assert_eq!(case.satp.ppn, 0x8_0100);
        assert_eq!(case.satp.asid, 5);
    }
    assert_eq!(cases[2].satp.ppn, 0x8_0200);
    assert_eq!(cases[2].va.vpn(PagingMode::Sv39, 1), 3);
    assert_eq!(cases[2].va.offset(PageSize::Size4K), 0x10);
    assert_eq!(cases[2].pa.offset(PageSize::Size4K), 0x10);
    assert_eq!(cases[3].error, Some(ErrorKind::MarkInvalid));
    for case in &cases[..3] {
        assert_walk_consistent(case);
    }
}

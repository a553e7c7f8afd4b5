use mheap_harness::churn::{ChurnConfig, ChurnSpace, run_churn};
use mheap_harness::structured_log::{LogEmitter, LogEntry, validate_log_line};
use mheap_harness::{HarnessError, run_all, run_scenario, scenario_names};

#[test]
fn every_scenario_passes() {
    let reports = run_all().expect("scenarios run");
    assert_eq!(reports.len(), scenario_names().count());
    for report in &reports {
        let failed: Vec<String> = report
            .failed_checks()
            .iter()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect();
        assert!(report.passed, "{} failed: {failed:?}", report.name);
        assert!(!report.checks.is_empty(), "{} ran no checks", report.name);
    }
}

#[test]
fn unknown_scenario_is_an_error() {
    assert!(matches!(
        run_scenario("no-such-scenario"),
        Err(HarnessError::UnknownScenario(name)) if name == "no-such-scenario"
    ));
}

#[test]
fn heap_scenarios_report_footprint_and_decisions() {
    let report = run_scenario("out-of-memory").expect("run");
    let footprint = report.footprint.expect("footprint");
    assert_eq!(footprint.growth_limit, 1024 * 1024);
    assert!(report.heap_log.iter().any(|r| r.event == "oom"));
}

#[test]
fn forwarded_scenario_log_validates() {
    let report = run_scenario("large-object-fallback").expect("run");
    let mut emitter = LogEmitter::to_buffer("test");
    for record in &report.heap_log {
        emitter
            .emit_entry(LogEntry::from_heap_record(record).with_scenario(report.name))
            .expect("emit");
    }
    let out = String::from_utf8(emitter.into_inner().expect("flush")).expect("utf8");
    let mut lines = 0;
    for (i, line) in out.lines().enumerate() {
        let entry = validate_log_line(line, i + 1).unwrap_or_else(|e| panic!("{e:?}"));
        assert_eq!(entry.scenario.as_deref(), Some("large-object-fallback"));
        lines += 1;
    }
    assert_eq!(lines, report.heap_log.len());
    assert!(out.contains("large_object_fallback"));
}

#[test]
fn churn_is_deterministic_per_seed() {
    for space in [ChurnSpace::Map, ChurnSpace::FreeList] {
        let config = ChurnConfig::new(space, 2_000, 0x5EED);
        let first = run_churn(&config).expect("churn");
        let second = run_churn(&config).expect("churn");
        assert_eq!(first, second, "{space:?}");
        assert_eq!(first.allocations + first.refused + first.frees, 2_000);
        assert!(first.peak_bytes >= first.final_bytes);

        let other = run_churn(&ChurnConfig::new(space, 2_000, 0x5EED + 1)).expect("churn");
        assert_ne!(first.sequence_sha256, other.sequence_sha256, "{space:?}");
    }
}

#[test]
fn free_list_churn_audits_every_step() {
    let config = ChurnConfig {
        capacity_pages: 32,
        ..ChurnConfig::new(ChurnSpace::FreeList, 1_000, 7)
    };
    let report = run_churn(&config).expect("churn");
    assert_eq!(report.invariant_checks, 1_000);
    assert!(report.refused > 0, "a 32-page region must refuse some requests");
}

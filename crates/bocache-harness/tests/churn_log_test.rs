use std::path::PathBuf;

use bocache_core::{BoFlags, BoLogLevel, Device, DeviceConfig, ManualClock, SimBackend};
use bocache_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, sha256_hex, validate_log_file,
};
use bocache_harness::{ChurnConfig, ChurnReport, Workload};

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "bocache-harness-{}-{name}",
        std::process::id()
    ))
}

#[test]
fn lifecycle_records_convert_to_valid_entries() {
    let config = DeviceConfig {
        log_level: BoLogLevel::Trace,
        ..DeviceConfig::default()
    };
    let dev = Device::with_clock(SimBackend::new(), ManualClock::new(0), config);
    let bo = dev.create(5000, 0, BoFlags::NONE, "Entry").unwrap();
    dev.unreference(&bo);

    let records = dev.drain_lifecycle_logs();
    let put = records.iter().find(|r| r.event == "cache_put").unwrap();
    let entry = LogEntry::from(put);
    assert_eq!(entry.trace_id, put.trace_id);
    assert_eq!(entry.level, LogLevel::Trace);
    assert_eq!(entry.op.as_deref(), Some("unreference"));
    assert_eq!(entry.handle, Some(bo.handle()));
    assert_eq!(entry.size, Some(8192));
    assert_eq!(entry.bucket, Some(1));
    assert_eq!(entry.cached_bytes, Some(8192));
    assert_eq!(entry.decision_id, Some(put.decision_id));

    let line = entry.to_jsonl().unwrap();
    let validated = bocache_harness::structured_log::validate_log_line(&line, 1).unwrap();
    assert_eq!(validated.event, "cache_put");
}

#[test]
fn churn_log_file_validates() {
    let path = scratch_path("churn.jsonl");
    let mut workload = Workload::new(ChurnConfig {
        seed: 21,
        ops: 1_500,
        tick_every: 50,
        keep_logs: true,
        ..ChurnConfig::default()
    });
    let mut emitter = LogEmitter::to_file(&path, "churn-test").unwrap();
    emitter.emit(LogLevel::Info, "run_start").unwrap();
    for _ in 0..1_500 {
        workload.step().unwrap();
        for record in workload.take_records() {
            emitter.emit_record(&record).unwrap();
        }
    }
    workload.release_all();
    for record in workload.take_records() {
        emitter.emit_record(&record).unwrap();
    }
    emitter.flush().unwrap();
    let written = emitter.lines();
    drop(emitter);

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(lines, written);
    assert!(lines > 1, "churn should produce lifecycle records");

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"op\":\"evict_stale\""));

    let mut index = ArtifactIndex::new("churn-test");
    index.add_file(&path, "log").unwrap();
    assert_eq!(index.artifacts[0].sha256, sha256_hex(content.as_bytes()));
    assert_eq!(index.artifacts[0].size_bytes, Some(content.len() as u64));

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn validate_log_file_reports_bad_lines() {
    let path = scratch_path("bad.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"bocache::x::001","level":"info","event":"ok"}"#,
            "\n\n",
            r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"bocache::x::002","level":"loud","event":"bad"}"#,
            "\n",
        ),
    )
    .unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 2);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_number, 3);
    assert_eq!(errors[0].field, "level");

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn churn_report_serializes_for_tooling() {
    let mut workload = Workload::new(ChurnConfig {
        seed: 4,
        ops: 500,
        ..ChurnConfig::default()
    });
    workload.run().unwrap();
    let report = workload.report();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["seed"], 4);
    assert_eq!(json["ops"], 500);
    assert_eq!(
        json["final_stats"]["bucket_counts"].as_array().unwrap().len(),
        bocache_core::NR_BO_CACHE_BUCKETS
    );
    assert!(json.get("log_sha256").is_none());

    let restored: ChurnReport = serde_json::from_value(json).unwrap();
    assert_eq!(restored, report);
}

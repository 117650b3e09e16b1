use refinery_harness::run::{
    DocumentStatus, JsonlTimelineSink, TimelineEvent, TimelineEventKind, TimelineSink,
};
use tempfile::tempdir;

fn make_event(document_id: &str, seq: u64) -> TimelineEvent {
    TimelineEvent {
        document_id: document_id.to_string(),
        seq,
        phase: DocumentStatus::Generating,
        kind: TimelineEventKind::VariantGenerated,
        message: format!("variant {seq}"),
        elapsed_ms: seq * 10,
        timestamp_ms: 0,
    }
}

#[test]
fn jsonl_timeline_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("timeline.jsonl");

    let (sink, worker) = JsonlTimelineSink::new(&path).unwrap();
    sink.record(&make_event("d1", 0)).unwrap();
    sink.record(&make_event("d2", 0)).unwrap();
    sink.record(&make_event("d1", 1)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["document_id"], "d1");
    assert_eq!(rows[0]["phase"], "GENERATING");
    assert_eq!(rows[0]["kind"], "variant_generated");
    assert_eq!(rows[2]["seq"], 1);

    let back: TimelineEvent = serde_json::from_str(raw.lines().nth(1).unwrap()).unwrap();
    assert_eq!(back, make_event("d2", 0));
}

#[test]
fn jsonl_timeline_sink_fails_on_unwritable_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("no_such_dir").join("timeline.jsonl");
    assert!(JsonlTimelineSink::new(&missing).is_err());
}

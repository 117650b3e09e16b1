use std::path::Path;
use std::process::Command;

use refinery_harness::run::{DocumentStatus, RunResult, RunStatus};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(dir: &Path, body: serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("run.json");
    std::fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
    path
}

fn minimal_config() -> serde_json::Value {
    json!({
        "documents": [{ "id": "inline", "content": "Inline document." }],
        "generators": [{ "name": "tighten", "models": ["acme/writer"] }],
        "enable_single_eval": false,
        "enable_pairwise": false,
        "enable_combine": false
    })
}

#[test]
fn validate_accepts_config_plus_doc_globs() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), minimal_config());
    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    std::fs::write(docs.join("intro.md"), "Intro text.").unwrap();
    std::fs::write(docs.join("outro.md"), "Outro text.").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_refinery"))
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .arg("--docs")
        .arg(docs.join("*.md"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok: 3 documents, 1 generations per document"), "{stdout}");
}

#[test]
fn validate_rejects_duplicate_document_ids() {
    let dir = tempdir().unwrap();
    let mut body = minimal_config();
    body["documents"] = json!([
        { "id": "same", "content": "one" },
        { "id": "same", "content": "two" }
    ]);
    let config = write_config(dir.path(), body);

    let output = Command::new(env!("CARGO_BIN_EXE_refinery"))
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("duplicate document id: same"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_writes_result_timeline_and_store() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "rewritten" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 8 }
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), minimal_config());
    let out = dir.path().join("result.json");
    let timeline = dir.path().join("timeline.jsonl");
    let db = dir.path().join("runs.sqlite");

    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_refinery"))
        .env("OPENROUTER_API_KEY", "sk-test")
        .env("OPENROUTER_BASE_URL", server.uri())
        .env("REFINERY_LOG", "warn")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--out")
        .arg(&out)
        .arg("--timeline")
        .arg(&timeline)
        .arg("--store-sqlite")
        .arg(&db)
        .arg("--max-api-concurrency")
        .arg("1")
        .output()
        .await
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let result: RunResult = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.documents[0].status, DocumentStatus::Completed);
    assert_eq!(result.documents[0].variants[0].content, "rewritten");
    assert_eq!(result.stats.peak_in_flight, 1);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("inline"));
    assert!(stdout.contains("COMPLETED"));

    let events = std::fs::read_to_string(&timeline).unwrap();
    assert!(events.lines().count() >= 2);
    assert!(events.lines().all(|l| l.contains("\"document_id\":\"inline\"")));

    let listed = tokio::process::Command::new(env!("CARGO_BIN_EXE_refinery"))
        .arg("runs")
        .arg("--store-sqlite")
        .arg(&db)
        .output()
        .await
        .unwrap();
    assert!(listed.status.success());
    assert!(String::from_utf8_lossy(&listed.stdout).contains(&result.run_id.to_string()));
}

//! The global subscriber can only be installed once per process, so this
//! file holds a single test.

use lib_cart::{
    setup_logging, CartEngine, EngineConfig, InMemoryCartService, LogOptions, Money, NoopSink,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn engine_events_reach_the_json_log() {
    let temp_dir = tempdir().expect("Failed to create temporary directory");
    let log_dir = temp_dir.path().join("logs");
    fs::create_dir_all(&log_dir).expect("Failed to create log directory");
    for day in ["2024-01-01", "2024-01-02", "2024-01-03"] {
        fs::write(log_dir.join(format!("cart.log.{day}")), "{}\n").expect("Failed to seed old log");
    }

    let guard = setup_logging(&LogOptions {
        level: "debug".to_string(),
        log_dir: Some(log_dir.clone()),
        file_prefix: "cart.log".to_string(),
        keep_files: 1,
    })
    .expect("logging setup");
    assert_eq!(guard.log_dir(), Some(log_dir.as_path()));
    assert!(!log_dir.join("cart.log.2024-01-01").exists(), "old logs are pruned at startup");
    assert!(log_dir.join("cart.log.2024-01-03").exists());

    let service = InMemoryCartService::with_catalog([(1, "Kettle", Money::from_cents(3500))]);
    let engine = CartEngine::new(
        Arc::new(service),
        Arc::new(NoopSink),
        EngineConfig {
            coalesce_window_ms: 10,
            request_timeout_ms: 1_000,
        },
    );
    engine.load_cart().await.expect("load");
    engine.add_item(1, 2).outcome().await.expect("add");

    // Dropping the guard flushes the non-blocking writer.
    drop(guard);

    let contents: String = fs::read_dir(&log_dir)
        .expect("Failed to read log directory")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| !path.to_string_lossy().ends_with("2024-01-03"))
        .filter_map(|path| fs::read_to_string(path).ok())
        .collect();

    assert!(contents.contains("logging initialized"), "bootstrap event missing");
    assert!(contents.contains("cart loaded"), "load event missing");
    assert!(contents.contains("sending cart request"), "debug events missing");
    assert!(contents.contains(r#""level":"INFO""#), "file log is not JSON");
}

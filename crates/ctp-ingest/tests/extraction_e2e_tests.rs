//! End-to-end tests for paginated extraction
//!
//! These tests run the extraction phase against a mock studies API and
//! validate:
//! - Fresh runs and token-following pagination
//! - Retry exhaustion and missing continuation tokens
//! - Resumption from shards left by a failed run
//! - Refusal to start without seeded state

use chrono::NaiveDate;
use ctp_ingest::config::IngestConfig;
use ctp_ingest::error::IngestError;
use ctp_ingest::pipeline::IngestPipeline;
use ctp_ingest::shard;
use ctp_ingest::state::{CursorStore, RunStatus};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path, query_param, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

/// Helper to build a config pointing at the mock server
fn test_config(server: &MockServer, dir: &TempDir, pages: u32) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.api.base_url = format!("{}/studies", server.uri());
    config.api.pages_url_template = format!("{}/studies?pageToken={{token}}", server.uri());
    config.api.timeout_secs = 5;
    config.api.retry_backoff_ms = 0;
    config.target_pages = pages;
    config.storage.shard_root = dir.path().join("shards");
    config.storage.compact_root = dir.path().join("compacted");
    config.storage.state_file = dir.path().join("state/cursor.json");
    config.output_dir = dir.path().join("tables");
    config
}

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn shard_dir(dir: &TempDir) -> PathBuf {
    dir.path().join("shards/2024-05-01")
}

fn seed(config: &IngestConfig) {
    let mut store = CursorStore::open_file(&config.storage.state_file).unwrap();
    store.seed().unwrap();
}

/// Helper to create one page of the studies API
fn page(nct_ids: &[&str], next_token: Option<&str>) -> Value {
    let studies: Vec<Value> = nct_ids
        .iter()
        .map(|id| json!({"protocolSection": {"identificationModule": {"nctId": id}}}))
        .collect();

    match next_token {
        Some(token) => json!({"studies": studies, "nextPageToken": token}),
        None => json!({"studies": studies}),
    }
}

#[tokio::test]
async fn test_fresh_run_follows_continuation_tokens() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001", "NCT002"], Some("t1"))))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT003"], Some("t2"))))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 2);
    seed(&config);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let summary = pipeline.extract().await.unwrap();

    assert_eq!(summary.start_page, 0);
    assert_eq!(summary.end_page, 2);
    assert!(!summary.exhausted);
    assert_eq!(summary.shard_dir, shard_dir(&dir));

    assert!(shard_dir(&dir).join("1.parquet").exists());
    assert!(shard_dir(&dir).join("2.parquet").exists());
    assert_eq!(
        shard::last_shard_token(&shard_dir(&dir)).unwrap().as_deref(),
        Some("t2")
    );

    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    let state = store.state().unwrap();
    assert_eq!(state.run_status, RunStatus::Success);
    assert_eq!(state.page_count, 2);
    assert_eq!(state.continuation_token.as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_retries_exhausted_fails_with_page_number() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 1);
    seed(&config);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let err = pipeline.extract().await.unwrap_err();

    match err {
        IngestError::RequestFailed { page, detail } => {
            assert_eq!(page, 1);
            assert!(detail.contains("503"), "unexpected detail: {}", detail);
        },
        other => panic!("expected RequestFailed, got {:?}", other),
    }

    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 0);
    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Failure));
}

#[tokio::test]
async fn test_missing_token_is_fatal_and_page_not_saved() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 3);
    seed(&config);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let err = pipeline.extract().await.unwrap_err();

    assert!(matches!(err, IngestError::NextPageMissing { page: 1 }));
    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 0);

    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Failure));
}

#[tokio::test]
async fn test_missing_token_can_end_the_run() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT002"], None)))
        .mount(&server)
        .await;

    let mut config = test_config(&server, &dir, 10);
    config.api.end_on_missing_token = true;
    seed(&config);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let summary = pipeline.extract().await.unwrap();

    assert!(summary.exhausted);
    assert_eq!(summary.end_page, 2);
    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 2);

    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Success));
}

#[tokio::test]
async fn test_failed_run_resumes_from_shards_on_disk() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // The first page must never be fetched twice.
    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
        .expect(1)
        .mount(&server)
        .await;

    // Page two fails once, then succeeds.
    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "t1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT002"], Some("t2"))))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&server, &dir, 2);
    config.api.max_retries = 1;
    seed(&config);

    let first_run = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let err = first_run.extract().await.unwrap_err();
    assert!(matches!(err, IngestError::RequestFailed { page: 2, .. }));
    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 1);

    {
        let store = CursorStore::open_file(&config.storage.state_file).unwrap();
        assert_eq!(store.run_status(), Some(RunStatus::Failure));
        assert_eq!(store.determine_starting_point().unwrap(), 1);
    }

    // A later process, possibly on another day, continues the same run.
    let second_run = IngestPipeline::new(config.clone())
        .with_run_date(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    let summary = second_run.extract().await.unwrap();

    assert_eq!(summary.start_page, 1);
    assert_eq!(summary.end_page, 2);
    assert_eq!(summary.shard_dir, shard_dir(&dir));
    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 2);
    assert!(!dir.path().join("shards/2024-05-02").exists());

    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Success));
}

#[tokio::test]
async fn test_target_already_met_marks_success_without_requests() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&[], Some("unused"))))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 1);
    seed(&config);

    // Shard on disk from a run that crashed before its cursor update.
    let mut store = CursorStore::open_file(&config.storage.state_file).unwrap();
    store.record_attempt_start(1).unwrap();
    let writer = shard::ShardWriter::new(shard_dir(&dir));
    writer
        .save_response(1, &[json!({"protocolSection": {}})], Some("t1"), &mut store)
        .unwrap();
    drop(store);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let summary = pipeline.extract().await.unwrap();
    assert_eq!(summary.pages_fetched(), 0);

    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Success));
}

#[tokio::test]
async fn test_missing_state_refuses_to_start() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 1);
    let pipeline = IngestPipeline::new(config).with_run_date(run_date());

    let err = pipeline.extract().await.unwrap_err();
    assert!(matches!(err, IngestError::MissingState(_)));
    assert!(!shard_dir(&dir).exists());
}

#[tokio::test]
async fn test_crashed_page_resumes_from_shard_token_ahead_of_cursor() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT002"], Some("t2"))))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 2);
    seed(&config);

    // Shard 1 landed but the cursor never recorded it.
    {
        let mut store = CursorStore::open_file(&config.storage.state_file).unwrap();
        store.record_attempt_start(1).unwrap();
        shard::ShardWriter::new(shard_dir(&dir))
            .save_response(1, &[json!({"protocolSection": {}})], Some("t1"), &mut store)
            .unwrap();

        let state = store.state().unwrap();
        assert_eq!(state.page_count, 0);
        assert_eq!(state.continuation_token, None);
    }

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    let summary = pipeline.extract().await.unwrap();

    assert_eq!(summary.start_page, 1);
    assert_eq!(summary.end_page, 2);
    assert_eq!(
        shard::last_shard_token(&shard_dir(&dir)).unwrap().as_deref(),
        Some("t2")
    );
}

#[tokio::test]
async fn test_fresh_run_failing_first_page_restarts_in_new_partition() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&server, &dir, 2);
    config.api.max_retries = 1;
    seed(&config);

    {
        let _first = Mock::given(method("GET"))
            .and(path("/studies"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
            .expect(1)
            .mount_as_scoped(&server)
            .await;
        let _second = Mock::given(method("GET"))
            .and(path("/studies"))
            .and(query_param("pageToken", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT002"], Some("t2"))))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let summary = IngestPipeline::new(config.clone())
            .with_run_date(run_date())
            .extract()
            .await
            .unwrap();
        assert_eq!(summary.end_page, 2);
    }

    let next_day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
    let next_day_dir = dir.path().join("shards/2024-05-02");

    {
        let _unavailable = Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let err = IngestPipeline::new(config.clone())
            .with_run_date(next_day)
            .extract()
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::RequestFailed { page: 1, .. }));

        let store = CursorStore::open_file(&config.storage.state_file).unwrap();
        assert_eq!(store.run_status(), Some(RunStatus::Failure));
        assert_eq!(store.shard_dir(), None);
        assert_eq!(store.determine_starting_point().unwrap(), 0);
    }

    // The restart fetches page one again instead of reusing the earlier run.
    let _first = Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT010"], Some("u1"))))
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    let _second = Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT011"], Some("u2"))))
        .expect(1)
        .mount_as_scoped(&server)
        .await;

    let summary = IngestPipeline::new(config.clone())
        .with_run_date(next_day)
        .extract()
        .await
        .unwrap();

    assert_eq!(summary.start_page, 0);
    assert_eq!(summary.end_page, 2);
    assert_eq!(summary.shard_dir, next_day_dir);
    assert_eq!(shard::count_shards(&next_day_dir).unwrap(), 2);
    assert_eq!(shard::count_shards(&shard_dir(&dir)).unwrap(), 2);
    assert_eq!(
        shard::last_shard_token(&next_day_dir).unwrap().as_deref(),
        Some("u2")
    );
}

#[tokio::test]
async fn test_fresh_run_refuses_partition_with_existing_shards() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // Only the first run may reach the API.
    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&["NCT001"], Some("t1"))))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server, &dir, 1);
    seed(&config);

    let pipeline = IngestPipeline::new(config.clone()).with_run_date(run_date());
    pipeline.extract().await.unwrap();

    let err = pipeline.extract().await.unwrap_err();
    match err {
        IngestError::PartitionOccupied { dir: occupied, shards } => {
            assert_eq!(occupied, shard_dir(&dir));
            assert_eq!(shards, 1);
        },
        other => panic!("expected PartitionOccupied, got {:?}", other),
    }

    assert_eq!(
        shard::last_shard_token(&shard_dir(&dir)).unwrap().as_deref(),
        Some("t1")
    );
    let store = CursorStore::open_file(&config.storage.state_file).unwrap();
    assert_eq!(store.run_status(), Some(RunStatus::Success));
}

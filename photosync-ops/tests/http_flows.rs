use std::time::Duration;

use photosync_core::{DeleteTarget, JobPhase, PhotoClient};
use photosync_ops::{
    BatchExecutor, CursorPager, JobPoller, LoadOutcome, PhotoListing, PhotoSearch, PollSchedule,
    PollState, StartOutcome, TaskOutcome, UploadConfig, UploadFile, UploadPipeline,
};
use serde_json::json;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{body_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(server: &MockServer) -> PhotoClient {
    PhotoClient::with_base_url(&server.uri(), "test-token").unwrap()
}

#[tokio::test]
async fn pager_walks_cursors_and_coalesces_concurrent_loads() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/photos"))
        .and(query_param_is_missing("cursor"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "items": [{ "id": "p1" }, { "id": "p2" }],
                    "next_cursor": "c1"
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/photos"))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "p2" }, { "id": "p3" }],
            "next_cursor": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pager = CursorPager::new(PhotoListing(client(&server)), (), 2);
    let (first, second) = tokio::join!(pager.load_more(), pager.load_more());
    assert!(matches!(first.unwrap(), LoadOutcome::Appended { added: 2, .. }));
    assert_eq!(second.unwrap(), LoadOutcome::InFlight);

    let outcome = pager.load_more().await.unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Appended {
            added: 1,
            duplicates: 1,
            exhausted: true
        }
    );
    assert_eq!(pager.load_more().await.unwrap(), LoadOutcome::Exhausted);

    let ids: Vec<_> = pager
        .snapshot()
        .items
        .into_iter()
        .map(|photo| photo.id)
        .collect();
    assert_eq!(ids, ["p1", "p2", "p3"]);
}

#[tokio::test]
async fn search_pager_reports_backend_detail_and_keeps_cursor() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "beach"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "detail": "embedding service unavailable"
        })))
        .mount(&server)
        .await;

    let pager = CursorPager::new(PhotoSearch(client(&server)), "beach".to_string(), 20);
    assert!(pager.load_more().await.is_err());

    let state = pager.snapshot();
    assert!(state.items.is_empty());
    assert!(state.has_more());
    assert!(!state.loading);
    assert_eq!(
        state.last_error.as_deref(),
        Some("embedding service unavailable")
    );
}

#[tokio::test]
async fn batch_delete_chunks_duplicates_and_clamps_counts() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/photos/duplicates/delete"))
        .and(body_json(json!({ "ids": ["d1", "d2"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": 2 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/photos/duplicates/delete"))
        .and(body_json(json!({ "ids": ["d3", "d4"] })))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/photos/duplicates/delete"))
        .and(body_json(json!({ "ids": ["d5"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": 4 })))
        .expect(1)
        .mount(&server)
        .await;

    let executor = BatchExecutor::new(client(&server), DeleteTarget::Duplicates);
    let ids = ["d1", "d2", "d3", "d4", "d5"].map(String::from);
    let outcome = executor.execute(ids, 2).await.unwrap();

    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.deleted, 3);
    assert_eq!(outcome.failed, 2);
    let progress = executor.progress();
    assert_eq!(progress.processed, 5);
    assert!(!progress.running);
    assert!(progress.last_error.is_some());
}

#[tokio::test]
async fn upload_pipeline_streams_files_and_reports_local_failures() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/photos/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uploaded": 1,
            "skipped": 0
        })))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let first = dir.path().join("first.jpg");
    let second = dir.path().join("second.png");
    std::fs::write(&first, vec![0xFF; 4096]).unwrap();
    std::fs::write(&second, vec![0x89; 1024]).unwrap();
    let missing = dir.path().join("missing.jpg");

    let pipeline = UploadPipeline::with_config(
        client(&server),
        UploadConfig {
            concurrency: 2,
            clean_delay: Duration::from_millis(10),
        },
    );
    let summary = pipeline
        .submit(vec![
            UploadFile::new(&first),
            UploadFile::new(&missing),
            UploadFile::new(&second),
        ])
        .await
        .unwrap();

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.failed, 1);
    let state = pipeline.snapshot();
    assert!(!state.running);
    assert_eq!(state.tasks[0].percent, 100);
    assert!(matches!(state.tasks[1].outcome, TaskOutcome::Failed { .. }));
    assert!(state.last_error.unwrap().starts_with("missing.jpg: "));
}

#[tokio::test]
async fn poller_publishes_status_and_sync_now_starts_job() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/drive/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "running",
            "phase": "downloading",
            "folder_name": "Camera Roll",
            "total": 40,
            "processed": 12,
            "imported": 10,
            "skipped": 2,
            "failed": 0
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/drive/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "started": false,
            "message": "Sync already running"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let poller = JobPoller::new(client(&server), PollSchedule::default());
    let mut rx = poller.subscribe();
    poller.start();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|view| view.snapshot.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    let snapshot = poller.snapshot().unwrap();
    assert_eq!(snapshot.phase, JobPhase::Downloading);
    assert_eq!(snapshot.percent_complete(), 30);
    assert_eq!(poller.view().next_interval, Some(Duration::from_secs(3)));

    let outcome = poller.sync_now().await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::NotStarted {
            message: Some("Sync already running".into())
        }
    );

    poller.stop();
    assert_eq!(poller.state(), PollState::Stopped);
}

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use repodrop_core::remote::{ApiCall, ScriptedFailure};
use repodrop_core::{
    Error, InMemoryRepositoryApi, ProjectContext, RecordingSink, Settings, SyncPhase,
    SyncPipeline,
};

fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        w.start_file(*name, opts).unwrap();
        w.write_all(content.as_bytes()).unwrap();
    }
    w.finish().unwrap().into_inner()
}

fn settings() -> Settings {
    let mut s = Settings::default();
    s.github.token = "ghp_test".to_string();
    s.github.owner = "octo".to_string();
    s.github.repo = "site".to_string();
    s.github.branch = "main".to_string();
    s
}

fn pipeline(api: &Arc<InMemoryRepositoryApi>, settings: Settings) -> SyncPipeline {
    SyncPipeline::new(api.clone(), settings)
}

async fn run(
    pipeline: &SyncPipeline,
    archive: Vec<u8>,
) -> (repodrop_core::Result<repodrop_core::SyncReport>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let res = pipeline
        .process(archive, &ProjectContext::default(), None, sink.clone())
        .await;
    (res, sink)
}

fn put_calls(api: &InMemoryRepositoryApi) -> Vec<ApiCall> {
    api.calls()
        .into_iter()
        .filter(|c| matches!(c, ApiCall::PutFile { .. }))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn gitignored_file_is_not_uploaded() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let archive = zip_bytes(&[("a.txt", "alpha"), ("b.txt", "beta"), (".gitignore", "b.txt\n")]);
    let (res, sink) = run(&p, archive).await;
    let report = res.unwrap();

    assert_eq!(report.files_uploaded, 1);
    assert_eq!(
        put_calls(&api),
        vec![ApiCall::PutFile {
            path: "a.txt".to_string(),
            branch: "main".to_string(),
            message: "Sync from archive".to_string(),
        }]
    );
    assert_eq!(api.file("main", "a.txt").as_deref(), Some("alpha"));

    let last = sink.last().unwrap();
    assert_eq!(last.phase, SyncPhase::Success);
    assert_eq!(last.percent, 100);
}

#[tokio::test(start_paused = true)]
async fn phases_run_in_order_with_rising_percent() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let archive = zip_bytes(&[
        ("project/a.txt", "a"),
        ("project/b.txt", "b"),
        ("project/src/c.txt", "c"),
        ("project/src/d.txt", "d"),
    ]);
    let (res, sink) = run(&p, archive).await;
    res.unwrap();

    let events = sink.events();
    let mut phases: Vec<SyncPhase> = events.iter().map(|e| e.phase).collect();
    phases.dedup();
    assert_eq!(
        phases,
        vec![
            SyncPhase::Queued,
            SyncPhase::Extracting,
            SyncPhase::Validating,
            SyncPhase::BranchCheck,
            SyncPhase::Uploading,
            SyncPhase::Success,
        ]
    );
    let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");

    let uploading: Vec<_> = events
        .iter()
        .filter(|e| e.phase == SyncPhase::Uploading)
        .collect();
    assert_eq!(uploading.first().unwrap().percent, 20);
    assert_eq!(uploading.last().unwrap().percent, 90);
    assert_eq!(uploading.last().unwrap().files_done, Some(4));

    assert_eq!(api.file("main", "src/c.txt").as_deref(), Some("c"));
}

#[tokio::test(start_paused = true)]
async fn oversized_archive_makes_no_remote_calls() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let archive = vec![0u8; 50 * 1024 * 1024 + 1];
    let (res, sink) = run(&p, archive).await;

    assert!(matches!(res, Err(Error::ArchiveTooLarge { .. })));
    assert!(api.calls().is_empty());
    assert_eq!(sink.last().unwrap().phase, SyncPhase::Error);
}

#[tokio::test(start_paused = true)]
async fn throttled_upload_waits_retry_after_then_succeeds_once() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.push_put_failure(ScriptedFailure::RateLimited(Some(Duration::from_secs(2))));
    let p = pipeline(&api, settings());

    let (res, _) = run(&p, zip_bytes(&[("a.txt", "alpha")])).await;
    assert_eq!(res.unwrap().files_uploaded, 1);

    let puts: Vec<_> = api
        .timed_calls()
        .into_iter()
        .filter(|(_, c)| matches!(c, ApiCall::PutFile { .. }))
        .collect();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[0].1, puts[1].1);
    assert!(puts[1].0 - puts[0].0 >= Duration::from_secs(2));

    assert_eq!(api.file_count("main"), 1);
    assert_eq!(p.limiter().state().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_abort_the_sync() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    for _ in 0..3 {
        api.push_put_failure(ScriptedFailure::RateLimited(Some(Duration::from_secs(1))));
    }
    let mut s = settings();
    s.rate_limit.max_retries = 2;
    let p = pipeline(&api, s);

    let (res, sink) = run(&p, zip_bytes(&[("a.txt", "a"), ("b.txt", "b")])).await;
    assert!(matches!(res, Err(Error::RateLimitExhausted { attempts: 2 })));
    // b.txt never started
    assert_eq!(put_calls(&api).len(), 3);
    let last = sink.last().unwrap();
    assert_eq!(last.phase, SyncPhase::Error);
    assert!(last.message.to_lowercase().contains("rate limit"), "{}", last.message);
}

#[tokio::test(start_paused = true)]
async fn failure_mid_sync_keeps_earlier_commits() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.fail_path("b.txt", ScriptedFailure::Status(500));
    let p = pipeline(&api, settings());

    let archive = zip_bytes(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);
    let (res, sink) = run(&p, archive).await;

    assert!(matches!(res, Err(Error::RemoteApi { status: 500, .. })));
    assert_eq!(api.file("main", "a.txt").as_deref(), Some("a"));
    assert!(api.file("main", "c.txt").is_none());
    assert_eq!(
        put_calls(&api)
            .into_iter()
            .filter(|c| matches!(c, ApiCall::PutFile { path, .. } if path == "c.txt"))
            .count(),
        0
    );

    let last = sink.last().unwrap();
    assert_eq!(last.phase, SyncPhase::Error);
    assert!(last.message.starts_with("Could not reach GitHub"), "{}", last.message);
}

#[tokio::test(start_paused = true)]
async fn first_file_failure_stops_queued_files() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.fail_path("a.txt", ScriptedFailure::Status(500));
    let p = pipeline(&api, settings());

    let archive = zip_bytes(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")]);
    let (res, _) = run(&p, archive).await;
    assert!(matches!(res, Err(Error::RemoteApi { status: 500, .. })));

    let touched: Vec<String> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ApiCall::GetFile { path } | ApiCall::PutFile { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(touched, vec!["a.txt".to_string(), "a.txt".to_string()]);
    for path in ["b.txt", "c.txt", "d.txt"] {
        assert!(api.file("main", path).is_none(), "{path} was committed");
    }
}

#[tokio::test(start_paused = true)]
async fn each_sync_starts_with_a_fresh_retry_budget() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let mut s = settings();
    s.rate_limit.max_retries = 2;
    let p = pipeline(&api, s);

    for _ in 0..3 {
        api.push_put_failure(ScriptedFailure::RateLimited(Some(Duration::from_secs(1))));
    }
    let (res, _) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    assert!(matches!(res, Err(Error::RateLimitExhausted { .. })));
    assert_eq!(p.limiter().state().retry_count, 2);

    api.push_put_failure(ScriptedFailure::RateLimited(Some(Duration::from_secs(1))));
    let (res, _) = run(&p, zip_bytes(&[("b.txt", "b")])).await;
    assert_eq!(res.unwrap().files_uploaded, 1);
    assert_eq!(api.file("main", "b.txt").as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn burst_pacing_does_not_carry_into_the_next_sync() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let files: Vec<(String, String)> = (0..8).map(|i| (format!("f{i}.txt"), format!("{i}"))).collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(n, c)| (n.as_str(), c.as_str())).collect();
    run(&p, zip_bytes(&refs)).await.0.unwrap();
    assert!(p.limiter().state().request_count > 0);

    let (res, _) = run(&p, zip_bytes(&[("x.txt", "x")])).await;
    res.unwrap();
    // branch listing, branch lookup, file lookup and write
    assert!(p.limiter().state().request_count <= p.limiter().settings().burst_size);
}

#[tokio::test(start_paused = true)]
async fn missing_branch_is_created_from_default_head() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let mut s = settings();
    s.github.branch = "drops".to_string();
    let p = pipeline(&api, s);

    let (res, _) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    res.unwrap();

    assert!(api.calls().contains(&ApiCall::CreateBranch {
        branch: "drops".to_string(),
        from_sha: "c0".to_string(),
    }));
    assert_eq!(api.file("drops", "a.txt").as_deref(), Some("a"));
    assert!(api.file("main", "a.txt").is_none());
}

#[tokio::test(start_paused = true)]
async fn branch_creation_denied_is_a_permission_error() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.fail_create_branch(ScriptedFailure::Status(403));
    let mut s = settings();
    s.github.branch = "drops".to_string();
    let p = pipeline(&api, s);

    let (res, _) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    assert!(matches!(res, Err(Error::InsufficientPermissions { .. })));
    assert!(put_calls(&api).is_empty());
}

#[tokio::test(start_paused = true)]
async fn validation_maps_not_found_and_forbidden() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.fail_list_branches(ScriptedFailure::Status(404));
    let p = pipeline(&api, settings());
    let (res, sink) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    assert!(matches!(res, Err(Error::RepositoryNotFound { .. })));
    assert!(sink.last().unwrap().message.contains("octo/site"));

    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    api.fail_list_branches(ScriptedFailure::Status(403));
    let p = pipeline(&api, settings());
    let (res, _) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    assert!(matches!(res, Err(Error::InsufficientPermissions { .. })));
    assert!(put_calls(&api).is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_target_fails_before_remote_calls() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let mut s = settings();
    s.github.owner.clear();
    let p = pipeline(&api, s);

    let (res, _) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    assert!(matches!(
        res,
        Err(Error::MissingConfiguration { field: "owner" })
    ));
    assert!(api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn extraction_errors_surface_as_sync_errors() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let (res, _) = run(&p, Vec::new()).await;
    assert!(matches!(res, Err(Error::EmptyArchive)));

    let (res, sink) = run(&p, b"definitely not a zip".to_vec()).await;
    assert!(matches!(res, Err(Error::CorruptArchive { .. })));
    assert_eq!(sink.last().unwrap().phase, SyncPhase::Error);
    assert!(api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn existing_files_are_updated_in_place() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    run(&p, zip_bytes(&[("a.txt", "one")])).await.0.unwrap();
    run(&p, zip_bytes(&[("a.txt", "two")])).await.0.unwrap();

    assert_eq!(api.file("main", "a.txt").as_deref(), Some("two"));
    assert_eq!(api.file_count("main"), 1);
}

#[tokio::test(start_paused = true)]
async fn uploads_never_overlap() {
    let api = Arc::new(InMemoryRepositoryApi::new("main").with_put_delay(Duration::from_millis(50)));
    let p = pipeline(&api, settings());

    let files: Vec<(String, String)> = (0..5)
        .map(|i| (format!("f{i}.txt"), format!("{i}")))
        .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    run(&p, zip_bytes(&refs)).await.0.unwrap();

    let puts: Vec<_> = api
        .timed_calls()
        .into_iter()
        .filter(|(_, c)| matches!(c, ApiCall::PutFile { .. }))
        .map(|(at, _)| at)
        .collect();
    assert_eq!(puts.len(), 5);
    for w in puts.windows(2) {
        assert!(w[1] - w[0] >= Duration::from_millis(50));
    }
}

#[tokio::test(start_paused = true)]
async fn global_timeout_aborts_remaining_work() {
    let api = Arc::new(InMemoryRepositoryApi::new("main").with_put_delay(Duration::from_secs(2)));
    let mut s = settings();
    s.sync.timeout_secs = 3;
    let p = pipeline(&api, s);

    let archive = zip_bytes(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);
    let (res, sink) = run(&p, archive).await;
    assert!(matches!(res, Err(Error::UploadTimeout { .. })));
    assert_eq!(sink.last().unwrap().phase, SyncPhase::Error);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(api.file("main", "c.txt").is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_waits_for_reset() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let reset_at = chrono::Utc::now().timestamp() as u64 + 30;
    api.set_quota(0, reset_at);
    let p = pipeline(&api, settings());

    let start = tokio::time::Instant::now();
    run(&p, zip_bytes(&[("a.txt", "a")])).await.0.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(28));
}

#[tokio::test(start_paused = true)]
async fn returns_to_idle_after_success() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let p = pipeline(&api, settings());

    let (res, sink) = run(&p, zip_bytes(&[("a.txt", "a")])).await;
    res.unwrap();
    assert_eq!(sink.last().unwrap().phase, SyncPhase::Success);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(sink.last().unwrap().phase, SyncPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn project_override_changes_target() {
    let api = Arc::new(InMemoryRepositoryApi::new("main"));
    let mut s = settings();
    s.projects.insert(
        "p1".to_string(),
        repodrop_core::config::ProjectTarget {
            owner: None,
            repo: "landing".to_string(),
            branch: Some("main".to_string()),
        },
    );
    let p = pipeline(&api, s);

    let sink = Arc::new(RecordingSink::new());
    let report = p
        .process(
            zip_bytes(&[("a.txt", "a")]),
            &ProjectContext {
                project_id: Some("p1".to_string()),
            },
            Some("Custom message"),
            sink,
        )
        .await
        .unwrap();
    assert_eq!(report.target.repo, "landing");
    assert_eq!(
        put_calls(&api),
        vec![ApiCall::PutFile {
            path: "a.txt".to_string(),
            branch: "main".to_string(),
            message: "Custom message".to_string(),
        }]
    );
}

use futures::TryStreamExt;
use serde_json::{Value, json};
use trawl_client::{FileSink, JsonFileHistory, ReqwestTransport};
use trawl_core::context::RetrievalContext;
use trawl_core::error::FailureKind;
use trawl_core::job::{JobStatus, RetrievalTarget};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{fast_config, fast_options, transport};

async fn mount_listing(server: &MockServer) {
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/v1/artifacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"id": "a", "url": format!("{base}/files/a")},
                {"id": "b", "url": format!("{base}/files/b")},
            ],
            "next_cursor": "p2",
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/artifacts"))
        .and(query_param("cursor", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": "c", "url": format!("{base}/files/c")}],
            "next_cursor": null,
        })))
        .with_priority(1)
        .mount(server)
        .await;
}

async fn context(
    server: &MockServer,
    dir: &std::path::Path,
) -> RetrievalContext<ReqwestTransport, JsonFileHistory> {
    RetrievalContext::start(
        transport(server),
        JsonFileHistory::new(dir.join("history")),
        fast_config(),
    )
    .await
}

#[tokio::test]
async fn list_then_download() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server).await;
    Mock::given(path("/files/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alpha"))
        .mount(&server)
        .await;
    Mock::given(path("/files/b"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/files/b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("bravo"))
        .mount(&server)
        .await;
    Mock::given(path("/files/c"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let ctx = context(&server, dir.path()).await;

    let items: Vec<Value> = ctx.paginate("/artifacts").into_stream().try_collect().await?;
    assert_eq!(items.len(), 3);

    let out = dir.path().join("out");
    let targets = items
        .iter()
        .map(|item| {
            let id = item["id"].as_str().unwrap_or_default();
            let url = item["url"].as_str().unwrap_or_default();
            RetrievalTarget::new(id, url, out.join(id))
        })
        .collect();

    let orchestrator = ctx.orchestrator(FileSink::new().without_space_check());
    let job_id = orchestrator.create_job("artifacts", targets, fast_options(2));
    let progress = orchestrator.run_job(job_id).await?;

    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!((progress.completed, progress.failed, progress.pending), (2, 1, 0));
    assert_eq!(std::fs::read_to_string(out.join("a"))?, "alpha");
    assert_eq!(std::fs::read_to_string(out.join("b"))?, "bravo");
    assert!(!out.join("c").exists());
    assert!(!FileSink::staging_path(&out.join("c")).exists());

    let failed = orchestrator.failed_targets(job_id)?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target_id, "c");
    assert_eq!(failed[0].reason.kind, FailureKind::Permanent);

    let records = ctx.history().jobs().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job_id);
    assert_eq!(records[0].completed, 2);
    Ok(())
}

#[tokio::test]
async fn cache_survives_restart() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server).await;
    let dir = tempfile::tempdir()?;

    let first = context(&server, dir.path()).await;
    let items: Vec<Value> = first.paginate("/artifacts").into_stream().try_collect().await?;
    assert_eq!(items.len(), 3);
    let snapshot = first.shutdown().await?;
    assert_eq!(snapshot.entries.len(), 2);

    let listed = server.received_requests().await.unwrap_or_default().len();
    let second = context(&server, dir.path()).await;
    let again: Vec<Value> = second.paginate("/artifacts").into_stream().try_collect().await?;

    assert_eq!(again, items);
    assert_eq!(
        server.received_requests().await.unwrap_or_default().len(),
        listed
    );
    Ok(())
}

#[tokio::test]
async fn partial_download_resumes_with_range() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(path("/files/h"))
        .and(header("range", "bytes=3-"))
        .respond_with(ResponseTemplate::new(206).set_body_string("lo"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("h.txt");
    std::fs::write(FileSink::staging_path(&dest), "hel")?;

    let ctx = context(&server, dir.path()).await;
    let orchestrator = ctx.orchestrator(FileSink::new().without_space_check());
    let target = RetrievalTarget::new("h", format!("{}/files/h", server.uri()), &dest)
        .with_expected_size(5);
    let job_id = orchestrator.create_job("resume", vec![target], fast_options(1));
    let progress = orchestrator.run_job(job_id).await?;

    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(std::fs::read_to_string(&dest)?, "hello");
    Ok(())
}

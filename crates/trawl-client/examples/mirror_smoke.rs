/// Smoke-test for the full pipeline against a live API.
///
/// Lists `TRAWL_LISTING` (default `/items`) under `TRAWL_BASE_URL`, then
/// downloads every item's `url` field into `TRAWL_OUT_DIR` (default
/// `./mirror`). Items without a `url` are skipped. Pipeline settings come
/// from the usual `TRAWL_*` variables.
///
/// Run with:
///   TRAWL_BASE_URL=https://api.example.com/v1 cargo run --example mirror_smoke
use std::path::PathBuf;

use futures::TryStreamExt;
use serde_json::Value;
use trawl_client::{FileSink, JsonFileHistory, ReqwestTransport};
use trawl_core::config::PipelineConfig;
use trawl_core::context::RetrievalContext;
use trawl_core::job::{JobOptions, RetrievalTarget};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let base_url = std::env::var("TRAWL_BASE_URL")?;
    let listing = std::env::var("TRAWL_LISTING").unwrap_or_else(|_| "/items".to_string());
    let out_dir =
        PathBuf::from(std::env::var("TRAWL_OUT_DIR").unwrap_or_else(|_| "mirror".into()));

    let config = PipelineConfig::from_env()?;
    let transport =
        ReqwestTransport::with_timeout(config.request_timeout)?.with_base_url(&base_url)?;
    let history = JsonFileHistory::new(out_dir.join(".trawl"));
    let ctx = RetrievalContext::start(transport, history, config).await;

    let items: Vec<Value> = ctx.paginate(listing).into_stream().try_collect().await?;
    println!("Listed {} items", items.len());

    let targets: Vec<RetrievalTarget> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let url = item.get("url")?.as_str()?;
            let id = match item.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => i.to_string(),
            };
            Some(RetrievalTarget::new(id.clone(), url, out_dir.join(id)))
        })
        .collect();

    let orchestrator = ctx.orchestrator(FileSink::new());
    let job_id = orchestrator.create_job("mirror_smoke", targets, JobOptions::default());
    orchestrator.register_progress_callback(job_id, |update| {
        let done = update.progress.completed + update.progress.failed;
        println!("{done} / {}", update.progress.total);
    })?;
    let progress = orchestrator.run_job(job_id).await?;

    println!(
        "{}: {} completed, {} failed",
        progress.status.as_str(),
        progress.completed,
        progress.failed
    );
    for failed in orchestrator.failed_targets(job_id)? {
        println!("  {}: {}", failed.target_id, failed.reason);
    }

    ctx.shutdown().await?;
    Ok(())
}

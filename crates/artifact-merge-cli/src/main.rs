use std::sync::Arc;

use anyhow::Context;
use artifact_merge::{run_job, JobEvent, JobOutcome, MergePipeline, ObjectStoreBlobStore};
use clap::Parser;
use tokio::io::AsyncReadExt;

mod args;
mod config;
mod exit_codes;

use args::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(outcome) if outcome.is_success() => exit_codes::SUCCESS,
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("fatal: {e:?}");
            exit_codes::STARTUP_FAILED
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<JobOutcome> {
    let file = match &cli.config {
        Some(path) => config::load_file(path)?,
        None => config::FileConfig::default(),
    };
    let settings = config::resolve(&cli, file);

    let store = ObjectStoreBlobStore::from_url(&settings.store)
        .with_context(|| format!("invalid store URL {}", settings.store))?;
    let pipeline = MergePipeline::new(Arc::new(store))
        .with_policy(settings.policy)
        .with_limits(settings.limits)
        .with_staging(settings.staging);

    let raw = read_event(&cli.event).await?;
    let outcome = match JobEvent::from_json(&raw) {
        Ok(event) => run_job(&pipeline, event).await,
        Err(e) => JobOutcome::failure(None, &e),
    };

    println!("{}", serde_json::to_string(&outcome)?);
    Ok(outcome)
}

async fn read_event(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut raw = String::new();
        tokio::io::stdin()
            .read_to_string(&mut raw)
            .await
            .context("failed to read job event from stdin")?;
        return Ok(raw);
    }
    tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("failed to read job event {}", source))
}

// src/main.rs
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};

use pathwise_lib::{
    config::EngineConfig,
    models::{CourseId, RunWindow},
    pipeline::{AnalyticsPipeline, JsonLogSource, RunOutcome, RunScheduler, restore_policies},
    reinforcement::{ActionCatalog, PolicyRegistry},
    storage::open_store,
};

/// Usage: pathwise [--window-end <RFC3339>] [course_id ...]
///
/// Runs every listed course (every dataset in the data directory when none
/// are listed) over the trailing window ending at `--window-end` or now.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    info!("Starting learning analytics batch");
    let start_time = Instant::now();

    let env_paths = [".env", ".env.local", "../.env"];
    let mut loaded_env = false;
    for path in env_paths.iter() {
        if Path::new(path).exists() {
            if let Err(e) = dotenv::from_path(path) {
                warn!("Failed to load environment from {}: {}", path, e);
            } else {
                info!("Loaded environment variables from {}", path);
                loaded_env = true;
                break;
            }
        }
    }
    if !loaded_env {
        info!("No .env file found, using environment variables from system");
    }

    let config = EngineConfig::load().context("Failed to load engine configuration")?;
    let (window_end, mut courses) = parse_args(std::env::args().skip(1))?;
    let window = RunWindow::trailing(window_end, config.scheduler.window_days);

    let store = open_store(&config.storage, true).await?;
    let source = Arc::new(JsonLogSource::new(config.storage.data_dir.clone()));
    if courses.is_empty() {
        courses = source.list_courses().await?;
    }
    if courses.is_empty() {
        warn!(
            "No course datasets found in {}",
            config.storage.data_dir.display()
        );
        return Ok(());
    }

    let catalog = ActionCatalog::standard();
    let registry = Arc::new(PolicyRegistry::new());
    restore_policies(store.as_ref(), &registry, &courses).await?;

    let pipeline = Arc::new(AnalyticsPipeline::new(config, catalog));
    let scheduler = RunScheduler::new(pipeline, source, store, registry);
    let outcomes = scheduler.run_batch(&courses, window).await;

    let mut failed = 0;
    for (course_id, outcome) in &outcomes {
        match outcome {
            RunOutcome::Completed {
                run_id,
                optimal_k,
                policy_version,
            } => info!(
                "{}: completed run {} (k={}, policy {})",
                course_id,
                run_id,
                optimal_k,
                policy_version.map_or_else(|| "not trained".to_string(), |v| v.to_string())
            ),
            RunOutcome::Skipped { window_key } => {
                info!("{}: window {} already processed", course_id, window_key)
            }
            RunOutcome::InsufficientData { reason } => info!("{}: {}", course_id, reason),
            RunOutcome::Failed { error } => {
                failed += 1;
                warn!("{}: FAILED: {}", course_id, error)
            }
        }
    }

    info!(
        "Batch of {} courses finished in {:.2?} ({} failed)",
        outcomes.len(),
        start_time.elapsed(),
        failed
    );
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(DateTime<Utc>, Vec<CourseId>)> {
    let mut window_end = Utc::now();
    let mut courses = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--window-end" {
            let raw = args.next().context("--window-end needs a timestamp")?;
            window_end = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("Invalid --window-end timestamp: {}", raw))?
                .with_timezone(&Utc);
        } else {
            courses.push(CourseId(arg));
        }
    }
    Ok((window_end, courses))
}

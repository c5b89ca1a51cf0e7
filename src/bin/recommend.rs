// src/bin/recommend.rs
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use pathwise_lib::{
    config::EngineConfig,
    models::{CourseId, StudentId},
    reinforcement::{ActionCatalog, PolicyRegistry, RecommendationServer},
    storage::open_store,
};

/// Usage: recommend <student_id> <course_id> [top_k]
///
/// Loads the latest persisted policy of the course and prints the ranked
/// recommendation as JSON.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    if dotenv::dotenv().is_err() {
        info!("No .env file found, using environment variables from system");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("usage: recommend <student_id> <course_id> [top_k]");
    }
    let student_id = StudentId(args[0].clone());
    let course_id = CourseId(args[1].clone());
    let top_k = match args.get(2) {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("top_k is not a number: {}", raw))?,
        None => 0,
    };

    let config = EngineConfig::load().context("Failed to load engine configuration")?;
    let store = open_store(&config.storage, false).await?;

    let registry = Arc::new(PolicyRegistry::new());
    match store.load_latest_policy(&course_id).await? {
        Some(snapshot) => registry.publish(snapshot)?,
        None => warn!("No trained policy for course {}, serving defaults", course_id),
    }

    let server = RecommendationServer::new(registry, ActionCatalog::standard(), config.serving);
    let response = server.recommend(&student_id, &course_id, top_k);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

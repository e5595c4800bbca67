/// ChatSync scenario runner - replays a JSON scenario against the in-memory backend
use chatsync_core::sim::{MemoryBackend, Scenario};
use chatsync_core::{SyncConfig, SyncSession};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, rest) = SyncConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let scenario_path = rest
        .first()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("Usage: chatsync <local_user_id> [flags] <scenario.json>"))?;

    let scenario = Scenario::load(&scenario_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", scenario_path.display(), e))?;
    info!(
        "Replaying {} steps from {}",
        scenario.steps.len(),
        scenario_path.display()
    );

    let backend = MemoryBackend::new(config.local_user_id.clone());
    scenario.seed(&backend).await;

    let session = SyncSession::start(config, Arc::new(backend.clone()), Arc::new(backend.clone()))
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;
    let mut warnings = session.warnings();

    let played = scenario.play(&session, &backend).await;
    let snapshot = session.snapshot();
    session.shutdown().await;
    played.map_err(|e| anyhow::anyhow!("Scenario error: {}", e))?;

    while let Ok(w) = warnings.try_recv() {
        warn!("sync warning: {}", serde_json::to_string(&w)?);
    }

    let output = serde_json::json!({
        "version": snapshot.version,
        "selected": snapshot.selected,
        "conversations": &*snapshot.conversations,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

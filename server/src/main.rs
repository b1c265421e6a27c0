use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use pharmagenie_core::agents::Agents;
use pharmagenie_core::ai::{ChatBackend, HttpChatBackend};
use pharmagenie_core::api::v1::{self, ApiState};
use pharmagenie_core::briefing::Briefing;
use pharmagenie_core::cache;
use pharmagenie_core::config::AppConfig;
use pharmagenie_core::db::{init_db, with_conn};
use pharmagenie_core::model_manager::ModelManager;
use pharmagenie_core::workers::BatchRunner;

mod logger;

fn workspace_dir(config: &AppConfig) -> PathBuf {
    if let Some(dir) = &config.data_dir {
        return dir.clone();
    }
    if let Some(proj) = ProjectDirs::from("com", "PharmaGenie", "PharmaGenie") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("PharmaGenie")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let configured: Vec<&str> = config.configured_providers().map(|p| p.id.as_str()).collect();
    if configured.is_empty() {
        log::warn!("no AI provider key configured; chat will fail until one is stored");
    } else {
        log::info!("AI fallback order: {}", configured.join(" -> "));
    }

    let dir = workspace_dir(&config);
    let db = init_db(&dir, &config.providers)
        .with_context(|| format!("failed to initialise database in {}", dir.display()))?;
    log::info!("database ready in {}", dir.display());

    let ttl = config.sources.cache_ttl;
    match with_conn(&db, move |conn| Ok(cache::purge_expired(conn, ttl)?)).await {
        Ok(0) => {}
        Ok(purged) => log::info!("purged {purged} expired cache row(s)"),
        Err(err) => log::warn!("cache purge skipped: {err}"),
    }

    let backend: Arc<dyn ChatBackend> = Arc::new(HttpChatBackend::new(config.chat_timeout)?);
    let model_manager = ModelManager::new(db.clone(), backend);
    let agents = Agents::new(&config.sources, Some(db.clone()))?;
    let briefing = Briefing::new(db.clone(), model_manager.clone(), agents.clone());
    let batches = BatchRunner::new(db.clone(), briefing.clone());

    let app = v1::router(ApiState {
        db,
        model_manager,
        briefing,
        batches,
        agents,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    log::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

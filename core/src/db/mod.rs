use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use tokio::task::spawn_blocking;

use crate::ai::config as ai_config;
use crate::config::ProviderConfig;
use crate::errors::GenieError;
use crate::workers;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) the workspace database, apply migrations and mirror the
/// configured providers.
pub fn init_db(workspace_dir: &Path, providers: &[ProviderConfig]) -> Result<DbPool> {
    std::fs::create_dir_all(workspace_dir)
        .with_context(|| format!("failed to create {}", workspace_dir.display()))?;
    let db_path = workspace_dir.join("pharmagenie.db");
    let mgr = SqliteConnectionManager::file(&db_path)
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
    let pool = Pool::new(mgr)?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        ai_config::sync_providers(&conn, providers)?;
        let interrupted = workers::fail_interrupted_jobs(&conn)?;
        if interrupted > 0 {
            log::warn!("marked {interrupted} interrupted batch(es) as failed");
        }
    }
    Ok(pool)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_lookup_cache_reports.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_lookup_cache_reports.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

/// Run a closure against a pooled connection on the blocking thread pool.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, GenieError>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(GenieError::db)?;
        f(&conn).map_err(|err| GenieError::db(format!("{err:#}")))
    })
    .await
    .map_err(|err| GenieError::Unknown(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let providers = vec![ProviderConfig {
            id: "groq".into(),
            display_name: "Groq".into(),
            api_key: Some("gsk".into()),
            base_url: "https://api.groq.com/openai/v1".into(),
            model: "llama-3.3-70b-versatile".into(),
        }];
        init_db(dir.path(), &providers).unwrap();
        let pool = init_db(dir.path(), &providers).unwrap();
        let conn = pool.get().unwrap();
        let listed = ai_config::list_providers(&conn).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].has_credentials);
    }

    #[test]
    fn restart_without_env_key_drops_the_stored_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut providers = vec![ProviderConfig {
            id: "deepseek".into(),
            display_name: "DeepSeek".into(),
            api_key: Some("sk-old".into()),
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
        }];
        init_db(dir.path(), &providers).unwrap();
        providers[0].api_key = None;
        let pool = init_db(dir.path(), &providers).unwrap();
        let conn = pool.get().unwrap();
        assert!(ai_config::fallback_chain(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn with_conn_surfaces_errors_as_db_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path(), &[]).unwrap();
        let err = with_conn(&pool, |conn| {
            conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "DB-1001");
    }
}

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::config::ProviderConfig;
use crate::logging::log_event;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AiProviderInfo {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub model: String,
    pub priority: i64,
    pub has_credentials: bool,
}

/// A provider that is eligible for a call, together with its secret.
#[derive(Debug, Clone)]
pub struct AiRuntimeSelection {
    pub provider: AiProviderInfo,
    pub model: String,
    pub secret: String,
}

/// Where a stored credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialOrigin {
    Env,
    Api,
}

impl CredentialOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Api => "api",
        }
    }
}

const PROVIDER_COLUMNS: &str = "p.id, p.display_name, p.base_url, p.model, p.priority, \
     (SELECT COUNT(1) FROM ai_credentials c WHERE c.provider_id = p.id) as has_secret";

/// Mirror the configured provider list into SQLite.
///
/// Priority follows the order of `providers`. A credential present in the
/// configuration replaces any stored one. A credential that came from the
/// configuration on an earlier start is removed once the configuration stops
/// carrying it; keys stored through the API are left alone. Providers dropped
/// from the configuration are removed together with their credentials.
pub fn sync_providers(conn: &rusqlite::Connection, providers: &[ProviderConfig]) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for (priority, provider) in providers.iter().enumerate() {
        conn.execute(
            "INSERT INTO ai_providers (id, display_name, base_url, model, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 base_url = excluded.base_url,
                 model = excluded.model,
                 priority = excluded.priority,
                 updated_at = excluded.updated_at",
            params![
                provider.id,
                provider.display_name,
                provider.base_url,
                provider.model,
                priority as i64,
                now,
            ],
        )?;
        match &provider.api_key {
            Some(key) => store_secret(conn, &provider.id, key, CredentialOrigin::Env, now)?,
            None => {
                let removed = conn.execute(
                    "DELETE FROM ai_credentials WHERE provider_id = ?1 AND origin = 'env'",
                    params![provider.id],
                )?;
                if removed > 0 {
                    audit_credential_change(conn, &provider.id, false);
                }
            }
        }
    }

    let keep: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
    for existing in list_providers(conn)? {
        if !keep.contains(&existing.id.as_str()) {
            conn.execute(
                "DELETE FROM ai_credentials WHERE provider_id = ?1",
                params![existing.id],
            )?;
            conn.execute("DELETE FROM ai_providers WHERE id = ?1", params![existing.id])?;
        }
    }
    Ok(())
}

pub fn list_providers(conn: &rusqlite::Connection) -> Result<Vec<AiProviderInfo>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM ai_providers p ORDER BY p.priority, p.id"
    ))?;
    let rows = stmt.query_map([], map_provider)?;
    let mut providers = Vec::new();
    for row in rows {
        providers.push(row?);
    }
    Ok(providers)
}

/// Providers holding a credential, in priority order.
pub fn fallback_chain(conn: &rusqlite::Connection) -> Result<Vec<AiRuntimeSelection>> {
    let mut chain = Vec::new();
    for provider in list_providers(conn)? {
        if !provider.has_credentials {
            continue;
        }
        let Some(secret) = load_secret(conn, &provider.id)? else {
            continue;
        };
        chain.push(AiRuntimeSelection {
            model: provider.model.clone(),
            provider,
            secret,
        });
    }
    Ok(chain)
}

/// Store or, when `api_key` is blank, remove a provider credential.
/// Returns `None` when the provider is unknown.
pub fn set_credential(
    conn: &rusqlite::Connection,
    provider_id: &str,
    api_key: &str,
) -> Result<Option<AiProviderInfo>> {
    if get_provider(conn, provider_id)?.is_none() {
        return Ok(None);
    }
    let trimmed = api_key.trim();
    if trimmed.is_empty() {
        conn.execute(
            "DELETE FROM ai_credentials WHERE provider_id = ?1",
            params![provider_id],
        )?;
    } else {
        store_secret(
            conn,
            provider_id,
            trimmed,
            CredentialOrigin::Api,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
    }
    audit_credential_change(conn, provider_id, !trimmed.is_empty());
    get_provider(conn, provider_id)
}

pub fn clear_credential(
    conn: &rusqlite::Connection,
    provider_id: &str,
) -> Result<Option<AiProviderInfo>> {
    set_credential(conn, provider_id, "")
}

fn get_provider(conn: &rusqlite::Connection, provider_id: &str) -> Result<Option<AiProviderInfo>> {
    let provider = conn
        .query_row(
            &format!("SELECT {PROVIDER_COLUMNS} FROM ai_providers p WHERE p.id = ?1"),
            params![provider_id],
            map_provider,
        )
        .optional()?;
    Ok(provider)
}

fn map_provider(row: &rusqlite::Row) -> rusqlite::Result<AiProviderInfo> {
    Ok(AiProviderInfo {
        id: row.get(0)?,
        display_name: row.get(1)?,
        base_url: row.get(2)?,
        model: row.get(3)?,
        priority: row.get(4)?,
        has_credentials: row.get::<_, i64>(5)? > 0,
    })
}

fn store_secret(
    conn: &rusqlite::Connection,
    provider_id: &str,
    secret: &str,
    origin: CredentialOrigin,
    now: i64,
) -> Result<()> {
    let encoded = B64_ENGINE.encode(secret.as_bytes());
    conn.execute(
        "INSERT INTO ai_credentials (provider_id, secret, origin, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(provider_id) DO UPDATE SET
             secret = excluded.secret,
             origin = excluded.origin,
             updated_at = excluded.updated_at",
        params![provider_id, encoded, origin.as_str(), now],
    )?;
    Ok(())
}

fn load_secret(conn: &rusqlite::Connection, provider_id: &str) -> Result<Option<String>> {
    let secret: Option<String> = conn
        .query_row(
            "SELECT secret FROM ai_credentials WHERE provider_id = ?1",
            params![provider_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(s) = secret {
        let decoded = B64_ENGINE
            .decode(s.as_bytes())
            .map_err(|_| anyhow!("Failed to decode stored credential"))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| anyhow!("Stored credential was not valid UTF-8"))?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}

fn audit_credential_change(conn: &rusqlite::Connection, provider_id: &str, present: bool) {
    let message = if present {
        "AI provider credential stored"
    } else {
        "AI provider credential removed"
    };
    let _ = log_event(
        conn,
        "info",
        Some("AI-0001"),
        "ai.settings",
        message,
        Some("Takes effect on the next chat request"),
        Some(json!({ "provider": provider_id })),
    );
}

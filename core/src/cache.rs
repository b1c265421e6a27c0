//! Time-bounded memoisation of data-source responses in `lookup_cache`.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::OffsetDateTime;

/// Stable cache key for a request: hex sha256 of the source and URL.
pub fn cache_key(source: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cached payload for `key`, or `None` when absent or older than `ttl`.
pub fn get(conn: &Connection, key: &str, ttl: Duration) -> rusqlite::Result<Option<Value>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT payload, fetched_at FROM lookup_cache WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((payload, fetched_at)) = row else {
        return Ok(None);
    };
    let age = OffsetDateTime::now_utc().unix_timestamp() - fetched_at;
    if age < 0 || age as u64 >= ttl.as_secs() {
        return Ok(None);
    }
    Ok(serde_json::from_str(&payload).ok())
}

pub fn put(conn: &Connection, key: &str, source: &str, payload: &Value) -> rusqlite::Result<()> {
    put_at(conn, key, source, payload, OffsetDateTime::now_utc().unix_timestamp())
}

fn put_at(
    conn: &Connection,
    key: &str,
    source: &str,
    payload: &Value,
    fetched_at: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO lookup_cache (key, source, payload, fetched_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, fetched_at = excluded.fetched_at",
        params![key, source, payload.to_string(), fetched_at],
    )?;
    Ok(())
}

/// Drop rows older than `ttl`. Returns the number removed.
pub fn purge_expired(conn: &Connection, ttl: Duration) -> rusqlite::Result<usize> {
    let cutoff = OffsetDateTime::now_utc().unix_timestamp() - ttl.as_secs() as i64;
    conn.execute("DELETE FROM lookup_cache WHERE fetched_at <= ?1", params![cutoff])
}

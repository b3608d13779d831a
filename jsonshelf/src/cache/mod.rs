use crate::config::CacheConfig;
use crate::connection::Connection;
use crate::error::{Result, ShelfError};
use crate::query::compiler::quote_ident;
use serde::Serialize;
use serde_json::Value;

/// Per-collection table of query results keyed by a signature of the query.
pub struct ResultCache<'c> {
    conn: &'c Connection,
    config: CacheConfig,
}

pub fn table_name(collection: &str) -> String {
    format!("_cache_{collection}")
}

/// Hex blake3 digest of a value's JSON form.
pub fn signature<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let text = serde_json::to_string(value)?;
    Ok(blake3::hash(text.as_bytes()).to_hex().to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl<'c> ResultCache<'c> {
    pub fn new(conn: &'c Connection, config: &CacheConfig) -> Self {
        ResultCache {
            conn,
            config: config.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn ensure_table(&self, collection: &str) -> Result<()> {
        if self.conn.is_read_only() {
            return Ok(());
        }
        let table = table_name(collection);
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                type TEXT NOT NULL,
                key TEXT NOT NULL,
                datakey TEXT NOT NULL,
                data TEXT NOT NULL,
                expiry INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {i} ON {t} (type, key, datakey);",
            t = quote_ident(&table),
            i = quote_ident(&format!("{table}_key")),
        ))
    }

    pub fn get(&self, collection: &str, kind: &str, key: &str) -> Result<Option<Value>> {
        self.get_at(collection, kind, key, now())
    }

    /// Newest unexpired payload as of `now`.
    pub fn get_at(&self, collection: &str, kind: &str, key: &str, now: i64) -> Result<Option<Value>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let table = table_name(collection);
        if !self.conn.object_exists(&table)? {
            return Ok(None);
        }
        if self.config.auto_prune && !self.conn.is_read_only() {
            self.prune_at(collection, now)?;
        }

        let data = self.conn.query_one(
            &format!(
                "SELECT data FROM {} WHERE type = ? AND key = ? AND (expiry = 0 OR expiry > ?) \
                 ORDER BY rowid DESC LIMIT 1",
                quote_ident(&table)
            ),
            &[
                Value::String(kind.to_string()),
                Value::String(key.to_string()),
                Value::from(now),
            ],
        )?;
        match data {
            Some(Value::String(text)) => {
                log::debug!("cache hit: {table} {kind} {key}");
                Ok(Some(serde_json::from_str(&text)?))
            }
            _ => Ok(None),
        }
    }

    pub fn put(&self, collection: &str, kind: &str, key: &str, payload: &Value) -> Result<bool> {
        self.put_at(collection, kind, key, payload, now())
    }

    /// Store a payload. Returns false when nothing was written (disabled or read-only).
    pub fn put_at(
        &self,
        collection: &str,
        kind: &str,
        key: &str,
        payload: &Value,
        now: i64,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        if self.conn.is_read_only() {
            log::warn!("Skipping cache write for {collection}: store is read-only");
            return Ok(false);
        }

        let data = payload.to_string();
        let expiry = match self.config.lifetime_secs {
            0 => 0,
            secs => now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)),
        };
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (type, key, datakey, data, expiry) VALUES (?, ?, ?, ?, ?)",
                quote_ident(&table_name(collection))
            ),
            &[
                Value::String(kind.to_string()),
                Value::String(key.to_string()),
                Value::String(signature(&data)?),
                Value::String(data),
                Value::from(expiry),
            ],
        )?;
        Ok(true)
    }

    /// Remove every entry of a collection's cache.
    pub fn flush(&self, collection: &str) -> Result<usize> {
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(format!("flush cache of {collection}")));
        }
        let table = table_name(collection);
        if !self.conn.object_exists(&table)? {
            return Ok(0);
        }
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {}", quote_ident(&table)), &[])?;
        if removed > 0 {
            log::info!("Flushed {removed} cache entries of {collection}");
        }
        Ok(removed)
    }

    pub fn prune(&self, collection: &str) -> Result<usize> {
        self.prune_at(collection, now())
    }

    /// Delete entries expired as of `now`.
    pub fn prune_at(&self, collection: &str, now: i64) -> Result<usize> {
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(format!("prune cache of {collection}")));
        }
        let table = table_name(collection);
        if !self.conn.object_exists(&table)? {
            return Ok(0);
        }
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE expiry != 0 AND expiry <= ?",
                quote_ident(&table)
            ),
            &[Value::from(now)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn open() -> Connection {
        Connection::open_in_memory(&StoreConfig::default()).unwrap()
    }

    fn config(enabled: bool, lifetime_secs: u64, auto_prune: bool) -> CacheConfig {
        CacheConfig {
            enabled,
            lifetime_secs,
            auto_prune,
        }
    }

    fn rows(conn: &Connection) -> i64 {
        conn.query_one("SELECT COUNT(*) FROM _cache_users", &[])
            .unwrap()
            .and_then(|v| v.as_i64())
            .unwrap()
    }

    #[test]
    fn test_hit_returns_newest_payload() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(true, 0, true));
        cache.ensure_table("users").unwrap();

        assert_eq!(cache.get("users", "select", "k1").unwrap(), None);
        assert!(cache.put("users", "select", "k1", &json!([{"a": 1}])).unwrap());
        assert!(cache.put("users", "select", "k1", &json!([{"a": 2}])).unwrap());
        assert_eq!(cache.get("users", "select", "k1").unwrap(), Some(json!([{"a": 2}])));
        assert_eq!(cache.get("users", "count", "k1").unwrap(), None);
    }

    #[test]
    fn test_same_payload_replaces_entry() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(true, 0, true));
        cache.ensure_table("users").unwrap();

        cache.put("users", "select", "k", &json!(1)).unwrap();
        cache.put("users", "select", "k", &json!(1)).unwrap();
        assert_eq!(rows(&conn), 1);
    }

    #[test]
    fn test_expired_entry_misses_and_is_pruned() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(true, 60, true));
        cache.ensure_table("users").unwrap();

        cache.put_at("users", "select", "k", &json!("v"), 1_000).unwrap();
        assert_eq!(cache.get_at("users", "select", "k", 1_059).unwrap(), Some(json!("v")));
        assert_eq!(rows(&conn), 1);

        assert_eq!(cache.get_at("users", "select", "k", 1_060).unwrap(), None);
        assert_eq!(rows(&conn), 0);
    }

    #[test]
    fn test_expired_rows_kept_without_auto_prune() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(true, 10, false));
        cache.ensure_table("users").unwrap();

        cache.put_at("users", "select", "k", &json!("v"), 100).unwrap();
        assert_eq!(cache.get_at("users", "select", "k", 500).unwrap(), None);
        assert_eq!(rows(&conn), 1);
        assert_eq!(cache.prune_at("users", 500).unwrap(), 1);
    }

    #[test]
    fn test_disabled_cache_never_touches_table() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(false, 0, true));
        cache.ensure_table("users").unwrap();

        assert!(!cache.put("users", "select", "k", &json!(1)).unwrap());
        assert_eq!(rows(&conn), 0);
        assert_eq!(cache.get("users", "select", "k").unwrap(), None);
    }

    #[test]
    fn test_flush() {
        let conn = open();
        let cache = ResultCache::new(&conn, &config(true, 0, true));
        assert_eq!(cache.flush("users").unwrap(), 0);

        cache.ensure_table("users").unwrap();
        cache.put("users", "select", "a", &json!(1)).unwrap();
        cache.put("users", "select", "b", &json!(2)).unwrap();
        assert_eq!(cache.flush("users").unwrap(), 2);
        assert_eq!(cache.get("users", "select", "a").unwrap(), None);
    }

    #[test]
    fn test_signature_is_stable() {
        let a = signature(&json!({"where": [1, 2]})).unwrap();
        let b = signature(&json!({"where": [1, 2]})).unwrap();
        let c = signature(&json!({"where": [2, 1]})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

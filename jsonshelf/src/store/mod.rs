mod collection;

pub use collection::{Collection, DocumentStream, QueryBuilder};

use crate::cache::{self, ResultCache};
use crate::config::{parse_config, StoreConfig};
use crate::connection::Connection;
use crate::error::{Result, ShelfError};
use crate::fts::FtsManager;
use crate::query::compiler::quote_ident;
use crate::validation::validate_collection_name;
use serde_json::Value;
use std::cell::Cell;
use std::path::Path;

/// The main entry point: one database connection, its collections and the
/// single-writer transaction coordinator.
pub struct Store {
    conn: Connection,
    config: StoreConfig,
    cache_enabled: Cell<bool>,
}

impl Store {
    /// Open (or create) a database file with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Store::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path.as_ref(), &config)?;
        Store::from_connection(conn, config)
    }

    /// Open a database file with settings read from a YAML file.
    pub fn open_with_config_file(
        path: impl AsRef<Path>,
        config_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let config = parse_config(config_path.as_ref())?;
        Store::open_with_config(path, config)
    }

    pub fn open_in_memory() -> Result<Self> {
        Store::open_in_memory_with_config(StoreConfig::default())
    }

    pub fn open_in_memory_with_config(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory(&config)?;
        Store::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self> {
        FtsManager::new(&conn).initialize()?;
        Ok(Store {
            cache_enabled: Cell::new(config.cache.enabled),
            conn,
            config,
        })
    }

    /// Get a collection handle, creating its table on first use.
    /// Read-only stores hand out handles to missing collections without creating them.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        validate_collection_name(name)?;
        if !self.conn.is_read_only() && !self.conn.object_exists(name)? {
            let table = quote_ident(name);
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY, doc JSON NOT NULL);
                 CREATE INDEX IF NOT EXISTS {index} ON {table} (json_extract(doc, '$.__id'));",
                index = quote_ident(&format!("_idx_{name}_id")),
            ))?;
            self.cache().ensure_table(name)?;
            log::info!("Created collection {name}");
        }
        Ok(Collection::new(self, name))
    }

    /// Names of existing collections, sorted.
    pub fn collections(&self) -> Result<Vec<String>> {
        let rows = self.conn.query_all(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_read_only(&self) -> bool {
        self.conn.is_read_only()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.get()
    }

    /// Turn result caching on or off for subsequent reads.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.set(enabled);
    }

    /// Compact the database. Returns false while a transaction is active.
    pub fn optimize(&self) -> Result<bool> {
        self.require_writable("optimize the database")?;
        self.conn.optimize()
    }

    // ── Transaction Coordinator ─────────────────────────────────────

    /// Begin a transaction owned by `scope`.
    ///
    /// Returns false when `scope` already owns the active transaction.
    /// Fails with `Conflict` when another scope owns it.
    pub fn begin_transaction(&self, scope: &str) -> Result<bool> {
        self.require_writable(&format!("begin a transaction for {scope}"))?;
        let state = self.conn.transaction_state();
        if state.active {
            return match state.owner.as_deref() {
                Some(owner) if owner == scope => self.conn.begin_transaction(),
                owner => Err(ShelfError::Conflict(format!(
                    "transaction already active for '{}', cannot begin for '{scope}'",
                    owner.unwrap_or("<unowned>")
                ))),
            };
        }
        let began = self.conn.begin_transaction()?;
        if began {
            self.conn.set_transaction_owner(scope);
            log::debug!("Transaction begun for {scope}");
        }
        Ok(began)
    }

    /// Commit the transaction owned by `scope`. Returns false if none is active.
    pub fn commit(&self, scope: &str) -> Result<bool> {
        self.check_owner(scope, "commit")?;
        self.conn.commit()
    }

    /// Roll back the transaction owned by `scope`. Returns false if none is active.
    pub fn rollback(&self, scope: &str) -> Result<bool> {
        self.check_owner(scope, "roll back")?;
        self.conn.rollback()
    }

    /// Run `body` in a transaction owned by `scope`. Joins the active
    /// transaction when `scope` already owns it; otherwise commits on success
    /// and rolls back on error.
    pub fn with_transaction<T, F>(&self, scope: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if !self.begin_transaction(scope)? {
            return body();
        }
        match body() {
            Ok(value) => {
                self.commit(scope)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(undo) = self.rollback(scope) {
                    log::warn!("Rollback for {scope} failed: {undo}");
                }
                Err(e)
            }
        }
    }

    fn check_owner(&self, scope: &str, action: &str) -> Result<()> {
        let state = self.conn.transaction_state();
        match state.owner.as_deref() {
            Some(owner) if state.active && owner != scope => Err(ShelfError::Conflict(format!(
                "cannot {action} for '{scope}': transaction is owned by '{owner}'"
            ))),
            _ => Ok(()),
        }
    }

    // ── Internals shared with collections ───────────────────────────

    pub(crate) fn require_writable(&self, action: &str) -> Result<()> {
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(action.to_string()));
        }
        Ok(())
    }

    pub(crate) fn cache(&self) -> ResultCache<'_> {
        let mut config = self.config.cache.clone();
        config.enabled = self.cache_enabled.get();
        ResultCache::new(&self.conn, &config)
    }

    /// Store a cache entry, in its own transaction unless one is already active.
    pub(crate) fn write_cache(
        &self,
        collection: &str,
        kind: &str,
        key: &str,
        payload: &Value,
    ) -> Result<bool> {
        let cache = self.cache();
        if self.conn.is_read_only() || self.conn.in_transaction() {
            return cache.put(collection, kind, key, payload);
        }
        self.with_transaction(&cache::table_name(collection), || {
            cache.put(collection, kind, key, payload)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::document::Document;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_collection_is_created_lazily() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.collections().unwrap().is_empty());

        store.collection("users").unwrap();
        store.collection("posts").unwrap();
        store.collection("users").unwrap();

        assert_eq!(store.collections().unwrap(), vec!["posts", "users"]);
        assert!(store.connection().object_exists("_cache_users").unwrap());
    }

    #[test]
    fn test_invalid_collection_name() {
        let store = Store::open_in_memory().unwrap();
        for name in ["", "bad-name", "_private", "sqlite_stat1", "a b"] {
            assert!(
                matches!(store.collection(name), Err(ShelfError::Validation(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn test_transaction_scope_conflict() {
        let store = Store::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();

        assert!(store.begin_transaction("users").unwrap());
        let err = store.begin_transaction("posts").unwrap_err();
        assert!(matches!(err, ShelfError::Conflict(_)));
        assert!(matches!(
            posts.save(doc(json!({"title": "x"}))),
            Err(ShelfError::Conflict(_))
        ));
        assert!(matches!(store.commit("posts"), Err(ShelfError::Conflict(_))));

        let state = store.connection().transaction_state();
        assert!(state.active);
        assert_eq!(state.owner.as_deref(), Some("users"));

        users.save(doc(json!({"__id": "1"}))).unwrap();
        assert!(store.commit("users").unwrap());
        assert!(!store.commit("users").unwrap());
        assert_eq!(posts.count(&Default::default()).unwrap(), 0);
        assert_eq!(users.count(&Default::default()).unwrap(), 1);
    }

    #[test]
    fn test_same_scope_delegates() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.begin_transaction("users").unwrap());
        assert!(!store.begin_transaction("users").unwrap());
        assert!(store.rollback("users").unwrap());
        assert!(!store.rollback("users").unwrap());
        assert!(!store.connection().in_transaction());
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let users = store.collection("users").unwrap();

        let result: Result<()> = store.with_transaction("users", || {
            users.save(doc(json!({"__id": "a"})))?;
            Err(ShelfError::Validation("stop".into()))
        });
        assert!(result.is_err());
        assert!(users.get("a").unwrap().is_none());
        assert!(!store.connection().in_transaction());
    }

    #[test]
    fn test_optimize() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.optimize().unwrap());
        store.begin_transaction("users").unwrap();
        assert!(!store.optimize().unwrap());
        store.rollback("users").unwrap();
    }

    #[test]
    fn test_read_only_store() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shelf.db");
        {
            let store = Store::open(&path).unwrap();
            let users = store.collection("users").unwrap();
            users.save(doc(json!({"__id": "1", "name": "Ada"}))).unwrap();
        }

        let config = StoreConfig {
            read_only: true,
            ..StoreConfig::default()
        };
        let store = Store::open_with_config(&path, config).unwrap();
        let users = store.collection("users").unwrap();

        assert_eq!(users.find_all().unwrap().len(), 1);
        assert!(matches!(store.begin_transaction("users"), Err(ShelfError::ReadOnly(_))));
        assert!(matches!(
            users.save(doc(json!({"name": "Bob"}))),
            Err(ShelfError::ReadOnly(_))
        ));
        assert!(matches!(users.delete("1"), Err(ShelfError::ReadOnly(_))));
        assert!(matches!(users.flush_cache(), Err(ShelfError::ReadOnly(_))));
        assert!(matches!(users.add_index(&["name"]), Err(ShelfError::ReadOnly(_))));
        assert!(matches!(store.optimize(), Err(ShelfError::ReadOnly(_))));

        let missing = store.collection("ghosts").unwrap();
        assert!(missing.find_all().unwrap().is_empty());
        assert!(missing.get("1").unwrap().is_none());
        assert!(!store.connection().object_exists("ghosts").unwrap());
    }

    #[test]
    fn test_open_with_config_file() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("shelf.yaml");
        std::fs::write(&config_path, "cache:\n  enabled: false\nid_strategy: ulid\n").unwrap();

        let store = Store::open_with_config_file(tmp.path().join("shelf.db"), &config_path).unwrap();
        assert!(!store.cache_enabled());

        let users = store.collection("users").unwrap();
        let saved = users.save(doc(json!({"name": "Ada"}))).unwrap();
        assert_eq!(saved.id().map(str::len), Some(26));
    }

    #[test]
    fn test_cache_toggle_does_not_serve_stale_payload() {
        let config = StoreConfig {
            cache: CacheConfig {
                enabled: true,
                ..CacheConfig::default()
            },
            ..StoreConfig::default()
        };
        let store = Store::open_in_memory_with_config(config).unwrap();
        let users = store.collection("users").unwrap();
        users.save(doc(json!({"__id": "1", "name": "Ada"}))).unwrap();

        let query = users.query().filter("name", "=", "Ada");
        assert_eq!(query.fetch().unwrap().len(), 1);

        // bypass the collection so the cache is not flushed
        store
            .connection()
            .execute("DELETE FROM users", &[])
            .unwrap();
        assert_eq!(query.fetch().unwrap().len(), 1);

        store.set_cache_enabled(false);
        assert!(query.fetch().unwrap().is_empty());
    }
}

// Full-text indexes over collection fields, kept in sync by triggers

use crate::connection::Connection;
use crate::error::{Result, ShelfError};
use crate::query::compiler::quote_ident;
use crate::validation::{is_path_search, json_path, validate_collection_name, validate_field_name};
use glob::Pattern;
use serde_json::Value;

pub const REGISTRY_TABLE: &str = "_fts_registry";

const HASH_LEN: usize = 16;

/// Name suffixes of the view and triggers created next to each FTS table.
const ARTIFACT_SUFFIXES: [&str; 4] = ["_src", "_ai", "_au", "_ad"];

/// One full-text index: the collection, its field set and the derived artifact names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub collection: String,
    pub hash_id: String,
    /// Indexed fields; column `cN` holds `fields[N]`.
    pub fields: Vec<String>,
}

impl IndexDescriptor {
    pub fn new(collection: &str, fields: Vec<String>) -> Self {
        IndexDescriptor {
            collection: collection.to_string(),
            hash_id: hash_fields(&fields),
            fields,
        }
    }

    /// The FTS5 virtual table.
    pub fn table_name(&self) -> String {
        format!("_fts_{}_{}", self.collection, self.hash_id)
    }

    /// The view the virtual table reads its content from.
    pub fn view_name(&self) -> String {
        format!("{}_src", self.table_name())
    }

    /// Insert, update and delete triggers on the collection table.
    pub fn trigger_names(&self) -> [String; 3] {
        let table = self.table_name();
        [format!("{table}_ai"), format!("{table}_au"), format!("{table}_ad")]
    }

    /// FTS column holding `field`, compared case-insensitively.
    pub fn column_for(&self, field: &str) -> Option<String> {
        let field = field.trim();
        self.fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case(field))
            .map(|i| format!("c{i}"))
    }

    pub fn covers(&self, fields: &[String]) -> bool {
        fields.iter().all(|f| self.column_for(f).is_some())
    }

    fn columns(&self) -> Vec<String> {
        (0..self.fields.len()).map(|i| format!("c{i}")).collect()
    }
}

/// Outcome of `FtsManager::ensure_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredIndex {
    pub descriptor: IndexDescriptor,
    /// False when an existing index already covered the fields.
    pub created: bool,
}

/// Trim, validate, de-duplicate (case-insensitively) and sort index fields.
pub fn normalize_fields<S: AsRef<str>>(fields: &[S]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        let field = field.as_ref().trim();
        validate_field_name(field)?;
        if is_path_search(field) {
            return Err(ShelfError::Validation(format!(
                "Full-text field '{field}' cannot use '[]'"
            )));
        }
        if !normalized.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            normalized.push(field.to_string());
        }
    }
    normalized.sort_by_key(|f| f.to_lowercase());
    Ok(normalized)
}

/// Stable id of a field set: blake3 over the lower-cased, comma-joined fields.
pub fn hash_fields(fields: &[String]) -> String {
    let key = fields
        .iter()
        .map(|f| f.to_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    blake3::hash(key.as_bytes()).to_hex().as_str()[..HASH_LEN].to_string()
}

pub struct FtsManager<'c> {
    conn: &'c Connection,
}

impl<'c> FtsManager<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        FtsManager { conn }
    }

    /// Create the registry table. A no-op on read-only connections.
    pub fn initialize(&self) -> Result<()> {
        if self.conn.is_read_only() {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
                collection TEXT NOT NULL,
                hash TEXT NOT NULL,
                fields TEXT NOT NULL,
                PRIMARY KEY (collection, hash)
            )"
        ))
    }

    /// Registered indexes of a collection, ordered by hash.
    pub fn indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
        if !self.conn.object_exists(REGISTRY_TABLE)? {
            return Ok(Vec::new());
        }
        let rows = self.conn.query_all(
            &format!("SELECT hash, fields FROM {REGISTRY_TABLE} WHERE collection = ? ORDER BY hash"),
            &[Value::String(collection.to_string())],
        )?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let fields_text = row.get("fields").and_then(Value::as_str).unwrap_or("[]");
            let fields: Vec<String> = serde_json::from_str(fields_text)?;
            indexes.push(IndexDescriptor {
                collection: collection.to_string(),
                hash_id: row
                    .get("hash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                fields,
            });
        }
        Ok(indexes)
    }

    /// The smallest registered index containing every field.
    pub fn find_covering<S: AsRef<str>>(
        &self,
        collection: &str,
        fields: &[S],
    ) -> Result<Option<IndexDescriptor>> {
        let wanted = normalize_fields(fields)?;
        Ok(self
            .indexes(collection)?
            .into_iter()
            .filter(|index| index.covers(&wanted))
            .min_by_key(|index| index.fields.len()))
    }

    /// Return an index covering `fields`, creating it if needed. Existing
    /// indexes over a subset of the fields are replaced by the new one.
    pub fn ensure_index<S: AsRef<str>>(&self, collection: &str, fields: &[S]) -> Result<EnsuredIndex> {
        validate_collection_name(collection)?;
        if !self.conn.supports_fts() {
            return Err(ShelfError::Capability(
                "full-text search requires SQLite built with FTS5".into(),
            ));
        }
        let wanted = normalize_fields(fields)?;
        if wanted.is_empty() {
            return Err(ShelfError::Validation("Full-text index needs at least one field".into()));
        }

        if let Some(descriptor) = self.find_covering(collection, &wanted)? {
            return Ok(EnsuredIndex {
                descriptor,
                created: false,
            });
        }
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(format!(
                "create full-text index on {collection}({})",
                wanted.join(", ")
            )));
        }

        let descriptor = IndexDescriptor::new(collection, wanted);
        self.conn.savepoint("fts_ensure", || {
            self.initialize()?;
            for existing in self.indexes(collection)? {
                if descriptor.covers(&existing.fields) {
                    self.remove(&existing)?;
                    log::info!(
                        "Replaced full-text index {} on {collection} with {}",
                        existing.hash_id,
                        descriptor.hash_id
                    );
                }
            }
            self.create(&descriptor)
        })?;

        log::info!(
            "Created full-text index {} on {collection}({})",
            descriptor.hash_id,
            descriptor.fields.join(", ")
        );
        Ok(EnsuredIndex {
            descriptor,
            created: true,
        })
    }

    /// Drop one index. Returns false if it was not registered.
    pub fn drop_index(&self, collection: &str, hash_id: &str) -> Result<bool> {
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(format!("drop full-text index {hash_id}")));
        }
        let Some(index) = self
            .indexes(collection)?
            .into_iter()
            .find(|index| index.hash_id == hash_id)
        else {
            return Ok(false);
        };
        self.conn.savepoint("fts_drop", || self.remove(&index))?;
        log::info!("Dropped full-text index {hash_id} on {collection}");
        Ok(true)
    }

    /// Drop every index of a collection, including unregistered leftovers.
    /// Returns the number of registered indexes removed.
    pub fn drop_all(&self, collection: &str) -> Result<usize> {
        if self.conn.is_read_only() {
            return Err(ShelfError::ReadOnly(format!("drop full-text indexes of {collection}")));
        }
        let indexes = self.indexes(collection)?;
        self.conn.savepoint("fts_drop_all", || {
            for index in &indexes {
                self.remove(index)?;
            }
            let hex = "[0-9a-f]".repeat(HASH_LEN);
            self.teardown(&format!("_fts_{}_{hex}", Pattern::escape(collection)))
        })?;
        if !indexes.is_empty() {
            log::info!("Dropped {} full-text index(es) on {collection}", indexes.len());
        }
        Ok(indexes.len())
    }

    // ── Artifacts ────────────────────────────────────────────────────

    fn create(&self, index: &IndexDescriptor) -> Result<()> {
        let collection = quote_ident(&index.collection);
        let table = quote_ident(&index.table_name());
        let view = index.view_name();
        let columns = index.columns().join(", ");
        let [ai, au, ad] = index.trigger_names().map(|name| quote_ident(&name));

        let extract = |row: &str| {
            index
                .fields
                .iter()
                .map(|f| format!("json_extract({row}doc, '{}')", json_path(f)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let view_columns = index
            .fields
            .iter()
            .zip(index.columns())
            .map(|(f, c)| format!("json_extract(doc, '{}') AS {c}", json_path(f)))
            .collect::<Vec<_>>()
            .join(", ");
        let (new_values, old_values) = (extract("new."), extract("old."));

        self.conn.execute_batch(&format!(
            "CREATE VIEW {view_q} AS SELECT rowid AS doc_rowid, {view_columns} FROM {collection};
             CREATE VIRTUAL TABLE {table} USING fts5({columns}, content='{view}', content_rowid='doc_rowid');
             CREATE TRIGGER {ai} AFTER INSERT ON {collection} BEGIN
                 INSERT INTO {table}(rowid, {columns}) VALUES (new.rowid, {new_values});
             END;
             CREATE TRIGGER {ad} AFTER DELETE ON {collection} BEGIN
                 INSERT INTO {table}({table}, rowid, {columns}) VALUES ('delete', old.rowid, {old_values});
             END;
             CREATE TRIGGER {au} AFTER UPDATE ON {collection} BEGIN
                 INSERT INTO {table}({table}, rowid, {columns}) VALUES ('delete', old.rowid, {old_values});
                 INSERT INTO {table}(rowid, {columns}) VALUES (new.rowid, {new_values});
             END;
             INSERT INTO {table}({table}) VALUES ('rebuild');",
            view_q = quote_ident(&view),
        ))?;

        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {REGISTRY_TABLE} (collection, hash, fields) VALUES (?, ?, ?)"),
            &[
                Value::String(index.collection.clone()),
                Value::String(index.hash_id.clone()),
                Value::String(serde_json::to_string(&index.fields)?),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, index: &IndexDescriptor) -> Result<()> {
        self.teardown(&Pattern::escape(&index.table_name()))?;
        self.conn.execute(
            &format!("DELETE FROM {REGISTRY_TABLE} WHERE collection = ? AND hash = ?"),
            &[
                Value::String(index.collection.clone()),
                Value::String(index.hash_id.clone()),
            ],
        )?;
        Ok(())
    }

    /// Drop the FTS tables matching `table_pattern` along with their views and
    /// triggers. Names are matched whole, so another collection whose name
    /// extends this one is left alone. FTS shadow tables are left to the
    /// virtual table's own DROP.
    fn teardown(&self, table_pattern: &str) -> Result<()> {
        let patterns = std::iter::once(table_pattern.to_string())
            .chain(ARTIFACT_SUFFIXES.iter().map(|suffix| format!("{table_pattern}{suffix}")))
            .map(|text| {
                Pattern::new(&text).map_err(|e| {
                    ShelfError::Validation(format!("Bad artifact pattern '{text}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let objects = self.conn.query_all(
            "SELECT type, name, sql FROM sqlite_master WHERE type IN ('trigger', 'view', 'table')",
            &[],
        )?;

        let mut triggers = Vec::new();
        let mut views = Vec::new();
        let mut tables = Vec::new();
        for object in &objects {
            let name = object.get("name").and_then(Value::as_str).unwrap_or_default();
            if !patterns.iter().any(|pattern| pattern.matches(name)) {
                continue;
            }
            let sql = object.get("sql").and_then(Value::as_str).unwrap_or_default();
            match object.get("type").and_then(Value::as_str) {
                Some("trigger") => triggers.push(name),
                Some("view") => views.push(name),
                Some("table") if sql.starts_with("CREATE VIRTUAL") => tables.push(name),
                _ => {}
            }
        }

        let mut ddl = String::new();
        for name in triggers {
            ddl.push_str(&format!("DROP TRIGGER IF EXISTS {};\n", quote_ident(name)));
        }
        for name in tables {
            ddl.push_str(&format!("DROP TABLE IF EXISTS {};\n", quote_ident(name)));
        }
        for name in views {
            ddl.push_str(&format!("DROP VIEW IF EXISTS {};\n", quote_ident(name)));
        }
        if ddl.is_empty() {
            return Ok(());
        }
        self.conn.execute_batch(&ddl)
    }
}

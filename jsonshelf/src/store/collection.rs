use super::Store;
use crate::cache::{self, signature};
use crate::connection::{Row, RowStream};
use crate::document::{Document, ID_FIELD};
use crate::error::{Result, ShelfError};
use crate::fts::{FtsManager, IndexDescriptor};
use crate::query::compiler::quote_ident;
use crate::query::{CompiledQuery, Direction, Query, QueryCompiler};
use serde_json::Value;

/// A handle to one collection of a store.
pub struct Collection<'s> {
    store: &'s Store,
    name: String,
}

impl<'s> Collection<'s> {
    pub(super) fn new(store: &'s Store, name: &str) -> Self {
        Collection {
            store,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the backing table exists.
    pub fn exists(&self) -> Result<bool> {
        self.store.conn.object_exists(&self.name)
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        self.find_one_by(&[(ID_FIELD, Value::String(id.to_string()))])
    }

    /// First document whose fields equal every criterion.
    pub fn find_one_by(&self, criteria: &[(&str, Value)]) -> Result<Option<Document>> {
        self.first(&criteria_query(criteria))
    }

    pub fn find_all_by(
        &self,
        criteria: &[(&str, Value)],
        order_by: &[(&str, Direction)],
        limit: Option<i64>,
        offset: u64,
    ) -> Result<Vec<Document>> {
        let mut query = criteria_query(criteria);
        for (field, direction) in order_by {
            query = query.order_by(field, direction);
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        self.fetch(&query.offset(offset))
    }

    pub fn find_all(&self) -> Result<Vec<Document>> {
        self.fetch(&Query::new())
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Insert the document, or replace the stored one carrying the same `__id`.
    /// Documents without an id get one from the configured strategy.
    pub fn save(&self, doc: Document) -> Result<Document> {
        self.store.require_writable(&format!("save to {}", self.name))?;
        self.store.with_transaction(&self.name, || {
            let doc = self.write(doc)?;
            self.invalidate()?;
            Ok(doc)
        })
    }

    /// Save a batch atomically: either every document is stored or none is.
    pub fn save_all(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.store.require_writable(&format!("save to {}", self.name))?;
        self.store.with_transaction(&self.name, || {
            let saved = docs.into_iter().map(|doc| self.write(doc)).collect::<Result<Vec<_>>>()?;
            self.invalidate()?;
            Ok(saved)
        })
    }

    /// Apply dotted-path changes to a stored document. Returns None if no
    /// document has this id.
    pub fn update(&self, id: &str, changes: &[(&str, Value)]) -> Result<Option<Document>> {
        self.store.require_writable(&format!("update {}", self.name))?;
        if changes.iter().any(|(path, _)| *path == ID_FIELD) {
            return Err(ShelfError::Validation(format!("'{ID_FIELD}' cannot be updated")));
        }
        self.store.with_transaction(&self.name, || {
            let Some(mut doc) = self.load_by_id(id)? else {
                return Ok(None);
            };
            for (path, value) in changes {
                doc.set(path, value.clone())?;
            }
            let doc = self.write(doc)?;
            self.invalidate()?;
            Ok(Some(doc))
        })
    }

    /// Delete by id. Returns false if nothing carried the id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.store.require_writable(&format!("delete from {}", self.name))?;
        if !self.exists()? {
            return Ok(false);
        }
        self.store.with_transaction(&self.name, || {
            if self.id_count(id)? == 0 {
                return Ok(false);
            }
            self.store.conn.execute(
                &format!(
                    "DELETE FROM {} WHERE json_extract(doc, '$.{ID_FIELD}') = ?",
                    quote_ident(&self.name)
                ),
                &[Value::String(id.to_string())],
            )?;
            self.invalidate()?;
            Ok(true)
        })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            collection: self,
            query: Query::new(),
        }
    }

    /// Documents matching the query. Queries with a search phrase go through
    /// the full-text index.
    pub fn fetch(&self, query: &Query) -> Result<Vec<Document>> {
        if query.search.is_some() {
            return self.search(query);
        }
        let compiled = self.compile(query)?;
        if !self.exists()? {
            return Ok(Vec::new());
        }
        self.prepare_joins(query)?;

        let value = self.cached("select", query, || {
            let docs = self.store.conn.query_stream(&compiled.sql, &compiled.params, |rows| {
                rows.map(|row| row.and_then(doc_value)).collect::<Result<Vec<_>>>()
            })?;
            Ok(Value::Array(docs))
        })?;
        decode_all(value)
    }

    pub fn first(&self, query: &Query) -> Result<Option<Document>> {
        let mut limited = query.clone();
        limited.limit = 1;
        Ok(self.fetch(&limited)?.into_iter().next())
    }

    /// Number of matching documents, ignoring limit and offset.
    pub fn count(&self, query: &Query) -> Result<u64> {
        if query.search.is_some() {
            let mut unpaged = query.clone();
            unpaged.limit = -1;
            unpaged.offset = 0;
            return Ok(self.search(&unpaged)?.len() as u64);
        }
        let compiled = QueryCompiler::new(&self.name).compile_count(query)?;
        if !self.exists()? {
            return Ok(0);
        }

        let value = self.cached("count", query, || {
            Ok(self
                .store
                .conn
                .query_one(&compiled.sql, &compiled.params)?
                .unwrap_or(Value::from(0)))
        })?;
        value
            .as_u64()
            .ok_or_else(|| ShelfError::Validation(format!("Unexpected count result {value}")))
    }

    /// Delete every document the query matches. Returns the number removed.
    pub fn delete_where(&self, query: &Query) -> Result<usize> {
        self.store.require_writable(&format!("delete from {}", self.name))?;
        if query.search.is_some() {
            return Err(ShelfError::Validation(
                "Delete does not support full-text search".into(),
            ));
        }
        let compiled = QueryCompiler::new(&self.name).compile_delete(query)?;
        if !self.exists()? {
            return Ok(0);
        }
        self.store.with_transaction(&self.name, || {
            let removed = self.store.conn.execute(&compiled.sql, &compiled.params)?;
            self.invalidate()?;
            Ok(removed)
        })
    }

    /// Full-text search ranked by relevance, creating a covering index when needed.
    pub fn search(&self, query: &Query) -> Result<Vec<Document>> {
        let spec = query
            .search
            .as_ref()
            .ok_or_else(|| ShelfError::Validation("Query has no search phrase".into()))?;
        if !self.store.conn.supports_fts() {
            return Err(ShelfError::Capability(
                "full-text search requires SQLite built with FTS5".into(),
            ));
        }
        if !self.exists()? {
            return Ok(Vec::new());
        }
        self.prepare_joins(query)?;

        let index = FtsManager::new(&self.store.conn)
            .ensure_index(&self.name, &spec.fields)?
            .descriptor;
        let compiled = QueryCompiler::new(&self.name).compile_search(query, &index)?;

        let value = self.cached("search", query, || {
            let docs = self.store.conn.query_stream(&compiled.sql, &compiled.params, |rows| {
                rows.map(|row| row.and_then(doc_value)).collect::<Result<Vec<_>>>()
            })?;
            Ok(Value::Array(docs))
        })?;
        decode_all(value)
    }

    /// Hand a lazy stream of matching documents to `consume`. Results are never cached.
    pub fn stream<T, F>(&self, query: &Query, consume: F) -> Result<T>
    where
        F: FnOnce(DocumentStream<'_>) -> Result<T>,
    {
        if query.search.is_some() {
            return Err(ShelfError::Validation(
                "Streaming does not support full-text search".into(),
            ));
        }
        let compiled = self.compile(query)?;
        if !self.exists()? {
            return self
                .store
                .conn
                .query_stream("SELECT NULL AS doc WHERE 0", &[], |rows| {
                    consume(DocumentStream { rows })
                });
        }
        self.prepare_joins(query)?;
        self.store
            .conn
            .query_stream(&compiled.sql, &compiled.params, |rows| {
                consume(DocumentStream { rows })
            })
    }

    /// SQL the query runs as.
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        let mut compiler = QueryCompiler::new(&self.name);
        match &query.search {
            Some(spec) => {
                let fields = crate::fts::normalize_fields(&spec.fields)?;
                let index = FtsManager::new(&self.store.conn)
                    .find_covering(&self.name, &fields)?
                    .unwrap_or_else(|| IndexDescriptor::new(&self.name, fields));
                compiler.compile_search(query, &index)
            }
            None => compiler.compile_select(query),
        }
    }

    // ── Indexes / cache ──────────────────────────────────────────────

    /// Make sure a full-text index covers `fields`. Returns false when one already did.
    pub fn add_index(&self, fields: &[&str]) -> Result<bool> {
        if !self.store.conn.is_read_only() && !self.exists()? {
            self.store.collection(&self.name)?;
        }
        let ensured = FtsManager::new(&self.store.conn).ensure_index(&self.name, fields)?;
        Ok(ensured.created)
    }

    pub fn drop_index(&self, hash_id: &str) -> Result<bool> {
        FtsManager::new(&self.store.conn).drop_index(&self.name, hash_id)
    }

    pub fn indexes(&self) -> Result<Vec<IndexDescriptor>> {
        FtsManager::new(&self.store.conn).indexes(&self.name)
    }

    /// Remove every cached result of this collection.
    pub fn flush_cache(&self) -> Result<usize> {
        self.store.cache().flush(&self.name)
    }

    // ── Scoped transactions ──────────────────────────────────────────

    pub fn begin_transaction(&self) -> Result<bool> {
        self.store.begin_transaction(&self.name)
    }

    pub fn commit(&self) -> Result<bool> {
        self.store.commit(&self.name)
    }

    pub fn rollback(&self) -> Result<bool> {
        self.store.rollback(&self.name)
    }

    /// Drop the table, its cache and its full-text indexes. Returns false if
    /// the collection did not exist.
    pub fn drop_collection(&self) -> Result<bool> {
        self.store.require_writable(&format!("drop {}", self.name))?;
        if !self.exists()? {
            return Ok(false);
        }
        self.store.with_transaction(&self.name, || {
            FtsManager::new(&self.store.conn).drop_all(&self.name)?;
            self.store.conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
                quote_ident(&self.name),
                quote_ident(&cache::table_name(&self.name))
            ))
        })?;
        log::info!("Dropped collection {}", self.name);
        Ok(true)
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Insert or replace one document. Runs inside the caller's transaction.
    fn write(&self, mut doc: Document) -> Result<Document> {
        let id = match doc.fields().get(ID_FIELD) {
            None => {
                let id = self.store.config.id_strategy.generate();
                doc.set_id(id.clone());
                id
            }
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(ShelfError::Validation(format!(
                    "'{ID_FIELD}' must be a non-empty string, got {other}"
                )))
            }
        };

        let table = quote_ident(&self.name);
        let text = doc.encode()?;
        match self.id_count(&id)? {
            0 => {
                self.store.conn.execute(
                    &format!("INSERT INTO {table} (doc) VALUES (?)"),
                    &[Value::String(text)],
                )?;
            }
            1 => {
                self.store.conn.execute(
                    &format!("UPDATE {table} SET doc = ? WHERE json_extract(doc, '$.{ID_FIELD}') = ?"),
                    &[Value::String(text), Value::String(id)],
                )?;
            }
            _ => return Err(id_conflict(&self.name, &id)),
        }
        Ok(doc)
    }

    /// Rows carrying `id`. More than one is a `Conflict`.
    fn id_count(&self, id: &str) -> Result<u64> {
        let count = self
            .store
            .conn
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE json_extract(doc, '$.{ID_FIELD}') = ?",
                    quote_ident(&self.name)
                ),
                &[Value::String(id.to_string())],
            )?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if count > 1 {
            return Err(id_conflict(&self.name, id));
        }
        Ok(count)
    }

    fn load_by_id(&self, id: &str) -> Result<Option<Document>> {
        self.id_count(id)?;
        let query = Query::new().filter(ID_FIELD, "=", id).limit(1);
        let compiled = QueryCompiler::new(&self.name).compile_select(&query)?;
        let rows = self.store.conn.query_all(&compiled.sql, &compiled.params)?;
        rows.into_iter()
            .next()
            .map(|row| doc_value(row).and_then(Document::from_value))
            .transpose()
    }

    /// Joined collections must exist for the embedding subqueries to run.
    fn prepare_joins(&self, query: &Query) -> Result<()> {
        for join in &query.joins {
            let foreign = self.store.collection(&join.foreign_collection)?;
            if !foreign.exists()? {
                return Err(ShelfError::Validation(format!(
                    "Joined collection '{}' does not exist",
                    join.foreign_collection
                )));
            }
        }
        Ok(())
    }

    /// Serve from the result cache, or run `load` and remember its result.
    /// Queries with joins are not cached since writes to the joined
    /// collection do not flush this collection's cache.
    fn cached<F>(&self, kind: &str, query: &Query, load: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        let cache = self.store.cache();
        if !cache.is_enabled() || !query.joins.is_empty() {
            return load();
        }
        let key = signature(&(kind, &self.name, query))?;
        if let Some(hit) = cache.get(&self.name, kind, &key)? {
            return Ok(hit);
        }
        let value = load()?;
        self.store.write_cache(&self.name, kind, &key, &value)?;
        Ok(value)
    }

    /// Writes make every cached result of the collection stale. Runs inside
    /// the write's transaction so the flush commits or rolls back with it.
    fn invalidate(&self) -> Result<()> {
        if self.store.conn.is_read_only() {
            return Ok(());
        }
        self.store.cache().flush(&self.name)?;
        Ok(())
    }
}

fn id_conflict(collection: &str, id: &str) -> ShelfError {
    ShelfError::Conflict(format!(
        "more than one document in {collection} has {ID_FIELD} '{id}'"
    ))
}

fn criteria_query(criteria: &[(&str, Value)]) -> Query {
    criteria
        .iter()
        .fold(Query::new(), |query, (field, value)| query.filter(field, "=", value.clone()))
}

fn doc_value(mut row: Row) -> Result<Value> {
    match row.remove("doc") {
        Some(Value::String(text)) => Ok(serde_json::from_str(&text)?),
        other => Err(ShelfError::Validation(format!(
            "Stored document is not JSON text: {}",
            other.unwrap_or(Value::Null)
        ))),
    }
}

fn decode_all(value: Value) -> Result<Vec<Document>> {
    match value {
        Value::Array(items) => items.into_iter().map(Document::from_value).collect(),
        other => Err(ShelfError::Validation(format!(
            "Cached result is not a document list: {other}"
        ))),
    }
}

/// Lazy documents of a running query.
pub struct DocumentStream<'s> {
    rows: RowStream<'s>,
}

impl Iterator for DocumentStream<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows
            .next()
            .map(|row| row.and_then(doc_value).and_then(Document::from_value))
    }
}

// ── Query Builder ──────────────────────────────────────────────────

/// A `Query` bound to a collection. Terminal operations borrow the builder,
/// so the same builder can run any number of times.
pub struct QueryBuilder<'a> {
    collection: &'a Collection<'a>,
    query: Query,
}

impl<'a> QueryBuilder<'a> {
    pub fn filter(mut self, field: &str, op: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.query = self.query.filter(field, op, value);
        self
    }

    pub fn or_filter(mut self, field: &str, op: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.query = self.query.or_filter(field, op, value);
        self
    }

    /// Start an OR-group.
    pub fn union(mut self) -> Self {
        self.query = self.query.union();
        self
    }

    /// Start an AND-group.
    pub fn intersect(mut self) -> Self {
        self.query = self.query.intersect();
        self
    }

    pub fn order_by(mut self, field: &str, direction: impl AsRef<str>) -> Self {
        self.query = self.query.order_by(field, direction);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.query = self.query.offset(offset);
        self
    }

    pub fn join(
        mut self,
        foreign_collection: &str,
        foreign_field: &str,
        local_field: &str,
        exclude_foreign_field: bool,
    ) -> Self {
        self.query = self
            .query
            .join(foreign_collection, foreign_field, local_field, exclude_foreign_field);
        self
    }

    pub fn search(mut self, phrase: &str, fields: &[&str]) -> Self {
        self.query = self.query.search(phrase, fields);
        self
    }

    pub fn as_query(&self) -> &Query {
        &self.query
    }

    pub fn into_query(self) -> Query {
        self.query
    }

    pub fn fetch(&self) -> Result<Vec<Document>> {
        self.collection.fetch(&self.query)
    }

    pub fn first(&self) -> Result<Option<Document>> {
        self.collection.first(&self.query)
    }

    pub fn count(&self) -> Result<u64> {
        self.collection.count(&self.query)
    }

    pub fn delete(&self) -> Result<usize> {
        self.collection.delete_where(&self.query)
    }

    pub fn stream<T, F>(&self, consume: F) -> Result<T>
    where
        F: FnOnce(DocumentStream<'_>) -> Result<T>,
    {
        self.collection.stream(&self.query, consume)
    }

    pub fn to_sql(&self) -> Result<CompiledQuery> {
        self.collection.compile(&self.query)
    }
}

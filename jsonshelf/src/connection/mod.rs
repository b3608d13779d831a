use crate::config::StoreConfig;
use crate::error::{Result, ShelfError};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Per-connection transaction bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionState {
    pub active: bool,
    /// Scope (collection or cache table) that opened the transaction.
    pub owner: Option<String>,
}

/// Owns the native SQLite handle. Not shareable across threads; open one per worker.
pub struct Connection {
    conn: rusqlite::Connection,
    read_only: bool,
    fts5: bool,
    tx: RefCell<TransactionState>,
}

impl Connection {
    /// Open (or create) a database file.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let flags = if config.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::default()
        };
        let conn = rusqlite::Connection::open_with_flags(path, flags).map_err(|e| {
            ShelfError::Connection(format!("Failed to open {}: {e}", path.display()))
        })?;
        Self::configure(conn, config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| ShelfError::Connection(format!("Failed to open in-memory database: {e}")))?;
        Self::configure(conn, config)
    }

    fn configure(conn: rusqlite::Connection, config: &StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| ShelfError::Connection(format!("Failed to set busy timeout: {e}")))?;
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);

        let json_ok: rusqlite::Result<i64> =
            conn.query_row("SELECT json_valid('{}')", [], |row| row.get(0));
        if json_ok.is_err() {
            return Err(ShelfError::Connection(
                "SQLite build lacks the JSON functions".into(),
            ));
        }

        let fts5 = conn
            .query_row("SELECT sqlite_compileoption_used('ENABLE_FTS5')", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|used| used == 1)
            .unwrap_or(false);
        if !fts5 {
            log::info!("SQLite build has no FTS5; full-text search disabled");
        }

        register_functions(&conn)
            .map_err(|e| ShelfError::Connection(format!("Failed to register functions: {e}")))?;

        Ok(Connection {
            conn,
            read_only: config.read_only,
            fts5,
            tx: RefCell::new(TransactionState::default()),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn supports_fts(&self) -> bool {
        self.fts5
    }

    #[cfg(test)]
    pub(crate) fn disable_fts(&mut self) {
        self.fts5 = false;
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Execute a statement, returning the number of rows changed.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let (sql_text, values) = bind_parameters(sql, params);
        log::debug!("execute: {sql_text} ({} params)", values.len());
        let mut stmt = self
            .conn
            .prepare_cached(&sql_text)
            .map_err(|e| ShelfError::query(e, &sql_text, params))?;
        stmt.execute(params_from_iter(values.iter()))
            .map_err(|e| ShelfError::query(e, &sql_text, params))
    }

    /// Run one or more parameterless statements (DDL).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        log::debug!("execute_batch: {sql}");
        self.conn
            .execute_batch(sql)
            .map_err(|e| ShelfError::query(e, sql, &[]))
    }

    /// First column of the first row, or None when there are no rows.
    pub fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let (sql_text, values) = bind_parameters(sql, params);
        log::debug!("query_one: {sql_text} ({} params)", values.len());
        let mut stmt = self
            .conn
            .prepare_cached(&sql_text)
            .map_err(|e| ShelfError::query(e, &sql_text, params))?;
        stmt.query_row(params_from_iter(values.iter()), |row| {
            row.get_ref(0).map(value_ref_to_json)
        })
        .optional()
        .map_err(|e| ShelfError::query(e, &sql_text, params))
    }

    /// All rows as JSON objects keyed by column name.
    pub fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_stream(sql, params, |rows| rows.collect())
    }

    /// Run a query and hand a lazy, forward-only row iterator to `consume`.
    /// The iterator borrows the prepared statement; dropping it early ends the scan.
    pub fn query_stream<T, F>(&self, sql: &str, params: &[Value], consume: F) -> Result<T>
    where
        F: FnOnce(RowStream<'_>) -> Result<T>,
    {
        let (sql_text, values) = bind_parameters(sql, params);
        log::debug!("query: {sql_text} ({} params)", values.len());
        let mut stmt = self
            .conn
            .prepare_cached(&sql_text)
            .map_err(|e| ShelfError::query(e, &sql_text, params))?;

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(|e| ShelfError::query(e, &sql_text, params))?;

        consume(RowStream {
            rows,
            columns,
            sql: &sql_text,
            params,
            done: false,
        })
    }

    /// Whether a table or view with this exact name exists.
    pub fn object_exists(&self, name: &str) -> Result<bool> {
        let found = self.query_one(
            "SELECT 1 FROM sqlite_master WHERE name = ? AND type IN ('table', 'view')",
            &[Value::String(name.to_string())],
        )?;
        Ok(found.is_some())
    }

    // ── Statement Cache ──────────────────────────────────────────────

    /// Close every cached prepared statement.
    pub fn clear_statement_cache(&self) {
        self.conn.flush_prepared_statement_cache();
    }

    /// Compact the database file. Cached statements are closed first since
    /// VACUUM rewrites the file underneath them. Returns false inside a transaction.
    pub fn optimize(&self) -> Result<bool> {
        if self.tx.borrow().active {
            return Ok(false);
        }
        self.clear_statement_cache();
        self.execute_batch("PRAGMA optimize; VACUUM;")?;
        log::info!("Database optimized");
        Ok(true)
    }

    // ── Transaction Support ──────────────────────────────────────────

    /// Begin a transaction. Returns false if one is already active.
    pub fn begin_transaction(&self) -> Result<bool> {
        if self.tx.borrow().active || !self.conn.is_autocommit() {
            return Ok(false);
        }
        self.execute_batch("BEGIN IMMEDIATE")?;
        self.tx.borrow_mut().active = true;
        Ok(true)
    }

    /// Commit the current transaction. Returns false if none is active.
    pub fn commit(&self) -> Result<bool> {
        if !self.tx.borrow().active {
            return Ok(false);
        }
        self.execute_batch("COMMIT")?;
        *self.tx.borrow_mut() = TransactionState::default();
        Ok(true)
    }

    /// Roll back the current transaction. Returns false if none is active.
    pub fn rollback(&self) -> Result<bool> {
        if !self.tx.borrow().active {
            return Ok(false);
        }
        let result = self.execute_batch("ROLLBACK");
        *self.tx.borrow_mut() = TransactionState::default();
        result.map(|_| true)
    }

    /// Run `body` inside a named savepoint. Works with or without an outer
    /// transaction; on error everything since the savepoint is undone.
    pub fn savepoint<T, F>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.execute_batch(&format!("SAVEPOINT {name}"))?;
        match body() {
            Ok(value) => {
                self.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(undo) = self.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}")) {
                    log::warn!("Failed to roll back savepoint {name}: {undo}");
                }
                Err(e)
            }
        }
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.tx.borrow().clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.borrow().active
    }

    pub(crate) fn set_transaction_owner(&self, owner: &str) {
        let mut state = self.tx.borrow_mut();
        if state.active {
            state.owner = Some(owner.to_string());
        }
    }
}

/// Lazy rows of a running query. Not restartable: run the query again to re-read.
pub struct RowStream<'s> {
    rows: rusqlite::Rows<'s>,
    columns: Vec<String>,
    sql: &'s str,
    params: &'s [Value],
    done: bool,
}

impl RowStream<'_> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rows.next() {
            Ok(Some(row)) => {
                let mut obj = Row::new();
                for (i, name) in self.columns.iter().enumerate() {
                    match row.get_ref(i) {
                        Ok(value) => {
                            obj.insert(name.clone(), value_ref_to_json(value));
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(ShelfError::query(e, self.sql, self.params)));
                        }
                    }
                }
                Some(Ok(obj))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(ShelfError::query(e, self.sql, self.params)))
            }
        }
    }
}

// ── Parameter Binding ────────────────────────────────────────────────

/// Rewrite placeholders and convert logical parameters into SQLite values.
///
/// SQLite's `json_extract` reports JSON booleans as 0/1 and floats as REAL,
/// but a bound parameter has no JSON type of its own. Rules:
/// - two parameters, one of them boolean: booleans bind as integers 0/1;
/// - otherwise a boolean placeholder becomes `json_extract(?, '$')` bound to
///   `true`/`false`, and a float placeholder becomes
///   `CAST(json_extract(?, '$') AS REAL)` bound to the number's JSON text.
///
/// Placeholders inside quoted text are left alone. SQL using numbered
/// placeholders (`?1`) is never rewritten.
pub fn bind_parameters(sql: &str, params: &[Value]) -> (String, Vec<SqlValue>) {
    let plain = || params.iter().map(plain_value).collect::<Vec<_>>();

    if params.len() == 2 && params.iter().any(Value::is_boolean) {
        return (sql.to_string(), plain());
    }
    if !params.iter().any(|p| p.is_boolean() || is_float(p)) {
        return (sql.to_string(), plain());
    }

    let mut out = String::with_capacity(sql.len() + 32);
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut index = 0;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '?' if !in_single && !in_double => {
                if chars.peek().map(|n| n.is_ascii_digit()).unwrap_or(false) {
                    return (sql.to_string(), plain());
                }
                match params.get(index) {
                    Some(Value::Bool(_)) => out.push_str("json_extract(?, '$')"),
                    Some(p) if is_float(p) => out.push_str("CAST(json_extract(?, '$') AS REAL)"),
                    _ => out.push('?'),
                }
                index += 1;
            }
            _ => out.push(c),
        }
    }

    let values = params
        .iter()
        .map(|p| match p {
            Value::Bool(b) => SqlValue::Text(b.to_string()),
            Value::Number(n) if n.is_f64() => SqlValue::Text(n.to_string()),
            other => plain_value(other),
        })
        .collect();
    (out, values)
}

fn is_float(value: &Value) -> bool {
    matches!(value, Value::Number(n) if n.is_f64())
}

/// Convert a `serde_json::Value` to a `rusqlite::types::Value` without any rewriting.
fn plain_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Number(n.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

// ── Custom Functions ─────────────────────────────────────────────────

fn register_functions(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    // `subject REGEXP pattern` calls regexp(pattern, subject). A NULL subject
    // yields NULL, as LIKE does, so negated operators skip missing fields alike.
    conn.create_scalar_function("regexp", 2, flags, |ctx| {
        let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
            Ok(Regex::new(vr.as_str()?)?)
        })?;
        let subject = match ctx.get_raw(1) {
            ValueRef::Null => return Ok(None),
            ValueRef::Integer(n) => n.to_string(),
            ValueRef::Real(f) => f.to_string(),
            ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
        };
        Ok(Some(pattern.is_match(&subject)))
    })?;

    conn.create_scalar_function("json_unescape", 1, flags, |ctx| {
        let text = match ctx.get_raw(0) {
            ValueRef::Null => return Ok(None),
            ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
            other => return Ok(Some(value_ref_to_json(other).to_string())),
        };
        Ok(Some(unescape_json_text(&text)))
    })?;

    Ok(())
}

/// Recover the raw string from JSON-quoted text; anything else passes through.
pub fn unescape_json_text(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(s)) => s,
        _ => text.to_string(),
    }
}

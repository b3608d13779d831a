use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {source} (sql: {sql}, params: [{}])", .params.join(", "))]
    Query {
        sql: String,
        params: Vec<String>,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Read-only: cannot {0}")]
    ReadOnly(String),

    #[error("Unsupported: {0}")]
    Capability(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShelfError {
    /// Wrap a native engine error with the statement that caused it.
    pub(crate) fn query(
        source: rusqlite::Error,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Self {
        ShelfError::Query {
            sql: sql.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShelfError>;

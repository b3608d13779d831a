use crate::error::{Result, ShelfError};

/// Marker on a field path meaning "match each element of this array".
pub const PATH_SEARCH_MARKER: &str = "[]";

/// Prefix reserved for tables, views and triggers owned by the store itself.
pub const INTERNAL_PREFIX: &str = "_";

const MAX_COLLECTION_NAME: usize = 64;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_field_char(c: char) -> bool {
    is_name_char(c) || matches!(c, '.' | '/' | '[' | ']' | '"')
}

/// Validate a collection name before it is used as a table name.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME || !name.chars().all(is_name_char) {
        return Err(ShelfError::Validation(format!(
            "Invalid collection name '{name}': use 1-64 letters, digits or underscores"
        )));
    }
    if name.starts_with(INTERNAL_PREFIX) || name.to_ascii_lowercase().starts_with("sqlite_") {
        return Err(ShelfError::Validation(format!(
            "Invalid collection name '{name}': reserved prefix"
        )));
    }
    Ok(())
}

/// Validate a document field path as accepted by the query API.
pub fn validate_field_name(field: &str) -> Result<()> {
    if field.is_empty() || !field.chars().all(is_field_char) {
        return Err(ShelfError::Validation(format!("Invalid field name '{field}'")));
    }
    if field.matches(PATH_SEARCH_MARKER).count() > 1 {
        return Err(ShelfError::Validation(format!(
            "Field '{field}' has more than one '[]' marker"
        )));
    }
    let (base, after) = field.split_once(PATH_SEARCH_MARKER).unwrap_or((field, ""));
    let bad_rest = match after.strip_prefix('.') {
        Some(rest) => rest.split('.').any(str::is_empty),
        None => !after.is_empty(),
    };
    if base.split('.').any(str::is_empty) || bad_rest {
        return Err(ShelfError::Validation(format!(
            "Field '{field}' has an empty path segment"
        )));
    }
    Ok(())
}

/// Split `items[].name` into (`items`, `name`). Fields without a marker return an empty rest.
pub fn split_path_search(field: &str) -> (&str, &str) {
    match field.split_once(PATH_SEARCH_MARKER) {
        Some((base, rest)) => (base, rest.strip_prefix('.').unwrap_or(rest)),
        None => (field, ""),
    }
}

pub fn is_path_search(field: &str) -> bool {
    field.contains(PATH_SEARCH_MARKER)
}

/// JSON path expression for a dotted field: `a.b` -> `$.a.b`
pub fn json_path(field: &str) -> String {
    if field.starts_with('[') {
        format!("${field}")
    } else {
        format!("$.{field}")
    }
}

use crate::error::{Result, ShelfError};
use crate::validation::is_path_search;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Comparison operators of the condition API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Starts,
    NotStarts,
    Ends,
    NotEnds,
    Contains,
    NotContains,
    Matches,
    NotMatches,
    Empty,
    NotEmpty,
}

impl Operator {
    pub const ALL: [Operator; 16] = [
        Operator::Eq,
        Operator::NotEq,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::Starts,
        Operator::NotStarts,
        Operator::Ends,
        Operator::NotEnds,
        Operator::Contains,
        Operator::NotContains,
        Operator::Matches,
        Operator::NotMatches,
        Operator::Empty,
        Operator::NotEmpty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Starts => "STARTS",
            Operator::NotStarts => "NOT STARTS",
            Operator::Ends => "ENDS",
            Operator::NotEnds => "NOT ENDS",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT CONTAINS",
            Operator::Matches => "MATCHES",
            Operator::NotMatches => "NOT MATCHES",
            Operator::Empty => "EMPTY",
            Operator::NotEmpty => "NOT EMPTY",
        }
    }

    /// EMPTY / NOT EMPTY bind no value.
    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::Empty | Operator::NotEmpty)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Operator {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Operator {
    type Err = ShelfError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        let normalized = match normalized.as_str() {
            "==" => "=",
            "<>" => "!=",
            other => other,
        };
        Operator::ALL
            .iter()
            .find(|op| op.as_str() == normalized)
            .copied()
            .ok_or_else(|| ShelfError::Validation(format!("Unknown operator '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connective {
    And,
    Or,
}

impl Connective {
    pub fn sql(&self) -> &'static str {
        match self {
            Connective::And => "AND",
            Connective::Or => "OR",
        }
    }
}

/// Where a new condition group starts and how it joins the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    /// OR-group
    Union,
    /// AND-group
    Intersect,
}

impl GroupKind {
    pub fn connective(&self) -> Connective {
        match self {
            GroupKind::Union => Connective::Or,
            GroupKind::Intersect => Connective::And,
        }
    }
}

/// One predicate. `operator` is kept as written and validated when compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: Value,
    pub path_search: bool,
    /// None for the first condition of a group.
    pub connective: Option<Connective>,
    /// Set on the first condition of every group after the first.
    pub boundary: Option<GroupKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = ShelfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            _ => Err(ShelfError::Validation(format!("Invalid sort direction '{s}'"))),
        }
    }
}

impl AsRef<str> for Direction {
    fn as_ref(&self) -> &str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    /// Kept as written and validated when compiled.
    pub direction: String,
}

/// Embed matching documents of another collection under a key named after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub foreign_collection: String,
    pub foreign_field: String,
    pub local_field: String,
    /// Strip `foreign_field` from the embedded documents.
    pub exclude_foreign_field: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub phrase: String,
    pub fields: Vec<String>,
}

/// Filters, ordering, paging, joins and full-text search for one collection.
///
/// A `Query` is plain data: compiling or executing it never mutates it, so the
/// same value can be run any number of times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub conditions: Vec<Condition>,
    pub orders: Vec<OrderSpec>,
    /// -1 means unbounded.
    pub limit: i64,
    pub offset: u64,
    pub joins: Vec<JoinSpec>,
    pub search: Option<SearchSpec>,
    #[serde(skip)]
    pending_boundary: Option<GroupKind>,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            conditions: Vec::new(),
            orders: Vec::new(),
            limit: -1,
            offset: 0,
            joins: Vec::new(),
            search: None,
            pending_boundary: None,
        }
    }
}

// A union/intersect not yet followed by a condition changes neither the SQL
// nor the cache signature, so it does not take part in equality.
impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.conditions == other.conditions
            && self.orders == other.orders
            && self.limit == other.limit
            && self.offset == other.offset
            && self.joins == other.joins
            && self.search == other.search
    }
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    /// Add a condition joined with AND (or starting a group).
    pub fn filter(self, field: &str, op: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.push(Connective::And, field, op.as_ref(), value.into())
    }

    /// Add a condition joined with OR inside the current group.
    pub fn or_filter(self, field: &str, op: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.push(Connective::Or, field, op.as_ref(), value.into())
    }

    /// Start a new group joined to the previous ones with OR.
    pub fn union(mut self) -> Self {
        self.pending_boundary = Some(GroupKind::Union);
        self
    }

    /// Start a new group joined to the previous ones with AND.
    pub fn intersect(mut self) -> Self {
        self.pending_boundary = Some(GroupKind::Intersect);
        self
    }

    pub fn order_by(mut self, field: &str, direction: impl AsRef<str>) -> Self {
        self.orders.push(OrderSpec {
            field: field.to_string(),
            direction: direction.as_ref().to_string(),
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn join(
        mut self,
        foreign_collection: &str,
        foreign_field: &str,
        local_field: &str,
        exclude_foreign_field: bool,
    ) -> Self {
        self.joins.push(JoinSpec {
            foreign_collection: foreign_collection.to_string(),
            foreign_field: foreign_field.to_string(),
            local_field: local_field.to_string(),
            exclude_foreign_field,
        });
        self
    }

    pub fn search(mut self, phrase: &str, fields: &[&str]) -> Self {
        self.search = Some(SearchSpec {
            phrase: phrase.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    /// Number of condition groups (1 when there are no boundaries).
    pub fn group_count(&self) -> usize {
        if self.conditions.is_empty() {
            return 0;
        }
        1 + self
            .conditions
            .iter()
            .skip(1)
            .filter(|c| c.boundary.is_some())
            .count()
    }

    fn push(mut self, connective: Connective, field: &str, op: &str, value: Value) -> Self {
        let boundary = if self.conditions.is_empty() {
            None
        } else {
            self.pending_boundary.take()
        };
        self.pending_boundary = None;
        let starts_group = self.conditions.is_empty() || boundary.is_some();

        self.conditions.push(Condition {
            field: field.to_string(),
            operator: op.to_string(),
            value,
            path_search: is_path_search(field),
            connective: if starts_group { None } else { Some(connective) },
            boundary,
        });
        self
    }
}

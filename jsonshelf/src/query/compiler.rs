use super::condition::{Condition, Connective, Direction, Operator, OrderSpec, Query};
use crate::error::{Result, ShelfError};
use crate::fts::IndexDescriptor;
use crate::validation::{
    json_path, split_path_search, validate_collection_name, validate_field_name,
};
use serde_json::Value;

/// SQL text plus its positional parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Translates a `Query` into SQLite SQL over a collection table.
///
/// The collection table is aliased `t`, path-search walks `w0..wN`, joined
/// collections `j0..jN`. Every `compile_*` call starts from a clean slate.
pub struct QueryCompiler<'a> {
    collection: &'a str,
    params: Vec<Value>,
    walks: Vec<String>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(collection: &'a str) -> Self {
        QueryCompiler {
            collection,
            params: Vec::new(),
            walks: Vec::new(),
        }
    }

    pub fn compile_select(&mut self, query: &Query) -> Result<CompiledQuery> {
        self.reset()?;
        let where_sql = self.compile_where(&query.conditions)?;
        let projection = self.projection(query, None)?;

        let mut sql = format!(
            "SELECT {projection} FROM {} AS t{} WHERE {where_sql}",
            quote_ident(self.collection),
            self.walk_joins()
        );
        sql.push_str(&self.tail(query, None)?);
        Ok(self.finish(sql))
    }

    /// Number of matching documents. Paging and ordering are ignored.
    pub fn compile_count(&mut self, query: &Query) -> Result<CompiledQuery> {
        self.reset()?;
        let where_sql = self.compile_where(&query.conditions)?;
        let sql = format!(
            "SELECT COUNT(DISTINCT t.rowid) AS count FROM {} AS t{} WHERE {where_sql}",
            quote_ident(self.collection),
            self.walk_joins()
        );
        Ok(self.finish(sql))
    }

    /// Delete the documents the equivalent SELECT would return.
    pub fn compile_delete(&mut self, query: &Query) -> Result<CompiledQuery> {
        self.reset()?;
        let where_sql = self.compile_where(&query.conditions)?;
        let table = quote_ident(self.collection);
        let mut sql = format!(
            "DELETE FROM {table} WHERE rowid IN (SELECT t.rowid FROM {table} AS t{} WHERE {where_sql}",
            self.walk_joins()
        );
        sql.push_str(&self.tail(query, None)?);
        sql.push(')');
        Ok(self.finish(sql))
    }

    /// Full-text search through `index`, ranked by relevance, filtered by the conditions.
    pub fn compile_search(
        &mut self,
        query: &Query,
        index: &IndexDescriptor,
    ) -> Result<CompiledQuery> {
        self.reset()?;
        let spec = query
            .search
            .as_ref()
            .ok_or_else(|| ShelfError::Validation("Query has no search phrase".into()))?;
        if spec.phrase.trim().is_empty() {
            return Err(ShelfError::Validation("Search phrase is empty".into()));
        }
        if spec.fields.is_empty() {
            return Err(ShelfError::Validation("Search needs at least one field".into()));
        }

        let mut terms = Vec::with_capacity(spec.fields.len());
        for field in &spec.fields {
            let column = index.column_for(field).ok_or_else(|| {
                ShelfError::Validation(format!(
                    "Field '{field}' is not covered by index {}",
                    index.hash_id
                ))
            })?;
            terms.push(format!("{column} : {}", quote_phrase(&spec.phrase)));
        }
        self.params.push(Value::String(terms.join(" OR ")));

        let fts = quote_ident(&index.table_name());
        let rank = format!("{fts}.rank");
        let where_sql = self.compile_where(&query.conditions)?;
        let projection = self.projection(query, Some(&rank))?;

        let mut sql = format!(
            "SELECT {projection} FROM {fts} JOIN {} AS t ON t.rowid = {fts}.rowid{} \
             WHERE {fts} MATCH ? AND ({where_sql})",
            quote_ident(self.collection),
            self.walk_joins()
        );
        sql.push_str(&self.tail(query, Some(&rank))?);
        Ok(self.finish(sql))
    }

    fn reset(&mut self) -> Result<()> {
        self.params.clear();
        self.walks.clear();
        validate_collection_name(self.collection)
    }

    fn finish(&mut self, sql: String) -> CompiledQuery {
        self.walks.clear();
        CompiledQuery {
            sql,
            params: std::mem::take(&mut self.params),
        }
    }

    // ── WHERE ────────────────────────────────────────────────────────

    /// `(a AND b OR c) OR (d) AND (e)`: one parenthesized clause per group.
    fn compile_where(&mut self, conditions: &[Condition]) -> Result<String> {
        if conditions.is_empty() {
            return Ok("1 = 1".to_string());
        }

        let mut clause = String::new();
        let mut group = String::new();
        for (i, condition) in conditions.iter().enumerate() {
            let fragment = self.compile_condition(condition)?;
            if i > 0 {
                if let Some(kind) = condition.boundary {
                    clause.push_str(&format!("({group}) {} ", kind.connective().sql()));
                    group.clear();
                }
            }
            if group.is_empty() {
                group.push_str(&fragment);
            } else {
                let connective = condition.connective.unwrap_or(Connective::And);
                group.push_str(&format!(" {} {fragment}", connective.sql()));
            }
        }
        clause.push_str(&format!("({group})"));
        Ok(clause)
    }

    fn compile_condition(&mut self, condition: &Condition) -> Result<String> {
        validate_field_name(&condition.field)?;
        let op: Operator = condition.operator.parse()?;
        let target = self.target_expr(condition);

        let sql = match op {
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::Lte
            | Operator::Gt
            | Operator::Gte => {
                self.params.push(condition.value.clone());
                format!("{target} {} ?", op.as_str())
            }
            Operator::Starts | Operator::NotStarts => {
                self.params
                    .push(Value::String(format!("{}%", escape_like(&condition.value))));
                like(&target, op == Operator::NotStarts)
            }
            Operator::Ends | Operator::NotEnds => {
                self.params
                    .push(Value::String(format!("%{}", escape_like(&condition.value))));
                like(&target, op == Operator::NotEnds)
            }
            Operator::Contains | Operator::NotContains => {
                self.params
                    .push(Value::String(format!("%{}%", escape_like(&condition.value))));
                like(&target, op == Operator::NotContains)
            }
            Operator::Matches => {
                self.params.push(Value::String(value_text(&condition.value)));
                format!("{target} REGEXP ?")
            }
            Operator::NotMatches => {
                self.params.push(Value::String(value_text(&condition.value)));
                format!("{target} NOT REGEXP ?")
            }
            Operator::Empty => format!("{target} IS NULL"),
            Operator::NotEmpty => format!("{target} IS NOT NULL"),
        };
        Ok(sql)
    }

    /// Expression a condition compares against. Path-search fields share one
    /// walk per base field.
    fn target_expr(&mut self, condition: &Condition) -> String {
        if !condition.path_search {
            return format!("json_extract(t.doc, '{}')", json_path(&condition.field));
        }

        let (base, rest) = split_path_search(&condition.field);
        let index = match self.walks.iter().position(|w| w == base) {
            Some(index) => index,
            None => {
                self.walks.push(base.to_string());
                self.walks.len() - 1
            }
        };
        let alias = format!("w{index}");
        if rest.is_empty() {
            format!("{alias}.value")
        } else {
            format!(
                "(CASE WHEN {alias}.type = 'object' THEN json_extract({alias}.value, '{}') END)",
                json_path(rest)
            )
        }
    }

    fn walk_joins(&self) -> String {
        self.walks
            .iter()
            .enumerate()
            .map(|(i, base)| format!(" LEFT JOIN json_each(t.doc, '{}') AS w{i}", json_path(base)))
            .collect()
    }

    // ── Projection / ordering / paging ───────────────────────────────

    fn projection(&self, query: &Query, rank: Option<&str>) -> Result<String> {
        let mut columns = vec![format!("{} AS doc", document_expr(query)?)];
        if let Some(rank) = rank {
            columns.push(format!("{rank} AS _rank"));
        }
        for (i, order) in query.orders.iter().enumerate() {
            columns.push(format!("{} AS _o{i}", order_expr(order)?));
        }
        Ok(columns.join(", "))
    }

    fn tail(&self, query: &Query, rank: Option<&str>) -> Result<String> {
        let mut sql = String::new();
        if !self.walks.is_empty() {
            sql.push_str(" GROUP BY t.rowid");
        }

        let mut orders = Vec::new();
        if let Some(rank) = rank {
            orders.push(rank.to_string());
        }
        for order in &query.orders {
            let direction: Direction = order.direction.parse()?;
            orders.push(format!("{} {}", order_expr(order)?, direction.sql()));
        }
        if !orders.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if query.limit >= 0 || query.offset > 0 {
            let limit = query.limit.max(-1);
            sql.push_str(&format!(" LIMIT {limit} OFFSET {}", query.offset));
        }
        Ok(sql)
    }
}

/// `t.doc`, or `t.doc` with every joined collection embedded as an array.
fn document_expr(query: &Query) -> Result<String> {
    if query.joins.is_empty() {
        return Ok("t.doc".to_string());
    }

    let mut pairs = Vec::with_capacity(query.joins.len());
    for (i, join) in query.joins.iter().enumerate() {
        validate_collection_name(&join.foreign_collection)?;
        for field in [&join.foreign_field, &join.local_field] {
            validate_field_name(field)?;
            if crate::validation::is_path_search(field) {
                return Err(ShelfError::Validation(format!(
                    "Join field '{field}' cannot use '[]'"
                )));
            }
        }

        let alias = format!("j{i}");
        let foreign_path = json_path(&join.foreign_field);
        let embedded = if join.exclude_foreign_field {
            format!("json_remove({alias}.doc, '{foreign_path}')")
        } else {
            format!("{alias}.doc")
        };
        pairs.push(format!(
            "'$.{}', json((SELECT json_group_array(json({embedded})) FROM {} AS {alias} \
             WHERE json_extract({alias}.doc, '{foreign_path}') = json_extract(t.doc, '{}')))",
            join.foreign_collection,
            quote_ident(&join.foreign_collection),
            json_path(&join.local_field)
        ));
    }
    Ok(format!("json_set(t.doc, {})", pairs.join(", ")))
}

fn order_expr(order: &OrderSpec) -> Result<String> {
    validate_field_name(&order.field)?;
    if crate::validation::is_path_search(&order.field) {
        return Err(ShelfError::Validation(format!(
            "Cannot order by path search field '{}'",
            order.field
        )));
    }
    Ok(format!("json_extract(t.doc, '{}')", json_path(&order.field)))
}

fn like(target: &str, negated: bool) -> String {
    if negated {
        format!("{target} NOT LIKE ? ESCAPE '\\'")
    } else {
        format!("{target} LIKE ? ESCAPE '\\'")
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_like(value: &Value) -> String {
    value_text(value)
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_phrase(phrase: &str) -> String {
    format!("\"{}\"", phrase.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sqlparser::ast::{BinaryOperator, Expr, SetExpr, Statement};
    use sqlparser::dialect::SQLiteDialect;
    use sqlparser::parser::Parser;

    fn select(query: &Query) -> CompiledQuery {
        QueryCompiler::new("users").compile_select(query).unwrap()
    }

    fn where_clause(sql: &str) -> &str {
        let start = sql.rfind(" WHERE ").expect("WHERE present") + " WHERE ".len();
        let mut rest = &sql[start..];
        if sql.starts_with("DELETE") {
            rest = rest.strip_suffix(')').unwrap();
        }
        let end = [" GROUP BY", " ORDER BY", " LIMIT"]
            .iter()
            .filter_map(|marker| rest.find(marker))
            .min()
            .unwrap_or(rest.len());
        &rest[..end]
    }

    /// Comparison count of every top-level parenthesized group, left to right.
    fn group_shape(sql: &str) -> Vec<usize> {
        fn count(expr: &Expr) -> usize {
            match expr {
                Expr::BinaryOp {
                    left,
                    op: BinaryOperator::And | BinaryOperator::Or,
                    right,
                } => count(left) + count(right),
                Expr::Nested(inner) => count(inner),
                _ => 1,
            }
        }
        fn groups(expr: &Expr, out: &mut Vec<usize>) {
            match expr {
                Expr::BinaryOp {
                    left,
                    op: BinaryOperator::And | BinaryOperator::Or,
                    right,
                } => {
                    groups(left, out);
                    groups(right, out);
                }
                Expr::Nested(inner) => out.push(count(inner)),
                other => panic!("predicate outside any group: {other}"),
            }
        }

        let statements = Parser::parse_sql(&SQLiteDialect {}, sql).unwrap();
        let Statement::Query(query) = &statements[0] else {
            panic!("not a query: {sql}");
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            panic!("not a select: {sql}");
        };
        let mut out = Vec::new();
        groups(select.selection.as_ref().unwrap(), &mut out);
        out
    }

    #[test]
    fn test_simple_select() {
        let compiled = select(&Query::new().filter("name", "=", "Alice"));
        assert_eq!(
            compiled.sql,
            "SELECT t.doc AS doc FROM \"users\" AS t WHERE (json_extract(t.doc, '$.name') = ?)"
        );
        assert_eq!(compiled.params, vec![json!("Alice")]);
    }

    #[test]
    fn test_empty_conditions_are_always_true() {
        let compiled = select(&Query::new());
        assert_eq!(compiled.sql, "SELECT t.doc AS doc FROM \"users\" AS t WHERE 1 = 1");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_groups_are_parenthesized() {
        let query = Query::new()
            .filter("a", "=", 1)
            .filter("b", "=", 2)
            .or_filter("c", "=", 3)
            .intersect()
            .filter("d", "=", 4)
            .union()
            .filter("e", "=", 5)
            .filter("f", "=", 6);
        let compiled = select(&query);

        assert_eq!(
            where_clause(&compiled.sql),
            "(json_extract(t.doc, '$.a') = ? AND json_extract(t.doc, '$.b') = ? \
             OR json_extract(t.doc, '$.c') = ?) \
             AND (json_extract(t.doc, '$.d') = ?) \
             OR (json_extract(t.doc, '$.e') = ? AND json_extract(t.doc, '$.f') = ?)"
        );
        assert_eq!(group_shape(&compiled.sql), vec![3, 1, 2]);
        assert_eq!(
            compiled.params,
            vec![json!(1), json!(2), json!(3), json!(4), json!(5), json!(6)]
        );
    }

    #[test]
    fn test_group_structure_survives_every_operator() {
        for op in Operator::ALL {
            let query = Query::new()
                .filter("a", op, "x")
                .union()
                .filter("b", op, "y")
                .or_filter("c", "=", 1)
                .intersect()
                .filter("d", op, "z");
            let compiled = select(&query);
            let clause = where_clause(&compiled.sql);

            assert!(clause.starts_with('(') && clause.ends_with(')'), "operator {op}");
            assert_eq!(clause.matches(") OR (").count(), 1, "operator {op}");
            assert_eq!(clause.matches(") AND (").count(), 1, "operator {op}");
            assert_eq!(compiled.sql.matches('?').count(), compiled.params.len(), "operator {op}");
        }
    }

    #[test]
    fn test_operator_sql() {
        let query = Query::new()
            .filter("name", "STARTS", "Al")
            .filter("name", "NOT ENDS", "ce")
            .filter("bio", "CONTAINS", "50%_off")
            .filter("email", "MATCHES", "^a.+@x\\.io$")
            .filter("email", "NOT MATCHES", "spam")
            .filter("deleted", "EMPTY", json!(null))
            .filter("age", "NOT EMPTY", json!(null))
            .filter("age", ">=", 18);
        let compiled = select(&query);

        assert!(compiled.sql.contains("json_extract(t.doc, '$.name') LIKE ? ESCAPE '\\'"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.name') NOT LIKE ? ESCAPE '\\'"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.email') REGEXP ?"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.email') NOT REGEXP ?"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.deleted') IS NULL"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.age') IS NOT NULL"));
        assert!(compiled.sql.contains("json_extract(t.doc, '$.age') >= ?"));
        assert_eq!(
            compiled.params,
            vec![
                json!("Al%"),
                json!("%ce"),
                json!("%50\\%\\_off%"),
                json!("^a.+@x\\.io$"),
                json!("spam"),
                json!(18)
            ]
        );
    }

    #[test]
    fn test_path_search_reuses_walk_per_field() {
        let query = Query::new()
            .filter("roles[]", "=", "EDITOR")
            .or_filter("roles[]", "=", "ADMIN")
            .filter("items[].sku", "STARTS", "A-");
        let compiled = select(&query);

        assert_eq!(compiled.sql.matches("json_each(").count(), 2);
        assert!(compiled
            .sql
            .contains(" LEFT JOIN json_each(t.doc, '$.roles') AS w0 LEFT JOIN json_each(t.doc, '$.items') AS w1"));
        assert!(compiled.sql.contains("w0.value = ? OR w0.value = ?"));
        assert!(compiled.sql.contains(
            "(CASE WHEN w1.type = 'object' THEN json_extract(w1.value, '$.sku') END) LIKE ?"
        ));
        assert!(compiled.sql.contains(" GROUP BY t.rowid"));
    }

    #[test]
    fn test_order_limit_offset() {
        let query = Query::new()
            .order_by("age", "desc")
            .order_by("__id", "ASC")
            .limit(2)
            .offset(1);
        let compiled = select(&query);
        assert_eq!(
            compiled.sql,
            "SELECT t.doc AS doc, json_extract(t.doc, '$.age') AS _o0, \
             json_extract(t.doc, '$.__id') AS _o1 FROM \"users\" AS t WHERE 1 = 1 \
             ORDER BY json_extract(t.doc, '$.age') DESC, json_extract(t.doc, '$.__id') ASC \
             LIMIT 2 OFFSET 1"
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let compiled = select(&Query::new().offset(3));
        assert!(compiled.sql.ends_with(" LIMIT -1 OFFSET 3"));
    }

    #[test]
    fn test_join_projection() {
        let query = Query::new().join("posts", "author", "__id", true);
        let compiled = select(&query);
        assert_eq!(
            compiled.sql,
            "SELECT json_set(t.doc, '$.posts', json((SELECT json_group_array(json(json_remove(j0.doc, '$.author'))) \
             FROM \"posts\" AS j0 WHERE json_extract(j0.doc, '$.author') = json_extract(t.doc, '$.__id')))) AS doc \
             FROM \"users\" AS t WHERE 1 = 1"
        );
    }

    #[test]
    fn test_delete_where_matches_select_where() {
        let query = Query::new()
            .filter("age", ">", 30)
            .union()
            .filter("roles[]", "=", "ADMIN")
            .filter("active", "=", true);
        let mut compiler = QueryCompiler::new("users");
        let select = compiler.compile_select(&query).unwrap();
        let delete = compiler.compile_delete(&query).unwrap();

        assert!(delete.sql.starts_with(
            "DELETE FROM \"users\" WHERE rowid IN (SELECT t.rowid FROM \"users\" AS t"
        ));
        assert_eq!(where_clause(&select.sql), where_clause(&delete.sql));
        assert_eq!(select.params, delete.params);
    }

    #[test]
    fn test_count() {
        let compiled = QueryCompiler::new("users")
            .compile_count(&Query::new().filter("a", "=", 1).limit(5))
            .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT COUNT(DISTINCT t.rowid) AS count FROM \"users\" AS t WHERE (json_extract(t.doc, '$.a') = ?)"
        );
    }

    #[test]
    fn test_recompiling_does_not_accumulate() {
        let query = Query::new().filter("roles[]", "=", "X").filter("n", "<", 3);
        let mut compiler = QueryCompiler::new("users");
        let first = compiler.compile_select(&query).unwrap();
        let second = compiler.compile_select(&query).unwrap();
        assert_eq!(first, second);

        let count_a = compiler.compile_count(&query).unwrap();
        let count_b = compiler.compile_count(&query).unwrap();
        assert_eq!(count_a, count_b);
        assert_eq!(count_a.params.len(), 2);
    }

    #[test]
    fn test_search_sql() {
        let index = IndexDescriptor::new("users", vec!["bio".into(), "name".into()]);
        let query = Query::new()
            .search("rust \"async\"", &["name", "bio"])
            .filter("active", "=", true)
            .limit(10);
        let compiled = QueryCompiler::new("users").compile_search(&query, &index).unwrap();
        let fts = format!("\"{}\"", index.table_name());

        assert_eq!(
            compiled.sql,
            format!(
                "SELECT t.doc AS doc, {fts}.rank AS _rank FROM {fts} JOIN \"users\" AS t ON t.rowid = {fts}.rowid \
                 WHERE {fts} MATCH ? AND ((json_extract(t.doc, '$.active') = ?)) \
                 ORDER BY {fts}.rank LIMIT 10 OFFSET 0"
            )
        );
        assert_eq!(
            compiled.params,
            vec![
                json!("c1 : \"rust \"\"async\"\"\" OR c0 : \"rust \"\"async\"\"\""),
                json!(true)
            ]
        );
    }

    #[test]
    fn test_search_field_not_in_index() {
        let index = IndexDescriptor::new("users", vec!["bio".into()]);
        let query = Query::new().search("x", &["title"]);
        let err = QueryCompiler::new("users").compile_search(&query, &index).unwrap_err();
        assert!(matches!(err, ShelfError::Validation(_)));
    }

    #[test]
    fn test_validation_happens_before_sql() {
        let mut compiler = QueryCompiler::new("users");
        let bad_field = compiler.compile_select(&Query::new().filter("name'--", "=", 1));
        assert!(matches!(bad_field, Err(ShelfError::Validation(_))));

        let bad_op = compiler.compile_select(&Query::new().filter("name", "LIKE", "x"));
        assert!(matches!(bad_op, Err(ShelfError::Validation(_))));

        let bad_dir = compiler.compile_select(&Query::new().order_by("name", "up"));
        assert!(matches!(bad_dir, Err(ShelfError::Validation(_))));

        let bad_join = compiler.compile_select(&Query::new().join("sqlite_master", "a", "b", false));
        assert!(matches!(bad_join, Err(ShelfError::Validation(_))));

        let bad_collection = QueryCompiler::new("no-dashes").compile_select(&Query::new());
        assert!(matches!(bad_collection, Err(ShelfError::Validation(_))));
    }
}

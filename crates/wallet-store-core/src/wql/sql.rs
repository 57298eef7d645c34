//! WQL to SQL compilation for the relational backend.
//!
//! A query compiles to a single `WHERE` sub-expression over the `items`
//! table (aliased `i`), with every tag clause becoming a correlated
//! subquery against the matching tag table. Combinators concatenate
//! subfragments textually; all values are bound as parameters and never
//! inlined into the SQL text.

use crate::error::Result;

use super::{CompareOp, Query, TagClause};

/// Compiled filter: the `WHERE` fragment, its bound parameters in order,
/// and the plaintext tag names used with ordering operators (which the
/// backend must pre-validate as canonical integers).
#[derive(Debug, Clone)]
pub struct SqlFilter {
    pub fragment: String,
    pub params: Vec<String>,
    pub numeric_tags: Vec<String>,
}

/// Compile a parsed query into a parameterized `WHERE` fragment.
pub fn compile(query: &Query) -> Result<SqlFilter> {
    let mut filter = SqlFilter {
        fragment: String::new(),
        params: Vec::new(),
        numeric_tags: Vec::new(),
    };
    filter.fragment = build(query, &mut filter.params, &mut filter.numeric_tags);
    Ok(filter)
}

fn build(query: &Query, params: &mut Vec<String>, numeric_tags: &mut Vec<String>) -> String {
    match query {
        Query::And(children) => combine(children, " AND ", "1", params, numeric_tags),
        Query::Or(children) => combine(children, " OR ", "0", params, numeric_tags),
        Query::Not(child) => format!("NOT ({})", build(child, params, numeric_tags)),
        Query::Clause(clause) => clause_sql(clause, params, numeric_tags),
    }
}

fn combine(
    children: &[Query],
    joiner: &str,
    empty: &str,
    params: &mut Vec<String>,
    numeric_tags: &mut Vec<String>,
) -> String {
    if children.is_empty() {
        // Empty conjunction is vacuously true, empty disjunction false.
        return empty.to_string();
    }
    let parts: Vec<String> = children
        .iter()
        .map(|child| build(child, params, numeric_tags))
        .collect();
    format!("({})", parts.join(joiner))
}

fn clause_sql(clause: &TagClause, params: &mut Vec<String>, numeric_tags: &mut Vec<String>) -> String {
    let table = if clause.is_plaintext() {
        "tags_plaintext"
    } else {
        "tags_encrypted"
    };
    params.push(clause.name.clone());

    let condition = match &clause.op {
        CompareOp::Eq(value) => {
            params.push(value.clone());
            "value = ?".to_string()
        }
        CompareOp::Neq(value) => {
            params.push(value.clone());
            "value != ?".to_string()
        }
        CompareOp::Gt(value) => numeric_condition(">", *value, &clause.name, params, numeric_tags),
        CompareOp::Gte(value) => numeric_condition(">=", *value, &clause.name, params, numeric_tags),
        CompareOp::Lt(value) => numeric_condition("<", *value, &clause.name, params, numeric_tags),
        CompareOp::Lte(value) => numeric_condition("<=", *value, &clause.name, params, numeric_tags),
        CompareOp::Like(value) => {
            params.push(format!("%{}%", escape_like(value)));
            "value LIKE ? ESCAPE '\\'".to_string()
        }
        CompareOp::In(values) => {
            if values.is_empty() {
                // Nothing can match; drop the dangling name parameter.
                params.pop();
                return "0".to_string();
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            params.extend(values.iter().cloned());
            format!("value IN ({})", placeholders)
        }
    };

    format!(
        "i.id IN (SELECT item_id FROM {} WHERE name = ? AND {})",
        table, condition
    )
}

fn numeric_condition(
    operator: &str,
    value: i64,
    name: &str,
    params: &mut Vec<String>,
    numeric_tags: &mut Vec<String>,
) -> String {
    if !numeric_tags.iter().any(|existing| existing == name) {
        numeric_tags.push(name.to_string());
    }
    params.push(value.to_string());
    format!("CAST(value AS INTEGER) {} CAST(? AS INTEGER)", operator)
}

/// Escape LIKE metacharacters so `$like` means literal substring match.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '%' || c == '_' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wql::parse_str;

    fn compiled(json: &str) -> SqlFilter {
        compile(&parse_str(json).expect("query should parse")).expect("should compile")
    }

    #[test]
    fn test_equality_clause() {
        let filter = compiled(r#"{"~category": "core"}"#);
        assert_eq!(
            filter.fragment,
            "i.id IN (SELECT item_id FROM tags_plaintext WHERE name = ? AND value = ?)"
        );
        assert_eq!(filter.params, vec!["~category", "core"]);
        assert!(filter.numeric_tags.is_empty());
    }

    #[test]
    fn test_encrypted_tag_targets_encrypted_table() {
        let filter = compiled(r#"{"category": "3vQ="}"#);
        assert!(filter.fragment.contains("tags_encrypted"));
    }

    #[test]
    fn test_values_are_never_inlined() {
        let filter = compiled(r#"{"~a": "x'); DROP TABLE items; --"}"#);
        assert!(!filter.fragment.contains("DROP"));
        assert_eq!(filter.params[1], "x'); DROP TABLE items; --");
    }

    #[test]
    fn test_combinator_fragments() {
        let filter = compiled(r#"{"$and": [{"~a": "1"}, {"$not": {"~b": "2"}}]}"#);
        assert!(filter.fragment.starts_with('('));
        assert!(filter.fragment.contains(" AND NOT ("));
        assert_eq!(filter.params, vec!["~a", "1", "~b", "2"]);
    }

    #[test]
    fn test_empty_query_is_vacuously_true() {
        let filter = compiled("{}");
        assert_eq!(filter.fragment, "1");
        assert!(filter.params.is_empty());
    }

    #[test]
    fn test_numeric_clause_collects_tag_name() {
        let filter = compiled(r#"{"$and": [{"~a": {"$gt": "1"}}, {"~a": {"$lt": "9"}}]}"#);
        assert_eq!(filter.numeric_tags, vec!["~a"]);
        assert_eq!(filter.params, vec!["~a", "1", "~a", "9"]);
    }

    #[test]
    fn test_like_escapes_metacharacters() {
        let filter = compiled(r#"{"~a": {"$like": "50%_done"}}"#);
        assert_eq!(filter.params[1], "%50\\%\\_done%");
        assert!(filter.fragment.contains("LIKE ? ESCAPE"));
    }

    #[test]
    fn test_in_clause_placeholders() {
        let filter = compiled(r#"{"~a": {"$in": ["1", "2", "3"]}}"#);
        assert!(filter.fragment.contains("value IN (?, ?, ?)"));
        assert_eq!(filter.params, vec!["~a", "1", "2", "3"]);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let filter = compiled(r#"{"~a": {"$in": []}}"#);
        assert_eq!(filter.fragment, "0");
        assert!(filter.params.is_empty());
    }
}

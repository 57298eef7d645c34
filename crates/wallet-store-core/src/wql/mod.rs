//! Wallet Query Language (WQL).
//!
//! WQL is a MongoDB-style boolean query over record tags. A query is a JSON
//! object whose keys are either combinators (`$and`, `$or`, `$not`) or tag
//! clauses; a clause value is a literal string (implicit equality) or a
//! single-key operator object (`$neq`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$like`, `$in`).
//!
//! The JSON tree is parsed exactly once into the [`Query`] AST defined
//! here. The relational backend compiles the AST into a parameterized SQL
//! `WHERE` fragment ([`sql`]); the in-memory backend evaluates it with set
//! algebra ([`eval`]). Both paths must produce identical record sets for
//! identical data.

pub mod eval;
pub mod sql;

use serde_json::Value;

use crate::error::{Result, StorageError};

/// Parsed WQL query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Intersection of sub-results. `And(vec![])` matches everything and is
    /// what the empty query `{}` parses to.
    And(Vec<Query>),
    /// De-duplicated union of sub-results.
    Or(Vec<Query>),
    /// Complement of the sub-result within the candidate universe (all
    /// records of the queried type).
    Not(Box<Query>),
    /// A single tag comparison.
    Clause(TagClause),
}

/// One tag comparison: tag name (verbatim, `~` prefix intact) plus operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagClause {
    pub name: String,
    pub op: CompareOp,
}

impl TagClause {
    pub fn is_plaintext(&self) -> bool {
        self.name.starts_with('~')
    }
}

/// Comparison operator with its operand.
///
/// The ordering operators carry an `i64` because their operands must be
/// canonical base-10 integers; that is checked at parse time so both
/// backends reject the same queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareOp {
    Eq(String),
    Neq(String),
    Gt(i64),
    Gte(i64),
    Lt(i64),
    Lte(i64),
    /// Literal substring containment; no wildcard syntax.
    Like(String),
    /// Membership in the literal list; the empty list matches nothing.
    In(Vec<String>),
}

/// Parse an integer that round-trips through `i64` formatting.
///
/// Both the query operand and stored tag values must be in this canonical
/// form for the ordering operators; forms like `"007"` or `"+7"` are
/// rejected so the SQL and in-memory paths cannot diverge on them.
pub(crate) fn parse_canonical_i64(text: &str) -> Option<i64> {
    let value: i64 = text.parse().ok()?;
    if value.to_string() == text {
        Some(value)
    } else {
        None
    }
}

/// Parse a WQL query from its JSON string form.
///
/// JSON syntax errors are input errors; structurally valid JSON that is not
/// a valid query is a query error.
pub fn parse_str(json: &str) -> Result<Query> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| StorageError::Input(format!("invalid query JSON: {}", e)))?;
    parse(&value)
}

/// Parse a WQL query from an already-decoded JSON tree.
pub fn parse(value: &Value) -> Result<Query> {
    let map = value
        .as_object()
        .ok_or_else(|| StorageError::Query("query must be a JSON object".to_string()))?;

    let mut children = Vec::with_capacity(map.len());
    for (key, entry) in map {
        children.push(parse_entry(key, entry)?);
    }
    // A multi-key object is an implicit conjunction of its entries.
    if children.len() == 1 {
        Ok(children.pop().expect("len checked"))
    } else {
        Ok(Query::And(children))
    }
}

fn parse_entry(key: &str, value: &Value) -> Result<Query> {
    match key {
        "$and" => Ok(Query::And(parse_subquery_list(key, value)?)),
        "$or" => Ok(Query::Or(parse_subquery_list(key, value)?)),
        "$not" => match value {
            Value::Object(_) => Ok(Query::Not(Box::new(parse(value)?))),
            // An array under $not is the conjunction of its elements,
            // complemented as a whole.
            Value::Array(_) => Ok(Query::Not(Box::new(Query::And(parse_subquery_list(
                key, value,
            )?)))),
            _ => Err(StorageError::Query(
                "$not requires an object or array".to_string(),
            )),
        },
        name if name.starts_with('$') => Err(StorageError::Query(format!(
            "unknown combinator '{}'",
            name
        ))),
        name => parse_clause(name, value),
    }
}

fn parse_subquery_list(key: &str, value: &Value) -> Result<Vec<Query>> {
    let items = value
        .as_array()
        .ok_or_else(|| StorageError::Query(format!("{} requires an array", key)))?;
    items.iter().map(parse).collect()
}

fn parse_clause(name: &str, value: &Value) -> Result<Query> {
    let op = match value {
        Value::String(literal) => CompareOp::Eq(literal.clone()),
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(StorageError::Query(format!(
                    "tag '{}' requires exactly one operator",
                    name
                )));
            }
            let (operator, operand) = map.iter().next().expect("len checked");
            parse_operator(name, operator, operand)?
        }
        _ => {
            return Err(StorageError::Query(format!(
                "tag '{}' requires a string or operator object",
                name
            )))
        }
    };

    Ok(Query::Clause(TagClause {
        name: name.to_string(),
        op,
    }))
}

fn parse_operator(name: &str, operator: &str, operand: &Value) -> Result<CompareOp> {
    let string_operand = |op: &str| -> Result<String> {
        operand
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Query(format!("{} on '{}' requires a string", op, name)))
    };

    match operator {
        "$neq" => Ok(CompareOp::Neq(string_operand("$neq")?)),
        "$like" => Ok(CompareOp::Like(string_operand("$like")?)),
        "$in" => {
            let items = operand
                .as_array()
                .ok_or_else(|| StorageError::Query(format!("$in on '{}' requires a list", name)))?;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let item = item.as_str().ok_or_else(|| {
                    StorageError::Query(format!("$in on '{}' requires string values", name))
                })?;
                values.push(item.to_string());
            }
            Ok(CompareOp::In(values))
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            // Ordering is defined over plaintext integer tags only.
            if !name.starts_with('~') {
                return Err(StorageError::Query(format!(
                    "{} is only valid on plaintext (~) tags, got '{}'",
                    operator, name
                )));
            }
            let operand = string_operand(operator)?;
            let value = parse_canonical_i64(&operand).ok_or_else(|| {
                StorageError::Query(format!(
                    "{} on '{}' requires an integer operand, got '{}'",
                    operator, name, operand
                ))
            })?;
            Ok(match operator {
                "$gt" => CompareOp::Gt(value),
                "$gte" => CompareOp::Gte(value),
                "$lt" => CompareOp::Lt(value),
                _ => CompareOp::Lte(value),
            })
        }
        other => Err(StorageError::Query(format!(
            "unknown operator '{}' on tag '{}'",
            other, name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_matches_everything() {
        assert_eq!(parse_str("{}").unwrap(), Query::And(vec![]));
    }

    #[test]
    fn test_implicit_equality() {
        let query = parse_str(r#"{"~category": "core"}"#).unwrap();
        assert_eq!(
            query,
            Query::Clause(TagClause {
                name: "~category".to_string(),
                op: CompareOp::Eq("core".to_string()),
            })
        );
    }

    #[test]
    fn test_multi_key_object_is_conjunction() {
        let query = parse_str(r#"{"a": "1", "b": "2"}"#).unwrap();
        match query {
            Query::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_combinators() {
        let query = parse_str(
            r#"{"$or": [{"~a": "1"}, {"$not": {"~b": {"$neq": "2"}}}]}"#,
        )
        .unwrap();
        match query {
            Query::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Query::Not(_)));
            }
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_not_over_array_is_negated_conjunction() {
        let query = parse_str(r#"{"$not": [{"~a": "1"}, {"~b": "2"}]}"#).unwrap();
        match query {
            Query::Not(inner) => match *inner {
                Query::And(children) => assert_eq!(children.len(), 2),
                other => panic!("expected And under Not, got {:?}", other),
            },
            other => panic!("expected Not, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_operator_parses_canonical_integer() {
        let query = parse_str(r#"{"~age": {"$gte": "21"}}"#).unwrap();
        assert_eq!(
            query,
            Query::Clause(TagClause {
                name: "~age".to_string(),
                op: CompareOp::Gte(21),
            })
        );
    }

    #[test]
    fn test_numeric_operator_rejects_non_canonical() {
        for operand in ["007", "+7", "abc", "1.5", ""] {
            let json = format!(r#"{{"~age": {{"$gt": "{}"}}}}"#, operand);
            let err = parse_str(&json).unwrap_err();
            assert_eq!(err.code(), 108, "operand {:?}", operand);
        }
    }

    #[test]
    fn test_numeric_operator_rejects_encrypted_tag() {
        let err = parse_str(r#"{"age": {"$lt": "3"}}"#).unwrap_err();
        assert_eq!(err.code(), 108);
    }

    #[test]
    fn test_in_requires_string_list() {
        let query = parse_str(r#"{"color": {"$in": ["red", "blue"]}}"#).unwrap();
        assert!(matches!(
            query,
            Query::Clause(TagClause {
                op: CompareOp::In(_),
                ..
            })
        ));
        assert!(parse_str(r#"{"color": {"$in": "red"}}"#).is_err());
        assert!(parse_str(r#"{"color": {"$in": [1]}}"#).is_err());
    }

    #[test]
    fn test_rejections() {
        assert_eq!(parse_str("[]").unwrap_err().code(), 108);
        assert_eq!(parse_str("{bad json").unwrap_err().code(), 107);
        assert_eq!(parse_str(r#"{"$xor": []}"#).unwrap_err().code(), 108);
        assert_eq!(parse_str(r#"{"a": {"$regex": "x"}}"#).unwrap_err().code(), 108);
        assert_eq!(parse_str(r#"{"a": 5}"#).unwrap_err().code(), 108);
        assert_eq!(
            parse_str(r#"{"a": {"$neq": "1", "$like": "2"}}"#).unwrap_err().code(),
            108
        );
    }
}

//! Shared set-algebra evaluator for WQL.
//!
//! Combinator semantics live here once; a backend only supplies clause
//! resolution through [`ClauseResolver`]. Result sets are `BTreeSet`s of
//! record ids, so ordering (record insertion order) and de-duplication fall
//! out of the representation.

use std::collections::BTreeSet;

use crate::error::{Result, StorageError};
use crate::storage::types::RecordId;

use super::{parse_canonical_i64, CompareOp, Query, TagClause};

/// Resolves a single tag clause to the ids of matching records.
///
/// Implementations must restrict both [`universe`](Self::universe) and
/// [`resolve`](Self::resolve) to the candidate universe of the search (all
/// records of the queried type), so that `$not` complements correctly.
pub trait ClauseResolver {
    /// All candidate record ids.
    fn universe(&self) -> Result<BTreeSet<RecordId>>;

    /// Record ids whose tag satisfies the clause.
    fn resolve(&self, clause: &TagClause) -> Result<BTreeSet<RecordId>>;
}

/// Evaluate a query to its matching record-id set.
pub fn evaluate<R>(resolver: &R, query: &Query) -> Result<BTreeSet<RecordId>>
where
    R: ClauseResolver + ?Sized,
{
    match query {
        Query::And(children) => {
            if children.is_empty() {
                return resolver.universe();
            }
            // Evaluate every child before intersecting so an invalid
            // operand in a later branch still fails the whole query.
            let mut sets = Vec::with_capacity(children.len());
            for child in children {
                sets.push(evaluate(resolver, child)?);
            }
            let mut result = sets.swap_remove(0);
            for set in sets {
                result = result.intersection(&set).copied().collect();
            }
            Ok(result)
        }
        Query::Or(children) => {
            let mut result = BTreeSet::new();
            for child in children {
                result.extend(evaluate(resolver, child)?);
            }
            Ok(result)
        }
        Query::Not(child) => {
            let matched = evaluate(resolver, child)?;
            Ok(resolver
                .universe()?
                .difference(&matched)
                .copied()
                .collect())
        }
        Query::Clause(clause) => resolver.resolve(clause),
    }
}

/// Does a stored tag value satisfy the clause operator?
///
/// Used by the in-memory backend's clause resolution. Ordering operators
/// fail the whole query if the stored value is not a canonical integer,
/// mirroring the relational backend's pre-validation.
pub fn value_matches(clause: &TagClause, stored: &str) -> Result<bool> {
    let stored_int = || -> Result<i64> {
        parse_canonical_i64(stored).ok_or_else(|| {
            StorageError::Query(format!(
                "tag '{}' value '{}' is not an integer",
                clause.name, stored
            ))
        })
    };

    Ok(match &clause.op {
        CompareOp::Eq(value) => stored == value,
        CompareOp::Neq(value) => stored != value,
        CompareOp::Gt(value) => stored_int()? > *value,
        CompareOp::Gte(value) => stored_int()? >= *value,
        CompareOp::Lt(value) => stored_int()? < *value,
        CompareOp::Lte(value) => stored_int()? <= *value,
        CompareOp::Like(value) => stored.contains(value.as_str()),
        CompareOp::In(values) => values.iter().any(|value| value == stored),
    })
}

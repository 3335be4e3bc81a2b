//! Filter evaluation for the in-process store.
//!
//! Supports the common subset of the document query language: implicit
//! equality, dotted field paths, comparison operators (`$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`), set membership (`$in`, `$nin`), `$exists`, `$not`,
//! and the logical combinators `$and`, `$or`, `$nor`.

use super::{StoreError, StoreResult};
use crate::document::{Document, Value, lookup_path};
use std::cmp::Ordering;

/// Returns whether `doc` satisfies `filter`.
pub fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_of(doc, condition)?,
            "$or" => any_of(doc, condition)?,
            "$nor" => !any_of(doc, condition)?,
            op if op.starts_with('$') => {
                return Err(StoreError::BadFilter(format!("unknown top-level operator {op}")));
            }
            field => field_matches(lookup_path(doc, field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(condition: &Value) -> StoreResult<Vec<&Document>> {
    let Value::Array(items) = condition else {
        return Err(StoreError::BadFilter("logical operator expects an array".into()));
    };
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| StoreError::BadFilter("logical clause must be a document".into()))
        })
        .collect()
}

fn all_of(doc: &Document, condition: &Value) -> StoreResult<bool> {
    for clause in clauses(condition)? {
        if !matches(doc, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(doc: &Document, condition: &Value) -> StoreResult<bool> {
    for clause in clauses(condition)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_document(condition: &Value) -> Option<&Document> {
    match condition {
        Value::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> StoreResult<bool> {
    let Some(ops) = is_operator_document(condition) else {
        return Ok(equals(actual, condition));
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(actual, operand),
            "$ne" => !equals(actual, operand),
            "$gt" => compare(actual, operand, |o| o == Ordering::Greater),
            "$gte" => compare(actual, operand, |o| o != Ordering::Less),
            "$lt" => compare(actual, operand, |o| o == Ordering::Less),
            "$lte" => compare(actual, operand, |o| o != Ordering::Greater),
            "$in" => in_list(actual, operand)?,
            "$nin" => !in_list(actual, operand)?,
            "$exists" => {
                let want = !matches!(operand, Value::Bool(false) | Value::Null | Value::Int(0));
                actual.is_some() == want
            }
            "$not" => !field_matches(actual, operand)?,
            other => return Err(StoreError::BadFilter(format!("unknown operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality, where an array field also matches when any element does.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => matches!(expected, Value::Null),
        Some(v) if v.loosely_equals(expected) => true,
        Some(Value::Array(items)) => items.iter().any(|item| item.loosely_equals(expected)),
        Some(_) => false,
    }
}

fn compare(actual: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| v.partial_compare(operand).is_some_and(&accept);
    match actual {
        None => false,
        Some(Value::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
    }
}

fn in_list(actual: Option<&Value>, operand: &Value) -> StoreResult<bool> {
    let Value::Array(candidates) = operand else {
        return Err(StoreError::BadFilter("$in/$nin expects an array".into()));
    };
    Ok(candidates.iter().any(|c| equals(actual, c)))
}

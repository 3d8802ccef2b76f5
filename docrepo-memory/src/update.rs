//! Applies update definitions to in-memory documents.

use bson::{Bson, Document, Timestamp};
use chrono::Utc;
use std::cmp::Ordering;

use docrepo_core::{
    document::ID_FIELD,
    error::{DocumentStoreError, DocumentStoreResult},
    update::UpdateDefinition,
};

use crate::{
    aggregate,
    evaluator::{Comparable, DocumentEvaluator, compare_by, matches_values, values_equal},
    path,
};

fn backend(message: impl Into<String>) -> DocumentStoreError {
    DocumentStoreError::Backend(message.into())
}

fn fields<'a>(operator: &str, operand: &'a Bson) -> DocumentStoreResult<&'a Document> {
    match operand {
        Bson::Document(fields) => Ok(fields),
        other => Err(backend(format!("{operator} requires a document, found {other}"))),
    }
}

/// Applies `update` to `document` and returns the new version.
///
/// `inserting` is true when the document is being created by an upsert, which
/// enables `$setOnInsert`. The identity cannot change.
pub(crate) fn apply(document: &Document, update: &UpdateDefinition, inserting: bool) -> DocumentStoreResult<Document> {
    let updated = match update {
        UpdateDefinition::Replacement(replacement) => {
            let mut updated = Document::new();
            if let Some(id) = document.get(ID_FIELD) {
                updated.insert(ID_FIELD, id.clone());
            }
            for (key, value) in replacement {
                if key != ID_FIELD {
                    updated.insert(key.clone(), value.clone());
                }
            }
            if !updated.contains_key(ID_FIELD) {
                if let Some(id) = replacement.get(ID_FIELD) {
                    updated.insert(ID_FIELD, id.clone());
                }
            }
            updated
        }
        UpdateDefinition::Pipeline(stages) => aggregate::apply_document_stages(document.clone(), stages)?,
        UpdateDefinition::Operators(operators) => {
            let mut updated = document.clone();
            for (operator, operand) in operators {
                apply_operator(&mut updated, operator, operand, inserting)?;
            }
            updated
        }
    };

    if let (Some(before), Some(after)) = (document.get(ID_FIELD), updated.get(ID_FIELD)) {
        if !values_equal(before, after) {
            return Err(backend(format!("the {ID_FIELD} field is immutable")));
        }
    }

    Ok(updated)
}

fn apply_operator(document: &mut Document, operator: &str, operand: &Bson, inserting: bool) -> DocumentStoreResult<()> {
    let fields = fields(operator, operand)?;

    for (field, value) in fields {
        match operator {
            "$set" => path::set(document, field, value.clone())?,
            "$setOnInsert" => {
                if inserting {
                    path::set(document, field, value.clone())?;
                }
            }
            "$unset" => {
                path::remove(document, field);
            }
            "$inc" => arithmetic(document, field, value, operator, |a, b| a + b, i64::checked_add)?,
            "$mul" => arithmetic(document, field, value, operator, |a, b| a * b, i64::checked_mul)?,
            "$min" | "$max" => {
                let replace = match path::get(document, field) {
                    None => true,
                    Some(current) => {
                        let ordering = Comparable::from(value).total_cmp(&Comparable::from(current));
                        if operator == "$min" { ordering == Ordering::Less } else { ordering == Ordering::Greater }
                    }
                };
                if replace {
                    path::set(document, field, value.clone())?;
                }
            }
            "$rename" => {
                let Bson::String(target) = value else {
                    return Err(backend(format!("$rename target of {field} must be a string")));
                };
                if let Some(moved) = path::remove(document, field) {
                    path::set(document, target, moved)?;
                }
            }
            "$currentDate" => {
                let now = match value {
                    Bson::Document(spec) if spec.get_str("$type").is_ok_and(|kind| kind == "timestamp") => {
                        let seconds = u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX);
                        Bson::Timestamp(Timestamp { time: seconds, increment: 1 })
                    }
                    _ => Bson::DateTime(bson::DateTime::from_chrono(Utc::now())),
                };
                path::set(document, field, now)?;
            }
            "$push" => push(document, field, value)?,
            "$addToSet" => {
                let values = match value {
                    Bson::Document(spec) if spec.contains_key("$each") => each(spec)?,
                    other => vec![other.clone()],
                };
                let items = array_at(document, field, operator)?;
                for value in values {
                    if !items.iter().any(|item| values_equal(item, &value)) {
                        items.push(value);
                    }
                }
            }
            "$pull" => {
                let items = array_at(document, field, operator)?;
                let mut kept = Vec::with_capacity(items.len());
                for item in items.drain(..) {
                    if !pull_matches(&item, value)? {
                        kept.push(item);
                    }
                }
                *items = kept;
            }
            "$pullAll" => {
                let Bson::Array(values) = value else {
                    return Err(backend("$pullAll requires an array"));
                };
                let items = array_at(document, field, operator)?;
                items.retain(|item| !values.iter().any(|value| values_equal(item, value)));
            }
            "$pop" => {
                let first = matches!(value, Bson::Int32(-1) | Bson::Int64(-1));
                if path::get(document, field).is_some() {
                    let items = array_at(document, field, operator)?;
                    if first {
                        if !items.is_empty() {
                            items.remove(0);
                        }
                    } else {
                        items.pop();
                    }
                }
            }
            "$bit" => bit(document, field, value)?,
            other => return Err(backend(format!("update operator {other} is not supported by the in-memory store"))),
        }
    }

    Ok(())
}

fn arithmetic(
    document: &mut Document,
    field: &str,
    operand: &Bson,
    operator: &str,
    float: fn(f64, f64) -> f64,
    integer: fn(i64, i64) -> Option<i64>,
) -> DocumentStoreResult<()> {
    let current = path::get(document, field).cloned();
    let zero_like = |operand: &Bson| match operand {
        Bson::Int32(_) => Bson::Int32(0),
        Bson::Int64(_) => Bson::Int64(0),
        _ => Bson::Double(0.0),
    };
    let overflow = || backend(format!("{operator} on {field} overflowed"));

    let result = match (current.unwrap_or_else(|| zero_like(operand)), operand) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let value = integer(i64::from(a), i64::from(*b)).ok_or_else(overflow)?;
            i32::try_from(value).map(Bson::Int32).unwrap_or(Bson::Int64(value))
        }
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(integer(i64::from(a), *b).ok_or_else(overflow)?),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(integer(a, i64::from(*b)).ok_or_else(overflow)?),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(integer(a, *b).ok_or_else(overflow)?),
        (current, operand) => match (number(&current), number(operand)) {
            (Some(a), Some(b)) => Bson::Double(float(a, b)),
            _ => return Err(backend(format!("{operator} on {field} requires numeric values"))),
        },
    };

    path::set(document, field, result)
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn array_at<'a>(document: &'a mut Document, field: &str, operator: &str) -> DocumentStoreResult<&'a mut Vec<Bson>> {
    if path::get(document, field).is_none() {
        path::set(document, field, Bson::Array(Vec::new()))?;
    }

    match path::get_mut(document, field) {
        Some(Bson::Array(items)) => Ok(items),
        _ => Err(backend(format!("{operator} on {field} requires an array"))),
    }
}

fn each(spec: &Document) -> DocumentStoreResult<Vec<Bson>> {
    match spec.get("$each") {
        Some(Bson::Array(values)) => Ok(values.clone()),
        _ => Err(backend("$each requires an array")),
    }
}

fn push(document: &mut Document, field: &str, value: &Bson) -> DocumentStoreResult<()> {
    let spec = match value {
        Bson::Document(spec) if spec.contains_key("$each") => Some(spec),
        _ => None,
    };
    let values = match spec {
        Some(spec) => each(spec)?,
        None => vec![value.clone()],
    };
    let items = array_at(document, field, "$push")?;

    let position = spec
        .and_then(|spec| spec.get("$position"))
        .and_then(number)
        .map(|position| {
            let len = items.len() as f64;
            if position < 0.0 { (len + position).max(0.0) } else { position.min(len) }
        });
    match position {
        Some(position) => {
            let at = position as usize;
            items.splice(at..at, values);
        }
        None => items.extend(values),
    }

    if let Some(sort) = spec.and_then(|spec| spec.get("$sort")) {
        match sort {
            Bson::Document(sort) => items.sort_by(|a, b| match (a, b) {
                (Bson::Document(a), Bson::Document(b)) => compare_by(a, b, sort),
                _ => Ordering::Equal,
            }),
            direction => {
                let descending = number(direction).is_some_and(|d| d < 0.0);
                items.sort_by(|a, b| {
                    let ordering = Comparable::from(a).total_cmp(&Comparable::from(b));
                    if descending { ordering.reverse() } else { ordering }
                });
            }
        }
    }

    if let Some(slice) = spec.and_then(|spec| spec.get("$slice")).and_then(number) {
        let slice = slice as i64;
        let len = items.len() as i64;
        if slice >= 0 {
            items.truncate(slice.min(len) as usize);
        } else {
            let start = (len + slice).max(0) as usize;
            items.drain(..start);
        }
    }

    Ok(())
}

fn pull_matches(item: &Bson, condition: &Bson) -> DocumentStoreResult<bool> {
    match condition {
        Bson::Document(spec) if spec.keys().next().is_some_and(|key| key.starts_with('$')) => {
            matches_values(&[item], condition)
        }
        Bson::Document(spec) => match item {
            Bson::Document(element) => DocumentEvaluator::new(element).matches(spec),
            _ => Ok(false),
        },
        value => Ok(values_equal(item, value)),
    }
}

fn bit(document: &mut Document, field: &str, spec: &Bson) -> DocumentStoreResult<()> {
    let Bson::Document(spec) = spec else {
        return Err(backend("$bit requires a document"));
    };
    let mut current = match path::get(document, field) {
        None => Bson::Int32(0),
        Some(value @ (Bson::Int32(_) | Bson::Int64(_))) => value.clone(),
        Some(other) => return Err(backend(format!("$bit on {field} requires an integer, found {other}"))),
    };

    for (operation, mask) in spec {
        let apply = |a: i64, b: i64| match operation.as_str() {
            "and" => Ok(a & b),
            "or" => Ok(a | b),
            "xor" => Ok(a ^ b),
            other => Err(backend(format!("unknown $bit operation {other}"))),
        };
        current = match (&current, mask) {
            (Bson::Int32(a), Bson::Int32(b)) => Bson::Int32(apply(i64::from(*a), i64::from(*b))? as i32),
            (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(apply(i64::from(*a), *b)?),
            (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(apply(*a, i64::from(*b))?),
            (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(apply(*a, *b)?),
            (_, other) => return Err(backend(format!("$bit mask must be an integer, found {other}"))),
        };
    }

    path::set(document, field, current)
}

/// Builds the document an upsert starts from: the equality clauses of the filter.
pub(crate) fn seed_from_filter(filter: &Document) -> DocumentStoreResult<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> DocumentStoreResult<()> {
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = value {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        collect_equalities(clause, seed)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }

        match value {
            Bson::Document(operators) if operators.keys().next().is_some_and(|k| k.starts_with('$')) => {
                if let Some(eq) = operators.get("$eq") {
                    path::set(seed, key, eq.clone())?;
                }
            }
            Bson::RegularExpression(_) => {}
            other => path::set(seed, key, other.clone())?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn operators(update: Document) -> UpdateDefinition {
        UpdateDefinition::Operators(update)
    }

    #[test]
    fn field_operators() {
        let document = doc! { "_id": 1, "n": 1, "price": 2.0, "old": "x", "gone": true };
        let updated = apply(
            &document,
            &operators(doc! {
                "$inc": { "n": 2, "fresh": 5 },
                "$mul": { "price": 1.5 },
                "$rename": { "old": "new" },
                "$unset": { "gone": "" },
                "$max": { "n": 10 },
                "$set": { "nested.value": "v" },
            }),
            false,
        )
        .unwrap();

        assert_eq!(
            updated,
            doc! { "_id": 1, "n": 10, "price": 3.0, "fresh": 5, "new": "x", "nested": { "value": "v" } }
        );
    }

    #[test]
    fn integer_arithmetic_widens_and_detects_overflow() {
        let document = doc! { "small": i32::MAX, "wide": 5_i64, "mixed": 2 };
        let updated = apply(
            &document,
            &operators(doc! {
                "$inc": { "small": 1, "wide": 3 },
                "$mul": { "mixed": 4_i64 },
            }),
            false,
        )
        .unwrap();

        assert_eq!(updated.get("small"), Some(&Bson::Int64(i64::from(i32::MAX) + 1)));
        assert_eq!(updated.get("wide"), Some(&Bson::Int64(8)));
        assert_eq!(updated.get("mixed"), Some(&Bson::Int64(8)));

        let overflow = apply(&doc! { "n": i64::MAX }, &operators(doc! { "$inc": { "n": 1_i64 } }), false);
        assert!(matches!(overflow, Err(DocumentStoreError::Backend(_))));
    }

    #[test]
    fn array_operators() {
        let document = doc! { "_id": 1, "tags": ["a", "b"], "scores": [5, 1, 3], "items": [{ "qty": 1 }, { "qty": 9 }] };
        let updated = apply(
            &document,
            &operators(doc! {
                "$addToSet": { "tags": { "$each": ["b", "c"] } },
                "$push": { "scores": { "$each": [4], "$sort": -1, "$slice": 3 } },
                "$pull": { "items": { "qty": { "$gt": 5 } } },
            }),
            false,
        )
        .unwrap();

        assert_eq!(updated.get_array("tags").unwrap(), &vec![Bson::from("a"), Bson::from("b"), Bson::from("c")]);
        assert_eq!(updated.get_array("scores").unwrap(), &vec![Bson::Int32(5), Bson::Int32(4), Bson::Int32(3)]);
        assert_eq!(updated.get_array("items").unwrap().len(), 1);
    }

    #[test]
    fn set_on_insert_only_applies_to_upserts() {
        let update = operators(doc! { "$setOnInsert": { "created": true } });

        assert!(!apply(&doc! {}, &update, false).unwrap().contains_key("created"));
        assert!(apply(&doc! {}, &update, true).unwrap().contains_key("created"));
    }

    #[test]
    fn replacement_keeps_identity() {
        let updated = apply(
            &doc! { "_id": 7, "a": 1 },
            &UpdateDefinition::Replacement(doc! { "b": 2 }),
            false,
        )
        .unwrap();

        assert_eq!(updated, doc! { "_id": 7, "b": 2 });
        assert!(apply(&doc! { "_id": 7 }, &operators(doc! { "$set": { "_id": 8 } }), false).is_err());
    }

    #[test]
    fn upsert_seed_uses_equality_clauses() {
        let seed = seed_from_filter(&doc! {
            "name": "a",
            "age": { "$gt": 3 },
            "tenant": { "$eq": "t" },
            "$and": [{ "deleted": false }],
        })
        .unwrap();

        assert_eq!(seed, doc! { "name": "a", "tenant": "t", "deleted": false });
    }
}

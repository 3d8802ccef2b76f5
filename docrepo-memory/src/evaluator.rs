//! Filter evaluation and ordering for in-memory documents.
//!
//! Filters arrive in the MongoDB dialect produced by the repository layer, so
//! this module evaluates filter documents (`{ age: { $gt: 3 } }`) rather than
//! typed expressions.

use bson::{Bson, Document, datetime::DateTime, oid::ObjectId};
use regex::RegexBuilder;
use std::{cmp::Ordering, collections::HashMap};

use docrepo_core::error::{DocumentStoreError, DocumentStoreResult};

use crate::path;

/// Type-erased, comparable representation of BSON values.
///
/// Numbers of every width compare as `f64`. Values of different kinds compare
/// by the store's type order, so sorting is total.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Number(f64),
    String(&'a str),
    Map(HashMap<&'a str, Comparable<'a>>),
    Array(Vec<Comparable<'a>>),
    ObjectId(ObjectId),
    Bool(bool),
    DateTime(DateTime),
    Other,
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(f64::from(*value)),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Symbol(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Array(items) => Comparable::Array(items.iter().map(Comparable::from).collect()),
            Bson::Document(document) => Comparable::Map(
                document
                    .iter()
                    .map(|(key, value)| (key.as_str(), Comparable::from(value)))
                    .collect(),
            ),
            _ => Comparable::Other,
        }
    }
}

impl Comparable<'_> {
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 1,
            Comparable::Number(_) => 2,
            Comparable::String(_) => 3,
            Comparable::Map(_) => 4,
            Comparable::Array(_) => 5,
            Comparable::ObjectId(_) => 6,
            Comparable::Bool(_) => 7,
            Comparable::DateTime(_) => 8,
            Comparable::Other => 9,
        }
    }

    /// Ordering across kinds, used for sorting.
    pub(crate) fn total_cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    /// `None` when the kinds differ; range operators never match across kinds.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.bytes().partial_cmp(&b.bytes()),
            (Comparable::Array(a), Comparable::Array(b)) => {
                for (left, right) in a.iter().zip(b) {
                    match left.total_cmp(right) {
                        Ordering::Equal => continue,
                        ordering => return Some(ordering),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }
}

/// Whether two values are equal under numeric widening.
pub(crate) fn values_equal(left: &Bson, right: &Bson) -> bool {
    Comparable::from(left) == Comparable::from(right)
}

/// Compares two documents by a sort specification (`{ field: 1 | -1 }`).
pub(crate) fn compare_by(left: &Document, right: &Document, sort: &Document) -> Ordering {
    for (field, direction) in sort {
        let descending = match direction {
            Bson::Int32(value) => *value < 0,
            Bson::Int64(value) => *value < 0,
            Bson::Double(value) => *value < 0.0,
            _ => false,
        };

        let a = path::get(left, field).map(Comparable::from).unwrap_or(Comparable::Null);
        let b = path::get(right, field).map(Comparable::from).unwrap_or(Comparable::Null);

        let ordering = a.total_cmp(&b);
        let ordering = if descending { ordering.reverse() } else { ordering };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

/// Evaluates filter documents against stored documents.
pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    /// Whether the document satisfies every clause of `filter`.
    pub fn matches(&self, filter: &Document) -> DocumentStoreResult<bool> {
        for (key, operand) in filter {
            let matched = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(key, operand)? {
                        if !self.matches(clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => {
                    let mut any = false;
                    for clause in clauses(key, operand)? {
                        if self.matches(clause)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                "$nor" => {
                    let mut none = true;
                    for clause in clauses(key, operand)? {
                        if self.matches(clause)? {
                            none = false;
                            break;
                        }
                    }
                    none
                }
                "$text" => self.matches_text(operand)?,
                "$comment" => true,
                other if other.starts_with('$') => {
                    return Err(unsupported(other));
                }
                field => {
                    let values = path::lookup(self.document, field);
                    matches_values(&values, operand)?
                }
            };

            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Filters documents, keeping those that match.
    pub fn filter_documents<I>(documents: I, filter: &Document) -> DocumentStoreResult<Vec<Document>>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched = Vec::new();

        for document in documents {
            if DocumentEvaluator::new(document).matches(filter)? {
                matched.push(document.clone());
            }
        }

        Ok(matched)
    }

    fn matches_text(&self, operand: &Bson) -> DocumentStoreResult<bool> {
        let Bson::Document(search) = operand else {
            return Err(DocumentStoreError::Backend("$text requires a document".to_string()));
        };
        let Some(Bson::String(text)) = search.get("$search") else {
            return Err(DocumentStoreError::Backend("$text requires a $search string".to_string()));
        };
        let case_sensitive = matches!(search.get("$caseSensitive"), Some(Bson::Boolean(true)));

        let normalize = |s: &str| if case_sensitive { s.to_string() } else { s.to_lowercase() };
        let terms: Vec<String> = text.split_whitespace().map(normalize).collect();

        let mut strings = Vec::new();
        collect_strings(&Bson::Document(self.document.clone()), &mut strings);

        Ok(strings.iter().any(|value| {
            let value = normalize(value);
            terms.iter().any(|term| value.contains(term.as_str()))
        }))
    }
}

fn collect_strings(value: &Bson, strings: &mut Vec<String>) {
    match value {
        Bson::String(s) => strings.push(s.clone()),
        Bson::Array(items) => items.iter().for_each(|item| collect_strings(item, strings)),
        Bson::Document(document) => document
            .iter()
            .filter(|(key, _)| key.as_str() != "_id")
            .for_each(|(_, item)| collect_strings(item, strings)),
        _ => {}
    }
}

fn clauses<'b>(operator: &str, operand: &'b Bson) -> DocumentStoreResult<Vec<&'b Document>> {
    match operand {
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Bson::Document(clause) => Ok(clause),
                other => Err(DocumentStoreError::Backend(format!("{operator} clause {other} is not a document"))),
            })
            .collect(),
        _ => Err(DocumentStoreError::Backend(format!("{operator} requires a non-empty array"))),
    }
}

fn unsupported(operator: &str) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("operator {operator} is not supported by the in-memory store"))
}

fn is_operator_document(operand: &Bson) -> Option<&Document> {
    match operand {
        Bson::Document(document) if document.keys().next().is_some_and(|key| key.starts_with('$')) => Some(document),
        _ => None,
    }
}

/// Array values also match through their elements.
fn candidates<'b>(values: &[&'b Bson]) -> Vec<&'b Bson> {
    let mut expanded = Vec::with_capacity(values.len());

    for value in values {
        expanded.push(*value);
        if let Bson::Array(items) = value {
            expanded.extend(items.iter());
        }
    }

    expanded
}

fn equals_any(values: &[&Bson], operand: &Bson) -> DocumentStoreResult<bool> {
    if let Bson::RegularExpression(regex) = operand {
        return regex_matches(values, regex.pattern.as_str(), regex.options.as_str());
    }
    if values.is_empty() {
        return Ok(matches!(operand, Bson::Null));
    }

    Ok(candidates(values)
        .into_iter()
        .any(|value| values_equal(value, operand)))
}

fn compare_any(values: &[&Bson], operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let operand = Comparable::from(operand);

    candidates(values).into_iter().any(|value| {
        Comparable::from(value)
            .partial_cmp(&operand)
            .is_some_and(accept)
    })
}

fn regex_matches(values: &[&Bson], pattern: &str, options: &str) -> DocumentStoreResult<bool> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| DocumentStoreError::Backend(format!("invalid regular expression {pattern}: {e}")))?;

    Ok(candidates(values).into_iter().any(|value| match value {
        Bson::String(s) => regex.is_match(s),
        _ => false,
    }))
}

fn type_matches(value: &Bson, alias: &Bson) -> bool {
    let name = match alias {
        Bson::String(name) => name.as_str(),
        Bson::Int32(code) => {
            return i32::from(value.element_type() as u8) == *code;
        }
        _ => return false,
    };

    match name {
        "number" => matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)),
        "double" => matches!(value, Bson::Double(_)),
        "string" => matches!(value, Bson::String(_)),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "objectId" => matches!(value, Bson::ObjectId(_)),
        "bool" => matches!(value, Bson::Boolean(_)),
        "date" => matches!(value, Bson::DateTime(_)),
        "null" => matches!(value, Bson::Null),
        "int" => matches!(value, Bson::Int32(_)),
        "long" => matches!(value, Bson::Int64(_)),
        _ => false,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Evaluates the operand of a field clause against the values the path reached.
pub(crate) fn matches_values(values: &[&Bson], operand: &Bson) -> DocumentStoreResult<bool> {
    let Some(operators) = is_operator_document(operand) else {
        return equals_any(values, operand);
    };

    for (operator, argument) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals_any(values, argument)?,
            "$ne" => !equals_any(values, argument)?,
            "$gt" => compare_any(values, argument, |o| o == Ordering::Greater),
            "$gte" => compare_any(values, argument, |o| o != Ordering::Less),
            "$lt" => compare_any(values, argument, |o| o == Ordering::Less),
            "$lte" => compare_any(values, argument, |o| o != Ordering::Greater),
            "$in" | "$nin" => {
                let Bson::Array(options) = argument else {
                    return Err(DocumentStoreError::Backend(format!("{operator} requires an array")));
                };
                let mut any = false;
                for option in options {
                    if equals_any(values, option)? {
                        any = true;
                        break;
                    }
                }
                if operator == "$in" { any } else { !any }
            }
            "$exists" => {
                let expected = !matches!(argument, Bson::Boolean(false) | Bson::Int32(0) | Bson::Int64(0) | Bson::Null);
                values.is_empty() != expected
            }
            "$regex" => {
                let options = match operators.get("$options") {
                    Some(Bson::String(options)) => options.as_str(),
                    _ => "",
                };
                match argument {
                    Bson::String(pattern) => regex_matches(values, pattern, options)?,
                    Bson::RegularExpression(regex) => regex_matches(values, regex.pattern.as_str(), regex.options.as_str())?,
                    other => return Err(DocumentStoreError::Backend(format!("$regex requires a pattern, found {other}"))),
                }
            }
            "$options" => true,
            "$not" => !matches_values(values, argument)?,
            "$all" => {
                let Bson::Array(required) = argument else {
                    return Err(DocumentStoreError::Backend("$all requires an array".to_string()));
                };
                let mut all = !required.is_empty();
                for item in required {
                    if !equals_any(values, item)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$elemMatch" => {
                let Bson::Document(condition) = argument else {
                    return Err(DocumentStoreError::Backend("$elemMatch requires a document".to_string()));
                };
                let mut any = false;
                for value in values {
                    let Bson::Array(items) = value else { continue };
                    for item in items {
                        let matched = match (item, is_operator_document(argument)) {
                            (_, Some(_)) => matches_values(&[item], argument)?,
                            (Bson::Document(element), None) => DocumentEvaluator::new(element).matches(condition)?,
                            _ => false,
                        };
                        if matched {
                            any = true;
                            break;
                        }
                    }
                    if any {
                        break;
                    }
                }
                any
            }
            "$size" => {
                let expected = as_f64(argument);
                values.iter().any(|value| match value {
                    Bson::Array(items) => expected == Some(items.len() as f64),
                    _ => false,
                })
            }
            "$type" => candidates(values).into_iter().any(|value| match argument {
                Bson::Array(aliases) => aliases.iter().any(|alias| type_matches(value, alias)),
                alias => type_matches(value, alias),
            }),
            "$mod" => {
                let (divisor, remainder) = match argument {
                    Bson::Array(parts) if parts.len() == 2 => (as_f64(&parts[0]), as_f64(&parts[1])),
                    _ => (None, None),
                };
                match (divisor, remainder) {
                    (Some(divisor), Some(remainder)) if divisor != 0.0 => candidates(values)
                        .into_iter()
                        .filter_map(as_f64)
                        .any(|value| (value.trunc() % divisor.trunc()) == remainder.trunc()),
                    _ => return Err(DocumentStoreError::Backend("$mod requires [divisor, remainder]".to_string())),
                }
            }
            other => return Err(unsupported(other)),
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn matches(document: &Document, filter: Document) -> bool {
        DocumentEvaluator::new(document).matches(&filter).unwrap()
    }

    #[test]
    fn comparison_operators_widen_numbers() {
        let document = doc! { "age": 30_i64, "score": 2.5 };

        assert!(matches(&document, doc! { "age": 30 }));
        assert!(matches(&document, doc! { "age": { "$gte": 30, "$lt": 31.0 } }));
        assert!(!matches(&document, doc! { "age": { "$gt": "29" } }));
        assert!(matches(&document, doc! { "score": { "$in": [1, 2.5] } }));
        assert!(matches(&document, doc! { "score": { "$nin": [1, 2] } }));
    }

    #[test]
    fn missing_fields_equal_null() {
        let document = doc! { "name": "a" };

        assert!(matches(&document, doc! { "deleted": null }));
        assert!(matches(&document, doc! { "deleted": { "$ne": true } }));
        assert!(matches(&document, doc! { "deleted": { "$exists": false } }));
        assert!(!matches(&document, doc! { "name": { "$exists": false } }));
    }

    #[test]
    fn arrays_match_through_elements() {
        let document = doc! { "tags": ["red", "blue"], "items": [{ "qty": 1 }, { "qty": 5 }] };

        assert!(matches(&document, doc! { "tags": "red" }));
        assert!(matches(&document, doc! { "tags": { "$all": ["blue", "red"] } }));
        assert!(matches(&document, doc! { "tags": { "$size": 2 } }));
        assert!(matches(&document, doc! { "items": { "$elemMatch": { "qty": { "$gt": 4 } } } }));
        assert!(matches(&document, doc! { "items.qty": 5 }));
        assert!(!matches(&document, doc! { "items.qty": { "$gt": 5 } }));
    }

    #[test]
    fn logical_operators_and_regex() {
        let document = doc! { "email": "Alice@Example.com", "deleted": false };

        assert!(matches(&document, doc! { "$or": [{ "deleted": true }, { "email": { "$regex": "^alice", "$options": "i" } }] }));
        assert!(matches(&document, doc! { "$nor": [{ "deleted": true }] }));
        assert!(!matches(&document, doc! { "email": { "$not": { "$regex": "example", "$options": "i" } } }));
        assert!(matches(&document, doc! { "$text": { "$search": "nothing example" } }));
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let document = doc! { "a": 1 };

        assert!(DocumentEvaluator::new(&document).matches(&doc! { "$where": "true" }).is_err());
        assert!(DocumentEvaluator::new(&document).matches(&doc! { "a": { "$near": 1 } }).is_err());
    }

    #[test]
    fn sorting_orders_across_kinds() {
        let mut documents = vec![doc! { "v": "b" }, doc! { "v": 2 }, doc! {}, doc! { "v": 1.5 }];
        documents.sort_by(|a, b| compare_by(a, b, &doc! { "v": 1 }));

        assert_eq!(
            documents,
            vec![doc! {}, doc! { "v": 1.5 }, doc! { "v": 2 }, doc! { "v": "b" }]
        );

        documents.sort_by(|a, b| compare_by(a, b, &doc! { "v": -1 }));
        assert_eq!(documents[0], doc! { "v": "b" });
    }
}

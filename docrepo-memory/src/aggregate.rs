//! A small aggregation engine for in-memory collections.
//!
//! Supports the stages the repository layer emits (`$match`, `$sort`, `$skip`,
//! `$limit`, `$project`, `$count`, `$facet`) plus `$set`, `$addFields` and
//! `$unset`. Expressions are limited to field references (`"$field"`) and
//! `$literal`.

use bson::{Bson, Document};

use docrepo_core::{
    document::ID_FIELD,
    error::{DocumentStoreError, DocumentStoreResult},
};

use crate::{
    evaluator::{DocumentEvaluator, compare_by},
    path,
};

fn backend(message: impl Into<String>) -> DocumentStoreError {
    DocumentStoreError::Backend(message.into())
}

fn stage_of(stage: &Document) -> DocumentStoreResult<(&str, &Bson)> {
    let mut entries = stage.iter();

    match (entries.next(), entries.next()) {
        (Some((name, argument)), None) => Ok((name.as_str(), argument)),
        _ => Err(backend(format!("a pipeline stage must have exactly one field: {stage}"))),
    }
}

fn document_argument<'a>(stage: &str, argument: &'a Bson) -> DocumentStoreResult<&'a Document> {
    match argument {
        Bson::Document(document) => Ok(document),
        other => Err(backend(format!("{stage} requires a document, found {other}"))),
    }
}

fn count_argument(stage: &str, argument: &Bson) -> DocumentStoreResult<usize> {
    let value = match argument {
        Bson::Int32(value) => i64::from(*value),
        Bson::Int64(value) => *value,
        Bson::Double(value) if value.fract() == 0.0 => *value as i64,
        other => return Err(backend(format!("{stage} requires an integer, found {other}"))),
    };

    usize::try_from(value).map_err(|_| backend(format!("{stage} must not be negative")))
}

/// Runs a pipeline over a set of documents.
pub(crate) fn run(mut documents: Vec<Document>, pipeline: &[Document]) -> DocumentStoreResult<Vec<Document>> {
    for stage in pipeline {
        let (name, argument) = stage_of(stage)?;

        documents = match name {
            "$match" => DocumentEvaluator::filter_documents(documents.iter(), document_argument(name, argument)?)?,
            "$sort" => {
                let sort = document_argument(name, argument)?;
                documents.sort_by(|a, b| compare_by(a, b, sort));
                documents
            }
            "$skip" => documents
                .into_iter()
                .skip(count_argument(name, argument)?)
                .collect(),
            "$limit" => match count_argument(name, argument)? {
                0 => return Err(backend("$limit must be positive")),
                limit => documents.into_iter().take(limit).collect(),
            },
            "$count" => {
                let Bson::String(field) = argument else {
                    return Err(backend("$count requires a field name"));
                };
                if documents.is_empty() {
                    Vec::new()
                } else {
                    let count = i64::try_from(documents.len()).unwrap_or(i64::MAX);
                    let count = i32::try_from(count).map(Bson::Int32).unwrap_or(Bson::Int64(count));
                    let mut result = Document::new();
                    result.insert(field.clone(), count);
                    vec![result]
                }
            }
            "$facet" => {
                let facets = document_argument(name, argument)?;
                let mut result = Document::new();
                for (facet, stages) in facets {
                    let Bson::Array(stages) = stages else {
                        return Err(backend(format!("$facet branch {facet} must be an array")));
                    };
                    let stages = stages
                        .iter()
                        .map(|stage| document_argument(name, stage).cloned())
                        .collect::<DocumentStoreResult<Vec<_>>>()?;
                    let output = run(documents.clone(), &stages)?;
                    result.insert(facet.clone(), output.into_iter().map(Bson::Document).collect::<Vec<_>>());
                }
                vec![result]
            }
            "$project" | "$set" | "$addFields" | "$unset" => documents
                .into_iter()
                .map(|document| apply_document_stage(document, name, argument))
                .collect::<DocumentStoreResult<Vec<_>>>()?,
            other => return Err(backend(format!("pipeline stage {other} is not supported by the in-memory store"))),
        };
    }

    Ok(documents)
}

/// Applies pipeline-update stages to one document.
pub(crate) fn apply_document_stages(mut document: Document, stages: &[Document]) -> DocumentStoreResult<Document> {
    for stage in stages {
        let (name, argument) = stage_of(stage)?;
        document = apply_document_stage(document, name, argument)?;
    }

    Ok(document)
}

fn apply_document_stage(document: Document, name: &str, argument: &Bson) -> DocumentStoreResult<Document> {
    match name {
        "$set" | "$addFields" => {
            let fields = document_argument(name, argument)?;
            let mut updated = document.clone();
            for (field, expression) in fields {
                match evaluate(&document, expression) {
                    Some(value) => path::set(&mut updated, field, value)?,
                    None => {
                        path::remove(&mut updated, field);
                    }
                }
            }
            Ok(updated)
        }
        "$unset" => {
            let mut updated = document;
            match argument {
                Bson::String(field) => {
                    path::remove(&mut updated, field);
                }
                Bson::Array(fields) => {
                    for field in fields {
                        if let Bson::String(field) = field {
                            path::remove(&mut updated, field);
                        }
                    }
                }
                other => return Err(backend(format!("$unset requires field names, found {other}"))),
            }
            Ok(updated)
        }
        "$project" => project(&document, document_argument(name, argument)?),
        other => Err(backend(format!("stage {other} cannot be used in a pipeline update"))),
    }
}

/// Evaluates an aggregation expression; `None` means the field is absent.
fn evaluate(document: &Document, expression: &Bson) -> Option<Bson> {
    match expression {
        Bson::String(reference) if reference.starts_with('$') && !reference.starts_with("$$") => {
            path::get(document, &reference[1..]).cloned()
        }
        Bson::Document(spec) => match spec.get("$literal") {
            Some(literal) if spec.len() == 1 => Some(literal.clone()),
            _ => Some(Bson::Document(
                spec.iter()
                    .filter_map(|(key, value)| evaluate(document, value).map(|value| (key.clone(), value)))
                    .collect(),
            )),
        },
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .map(|item| evaluate(document, item).unwrap_or(Bson::Null))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

fn is_exclusion(value: &Bson) -> bool {
    matches!(value, Bson::Boolean(false) | Bson::Int32(0) | Bson::Int64(0))
        || matches!(value, Bson::Double(v) if *v == 0.0)
}

fn is_inclusion(value: &Bson) -> bool {
    matches!(value, Bson::Boolean(true) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) && !is_exclusion(value)
}

/// Applies a projection document.
///
/// # Errors
///
/// Fails when inclusions and exclusions are mixed on fields other than `_id`.
pub(crate) fn project(document: &Document, projection: &Document) -> DocumentStoreResult<Document> {
    let fields: Vec<(&String, &Bson)> = projection
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .collect();
    let excluding = fields.iter().any(|(_, value)| is_exclusion(value));
    let including = fields.iter().any(|(_, value)| !is_exclusion(value));
    let drop_id = projection.get(ID_FIELD).is_some_and(is_exclusion);

    if excluding && including {
        return Err(backend(format!("cannot mix inclusion and exclusion in projection {projection}")));
    }

    if excluding || (fields.is_empty() && drop_id) {
        let mut projected = document.clone();
        for (field, _) in &fields {
            path::remove(&mut projected, field);
        }
        if drop_id {
            projected.remove(ID_FIELD);
        }
        return Ok(projected);
    }

    let mut projected = Document::new();
    if !drop_id {
        if let Some(id) = document.get(ID_FIELD) {
            projected.insert(ID_FIELD, id.clone());
        }
    }
    for (field, value) in fields {
        let projected_value = if is_inclusion(value) {
            path::get(document, field).cloned()
        } else {
            evaluate(document, value)
        };
        if let Some(projected_value) = projected_value {
            path::set(&mut projected, field, projected_value)?;
        }
    }

    Ok(projected)
}

//! Fluent update builder.
//!
//! [`Update`] accumulates field-level mutation operators into one
//! [`UpdateDefinition`]. Every fluent call combines the previous definition with
//! the new operator, so the builder always holds a single instruction:
//!
//! ```ignore
//! let update = Update::<User>::new()
//!     .set("name", "Alice")
//!     .inc("logins", 1)
//!     .current_date("updated_at");
//! ```
//!
//! [`Update::set_document`] walks a whole document and emits one `$set` per leaf,
//! which gives patch semantics for nested documents.

use bson::{Bson, Document, doc, ser::serialize_to_bson};
use serde::Serialize;
use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

use crate::{
    document::{ID_FIELD, to_bson_document},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{Expr, FieldPath},
    query::{parse_json, Query},
};

/// A rendered update instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDefinition {
    /// An operator document such as `{ "$set": { "a": 1 } }`.
    Operators(Document),
    /// An aggregation-pipeline update.
    Pipeline(Vec<Document>),
    /// A whole-document replacement.
    Replacement(Document),
}

impl UpdateDefinition {
    /// Returns the operator document, if this is an operator update.
    pub fn as_operators(&self) -> Option<&Document> {
        match self {
            UpdateDefinition::Operators(document) => Some(document),
            _ => None,
        }
    }

    /// Returns the operator document mutably, if this is an operator update.
    pub fn as_operators_mut(&mut self) -> Option<&mut Document> {
        match self {
            UpdateDefinition::Operators(document) => Some(document),
            _ => None,
        }
    }

    /// Returns the pipeline stages, if this is a pipeline update.
    pub fn as_pipeline(&self) -> Option<&[Document]> {
        match self {
            UpdateDefinition::Pipeline(stages) => Some(stages),
            _ => None,
        }
    }

    /// Sets `field` to `value` inside the `$set` operator of an operator update.
    ///
    /// Interceptors use this to stamp audit fields. Pipeline updates receive an
    /// extra `$set` stage and replacements get the field written directly.
    pub fn stamp(&mut self, field: &str, value: impl Into<Bson>) {
        let value = value.into();
        match self {
            UpdateDefinition::Operators(document) => {
                match document.get_mut("$set") {
                    Some(Bson::Document(set)) => {
                        set.insert(field, value);
                    }
                    _ => {
                        document.insert("$set", doc! { field: value });
                    }
                }
            }
            UpdateDefinition::Pipeline(stages) => {
                stages.push(doc! { "$set": { field: { "$literal": value } } });
            }
            UpdateDefinition::Replacement(document) => {
                document.insert(field, value);
            }
        }
    }

    /// Counts the field-level instructions carried by an operator update.
    pub fn instruction_count(&self) -> usize {
        match self {
            UpdateDefinition::Operators(document) => document
                .values()
                .map(|fields| match fields {
                    Bson::Document(fields) => fields.len(),
                    _ => 1,
                })
                .sum(),
            UpdateDefinition::Pipeline(stages) => stages.len(),
            UpdateDefinition::Replacement(document) => document.len(),
        }
    }

    fn combine(self, other: UpdateDefinition) -> Result<UpdateDefinition, String> {
        match (self, other) {
            (UpdateDefinition::Operators(mut left), UpdateDefinition::Operators(right)) => {
                for (operator, fields) in right {
                    match (left.get_mut(&operator), fields) {
                        (Some(Bson::Document(existing)), Bson::Document(fields)) => {
                            existing.extend(fields);
                        }
                        (_, fields) => {
                            left.insert(operator, fields);
                        }
                    }
                }
                Ok(UpdateDefinition::Operators(left))
            }
            (UpdateDefinition::Pipeline(mut left), UpdateDefinition::Pipeline(right)) => {
                left.extend(right);
                Ok(UpdateDefinition::Pipeline(left))
            }
            (left, right) => Err(format!(
                "cannot combine {} update with {} update",
                left.kind(),
                right.kind()
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            UpdateDefinition::Operators(_) => "an operator",
            UpdateDefinition::Pipeline(_) => "a pipeline",
            UpdateDefinition::Replacement(_) => "a replacement",
        }
    }
}

impl fmt::Display for UpdateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateDefinition::Operators(document) | UpdateDefinition::Replacement(document) => {
                write!(f, "{document}")
            }
            UpdateDefinition::Pipeline(stages) => {
                write!(f, "[")?;
                for (i, stage) in stages.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{stage}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Options for `$push` with modifiers.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Insert position (`$position`).
    pub position: Option<i32>,
    /// Keep only this many elements after the push (`$slice`).
    pub slice: Option<i32>,
    /// Sort specification applied after the push (`$sort`).
    pub sort: Option<Bson>,
}

/// Fluent, accumulating update builder for documents of type `D`.
pub struct Update<D> {
    definition: Option<UpdateDefinition>,
    conflict: Option<String>,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Update<D> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Update { definition: None, conflict: None, _marker: PhantomData }
    }

    /// Wraps an existing definition.
    pub fn from_definition(definition: UpdateDefinition) -> Self {
        Update { definition: Some(definition), conflict: None, _marker: PhantomData }
    }

    /// Parses raw update text.
    ///
    /// A JSON array becomes a pipeline update, a JSON object an operator update.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::Conversion`] echoing the text when it is
    /// neither.
    pub fn parse(text: &str) -> DocumentStoreResult<Self> {
        let definition = match parse_json(text)? {
            Bson::Document(document) => UpdateDefinition::Operators(document),
            Bson::Array(stages) => UpdateDefinition::Pipeline(
                stages
                    .into_iter()
                    .map(|stage| match stage {
                        Bson::Document(stage) => Ok(stage),
                        other => Err(DocumentStoreError::Conversion(format!(
                            "pipeline stage `{other}` in `{text}` is not a document"
                        ))),
                    })
                    .collect::<DocumentStoreResult<Vec<_>>>()?,
            ),
            _ => {
                return Err(DocumentStoreError::Conversion(format!(
                    "`{text}` is neither an update document nor a pipeline"
                )));
            }
        };

        Ok(Self::from_definition(definition))
    }

    /// Whether no operator has been added yet.
    pub fn is_empty(&self) -> bool {
        self.definition.is_none() && self.conflict.is_none()
    }

    /// Renders the accumulated instruction.
    ///
    /// # Errors
    ///
    /// Fails when nothing was added or when incompatible update kinds were combined.
    pub fn render(&self) -> DocumentStoreResult<UpdateDefinition> {
        if let Some(conflict) = &self.conflict {
            return Err(DocumentStoreError::Conversion(conflict.clone()));
        }

        self.definition
            .clone()
            .ok_or_else(|| DocumentStoreError::Conversion("update contains no instructions".to_string()))
    }

    /// Number of field-level instructions accumulated so far.
    pub fn instruction_count(&self) -> usize {
        self.definition
            .as_ref()
            .map_or(0, UpdateDefinition::instruction_count)
    }

    /// Combines this builder with another one.
    pub fn combine(mut self, other: Update<D>) -> Self {
        if let Some(conflict) = other.conflict {
            self.conflict.get_or_insert(conflict);
        }
        if let Some(definition) = other.definition {
            self.push_definition(definition);
        }
        self
    }

    fn push_definition(&mut self, definition: UpdateDefinition) {
        if self.conflict.is_some() {
            return;
        }

        self.definition = match self.definition.take() {
            None => Some(definition),
            Some(current) => match current.combine(definition) {
                Ok(combined) => Some(combined),
                Err(conflict) => {
                    self.conflict = Some(conflict);
                    None
                }
            },
        };
    }

    fn operator(mut self, operator: &str, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        let value: Bson = value.into();
        self.push_definition(UpdateDefinition::Operators(doc! {
            operator: { field.path(): value },
        }));
        self
    }

    /// `$set`: assigns a value.
    pub fn set(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$set", field, value)
    }

    /// `$set` with a serializable value.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be serialized.
    pub fn set_value<T: Serialize>(self, field: impl FieldPath, value: &T) -> DocumentStoreResult<Self> {
        let value = serialize_to_bson(value)?;
        Ok(self.operator("$set", field, value))
    }

    /// `$setOnInsert`: assigns a value only when an upsert inserts.
    pub fn set_on_insert(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$setOnInsert", field, value)
    }

    /// `$unset`: removes a field.
    pub fn unset(self, field: impl FieldPath) -> Self {
        self.operator("$unset", field, "")
    }

    /// `$inc`: increments a numeric field.
    pub fn inc(self, field: impl FieldPath, amount: impl Into<Bson>) -> Self {
        self.operator("$inc", field, amount)
    }

    /// `$mul`: multiplies a numeric field.
    pub fn mul(self, field: impl FieldPath, factor: impl Into<Bson>) -> Self {
        self.operator("$mul", field, factor)
    }

    /// `$min`: keeps the smaller of the current and given values.
    pub fn min(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$min", field, value)
    }

    /// `$max`: keeps the larger of the current and given values.
    pub fn max(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$max", field, value)
    }

    /// `$rename`: renames a field.
    pub fn rename(self, field: impl FieldPath, new_name: impl Into<String>) -> Self {
        self.operator("$rename", field, new_name.into())
    }

    /// `$currentDate` as a date.
    pub fn current_date(self, field: impl FieldPath) -> Self {
        self.operator("$currentDate", field, true)
    }

    /// `$currentDate` as a timestamp.
    pub fn current_timestamp(self, field: impl FieldPath) -> Self {
        self.operator("$currentDate", field, doc! { "$type": "timestamp" })
    }

    /// `$push`: appends a value to an array.
    pub fn push(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$push", field, value)
    }

    /// `$push` with `$each` and optional modifiers.
    pub fn push_each(
        self,
        field: impl FieldPath,
        values: impl IntoIterator<Item = impl Into<Bson>>,
        options: PushOptions,
    ) -> Self {
        let mut modifiers = doc! {
            "$each": values.into_iter().map(Into::into).collect::<Vec<Bson>>(),
        };
        if let Some(position) = options.position {
            modifiers.insert("$position", position);
        }
        if let Some(slice) = options.slice {
            modifiers.insert("$slice", slice);
        }
        if let Some(sort) = options.sort {
            modifiers.insert("$sort", sort);
        }

        self.operator("$push", field, modifiers)
    }

    /// `$addToSet`: appends a value unless already present.
    pub fn add_to_set(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$addToSet", field, value)
    }

    /// `$addToSet` with `$each`.
    pub fn add_to_set_each(self, field: impl FieldPath, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.operator(
            "$addToSet",
            field,
            doc! { "$each": values.into_iter().map(Into::into).collect::<Vec<Bson>>() },
        )
    }

    /// `$pull`: removes all occurrences of a value.
    pub fn pull(self, field: impl FieldPath, value: impl Into<Bson>) -> Self {
        self.operator("$pull", field, value)
    }

    /// `$pull` with a condition on the array elements.
    ///
    /// # Errors
    ///
    /// Fails when the condition cannot be translated into a filter.
    pub fn pull_filter(self, field: impl FieldPath, condition: &Expr) -> DocumentStoreResult<Self> {
        let condition = condition.to_document()?;
        Ok(self.operator("$pull", field, condition))
    }

    /// `$pull` with a condition given as a complete query.
    ///
    /// # Errors
    ///
    /// Fails for incomplete queries.
    pub fn pull_query<E, P>(self, field: impl FieldPath, condition: &Query<E, P>) -> DocumentStoreResult<Self> {
        let condition = condition.to_filter()?;
        Ok(self.operator("$pull", field, condition))
    }

    /// `$pullAll`: removes all listed values.
    pub fn pull_all(self, field: impl FieldPath, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.operator(
            "$pullAll",
            field,
            values.into_iter().map(Into::into).collect::<Vec<Bson>>(),
        )
    }

    /// `$pop` removing the first element.
    pub fn pop_first(self, field: impl FieldPath) -> Self {
        self.operator("$pop", field, -1)
    }

    /// `$pop` removing the last element.
    pub fn pop_last(self, field: impl FieldPath) -> Self {
        self.operator("$pop", field, 1)
    }

    /// `$bit` with `and`.
    pub fn bit_and(self, field: impl FieldPath, mask: impl Into<Bson>) -> Self {
        self.operator("$bit", field, doc! { "and": Into::<Bson>::into(mask) })
    }

    /// `$bit` with `or`.
    pub fn bit_or(self, field: impl FieldPath, mask: impl Into<Bson>) -> Self {
        self.operator("$bit", field, doc! { "or": Into::<Bson>::into(mask) })
    }

    /// `$bit` with `xor`.
    pub fn bit_xor(self, field: impl FieldPath, mask: impl Into<Bson>) -> Self {
        self.operator("$bit", field, doc! { "xor": Into::<Bson>::into(mask) })
    }

    /// Emits one `$set` per leaf field of `document`.
    ///
    /// Nested documents are descended into using dotted paths. Leaves are skipped
    /// when `ignore` returns true for their path, when they are null and
    /// `update_null_values` is false, or when they are the identity field.
    ///
    /// # Errors
    ///
    /// Fails when `document` does not serialize into a BSON document.
    pub fn set_document<T, F>(mut self, document: &T, update_null_values: bool, ignore: F) -> DocumentStoreResult<Self>
    where
        T: Serialize,
        F: Fn(&str) -> bool,
    {
        let source = to_bson_document(document)?;
        let mut leaves = Document::new();

        collect_leaves(&source, None, update_null_values, &ignore, &mut leaves);

        if !leaves.is_empty() {
            self.push_definition(UpdateDefinition::Operators(doc! { "$set": leaves }));
        }

        Ok(self)
    }
}

fn collect_leaves<F>(
    document: &Document,
    prefix: Option<&str>,
    update_null_values: bool,
    ignore: &F,
    leaves: &mut Document,
) where
    F: Fn(&str) -> bool,
{
    for (key, value) in document {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };

        if (prefix.is_none() && key == ID_FIELD) || ignore(&path) {
            continue;
        }

        match value {
            Bson::Document(nested) => {
                collect_leaves(nested, Some(&path), update_null_values, ignore, leaves);
            }
            Bson::Null if !update_null_values => {}
            leaf => {
                leaves.insert(path, leaf.clone());
            }
        }
    }
}

impl<D> Default for Update<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for Update<D> {
    fn clone(&self) -> Self {
        Update {
            definition: self.definition.clone(),
            conflict: self.conflict.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Update<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("definition", &self.definition)
            .field("conflict", &self.conflict)
            .finish()
    }
}

impl<D> fmt::Display for Update<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.conflict, &self.definition) {
            (Some(conflict), _) => write!(f, "<invalid: {conflict}>"),
            (None, Some(definition)) => write!(f, "{definition}"),
            (None, None) => write!(f, "{{}}"),
        }
    }
}

impl<D> PartialEq for Update<D> {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl<D> Eq for Update<D> {}

impl<D> Hash for Update<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl<D> From<UpdateDefinition> for Update<D> {
    fn from(definition: UpdateDefinition) -> Self {
        Update::from_definition(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Field, Filter};
    use serde::Serialize;
    use std::collections::HashSet;

    #[derive(Serialize)]
    struct Address {
        street: Option<String>,
        city: Option<String>,
    }

    #[derive(Serialize)]
    struct Customer {
        #[serde(rename = "_id")]
        id: Option<String>,
        name: Option<String>,
        address: Address,
    }

    fn all_null() -> Customer {
        Customer {
            id: None,
            name: None,
            address: Address { street: None, city: None },
        }
    }

    type CustomerUpdate = Update<Customer>;

    #[test]
    fn fluent_operators_accumulate_into_one_instruction() {
        let update = CustomerUpdate::new()
            .set("name", "Ada")
            .set("address.city", "London")
            .inc("visits", 1)
            .unset("legacy");

        assert_eq!(
            update.render().unwrap(),
            UpdateDefinition::Operators(doc! {
                "$set": { "name": "Ada", "address.city": "London" },
                "$inc": { "visits": 1 },
                "$unset": { "legacy": "" },
            })
        );
        assert_eq!(update.instruction_count(), 4);
    }

    #[test]
    fn typed_fields_are_accepted() {
        const NAME: Field<Customer, String> = Field::new("name");

        let update = CustomerUpdate::new().set(NAME, "Ada");

        assert_eq!(update, CustomerUpdate::new().set("name", "Ada"));
    }

    #[test]
    fn set_document_skips_null_leaves_by_default() {
        let update = CustomerUpdate::new()
            .set_document(&all_null(), false, |_| false)
            .unwrap();

        assert_eq!(update.instruction_count(), 0);
        assert!(update.render().is_err());
    }

    #[test]
    fn set_document_emits_one_set_per_leaf_when_nulls_are_updated() {
        let update = CustomerUpdate::new()
            .set_document(&all_null(), true, |_| false)
            .unwrap();

        assert_eq!(
            update.render().unwrap(),
            UpdateDefinition::Operators(doc! {
                "$set": { "name": Bson::Null, "address.street": Bson::Null, "address.city": Bson::Null },
            })
        );
        assert_eq!(update.instruction_count(), 3);
    }

    #[test]
    fn set_document_honours_the_ignore_predicate() {
        let customer = Customer {
            id: Some("c-1".into()),
            name: Some("Ada".into()),
            address: Address { street: Some("Main".into()), city: Some("London".into()) },
        };

        let update = CustomerUpdate::new()
            .set_document(&customer, false, |path| path == "address.street")
            .unwrap();

        assert_eq!(
            update.render().unwrap(),
            UpdateDefinition::Operators(doc! { "$set": { "name": "Ada", "address.city": "London" } })
        );
    }

    #[test]
    fn parse_detects_pipelines() {
        let pipeline = CustomerUpdate::parse(r#"[{ "$set": { "a": 1 } }, { "$unset": "b" }]"#).unwrap();
        let operators = CustomerUpdate::parse(r#"{ "$set": { "a": 1 } }"#).unwrap();

        assert_eq!(pipeline.render().unwrap().as_pipeline().map(<[Document]>::len), Some(2));
        assert!(operators.render().unwrap().as_operators().is_some());
    }

    #[test]
    fn parse_rejects_malformed_text_and_echoes_it() {
        for text in ["{ \"$set\": ", "42", "[1, 2]"] {
            match CustomerUpdate::parse(text) {
                Err(DocumentStoreError::Conversion(message)) => assert!(message.contains(text)),
                other => panic!("unexpected result for {text}: {other:?}"),
            }
        }
    }

    #[test]
    fn mixing_pipeline_and_operators_is_reported_on_render() {
        let update = CustomerUpdate::parse(r#"[{ "$set": { "a": 1 } }]"#)
            .unwrap()
            .inc("b", 1);

        assert!(matches!(update.render(), Err(DocumentStoreError::Conversion(_))));
    }

    #[test]
    fn equality_and_hashing_are_structural() {
        let a = CustomerUpdate::new().set("name", "Ada").push("tags", "x");
        let b = CustomerUpdate::new().set("name", "Ada").push("tags", "x");
        let c = CustomerUpdate::new().set("name", "Bob");

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn pull_filter_uses_translated_condition() {
        let update = CustomerUpdate::new()
            .pull_filter("orders", &Filter::lt("total", 10))
            .unwrap();

        assert_eq!(
            update.render().unwrap(),
            UpdateDefinition::Operators(doc! { "$pull": { "orders": { "total": { "$lt": 10 } } } })
        );
    }

    #[test]
    fn stamp_writes_into_existing_set() {
        let mut definition = CustomerUpdate::new().set("name", "Ada").render().unwrap();

        definition.stamp("updated_by", "system");

        assert_eq!(
            definition,
            UpdateDefinition::Operators(doc! { "$set": { "name": "Ada", "updated_by": "system" } })
        );
    }
}

//! Filter expressions and their translation into store filter documents.
//!
//! [`Expr`] is the predicate AST used by single-document queries. The [`Filter`]
//! helper and the typed [`Field`] path build expressions; [`FilterTranslator`]
//! lowers them into the MongoDB filter dialect understood by every backend.
//!
//! - Comparison: `eq`, `ne`, `gt`, `gte`, `lt`, `lte`
//! - String: `starts_with`, `ends_with`, `contains`, `not_contains`
//! - Existence: `exists`, `not_exists`
//! - Array: `any_of`, `none_of`
//! - Logical: `and`, `or`, `not`
//!
//! # Example
//!
//! ```ignore
//! use docrepo::filter::Filter;
//!
//! let expr = Filter::eq("status", "active").and(Filter::gt("age", 18));
//! ```

use bson::{Bson, Document, doc};
use std::marker::PhantomData;

use crate::error::DocumentStoreError;

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Equal to (exact match).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// String or array contains value.
    Contains,
    /// String or array does not contain value.
    NotContains,
    /// String starts with value.
    StartsWith,
    /// String ends with value.
    EndsWith,
    /// Field matches any of the values.
    AnyOf,
    /// Field matches none of the values.
    NoneOf,
}

/// A filter expression for querying documents.
///
/// Expressions can be combined using logical operators (`And`, `Or`, `Not`).
/// `Native` embeds an already-built filter document so pre-built and raw filters
/// can take part in expression combinators.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field name to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
    /// A filter document passed through untouched.
    Native(Document),
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    ///
    /// If this expression is already an OR, the other expression is appended
    /// to the list. Otherwise, a new OR expression is created.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression. Negating a negation yields the inner expression.
    pub fn not(self) -> Self {
        match self {
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }

    /// Translates this expression into a store filter document.
    pub fn to_document(&self) -> Result<Document, DocumentStoreError> {
        FilterTranslator.visit_expr(self)
    }
}

impl From<Document> for Expr {
    fn from(document: Document) -> Self {
        Expr::Native(document)
    }
}

/// Helper struct for constructing filter expressions from field names.
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the specified value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field does not equal the specified value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    /// Matches documents where the field is greater than the specified value.
    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    /// Matches documents where the field is greater than or equal to the specified value.
    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    /// Matches documents where the field is less than the specified value.
    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    /// Matches documents where the field is less than or equal to the specified value.
    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents where the string field starts with the specified value.
    pub fn starts_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::StartsWith, value.into())
    }

    /// Matches documents where the string field ends with the specified value.
    pub fn ends_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::EndsWith, value.into())
    }

    /// Matches documents where the field (string or array) contains the specified value.
    pub fn contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Contains, value.into())
    }

    /// Matches documents where the field (string or array) does not contain the specified value.
    pub fn not_contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NotContains, value.into())
    }

    /// Matches documents where the field exists.
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    /// Matches documents where the field does not exist.
    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    /// Matches documents where the field equals any of the specified values.
    pub fn any_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::AnyOf, value.into())
    }

    /// Matches documents where the field equals none of the specified values.
    pub fn none_of(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NoneOf, value.into())
    }
}

/// Anything that names a (possibly dotted) document field.
pub trait FieldPath {
    /// Returns the dotted path of the field.
    fn path(&self) -> String;
}

impl FieldPath for &str {
    fn path(&self) -> String {
        (*self).to_string()
    }
}

impl FieldPath for String {
    fn path(&self) -> String {
        self.clone()
    }
}

impl FieldPath for &String {
    fn path(&self) -> String {
        (*self).clone()
    }
}

/// A typed reference to a field of document `D` holding values of type `T`.
///
/// Typed fields keep filters and updates honest about value types:
///
/// ```ignore
/// const AGE: Field<User, i32> = Field::new("age");
/// let adults = AGE.gte(18);
/// ```
pub struct Field<D, T> {
    path: &'static str,
    _marker: PhantomData<fn() -> (D, T)>,
}

impl<D, T> Field<D, T> {
    /// Creates a typed field reference for the given dotted path.
    pub const fn new(path: &'static str) -> Self {
        Self { path, _marker: PhantomData }
    }

    /// Returns the dotted path of the field.
    pub fn name(&self) -> &'static str {
        self.path
    }
}

impl<D, T> Clone for Field<D, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D, T> Copy for Field<D, T> {}

impl<D, T> FieldPath for Field<D, T> {
    fn path(&self) -> String {
        self.path.to_string()
    }
}

impl<D, T: Into<Bson>> Field<D, T> {
    /// Matches documents where this field equals `value`.
    pub fn eq(&self, value: T) -> Expr {
        Filter::eq(self.path, value)
    }

    /// Matches documents where this field differs from `value`.
    pub fn ne(&self, value: T) -> Expr {
        Filter::ne(self.path, value)
    }

    /// Matches documents where this field is greater than `value`.
    pub fn gt(&self, value: T) -> Expr {
        Filter::gt(self.path, value)
    }

    /// Matches documents where this field is at least `value`.
    pub fn gte(&self, value: T) -> Expr {
        Filter::gte(self.path, value)
    }

    /// Matches documents where this field is less than `value`.
    pub fn lt(&self, value: T) -> Expr {
        Filter::lt(self.path, value)
    }

    /// Matches documents where this field is at most `value`.
    pub fn lte(&self, value: T) -> Expr {
        Filter::lte(self.path, value)
    }

    /// Matches documents where this field equals any of `values`.
    pub fn any_of(&self, values: impl IntoIterator<Item = T>) -> Expr {
        Filter::any_of(
            self.path,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Matches documents where this field equals none of `values`.
    pub fn none_of(&self, values: impl IntoIterator<Item = T>) -> Expr {
        Filter::none_of(
            self.path,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }
}

impl<D, T> Field<D, T> {
    /// Matches documents where this field exists.
    pub fn exists(&self) -> Expr {
        Filter::exists(self.path)
    }
}

/// Walks an [`Expr`] tree.
///
/// Implementors produce one output per node; [`FilterTranslator`] renders BSON.
pub trait QueryVisitor {
    type Output;
    type Error: Into<DocumentStoreError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_native(&mut self, document: &Document) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
            Expr::Native(document) => self.visit_native(document),
        }
    }
}

/// Translates filter expressions into MongoDB-dialect filter documents.
///
/// Top-level negation is expressed with `$nor`, since `$not` is only valid as a
/// field operator. String patterns are regex-escaped.
pub struct FilterTranslator;

impl QueryVisitor for FilterTranslator {
    type Output = Document;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$and": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$or": exprs
                .iter()
                .map(|expr| self.visit_expr(expr))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            "$nor": [self.visit_expr(expr)?],
        })
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: { "$exists": should_exist },
        })
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        Ok(doc! {
            field: match op {
                FieldOp::Eq => doc! { "$eq": value },
                FieldOp::Ne => doc! { "$ne": value },
                FieldOp::Gt => doc! { "$gt": value },
                FieldOp::Gte => doc! { "$gte": value },
                FieldOp::Lt => doc! { "$lt": value },
                FieldOp::Lte => doc! { "$lte": value },
                FieldOp::Contains => match value {
                    Bson::String(s) => doc! { "$regex": regex::escape(s), "$options": "i" },
                    Bson::Array(arr) => doc! { "$all": arr },
                    other => doc! { "$elemMatch": { "$eq": other } },
                },
                FieldOp::NotContains => match value {
                    Bson::String(s) => doc! { "$not": { "$regex": regex::escape(s), "$options": "i" } },
                    Bson::Array(arr) => doc! { "$nin": arr },
                    other => doc! { "$ne": other },
                },
                FieldOp::StartsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("^{}", regex::escape(s)), "$options": "i" },
                    _ => return Err(DocumentStoreError::InvalidQuery("StartsWith operator requires a string value".to_string())),
                },
                FieldOp::EndsWith => match value {
                    Bson::String(s) => doc! { "$regex": format!("{}$", regex::escape(s)), "$options": "i" },
                    _ => return Err(DocumentStoreError::InvalidQuery("EndsWith operator requires a string value".to_string())),
                },
                FieldOp::AnyOf => match value {
                    Bson::Array(arr) => doc! { "$in": arr },
                    other => doc! { "$in": [other] },
                },
                FieldOp::NoneOf => match value {
                    Bson::Array(arr) => doc! { "$nin": arr },
                    other => doc! { "$nin": [other] },
                },
            }
        })
    }

    fn visit_native(&mut self, document: &Document) -> Result<Self::Output, Self::Error> {
        Ok(document.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_negation_collapses() {
        let expr = Filter::eq("name", "alice");

        assert_eq!(expr.clone().not().not(), expr);
    }

    #[test]
    fn negation_translates_to_nor() {
        let filter = Filter::eq("name", "alice").not().to_document().unwrap();

        assert_eq!(filter, doc! { "$nor": [{ "name": { "$eq": "alice" } }] });
    }

    #[test]
    fn contains_escapes_regex_metacharacters() {
        let filter = Filter::contains("email", "a.b").to_document().unwrap();

        assert_eq!(filter, doc! { "email": { "$regex": "a\\.b", "$options": "i" } });
    }

    #[test]
    fn typed_fields_build_the_same_filter_as_names() {
        struct User;
        const AGE: Field<User, i32> = Field::new("age");

        assert_eq!(AGE.gte(18), Filter::gte("age", 18));
        assert_eq!(
            AGE.any_of([1, 2]).to_document().unwrap(),
            doc! { "age": { "$in": [1, 2] } }
        );
    }

    #[test]
    fn native_documents_pass_through() {
        let native = doc! { "$text": { "$search": "coffee" } };

        assert_eq!(Expr::from(native.clone()).to_document().unwrap(), native);
    }
}

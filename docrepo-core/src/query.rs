//! The composable query algebra.
//!
//! A [`Query`] holds at most one filter shape plus optional attachments (an
//! [`Update`], aggregation stages, and find options). Queries are immutable
//! values: every fluent method and combinator returns a new query.
//!
//! # Filter shapes
//!
//! | constructor              | shape                                    |
//! |--------------------------|------------------------------------------|
//! | [`Query::raw`]           | JSON text, parsed eagerly                |
//! | [`Query::expr`]          | a single-document [`Expr`]               |
//! | [`Query::constrained`]   | a predicate needing a constraint document|
//! | [`Query::filter`]        | a pre-built filter document              |
//! | [`Query::text`]          | full-text search parameters              |
//!
//! A query with no shape matches every document. Absent operands are the
//! identity element of [`Query::and`] and [`Query::or`], so optional filters can be
//! added without checks:
//!
//! ```ignore
//! let query = Query::<User>::expr(Filter::eq("active", true))
//!     .and(tenant_filter) // may be Query::all()
//!     .sort("created_at", SortDirection::Desc)
//!     .limit(20);
//! ```

use bson::{Bson, Document, doc, ser::serialize_to_bson};
use std::{any::type_name, fmt, marker::PhantomData, sync::Arc};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::Expr,
    update::Update,
};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

/// Sort specification for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    /// Renders a list of sort keys as a store sort document.
    pub fn to_document(sorts: &[Sort]) -> Document {
        sorts
            .iter()
            .map(|sort| {
                (
                    sort.field.clone(),
                    Bson::Int32(match sort.direction {
                        SortDirection::Asc => 1,
                        SortDirection::Desc => -1,
                    }),
                )
            })
            .collect()
    }
}

/// Parameters of a full-text search.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextSearch {
    /// The search terms.
    pub search: String,
    /// Optional language used for stemming and stop words.
    pub language: Option<String>,
    /// Whether matching is case sensitive.
    pub case_sensitive: bool,
    /// Whether matching is diacritic sensitive.
    pub diacritic_sensitive: bool,
}

impl TextSearch {
    /// Creates text search parameters for the given terms.
    pub fn new(search: impl Into<String>) -> Self {
        Self { search: search.into(), ..Default::default() }
    }

    /// Sets the search language.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Makes matching case sensitive.
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Makes matching diacritic sensitive.
    pub fn diacritic_sensitive(mut self, diacritic_sensitive: bool) -> Self {
        self.diacritic_sensitive = diacritic_sensitive;
        self
    }

    /// Renders the `$text` filter document.
    pub fn to_document(&self) -> Document {
        let mut text = doc! { "$search": self.search.clone() };

        if let Some(language) = &self.language {
            text.insert("$language", language.clone());
        }
        text.insert("$caseSensitive", self.case_sensitive);
        text.insert("$diacriticSensitive", self.diacritic_sensitive);

        doc! { "$text": text }
    }
}

/// A predicate over a constraint document that yields a filter expression.
pub type Constraint<D> = Arc<dyn Fn(&D) -> Expr + Send + Sync>;

/// The five mutually exclusive filter shapes a query may carry.
pub enum QueryShape<D> {
    /// Raw JSON filter text together with its parsed form.
    Raw {
        /// The original text.
        text: String,
        /// The parsed filter document.
        filter: Document,
    },
    /// A single-document predicate expression.
    Expr(Expr),
    /// A predicate that needs a constraint document before it can run.
    Constrained(Constraint<D>),
    /// A pre-built filter document.
    Filter(Document),
    /// Full-text search parameters.
    Text(TextSearch),
}

impl<D> QueryShape<D> {
    fn is_complete(&self) -> bool {
        !matches!(self, QueryShape::Constrained(_))
    }

    /// Lowers a complete shape into an expression. Constrained shapes yield `None`.
    fn to_expr(&self) -> Option<Expr> {
        match self {
            QueryShape::Raw { filter, .. } => Some(Expr::Native(filter.clone())),
            QueryShape::Expr(expr) => Some(expr.clone()),
            QueryShape::Constrained(_) => None,
            QueryShape::Filter(filter) => Some(Expr::Native(filter.clone())),
            QueryShape::Text(text) => Some(Expr::Native(text.to_document())),
        }
    }

    fn complete(&self, constraint: &D) -> Expr {
        match self {
            QueryShape::Constrained(predicate) => predicate(constraint),
            complete => complete
                .to_expr()
                .unwrap_or_else(|| Expr::And(Vec::new())),
        }
    }
}

impl<D> Clone for QueryShape<D> {
    fn clone(&self) -> Self {
        match self {
            QueryShape::Raw { text, filter } => QueryShape::Raw { text: text.clone(), filter: filter.clone() },
            QueryShape::Expr(expr) => QueryShape::Expr(expr.clone()),
            QueryShape::Constrained(predicate) => QueryShape::Constrained(Arc::clone(predicate)),
            QueryShape::Filter(filter) => QueryShape::Filter(filter.clone()),
            QueryShape::Text(text) => QueryShape::Text(text.clone()),
        }
    }
}

impl<D> fmt::Debug for QueryShape<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryShape::Raw { text, .. } => f.debug_tuple("Raw").field(text).finish(),
            QueryShape::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            QueryShape::Constrained(_) => f.debug_tuple("Constrained").field(&type_name::<D>()).finish(),
            QueryShape::Filter(filter) => f.debug_tuple("Filter").field(filter).finish(),
            QueryShape::Text(text) => f.debug_tuple("Text").field(text).finish(),
        }
    }
}

#[derive(Clone, Copy)]
enum Junction {
    And,
    Or,
}

/// A structured, immutable query over documents of type `D`, projected into `P`.
pub struct Query<D, P = D> {
    shape: Option<QueryShape<D>>,
    update: Option<Update<D>>,
    pipeline: Option<Vec<Document>>,
    projection: Option<Document>,
    sort: Vec<Sort>,
    skip: Option<u64>,
    limit: Option<i64>,
    _marker: PhantomData<fn() -> P>,
}

impl<D, P> Query<D, P> {
    fn from_shape(shape: Option<QueryShape<D>>) -> Self {
        Query {
            shape,
            update: None,
            pipeline: None,
            projection: None,
            sort: Vec::new(),
            skip: None,
            limit: None,
            _marker: PhantomData,
        }
    }

    /// A query without a filter; matches every document.
    pub fn all() -> Self {
        Self::from_shape(None)
    }

    /// Parses a JSON filter document.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::Conversion`] when the text is not a JSON object.
    pub fn raw(text: impl Into<String>) -> DocumentStoreResult<Self> {
        let text = text.into();
        let filter = parse_json_document(&text)?;

        Ok(Self::from_shape(Some(QueryShape::Raw { text, filter })))
    }

    /// Builds a query from a single-document predicate expression.
    pub fn expr(expr: Expr) -> Self {
        Self::from_shape(Some(QueryShape::Expr(expr)))
    }

    /// Builds an incomplete query whose predicate depends on a constraint document.
    ///
    /// The query must be completed with [`Query::complete`] before it can be
    /// converted into a filter.
    pub fn constrained<F>(predicate: F) -> Self
    where
        F: Fn(&D) -> Expr + Send + Sync + 'static,
    {
        Self::from_shape(Some(QueryShape::Constrained(Arc::new(predicate))))
    }

    /// Wraps a pre-built filter document.
    pub fn filter(filter: Document) -> Self {
        Self::from_shape(Some(QueryShape::Filter(filter)))
    }

    /// Builds a full-text search query.
    pub fn text(search: TextSearch) -> Self {
        Self::from_shape(Some(QueryShape::Text(search)))
    }

    /// Returns the filter shape, if any.
    pub fn shape(&self) -> Option<&QueryShape<D>> {
        self.shape.as_ref()
    }

    /// Whether the query carries no filter shape.
    pub fn is_empty(&self) -> bool {
        self.shape.is_none()
    }

    /// Whether the query can be converted into a filter without a constraint document.
    pub fn is_complete(&self) -> bool {
        self.shape.as_ref().is_none_or(QueryShape::is_complete)
    }

    /// Converts the filter shape into an executable filter document.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::IncompleteExpression`] for constrained queries.
    pub fn to_filter(&self) -> DocumentStoreResult<Document> {
        match &self.shape {
            None => Ok(Document::new()),
            Some(QueryShape::Raw { filter, .. }) => Ok(filter.clone()),
            Some(QueryShape::Expr(expr)) => expr.to_document(),
            Some(QueryShape::Constrained(_)) => Err(DocumentStoreError::IncompleteExpression(
                type_name::<D>().to_string(),
            )),
            Some(QueryShape::Filter(filter)) => Ok(filter.clone()),
            Some(QueryShape::Text(text)) => Ok(text.to_document()),
        }
    }

    /// Binds the constraint document of a constrained query.
    ///
    /// Complete queries are returned unchanged.
    pub fn complete(&self, constraint: &D) -> Self {
        let shape = match &self.shape {
            Some(QueryShape::Constrained(predicate)) => Some(QueryShape::Expr(predicate(constraint))),
            other => other.clone(),
        };

        Self { shape, ..self.clone_attachments() }
    }

    /// Conjunction; an empty operand is the identity element.
    pub fn and(self, other: Query<D, P>) -> Self
    where
        D: 'static,
    {
        self.join(other, Junction::And)
    }

    /// Disjunction; an empty operand is the identity element.
    pub fn or(self, other: Query<D, P>) -> Self
    where
        D: 'static,
    {
        self.join(other, Junction::Or)
    }

    /// Negation. Empty queries stay empty and double negation collapses.
    pub fn not(self) -> Self
    where
        D: 'static,
    {
        let shape = match self.shape {
            None => None,
            Some(QueryShape::Constrained(predicate)) => Some(QueryShape::Constrained(Arc::new(
                move |constraint: &D| predicate(constraint).not(),
            ))),
            Some(QueryShape::Expr(expr)) => Some(QueryShape::Expr(expr.not())),
            Some(complete) => complete.to_expr().map(|expr| QueryShape::Expr(expr.not())),
        };

        Self { shape, ..self }
    }

    /// Merges two queries: filters are ANDed, updates combined, pipelines concatenated.
    ///
    /// Find options of `self` win; missing ones are taken from `other`.
    pub fn combine(self, other: Query<D, P>) -> Self
    where
        D: 'static,
    {
        let update = match (self.update.clone(), other.update.clone()) {
            (Some(left), Some(right)) => Some(left.combine(right)),
            (left, right) => left.or(right),
        };
        let pipeline = match (self.pipeline.clone(), other.pipeline.clone()) {
            (Some(mut left), Some(right)) => {
                left.extend(right);
                Some(left)
            }
            (left, right) => left.or(right),
        };
        let projection = self.projection.clone().or_else(|| other.projection.clone());
        let sort = if self.sort.is_empty() { other.sort.clone() } else { self.sort.clone() };
        let skip = self.skip.or(other.skip);
        let limit = self.limit.or(other.limit);
        let joined = self.join(other, Junction::And);

        Self { update, pipeline, projection, sort, skip, limit, ..joined }
    }

    fn join(self, other: Query<D, P>, junction: Junction) -> Self
    where
        D: 'static,
    {
        let shape = match (self.shape.clone(), other.shape) {
            (None, right) => right,
            (left, None) => left,
            (Some(left), Some(right)) if left.is_complete() && right.is_complete() => {
                match (left.to_expr(), right.to_expr()) {
                    (Some(left), Some(right)) => Some(QueryShape::Expr(junction.apply(left, right))),
                    _ => None,
                }
            }
            (Some(left), Some(right)) => Some(QueryShape::Constrained(Arc::new(
                move |constraint: &D| junction.apply(left.complete(constraint), right.complete(constraint)),
            ))),
        };

        Self { shape, ..self }
    }

    /// Attaches an update to this query.
    pub fn with_update(mut self, update: Update<D>) -> Self {
        self.update = Some(update);
        self
    }

    /// Attaches aggregation stages that run after the filter stage.
    pub fn with_pipeline(mut self, stages: impl IntoIterator<Item = Document>) -> Self {
        self.pipeline = Some(stages.into_iter().collect());
        self
    }

    /// Sets the projection document applied to find results.
    pub fn project(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Appends a sort key.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(Sort { field: field.into(), direction });
        self
    }

    /// Sets the number of documents to skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The attached update, if any.
    pub fn update(&self) -> Option<&Update<D>> {
        self.update.as_ref()
    }

    /// The attached aggregation stages, if any.
    pub fn pipeline(&self) -> Option<&[Document]> {
        self.pipeline.as_deref()
    }

    /// The projection document, if any.
    pub fn projection(&self) -> Option<&Document> {
        self.projection.as_ref()
    }

    /// The sort keys in priority order.
    pub fn sorts(&self) -> &[Sort] {
        &self.sort
    }

    /// The number of documents to skip, if set.
    pub fn skip_count(&self) -> Option<u64> {
        self.skip
    }

    /// The result limit, if set.
    pub fn limit_count(&self) -> Option<i64> {
        self.limit
    }

    /// Re-types the projection of this query, preserving its filter shape and attachments.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::InvalidQuery`] when no filter shape is populated.
    pub fn into_projection<Q>(self) -> DocumentStoreResult<Query<D, Q>> {
        if self.shape.is_none() {
            return Err(DocumentStoreError::InvalidQuery(format!(
                "cannot convert a query without a filter into a projection onto {}",
                type_name::<Q>()
            )));
        }

        Ok(Query {
            shape: self.shape,
            update: self.update,
            pipeline: self.pipeline,
            projection: self.projection,
            sort: self.sort,
            skip: self.skip,
            limit: self.limit,
            _marker: PhantomData,
        })
    }

    fn clone_attachments(&self) -> Self {
        Query {
            shape: None,
            update: self.update.clone(),
            pipeline: self.pipeline.clone(),
            projection: self.projection.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            _marker: PhantomData,
        }
    }
}

impl Junction {
    fn apply(self, left: Expr, right: Expr) -> Expr {
        match self {
            Junction::And => left.and(right),
            Junction::Or => left.or(right),
        }
    }
}

impl<D, P> Clone for Query<D, P> {
    fn clone(&self) -> Self {
        Query { shape: self.shape.clone(), ..self.clone_attachments() }
    }
}

impl<D, P> Default for Query<D, P> {
    fn default() -> Self {
        Self::all()
    }
}

impl<D, P> fmt::Debug for Query<D, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("shape", &self.shape)
            .field("update", &self.update)
            .field("pipeline", &self.pipeline)
            .field("projection", &self.projection)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<D, P> From<Expr> for Query<D, P> {
    fn from(expr: Expr) -> Self {
        Query::expr(expr)
    }
}

impl<D, P> From<Document> for Query<D, P> {
    fn from(filter: Document) -> Self {
        Query::filter(filter)
    }
}

impl<D, P> From<TextSearch> for Query<D, P> {
    fn from(search: TextSearch) -> Self {
        Query::text(search)
    }
}

impl<D, P> From<Option<Query<D, P>>> for Query<D, P> {
    fn from(query: Option<Query<D, P>>) -> Self {
        query.unwrap_or_default()
    }
}

/// Parses JSON text into a BSON document, echoing the text on failure.
pub(crate) fn parse_json_document(text: &str) -> DocumentStoreResult<Document> {
    match parse_json(text)? {
        Bson::Document(document) => Ok(document),
        _ => Err(DocumentStoreError::Conversion(format!(
            "expected a JSON object, got `{text}`"
        ))),
    }
}

/// Parses JSON text into BSON, echoing the text on failure.
pub(crate) fn parse_json(text: &str) -> DocumentStoreResult<Bson> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| DocumentStoreError::Conversion(format!("invalid JSON `{text}`: {e}")))?;

    serialize_to_bson(&value)
        .map_err(|e| DocumentStoreError::Conversion(format!("cannot convert `{text}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        tenant: String,
        balance: i64,
    }

    type AccountQuery = Query<Account>;

    fn filter_of(query: &AccountQuery) -> Document {
        query.to_filter().unwrap()
    }

    #[test]
    fn empty_operand_is_identity_for_and() {
        let a = AccountQuery::expr(Filter::eq("tenant", "acme"));

        assert_eq!(filter_of(&a.clone().and(Query::all())), filter_of(&a));
        assert_eq!(filter_of(&Query::all().and(a.clone())), filter_of(&a));
    }

    #[test]
    fn empty_operand_is_identity_for_or() {
        let a = AccountQuery::expr(Filter::gt("balance", 10));

        assert_eq!(filter_of(&a.clone().or(Query::all())), filter_of(&a));
        assert_eq!(filter_of(&Query::all().or(a.clone())), filter_of(&a));
    }

    #[test]
    fn constrained_query_fails_until_completed() {
        let query = AccountQuery::constrained(|c: &Account| Filter::eq("tenant", c.tenant.clone()));

        assert!(!query.is_complete());
        assert!(matches!(
            query.to_filter(),
            Err(DocumentStoreError::IncompleteExpression(name)) if name.contains("Account")
        ));
    }

    #[test]
    fn completing_binds_the_constraint_document() {
        let constraint = Account { tenant: "acme".into(), balance: 5 };
        let query = AccountQuery::constrained(|c: &Account| {
            Filter::eq("tenant", c.tenant.clone()).and(Filter::gte("balance", c.balance))
        });

        let direct = AccountQuery::expr(
            Filter::eq("tenant", "acme").and(Filter::gte("balance", 5_i64)),
        );

        assert_eq!(filter_of(&query.complete(&constraint)), filter_of(&direct));
    }

    #[test]
    fn combining_with_constrained_query_stays_incomplete() {
        let constraint = Account { tenant: "acme".into(), balance: 0 };
        let query = AccountQuery::expr(Filter::gt("balance", 0))
            .and(AccountQuery::constrained(|c: &Account| Filter::eq("tenant", c.tenant.clone())));

        assert!(query.to_filter().is_err());
        assert_eq!(
            filter_of(&query.complete(&constraint)),
            doc! { "$and": [{ "balance": { "$gt": 0 } }, { "tenant": { "$eq": "acme" } }] }
        );
    }

    #[test]
    fn raw_text_is_parsed_eagerly() {
        let query = AccountQuery::raw(r#"{ "balance": { "$gt": 10 } }"#).unwrap();

        assert_eq!(filter_of(&query), doc! { "balance": { "$gt": 10_i64 } });

        let err = AccountQuery::raw("{ balance: ").unwrap_err();
        assert!(matches!(err, DocumentStoreError::Conversion(text) if text.contains("{ balance: ")));
    }

    #[test]
    fn raw_and_prebuilt_filters_combine_as_native_nodes() {
        let query = AccountQuery::raw(r#"{ "tenant": "acme" }"#)
            .unwrap()
            .or(AccountQuery::filter(doc! { "balance": 0 }));

        assert_eq!(
            filter_of(&query),
            doc! { "$or": [{ "tenant": "acme" }, { "balance": 0 }] }
        );
    }

    #[test]
    fn text_search_renders_text_operator() {
        let query = AccountQuery::text(TextSearch::new("coffee").language("en"));

        assert_eq!(
            filter_of(&query),
            doc! { "$text": { "$search": "coffee", "$language": "en", "$caseSensitive": false, "$diacriticSensitive": false } }
        );
    }

    #[test]
    fn projection_conversion_preserves_shape() {
        #[derive(Debug, Clone, Deserialize)]
        struct TenantOnly {
            #[allow(dead_code)]
            tenant: String,
        }

        let query = AccountQuery::expr(Filter::eq("tenant", "acme")).limit(3);
        let projected: Query<Account, TenantOnly> = query.clone().into_projection().unwrap();

        assert_eq!(projected.to_filter().unwrap(), filter_of(&query));
        assert_eq!(projected.limit_count(), Some(3));
        assert!(AccountQuery::all().into_projection::<TenantOnly>().is_err());
    }

    #[test]
    fn combine_merges_attachments() {
        let left = AccountQuery::expr(Filter::eq("tenant", "acme"))
            .with_update(Update::new().set("balance", 1));
        let right = AccountQuery::expr(Filter::gt("balance", 0))
            .with_update(Update::new().inc("version", 1))
            .with_pipeline([doc! { "$limit": 1 }])
            .limit(7);

        let combined = left.combine(right);

        assert_eq!(
            combined.update().unwrap().render().unwrap().as_operators().cloned(),
            Some(doc! { "$set": { "balance": 1 }, "$inc": { "version": 1 } })
        );
        assert_eq!(combined.pipeline().map(<[Document]>::len), Some(1));
        assert_eq!(combined.limit_count(), Some(7));
    }

    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            ("[a-z]{1,6}", any::<i32>()).prop_map(|(f, v)| Filter::eq(f, v)),
            ("[a-z]{1,6}", any::<i64>()).prop_map(|(f, v)| Filter::gt(f, v)),
            "[a-z]{1,6}".prop_map(Filter::exists),
        ];

        leaf.prop_recursive(3, 12, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::and),
                prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::or),
                inner.prop_map(Expr::not),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_and_with_empty_middle_matches_direct_and(a in arb_expr(), b in arb_expr()) {
            let with_gap = AccountQuery::expr(a.clone())
                .and(Query::all())
                .and(AccountQuery::expr(b.clone()));
            let direct = AccountQuery::expr(a).and(AccountQuery::expr(b));

            prop_assert_eq!(with_gap.to_filter().unwrap(), direct.to_filter().unwrap());
        }

        #[test]
        fn prop_double_negation_is_identity(a in arb_expr()) {
            let query = AccountQuery::expr(a);

            prop_assert_eq!(query.clone().not().not().to_filter().unwrap(), query.to_filter().unwrap());
        }
    }
}

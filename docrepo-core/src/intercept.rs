//! Interception hooks invoked around every repository operation.
//!
//! A context carries one [`Interceptor`]. The repository calls its `before_*`
//! hooks right before a request is dispatched and [`Interceptor::after_result`]
//! on every value that comes back, including once per element of a streamed
//! read. This is the seam for policies such as tenant scoping, soft-delete
//! filtering or audit stamping.
//!
//! ```ignore
//! struct SoftDelete;
//!
//! impl Interceptor for SoftDelete {
//!     fn before_find(&self, _: &HookContext<'_>, filter: &mut Document, _: &mut FindOptions) -> DocumentStoreResult<()> {
//!         filter.insert("deleted", doc! { "$ne": true });
//!         Ok(())
//!     }
//! }
//! ```

use bson::Document;

use crate::{
    backend::{AggregateOptions, BulkWriteResult, FindOptions, IndexModel, UpdateOptions},
    error::DocumentStoreResult,
    metadata::FieldMapping,
    update::UpdateDefinition,
};

/// The kind of repository operation a hook runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Find,
    Count,
    Aggregate,
    Insert,
    Update,
    Replace,
    Delete,
    FindOneAndUpdate,
    BulkWrite,
}

/// What a hook is being invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext<'a> {
    /// Target collection.
    pub collection: &'a str,
    /// Operation kind.
    pub operation: Operation,
}

impl<'a> HookContext<'a> {
    pub fn new(collection: &'a str, operation: Operation) -> Self {
        Self { collection, operation }
    }
}

/// A mutable view of a value returned by the store.
#[derive(Debug)]
pub enum ResultMut<'a> {
    /// One document of a read.
    Document(&'a mut Document),
    /// A count.
    Count(&'a mut u64),
    /// The result of a bulk write.
    Write(&'a mut BulkWriteResult),
}

/// Hooks a context applies to the repositories it creates.
///
/// Every method defaults to a no-op. Hooks run synchronously and in-process;
/// returning an error aborts the operation before (or after) the store call.
pub trait Interceptor: Send + Sync + 'static {
    /// Rewrites a document about to be inserted.
    ///
    /// Returning `Ok(None)` makes the operation fail with
    /// [`DocumentStoreError::NoDocument`](crate::error::DocumentStoreError::NoDocument).
    fn before_insert(&self, ctx: &HookContext<'_>, document: Document) -> DocumentStoreResult<Option<Document>> {
        let _ = ctx;
        Ok(Some(document))
    }

    /// Rewrites the filter, update and options of an update or replace.
    fn before_update(
        &self,
        ctx: &HookContext<'_>,
        filter: &mut Document,
        update: &mut UpdateDefinition,
        options: &mut UpdateOptions,
    ) -> DocumentStoreResult<()> {
        let _ = (ctx, filter, update, options);
        Ok(())
    }

    /// Rewrites the filter and options of a find.
    ///
    /// Also invoked for counts and deletes; `ctx.operation` tells them apart.
    fn before_find(&self, ctx: &HookContext<'_>, filter: &mut Document, options: &mut FindOptions) -> DocumentStoreResult<()> {
        let _ = (ctx, filter, options);
        Ok(())
    }

    /// Rewrites an aggregation pipeline and its options.
    fn before_aggregate(
        &self,
        ctx: &HookContext<'_>,
        pipeline: &mut Vec<Document>,
        options: &mut AggregateOptions,
    ) -> DocumentStoreResult<()> {
        let _ = (ctx, pipeline, options);
        Ok(())
    }

    /// Inspects or rewrites a value returned by the store.
    fn after_result(&self, ctx: &HookContext<'_>, result: ResultMut<'_>) -> DocumentStoreResult<()> {
        let _ = (ctx, result);
        Ok(())
    }

    /// Registers logical-to-wire field names for a collection.
    ///
    /// Called once per process when the collection's metadata is built.
    fn map_fields(&self, collection: &str, mapping: &mut FieldMapping) {
        let _ = (collection, mapping);
    }

    /// Adjusts the index set declared for a collection.
    ///
    /// Receives the conventional indexes and may add, change or remove entries.
    fn build_indexes(&self, collection: &str, indexes: &mut Vec<IndexModel>) {
        let _ = (collection, indexes);
    }
}

/// An interceptor that changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {}

//! Convenient re-exports of commonly used types from docrepo.
//!
//! ```ignore
//! use docrepo::prelude::*;
//! ```
//!
//! This provides access to:
//! - Document traits and contexts
//! - Repositories and their builders
//! - Queries, filters and updates
//! - Interceptor hooks
//! - Error types

pub use docrepo_core::{
    backend::{
        BulkWriteOptions, FindOneAndUpdateOptions, IndexModel, ReturnDocument, StoreBackend, StoreBackendBuilder,
        UpdateOptions, WriteModel,
    },
    cancel::CancellationToken,
    config::{ContextConfig, IndexConventions},
    context::{Context, ContextBuilder},
    document::{Document, DocumentExt},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{Expr, Field, FieldOp, FieldPath, Filter},
    intercept::{HookContext, Interceptor, NoopInterceptor, Operation, ResultMut},
    metadata::FieldMapping,
    page::{PageRequest, PagedResult},
    query::{Query, SortDirection, TextSearch},
    repository::{Repository, RepositoryBuilder, WriteOutcome},
    update::{Update, UpdateDefinition},
};

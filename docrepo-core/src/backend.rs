//! Storage backend abstraction for the repository layer.
//!
//! This module defines the driver-facing contract the repository talks to. A
//! backend owns collections of BSON documents, hands out sessions that may be
//! promoted into transactions, and executes filters, aggregation pipelines and
//! bulk writes expressed in the MongoDB dialect.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`StoreCursor`]: Batch-wise access to read results
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Sessions
//!
//! Every data operation accepts an optional [`SessionId`]. When present the
//! operation participates in that session (and in its transaction, if one was
//! started); when absent it runs outside any transaction.

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{collections::VecDeque, fmt, fmt::Debug, sync::Arc};
use uuid::Uuid;

use crate::{error::DocumentStoreResult, update::UpdateDefinition};

/// Opaque handle of a backend session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocates a fresh, random session handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options applied to `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Projection document.
    pub projection: Option<Document>,
    /// Sort document.
    pub sort: Option<Document>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Number of documents per cursor batch.
    pub batch_size: Option<u32>,
}

/// Options applied to `aggregate`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOptions {
    /// Number of documents per cursor batch.
    pub batch_size: Option<u32>,
    /// Allow stages to spill to disk.
    pub allow_disk_use: Option<bool>,
}

/// Options applied to `count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountOptions {
    /// Number of matching documents to skip before counting.
    pub skip: Option<u64>,
    /// Maximum number of documents to count.
    pub limit: Option<u64>,
}

/// Options shared by update and replace write models.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    /// Insert a new document when nothing matches.
    pub upsert: bool,
    /// Filters selecting the array elements targeted by `$[identifier]` paths.
    pub array_filters: Option<Vec<Document>>,
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    /// The document as it was before the update.
    Before,
    /// The document after the update.
    #[default]
    After,
}

/// Options applied to `find_one_and_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndUpdateOptions {
    /// Projection of the returned document.
    pub projection: Option<Document>,
    /// Sort deciding which document is updated when several match.
    pub sort: Option<Document>,
    /// Insert a new document when nothing matches.
    pub upsert: bool,
    /// Version of the document to return.
    pub return_document: ReturnDocument,
    /// Filters selecting the array elements targeted by `$[identifier]` paths.
    pub array_filters: Option<Vec<Document>>,
}

/// Options applied when a collection is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateCollectionOptions {
    /// Whether the collection is capped.
    pub capped: bool,
    /// Maximum size in bytes of a capped collection.
    pub size: Option<u64>,
    /// Maximum number of documents in a capped collection.
    pub max: Option<u64>,
    /// Validator document.
    pub validator: Option<Document>,
}

/// Options applied to `bulk_write`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteOptions {
    /// Stop at the first failing model.
    pub ordered: bool,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Declaration of one index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    /// Index keys and their directions.
    pub keys: Document,
    /// Explicit index name; derived from the keys when unset.
    pub name: Option<String>,
    /// Enforce uniqueness.
    pub unique: bool,
    /// Skip documents missing the indexed fields.
    pub sparse: bool,
}

impl IndexModel {
    /// Creates an index over the given keys.
    pub fn new(keys: Document) -> Self {
        Self { keys, name: None, unique: false, sparse: false }
    }

    /// Creates an ascending single-field index.
    pub fn ascending(field: impl Into<String>) -> Self {
        let mut keys = Document::new();
        keys.insert(field.into(), 1);
        Self::new(keys)
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the index sparse.
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Sets an explicit index name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The explicit name, or the conventional `field_direction` name.
    pub fn index_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|(field, direction)| match direction {
                    Bson::String(kind) => format!("{field}_{kind}"),
                    other => format!("{field}_{other}"),
                })
                .collect::<Vec<_>>()
                .join("_")
        })
    }
}

/// One operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    /// Inserts a document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },
    /// Updates the first matching document.
    UpdateOne {
        /// Selects the document.
        filter: Document,
        /// Operator or pipeline update.
        update: UpdateDefinition,
        /// Upsert and array filter options.
        options: UpdateOptions,
    },
    /// Updates every matching document.
    UpdateMany {
        /// Selects the documents.
        filter: Document,
        /// Operator or pipeline update.
        update: UpdateDefinition,
        /// Upsert and array filter options.
        options: UpdateOptions,
    },
    /// Replaces the first matching document.
    ReplaceOne {
        /// Selects the document.
        filter: Document,
        /// The replacement.
        replacement: Document,
        /// Upsert option.
        upsert: bool,
    },
    /// Deletes the first matching document.
    DeleteOne {
        /// Selects the document.
        filter: Document,
    },
    /// Deletes every matching document.
    DeleteMany {
        /// Selects the documents.
        filter: Document,
    },
}

impl WriteModel {
    /// Short name of the model kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insert_one",
            WriteModel::UpdateOne { .. } => "update_one",
            WriteModel::UpdateMany { .. } => "update_many",
            WriteModel::ReplaceOne { .. } => "replace_one",
            WriteModel::DeleteOne { .. } => "delete_one",
            WriteModel::DeleteMany { .. } => "delete_many",
        }
    }
}

/// Result of a bulk write as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Whether the store acknowledged the write.
    pub acknowledged: bool,
    /// Number of inserted documents.
    pub inserted: u64,
    /// Number of documents matched by update and replace models.
    pub matched: u64,
    /// Number of documents modified by update and replace models.
    pub modified: u64,
    /// Number of deleted documents.
    pub deleted: u64,
    /// Number of documents inserted through upserts.
    pub upserted: u64,
}

/// Batch-wise access to the documents produced by a read.
#[async_trait]
pub trait StoreCursor: Send {
    /// Returns the next batch, or `None` once the cursor is exhausted.
    async fn next_batch(&mut self) -> DocumentStoreResult<Option<Vec<Document>>>;
}

/// A cursor over documents that are already materialized.
#[derive(Debug, Default)]
pub struct BatchCursor {
    batches: VecDeque<Vec<Document>>,
}

impl BatchCursor {
    /// Splits `documents` into batches of at most `batch_size` documents.
    pub fn new(documents: Vec<Document>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = VecDeque::new();
        let mut documents = documents.into_iter().peekable();

        while documents.peek().is_some() {
            batches.push_back(documents.by_ref().take(batch_size).collect());
        }

        Self { batches }
    }
}

#[async_trait]
impl StoreCursor for BatchCursor {
    async fn next_batch(&mut self) -> DocumentStoreResult<Option<Vec<Document>>> {
        Ok(self.batches.pop_front())
    }
}

/// Abstract interface for document storage backends.
///
/// Implementations must be thread-safe; a single backend is shared by every
/// repository created from one context.
///
/// # Transactions
///
/// `start_transaction` on a session that is already in a transaction is a
/// no-op. `commit_transaction` and `abort_transaction` leave the session open
/// and outside any transaction.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Name of the database this backend targets.
    fn database_name(&self) -> &str;

    /// Stable hash identifying the connection (e.g. of the connection string).
    fn connection_fingerprint(&self) -> u64;

    /// Opens a new session.
    async fn start_session(&self) -> DocumentStoreResult<SessionId>;

    /// Starts a transaction on the session.
    async fn start_transaction(&self, session: &SessionId) -> DocumentStoreResult<()>;

    /// Commits the session's transaction.
    async fn commit_transaction(&self, session: &SessionId) -> DocumentStoreResult<()>;

    /// Aborts the session's transaction, discarding its writes.
    async fn abort_transaction(&self, session: &SessionId) -> DocumentStoreResult<()>;

    /// Ends the session. An open transaction is aborted.
    async fn end_session(&self, session: SessionId) -> DocumentStoreResult<()>;

    /// Lists the names of all collections in the database.
    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>>;

    /// Creates a collection.
    async fn create_collection(&self, name: &str, options: CreateCollectionOptions) -> DocumentStoreResult<()>;

    /// Creates an index and returns its name. Creating an identical index again succeeds.
    async fn create_index(&self, collection: &str, index: IndexModel) -> DocumentStoreResult<String>;

    /// Lists the indexes of a collection.
    async fn list_indexes(&self, collection: &str) -> DocumentStoreResult<Vec<IndexModel>>;

    /// Runs a filter and returns a cursor over the matches.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>>;

    /// Runs an aggregation pipeline and returns a cursor over its output.
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>>;

    /// Counts the documents matching a filter.
    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: CountOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<u64>;

    /// Executes a batch of write models in one request.
    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<BulkWriteResult>;

    /// Atomically updates one document and returns it.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateDefinition,
        options: FindOneAndUpdateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Option<Document>>;

    /// Releases backend resources.
    async fn shutdown(&self) -> DocumentStoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend + ?Sized,
{
    fn database_name(&self) -> &str {
        (**self).database_name()
    }

    fn connection_fingerprint(&self) -> u64 {
        (**self).connection_fingerprint()
    }

    async fn start_session(&self) -> DocumentStoreResult<SessionId> {
        (**self).start_session().await
    }

    async fn start_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        (**self).start_transaction(session).await
    }

    async fn commit_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        (**self).commit_transaction(session).await
    }

    async fn abort_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        (**self).abort_transaction(session).await
    }

    async fn end_session(&self, session: SessionId) -> DocumentStoreResult<()> {
        (**self).end_session(session).await
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        (**self).list_collections().await
    }

    async fn create_collection(&self, name: &str, options: CreateCollectionOptions) -> DocumentStoreResult<()> {
        (**self)
            .create_collection(name, options)
            .await
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> DocumentStoreResult<String> {
        (**self)
            .create_index(collection, index)
            .await
    }

    async fn list_indexes(&self, collection: &str) -> DocumentStoreResult<Vec<IndexModel>> {
        (**self).list_indexes(collection).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        (**self)
            .find(collection, filter, options, session)
            .await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        (**self)
            .aggregate(collection, pipeline, options, session)
            .await
    }

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: CountOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<u64> {
        (**self)
            .count(collection, filter, options, session)
            .await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<BulkWriteResult> {
        (**self)
            .bulk_write(collection, models, options, session)
            .await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateDefinition,
        options: FindOneAndUpdateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Option<Document>> {
        (**self)
            .find_one_and_update(collection, filter, update, options, session)
            .await
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        (**self).shutdown().await
    }
}

/// Asynchronous factory for backends.
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}

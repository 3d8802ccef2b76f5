//! The per-collection CRUD façade.
//!
//! A [`Repository`] runs every operation through the same steps: resolve the
//! session (see [`session`](crate::session)), let the context's
//! [`Interceptor`] rewrite the request, map logical field names to wire names,
//! dispatch to the backend and pass every returned value through
//! [`Interceptor::after_result`].
//!
//! Writes all funnel through [`Repository::bulk_write`]; reads drain backend
//! cursors batch by batch.
//!
//! ```ignore
//! let accounts = context.repository::<Account>().build().await?;
//!
//! accounts.insert(&account).await?;
//!
//! let rich: Vec<Account> = accounts
//!     .get_many(Query::expr(Filter::gt("balance", 1_000)).sort("balance", SortDirection::Desc))
//!     .await?;
//!
//! let page: PagedResult<Account> = accounts.paginate(Query::all(), PageRequest::new(2, 20)).await?;
//! ```

use bson::{Bson, Document as BsonDocument, doc};
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::{collections::VecDeque, fmt, marker::PhantomData, sync::Arc};

use crate::{
    backend::{
        AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, CreateCollectionOptions,
        FindOneAndUpdateOptions, FindOptions, SessionId, StoreBackend, StoreCursor, UpdateOptions, WriteModel,
    },
    cancel::CancellationToken,
    context::Context,
    document::{Document, DocumentExt, ID_FIELD, from_bson_document},
    error::{DocumentStoreError, DocumentStoreResult},
    intercept::{HookContext, Interceptor, NoopInterceptor, Operation, ResultMut},
    metadata::{CollectionMetadata, FieldMapping, MetadataRegistry},
    page::{PageRequest, PagedResult},
    query::{Query, Sort},
    session::{self, AfterTransaction, SessionHandle, SessionSlot},
    update::UpdateDefinition,
};

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store acknowledged the write; carries
    /// `deleted + modified + matched + inserted`.
    Acknowledged(u64),
    /// The store did not acknowledge the write.
    Unacknowledged,
}

impl WriteOutcome {
    /// The affected count, or `-1` for an unacknowledged write.
    pub fn count(&self) -> i64 {
        match self {
            WriteOutcome::Acknowledged(count) => i64::try_from(*count).unwrap_or(i64::MAX),
            WriteOutcome::Unacknowledged => -1,
        }
    }

    /// Whether the store acknowledged the write.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, WriteOutcome::Acknowledged(_))
    }
}

impl From<&BulkWriteResult> for WriteOutcome {
    fn from(result: &BulkWriteResult) -> Self {
        if result.acknowledged {
            WriteOutcome::Acknowledged(result.deleted + result.modified + result.matched + result.inserted)
        } else {
            WriteOutcome::Unacknowledged
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cardinality {
    First,
    Single,
}

impl Cardinality {
    fn probe_limit(self) -> i64 {
        match self {
            Cardinality::First => 1,
            Cardinality::Single => 2,
        }
    }
}

struct StreamState {
    cursor: Box<dyn StoreCursor>,
    buffered: VecDeque<BsonDocument>,
}

/// Typed repository over one collection.
pub struct Repository<D, B, I = NoopInterceptor>
where
    D: Document,
    B: StoreBackend,
    I: Interceptor,
{
    context: Context<B, I>,
    collection: String,
    metadata: Arc<CollectionMetadata>,
    dedicated: Arc<SessionSlot>,
    force_transaction: Option<bool>,
    cancellation: Vec<CancellationToken>,
    _marker: PhantomData<fn() -> D>,
}

impl<D, B, I> Repository<D, B, I>
where
    D: Document,
    B: StoreBackend,
    I: Interceptor,
{
    /// Name of the collection this repository reads and writes.
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn context(&self) -> &Context<B, I> {
        &self.context
    }

    /// Indexes and field mapping shared by every repository of this collection.
    pub fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }

    /// A snapshot of the dedicated session, if this repository owns one.
    pub async fn dedicated_session(&self) -> Option<SessionHandle> {
        self.dedicated.current().await
    }

    fn hook(&self, operation: Operation) -> HookContext<'_> {
        HookContext::new(&self.collection, operation)
    }

    fn fields(&self) -> &FieldMapping {
        self.metadata.fields()
    }

    /// A view of this repository whose operations also observe `token`.
    ///
    /// The view shares the collection, metadata and dedicated session, so it
    /// can scope cancellation to a single call:
    /// `repo.cancellable(token.clone()).get_many(query)`.
    pub fn cancellable(&self, token: CancellationToken) -> Self {
        let mut cancellation = self.cancellation.clone();
        cancellation.push(token);

        Self {
            context: self.context.clone(),
            collection: self.collection.clone(),
            metadata: Arc::clone(&self.metadata),
            dedicated: Arc::clone(&self.dedicated),
            force_transaction: self.force_transaction,
            cancellation,
            _marker: PhantomData,
        }
    }

    fn check_cancelled(&self) -> DocumentStoreResult<()> {
        self.cancellation.iter().try_for_each(CancellationToken::check)
    }

    async fn session(&self, force_transaction: Option<bool>) -> DocumentStoreResult<Option<SessionId>> {
        session::resolve(
            self.context.backend(),
            &self.dedicated,
            self.context.ambient_slot(),
            force_transaction,
        )
        .await
    }

    async fn provision(&self, options: CreateCollectionOptions) -> DocumentStoreResult<()> {
        if self.context.config().create_collections && !self.context.has_collection(&self.collection) {
            self.context
                .backend()
                .create_collection(&self.collection, options)
                .await?;
            self.context.register_collection(&self.collection);
            info!("created collection {}", self.collection);
        }

        if !self.metadata.indexes_ensured() {
            self.ensure_indexes().await?;
        }

        Ok(())
    }

    /// Creates every declared index.
    ///
    /// Returns `false` when an index failed and the context is configured not to
    /// throw on index errors.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::Index`] on the first failure when
    /// `throw_on_index_error` is set.
    pub async fn ensure_indexes(&self) -> DocumentStoreResult<bool> {
        let mut all_created = true;

        for index in self.metadata.indexes() {
            let mut index = index.clone();
            index.keys = self.fields().apply_to_keys(&index.keys);
            let name = index.index_name();

            match self.context.backend().create_index(&self.collection, index).await {
                Ok(created) => debug!("index {created} ensured on {}", self.collection),
                Err(e) => {
                    error!("failed to create index {name} on {}: {e}", self.collection);
                    if self.context.config().throw_on_index_error {
                        return Err(DocumentStoreError::Index(format!(
                            "index {name} on {}: {e}",
                            self.collection
                        )));
                    }
                    all_created = false;
                }
            }
        }

        if all_created {
            self.metadata.mark_indexes_ensured();
        }

        Ok(all_created)
    }

    fn find_options<P>(&self, query: &Query<D, P>) -> FindOptions {
        FindOptions {
            projection: query.projection().cloned(),
            sort: (!query.sorts().is_empty()).then(|| Sort::to_document(query.sorts())),
            skip: query.skip_count(),
            limit: query.limit_count(),
            batch_size: Some(self.context.config().batch_size),
        }
    }

    fn map_find_options(&self, mut options: FindOptions) -> FindOptions {
        options.sort = options.sort.map(|sort| self.fields().apply_to_keys(&sort));
        options.projection = options
            .projection
            .map(|projection| self.fields().apply_to_keys(&projection));
        options
    }

    fn map_update(&self, update: UpdateDefinition) -> UpdateDefinition {
        match update {
            UpdateDefinition::Operators(operators) => UpdateDefinition::Operators(self.fields().apply_to_update(&operators)),
            UpdateDefinition::Replacement(document) => UpdateDefinition::Replacement(self.fields().apply_to_document(document)),
            pipeline => pipeline,
        }
    }

    /// Restores logical names, runs the after hook and deserializes.
    fn decode<P: DeserializeOwned>(&self, ctx: &HookContext<'_>, document: BsonDocument) -> DocumentStoreResult<P> {
        let mut document = self.fields().restore_document(document);
        self.context
            .interceptor()
            .after_result(ctx, ResultMut::Document(&mut document))?;
        from_bson_document(document)
    }

    async fn drain<P: DeserializeOwned + Send>(
        &self,
        mut cursor: Box<dyn StoreCursor>,
        operation: Operation,
    ) -> DocumentStoreResult<Vec<P>> {
        let ctx = self.hook(operation);
        let mut items = Vec::new();

        while let Some(batch) = cursor.next_batch().await? {
            for document in batch {
                self.check_cancelled()?;
                items.push(self.decode(&ctx, document)?);
            }
        }

        Ok(items)
    }

    async fn open_find<P>(&self, query: &Query<D, P>, limit: Option<i64>) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        self.check_cancelled()?;

        let ctx = self.hook(Operation::Find);
        let mut filter = query.to_filter()?;
        let mut options = self.find_options(query);
        if limit.is_some() {
            options.limit = limit;
        }

        self.context
            .interceptor()
            .before_find(&ctx, &mut filter, &mut options)?;

        let filter = self.fields().apply_to_filter(&filter);
        let options = self.map_find_options(options);
        let session = self.session(self.force_transaction).await?;

        debug!("find on {}: {filter}", self.collection);
        self.context
            .backend()
            .find(&self.collection, filter, options, session.as_ref())
            .await
    }

    async fn first_or_single<P>(&self, query: Query<D, P>, cardinality: Cardinality) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        let mut cursor = self
            .open_find(&query, Some(cardinality.probe_limit()))
            .await?;
        let ctx = self.hook(Operation::Find);
        let mut found = None;

        while let Some(batch) = cursor.next_batch().await? {
            for document in batch {
                if found.is_some() {
                    return Err(DocumentStoreError::MoreThanOneResult(self.collection.clone()));
                }

                self.check_cancelled()?;
                found = Some(self.decode(&ctx, document)?);

                if cardinality == Cardinality::First {
                    return Ok(found);
                }
            }
        }

        Ok(found)
    }

    /// Reads the document with the given identity.
    pub async fn get(&self, id: impl Into<Bson>) -> DocumentStoreResult<Option<D>> {
        let id: Bson = id.into();
        self.first_or_single(Query::<D>::filter(doc! { ID_FIELD: id }), Cardinality::First)
            .await
    }

    /// Reads every document matching the query.
    pub async fn get_many<P>(&self, query: Query<D, P>) -> DocumentStoreResult<Vec<P>>
    where
        P: DeserializeOwned + Send,
    {
        let cursor = self.open_find(&query, None).await?;
        self.drain(cursor, Operation::Find).await
    }

    /// Reads the first match, or `None`.
    pub async fn first_or_default<P>(&self, query: Query<D, P>) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        self.first_or_single(query, Cardinality::First).await
    }

    /// Reads the first match.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::DocumentNotFound`] when nothing matches.
    pub async fn get_one<P>(&self, query: Query<D, P>) -> DocumentStoreResult<P>
    where
        P: DeserializeOwned + Send,
    {
        let filter = query.to_filter()?;

        self.first_or_single(query, Cardinality::First)
            .await?
            .ok_or_else(|| DocumentStoreError::DocumentNotFound(filter.to_string(), self.collection.clone()))
    }

    /// Reads the only match, or `None` when nothing matches.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::MoreThanOneResult`] as soon as a second match is seen.
    pub async fn get_single<P>(&self, query: Query<D, P>) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        self.first_or_single(query, Cardinality::Single).await
    }

    /// Counts the documents matching the query.
    pub async fn count(&self, query: Query<D>) -> DocumentStoreResult<u64> {
        self.check_cancelled()?;

        let ctx = self.hook(Operation::Count);
        let mut filter = query.to_filter()?;
        let mut options = self.find_options(&query);

        self.context
            .interceptor()
            .before_find(&ctx, &mut filter, &mut options)?;

        let filter = self.fields().apply_to_filter(&filter);
        let options = CountOptions {
            skip: options.skip,
            limit: options
                .limit
                .filter(|limit| *limit != 0)
                .map(i64::unsigned_abs),
        };
        let session = self.session(self.force_transaction).await?;

        debug!("count on {}: {filter}", self.collection);
        let mut count = self
            .context
            .backend()
            .count(&self.collection, filter, options, session.as_ref())
            .await?;

        self.context
            .interceptor()
            .after_result(&ctx, ResultMut::Count(&mut count))?;

        Ok(count)
    }

    fn prepare_model(&self, model: WriteModel) -> DocumentStoreResult<WriteModel> {
        let interceptor = self.context.interceptor();

        Ok(match model {
            WriteModel::InsertOne { document } => {
                let document = interceptor
                    .before_insert(&self.hook(Operation::Insert), document)?
                    .ok_or_else(|| DocumentStoreError::NoDocument(self.collection.clone()))?;

                WriteModel::InsertOne { document: self.fields().apply_to_document(document) }
            }
            WriteModel::UpdateOne { mut filter, mut update, mut options } => {
                interceptor.before_update(&self.hook(Operation::Update), &mut filter, &mut update, &mut options)?;

                WriteModel::UpdateOne {
                    filter: self.fields().apply_to_filter(&filter),
                    update: self.map_update(update),
                    options,
                }
            }
            WriteModel::UpdateMany { mut filter, mut update, mut options } => {
                interceptor.before_update(&self.hook(Operation::Update), &mut filter, &mut update, &mut options)?;

                WriteModel::UpdateMany {
                    filter: self.fields().apply_to_filter(&filter),
                    update: self.map_update(update),
                    options,
                }
            }
            WriteModel::ReplaceOne { mut filter, replacement, upsert } => {
                let mut update = UpdateDefinition::Replacement(replacement);
                let mut options = UpdateOptions { upsert, array_filters: None };

                interceptor.before_update(&self.hook(Operation::Replace), &mut filter, &mut update, &mut options)?;

                let UpdateDefinition::Replacement(replacement) = update else {
                    return Err(DocumentStoreError::InvalidDocument(format!(
                        "replacement for {} was rewritten into a non-replacement update",
                        self.collection
                    )));
                };

                WriteModel::ReplaceOne {
                    filter: self.fields().apply_to_filter(&filter),
                    replacement: self.fields().apply_to_document(replacement),
                    upsert: options.upsert,
                }
            }
            WriteModel::DeleteOne { mut filter } => {
                interceptor.before_find(&self.hook(Operation::Delete), &mut filter, &mut FindOptions::default())?;

                WriteModel::DeleteOne { filter: self.fields().apply_to_filter(&filter) }
            }
            WriteModel::DeleteMany { mut filter } => {
                interceptor.before_find(&self.hook(Operation::Delete), &mut filter, &mut FindOptions::default())?;

                WriteModel::DeleteMany { filter: self.fields().apply_to_filter(&filter) }
            }
        })
    }

    async fn write(
        &self,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        force_transaction: Option<bool>,
        operation: Operation,
    ) -> DocumentStoreResult<WriteOutcome> {
        self.check_cancelled()?;

        let models = models
            .into_iter()
            .map(|model| self.prepare_model(model))
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        if models.is_empty() {
            return Ok(WriteOutcome::Acknowledged(0));
        }

        let session = self.session(force_transaction).await?;

        debug!("bulk write of {} models on {}", models.len(), self.collection);
        let mut result = self
            .context
            .backend()
            .bulk_write(&self.collection, models, options, session.as_ref())
            .await?;

        self.context
            .interceptor()
            .after_result(&self.hook(operation), ResultMut::Write(&mut result))?;

        Ok(WriteOutcome::from(&result))
    }

    /// Executes write models in one request.
    ///
    /// Every model passes through the matching before hook. The outcome counts
    /// `deleted + modified + matched + inserted`, or is
    /// [`WriteOutcome::Unacknowledged`].
    pub async fn bulk_write(&self, models: Vec<WriteModel>, options: BulkWriteOptions) -> DocumentStoreResult<WriteOutcome> {
        self.write(models, options, self.force_transaction, Operation::BulkWrite)
            .await
    }

    /// Inserts a document. A document without identity is skipped and counts 0.
    pub async fn insert(&self, document: &D) -> DocumentStoreResult<WriteOutcome> {
        self.insert_many(std::slice::from_ref(document)).await
    }

    /// Inserts documents, skipping those without identity.
    pub async fn insert_many(&self, documents: &[D]) -> DocumentStoreResult<WriteOutcome> {
        self.check_cancelled()?;

        let mut models = Vec::with_capacity(documents.len());
        for document in documents {
            if document.id().is_none() {
                warn!("skipping insert into {}: document has no identity", self.collection);
                continue;
            }
            models.push(WriteModel::InsertOne { document: document.to_document()? });
        }

        self.write(models, BulkWriteOptions::default(), self.force_transaction, Operation::Insert)
            .await
    }

    /// Replaces the stored document that has the same identity.
    pub async fn replace(&self, document: &D, upsert: bool) -> DocumentStoreResult<WriteOutcome> {
        let Some(id) = document.id_bson() else {
            warn!("skipping replace in {}: document has no identity", self.collection);
            return Ok(WriteOutcome::Acknowledged(0));
        };

        let model = WriteModel::ReplaceOne {
            filter: doc! { ID_FIELD: id },
            replacement: document.to_document()?,
            upsert,
        };

        self.write(vec![model], BulkWriteOptions::default(), self.force_transaction, Operation::Replace)
            .await
    }

    fn attached_update<P>(&self, query: &Query<D, P>) -> DocumentStoreResult<UpdateDefinition> {
        query
            .update()
            .ok_or_else(|| DocumentStoreError::InvalidQuery(format!("update on {} has no attached update", self.collection)))?
            .render()
    }

    /// Applies the query's attached update to the first match.
    pub async fn update_one(&self, query: Query<D>, options: UpdateOptions) -> DocumentStoreResult<WriteOutcome> {
        let model = WriteModel::UpdateOne {
            filter: query.to_filter()?,
            update: self.attached_update(&query)?,
            options,
        };

        self.write(vec![model], BulkWriteOptions::default(), self.force_transaction, Operation::Update)
            .await
    }

    /// Applies the query's attached update to every match.
    pub async fn update_many(&self, query: Query<D>, options: UpdateOptions) -> DocumentStoreResult<WriteOutcome> {
        let model = WriteModel::UpdateMany {
            filter: query.to_filter()?,
            update: self.attached_update(&query)?,
            options,
        };

        self.write(vec![model], BulkWriteOptions::default(), self.force_transaction, Operation::Update)
            .await
    }

    async fn find_and_update<P>(
        &self,
        query: Query<D, P>,
        mut options: FindOneAndUpdateOptions,
        cardinality: Cardinality,
    ) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        self.check_cancelled()?;

        let ctx = self.hook(Operation::FindOneAndUpdate);
        let mut filter = query.to_filter()?;
        let mut update = self.attached_update(&query)?;
        let mut update_options = UpdateOptions {
            upsert: options.upsert,
            array_filters: options.array_filters.take(),
        };

        self.context
            .interceptor()
            .before_update(&ctx, &mut filter, &mut update, &mut update_options)?;

        options.upsert = update_options.upsert;
        options.array_filters = update_options.array_filters;
        if options.sort.is_none() && !query.sorts().is_empty() {
            options.sort = Some(Sort::to_document(query.sorts()));
        }
        if options.projection.is_none() {
            options.projection = query.projection().cloned();
        }
        options.sort = options.sort.map(|sort| self.fields().apply_to_keys(&sort));
        options.projection = options
            .projection
            .map(|projection| self.fields().apply_to_keys(&projection));

        let filter = self.fields().apply_to_filter(&filter);
        let update = self.map_update(update);
        let session = self.session(self.force_transaction).await?;
        let backend = self.context.backend();

        // The update is pinned to the identity the cardinality check saw. A
        // concurrent writer can make it miss, but never retarget it.
        let filter = if cardinality == Cardinality::Single {
            let probe = FindOptions {
                projection: Some(doc! { ID_FIELD: 1 }),
                limit: Some(cardinality.probe_limit()),
                ..Default::default()
            };
            let mut cursor = backend
                .find(&self.collection, filter.clone(), probe, session.as_ref())
                .await?;
            let mut seen = Vec::new();

            while let Some(batch) = cursor.next_batch().await? {
                seen.extend(batch.into_iter().filter_map(|document| document.get(ID_FIELD).cloned()));
                if seen.len() > 1 {
                    return Err(DocumentStoreError::MoreThanOneResult(self.collection.clone()));
                }
            }

            match seen.pop() {
                Some(id) => doc! { "$and": [filter, { ID_FIELD: id }] },
                None => filter,
            }
        } else {
            filter
        };

        debug!("find_one_and_update on {}: {filter} with {update}", self.collection);
        backend
            .find_one_and_update(&self.collection, filter, update, options, session.as_ref())
            .await?
            .map(|document| self.decode(&ctx, document))
            .transpose()
    }

    /// Atomically applies the query's attached update to the first match and returns it.
    pub async fn find_one_and_update<P>(
        &self,
        query: Query<D, P>,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        self.find_and_update(query, options, Cardinality::First)
            .await
    }

    /// Like [`Repository::find_one_and_update`], but fails without writing when
    /// more than one document matches.
    ///
    /// The cardinality check and the update are two requests in the same
    /// session. Outside a transaction a concurrent write between them can make
    /// the update miss, in which case `None` is returned.
    pub async fn find_single_and_update<P>(
        &self,
        query: Query<D, P>,
        options: FindOneAndUpdateOptions,
    ) -> DocumentStoreResult<Option<P>>
    where
        P: DeserializeOwned + Send,
    {
        self.find_and_update(query, options, Cardinality::Single)
            .await
    }

    /// Deletes the stored document that has the same identity.
    pub async fn delete(&self, document: &D) -> DocumentStoreResult<WriteOutcome> {
        match document.id_bson() {
            Some(id) => self.delete_by_id(id).await,
            None => {
                warn!("skipping delete in {}: document has no identity", self.collection);
                Ok(WriteOutcome::Acknowledged(0))
            }
        }
    }

    /// Deletes the document with the given identity.
    pub async fn delete_by_id(&self, id: impl Into<Bson>) -> DocumentStoreResult<WriteOutcome> {
        let id: Bson = id.into();
        let model = WriteModel::DeleteOne { filter: doc! { ID_FIELD: id } };

        self.write(vec![model], BulkWriteOptions::default(), self.force_transaction, Operation::Delete)
            .await
    }

    /// Deletes every document matching the query.
    pub async fn delete_many(&self, query: Query<D>) -> DocumentStoreResult<WriteOutcome> {
        let model = WriteModel::DeleteMany { filter: query.to_filter()? };

        self.write(vec![model], BulkWriteOptions::default(), self.force_transaction, Operation::Delete)
            .await
    }

    /// Builds the aggregation for a query in logical field names.
    fn aggregation_pipeline<P>(&self, query: &Query<D, P>) -> DocumentStoreResult<Vec<BsonDocument>> {
        let filter = query.to_filter()?;
        let mut pipeline = Vec::new();

        if !filter.is_empty() {
            pipeline.push(doc! { "$match": filter });
        }
        pipeline.extend(query.pipeline().unwrap_or_default().iter().cloned());
        if !query.sorts().is_empty() {
            pipeline.push(doc! { "$sort": Sort::to_document(query.sorts()) });
        }
        if let Some(skip) = query.skip_count() {
            pipeline.push(doc! { "$skip": to_i64("skip", skip)? });
        }
        if let Some(limit) = query.limit_count() {
            pipeline.push(doc! { "$limit": limit });
        }
        if let Some(projection) = query.projection() {
            pipeline.push(doc! { "$project": projection.clone() });
        }

        Ok(pipeline)
    }

    async fn open_aggregate(&self, mut pipeline: Vec<BsonDocument>) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        self.check_cancelled()?;

        let ctx = self.hook(Operation::Aggregate);
        let mut options = AggregateOptions {
            batch_size: Some(self.context.config().batch_size),
            ..Default::default()
        };

        self.context
            .interceptor()
            .before_aggregate(&ctx, &mut pipeline, &mut options)?;

        let pipeline = self.fields().apply_to_pipeline(pipeline);
        let session = self.session(self.force_transaction).await?;

        debug!("aggregate on {} with {} stages", self.collection, pipeline.len());
        self.context
            .backend()
            .aggregate(&self.collection, pipeline, options, session.as_ref())
            .await
    }

    /// Runs the query as an aggregation.
    ///
    /// The pipeline is the query filter as `$match`, the attached stages, then
    /// sort, skip, limit and projection.
    pub async fn aggregate<P>(&self, query: Query<D, P>) -> DocumentStoreResult<Vec<P>>
    where
        P: DeserializeOwned + Send,
    {
        let pipeline = self.aggregation_pipeline(&query)?;
        let cursor = self.open_aggregate(pipeline).await?;

        self.drain(cursor, Operation::Aggregate).await
    }

    /// Runs the query as an aggregation and yields results lazily.
    ///
    /// Cancellation is checked and the after hook runs once per element.
    pub async fn aggregate_stream<P>(
        &self,
        query: Query<D, P>,
    ) -> DocumentStoreResult<BoxStream<'_, DocumentStoreResult<P>>>
    where
        P: DeserializeOwned + Send + 'static,
    {
        let pipeline = self.aggregation_pipeline(&query)?;
        let cursor = self.open_aggregate(pipeline).await?;
        let ctx = self.hook(Operation::Aggregate);
        let state = StreamState { cursor, buffered: VecDeque::new() };

        Ok(stream::try_unfold(state, move |state| self.next_streamed::<P>(ctx, state)).boxed())
    }

    async fn next_streamed<P: DeserializeOwned>(
        &self,
        ctx: HookContext<'_>,
        mut state: StreamState,
    ) -> DocumentStoreResult<Option<(P, StreamState)>> {
        loop {
            if let Some(document) = state.buffered.pop_front() {
                self.check_cancelled()?;
                let item = self.decode(&ctx, document)?;
                return Ok(Some((item, state)));
            }

            match state.cursor.next_batch().await? {
                Some(batch) => state.buffered.extend(batch),
                None => return Ok(None),
            }
        }
    }

    /// Reads one page and the total row count in a single aggregation.
    ///
    /// The request is `[$match?, $facet { result: stages + $skip + $limit,
    /// total: stages + $count }]`.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::InvalidArgument`] when `limit` is zero (before any
    /// request), [`DocumentStoreError::UnexpectedResult`] when the store does not
    /// return exactly one facet document.
    pub async fn aggregate_facet<P>(&self, query: Query<D, P>, skip: u64, limit: u64) -> DocumentStoreResult<PagedResult<P>>
    where
        P: DeserializeOwned + Send,
    {
        if limit == 0 {
            return Err(DocumentStoreError::invalid_argument("limit", "must be greater than zero"));
        }

        let filter = query.to_filter()?;
        let mut stages: Vec<BsonDocument> = query.pipeline().unwrap_or_default().to_vec();
        if !query.sorts().is_empty() {
            stages.push(doc! { "$sort": Sort::to_document(query.sorts()) });
        }

        let mut result = stages.clone();
        result.push(doc! { "$skip": to_i64("skip", skip)? });
        result.push(doc! { "$limit": to_i64("limit", limit)? });
        if let Some(projection) = query.projection() {
            result.push(doc! { "$project": projection.clone() });
        }

        let mut total = stages;
        total.push(doc! { "$count": "count" });

        let mut pipeline = Vec::with_capacity(2);
        if !filter.is_empty() {
            pipeline.push(doc! { "$match": filter });
        }
        pipeline.push(doc! { "$facet": { "result": result, "total": total } });

        let mut cursor = self.open_aggregate(pipeline).await?;
        let mut facets = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            facets.extend(batch);
        }

        let facet = match <[BsonDocument; 1]>::try_from(facets) {
            Ok([facet]) => facet,
            Err(facets) => {
                return Err(DocumentStoreError::UnexpectedResult(format!(
                    "facet aggregation on {} returned {} documents, expected exactly one",
                    self.collection,
                    facets.len()
                )));
            }
        };

        let ctx = self.hook(Operation::Aggregate);
        let items = facet_branch(&facet, "result")?
            .into_iter()
            .map(|document| {
                self.check_cancelled()?;
                self.decode(&ctx, document)
            })
            .collect::<DocumentStoreResult<Vec<P>>>()?;

        let mut row_count = facet_branch(&facet, "total")?
            .first()
            .and_then(|total| match total.get("count") {
                Some(Bson::Int32(count)) => u64::try_from(*count).ok(),
                Some(Bson::Int64(count)) => u64::try_from(*count).ok(),
                _ => None,
            })
            .unwrap_or(0);

        self.context
            .interceptor()
            .after_result(&ctx, ResultMut::Count(&mut row_count))?;

        PagedResult::new(items, skip / limit + 1, limit, row_count)
    }

    /// Reads the requested page. Page 0 is read as page 1.
    pub async fn paginate<P>(&self, query: Query<D, P>, request: PageRequest) -> DocumentStoreResult<PagedResult<P>>
    where
        P: DeserializeOwned + Send,
    {
        request.validate()?;

        self.aggregate_facet(query, request.skip(), request.page_size)
            .await
    }

    /// Commits the dedicated transaction and replaces its session with a fresh one.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NoActiveTransaction`] when no dedicated transaction
    /// is open.
    pub async fn commit_transaction(&self) -> DocumentStoreResult<()> {
        self.dedicated
            .commit(self.context.backend(), AfterTransaction::Replace)
            .await
    }

    /// Aborts the dedicated transaction and replaces its session with a fresh one.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NoActiveTransaction`] when no dedicated transaction
    /// is open.
    pub async fn abort_transaction(&self) -> DocumentStoreResult<()> {
        self.dedicated
            .abort(self.context.backend(), AfterTransaction::Replace)
            .await
    }

    /// Aborts an open dedicated transaction and ends the dedicated session.
    pub async fn close(&self) -> DocumentStoreResult<()> {
        self.dedicated.close(self.context.backend()).await
    }
}

impl<D, B, I> fmt::Debug for Repository<D, B, I>
where
    D: Document,
    B: StoreBackend,
    I: Interceptor,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("collection", &self.collection)
            .field("force_transaction", &self.force_transaction)
            .finish_non_exhaustive()
    }
}

fn to_i64(argument: &str, value: u64) -> DocumentStoreResult<i64> {
    i64::try_from(value).map_err(|_| DocumentStoreError::invalid_argument(argument, format!("{value} is out of range")))
}

fn facet_branch(facet: &BsonDocument, branch: &str) -> DocumentStoreResult<Vec<BsonDocument>> {
    match facet.get(branch) {
        None => Ok(Vec::new()),
        Some(Bson::Array(values)) => values
            .iter()
            .map(|value| match value {
                Bson::Document(document) => Ok(document.clone()),
                other => Err(DocumentStoreError::UnexpectedResult(format!(
                    "facet branch {branch} holds a non-document value {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(DocumentStoreError::UnexpectedResult(format!(
            "facet branch {branch} is not an array: {other}"
        ))),
    }
}

/// Builder for [`Repository`].
pub struct RepositoryBuilder<D, B, I>
where
    D: Document,
    B: StoreBackend,
    I: Interceptor,
{
    context: Context<B, I>,
    collection: Option<String>,
    create_options: CreateCollectionOptions,
    force_transaction: Option<bool>,
    cancellation: Option<CancellationToken>,
    _marker: PhantomData<fn() -> D>,
}

impl<D, B, I> RepositoryBuilder<D, B, I>
where
    D: Document,
    B: StoreBackend,
    I: Interceptor,
{
    /// Starts a builder for repositories of `D` in `context`.
    pub fn new(context: Context<B, I>) -> Self {
        Self {
            context,
            collection: None,
            create_options: CreateCollectionOptions::default(),
            force_transaction: None,
            cancellation: None,
            _marker: PhantomData,
        }
    }

    /// Overrides the collection name declared by the document type.
    pub fn with_collection_name(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Options used if the collection has to be created.
    pub fn with_create_options(mut self, options: CreateCollectionOptions) -> Self {
        self.create_options = options;
        self
    }

    /// `Some(true)` runs every operation in a dedicated transaction. Anything
    /// else joins the context's ambient transaction when that is enabled.
    pub fn with_force_transaction(mut self, force_transaction: Option<bool>) -> Self {
        self.force_transaction = force_transaction;
        self
    }

    /// Attaches a token observed by every operation of the built repository.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Builds the repository, creating the collection and its indexes when needed.
    pub async fn build(self) -> DocumentStoreResult<Repository<D, B, I>> {
        let collection = self
            .collection
            .unwrap_or_else(|| D::collection_name().to_string());
        let context = self.context;

        let metadata = MetadataRegistry::global().get_or_build(context.metadata_key(), &collection, || {
            let mut fields = FieldMapping::new();
            context.interceptor().map_fields(&collection, &mut fields);

            let mut indexes = context.config().indexes.default_indexes();
            context.interceptor().build_indexes(&collection, &mut indexes);

            CollectionMetadata::new(collection.as_str(), indexes, fields)
        });

        let repository = Repository {
            context,
            collection,
            metadata,
            dedicated: Arc::new(SessionSlot::new("dedicated")),
            force_transaction: self.force_transaction,
            cancellation: self.cancellation.into_iter().collect(),
            _marker: PhantomData,
        };

        repository.provision(self.create_options).await?;

        Ok(repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_outcome_sums_every_counter() {
        let result = BulkWriteResult {
            acknowledged: true,
            inserted: 3,
            matched: 1,
            modified: 1,
            deleted: 2,
            ..Default::default()
        };

        assert_eq!(WriteOutcome::from(&result).count(), 7);
        assert_eq!(
            WriteOutcome::from(&BulkWriteResult { acknowledged: false, inserted: 3, ..Default::default() }).count(),
            -1
        );
    }

    #[test]
    fn facet_branches_must_hold_documents() {
        let facet = doc! { "result": [{ "a": 1 }, { "a": 2 }], "total": [{ "count": 2 }], "bad": 3, "mixed": [1] };

        assert_eq!(facet_branch(&facet, "result").unwrap().len(), 2);
        assert!(facet_branch(&facet, "missing").unwrap().is_empty());
        assert!(matches!(facet_branch(&facet, "bad"), Err(DocumentStoreError::UnexpectedResult(_))));
        assert!(matches!(facet_branch(&facet, "mixed"), Err(DocumentStoreError::UnexpectedResult(_))));
    }

    #[test]
    fn out_of_range_skips_are_rejected() {
        assert_eq!(to_i64("skip", 40).unwrap(), 40);
        assert!(matches!(
            to_i64("skip", u64::MAX),
            Err(DocumentStoreError::InvalidArgument { argument, .. }) if argument == "skip"
        ));
    }
}

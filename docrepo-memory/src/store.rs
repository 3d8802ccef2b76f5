//! In-memory storage implementation for document stores.
//!
//! Collections are vectors of BSON documents kept in insertion order behind
//! async-aware read-write locks. Sessions can run snapshot transactions: a
//! transaction works on a private copy of the collections and, on commit, writes
//! every collection it touched back over the shared state.

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use log::{debug, trace};
use mea::{mutex::Mutex, rwlock::RwLock};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use uuid::Uuid;

use docrepo_core::{
    backend::{
        AggregateOptions, BatchCursor, BulkWriteOptions, BulkWriteResult, CountOptions, CreateCollectionOptions,
        FindOneAndUpdateOptions, FindOptions, IndexModel, ReturnDocument, SessionId, StoreBackend,
        StoreBackendBuilder, StoreCursor, UpdateOptions, WriteModel,
    },
    document::ID_FIELD,
    error::{DocumentStoreError, DocumentStoreResult},
    update::UpdateDefinition,
};

use crate::{
    aggregate,
    evaluator::{DocumentEvaluator, compare_by, values_equal},
    path, update,
};

const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl Collection {
    fn matching(&self, filter: &Document) -> DocumentStoreResult<Vec<usize>> {
        let mut positions = Vec::new();

        for (position, document) in self.documents.iter().enumerate() {
            if DocumentEvaluator::new(document).matches(filter)? {
                positions.push(position);
            }
        }

        Ok(positions)
    }

    /// Rejects `candidate` when it collides with another document on `_id` or
    /// on a unique index. `replacing` is the position the candidate replaces.
    fn check_unique(&self, name: &str, candidate: &Document, replacing: Option<usize>) -> DocumentStoreResult<()> {
        let others = || {
            self.documents
                .iter()
                .enumerate()
                .filter(move |(position, _)| Some(*position) != replacing)
                .map(|(_, document)| document)
        };

        if let Some(id) = candidate.get(ID_FIELD) {
            if others().any(|document| document.get(ID_FIELD).is_some_and(|other| values_equal(other, id))) {
                return Err(DocumentStoreError::DocumentAlreadyExists(id.to_string(), name.to_string()));
            }
        }

        for index in self.indexes.iter().filter(|index| index.unique) {
            let Some(key) = index_key(index, candidate) else { continue };

            let collides = others().any(|document| {
                index_key(index, document).is_some_and(|other| {
                    other
                        .iter()
                        .zip(&key)
                        .all(|(a, b)| values_equal(a, b))
                })
            });
            if collides {
                return Err(DocumentStoreError::Backend(format!(
                    "duplicate key error collection: {name} index: {} dup key: {:?}",
                    index.index_name(),
                    key
                )));
            }
        }

        Ok(())
    }

    fn insert(&mut self, name: &str, mut document: Document) -> DocumentStoreResult<()> {
        if !document.contains_key(ID_FIELD) {
            let mut with_id = Document::new();
            with_id.insert(ID_FIELD, ObjectId::new());
            with_id.extend(document);
            document = with_id;
        }

        self.check_unique(name, &document, None)?;
        self.documents.push(document);
        Ok(())
    }

    fn replace_at(&mut self, name: &str, position: usize, document: Document) -> DocumentStoreResult<bool> {
        if self.documents[position] == document {
            return Ok(false);
        }

        self.check_unique(name, &document, Some(position))?;
        self.documents[position] = document;
        Ok(true)
    }

    fn upsert(&mut self, name: &str, filter: &Document, update: &UpdateDefinition) -> DocumentStoreResult<Document> {
        let seed = update::seed_from_filter(filter)?;
        let mut document = update::apply(&seed, update, true)?;

        if !document.contains_key(ID_FIELD) {
            if let Some(id) = seed.get(ID_FIELD) {
                document.insert(ID_FIELD, id.clone());
            }
        }

        self.insert(name, document)?;
        self.documents
            .last()
            .cloned()
            .ok_or_else(|| DocumentStoreError::Unknown("upserted document vanished".to_string()))
    }
}

/// Values of the indexed fields, or `None` when a sparse index skips the document.
fn index_key(index: &IndexModel, document: &Document) -> Option<Vec<Bson>> {
    let values: Vec<Option<&Bson>> = index
        .keys
        .keys()
        .map(|field| path::get(document, field))
        .collect();

    if index.sparse && values.iter().all(Option::is_none) {
        return None;
    }

    Some(
        values
            .into_iter()
            .map(|value| value.cloned().unwrap_or(Bson::Null))
            .collect(),
    )
}

type Collections = HashMap<String, Collection>;

#[derive(Debug)]
struct Transaction {
    collections: Collections,
    touched: HashSet<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    transaction: Option<Transaction>,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    transactions_started: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

/// Snapshot of the session and transaction counters of an [`InMemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub transactions_started: u64,
    pub commits: u64,
    pub aborts: u64,
}

/// Thread-safe in-memory document storage backend.
///
/// `InMemoryStore` is cloneable and uses `Arc`-wrapped internal state; clones
/// share collections and sessions.
///
/// Filters, updates and pipelines are evaluated in-process. Positional update
/// paths and stages beyond the ones listed in [`aggregate`](crate::aggregate)
/// are rejected with [`DocumentStoreError::Backend`].
///
/// # Example
///
/// ```ignore
/// use docrepo_memory::InMemoryStore;
/// use docrepo::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .with_database_name("test")
///     .with_acknowledged_writes(false)
///     .build()
///     .await?;
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    database: String,
    fingerprint: u64,
    acknowledged: bool,
    batch_size: u32,
    collections: Arc<RwLock<Collections>>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionState>>>,
    counters: Arc<Counters>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store with default settings.
    pub fn new() -> Self {
        InMemoryStoreBuilder::default().into_store()
    }

    /// Creates a builder for constructing an `InMemoryStore` with custom options.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Session and transaction counters.
    pub fn stats(&self) -> StoreStats {
        let counters = &self.counters;

        StoreStats {
            sessions_started: counters.sessions_started.load(Ordering::Relaxed),
            sessions_ended: counters.sessions_ended.load(Ordering::Relaxed),
            transactions_started: counters.transactions_started.load(Ordering::Relaxed),
            commits: counters.commits.load(Ordering::Relaxed),
            aborts: counters.aborts.load(Ordering::Relaxed),
        }
    }

    /// Number of sessions currently open.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// A copy of every committed document in `collection`, in insertion order.
    pub async fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|collection| collection.documents.clone())
            .unwrap_or_default()
    }

    async fn read<R, F>(&self, session: Option<&SessionId>, f: F) -> DocumentStoreResult<R>
    where
        F: FnOnce(&Collections) -> DocumentStoreResult<R>,
    {
        if let Some(id) = session {
            let sessions = self.sessions.lock().await;
            let state = sessions.get(id).ok_or_else(|| unknown_session(id))?;

            if let Some(transaction) = &state.transaction {
                return f(&transaction.collections);
            }
        }

        let collections = self.collections.read().await;
        f(&collections)
    }

    async fn write<R, F>(&self, collection: &str, session: Option<&SessionId>, f: F) -> DocumentStoreResult<R>
    where
        F: FnOnce(&mut Collection) -> DocumentStoreResult<R>,
    {
        if let Some(id) = session {
            let mut sessions = self.sessions.lock().await;
            let state = sessions.get_mut(id).ok_or_else(|| unknown_session(id))?;

            if let Some(transaction) = &mut state.transaction {
                transaction.touched.insert(collection.to_string());
                return f(transaction
                    .collections
                    .entry(collection.to_string())
                    .or_default());
            }
        }

        let mut collections = self.collections.write().await;
        f(collections.entry(collection.to_string()).or_default())
    }
}

fn unknown_session(id: &SessionId) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("unknown session {id}"))
}

fn no_transaction(id: &SessionId) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("no transaction in progress on session {id}"))
}

fn read_documents(collections: &Collections, collection: &str, filter: &Document) -> DocumentStoreResult<Vec<Document>> {
    match collections.get(collection) {
        Some(collection) => DocumentEvaluator::filter_documents(collection.documents.iter(), filter),
        None => Ok(Vec::new()),
    }
}

fn batch_size(requested: Option<u32>, default: u32) -> usize {
    usize::try_from(requested.unwrap_or(default)).unwrap_or(usize::MAX)
}

fn execute(
    collection: &mut Collection,
    name: &str,
    model: WriteModel,
    result: &mut BulkWriteResult,
) -> DocumentStoreResult<()> {
    match model {
        WriteModel::InsertOne { document } => {
            collection.insert(name, document)?;
            result.inserted += 1;
        }
        WriteModel::UpdateOne { filter, update, options } => {
            apply_update(collection, name, &filter, &update, &options, false, result)?;
        }
        WriteModel::UpdateMany { filter, update, options } => {
            apply_update(collection, name, &filter, &update, &options, true, result)?;
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            let options = UpdateOptions { upsert, array_filters: None };
            let update = UpdateDefinition::Replacement(replacement);
            apply_update(collection, name, &filter, &update, &options, false, result)?;
        }
        WriteModel::DeleteOne { filter } => {
            if let Some(position) = collection.matching(&filter)?.first() {
                collection.documents.remove(*position);
                result.deleted += 1;
            }
        }
        WriteModel::DeleteMany { filter } => {
            let positions: HashSet<usize> = collection.matching(&filter)?.into_iter().collect();
            let mut position = 0;
            collection.documents.retain(|_| {
                let keep = !positions.contains(&position);
                position += 1;
                keep
            });
            result.deleted += positions.len() as u64;
        }
    }

    Ok(())
}

fn apply_update(
    collection: &mut Collection,
    name: &str,
    filter: &Document,
    update: &UpdateDefinition,
    options: &UpdateOptions,
    many: bool,
    result: &mut BulkWriteResult,
) -> DocumentStoreResult<()> {
    if options.array_filters.is_some() {
        return Err(DocumentStoreError::Backend(
            "array filters are not supported by the in-memory store".to_string(),
        ));
    }

    let mut positions = collection.matching(filter)?;
    if !many {
        positions.truncate(1);
    }

    if positions.is_empty() {
        if options.upsert {
            collection.upsert(name, filter, update)?;
            result.upserted += 1;
        }
        return Ok(());
    }

    for position in positions {
        let updated = update::apply(&collection.documents[position], update, false)?;
        result.matched += 1;
        if collection.replace_at(name, position, updated)? {
            result.modified += 1;
        }
    }

    Ok(())
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn connection_fingerprint(&self) -> u64 {
        self.fingerprint
    }

    async fn start_session(&self) -> DocumentStoreResult<SessionId> {
        let id = SessionId::new();

        self.sessions
            .lock()
            .await
            .insert(id.clone(), SessionState::default());
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);
        trace!("in-memory session {id} started");

        Ok(id)
    }

    async fn start_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;

        if state.transaction.is_none() {
            let snapshot = self.collections.read().await.clone();
            state.transaction = Some(Transaction { collections: snapshot, touched: HashSet::new() });
            self.counters.transactions_started.fetch_add(1, Ordering::Relaxed);
            trace!("in-memory transaction started on session {session}");
        }

        Ok(())
    }

    async fn commit_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;
        let mut transaction = state.transaction.take().ok_or_else(|| no_transaction(session))?;

        let mut collections = self.collections.write().await;
        for name in &transaction.touched {
            match transaction.collections.remove(name) {
                Some(collection) => collections.insert(name.clone(), collection),
                None => collections.remove(name),
            };
        }
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "in-memory transaction on session {session} committed {} collections",
            transaction.touched.len()
        );

        Ok(())
    }

    async fn abort_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;

        state.transaction.take().ok_or_else(|| no_transaction(session))?;
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        debug!("in-memory transaction on session {session} aborted");

        Ok(())
    }

    async fn end_session(&self, session: SessionId) -> DocumentStoreResult<()> {
        let state = self.sessions.lock().await.remove(&session);

        if let Some(state) = state {
            if state.transaction.is_some() {
                self.counters.aborts.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.sessions_ended.fetch_add(1, Ordering::Relaxed);
            trace!("in-memory session {session} ended");
        }

        Ok(())
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn create_collection(&self, name: &str, _options: CreateCollectionOptions) -> DocumentStoreResult<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> DocumentStoreResult<String> {
        if index.keys.is_empty() {
            return Err(DocumentStoreError::invalid_argument("keys", "an index needs at least one key"));
        }

        let name = index.index_name();
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = target.indexes.iter().find(|existing| existing.index_name() == name) {
            if existing.keys == index.keys && existing.unique == index.unique && existing.sparse == index.sparse {
                return Ok(name);
            }
            return Err(DocumentStoreError::Backend(format!(
                "an index named {name} already exists on {collection} with different options"
            )));
        }

        let mut staged = target.clone();
        staged.indexes.push(index);
        for (position, document) in staged.documents.iter().enumerate() {
            staged.check_unique(collection, document, Some(position))?;
        }

        *target = staged;
        debug!("in-memory index {name} created on {collection}");

        Ok(name)
    }

    async fn list_indexes(&self, collection: &str) -> DocumentStoreResult<Vec<IndexModel>> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Err(DocumentStoreError::CollectionNotFound(collection.to_string()));
        };

        let mut indexes = vec![IndexModel::ascending(ID_FIELD).named(ID_INDEX)];
        indexes.extend(target.indexes.iter().cloned());

        Ok(indexes)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        let mut documents = self
            .read(session, |collections| read_documents(collections, collection, &filter))
            .await?;

        if let Some(sort) = &options.sort {
            documents.sort_by(|a, b| compare_by(a, b, sort));
        }

        let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = match options.limit {
            Some(0) | None => usize::MAX,
            Some(limit) => usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX),
        };

        let documents = documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &options.projection {
                Some(projection) => aggregate::project(&document, projection),
                None => Ok(document),
            })
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        Ok(Box::new(BatchCursor::new(documents, batch_size(options.batch_size, self.batch_size))))
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        let documents = self
            .read(session, |collections| {
                Ok(collections
                    .get(collection)
                    .map(|collection| collection.documents.clone())
                    .unwrap_or_default())
            })
            .await?;

        let documents = aggregate::run(documents, &pipeline)?;

        Ok(Box::new(BatchCursor::new(documents, batch_size(options.batch_size, self.batch_size))))
    }

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: CountOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<u64> {
        let matched = self
            .read(session, |collections| {
                Ok(match collections.get(collection) {
                    Some(collection) => collection.matching(&filter)?.len() as u64,
                    None => 0,
                })
            })
            .await?;

        let counted = matched.saturating_sub(options.skip.unwrap_or(0));

        Ok(match options.limit {
            Some(limit) => counted.min(limit),
            None => counted,
        })
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<BulkWriteResult> {
        let mut result = self
            .write(collection, session, |target| {
                let mut result = BulkWriteResult::default();
                let mut first_error = None;

                for model in models {
                    trace!("in-memory {} on {collection}", model.kind());
                    if let Err(e) = execute(target, collection, model, &mut result) {
                        if options.ordered {
                            return Err(e);
                        }
                        first_error.get_or_insert(e);
                    }
                }

                match first_error {
                    Some(e) => Err(e),
                    None => Ok(result),
                }
            })
            .await?;

        result.acknowledged = self.acknowledged;

        Ok(result)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateDefinition,
        options: FindOneAndUpdateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Option<Document>> {
        if options.array_filters.is_some() {
            return Err(DocumentStoreError::Backend(
                "array filters are not supported by the in-memory store".to_string(),
            ));
        }

        let returned = self
            .write(collection, session, |target| {
                let mut positions = target.matching(&filter)?;
                if let Some(sort) = &options.sort {
                    positions.sort_by(|a, b| compare_by(&target.documents[*a], &target.documents[*b], sort));
                }

                match positions.first() {
                    Some(&position) => {
                        let before = target.documents[position].clone();
                        let after = update::apply(&before, &update, false)?;
                        target.replace_at(collection, position, after.clone())?;

                        Ok(Some(match options.return_document {
                            ReturnDocument::Before => before,
                            ReturnDocument::After => after,
                        }))
                    }
                    None if options.upsert => {
                        let inserted = target.upsert(collection, &filter, &update)?;
                        Ok(match options.return_document {
                            ReturnDocument::Before => None,
                            ReturnDocument::After => Some(inserted),
                        })
                    }
                    None => Ok(None),
                }
            })
            .await?;

        match (returned, &options.projection) {
            (Some(document), Some(projection)) => Ok(Some(aggregate::project(&document, projection)?)),
            (returned, _) => Ok(returned),
        }
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let open = sessions.len();
        sessions.clear();
        debug!("in-memory store for {} shut down with {open} open sessions", self.database);

        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docrepo_memory::InMemoryStore;
/// use docrepo::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder().with_batch_size(2).build().await?;
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStoreBuilder {
    database: String,
    acknowledged: bool,
    batch_size: u32,
}

impl Default for InMemoryStoreBuilder {
    fn default() -> Self {
        Self { database: "memory".to_string(), acknowledged: true, batch_size: 101 }
    }
}

impl InMemoryStoreBuilder {
    /// Name reported as the database of the store.
    pub fn with_database_name(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Whether bulk writes report themselves as acknowledged. Writes are applied either way.
    pub fn with_acknowledged_writes(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    /// Default number of documents per cursor batch.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn into_store(self) -> InMemoryStore {
        let (fingerprint, _) = Uuid::new_v4().as_u64_pair();

        InMemoryStore {
            database: self.database,
            fingerprint,
            acknowledged: self.acknowledged,
            batch_size: self.batch_size,
            collections: Arc::new(RwLock::new(Collections::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(self.into_store())
    }
}

//! MongoDB storage implementation.
//!
//! Sessions are driver `ClientSession`s kept in a map keyed by [`SessionId`].
//! Cursors stay lazy: a cursor opened inside a session locks that session only
//! while it fetches its next batch.

use async_trait::async_trait;
use bson::Document;
use log::{debug, trace};
use mea::mutex::Mutex;
use mongodb::{
    Client, ClientSession, Collection as MongoCollection, Cursor, Namespace, SessionCursor,
    error::{Error as MongoError, ErrorKind},
    options::{
        self, Acknowledgment, ClientOptions, CollectionOptions, IndexOptions, UpdateModifications, WriteConcern,
    },
    results::SummaryBulkWriteResult,
};
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use docrepo_core::{
    backend::{
        AggregateOptions, BulkWriteOptions, BulkWriteResult, CountOptions, CreateCollectionOptions,
        FindOneAndUpdateOptions, FindOptions, IndexModel, ReturnDocument, SessionId, StoreBackend,
        StoreBackendBuilder, StoreCursor, WriteModel,
    },
    error::{DocumentStoreError, DocumentStoreResult},
    update::UpdateDefinition,
};

const NAMESPACE_EXISTS: i32 = 48;
const DEFAULT_BATCH_SIZE: u32 = 101;

fn backend_error(e: MongoError) -> DocumentStoreError {
    DocumentStoreError::Backend(e.to_string())
}

fn unknown_session(id: &SessionId) -> DocumentStoreError {
    DocumentStoreError::Backend(format!("unknown session {id}"))
}

/// Runs a driver action inside the session when one is given.
macro_rules! in_session {
    ($action:expr, $session:expr) => {
        match $session {
            Some(session) => $action.session(session).await,
            None => $action.await,
        }
    };
}

#[derive(Debug)]
struct SessionEntry {
    session: Arc<Mutex<ClientSession>>,
    in_transaction: bool,
}

/// MongoDB storage backend.
#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    fingerprint: u64,
    acknowledged: bool,
    // Cleared once the server rejects the batched bulk write command (before 8.0).
    batched_writes: AtomicBool,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl MongoDbStore {
    /// Wraps an existing client.
    ///
    /// `fingerprint` identifies the connection in the metadata registry; two
    /// stores over the same deployment should pass the same value.
    pub fn new(client: Client, database: impl Into<String>, fingerprint: u64, acknowledged: bool) -> Self {
        Self {
            client,
            database: database.into(),
            fingerprint,
            acknowledged,
            batched_writes: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a builder that connects to `dsn` and targets `database`.
    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    /// The underlying driver client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, name: &str) -> MongoCollection<Document> {
        let database = self.client.database(&self.database);

        if self.acknowledged {
            database.collection(name)
        } else {
            let mut concern = WriteConcern::default();
            concern.w = Some(Acknowledgment::Nodes(0));
            let mut options = CollectionOptions::default();
            options.write_concern = Some(concern);
            database.collection_with_options(name, options)
        }
    }

    async fn session(&self, id: Option<&SessionId>) -> DocumentStoreResult<Option<Arc<Mutex<ClientSession>>>> {
        match id {
            None => Ok(None),
            Some(id) => self
                .sessions
                .lock()
                .await
                .get(id)
                .map(|entry| Some(Arc::clone(&entry.session)))
                .ok_or_else(|| unknown_session(id)),
        }
    }

    async fn execute(
        &self,
        collection: &MongoCollection<Document>,
        model: WriteModel,
        session: Option<&mut ClientSession>,
        result: &mut BulkWriteResult,
    ) -> DocumentStoreResult<()> {
        match model {
            WriteModel::InsertOne { document } => {
                in_session!(collection.insert_one(document), session).map_err(backend_error)?;
                result.inserted += 1;
            }
            WriteModel::UpdateOne { filter, update, options } => {
                let mut driver_options = options::UpdateOptions::default();
                driver_options.upsert = Some(options.upsert);
                driver_options.array_filters = options.array_filters;

                let outcome = match update {
                    UpdateDefinition::Replacement(replacement) => {
                        let mut replace_options = options::ReplaceOptions::default();
                        replace_options.upsert = Some(options.upsert);
                        in_session!(
                            collection.replace_one(filter, replacement).with_options(replace_options),
                            session
                        )
                    }
                    UpdateDefinition::Operators(operators) => {
                        in_session!(collection.update_one(filter, operators).with_options(driver_options), session)
                    }
                    UpdateDefinition::Pipeline(stages) => {
                        in_session!(collection.update_one(filter, stages).with_options(driver_options), session)
                    }
                }
                .map_err(backend_error)?;

                record_update(result, outcome);
            }
            WriteModel::UpdateMany { filter, update, options } => {
                let mut driver_options = options::UpdateOptions::default();
                driver_options.upsert = Some(options.upsert);
                driver_options.array_filters = options.array_filters;

                let outcome = match update {
                    UpdateDefinition::Operators(operators) => {
                        in_session!(collection.update_many(filter, operators).with_options(driver_options), session)
                    }
                    UpdateDefinition::Pipeline(stages) => {
                        in_session!(collection.update_many(filter, stages).with_options(driver_options), session)
                    }
                    UpdateDefinition::Replacement(_) => {
                        return Err(DocumentStoreError::InvalidQuery(
                            "a replacement cannot be applied to many documents".to_string(),
                        ));
                    }
                }
                .map_err(backend_error)?;

                record_update(result, outcome);
            }
            WriteModel::ReplaceOne { filter, replacement, upsert } => {
                let mut driver_options = options::ReplaceOptions::default();
                driver_options.upsert = Some(upsert);

                let outcome = in_session!(
                    collection.replace_one(filter, replacement).with_options(driver_options),
                    session
                )
                .map_err(backend_error)?;

                record_update(result, outcome);
            }
            WriteModel::DeleteOne { filter } => {
                let outcome = in_session!(collection.delete_one(filter), session).map_err(backend_error)?;
                result.deleted += outcome.deleted_count;
            }
            WriteModel::DeleteMany { filter } => {
                let outcome = in_session!(collection.delete_many(filter), session).map_err(backend_error)?;
                result.deleted += outcome.deleted_count;
            }
        }

        Ok(())
    }
}

fn update_modifications(update: UpdateDefinition) -> DocumentStoreResult<UpdateModifications> {
    match update {
        UpdateDefinition::Operators(operators) => Ok(UpdateModifications::Document(operators)),
        UpdateDefinition::Pipeline(stages) => Ok(UpdateModifications::Pipeline(stages)),
        UpdateDefinition::Replacement(_) => Err(DocumentStoreError::InvalidQuery(
            "a replacement cannot be applied to many documents".to_string(),
        )),
    }
}

fn array_filters(filters: Option<Vec<Document>>) -> Option<Vec<bson::Bson>> {
    filters.map(|filters| filters.into_iter().map(bson::Bson::Document).collect())
}

/// Converts a model for the client-level `bulkWrite` command.
fn to_batched_model(namespace: &Namespace, model: WriteModel) -> DocumentStoreResult<options::WriteModel> {
    let model = match model {
        WriteModel::InsertOne { document } => options::InsertOneModel::builder()
            .namespace(namespace.clone())
            .document(document)
            .build()
            .into(),
        WriteModel::UpdateOne { filter, update: UpdateDefinition::Replacement(replacement), options } => {
            options::ReplaceOneModel::builder()
                .namespace(namespace.clone())
                .filter(filter)
                .replacement(replacement)
                .upsert(Some(options.upsert))
                .build()
                .into()
        }
        WriteModel::UpdateOne { filter, update, options } => options::UpdateOneModel::builder()
            .namespace(namespace.clone())
            .filter(filter)
            .update(update_modifications(update)?)
            .array_filters(array_filters(options.array_filters))
            .upsert(Some(options.upsert))
            .build()
            .into(),
        WriteModel::UpdateMany { filter, update, options } => options::UpdateManyModel::builder()
            .namespace(namespace.clone())
            .filter(filter)
            .update(update_modifications(update)?)
            .array_filters(array_filters(options.array_filters))
            .upsert(Some(options.upsert))
            .build()
            .into(),
        WriteModel::ReplaceOne { filter, replacement, upsert } => options::ReplaceOneModel::builder()
            .namespace(namespace.clone())
            .filter(filter)
            .replacement(replacement)
            .upsert(Some(upsert))
            .build()
            .into(),
        WriteModel::DeleteOne { filter } => options::DeleteOneModel::builder()
            .namespace(namespace.clone())
            .filter(filter)
            .build()
            .into(),
        WriteModel::DeleteMany { filter } => options::DeleteManyModel::builder()
            .namespace(namespace.clone())
            .filter(filter)
            .build()
            .into(),
    };

    Ok(model)
}

fn from_summary(summary: SummaryBulkWriteResult) -> BulkWriteResult {
    let count = |value: i64| u64::try_from(value).unwrap_or(0);

    BulkWriteResult {
        acknowledged: true,
        inserted: count(summary.inserted_count),
        matched: count(summary.matched_count),
        modified: count(summary.modified_count),
        deleted: count(summary.deleted_count),
        upserted: count(summary.upserted_count),
    }
}

fn is_incompatible_server(e: &MongoError) -> bool {
    matches!(e.kind.as_ref(), ErrorKind::IncompatibleServer { .. })
}

fn record_update(result: &mut BulkWriteResult, outcome: mongodb::results::UpdateResult) {
    result.matched += outcome.matched_count;
    result.modified += outcome.modified_count;
    if outcome.upserted_id.is_some() {
        result.upserted += 1;
    }
}

fn to_driver_index(index: IndexModel) -> mongodb::IndexModel {
    let mut options = IndexOptions::default();
    options.name = index.name;
    options.unique = index.unique.then_some(true);
    options.sparse = index.sparse.then_some(true);

    mongodb::IndexModel::builder()
        .keys(index.keys)
        .options(options)
        .build()
}

fn from_driver_index(index: mongodb::IndexModel) -> IndexModel {
    let options = index.options.unwrap_or_default();

    IndexModel {
        keys: index.keys,
        name: options.name,
        unique: options.unique.unwrap_or(false),
        sparse: options.sparse.unwrap_or(false),
    }
}

/// Cursor over a driver cursor opened outside any session.
struct MongoCursor {
    cursor: Cursor<Document>,
    batch_size: usize,
}

#[async_trait]
impl StoreCursor for MongoCursor {
    async fn next_batch(&mut self) -> DocumentStoreResult<Option<Vec<Document>>> {
        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size && self.cursor.advance().await.map_err(backend_error)? {
            batch.push(self.cursor.deserialize_current().map_err(backend_error)?);
        }

        Ok((!batch.is_empty()).then_some(batch))
    }
}

/// Cursor over a driver cursor bound to a session.
struct MongoSessionCursor {
    cursor: SessionCursor<Document>,
    session: Arc<Mutex<ClientSession>>,
    batch_size: usize,
}

#[async_trait]
impl StoreCursor for MongoSessionCursor {
    async fn next_batch(&mut self) -> DocumentStoreResult<Option<Vec<Document>>> {
        let mut session = self.session.lock().await;
        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size && self.cursor.advance(&mut session).await.map_err(backend_error)? {
            batch.push(self.cursor.deserialize_current().map_err(backend_error)?);
        }

        Ok((!batch.is_empty()).then_some(batch))
    }
}

fn batch_len(batch_size: Option<u32>) -> usize {
    usize::try_from(batch_size.unwrap_or(DEFAULT_BATCH_SIZE)).unwrap_or(usize::MAX)
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn connection_fingerprint(&self) -> u64 {
        self.fingerprint
    }

    async fn start_session(&self) -> DocumentStoreResult<SessionId> {
        let session = self.client.start_session().await.map_err(backend_error)?;
        let id = SessionId::new();

        self.sessions.lock().await.insert(
            id.clone(),
            SessionEntry { session: Arc::new(Mutex::new(session)), in_transaction: false },
        );
        trace!("mongodb session {id} started");

        Ok(id)
    }

    async fn start_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;

        if !entry.in_transaction {
            entry
                .session
                .lock()
                .await
                .start_transaction()
                .await
                .map_err(backend_error)?;
            entry.in_transaction = true;
            trace!("mongodb transaction started on session {session}");
        }

        Ok(())
    }

    async fn commit_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;

        entry
            .session
            .lock()
            .await
            .commit_transaction()
            .await
            .map_err(backend_error)?;
        entry.in_transaction = false;
        debug!("mongodb transaction on session {session} committed");

        Ok(())
    }

    async fn abort_transaction(&self, session: &SessionId) -> DocumentStoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session).ok_or_else(|| unknown_session(session))?;

        entry
            .session
            .lock()
            .await
            .abort_transaction()
            .await
            .map_err(backend_error)?;
        entry.in_transaction = false;
        debug!("mongodb transaction on session {session} aborted");

        Ok(())
    }

    async fn end_session(&self, session: SessionId) -> DocumentStoreResult<()> {
        let entry = self.sessions.lock().await.remove(&session);

        if let Some(entry) = entry {
            if entry.in_transaction {
                entry
                    .session
                    .lock()
                    .await
                    .abort_transaction()
                    .await
                    .map_err(backend_error)?;
            }
            trace!("mongodb session {session} ended");
        }

        Ok(())
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(backend_error)
    }

    async fn create_collection(&self, name: &str, options: CreateCollectionOptions) -> DocumentStoreResult<()> {
        let mut driver_options = options::CreateCollectionOptions::default();
        driver_options.capped = options.capped.then_some(true);
        driver_options.size = options.size;
        driver_options.max = options.max;
        driver_options.validator = options.validator;

        match self
            .client
            .database(&self.database)
            .create_collection(name)
            .with_options(driver_options)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if matches!(*e.kind, ErrorKind::Command(ref command) if command.code == NAMESPACE_EXISTS) => {
                debug!("collection {name} already exists");
                Ok(())
            }
            Err(e) => Err(backend_error(e)),
        }
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> DocumentStoreResult<String> {
        let created = self
            .get_collection(collection)
            .create_index(to_driver_index(index))
            .await
            .map_err(|e| DocumentStoreError::Index(e.to_string()))?;

        Ok(created.index_name)
    }

    async fn list_indexes(&self, collection: &str) -> DocumentStoreResult<Vec<IndexModel>> {
        let mut cursor = self
            .get_collection(collection)
            .list_indexes()
            .await
            .map_err(backend_error)?;
        let mut indexes = Vec::new();

        while cursor.advance().await.map_err(backend_error)? {
            indexes.push(from_driver_index(cursor.deserialize_current().map_err(backend_error)?));
        }

        Ok(indexes)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        let mut driver_options = options::FindOptions::default();
        driver_options.projection = options.projection;
        driver_options.sort = options.sort;
        driver_options.skip = options.skip;
        driver_options.limit = options.limit;
        driver_options.batch_size = options.batch_size;

        let batch_size = batch_len(options.batch_size);
        let target = self.get_collection(collection);
        let action = target.find(filter).with_options(driver_options);

        match self.session(session).await? {
            Some(session) => {
                let cursor = action
                    .session(&mut *session.lock().await)
                    .await
                    .map_err(backend_error)?;
                Ok(Box::new(MongoSessionCursor { cursor, session, batch_size }))
            }
            None => {
                let cursor = action.await.map_err(backend_error)?;
                Ok(Box::new(MongoCursor { cursor, batch_size }))
            }
        }
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<Box<dyn StoreCursor>> {
        let mut driver_options = options::AggregateOptions::default();
        driver_options.batch_size = options.batch_size;
        driver_options.allow_disk_use = options.allow_disk_use;

        let batch_size = batch_len(options.batch_size);
        let target = self.get_collection(collection);
        let action = target.aggregate(pipeline).with_options(driver_options);

        match self.session(session).await? {
            Some(session) => {
                let cursor = action
                    .session(&mut *session.lock().await)
                    .await
                    .map_err(backend_error)?;
                Ok(Box::new(MongoSessionCursor { cursor, session, batch_size }))
            }
            None => {
                let cursor = action.await.map_err(backend_error)?;
                Ok(Box::new(MongoCursor { cursor, batch_size }))
            }
        }
    }

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: CountOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<u64> {
        let mut driver_options = options::CountOptions::default();
        driver_options.skip = options.skip;
        driver_options.limit = options.limit;

        let target = self.get_collection(collection);
        let action = target.count_documents(filter).with_options(driver_options);

        match self.session(session).await? {
            Some(session) => {
                let mut guard = session.lock().await;
                action.session(&mut *guard).await
            }
            None => action.await,
        }
        .map_err(backend_error)
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&SessionId>,
    ) -> DocumentStoreResult<BulkWriteResult> {
        let target = self.get_collection(collection);
        let session = self.session(session).await?;
        let mut guard = match &session {
            Some(session) => Some(session.lock().await),
            None => None,
        };

        if self.acknowledged && !models.is_empty() && self.batched_writes.load(Ordering::Relaxed) {
            let namespace = target.namespace();
            let batch = models
                .iter()
                .cloned()
                .map(|model| to_batched_model(&namespace, model))
                .collect::<DocumentStoreResult<Vec<_>>>()?;

            let mut driver_options = options::BulkWriteOptions::default();
            driver_options.ordered = Some(options.ordered);

            trace!("mongodb bulkWrite of {} models on {collection}", batch.len());
            let action = self.client.bulk_write(batch).with_options(driver_options);
            match in_session!(action, guard.as_deref_mut()) {
                Ok(summary) => return Ok(from_summary(summary)),
                Err(e) if is_incompatible_server(&e) => {
                    debug!("server does not support bulkWrite, writing model by model");
                    self.batched_writes.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(backend_error(e)),
            }
        }

        let mut result = BulkWriteResult::default();
        let mut first_error = None;

        for model in models {
            trace!("mongodb {} on {collection}", model.kind());
            if let Err(e) = self
                .execute(&target, model, guard.as_deref_mut(), &mut result)
                .await
            {
                if options.ordered {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

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
        let mut driver_options = options::FindOneAndUpdateOptions::default();
        driver_options.projection = options.projection;
        driver_options.sort = options.sort;
        driver_options.upsert = Some(options.upsert);
        driver_options.array_filters = options.array_filters;
        driver_options.return_document = Some(match options.return_document {
            ReturnDocument::Before => options::ReturnDocument::Before,
            ReturnDocument::After => options::ReturnDocument::After,
        });

        let target = self.get_collection(collection);
        let session = self.session(session).await?;
        let mut guard = match &session {
            Some(session) => Some(session.lock().await),
            None => None,
        };

        match update {
            UpdateDefinition::Operators(operators) => in_session!(
                target.find_one_and_update(filter, operators).with_options(driver_options),
                guard.as_deref_mut()
            ),
            UpdateDefinition::Pipeline(stages) => in_session!(
                target.find_one_and_update(filter, stages).with_options(driver_options),
                guard.as_deref_mut()
            ),
            UpdateDefinition::Replacement(replacement) => {
                let mut replace_options = options::FindOneAndReplaceOptions::default();
                replace_options.projection = driver_options.projection;
                replace_options.sort = driver_options.sort;
                replace_options.upsert = driver_options.upsert;
                replace_options.return_document = driver_options.return_document;
                in_session!(
                    target.find_one_and_replace(filter, replacement).with_options(replace_options),
                    guard.as_deref_mut()
                )
            }
        }
        .map_err(backend_error)
    }

    async fn shutdown(&self) -> DocumentStoreResult<()> {
        let sessions: Vec<SessionId> = self.sessions.lock().await.keys().cloned().collect();
        for session in sessions {
            self.end_session(session).await?;
        }

        self.client.clone().shutdown().await;
        debug!("mongodb store for {} shut down", self.database);

        Ok(())
    }
}

/// Builder for [`MongoDbStore`].
pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
    acknowledged: bool,
    app_name: Option<String>,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
            acknowledged: true,
            app_name: None,
        }
    }

    /// Use an unacknowledged (`w: 0`) write concern. Not allowed inside transactions.
    pub fn with_acknowledged_writes(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    /// Application name reported to the server.
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        let mut options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?;
        if self.app_name.is_some() {
            options.app_name = self.app_name;
        }

        let client = Client::with_options(options).map_err(|e| DocumentStoreError::Initialization(e.to_string()))?;

        let mut hasher = DefaultHasher::new();
        self.dsn.hash(&mut hasher);

        debug!("mongodb store for database {} built", self.database);

        Ok(MongoDbStore::new(client, self.database, hasher.finish(), self.acknowledged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn index_models_keep_their_options() {
        let index = IndexModel::ascending("reference_id").unique().sparse();
        let driver = to_driver_index(index.clone());

        assert_eq!(driver.keys, doc! { "reference_id": 1 });
        assert_eq!(from_driver_index(driver), index);
    }

    #[test]
    fn default_indexes_carry_no_options() {
        let driver = to_driver_index(IndexModel::new(doc! { "tenant_id": 1, "created_at": -1 }));
        let options = driver.options.clone().unwrap_or_default();

        assert_eq!(options.unique, None);
        assert_eq!(options.sparse, None);
        assert!(!from_driver_index(driver).unique);
    }

    #[test]
    fn batched_models_target_the_collection_namespace() {
        let namespace = Namespace::new("bank", "accounts");

        let replace = to_batched_model(
            &namespace,
            WriteModel::UpdateOne {
                filter: doc! { "_id": 1 },
                update: UpdateDefinition::Replacement(doc! { "owner": "alice" }),
                options: Default::default(),
            },
        )
        .unwrap();
        match replace {
            options::WriteModel::ReplaceOne(model) => {
                assert_eq!(model.namespace, namespace);
                assert_eq!(model.replacement, doc! { "owner": "alice" });
                assert_eq!(model.upsert, Some(false));
            }
            other => panic!("expected a replace model, got {other:?}"),
        }

        let update = to_batched_model(
            &namespace,
            WriteModel::UpdateMany {
                filter: doc! {},
                update: UpdateDefinition::Operators(doc! { "$inc": { "balance": 1 } }),
                options: Default::default(),
            },
        )
        .unwrap();
        assert!(matches!(update, options::WriteModel::UpdateMany(model) if model.namespace == namespace));

        let invalid = to_batched_model(
            &namespace,
            WriteModel::UpdateMany {
                filter: doc! {},
                update: UpdateDefinition::Replacement(doc! {}),
                options: Default::default(),
            },
        );
        assert!(matches!(invalid, Err(DocumentStoreError::InvalidQuery(_))));
    }

    #[test]
    fn summaries_map_onto_write_results() {
        let mut summary = SummaryBulkWriteResult::default();
        summary.inserted_count = 3;
        summary.modified_count = 1;
        summary.deleted_count = 2;

        let result = from_summary(summary);

        assert!(result.acknowledged);
        assert_eq!((result.inserted, result.modified, result.deleted, result.matched), (3, 1, 2, 0));
    }
}

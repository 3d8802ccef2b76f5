//! The connection-level context shared by repositories.
//!
//! A [`Context`] binds a backend, a configuration and an [`Interceptor`]. It owns
//! the ambient session used when ambient transactions are enabled, knows which
//! collections already exist, and hands out repository builders.
//!
//! ```ignore
//! let context = Context::builder(InMemoryStore::builder().build().await?)
//!     .with_ambient_transactions(true)
//!     .with_interceptor(TenantScope::new("acme"))
//!     .build()
//!     .await?;
//!
//! let users = context.repository::<User>().build().await?;
//! ```

use log::debug;
use parking_lot::Mutex;
use std::{any::TypeId, collections::HashSet, fmt, sync::Arc};

use crate::{
    backend::{SessionId, StoreBackend},
    config::{ContextConfig, IndexConventions},
    document::Document,
    error::DocumentStoreResult,
    intercept::{Interceptor, NoopInterceptor},
    metadata::MetadataKey,
    repository::RepositoryBuilder,
    session::{AfterTransaction, SessionHandle, SessionSlot},
};

struct ContextInner<B, I> {
    backend: B,
    interceptor: I,
    config: ContextConfig,
    collections: Mutex<HashSet<String>>,
    ambient: SessionSlot,
    metadata_key: MetadataKey,
}

/// Shared handle to a backend, its configuration and its interceptor.
///
/// Cloning is cheap; clones share the ambient session and collection list.
pub struct Context<B: StoreBackend, I: Interceptor = NoopInterceptor> {
    inner: Arc<ContextInner<B, I>>,
}

impl<B: StoreBackend> Context<B, NoopInterceptor> {
    /// Starts configuring a context over `backend`.
    pub fn builder(backend: B) -> ContextBuilder<B, NoopInterceptor> {
        ContextBuilder::new(backend)
    }
}

impl<B: StoreBackend, I: Interceptor> Context<B, I> {
    /// The storage backend shared by every repository of this context.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// The interceptor consulted by every repository of this context.
    pub fn interceptor(&self) -> &I {
        &self.inner.interceptor
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Name of the database the backend targets.
    pub fn database_name(&self) -> &str {
        self.inner.backend.database_name()
    }

    /// Whether `name` was known to exist when last checked.
    pub fn has_collection(&self, name: &str) -> bool {
        self.inner.collections.lock().contains(name)
    }

    /// Known collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Reloads the collection list from the backend.
    pub async fn refresh_collections(&self) -> DocumentStoreResult<()> {
        let names = self.inner.backend.list_collections().await?;
        *self.inner.collections.lock() = names.into_iter().collect();
        Ok(())
    }

    pub(crate) fn register_collection(&self, name: &str) {
        self.inner.collections.lock().insert(name.to_string());
    }

    pub(crate) fn metadata_key(&self) -> &MetadataKey {
        &self.inner.metadata_key
    }

    /// The ambient slot when ambient transactions are enabled.
    pub(crate) fn ambient_slot(&self) -> Option<&SessionSlot> {
        self.inner
            .config
            .ambient_transactions
            .then_some(&self.inner.ambient)
    }

    /// Returns the ambient session, creating it if needed.
    pub async fn create_session(&self) -> DocumentStoreResult<SessionId> {
        self.inner
            .ambient
            .ensure_session(&self.inner.backend)
            .await
    }

    /// Starts the ambient transaction. Starting it again is a no-op.
    pub async fn start_transaction(&self) -> DocumentStoreResult<SessionId> {
        self.inner
            .ambient
            .ensure_transaction(&self.inner.backend)
            .await
    }

    /// Commits the ambient transaction and releases its session.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NoActiveTransaction`](crate::error::DocumentStoreError::NoActiveTransaction)
    /// when no ambient transaction is open.
    pub async fn commit_transaction(&self) -> DocumentStoreResult<()> {
        self.inner
            .ambient
            .commit(&self.inner.backend, AfterTransaction::Release)
            .await
    }

    /// Aborts the ambient transaction and releases its session.
    pub async fn abort_transaction(&self) -> DocumentStoreResult<()> {
        self.inner
            .ambient
            .abort(&self.inner.backend, AfterTransaction::Release)
            .await
    }

    /// A snapshot of the ambient session, if one exists.
    pub async fn ambient_session(&self) -> Option<SessionHandle> {
        self.inner.ambient.current().await
    }

    /// Starts configuring a repository for documents of type `D`.
    pub fn repository<D: Document>(&self) -> RepositoryBuilder<D, B, I> {
        RepositoryBuilder::new(self.clone())
    }

    /// Aborts an open ambient transaction and ends the ambient session.
    pub async fn close(&self) -> DocumentStoreResult<()> {
        self.inner.ambient.close(&self.inner.backend).await
    }

    /// Closes the context and shuts the backend down.
    pub async fn shutdown(&self) -> DocumentStoreResult<()> {
        self.close().await?;
        self.inner.backend.shutdown().await
    }
}

impl<B: StoreBackend, I: Interceptor> Clone for Context<B, I> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: StoreBackend, I: Interceptor> fmt::Debug for Context<B, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.backend)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder<B, I> {
    backend: B,
    interceptor: I,
    config: ContextConfig,
}

impl<B: StoreBackend> ContextBuilder<B, NoopInterceptor> {
    /// Starts a builder over `backend` with the default configuration and no interceptor.
    pub fn new(backend: B) -> Self {
        Self { backend, interceptor: NoopInterceptor, config: ContextConfig::default() }
    }
}

impl<B: StoreBackend, I: Interceptor> ContextBuilder<B, I> {
    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs the interceptor whose hooks every repository runs.
    pub fn with_interceptor<J: Interceptor>(self, interceptor: J) -> ContextBuilder<B, J> {
        ContextBuilder { backend: self.backend, interceptor, config: self.config }
    }

    /// Runs operations of repositories without a dedicated transaction in one shared transaction.
    pub fn with_ambient_transactions(mut self, enabled: bool) -> Self {
        self.config.ambient_transactions = enabled;
        self
    }

    /// Fails repository construction when an index cannot be created.
    pub fn with_throw_on_index_error(mut self, enabled: bool) -> Self {
        self.config.throw_on_index_error = enabled;
        self
    }

    /// Creates missing collections (and their indexes) when repositories are built.
    pub fn with_create_collections(mut self, enabled: bool) -> Self {
        self.config.create_collections = enabled;
        self
    }

    /// Cursor batch size requested from the store.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Replaces the conventional index set declared for every collection.
    pub fn with_index_conventions(mut self, conventions: IndexConventions) -> Self {
        self.config.indexes = conventions;
        self
    }

    /// Loads the existing collection names and builds the context.
    pub async fn build(self) -> DocumentStoreResult<Context<B, I>> {
        let collections: HashSet<String> = self.backend.list_collections().await?.into_iter().collect();
        let metadata_key = MetadataKey::new(
            TypeId::of::<I>(),
            self.backend.database_name(),
            self.backend.connection_fingerprint(),
        );

        debug!(
            "context for database {} built with {} existing collections",
            self.backend.database_name(),
            collections.len()
        );

        Ok(Context {
            inner: Arc::new(ContextInner {
                backend: self.backend,
                interceptor: self.interceptor,
                config: self.config,
                collections: Mutex::new(collections),
                ambient: SessionSlot::new("ambient"),
                metadata_key,
            }),
        })
    }
}

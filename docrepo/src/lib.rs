//! Main docrepo crate providing typed, transaction-aware repositories over document stores.
//!
//! This crate is the primary entry point of the docrepo framework. It re-exports the core
//! types from `docrepo-core` and gives access to the available storage backends.
//!
//! # Features
//!
//! - **Typed repositories** - Define documents with Serde and read, write and aggregate them safely
//! - **Transactions** - Per-repository dedicated transactions or a context-wide ambient transaction
//! - **Interceptors** - Rewrite filters, updates and results for soft deletes, tenancy or auditing
//! - **Pagination** - Faceted page queries returning items and total counts in one round trip
//! - **Multiple backends** - In-memory for tests and development, MongoDB for production
//!
//! # Quick Start
//!
//! ```ignore
//! use docrepo::{prelude::*, memory::InMemoryStore};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct User {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<String>,
//!     pub name: String,
//! }
//!
//! impl Document for User {
//!     type Id = String;
//!
//!     fn id(&self) -> Option<&String> { self.id.as_ref() }
//!     fn collection_name() -> &'static str { "users" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let context = Context::builder(InMemoryStore::builder().build().await?)
//!         .build()
//!         .await?;
//!     let users = context.repository::<User>().build().await?;
//!
//!     users.insert(&User { id: Some("u1".into()), name: "Alice".into() }).await?;
//!
//!     let alice = users
//!         .get_single(Query::expr(Filter::eq("name", "Alice")))
//!         .await?;
//!     println!("found {alice:?}");
//!
//!     context.shutdown().await
//! }
//! ```
//!
//! # Transactions
//!
//! A repository built with `with_force_transaction(Some(true))` opens its own session on the
//! first operation and keeps every later operation in that transaction until
//! [`Repository::commit_transaction`](repository::Repository::commit_transaction) or
//! [`Repository::abort_transaction`](repository::Repository::abort_transaction).
//!
//! ```ignore
//! let orders = context
//!     .repository::<Order>()
//!     .with_force_transaction(Some(true))
//!     .build()
//!     .await?;
//!
//! orders.insert(&order).await?;
//! orders.update_one(query, UpdateOptions::default()).await?;
//! orders.commit_transaction().await?;
//! ```
//!
//! With ambient transactions enabled on the context, repositories that do not force a choice
//! share the context's transaction, committed through [`Context::commit_transaction`](context::Context::commit_transaction).
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - `mongodb` - Persistent MongoDB backend (requires the `mongodb` feature)

pub mod prelude;

pub use docrepo_core::{
    backend, cancel, config, context, document, error, filter, intercept, metadata, page, query, repository,
    session, update,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docrepo_memory::{InMemoryStore, InMemoryStoreBuilder, StoreStats};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docrepo_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}

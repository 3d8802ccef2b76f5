//! A transaction-aware repository layer over BSON document stores.
//!
//! This crate is the core of the docrepo project and provides:
//!
//! - **Document traits** ([`document`]) - The trait every stored type implements
//! - **Query algebra** ([`query`], [`filter`]) - Composable, typed query shapes and filter expressions
//! - **Update builder** ([`update`]) - Fluent, accumulating update instructions
//! - **Backend contract** ([`backend`]) - The driver-facing trait storage backends implement
//! - **Contexts** ([`context`]) - Connection-level configuration, ambient sessions and collection provisioning
//! - **Repositories** ([`repository`]) - The per-collection CRUD, aggregation and pagination façade
//! - **Sessions** ([`session`]) - Dedicated and ambient session bookkeeping
//! - **Interception** ([`intercept`]) - Hooks that rewrite requests and results
//! - **Metadata** ([`metadata`]) - Per-collection indexes and field mappings, built once per process
//! - **Pagination** ([`page`]) - Page requests and paged results
//! - **Error handling** ([`error`]) - Error taxonomy and result type
//!
//! # Example
//!
//! ```ignore
//! use docrepo::{prelude::*, memory::InMemoryStore};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct User {
//!     #[serde(rename = "_id")]
//!     pub id: Option<String>,
//!     pub name: String,
//! }
//!
//! impl Document for User {
//!     type Id = String;
//!
//!     fn id(&self) -> Option<&String> {
//!         self.id.as_ref()
//!     }
//!
//!     fn collection_name() -> &'static str {
//!         "users"
//!     }
//! }
//!
//! let context = Context::builder(InMemoryStore::builder().build().await?).build().await?;
//! let users = context.repository::<User>().build().await?;
//!
//! users.insert(&user).await?;
//! let alice: Option<User> = users.get_single(Query::expr(Filter::eq("name", "Alice"))).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docrepo_core;

pub mod backend;
pub mod cancel;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod filter;
pub mod intercept;
pub mod metadata;
pub mod page;
pub mod query;
pub mod repository;
pub mod session;
pub mod update;

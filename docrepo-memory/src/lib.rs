//! In-memory document storage backend for docrepo.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It evaluates MongoDB-dialect filters, updates and aggregation pipelines in-process and is
//! meant for development and tests.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware locks
//! - **Snapshot transactions** - Sessions can stage writes and commit or abort them
//! - **Index enforcement** - Unique and sparse indexes are checked on every write
//! - **Instrumentation** - Session and transaction counters through [`InMemoryStore::stats`]
//!
//! # Quick Start
//!
//! ```ignore
//! use docrepo::{prelude::*, memory::InMemoryStore};
//!
//! let context = Context::builder(InMemoryStore::builder().build().await?)
//!     .build()
//!     .await?;
//! let users = context.repository::<User>().build().await?;
//!
//! users.insert(&user).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docrepo_memory;

pub mod aggregate;
pub mod evaluator;
mod path;
pub mod store;
mod update;

pub use store::{InMemoryStore, InMemoryStoreBuilder, StoreStats};

#![allow(dead_code)]

use docrepo::{
    backend::{BulkWriteOptions, CreateCollectionOptions, WriteModel},
    bson::Document as BsonDocument,
    memory::InMemoryStore,
    prelude::*,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub owner: String,
    pub balance: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl Document for Account {
    type Id = String;

    fn id(&self) -> Option<&String> {
        self.id.as_ref()
    }

    fn collection_name() -> &'static str {
        "accounts"
    }
}

pub fn account(id: &str, owner: &str, balance: i64) -> Account {
    Account {
        id: Some(id.to_string()),
        owner: owner.to_string(),
        balance,
        deleted: false,
        tenant_id: None,
        reference_id: None,
    }
}

pub async fn memory_store() -> InMemoryStore {
    InMemoryStore::builder().build().await.unwrap()
}

pub async fn context(store: &InMemoryStore) -> Context<InMemoryStore> {
    Context::builder(store.clone()).build().await.unwrap()
}

/// Writes raw documents straight into the store, bypassing every repository hook.
pub async fn seed(store: &InMemoryStore, collection: &str, documents: Vec<BsonDocument>) {
    store
        .create_collection(collection, CreateCollectionOptions::default())
        .await
        .unwrap();

    let models = documents
        .into_iter()
        .map(|document| WriteModel::InsertOne { document })
        .collect();

    store
        .bulk_write(collection, models, BulkWriteOptions::default(), None)
        .await
        .unwrap();
}

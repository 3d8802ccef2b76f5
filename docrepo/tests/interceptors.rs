mod common;

use common::{Account, account, memory_store, seed};
use docrepo::{
    backend::{AggregateOptions, FindOptions},
    bson::{Bson, Document as BsonDocument, doc},
    memory::InMemoryStore,
    prelude::*,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Scopes every operation to one tenant and hides soft-deleted documents.
struct TenantScope {
    tenant: &'static str,
}

impl TenantScope {
    fn scope(&self, filter: &mut BsonDocument) {
        filter.insert("tenant_id", self.tenant);
        filter.insert("deleted", false);
    }
}

impl Interceptor for TenantScope {
    fn before_insert(&self, _ctx: &HookContext<'_>, mut document: BsonDocument) -> DocumentStoreResult<Option<BsonDocument>> {
        document.insert("tenant_id", self.tenant);
        Ok(Some(document))
    }

    fn before_update(
        &self,
        _ctx: &HookContext<'_>,
        filter: &mut BsonDocument,
        _update: &mut UpdateDefinition,
        _options: &mut UpdateOptions,
    ) -> DocumentStoreResult<()> {
        self.scope(filter);
        Ok(())
    }

    fn before_find(&self, ctx: &HookContext<'_>, filter: &mut BsonDocument, _options: &mut FindOptions) -> DocumentStoreResult<()> {
        if ctx.operation == Operation::Delete {
            filter.insert("tenant_id", self.tenant);
        } else {
            self.scope(filter);
        }
        Ok(())
    }

    fn before_aggregate(
        &self,
        _ctx: &HookContext<'_>,
        pipeline: &mut Vec<BsonDocument>,
        _options: &mut AggregateOptions,
    ) -> DocumentStoreResult<()> {
        let mut scope = BsonDocument::new();
        self.scope(&mut scope);
        pipeline.insert(0, doc! { "$match": scope });
        Ok(())
    }
}

async fn seeded_store() -> InMemoryStore {
    let store = memory_store().await;
    seed(
        &store,
        "accounts",
        vec![
            doc! { "_id": "x1", "owner": "mallory", "balance": 5_i64, "deleted": false, "tenant_id": "other" },
            doc! { "_id": "x2", "owner": "trent", "balance": 7_i64, "deleted": true, "tenant_id": "acme" },
        ],
    )
    .await;
    store
}

#[tokio::test]
async fn tenant_scope_applies_to_reads_writes_and_pages() {
    let store = seeded_store().await;
    let context = Context::builder(store.clone())
        .with_interceptor(TenantScope { tenant: "acme" })
        .build()
        .await
        .unwrap();
    let repo = context.repository::<Account>().build().await.unwrap();

    repo.insert_many(&[account("a1", "alice", 10), account("a2", "bob", 20)])
        .await
        .unwrap();

    let visible: Vec<Account> = repo.get_many(Query::all()).await.unwrap();
    assert_eq!(visible.len(), 2);
    assert!(visible.iter().all(|a| a.tenant_id.as_deref() == Some("acme")));
    assert_eq!(repo.count(Query::all()).await.unwrap(), 2);
    assert!(repo.get("x1").await.unwrap().is_none());

    let updated = repo
        .update_many(
            Query::<Account>::all().with_update(Update::new().inc("balance", 1)),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(updated.count(), 4);

    let page = repo
        .paginate(Query::<Account>::all(), PageRequest::new(1, 10))
        .await
        .unwrap();
    assert_eq!(page.row_count(), 2);

    assert_eq!(repo.delete_many(Query::all()).await.unwrap().count(), 3);
    assert_eq!(store.snapshot("accounts").await.len(), 1);
}

struct RejectAll;

impl Interceptor for RejectAll {
    fn before_insert(&self, _ctx: &HookContext<'_>, _document: BsonDocument) -> DocumentStoreResult<Option<BsonDocument>> {
        Ok(None)
    }
}

#[tokio::test]
async fn dropped_inserts_fail_without_writing() {
    let store = memory_store().await;
    let repo = Context::builder(store.clone())
        .with_interceptor(RejectAll)
        .build()
        .await
        .unwrap()
        .repository::<Account>()
        .build()
        .await
        .unwrap();

    let result = repo.insert(&account("a1", "alice", 1)).await;

    assert!(matches!(result, Err(DocumentStoreError::NoDocument(collection)) if collection == "accounts"));
    assert!(store.snapshot("accounts").await.is_empty());
}

#[derive(Default)]
struct Redact {
    writes: AtomicU64,
}

impl Interceptor for Redact {
    fn after_result(&self, _ctx: &HookContext<'_>, result: ResultMut<'_>) -> DocumentStoreResult<()> {
        match result {
            ResultMut::Document(document) => {
                document.insert("owner", "***");
            }
            ResultMut::Count(count) => *count += 100,
            ResultMut::Write(write) => {
                self.writes.fetch_add(write.inserted, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn results_pass_through_the_after_hook() {
    let store = memory_store().await;
    let context = Context::builder(store.clone())
        .with_interceptor(Redact::default())
        .build()
        .await
        .unwrap();
    let repo = context.repository::<Account>().build().await.unwrap();

    repo.insert_many(&[account("a1", "alice", 1), account("a2", "bob", 2)])
        .await
        .unwrap();

    assert_eq!(context.interceptor().writes.load(Ordering::Relaxed), 2);
    assert_eq!(repo.get("a1").await.unwrap().unwrap().owner, "***");
    assert_eq!(repo.count(Query::all()).await.unwrap(), 102);

    let page = repo.paginate(Query::<Account>::all(), PageRequest::new(1, 5)).await.unwrap();
    assert_eq!(page.row_count(), 102);
    assert!(page.items().iter().all(|a| a.owner == "***"));
    assert_eq!(store.snapshot("accounts").await[0].get_str("owner").unwrap(), "alice");
}

struct ShortNames;

impl Interceptor for ShortNames {
    fn map_fields(&self, collection: &str, mapping: &mut FieldMapping) {
        if collection == "accounts" {
            mapping.map("owner", "o").map("balance", "b");
        }
    }

    fn build_indexes(&self, _collection: &str, indexes: &mut Vec<IndexModel>) {
        indexes.retain(|index| !index.unique);
        indexes.push(IndexModel::ascending("owner").unique().named("owner_unique"));
    }
}

#[tokio::test]
async fn logical_fields_are_stored_under_wire_names() {
    let store = memory_store().await;
    let repo = Context::builder(store.clone())
        .with_interceptor(ShortNames)
        .build()
        .await
        .unwrap()
        .repository::<Account>()
        .build()
        .await
        .unwrap();

    repo.insert(&account("a1", "alice", 10)).await.unwrap();
    repo.insert(&account("a2", "bob", 20)).await.unwrap();

    let stored = store.snapshot("accounts").await;
    assert_eq!(stored[0].get_str("o").unwrap(), "alice");
    assert_eq!(stored[0].get("b"), Some(&Bson::Int64(10)));
    assert!(!stored[0].contains_key("owner"));

    let found: Vec<Account> = repo
        .get_many(Query::expr(Filter::gt("balance", 15)).sort("owner", SortDirection::Asc))
        .await
        .unwrap();
    assert_eq!(found, vec![account("a2", "bob", 20)]);

    repo.update_one(
        Query::<Account>::expr(Filter::eq("owner", "alice")).with_update(Update::new().set("balance", 11_i64)),
        UpdateOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(repo.get("a1").await.unwrap().unwrap().balance, 11);

    let names: Vec<String> = store
        .list_indexes("accounts")
        .await
        .unwrap()
        .iter()
        .map(IndexModel::index_name)
        .collect();
    assert!(names.contains(&"owner_unique".to_string()));
    assert!(!names.contains(&"reference_id_1".to_string()));
    assert!(matches!(repo.insert(&account("a3", "alice", 1)).await, Err(DocumentStoreError::Backend(_))));
}

/// Stores `owner` as `o` and limits every read to alice's accounts.
struct AliceOnly;

impl Interceptor for AliceOnly {
    fn map_fields(&self, _collection: &str, mapping: &mut FieldMapping) {
        mapping.map("owner", "o");
    }

    fn before_find(&self, _ctx: &HookContext<'_>, filter: &mut BsonDocument, _options: &mut FindOptions) -> DocumentStoreResult<()> {
        filter.insert("owner", "alice");
        Ok(())
    }

    fn before_aggregate(
        &self,
        _ctx: &HookContext<'_>,
        pipeline: &mut Vec<BsonDocument>,
        _options: &mut AggregateOptions,
    ) -> DocumentStoreResult<()> {
        pipeline.insert(0, doc! { "$match": { "owner": "alice" } });
        Ok(())
    }
}

#[tokio::test]
async fn aggregations_see_logical_names_under_field_mapping() {
    let store = memory_store().await;
    let repo = Context::builder(store.clone())
        .with_interceptor(AliceOnly)
        .build()
        .await
        .unwrap()
        .repository::<Account>()
        .build()
        .await
        .unwrap();

    repo.insert_many(&[account("a1", "alice", 10), account("a2", "bob", 20), account("a3", "alice", 30)])
        .await
        .unwrap();

    let found: Vec<Account> = repo.get_many(Query::all()).await.unwrap();
    assert_eq!(found.len(), 2);

    let aggregated: Vec<Account> = repo
        .aggregate(Query::all().sort("owner", SortDirection::Asc).sort("balance", SortDirection::Desc))
        .await
        .unwrap();
    assert_eq!(aggregated, vec![account("a3", "alice", 30), account("a1", "alice", 10)]);

    let page = repo
        .paginate(Query::<Account>::expr(Filter::eq("owner", "alice")), PageRequest::new(1, 10))
        .await
        .unwrap();
    assert_eq!(page.row_count(), found.len() as u64);
    assert!(page.items().iter().all(|a: &Account| a.owner == "alice"));

    let facet = repo.aggregate_facet(Query::<Account>::all(), 1, 1).await.unwrap();
    assert_eq!(facet.row_count(), 2);
    assert_eq!(facet.items().len(), 1);
}

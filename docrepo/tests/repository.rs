mod common;

use common::{Account, account, context, memory_store, seed};
use docrepo::{
    bson::{Bson, doc},
    memory::InMemoryStore,
    prelude::*,
};
use futures::TryStreamExt;
use serde::Deserialize;

async fn accounts(store: &InMemoryStore) -> Repository<Account, InMemoryStore> {
    context(store).await.repository::<Account>().build().await.unwrap()
}

#[tokio::test]
async fn inserted_documents_can_be_read_back() {
    let store = memory_store().await;
    let repo = accounts(&store).await;

    let outcome = repo.insert(&account("a1", "alice", 100)).await.unwrap();

    assert_eq!(outcome, WriteOutcome::Acknowledged(1));
    assert_eq!(repo.get("a1").await.unwrap(), Some(account("a1", "alice", 100)));
    assert_eq!(repo.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn documents_without_identity_are_skipped() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    let mut anonymous = account("unused", "nobody", 0);
    anonymous.id = None;

    let outcome = repo.insert(&anonymous).await.unwrap();
    assert_eq!(outcome.count(), 0);

    let outcome = repo
        .insert_many(&[anonymous.clone(), account("a1", "alice", 1)])
        .await
        .unwrap();
    assert_eq!(outcome.count(), 1);

    assert_eq!(repo.replace(&anonymous, true).await.unwrap().count(), 0);
    assert_eq!(repo.delete(&anonymous).await.unwrap().count(), 0);
    assert_eq!(repo.count(Query::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_identities_are_rejected() {
    let store = memory_store().await;
    let repo = accounts(&store).await;

    repo.insert(&account("a1", "alice", 1)).await.unwrap();
    let err = repo.insert(&account("a1", "alice", 2)).await.unwrap_err();

    assert!(matches!(err, DocumentStoreError::DocumentAlreadyExists(id, collection) if id.contains("a1") && collection == "accounts"));
}

#[tokio::test]
async fn bulk_writes_count_every_touched_document() {
    let store = memory_store().await;
    let repo = accounts(&store).await;

    let mut models: Vec<WriteModel> = ["a1", "a2", "a3"]
        .into_iter()
        .map(|id| WriteModel::InsertOne { document: account(id, "alice", 10).to_document().unwrap() })
        .collect();
    models.push(WriteModel::UpdateOne {
        filter: doc! { "_id": "a2" },
        update: UpdateDefinition::Operators(doc! { "$inc": { "balance": 5 } }),
        options: UpdateOptions::default(),
    });

    let outcome = repo
        .bulk_write(models, BulkWriteOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.count(), 5);
    assert_eq!(repo.get("a2").await.unwrap().unwrap().balance, 15);
}

#[tokio::test]
async fn bulk_writes_mix_inserts_and_deletes() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&[account("old1", "zed", 0), account("old2", "zed", 0)])
        .await
        .unwrap();

    let mut models: Vec<WriteModel> = ["a1", "a2", "a3"]
        .into_iter()
        .map(|id| WriteModel::InsertOne { document: account(id, "alice", 10).to_document().unwrap() })
        .collect();
    models.push(WriteModel::DeleteMany { filter: doc! { "owner": "zed" } });

    let outcome = repo
        .bulk_write(models, BulkWriteOptions { ordered: false })
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Acknowledged(5));
    assert_eq!(repo.count(Query::all()).await.unwrap(), 3);
}

#[tokio::test]
async fn unacknowledged_writes_report_no_count() {
    let store = InMemoryStore::builder()
        .with_acknowledged_writes(false)
        .build()
        .await
        .unwrap();
    let repo = accounts(&store).await;

    let outcome = repo.insert(&account("a1", "alice", 1)).await.unwrap();

    assert!(!outcome.is_acknowledged());
    assert_eq!(outcome.count(), -1);
}

#[tokio::test]
async fn single_reads_enforce_cardinality() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&[account("a1", "bob", 1), account("a2", "bob", 2), account("a3", "carol", 3)])
        .await
        .unwrap();

    let bobs = || Query::<Account>::expr(Filter::eq("owner", "bob"));

    assert!(matches!(repo.get_single(bobs()).await, Err(DocumentStoreError::MoreThanOneResult(c)) if c == "accounts"));
    assert!(repo.first_or_default(bobs()).await.unwrap().is_some());
    assert_eq!(
        repo.get_single(Query::expr(Filter::eq("owner", "carol")))
            .await
            .unwrap()
            .map(|found: Account| found.balance),
        Some(3)
    );
    assert_eq!(repo.get_single(Query::<Account>::expr(Filter::eq("owner", "dave"))).await.unwrap(), None);
    assert!(matches!(
        repo.get_one(Query::<Account>::expr(Filter::eq("owner", "dave"))).await,
        Err(DocumentStoreError::DocumentNotFound(_, collection)) if collection == "accounts"
    ));
}

#[tokio::test]
async fn queries_filter_sort_and_limit() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&(1..=6).map(|n| account(&format!("a{n}"), "alice", n * 100)).collect::<Vec<_>>())
        .await
        .unwrap();

    let rich: Vec<Account> = repo
        .get_many(
            Query::expr(Filter::gte("balance", 300))
                .sort("balance", SortDirection::Desc)
                .skip(1)
                .limit(2),
        )
        .await
        .unwrap();

    assert_eq!(rich.iter().map(|a| a.balance).collect::<Vec<_>>(), vec![500, 400]);
    assert_eq!(repo.count(Query::expr(Filter::lt("balance", 300))).await.unwrap(), 2);
    assert_eq!(repo.count(Query::raw(r#"{ "balance": { "$gt": 450 } }"#).unwrap()).await.unwrap(), 2);
}

#[tokio::test]
async fn constrained_queries_must_be_completed() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert(&account("a1", "alice", 100)).await.unwrap();

    let same_owner = Query::<Account>::constrained(|other: &Account| Filter::eq("owner", other.owner.clone()));

    assert!(matches!(
        repo.get_many::<Account>(same_owner.clone()).await,
        Err(DocumentStoreError::IncompleteExpression(_))
    ));

    let found: Vec<Account> = repo
        .get_many(same_owner.complete(&account("x", "alice", 0)))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[derive(Debug, Deserialize, PartialEq)]
struct OwnerOnly {
    owner: String,
}

#[tokio::test]
async fn projections_read_into_narrower_types() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert(&account("a1", "alice", 100)).await.unwrap();

    let owners: Vec<OwnerOnly> = repo
        .get_many(Query::<Account, OwnerOnly>::all().project(doc! { "_id": 0, "owner": 1 }))
        .await
        .unwrap();

    assert_eq!(owners, vec![OwnerOnly { owner: "alice".to_string() }]);
}

#[tokio::test]
async fn updates_apply_attached_definitions() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&[account("a1", "bob", 10), account("a2", "bob", 20)])
        .await
        .unwrap();

    let bobs = || Query::<Account>::expr(Filter::eq("owner", "bob"));

    let outcome = repo
        .update_many(bobs().with_update(Update::new().inc("balance", 1)), UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.count(), 4);

    assert!(matches!(
        repo.update_one(bobs(), UpdateOptions::default()).await,
        Err(DocumentStoreError::InvalidQuery(_))
    ));

    let updated = repo
        .find_one_and_update(
            Query::<Account>::expr(Filter::eq("_id", "a1")).with_update(Update::new().set("owner", "alice")),
            FindOneAndUpdateOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!((updated.owner.as_str(), updated.balance), ("alice", 11));

    let before = repo
        .find_one_and_update(
            Query::<Account>::expr(Filter::eq("_id", "a2")).with_update(Update::new().inc("balance", 100)),
            FindOneAndUpdateOptions { return_document: ReturnDocument::Before, ..Default::default() },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.balance, 21);
    assert_eq!(repo.get("a2").await.unwrap().unwrap().balance, 121);
}

#[tokio::test]
async fn find_single_and_update_refuses_ambiguous_matches() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&[account("a1", "bob", 10), account("a2", "bob", 20)])
        .await
        .unwrap();

    let result = repo
        .find_single_and_update(
            Query::<Account>::expr(Filter::eq("owner", "bob")).with_update(Update::new().inc("balance", 1)),
            FindOneAndUpdateOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(DocumentStoreError::MoreThanOneResult(_))));
    assert_eq!(repo.get("a1").await.unwrap().unwrap().balance, 10);
}

#[tokio::test]
async fn find_single_and_update_writes_the_only_match() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&[account("a1", "alice", 10), account("a2", "bob", 20)])
        .await
        .unwrap();

    let updated: Option<Account> = repo
        .find_single_and_update(
            Query::expr(Filter::eq("owner", "bob")).with_update(Update::new().inc("balance", 1)),
            FindOneAndUpdateOptions { return_document: ReturnDocument::After, ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(updated, Some(account("a2", "bob", 21)));
    assert_eq!(repo.get("a1").await.unwrap().unwrap().balance, 10);

    let upserted: Option<Account> = repo
        .find_single_and_update(
            Query::expr(Filter::eq("_id", "a3")).with_update(Update::new().set("owner", "carol").set("balance", 3_i64).set("deleted", false)),
            FindOneAndUpdateOptions { upsert: true, return_document: ReturnDocument::After, ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(upserted, Some(account("a3", "carol", 3)));
}

#[tokio::test]
async fn replace_and_delete_by_identity() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert(&account("a1", "alice", 10)).await.unwrap();

    let outcome = repo.replace(&account("a1", "alice", 99), false).await.unwrap();
    assert_eq!(outcome.count(), 2);
    assert_eq!(repo.get("a1").await.unwrap().unwrap().balance, 99);

    assert_eq!(repo.replace(&account("a2", "bob", 5), false).await.unwrap().count(), 0);
    repo.replace(&account("a2", "bob", 5), true).await.unwrap();
    assert!(repo.get("a2").await.unwrap().is_some());

    assert_eq!(repo.delete_by_id("a1").await.unwrap().count(), 1);
    assert_eq!(repo.delete(&account("a2", "bob", 5)).await.unwrap().count(), 1);
    assert_eq!(repo.delete_many(Query::all()).await.unwrap().count(), 0);
}

#[tokio::test]
async fn aggregate_streams_results_lazily() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    repo.insert_many(&(1..=5).map(|n| account(&format!("a{n}"), "alice", n)).collect::<Vec<_>>())
        .await
        .unwrap();

    let stream = repo
        .aggregate_stream(Query::<Account>::expr(Filter::gt("balance", 1)).sort("balance", SortDirection::Desc))
        .await
        .unwrap();
    let balances: Vec<i64> = stream
        .map_ok(|account: Account| account.balance)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(balances, vec![5, 4, 3, 2]);

    let totals: Vec<docrepo::bson::Document> = repo
        .aggregate(Query::<Account, docrepo::bson::Document>::all().with_pipeline([doc! { "$count": "n" }]))
        .await
        .unwrap();
    assert_eq!(totals, vec![doc! { "n": 5 }]);
}

#[tokio::test]
async fn cancelled_repositories_stop_before_the_store() {
    let store = memory_store().await;
    let token = CancellationToken::new();
    let repo = context(&store)
        .await
        .repository::<Account>()
        .with_cancellation(token.clone())
        .build()
        .await
        .unwrap();

    repo.insert(&account("a1", "alice", 1)).await.unwrap();
    token.cancel();

    assert!(matches!(repo.insert(&account("a2", "bob", 1)).await, Err(DocumentStoreError::Cancelled)));
    assert!(matches!(repo.get_many::<Account>(Query::all()).await, Err(DocumentStoreError::Cancelled)));
    assert_eq!(store.snapshot("accounts").await.len(), 1);
}

#[tokio::test]
async fn call_scoped_cancellation_leaves_the_repository_usable() {
    let store = memory_store().await;
    let repo = accounts(&store).await;
    let token = CancellationToken::new();
    token.cancel();

    let result = repo.cancellable(token).insert(&account("a1", "alice", 1)).await;

    assert!(matches!(result, Err(DocumentStoreError::Cancelled)));
    assert!(store.snapshot("accounts").await.is_empty());

    repo.insert(&account("a2", "bob", 2)).await.unwrap();
    let live = repo.cancellable(CancellationToken::new());
    assert_eq!(live.count(Query::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn conventional_indexes_are_created_with_the_collection() {
    let store = memory_store().await;
    let repo = accounts(&store).await;

    let names: Vec<String> = store
        .list_indexes("accounts")
        .await
        .unwrap()
        .iter()
        .map(IndexModel::index_name)
        .collect();

    assert!(repo.metadata().indexes_ensured());
    assert!(names.contains(&"reference_id_1".to_string()));
    assert!(names.contains(&"tenant_id_1_deleted_1".to_string()));

    let mut first = account("a1", "alice", 1);
    first.reference_id = Some("ext-1".to_string());
    let mut second = account("a2", "bob", 1);
    second.reference_id = Some("ext-1".to_string());

    repo.insert(&first).await.unwrap();
    assert!(matches!(repo.insert(&second).await, Err(DocumentStoreError::Backend(_))));
    repo.insert(&account("a3", "carol", 1)).await.unwrap();
    repo.insert(&account("a4", "dave", 1)).await.unwrap();
}

#[tokio::test]
async fn index_failures_follow_the_configuration() {
    let duplicates = || {
        vec![
            doc! { "_id": "a1", "owner": "alice", "balance": 1, "reference_id": "dup" },
            doc! { "_id": "a2", "owner": "bob", "balance": 1, "reference_id": "dup" },
        ]
    };

    let strict = memory_store().await;
    seed(&strict, "accounts", duplicates()).await;
    let result = Context::builder(strict.clone())
        .with_throw_on_index_error(true)
        .build()
        .await
        .unwrap()
        .repository::<Account>()
        .build()
        .await;
    assert!(matches!(result, Err(DocumentStoreError::Index(message)) if message.contains("reference_id_1")));

    let lenient = memory_store().await;
    seed(&lenient, "accounts", duplicates()).await;
    let repo = accounts(&lenient).await;
    assert!(!repo.metadata().indexes_ensured());
    assert!(!repo.ensure_indexes().await.unwrap());
    assert_eq!(repo.count(Query::all()).await.unwrap(), 2);
}

#[tokio::test]
async fn collections_can_be_renamed_per_repository() {
    let store = memory_store().await;
    let repo = context(&store)
        .await
        .repository::<Account>()
        .with_collection_name("archived_accounts")
        .build()
        .await
        .unwrap();

    repo.insert(&account("a1", "alice", 1)).await.unwrap();

    assert_eq!(repo.collection_name(), "archived_accounts");
    assert!(repo.context().has_collection("archived_accounts"));
    assert_eq!(store.snapshot("archived_accounts").await.len(), 1);
    assert!(store.snapshot("accounts").await.is_empty());
    assert_eq!(
        store.snapshot("archived_accounts").await[0].get("balance"),
        Some(&Bson::Int64(1))
    );
}

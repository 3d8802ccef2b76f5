mod common;

use common::{Account, account, context, memory_store};
use docrepo::{memory::StoreStats, prelude::*};

#[tokio::test]
async fn forced_transactions_reuse_one_session_until_commit() {
    let store = memory_store().await;
    let context = context(&store).await;
    let forced = context
        .repository::<Account>()
        .with_force_transaction(Some(true))
        .build()
        .await
        .unwrap();
    let plain = context.repository::<Account>().build().await.unwrap();

    forced.insert(&account("a1", "alice", 1)).await.unwrap();
    forced.insert(&account("a2", "bob", 2)).await.unwrap();

    assert_eq!(
        store.stats(),
        StoreStats { sessions_started: 1, transactions_started: 1, ..Default::default() }
    );
    assert!(forced.dedicated_session().await.unwrap().in_transaction());
    assert!(forced.get("a1").await.unwrap().is_some());
    assert!(plain.get("a1").await.unwrap().is_none());
    assert!(store.snapshot("accounts").await.is_empty());

    forced.commit_transaction().await.unwrap();

    assert_eq!(store.snapshot("accounts").await.len(), 2);
    assert!(plain.get("a1").await.unwrap().is_some());
    assert_eq!(
        store.stats(),
        StoreStats { sessions_started: 2, sessions_ended: 1, transactions_started: 1, commits: 1, aborts: 0 }
    );

    let replacement = forced.dedicated_session().await.unwrap();
    assert!(!replacement.in_transaction());

    forced.insert(&account("a3", "carol", 3)).await.unwrap();
    assert_eq!(forced.dedicated_session().await.unwrap().id(), replacement.id());
    assert_eq!(store.stats().transactions_started, 2);
}

#[tokio::test]
async fn aborted_transactions_discard_their_writes() {
    let store = memory_store().await;
    let context = context(&store).await;
    let forced = context
        .repository::<Account>()
        .with_force_transaction(Some(true))
        .build()
        .await
        .unwrap();

    forced.insert(&account("a1", "alice", 1)).await.unwrap();
    forced.abort_transaction().await.unwrap();

    assert_eq!(forced.count(Query::all()).await.unwrap(), 0);
    assert_eq!(store.stats().aborts, 1);
}

#[tokio::test]
async fn finishing_without_a_transaction_fails() {
    let store = memory_store().await;
    let context = context(&store).await;
    let plain = context.repository::<Account>().build().await.unwrap();

    plain.insert(&account("a1", "alice", 1)).await.unwrap();

    assert!(matches!(plain.commit_transaction().await, Err(DocumentStoreError::NoActiveTransaction)));
    assert!(matches!(plain.abort_transaction().await, Err(DocumentStoreError::NoActiveTransaction)));
    assert!(matches!(context.commit_transaction().await, Err(DocumentStoreError::NoActiveTransaction)));
    assert!(plain.dedicated_session().await.is_none());
    assert_eq!(store.stats(), StoreStats::default());
}

#[tokio::test]
async fn closing_aborts_the_open_transaction() {
    let store = memory_store().await;
    let context = context(&store).await;
    let forced = context
        .repository::<Account>()
        .with_force_transaction(Some(true))
        .build()
        .await
        .unwrap();

    forced.insert(&account("a1", "alice", 1)).await.unwrap();
    forced.close().await.unwrap();

    assert!(forced.dedicated_session().await.is_none());
    assert_eq!(store.active_sessions().await, 0);
    assert_eq!(store.stats().aborts, 1);
    assert!(store.snapshot("accounts").await.is_empty());
}

#[tokio::test]
async fn ambient_transactions_span_repositories() {
    let store = memory_store().await;
    let context = Context::builder(store.clone())
        .with_ambient_transactions(true)
        .build()
        .await
        .unwrap();
    let accounts = context.repository::<Account>().build().await.unwrap();
    let archive = context
        .repository::<Account>()
        .with_collection_name("archive")
        .build()
        .await
        .unwrap();

    accounts.insert(&account("a1", "alice", 1)).await.unwrap();
    archive.insert(&account("a2", "bob", 2)).await.unwrap();

    let ambient = context.ambient_session().await.unwrap();
    assert!(ambient.in_transaction());
    assert_eq!(store.stats().sessions_started, 1);
    assert_eq!(store.stats().transactions_started, 1);
    assert!(store.snapshot("accounts").await.is_empty());

    context.commit_transaction().await.unwrap();

    assert!(context.ambient_session().await.is_none());
    assert_eq!(store.snapshot("accounts").await.len(), 1);
    assert_eq!(store.snapshot("archive").await.len(), 1);

    accounts.insert(&account("a3", "carol", 3)).await.unwrap();
    context.abort_transaction().await.unwrap();

    assert_eq!(
        store.stats(),
        StoreStats { sessions_started: 2, sessions_ended: 2, transactions_started: 2, commits: 1, aborts: 1 }
    );
    assert_eq!(store.snapshot("accounts").await.len(), 1);
}

#[tokio::test]
async fn forced_repositories_keep_apart_from_the_ambient_transaction() {
    let store = memory_store().await;
    let context = Context::builder(store.clone())
        .with_ambient_transactions(true)
        .build()
        .await
        .unwrap();
    let forced = context
        .repository::<Account>()
        .with_force_transaction(Some(true))
        .build()
        .await
        .unwrap();
    let shared = context
        .repository::<Account>()
        .with_collection_name("archive")
        .build()
        .await
        .unwrap();

    forced.insert(&account("a1", "alice", 1)).await.unwrap();
    shared.insert(&account("a2", "bob", 2)).await.unwrap();

    let dedicated = forced.dedicated_session().await.unwrap();
    let ambient = context.ambient_session().await.unwrap();
    assert_ne!(dedicated.id(), ambient.id());

    forced.commit_transaction().await.unwrap();
    assert_eq!(store.snapshot("accounts").await.len(), 1);
    assert!(store.snapshot("archive").await.is_empty());

    context.commit_transaction().await.unwrap();
    assert_eq!(store.snapshot("archive").await.len(), 1);
}

#[tokio::test]
async fn explicit_context_transactions_are_idempotent() {
    let store = memory_store().await;
    let context = context(&store).await;

    let first = context.start_transaction().await.unwrap();
    let second = context.start_transaction().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.stats().transactions_started, 1);

    context.shutdown().await.unwrap();
    assert_eq!(store.stats().aborts, 1);
    assert_eq!(store.active_sessions().await, 0);
}

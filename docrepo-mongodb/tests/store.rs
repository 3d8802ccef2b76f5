use bson::{Document, doc};
use docrepo_core::backend::{
    AggregateOptions, BulkWriteOptions, CountOptions, CreateCollectionOptions, FindOptions, StoreBackend,
    StoreBackendBuilder, StoreCursor, WriteModel,
};
use docrepo_mongodb::MongoDbStore;

async fn store(collection: &str) -> MongoDbStore {
    let dsn = std::env::var("DOCREPO_MONGODB_URL").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let store = MongoDbStore::builder(&dsn, "docrepo_test").build().await.unwrap();

    store
        .client()
        .database("docrepo_test")
        .collection::<Document>(collection)
        .drop()
        .await
        .unwrap();
    store
        .create_collection(collection, CreateCollectionOptions::default())
        .await
        .unwrap();

    store
}

async fn drain(mut cursor: Box<dyn StoreCursor>) -> Vec<Document> {
    let mut documents = Vec::new();
    while let Some(batch) = cursor.next_batch().await.unwrap() {
        documents.extend(batch);
    }
    documents
}

#[tokio::test]
#[ignore = "requires a MongoDB server at DOCREPO_MONGODB_URL"]
async fn reads_and_bulk_writes_round_trip() {
    let store = store("accounts").await;

    let models = (0..3)
        .map(|n| WriteModel::InsertOne { document: doc! { "_id": n, "balance": n * 10 } })
        .chain([WriteModel::DeleteOne { filter: doc! { "_id": 0 } }])
        .collect();
    let written = store
        .bulk_write("accounts", models, BulkWriteOptions::default(), None)
        .await
        .unwrap();
    assert_eq!((written.inserted, written.deleted), (3, 1));
    assert!(written.acknowledged);

    let options = FindOptions { sort: Some(doc! { "_id": -1 }), batch_size: Some(1), ..Default::default() };
    let found = drain(store.find("accounts", doc! {}, options, None).await.unwrap()).await;
    assert_eq!(found, vec![doc! { "_id": 2, "balance": 20 }, doc! { "_id": 1, "balance": 10 }]);

    let totals = drain(
        store
            .aggregate("accounts", vec![doc! { "$count": "n" }], AggregateOptions::default(), None)
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(totals, vec![doc! { "n": 2 }]);

    let count = store
        .count("accounts", doc! { "balance": { "$gt": 15 } }, CountOptions::default(), None)
        .await
        .unwrap();
    assert_eq!(count, 1);

    store.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a MongoDB replica set at DOCREPO_MONGODB_URL"]
async fn session_cursors_read_uncommitted_transaction_writes() {
    let store = store("ledger").await;
    let session = store.start_session().await.unwrap();
    store.start_transaction(&session).await.unwrap();

    store
        .bulk_write(
            "ledger",
            vec![WriteModel::InsertOne { document: doc! { "_id": 1 } }],
            BulkWriteOptions::default(),
            Some(&session),
        )
        .await
        .unwrap();

    let inside = drain(store.find("ledger", doc! {}, FindOptions::default(), Some(&session)).await.unwrap()).await;
    let outside = store.count("ledger", doc! {}, CountOptions::default(), None).await.unwrap();
    assert_eq!((inside.len(), outside), (1, 0));

    store.abort_transaction(&session).await.unwrap();
    store.end_session(session).await.unwrap();
    store.shutdown().await.unwrap();
}

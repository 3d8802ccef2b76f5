//! Per-collection metadata and its process-wide registry.
//!
//! Metadata (declared indexes and the logical-to-wire field mapping) is built
//! once per process for every `(interceptor type, database, connection)` key and
//! collection, then shared through an [`Arc`]. Two contexts that target
//! different databases or connections never share an entry.

use bson::{Bson, Document};
use parking_lot::Mutex;
use std::{
    any::TypeId,
    collections::HashMap,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::backend::IndexModel;

const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Maps logical field names to the names stored on the wire.
///
/// Paths are rewritten when they match exactly or when their first segment
/// matches (`address.city` with `address -> addr` becomes `addr.city`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    fields: HashMap<String, String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping.
    pub fn map(&mut self, logical: impl Into<String>, wire: impl Into<String>) -> &mut Self {
        self.fields.insert(logical.into(), wire.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Wire name of a logical path.
    pub fn wire_path(&self, path: &str) -> String {
        if let Some(wire) = self.fields.get(path) {
            return wire.clone();
        }

        match path.split_once('.') {
            Some((head, rest)) => match self.fields.get(head) {
                Some(wire) => format!("{wire}.{rest}"),
                None => path.to_string(),
            },
            None => path.to_string(),
        }
    }

    /// Rewrites the field names of a filter, descending into `$and`, `$or` and `$nor`.
    pub fn apply_to_filter(&self, filter: &Document) -> Document {
        filter
            .iter()
            .map(|(key, value)| {
                if LOGICAL_OPERATORS.contains(&key.as_str()) {
                    let value = match value {
                        Bson::Array(clauses) => Bson::Array(
                            clauses
                                .iter()
                                .map(|clause| match clause {
                                    Bson::Document(clause) => Bson::Document(self.apply_to_filter(clause)),
                                    other => other.clone(),
                                })
                                .collect(),
                        ),
                        other => other.clone(),
                    };
                    (key.clone(), value)
                } else if key.starts_with('$') {
                    (key.clone(), value.clone())
                } else {
                    (self.wire_path(key), value.clone())
                }
            })
            .collect()
    }

    /// Rewrites the keys of a sort or projection document.
    pub fn apply_to_keys(&self, document: &Document) -> Document {
        document
            .iter()
            .map(|(key, value)| (self.wire_path(key), value.clone()))
            .collect()
    }

    /// Rewrites the field names of `$match`, `$sort` and `$project` stages,
    /// descending into the branches of `$facet`. Other stages pass through.
    pub fn apply_to_pipeline(&self, pipeline: Vec<Document>) -> Vec<Document> {
        if self.is_empty() {
            return pipeline;
        }

        pipeline
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .map(|(name, body)| {
                        let body = match (name.as_str(), body) {
                            ("$match", Bson::Document(filter)) => Bson::Document(self.apply_to_filter(&filter)),
                            ("$sort" | "$project", Bson::Document(keys)) => Bson::Document(self.apply_to_keys(&keys)),
                            ("$facet", Bson::Document(branches)) => Bson::Document(
                                branches
                                    .into_iter()
                                    .map(|(branch, stages)| match stages {
                                        Bson::Array(stages) => {
                                            let stages = stages
                                                .into_iter()
                                                .filter_map(|stage| match stage {
                                                    Bson::Document(stage) => Some(stage),
                                                    _ => None,
                                                })
                                                .collect();
                                            let mapped = self.apply_to_pipeline(stages);
                                            (branch, Bson::Array(mapped.into_iter().map(Bson::Document).collect()))
                                        }
                                        other => (branch, other),
                                    })
                                    .collect(),
                            ),
                            (_, body) => body,
                        };
                        (name, body)
                    })
                    .collect()
            })
            .collect()
    }

    /// Rewrites the field names inside each operator of an update document.
    ///
    /// `$rename` targets are mapped as well.
    pub fn apply_to_update(&self, update: &Document) -> Document {
        update
            .iter()
            .map(|(operator, fields)| {
                let fields = match fields {
                    Bson::Document(fields) => Bson::Document(
                        fields
                            .iter()
                            .map(|(field, value)| {
                                let value = match (operator.as_str(), value) {
                                    ("$rename", Bson::String(target)) => Bson::String(self.wire_path(target)),
                                    _ => value.clone(),
                                };
                                (self.wire_path(field), value)
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                (operator.clone(), fields)
            })
            .collect()
    }

    /// Rewrites the top-level keys of a document being written.
    pub fn apply_to_document(&self, document: Document) -> Document {
        if self.is_empty() {
            return document;
        }

        document
            .into_iter()
            .map(|(key, value)| match self.fields.get(&key) {
                Some(wire) => (wire.clone(), value),
                None => (key, value),
            })
            .collect()
    }

    /// Restores logical names on the top-level keys of a document read back.
    pub fn restore_document(&self, document: Document) -> Document {
        if self.is_empty() {
            return document;
        }

        document
            .into_iter()
            .map(|(key, value)| {
                match self.fields.iter().find(|(_, wire)| **wire == key) {
                    Some((logical, _)) => (logical.clone(), value),
                    None => (key, value),
                }
            })
            .collect()
    }
}

/// Metadata of one collection.
#[derive(Debug)]
pub struct CollectionMetadata {
    collection: String,
    indexes: Vec<IndexModel>,
    fields: FieldMapping,
    indexes_ensured: AtomicBool,
}

impl CollectionMetadata {
    pub fn new(collection: impl Into<String>, indexes: Vec<IndexModel>, fields: FieldMapping) -> Self {
        Self {
            collection: collection.into(),
            indexes,
            fields,
            indexes_ensured: AtomicBool::new(false),
        }
    }

    /// Name of the collection this metadata describes.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The declared index set.
    pub fn indexes(&self) -> &[IndexModel] {
        &self.indexes
    }

    /// Logical-to-wire field mapping built by the interceptor.
    pub fn fields(&self) -> &FieldMapping {
        &self.fields
    }

    /// Whether every declared index was created successfully in this process.
    pub fn indexes_ensured(&self) -> bool {
        self.indexes_ensured.load(Ordering::Acquire)
    }

    pub(crate) fn mark_indexes_ensured(&self) {
        self.indexes_ensured.store(true, Ordering::Release);
    }
}

/// Identifies one logical backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataKey {
    owner: TypeId,
    database: String,
    connection: u64,
}

impl MetadataKey {
    /// Key for an interceptor type, a database and a connection fingerprint.
    pub fn new(owner: TypeId, database: impl Into<String>, connection: u64) -> Self {
        Self { owner, database: database.into(), connection }
    }
}

/// Registry of collection metadata.
///
/// Entries are built under the registry lock on first request and never
/// replaced; callers keep the returned [`Arc`] and read it without locking.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entries: Mutex<HashMap<MetadataKey, HashMap<String, Arc<CollectionMetadata>>>>,
}

static GLOBAL_REGISTRY: LazyLock<MetadataRegistry> = LazyLock::new(MetadataRegistry::new);

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static MetadataRegistry {
        &GLOBAL_REGISTRY
    }

    /// Returns the entry for `collection`, building it with `build` on first use.
    pub fn get_or_build<F>(&self, key: &MetadataKey, collection: &str, build: F) -> Arc<CollectionMetadata>
    where
        F: FnOnce() -> CollectionMetadata,
    {
        let mut entries = self.entries.lock();
        let collections = entries.entry(key.clone()).or_default();

        match collections.get(collection) {
            Some(metadata) => Arc::clone(metadata),
            None => {
                let metadata = Arc::new(build());
                collections.insert(collection.to_string(), Arc::clone(&metadata));
                metadata
            }
        }
    }

    /// Returns the entry without building it.
    pub fn get(&self, key: &MetadataKey, collection: &str) -> Option<Arc<CollectionMetadata>> {
        self.entries
            .lock()
            .get(key)
            .and_then(|collections| collections.get(collection))
            .cloned()
    }

    /// Number of collection entries across all keys.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::cell::Cell;

    struct OwnerA;
    struct OwnerB;

    #[test]
    fn entries_are_built_once_per_key_and_collection() {
        let registry = MetadataRegistry::new();
        let key = MetadataKey::new(TypeId::of::<OwnerA>(), "app", 7);
        let builds = Cell::new(0);

        let build = || {
            builds.set(builds.get() + 1);
            CollectionMetadata::new("users", vec![IndexModel::ascending("email")], FieldMapping::new())
        };

        let first = registry.get_or_build(&key, "users", build);
        let second = registry.get_or_build(&key, "users", || unreachable!());

        assert_eq!(builds.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.indexes().len(), 1);
    }

    #[test]
    fn keys_separate_owners_databases_and_connections() {
        let registry = MetadataRegistry::new();
        let keys = [
            MetadataKey::new(TypeId::of::<OwnerA>(), "app", 1),
            MetadataKey::new(TypeId::of::<OwnerB>(), "app", 1),
            MetadataKey::new(TypeId::of::<OwnerA>(), "other", 1),
            MetadataKey::new(TypeId::of::<OwnerA>(), "app", 2),
        ];

        for key in &keys {
            registry.get_or_build(key, "users", || CollectionMetadata::new("users", Vec::new(), FieldMapping::new()));
        }

        assert_eq!(registry.len(), 4);
        assert!(registry.get(&keys[0], "orders").is_none());
    }

    #[test]
    fn mapping_rewrites_filters_updates_and_documents() {
        let mut mapping = FieldMapping::new();
        mapping.map("name", "n").map("address", "addr");

        assert_eq!(
            mapping.apply_to_filter(&doc! { "$or": [{ "name": "a" }, { "address.city": "b" }], "age": 3 }),
            doc! { "$or": [{ "n": "a" }, { "addr.city": "b" }], "age": 3 }
        );
        assert_eq!(
            mapping.apply_to_update(&doc! { "$set": { "name": "x" }, "$rename": { "age": "name" } }),
            doc! { "$set": { "n": "x" }, "$rename": { "age": "n" } }
        );

        assert_eq!(
            mapping.apply_to_pipeline(vec![
                doc! { "$match": { "name": "a" } },
                doc! { "$facet": {
                    "result": [{ "$sort": { "address.city": 1 } }, { "$project": { "name": 1 } }],
                    "total": [{ "$count": "count" }],
                } },
                doc! { "$unset": "name" },
            ]),
            vec![
                doc! { "$match": { "n": "a" } },
                doc! { "$facet": {
                    "result": [{ "$sort": { "addr.city": 1 } }, { "$project": { "n": 1 } }],
                    "total": [{ "$count": "count" }],
                } },
                doc! { "$unset": "name" },
            ]
        );

        let stored = mapping.apply_to_document(doc! { "_id": 1, "name": "x" });
        assert_eq!(stored, doc! { "_id": 1, "n": "x" });
        assert_eq!(mapping.restore_document(stored), doc! { "_id": 1, "name": "x" });
    }
}

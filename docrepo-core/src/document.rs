//! Core traits for document representation and serialization.
//!
//! This module provides the trait every stored document implements, as well as
//! utilities for converting documents between their typed form and BSON.

use bson::{Bson, Document as BsonDocument, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// Name of the wire field holding a document's identity.
pub const ID_FIELD: &str = "_id";

/// Core trait that all documents stored through a repository must implement.
///
/// Every document has an identity (stored in the `_id` wire field) that may be
/// unset before the document is first persisted, and names the collection it
/// belongs to.
///
/// # Example
///
/// ```ignore
/// use docrepo::document::Document;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct User {
///     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
///     pub id: Option<String>,
///     pub name: String,
/// }
///
/// impl Document for User {
///     type Id = String;
///
///     fn id(&self) -> Option<&String> {
///         self.id.as_ref()
///     }
///
///     fn collection_name() -> &'static str {
///         "users"
///     }
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// The identity type, stored as BSON in the `_id` field.
    type Id: Into<Bson> + Clone + Send + Sync + Debug;

    /// Returns this document's identity, or `None` when it has not been assigned.
    fn id(&self) -> Option<&Self::Id>;

    /// Returns the default name of the collection this document belongs to.
    fn collection_name() -> &'static str;
}

/// Extension trait providing BSON conversion helpers for documents.
///
/// Automatically implemented for every [`Document`].
pub trait DocumentExt: Document {
    /// Returns the identity converted to BSON, if set.
    fn id_bson(&self) -> Option<Bson>;

    /// Serializes this document into a BSON document.
    ///
    /// # Errors
    ///
    /// Fails when serialization fails or the value does not serialize to a document.
    fn to_document(&self) -> DocumentStoreResult<BsonDocument>;

    /// Builds a typed document from its BSON form.
    fn from_document(document: BsonDocument) -> DocumentStoreResult<Self>;
}

impl<D: Document> DocumentExt for D {
    fn id_bson(&self) -> Option<Bson> {
        self.id().cloned().map(Into::into)
    }

    fn to_document(&self) -> DocumentStoreResult<BsonDocument> {
        into_document(serialize_to_bson(self)?)
    }

    fn from_document(document: BsonDocument) -> DocumentStoreResult<Self> {
        Ok(deserialize_from_bson(Bson::Document(document))?)
    }
}

/// Serializes any value and requires the result to be a document.
pub fn to_bson_document<T: Serialize + ?Sized>(value: &T) -> DocumentStoreResult<BsonDocument> {
    into_document(serialize_to_bson(value)?)
}

/// Deserializes a BSON document into any owned type (documents or projections).
pub fn from_bson_document<T: DeserializeOwned>(document: BsonDocument) -> DocumentStoreResult<T> {
    Ok(deserialize_from_bson(Bson::Document(document))?)
}

fn into_document(bson: Bson) -> DocumentStoreResult<BsonDocument> {
    match bson {
        Bson::Document(document) => Ok(document),
        other => Err(DocumentStoreError::InvalidDocument(format!(
            "expected a document, found {:?}",
            other.element_type()
        ))),
    }
}

//! Error types and result types for repository operations.
//!
//! This module provides the error taxonomy shared by every layer of the workspace:
//! query/update construction, session management, interception hooks and the
//! storage backends. Use [`DocumentStoreResult<T>`] as the return type for fallible
//! operations.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a document store.
///
/// Precondition failures (`InvalidArgument`, `Conversion`, `IncompleteExpression`) are
/// raised before anything is sent to the store. Store faults are reported as
/// [`DocumentStoreError::Backend`] and propagated unchanged.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// The requested document was not found in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// The document violates schema constraints or has invalid structure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A caller supplied argument is out of range or malformed.
    #[error("Invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        argument: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Raw query or update text could not be converted into an instruction.
    #[error("Conversion error: {0}")]
    Conversion(String),
    /// A constrained (two-document) query was used before being completed.
    #[error("Expression requires a constant of type {0}; call `complete` first")]
    IncompleteExpression(String),
    /// The query does not carry a usable filter shape for the requested conversion.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// Single-result retrieval observed a second matching document.
    #[error("Sequence contains more than one result in collection {0}")]
    MoreThanOneResult(String),
    /// Commit or abort was requested without an active dedicated transaction.
    #[error("No active transaction")]
    NoActiveTransaction,
    /// An interception hook removed the document an operation requires.
    #[error("Operation produced no document for collection {0}")]
    NoDocument(String),
    /// The store returned a result whose shape violates the expected protocol.
    #[error("Unexpected result: {0}")]
    UnexpectedResult(String),
    /// Index provisioning failed.
    #[error("Index error: {0}")]
    Index(String),
    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
    /// An unknown error occurred.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl DocumentStoreError {
    /// Shorthand for building an [`DocumentStoreError::InvalidArgument`].
    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        DocumentStoreError::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for document store operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

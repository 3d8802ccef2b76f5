//! Context configuration.

use bson::doc;
use serde::{Deserialize, Serialize};

use crate::backend::IndexModel;

/// Settings shared by every repository of a context.
///
/// Deserializable so it can be loaded alongside application settings; missing
/// keys take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Run operations inside the context's shared transaction unless a
    /// repository forces its own.
    pub ambient_transactions: bool,
    /// Fail repository construction when an index cannot be created.
    pub throw_on_index_error: bool,
    /// Create missing collections when a repository is built.
    pub create_collections: bool,
    /// Cursor batch size requested from the backend.
    pub batch_size: u32,
    /// Field names used for the conventional index set.
    pub indexes: IndexConventions,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ambient_transactions: false,
            throw_on_index_error: false,
            create_collections: true,
            batch_size: 100,
            indexes: IndexConventions::default(),
        }
    }
}

/// Field names of the conventional index set; `None` disables an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConventions {
    /// External reference field, indexed unique and sparse.
    pub reference_field: Option<String>,
    /// Soft-delete flag field.
    pub soft_delete_field: Option<String>,
    /// Tenant scoping field.
    pub tenant_field: Option<String>,
}

impl Default for IndexConventions {
    fn default() -> Self {
        Self {
            reference_field: Some("reference_id".to_string()),
            soft_delete_field: Some("deleted".to_string()),
            tenant_field: Some("tenant_id".to_string()),
        }
    }
}

impl IndexConventions {
    /// Conventions that declare no index at all.
    pub fn none() -> Self {
        Self { reference_field: None, soft_delete_field: None, tenant_field: None }
    }

    /// The conventional index set.
    pub fn default_indexes(&self) -> Vec<IndexModel> {
        let mut indexes = Vec::new();

        if let Some(reference) = &self.reference_field {
            indexes.push(IndexModel::ascending(reference.as_str()).unique().sparse());
        }
        if let Some(deleted) = &self.soft_delete_field {
            indexes.push(IndexModel::ascending(deleted.as_str()));
        }
        if let Some(tenant) = &self.tenant_field {
            indexes.push(IndexModel::ascending(tenant.as_str()));
        }
        if let (Some(tenant), Some(deleted)) = (&self.tenant_field, &self.soft_delete_field) {
            indexes.push(IndexModel::new(doc! { tenant.as_str(): 1, deleted.as_str(): 1 }));
        }

        indexes
    }
}

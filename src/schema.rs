//! Host-declared entity metadata and schema introspection.
//!
//! The engine does not own any table definitions. The host object-relational
//! layer describes its owning entity and many-to-many associations with
//! [`OwnerSpec`] / [`AssociationDef`], and exposes what actually exists in the
//! datastore through [`SchemaIntrospector`]. Settings resolution uses the
//! introspector to disable counter fields whose columns are absent rather than
//! failing setup.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::TallyError;

/// Row identifier of an owning or related entity.
pub type EntityId = i64;

/// Parent pointer column of the nested-set hierarchy encoding.
pub const HIERARCHY_PARENT: &str = "parent_id";
/// Lower bound of a node's nested-set range.
pub const HIERARCHY_LEFT: &str = "lft";
/// Upper bound of a node's nested-set range.
pub const HIERARCHY_RIGHT: &str = "rght";

fn default_primary_key() -> String {
    "id".to_string()
}

/// Declaration of an owning entity type and its many-to-many associations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSpec {
    /// Singular name of the owning entity, e.g. `post`. Used to derive the
    /// default counter column names (`post_count`, `under_post_count`).
    pub name: String,
    /// Table holding the owning entities.
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    pub associations: Vec<AssociationDef>,
}

impl OwnerSpec {
    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }
}

/// One declared many-to-many association: the join relation and its two
/// foreign-key columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationDef {
    /// Association name, conventionally the plural of the related entity,
    /// e.g. `categories`.
    pub name: String,
    pub related_table: String,
    #[serde(default = "default_primary_key")]
    pub related_primary_key: String,
    pub join_table: String,
    /// Foreign-key column in the join table referencing the owning entity.
    pub owner_key: String,
    /// Foreign-key column in the join table referencing the related entity.
    pub related_key: String,
}

/// Read-only view of what the datastore schema actually contains.
///
/// Settings resolution consults this before enabling a counter field: a
/// declared column that does not exist disables that field, and the
/// hierarchical under-count additionally requires the nested-set columns
/// ([`HIERARCHY_PARENT`], [`HIERARCHY_LEFT`], [`HIERARCHY_RIGHT`]) on the
/// related table.
pub trait SchemaIntrospector: Sync {
    fn has_column(
        &self,
        table: &str,
        column: &str,
    ) -> impl Future<Output = Result<bool, TallyError>> + Send;

    fn hierarchy_columns_present(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<bool, TallyError>> + Send;
}

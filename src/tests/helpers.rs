//! Shared test utilities for settings and menu testing.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::TallyError,
    menu::HierarchyRow,
    schema::{AssociationDef, EntityId, OwnerSpec, SchemaIntrospector},
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// In-memory schema description standing in for a live database during
/// resolution tests.
#[derive(Debug, Default)]
pub struct MockIntrospector {
    columns: BTreeMap<String, BTreeSet<String>>,
    hierarchical: BTreeSet<String>,
}

impl MockIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
        self.columns.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn with_hierarchy(mut self, table: &str) -> Self {
        self.hierarchical.insert(table.to_string());
        self
    }
}

impl SchemaIntrospector for MockIntrospector {
    async fn has_column(&self, table: &str, column: &str) -> Result<bool, TallyError> {
        Ok(self
            .columns
            .get(table)
            .map(|cols| cols.contains(column))
            .unwrap_or(false))
    }

    async fn hierarchy_columns_present(&self, table: &str) -> Result<bool, TallyError> {
        Ok(self.hierarchical.contains(table))
    }
}

/// An owner spec with one hierarchical association (categories) and one flat
/// association (tags).
pub fn post_owner() -> OwnerSpec {
    OwnerSpec {
        name: "post".to_string(),
        table: "posts".to_string(),
        primary_key: "id".to_string(),
        associations: vec![
            AssociationDef {
                name: "categories".to_string(),
                related_table: "categories".to_string(),
                related_primary_key: "id".to_string(),
                join_table: "categories_posts".to_string(),
                owner_key: "post_id".to_string(),
                related_key: "category_id".to_string(),
            },
            AssociationDef {
                name: "tags".to_string(),
                related_table: "tags".to_string(),
                related_primary_key: "id".to_string(),
                join_table: "posts_tags".to_string(),
                owner_key: "post_id".to_string(),
                related_key: "tag_id".to_string(),
            },
        ],
    }
}

/// Introspector matching [`post_owner`]: categories carries both counter
/// columns plus the hierarchy encoding, tags only the direct counter.
pub fn post_schema() -> MockIntrospector {
    MockIntrospector::new()
        .with_table(
            "categories",
            &[
                "id",
                "parent_id",
                "lft",
                "rght",
                "title",
                "slug",
                "post_count",
                "under_post_count",
            ],
        )
        .with_hierarchy("categories")
        .with_table("tags", &["id", "title", "post_count"])
        .with_table("posts", &["id", "title", "active"])
}

/// Menu row with a single `slug` URL value.
pub fn menu_row(
    id: EntityId,
    parent_id: Option<EntityId>,
    display: &str,
    under_count: i64,
    slug: &str,
) -> HierarchyRow {
    HierarchyRow {
        id,
        parent_id,
        display: display.to_string(),
        under_count,
        url_values: vec![Some(slug.to_string())],
    }
}

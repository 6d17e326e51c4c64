//! Hierarchical menu rendering from cached under-counts.
//!
//! Independent read path: fetches every hierarchy node whose under count is
//! positive (a "threaded" fetch: flat rows in nested-set order, assembled
//! into children lists by parent id) and formats the result into a nested
//! display structure with selection state. Selection propagates upward: a
//! node whose descendant is selected gets `parent_selected`, so a tree widget
//! can render the open path without re-traversing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::TallyError,
    query::CountSource,
    schema::{EntityId, SchemaIntrospector},
    settings::AssociationConfig,
};

/// Fetch specification handed to the query executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuQuery {
    pub table: String,
    pub primary_key: String,
    pub display_field: String,
    pub under_field: String,
    pub url_fields: Vec<String>,
}

/// One fetched hierarchy node. `url_values` is parallel to the query's
/// `url_fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyRow {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub display: String,
    pub under_count: i64,
    pub url_values: Vec<Option<String>>,
}

/// Options for [`build_menu`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuOptions {
    /// Column whose value becomes the visible node text.
    pub display_field: String,
    /// Columns whose values populate `url_params`. Defaults to `slug` when
    /// the related table has such a column, else the primary key.
    pub url_fields: Option<Vec<String>>,
    /// `(field, value)` identifying the currently active node; the field must
    /// be one of the URL fields.
    pub selected: Option<(String, String)>,
}

impl Default for MenuOptions {
    fn default() -> Self {
        MenuOptions {
            display_field: "title".to_string(),
            url_fields: None,
            selected: None,
        }
    }
}

/// A formatted display node. Constructed fresh on every menu request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuNode {
    pub text: String,
    pub id: EntityId,
    pub url_params: BTreeMap<String, String>,
    pub selected: bool,
    pub parent_selected: bool,
    pub children: Vec<MenuNode>,
}

/// Query the hierarchy and format it into an ordered menu forest.
///
/// Requires the association to have an enabled under-count field; the menu
/// shows `"{display} ({under})"` per node and hides empty subtrees (an
/// ancestor of any shown node always has a positive under count itself, so
/// the fetched rows form complete subtrees).
pub async fn build_menu<S: CountSource + SchemaIntrospector>(
    store: &S,
    assoc: &AssociationConfig,
    options: &MenuOptions,
) -> Result<Vec<MenuNode>, TallyError> {
    let under_field = assoc.under_field.clone().ok_or_else(|| {
        TallyError::Config(format!(
            "association {} has no enabled under count field, cannot build a menu",
            assoc.name
        ))
    })?;

    let url_fields = match &options.url_fields {
        Some(fields) => fields.clone(),
        None => {
            if store.has_column(&assoc.related_table, "slug").await? {
                vec!["slug".to_string()]
            } else {
                vec![assoc.related_primary_key.clone()]
            }
        }
    };

    let query = MenuQuery {
        table: assoc.related_table.clone(),
        primary_key: assoc.related_primary_key.clone(),
        display_field: options.display_field.clone(),
        under_field,
        url_fields: url_fields.clone(),
    };
    let rows = store.hierarchy_rows(&query).await?;
    tracing::debug!(
        "Menu fetch for association {} returned {} node(s)",
        assoc.name,
        rows.len()
    );
    Ok(assemble(rows, &url_fields, options.selected.as_ref()))
}

/// Assemble flat rows (already in nested-set order) into a formatted forest.
///
/// Rows whose parent is absent from the row set are treated as roots, so a
/// filtered fetch never drops nodes on the floor.
pub fn assemble(
    rows: Vec<HierarchyRow>,
    url_fields: &[String],
    selected: Option<&(String, String)>,
) -> Vec<MenuNode> {
    let ids: BTreeSet<EntityId> = rows.iter().map(|row| row.id).collect();
    let mut children_of: BTreeMap<EntityId, Vec<HierarchyRow>> = BTreeMap::new();
    let mut roots = Vec::new();
    for row in rows {
        match row.parent_id {
            Some(parent) if parent != row.id && ids.contains(&parent) => {
                children_of.entry(parent).or_default().push(row);
            }
            _ => roots.push(row),
        }
    }

    roots
        .into_iter()
        .map(|root| format_tree(root, &mut children_of, url_fields, selected))
        .collect()
}

struct Frame {
    node: MenuNode,
    remaining: std::vec::IntoIter<HierarchyRow>,
}

/// Post-order formatting with an explicit stack. Hierarchy depth is host
/// data, so the traversal must not recurse on it.
fn format_tree(
    root: HierarchyRow,
    children_of: &mut BTreeMap<EntityId, Vec<HierarchyRow>>,
    url_fields: &[String],
    selected: Option<&(String, String)>,
) -> MenuNode {
    let mut stack = vec![frame_for(root, children_of, url_fields, selected)];
    loop {
        let next_child = stack
            .last_mut()
            .expect("stack holds at least the root until it is returned")
            .remaining
            .next();
        match next_child {
            Some(child) => stack.push(frame_for(child, children_of, url_fields, selected)),
            None => {
                let finished = stack
                    .pop()
                    .expect("stack holds at least the root until it is returned");
                match stack.last_mut() {
                    Some(parent) => {
                        if finished.node.parent_selected {
                            parent.node.parent_selected = true;
                        }
                        parent.node.children.push(finished.node);
                    }
                    None => return finished.node,
                }
            }
        }
    }
}

fn frame_for(
    row: HierarchyRow,
    children_of: &mut BTreeMap<EntityId, Vec<HierarchyRow>>,
    url_fields: &[String],
    selected: Option<&(String, String)>,
) -> Frame {
    let remaining = children_of
        .remove(&row.id)
        .unwrap_or_default()
        .into_iter();
    Frame {
        node: format_node(row, url_fields, selected),
        remaining,
    }
}

fn format_node(
    row: HierarchyRow,
    url_fields: &[String],
    selected: Option<&(String, String)>,
) -> MenuNode {
    let url_params: BTreeMap<String, String> = url_fields
        .iter()
        .zip(row.url_values.into_iter())
        .filter_map(|(field, value)| value.map(|v| (field.clone(), v)))
        .collect();
    let is_selected = selected
        .map(|(field, value)| url_params.get(field) == Some(value))
        .unwrap_or(false);
    MenuNode {
        text: format!("{} ({})", row.display, row.under_count),
        id: row.id,
        url_params,
        selected: is_selected,
        // Finalized during post-order unwinding: a child's flag ORs into its
        // parent, so this starts as the node's own selection state.
        parent_selected: is_selected,
        children: Vec::new(),
    }
}

//! # tally-core
//!
//! A Rust library that keeps denormalized counter columns ("tallies") on the
//! related side of many-to-many associations consistent with the join-table
//! state that defines them, including a hierarchical variant where a node's
//! count aggregates its whole nested-set subtree.
//!
//! ## Overview
//!
//! Whenever the membership of a many-to-many association changes (an owning
//! entity is created, updated, or deleted), tally-core identifies every
//! related entity whose cached count may now be stale and **recomputes** those
//! counts with set-based aggregate queries. It never applies incremental
//! +1/-1 adjustments: increments are unsafe under scoped (filtered) counting
//! and under hierarchical aggregation, while a full aggregate is idempotent
//! and converges under concurrent writers as long as the datastore serializes
//! individual update statements.
//!
//! ### Key Features
//!
//! - **Membership diffing**: old vs. new association membership is captured
//!   around each mutation; the union is the minimal set needing a refresh
//! - **Set-based recomputation**: one combined `UPDATE` per association,
//!   writing direct counts and hierarchical under-counts together
//! - **Owner-distinct under-counts**: an owner linked to several descendants
//!   of the same ancestor counts once, not per join row
//! - **Scoped counting**: an optional predicate over the owning entity
//!   restricts which owners count toward the cached aggregates
//! - **Layered configuration**: computed defaults, global overrides, and
//!   per-association overrides, validated against the live schema (absent
//!   columns disable fields instead of failing setup)
//! - **Menu rendering**: the hierarchy plus its cached under-counts formats
//!   into a nested display tree with upward-propagated selection state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::{BTreeMap, BTreeSet};
//! use tally_core::{
//!     context::MutationContext,
//!     db::{db_init, DbConnection},
//!     engine::{CounterEngine, LifecycleHooks},
//!     schema::{AssociationDef, OwnerSpec},
//!     settings::CountSettings,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = db_init("app.db".into(), vec![]).await?;
//!     let store = DbConnection(pool);
//!
//!     // The host ORM describes its owning entity and associations.
//!     let owner = OwnerSpec {
//!         name: "post".to_string(),
//!         table: "posts".to_string(),
//!         primary_key: "id".to_string(),
//!         associations: vec![AssociationDef {
//!             name: "categories".to_string(),
//!             related_table: "categories".to_string(),
//!             related_primary_key: "id".to_string(),
//!             join_table: "categories_posts".to_string(),
//!             owner_key: "post_id".to_string(),
//!             related_key: "category_id".to_string(),
//!         }],
//!     };
//!     let engine = CounterEngine::new(store, owner, &CountSettings::default()).await?;
//!
//!     // One mutation unit: capture, write, recompute.
//!     let mut ctx = MutationContext::new(Some(42));
//!     engine.before_change(&mut ctx).await?;
//!     // ... the host updates post 42 and rewrites its join rows here ...
//!     let touched = BTreeMap::from([("categories".to_string(), BTreeSet::from([7, 9]))]);
//!     engine.after_change(&mut ctx, &touched, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Mutation lifecycle
//!
//! The host drives the engine through four hooks, strictly ordered per owning
//! entity: [`engine::LifecycleHooks::before_change`] captures the current
//! membership of every active association, the host performs its write, and
//! [`engine::LifecycleHooks::after_change`] merges old and new membership
//! into the [`context::MutationContext`]'s pending sets and recomputes them.
//! `before_remove`/`after_remove` do the same for deletions, with an empty
//! "after" membership. Hook failures propagate, so a host that wraps hook
//! invocation in its write transaction aborts the whole mutation instead of
//! committing partial counter state.
//!
//! ### Under-counts and nested sets
//!
//! The hierarchical under-count of a node is the number of **distinct**
//! owning entities linked to the node or any of its descendants. Hierarchy is
//! encoded as nested-set ranges (`lft`/`rght` columns with a `parent_id`
//! pointer): node A is an ancestor-or-self of node B iff
//! `A.lft <= B.lft AND A.rght >= B.rght`, so the subtree aggregate is a
//! single range-containment join, no recursive traversal. The ranges are
//! maintained by the host's hierarchy machinery; this crate only reads them.
//!
//! ### Configuration resolution
//!
//! [`settings::CountSettings`] layers merge at engine construction: defaults
//! derived from the owner name (`post` → `post_count`, `under_post_count`),
//! then global overrides, then per-association overrides (a bare string
//! names the direct-count field, `false` disables the association). Fields
//! whose columns are missing from the schema are disabled with a warning;
//! associations with no enabled field are dropped. See
//! [`settings::SettingsCache`] for per-owner-type caching.
//!
//! ## Module Guide
//!
//! Start with [`engine::CounterEngine`] for the mutation path and
//! [`menu::build_menu`] for the read path. [`query::CountSource`] and
//! [`schema::SchemaIntrospector`] are the seams to implement for a different
//! datastore; [`db::DbConnection`] is the SQLite implementation.

pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod menu;
pub mod query;
pub mod schema;
pub mod settings;
#[cfg(test)]
mod tests;

pub use error::*;

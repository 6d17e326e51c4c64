//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```
//!
//! The fixtures build a posts/categories schema through `db_init` and seed a
//! category tree from a declarative description, deriving the nested-set
//! `lft`/`rght` ranges the way a host's hierarchy-maintenance component
//! would. The engine itself treats those ranges as read-only input, so
//! `assert_ranges_consistent` exists to make a broken fixture fail loudly
//! instead of yielding wrong counts.

use sqlx::{migrate::MigrationType, Pool, Sqlite};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tally_core::{
    context::MutationContext,
    db::{db_init, DbConnection, Migration},
    engine::{CounterEngine, LifecycleHooks},
    schema::{AssociationDef, EntityId, OwnerSpec},
    settings::CountSettings,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times — subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

const SCHEMA_SQL: &str = "\
    CREATE TABLE posts (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        title TEXT NOT NULL, \
        active INTEGER NOT NULL DEFAULT 1); \
    CREATE TABLE categories (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        parent_id INTEGER REFERENCES categories(id), \
        title TEXT NOT NULL, \
        slug TEXT, \
        lft INTEGER NOT NULL, \
        rght INTEGER NOT NULL, \
        post_count INTEGER NOT NULL DEFAULT 0, \
        under_post_count INTEGER NOT NULL DEFAULT 0); \
    CREATE TABLE categories_posts (\
        post_id INTEGER NOT NULL, \
        category_id INTEGER NOT NULL, \
        UNIQUE(post_id, category_id)); \
    CREATE TABLE tags (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        title TEXT NOT NULL, \
        post_count INTEGER NOT NULL DEFAULT 0); \
    CREATE TABLE posts_tags (\
        post_id INTEGER NOT NULL, \
        tag_id INTEGER NOT NULL, \
        UNIQUE(post_id, tag_id));";

/// Create the posts/categories schema in a fresh database under `dir`.
pub async fn setup_db(dir: &Path) -> Result<Pool<Sqlite>, Box<dyn std::error::Error>> {
    let db_path = dir.join("tally_test.db");
    let pool = db_init(
        db_path,
        vec![Migration {
            version: 1,
            description: "create_posts_and_categories",
            sql: SCHEMA_SQL,
            kind: MigrationType::Simple,
        }],
    )
    .await?;
    Ok(pool)
}

/// The owning entity declaration matching the test schema.
pub fn post_owner() -> OwnerSpec {
    OwnerSpec {
        name: "post".to_string(),
        table: "posts".to_string(),
        primary_key: "id".to_string(),
        associations: vec![AssociationDef {
            name: "categories".to_string(),
            related_table: "categories".to_string(),
            related_primary_key: "id".to_string(),
            join_table: "categories_posts".to_string(),
            owner_key: "post_id".to_string(),
            related_key: "category_id".to_string(),
        }],
    }
}

/// [`post_owner`] extended with the flat tags association (no hierarchy
/// encoding, direct counts only).
#[allow(dead_code)]
pub fn post_owner_with_tags() -> OwnerSpec {
    let mut owner = post_owner();
    owner.associations.push(AssociationDef {
        name: "tags".to_string(),
        related_table: "tags".to_string(),
        related_primary_key: "id".to_string(),
        join_table: "posts_tags".to_string(),
        owner_key: "post_id".to_string(),
        related_key: "tag_id".to_string(),
    });
    owner
}

#[allow(dead_code)]
pub async fn post_engine(
    pool: &Pool<Sqlite>,
    settings: &CountSettings,
) -> Result<CounterEngine<DbConnection>, Box<dyn std::error::Error>> {
    Ok(CounterEngine::new(DbConnection(pool.clone()), post_owner(), settings).await?)
}

/// Declarative category tree node for seeding fixtures.
pub struct Cat {
    pub title: &'static str,
    pub slug: &'static str,
    pub children: Vec<Cat>,
}

#[allow(dead_code)]
pub fn cat(title: &'static str, slug: &'static str, children: Vec<Cat>) -> Cat {
    Cat {
        title,
        slug,
        children,
    }
}

/// Insert a category forest, assigning `lft`/`rght` ranges depth-first the
/// way a nested-set maintenance component numbers them. Returns title → id.
#[allow(dead_code)]
pub async fn seed_categories(
    pool: &Pool<Sqlite>,
    forest: &[Cat],
) -> Result<BTreeMap<String, EntityId>, Box<dyn std::error::Error>> {
    let mut ids = BTreeMap::new();
    let mut counter = 1i64;
    for root in forest {
        counter = insert_cat(pool, root, None, counter, &mut ids).await?;
    }
    Ok(ids)
}

async fn insert_cat(
    pool: &Pool<Sqlite>,
    node: &Cat,
    parent: Option<EntityId>,
    lft: i64,
    ids: &mut BTreeMap<String, EntityId>,
) -> Result<i64, Box<dyn std::error::Error>> {
    // Reserve the row first, then fill in rght once the subtree is numbered.
    let id = sqlx::query(
        "INSERT INTO categories (parent_id, title, slug, lft, rght) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(parent)
    .bind(node.title)
    .bind(node.slug)
    .bind(lft)
    .bind(0i64)
    .execute(pool)
    .await?
    .last_insert_rowid();
    ids.insert(node.title.to_string(), id);

    let mut cursor = lft + 1;
    for child in &node.children {
        cursor = Box::pin(insert_cat(pool, child, Some(id), cursor, ids)).await?;
    }
    sqlx::query("UPDATE categories SET rght = ? WHERE id = ?")
        .bind(cursor)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(cursor + 1)
}

/// Validate the seeded nested-set encoding: ordered ranges, globally unique
/// bounds, children contained in parents, siblings disjoint.
#[allow(dead_code)]
pub async fn assert_ranges_consistent(
    pool: &Pool<Sqlite>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<(EntityId, Option<EntityId>, i64, i64)> =
        sqlx::query_as("SELECT id, parent_id, lft, rght FROM categories")
            .fetch_all(pool)
            .await?;
    let by_id: BTreeMap<EntityId, (Option<EntityId>, i64, i64)> = rows
        .iter()
        .map(|(id, parent, lft, rght)| (*id, (*parent, *lft, *rght)))
        .collect();

    let mut bounds = BTreeSet::new();
    for (id, parent, lft, rght) in &rows {
        assert!(lft < rght, "category {id} has inverted range [{lft}, {rght}]");
        assert!(bounds.insert(*lft), "category {id} reuses bound {lft}");
        assert!(bounds.insert(*rght), "category {id} reuses bound {rght}");
        if let Some(parent) = parent {
            let (_, plft, prght) = by_id[parent];
            assert!(
                plft < *lft && prght > *rght,
                "category {id} [{lft}, {rght}] escapes parent {parent} [{plft}, {prght}]"
            );
        }
    }
    for (a_id, (a_parent, a_lft, a_rght)) in by_id.iter() {
        for (b_id, (b_parent, b_lft, b_rght)) in by_id.iter() {
            if a_id >= b_id || a_parent != b_parent {
                continue;
            }
            assert!(
                *a_rght < *b_lft || *b_rght < *a_lft,
                "siblings {a_id} and {b_id} have overlapping ranges"
            );
        }
    }
    Ok(())
}

/// The standard fixture tree used across the integration suite:
/// Apps → (Editors → Vim, Games).
#[allow(dead_code)]
pub async fn seed_standard_tree(
    pool: &Pool<Sqlite>,
) -> Result<BTreeMap<String, EntityId>, Box<dyn std::error::Error>> {
    seed_categories(
        pool,
        &[cat(
            "Apps",
            "apps",
            vec![
                cat("Editors", "editors", vec![cat("Vim", "vim", vec![])]),
                cat("Games", "games", vec![]),
            ],
        )],
    )
    .await
}

/// Drive the whole creation lifecycle for a post: capture (no-op without an
/// id), insert the row and its join rows, then let the engine recompute.
#[allow(dead_code)]
pub async fn create_post(
    engine: &CounterEngine<DbConnection>,
    pool: &Pool<Sqlite>,
    title: &str,
    active: bool,
    categories: &[EntityId],
) -> Result<EntityId, Box<dyn std::error::Error>> {
    let mut ctx = MutationContext::new(None);
    engine.before_change(&mut ctx).await?;

    let id = sqlx::query("INSERT INTO posts (title, active) VALUES (?, ?)")
        .bind(title)
        .bind(active as i64)
        .execute(pool)
        .await?
        .last_insert_rowid();
    insert_join_rows(pool, id, categories).await?;

    ctx.set_owner_id(id);
    let touched = BTreeMap::from([(
        "categories".to_string(),
        categories.iter().copied().collect::<BTreeSet<_>>(),
    )]);
    engine.after_change(&mut ctx, &touched, true).await?;
    Ok(id)
}

/// Rewrite a post's category membership through the update lifecycle.
#[allow(dead_code)]
pub async fn set_post_categories(
    engine: &CounterEngine<DbConnection>,
    pool: &Pool<Sqlite>,
    post_id: EntityId,
    categories: &[EntityId],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = MutationContext::new(Some(post_id));
    engine.before_change(&mut ctx).await?;

    sqlx::query("DELETE FROM categories_posts WHERE post_id = ?")
        .bind(post_id)
        .execute(pool)
        .await?;
    insert_join_rows(pool, post_id, categories).await?;

    let touched = BTreeMap::from([(
        "categories".to_string(),
        categories.iter().copied().collect::<BTreeSet<_>>(),
    )]);
    engine.after_change(&mut ctx, &touched, false).await?;
    Ok(())
}

/// Update a non-membership column. The association is not part of the
/// operation, so `touched` stays empty and the captured membership still
/// refreshes (the owner's scope may have changed).
#[allow(dead_code)]
pub async fn set_post_active(
    engine: &CounterEngine<DbConnection>,
    pool: &Pool<Sqlite>,
    post_id: EntityId,
    active: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = MutationContext::new(Some(post_id));
    engine.before_change(&mut ctx).await?;

    sqlx::query("UPDATE posts SET active = ? WHERE id = ?")
        .bind(active as i64)
        .bind(post_id)
        .execute(pool)
        .await?;

    engine.after_change(&mut ctx, &BTreeMap::new(), false).await?;
    Ok(())
}

/// Drive the deletion lifecycle for a post.
#[allow(dead_code)]
pub async fn delete_post(
    engine: &CounterEngine<DbConnection>,
    pool: &Pool<Sqlite>,
    post_id: EntityId,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = MutationContext::new(Some(post_id));
    engine.before_remove(&mut ctx).await?;

    sqlx::query("DELETE FROM categories_posts WHERE post_id = ?")
        .bind(post_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(post_id)
        .execute(pool)
        .await?;

    engine.after_remove(&mut ctx).await?;
    Ok(())
}

async fn insert_join_rows(
    pool: &Pool<Sqlite>,
    post_id: EntityId,
    categories: &[EntityId],
) -> Result<(), Box<dyn std::error::Error>> {
    for category_id in categories {
        sqlx::query("INSERT INTO categories_posts (post_id, category_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(category_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Read back `(post_count, under_post_count)` for a category by title.
#[allow(dead_code)]
pub async fn counts(
    pool: &Pool<Sqlite>,
    title: &str,
) -> Result<(i64, i64), Box<dyn std::error::Error>> {
    let row: (i64, i64) =
        sqlx::query_as("SELECT post_count, under_post_count FROM categories WHERE title = ?")
            .bind(title)
            .fetch_one(pool)
            .await?;
    Ok(row)
}

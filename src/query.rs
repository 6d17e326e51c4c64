//! SQL fragment building and the abstract query-executor contract.
//!
//! Statements are assembled with [`sqlx::QueryBuilder`]: identifiers coming
//! from host metadata are validated and interpolated, every scalar value is
//! bound. [`CountSource`] is the seam between the recompute engine and a
//! concrete datastore; [`crate::db::DbConnection`] implements it for SQLite.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
};

use crate::{
    error::TallyError,
    menu::{HierarchyRow, MenuQuery},
    schema::EntityId,
    settings::AssociationConfig,
};

/// Upper bound on bind variables per statement.
///
/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

/// Validate an identifier destined for interpolation into a statement.
///
/// Table and column names cannot be bound, so anything outside
/// `[A-Za-z_][A-Za-z0-9_]*` is rejected before it reaches the builder.
pub fn ident(name: &str) -> Result<&str, TallyError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(TallyError::Config(format!(
            "invalid identifier {name:?} in counter configuration"
        )))
    }
}

/// Push `column IN (...)`/`column NOT IN (...)` with one bind per id.
pub fn push_id_expr(
    qb: &mut QueryBuilder<Sqlite>,
    ids: &[EntityId],
    column: &str,
    match_pred: bool,
) {
    let last_sep = if !ids.is_empty() { ids.len() - 1 } else { 0 };
    qb.push(column);
    if match_pred {
        qb.push(" IN(");
    } else {
        qb.push(" NOT IN(");
    }
    for (idx, id) in ids.iter().enumerate() {
        qb.push_bind(*id);
        if idx < last_sep {
            qb.push(", ");
        }
    }
    qb.push(") ");
}

/// A scalar comparison value inside a scope predicate.
///
/// Booleans are stored the SQLite way, as integers, so `active = true` in a
/// TOML settings file compares against an `INTEGER` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    pub fn push_bind(&self, qb: &mut QueryBuilder<Sqlite>) {
        match self {
            ScalarValue::Bool(b) => qb.push_bind(*b as i64),
            ScalarValue::Int(i) => qb.push_bind(*i),
            ScalarValue::Real(r) => qb.push_bind(*r),
            ScalarValue::Text(t) => qb.push_bind(t.clone()),
        };
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{b}"),
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Real(r) => write!(f, "{r}"),
            ScalarValue::Text(t) => write!(f, "{t}"),
        }
    }
}

/// Additional filter over the owning entity, restricting which owners count
/// toward the cached aggregates. Conditions are conjunctive equalities on
/// owner columns, e.g. `scope = { active = true }` in a settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopePred(pub BTreeMap<String, ScalarValue>);

impl ScopePred {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<(), TallyError> {
        for column in self.0.keys() {
            ident(column)?;
        }
        Ok(())
    }

    /// Push ` AND alias.column = ?` for every condition. Intended for use in
    /// an `ON` or `WHERE` clause that already has a leading condition.
    pub fn push_conditions(&self, qb: &mut QueryBuilder<Sqlite>, alias: &str) {
        for (column, value) in self.0.iter() {
            qb.push(format!(" AND {alias}.{column} = "));
            value.push_bind(qb);
        }
    }
}

/// Abstract query executor consumed by the recompute engine and the menu
/// builder. Implementations either execute a statement (updates) or return
/// rows (selects); failures are propagated, never swallowed.
pub trait CountSource: Sync {
    /// Current membership of an association for one owning entity: the set of
    /// related-entity ids joined to `owner`.
    fn join_members(
        &self,
        assoc: &AssociationConfig,
        owner: EntityId,
    ) -> impl Future<Output = Result<BTreeSet<EntityId>, TallyError>> + Send;

    /// Recompute and write back the enabled counter fields for the given
    /// related ids, as one set-based update per association (chunked only to
    /// stay below the datastore's bind-variable ceiling).
    fn apply_recount(
        &self,
        assoc: &AssociationConfig,
        ids: &BTreeSet<EntityId>,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;

    /// Rebuild the counters of every row in the association's related table.
    /// Maintenance entry point for recovering drifted counters.
    fn recount_all(
        &self,
        assoc: &AssociationConfig,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;

    /// Threaded fetch for menu rendering: all rows with a positive under
    /// count, in nested-set order, with display and URL field values
    /// projected.
    fn hierarchy_rows(
        &self,
        query: &MenuQuery,
    ) -> impl Future<Output = Result<Vec<HierarchyRow>, TallyError>> + Send;
}

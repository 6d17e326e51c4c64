//! SQLite query executor: membership capture, combined recount updates, menu
//! fetches, and schema introspection, all built through
//! [`sqlx::QueryBuilder`].
//!
//! Each recount is one set-based `UPDATE` per association: the direct count
//! as a correlated scalar subquery over the join relation, the under count
//! joined from a grouped aggregate over the nested-set containment condition.
//! Counts are full aggregates of current join-table state, so a recount is
//! idempotent and two interleaved recounts converge as long as the datastore
//! serializes individual update statements.

use futures_core::future::BoxFuture;
use sqlx::Execute;
use sqlx::{
    error::BoxDynError,
    migrate::{
        MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator,
    },
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions},
    ConnectOptions, Pool, QueryBuilder, Row,
};
use std::{collections::BTreeSet, path::PathBuf, str::FromStr};

use crate::{
    error::TallyError,
    menu::{HierarchyRow, MenuQuery},
    query::{ident, push_id_expr, CountSource, SQLITE_LIMIT_VARIABLE_NUMBER},
    schema::{
        EntityId, SchemaIntrospector, HIERARCHY_LEFT, HIERARCHY_PARENT, HIERARCHY_RIGHT,
    },
    settings::AssociationConfig,
};

/// Pending ids are bound twice per recount statement (aggregate restriction
/// and update restriction), so chunks stay below half the variable ceiling,
/// with headroom for scope binds.
const RECOUNT_CHUNK: usize = SQLITE_LIMIT_VARIABLE_NUMBER / 2 - 16;

/// Push the condition "`node` is an ancestor-or-self of some id in `ids`",
/// expressed over the nested-set containment ranges. `node` is the alias (or
/// table name) whose hierarchy columns are compared.
fn push_ancestor_of_expr(
    qb: &mut QueryBuilder<Sqlite>,
    ids: &[EntityId],
    assoc: &AssociationConfig,
    node: &str,
) -> Result<(), TallyError> {
    let related = ident(&assoc.related_table)?;
    let rpk = ident(&assoc.related_primary_key)?;
    qb.push(format!(
        "EXISTS (SELECT 1 FROM {related} AS tgt WHERE \
         {node}.{HIERARCHY_LEFT} <= tgt.{HIERARCHY_LEFT} \
         AND {node}.{HIERARCHY_RIGHT} >= tgt.{HIERARCHY_RIGHT} AND "
    ));
    push_id_expr(qb, ids, &format!("tgt.{rpk}"), true);
    qb.push(") ");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    /// Issue the combined counter update for one association. `ids` restricts
    /// the recount to those related entities; `None` recounts the whole
    /// table. Both enabled fields are written by the same statement so they
    /// stay mutually consistent.
    ///
    /// With an enabled under count the restriction widens to every
    /// ancestor-or-self of a pending id: a membership change deep in a
    /// subtree stales the tallies of the whole ancestor chain. Direct-only
    /// associations have no hierarchy encoding and update the pending ids
    /// alone.
    async fn recount_where(
        &self,
        assoc: &AssociationConfig,
        ids: Option<&[EntityId]>,
    ) -> Result<(), TallyError> {
        let related = ident(&assoc.related_table)?;
        let rpk = ident(&assoc.related_primary_key)?;
        let join = ident(&assoc.join_table)?;
        let owner_table = ident(&assoc.owner_table)?;
        let owner_pk = ident(&assoc.owner_primary_key)?;
        let owner_key = ident(&assoc.owner_key)?;
        let related_key = ident(&assoc.related_key)?;
        if let Some(scope) = &assoc.scope {
            scope.validate()?;
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {related} SET "));
        let mut wrote_field = false;

        if let Some(direct) = &assoc.direct_field {
            let direct = ident(direct)?;
            qb.push(format!("{direct} = (SELECT COUNT(*) FROM {join} AS j"));
            if let Some(scope) = &assoc.scope {
                qb.push(format!(
                    " JOIN {owner_table} AS o ON o.{owner_pk} = j.{owner_key}"
                ));
                scope.push_conditions(&mut qb, "o");
            }
            qb.push(format!(" WHERE j.{related_key} = {related}.{rpk})"));
            wrote_field = true;
        }

        if let Some(under) = &assoc.under_field {
            let under = ident(under)?;
            if wrote_field {
                qb.push(", ");
            }
            // Group by ancestor over the nested-set containment condition and
            // count distinct owners, so an owner linked to several
            // descendants of the same ancestor counts once.
            qb.push(format!(
                "{under} = COALESCE((SELECT agg.owner_tally FROM (\
                 SELECT anc.{rpk} AS node_id, COUNT(DISTINCT j.{owner_key}) AS owner_tally \
                 FROM {related} AS anc \
                 LEFT JOIN {related} AS sub \
                 ON anc.{HIERARCHY_LEFT} <= sub.{HIERARCHY_LEFT} \
                 AND anc.{HIERARCHY_RIGHT} >= sub.{HIERARCHY_RIGHT} \
                 JOIN {join} AS j ON j.{related_key} = sub.{rpk}"
            ));
            if let Some(scope) = &assoc.scope {
                qb.push(format!(
                    " JOIN {owner_table} AS o ON o.{owner_pk} = j.{owner_key}"
                ));
                scope.push_conditions(&mut qb, "o");
            }
            if let Some(ids) = ids {
                qb.push(" WHERE ");
                push_ancestor_of_expr(&mut qb, ids, assoc, "anc")?;
            }
            qb.push(format!(
                " GROUP BY anc.{rpk}) AS agg WHERE agg.node_id = {related}.{rpk}), 0)"
            ));
            wrote_field = true;
        }

        if !wrote_field {
            // Resolution drops associations with neither field enabled, so
            // this only happens with a hand-built config.
            tracing::warn!(
                "Association {} has no enabled counter field, nothing to recount",
                assoc.name
            );
            return Ok(());
        }

        if let Some(ids) = ids {
            qb.push(" WHERE ");
            if assoc.under_field.is_some() {
                push_ancestor_of_expr(&mut qb, ids, assoc, related)?;
            } else {
                push_id_expr(&mut qb, ids, &format!("{related}.{rpk}"), true);
            }
        }

        let query = qb.build();
        let sql = query.sql().to_string();
        query.execute(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.recount_where] SQL error processing recount \
                 '{}'\n\terror: {}",
                sql,
                e
            );
            e
        })?;
        Ok(())
    }
}

impl CountSource for DbConnection {
    async fn join_members(
        &self,
        assoc: &AssociationConfig,
        owner: EntityId,
    ) -> Result<BTreeSet<EntityId>, TallyError> {
        let join = ident(&assoc.join_table)?;
        let owner_key = ident(&assoc.owner_key)?;
        let related_key = ident(&assoc.related_key)?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {related_key} FROM {join} WHERE {owner_key} = "
        ));
        qb.push_bind(owner);
        let member_query = qb.build_query_scalar::<EntityId>();
        let members = member_query.fetch_all(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.join_members] SQL error fetching membership of \
                 {} for owner {}\n\terror: {}",
                assoc.name,
                owner,
                e
            );
            e
        })?;
        Ok(members.into_iter().collect())
    }

    #[tracing::instrument(skip(self, assoc), fields(association = %assoc.name))]
    async fn apply_recount(
        &self,
        assoc: &AssociationConfig,
        ids: &BTreeSet<EntityId>,
    ) -> Result<(), TallyError> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_vec: Vec<EntityId> = ids.iter().copied().collect();
        for chunk in id_vec.chunks(RECOUNT_CHUNK) {
            self.recount_where(assoc, Some(chunk)).await?;
        }
        Ok(())
    }

    async fn recount_all(&self, assoc: &AssociationConfig) -> Result<(), TallyError> {
        self.recount_where(assoc, None).await
    }

    async fn hierarchy_rows(&self, query: &MenuQuery) -> Result<Vec<HierarchyRow>, TallyError> {
        let table = ident(&query.table)?;
        let pk = ident(&query.primary_key)?;
        let display = ident(&query.display_field)?;
        let under = ident(&query.under_field)?;

        // Display and URL values are CAST to text so numeric columns (e.g.
        // the primary key as a URL field) come back uniformly.
        let mut sql = format!(
            "SELECT {pk} AS id, {HIERARCHY_PARENT} AS parent_id, \
             CAST({display} AS TEXT) AS display, {under} AS under_count"
        );
        for (idx, field) in query.url_fields.iter().enumerate() {
            let field = ident(field)?;
            sql.push_str(&format!(", CAST({field} AS TEXT) AS u{idx}"));
        }
        sql.push_str(&format!(
            " FROM {table} WHERE {under} > 0 ORDER BY {HIERARCHY_LEFT}"
        ));

        let rows = sqlx::query(&sql).fetch_all(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.hierarchy_rows] SQL error processing menu query \
                 '{}'\n\terror: {}",
                sql,
                e
            );
            e
        })?;

        rows.into_iter()
            .map(|row| {
                let url_values = (0..query.url_fields.len())
                    .map(|idx| row.try_get::<Option<String>, _>(4 + idx))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(HierarchyRow {
                    id: row.try_get(0)?,
                    parent_id: row.try_get(1)?,
                    display: row.try_get::<Option<String>, _>(2)?.unwrap_or_default(),
                    under_count: row.try_get(3)?,
                    url_values,
                })
            })
            .collect()
    }
}

impl SchemaIntrospector for DbConnection {
    async fn has_column(&self, table: &str, column: &str) -> Result<bool, TallyError> {
        ident(table)?;
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.0)
            .await?;
        Ok(names.iter().any(|name| name == column))
    }

    async fn hierarchy_columns_present(&self, table: &str) -> Result<bool, TallyError> {
        ident(table)?;
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.0)
            .await?;
        Ok([HIERARCHY_PARENT, HIERARCHY_LEFT, HIERARCHY_RIGHT]
            .iter()
            .all(|required| names.iter().any(|name| name == required)))
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                migrations.push(SqlxMigration::new(
                    migration.version,
                    migration.description.into(),
                    migration.kind,
                    migration.sql.into(),
                    false,
                ));
            }
            Ok(migrations)
        })
    }
}

/// Open (creating if missing) the host database and run the supplied schema
/// migrations through one code path shared by hosts and the test suite.
pub async fn db_init(
    db_path: PathBuf,
    migrations: Vec<Migration>,
) -> Result<Pool<Sqlite>, sqlx::Error> {
    let fqdb = format!("sqlite:{}", db_path.display());
    tracing::debug!("Initializing counter db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);
    let pool = PoolOptions::<Sqlite>::new().connect_with(options).await?;

    if !migrations.is_empty() {
        let migrator = Migrator::new(MigrationList(migrations)).await?;
        migrator.run(&pool).await?;
    }

    Ok(pool)
}

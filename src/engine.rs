//! Lifecycle orchestration: capture association membership around a mutation,
//! accumulate the affected related ids, recompute their counters.
//!
//! The host object-relational layer drives the engine through the four
//! [`LifecycleHooks`] entry points, strictly ordered per owning entity:
//! capture-before, perform the write, capture-after (which accumulates and
//! recomputes). Query failures propagate out of the hooks, so a host that
//! wraps hook invocation in its write transaction aborts the whole mutation
//! rather than committing partial counter state.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::Arc,
};

use crate::{
    context::MutationContext,
    error::TallyError,
    menu::{self, MenuNode, MenuOptions},
    query::CountSource,
    schema::{EntityId, OwnerSpec, SchemaIntrospector},
    settings::{self, AssociationConfig, CountSettings, SettingsCache},
};

/// The four mutation entry points invoked by the host's lifecycle mechanism.
///
/// `before_change`/`before_remove` run before the owning entity is written or
/// deleted; `after_change`/`after_remove` run once the write is durable and
/// the new membership (if any changed) is known. Together with
/// [`menu::build_menu`] this is the crate's whole operational surface.
pub trait LifecycleHooks: Sync {
    /// Capture the current membership of every active association. Skipped
    /// internally when the context has no owner id yet (first creation, so
    /// no prior state exists).
    fn before_change(
        &self,
        ctx: &mut MutationContext,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;

    /// `touched` holds, per association, the complete new membership for
    /// associations whose data was part of this operation. Associations
    /// absent from `touched` keep their captured before-ids pending: their
    /// counts still refresh, since the owner's scope may have changed even
    /// when membership did not.
    fn after_change(
        &self,
        ctx: &mut MutationContext,
        touched: &BTreeMap<String, BTreeSet<EntityId>>,
        created: bool,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;

    fn before_remove(
        &self,
        ctx: &mut MutationContext,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;

    /// After deletion the new membership of every association is empty; all
    /// previously associated related ids get recomputed without the owner's
    /// contribution.
    fn after_remove(
        &self,
        ctx: &mut MutationContext,
    ) -> impl Future<Output = Result<(), TallyError>> + Send;
}

/// Counter-cache engine for one owning entity type.
///
/// Holds the resolved per-association configuration (computed once, at
/// construction) and the datastore connection it issues aggregate statements
/// through.
#[derive(Debug, Clone)]
pub struct CounterEngine<S> {
    store: S,
    owner: OwnerSpec,
    config: Arc<BTreeMap<String, AssociationConfig>>,
}

impl<S: CountSource + SchemaIntrospector> CounterEngine<S> {
    /// Resolve settings against the live schema and build an engine.
    pub async fn new(
        store: S,
        owner: OwnerSpec,
        count_settings: &CountSettings,
    ) -> Result<Self, TallyError> {
        let config = Arc::new(settings::resolve(&store, &owner, count_settings).await?);
        Ok(CounterEngine {
            store,
            owner,
            config,
        })
    }

    /// Like [`CounterEngine::new`], but resolution is served from (and
    /// recorded in) a process-wide [`SettingsCache`] keyed by owner type.
    pub async fn with_cache(
        store: S,
        owner: OwnerSpec,
        count_settings: &CountSettings,
        cache: &SettingsCache,
    ) -> Result<Self, TallyError> {
        let config = cache.resolve_for(&store, &owner, count_settings).await?;
        Ok(CounterEngine {
            store,
            owner,
            config,
        })
    }

    pub fn owner(&self) -> &OwnerSpec {
        &self.owner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Active association configurations (associations disabled or dropped at
    /// resolution time are absent).
    pub fn config(&self) -> &BTreeMap<String, AssociationConfig> {
        &self.config
    }

    async fn capture_before(&self, ctx: &mut MutationContext) -> Result<(), TallyError> {
        let Some(owner_id) = ctx.owner_id() else {
            tracing::debug!(
                "No {} id in context, skipping before-capture",
                self.owner.name
            );
            return Ok(());
        };
        for (name, assoc) in self.config.iter() {
            let members = self.store.join_members(assoc, owner_id).await?;
            tracing::debug!(
                "Captured {} member(s) of {} for {} {}",
                members.len(),
                name,
                self.owner.name,
                owner_id
            );
            ctx.record_before(name, members);
        }
        Ok(())
    }

    /// Consume the context's pending sets and issue one combined recount per
    /// association. Associations with nothing pending are untouched.
    async fn recompute(&self, ctx: &mut MutationContext) -> Result<(), TallyError> {
        for (name, ids) in ctx.take_pending() {
            if ids.is_empty() {
                continue;
            }
            let Some(assoc) = self.config.get(&name) else {
                tracing::warn!("Pending recount for unconfigured association {}", name);
                continue;
            };
            tracing::debug!("Recounting {} related id(s) for {}", ids.len(), name);
            self.store.apply_recount(assoc, &ids).await?;
        }
        Ok(())
    }

    /// Maintenance operation: rebuild the counters of every related row of
    /// every active association, recovering from drifted values.
    pub async fn recount_all(&self) -> Result<(), TallyError> {
        for (name, assoc) in self.config.iter() {
            tracing::info!(
                "Full recount of association {} for owner type {}",
                name,
                self.owner.name
            );
            self.store.recount_all(assoc).await?;
        }
        Ok(())
    }

    /// Render the association's hierarchy, annotated with cached under
    /// counts, as a nested menu forest.
    pub async fn build_menu(
        &self,
        association: &str,
        options: &MenuOptions,
    ) -> Result<Vec<MenuNode>, TallyError> {
        let assoc = self.config.get(association).ok_or_else(|| {
            TallyError::NotFound(format!(
                "association {association} is not active for owner type {}",
                self.owner.name
            ))
        })?;
        menu::build_menu(&self.store, assoc, options).await
    }
}

impl<S: CountSource + SchemaIntrospector + Send> LifecycleHooks for CounterEngine<S> {
    async fn before_change(&self, ctx: &mut MutationContext) -> Result<(), TallyError> {
        self.capture_before(ctx).await
    }

    async fn after_change(
        &self,
        ctx: &mut MutationContext,
        touched: &BTreeMap<String, BTreeSet<EntityId>>,
        created: bool,
    ) -> Result<(), TallyError> {
        if created {
            tracing::debug!(
                "{} {:?} created, no prior membership to merge",
                self.owner.name,
                ctx.owner_id()
            );
        }
        let empty = BTreeSet::new();
        for name in self.config.keys() {
            let before = ctx.take_before(name);
            // Membership untouched by this operation: merge the before set
            // alone so those counts still refresh.
            let after = touched.get(name).unwrap_or(&empty);
            ctx.merge(name, &before, after);
        }
        self.recompute(ctx).await
    }

    async fn before_remove(&self, ctx: &mut MutationContext) -> Result<(), TallyError> {
        self.capture_before(ctx).await
    }

    async fn after_remove(&self, ctx: &mut MutationContext) -> Result<(), TallyError> {
        let empty = BTreeSet::new();
        for name in self.config.keys() {
            let before = ctx.take_before(name);
            ctx.merge(name, &before, &empty);
        }
        self.recompute(ctx).await
    }
}

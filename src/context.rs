//! Per-mutation pending-recount state, explicitly threaded through the
//! lifecycle hooks.
//!
//! A [`MutationContext`] is owned by the caller and lives for exactly one
//! mutation unit (a save, a delete, or a save immediately followed by a
//! delete in the same unit of work). It carries the captured "before"
//! membership per association and the union of all related-entity ids whose
//! counters need a refresh. Nothing here is ever persisted.

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::EntityId;

#[derive(Debug, Default, Clone)]
pub struct MutationContext {
    owner_id: Option<EntityId>,
    before: BTreeMap<String, BTreeSet<EntityId>>,
    pending: BTreeMap<String, BTreeSet<EntityId>>,
}

impl MutationContext {
    /// `owner_id` is `None` for an entity that has not been written yet
    /// (first creation); the before-capture is skipped in that case.
    pub fn new(owner_id: Option<EntityId>) -> Self {
        MutationContext {
            owner_id,
            ..Default::default()
        }
    }

    pub fn owner_id(&self) -> Option<EntityId> {
        self.owner_id
    }

    /// Adopt the id assigned by the datastore once a created entity has been
    /// written.
    pub fn set_owner_id(&mut self, id: EntityId) {
        self.owner_id = Some(id);
    }

    pub fn record_before(&mut self, association: &str, members: BTreeSet<EntityId>) {
        self.before.insert(association.to_string(), members);
    }

    pub fn take_before(&mut self, association: &str) -> BTreeSet<EntityId> {
        self.before.remove(association).unwrap_or_default()
    }

    /// Union the old and new membership of an association into its pending
    /// set. Any id that was removed needs its count recomputed without the
    /// owner, any id added needs it recomputed with the owner; recomputing
    /// the whole union is strictly correct since counts are derived from
    /// current join-table state, never incrementally adjusted.
    pub fn merge(
        &mut self,
        association: &str,
        before: &BTreeSet<EntityId>,
        after: &BTreeSet<EntityId>,
    ) {
        if before.is_empty() && after.is_empty() {
            return;
        }
        let entry = self.pending.entry(association.to_string()).or_default();
        entry.extend(before.iter().copied());
        entry.extend(after.iter().copied());
    }

    pub fn pending(&self, association: &str) -> Option<&BTreeSet<EntityId>> {
        self.pending.get(association)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|ids| !ids.is_empty())
    }

    /// Drain the accumulated pending sets for consumption by the recompute
    /// engine. The context stays usable: a later mutation in the same unit of
    /// work accumulates a fresh pending map.
    pub fn take_pending(&mut self) -> BTreeMap<String, BTreeSet<EntityId>> {
        std::mem::take(&mut self.pending)
    }
}

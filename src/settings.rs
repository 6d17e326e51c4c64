//! Layered counter-cache settings and their resolution into per-association
//! configuration.
//!
//! Settings merge in three layers: computed defaults (derived from the owning
//! entity's name), global overrides, then per-association overrides keyed by
//! association name or by related-table name. The merged result is validated
//! against the live schema at resolution time: a declared counter column
//! that does not exist disables that field, and an association with no
//! enabled field is dropped from the active set. Hosts typically declare the
//! override layers in their TOML configuration.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use crate::{
    error::TallyError,
    query::{ident, ScopePred},
    schema::{AssociationDef, OwnerSpec, SchemaIntrospector},
};

/// One counter field in an override layer: `false` disables it, `true` keeps
/// the computed default name, a string renames it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSetting {
    Enabled(bool),
    Named(String),
}

impl FieldSetting {
    fn apply(&self, current: Option<String>, default_name: &str) -> Option<String> {
        match self {
            FieldSetting::Enabled(false) => None,
            FieldSetting::Enabled(true) => current.or_else(|| Some(default_name.to_string())),
            FieldSetting::Named(name) => Some(name.clone()),
        }
    }
}

/// Structured per-association override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationSettings {
    pub direct_field: Option<FieldSetting>,
    pub under_field: Option<FieldSetting>,
    pub scope: Option<ScopePred>,
}

/// Per-association override as written by the host: `false` skips the
/// association entirely, a bare string is shorthand for naming the
/// direct-count field, a table carries the structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssociationOverride {
    Enabled(bool),
    DirectField(String),
    Settings(AssociationSettings),
}

/// Global settings layer plus per-association overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountSettings {
    pub direct_field: Option<FieldSetting>,
    pub under_field: Option<FieldSetting>,
    pub scope: Option<ScopePred>,
    #[serde(default)]
    pub associations: BTreeMap<String, AssociationOverride>,
}

impl CountSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, TallyError> {
        Ok(toml::from_str(text)?)
    }

    /// Override for one association, looked up by association name first,
    /// then by related-table name.
    fn override_for(&self, def: &AssociationDef) -> Option<&AssociationOverride> {
        self.associations
            .get(&def.name)
            .or_else(|| self.associations.get(&def.related_table))
    }
}

/// Fully resolved configuration for one active association. Only produced by
/// [`resolve`]; at least one of `direct_field`/`under_field` is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationConfig {
    pub name: String,
    pub owner_table: String,
    pub owner_primary_key: String,
    pub related_table: String,
    pub related_primary_key: String,
    pub join_table: String,
    pub owner_key: String,
    pub related_key: String,
    pub direct_field: Option<String>,
    pub under_field: Option<String>,
    pub scope: Option<ScopePred>,
}

impl AssociationConfig {
    fn validate_identifiers(&self) -> Result<(), TallyError> {
        for name in [
            &self.owner_table,
            &self.owner_primary_key,
            &self.related_table,
            &self.related_primary_key,
            &self.join_table,
            &self.owner_key,
            &self.related_key,
        ] {
            ident(name)?;
        }
        for field in [&self.direct_field, &self.under_field].into_iter().flatten() {
            ident(field)?;
        }
        if let Some(scope) = &self.scope {
            scope.validate()?;
        }
        Ok(())
    }
}

/// Merge the settings layers for every declared association and validate the
/// result against the schema. Associations whose override is `false`, and
/// associations left with no enabled counter field, are absent from the
/// returned map.
pub async fn resolve<S: SchemaIntrospector>(
    introspector: &S,
    owner: &OwnerSpec,
    settings: &CountSettings,
) -> Result<BTreeMap<String, AssociationConfig>, TallyError> {
    let default_direct = format!("{}_count", owner.name);
    let default_under = format!("under_{}_count", owner.name);

    let mut resolved = BTreeMap::new();
    for def in owner.associations.iter() {
        // Layer 1: computed defaults.
        let mut direct = Some(default_direct.clone());
        let mut under = Some(default_under.clone());
        let mut scope = None;

        // Layer 2: global overrides.
        if let Some(setting) = &settings.direct_field {
            direct = setting.apply(direct, &default_direct);
        }
        if let Some(setting) = &settings.under_field {
            under = setting.apply(under, &default_under);
        }
        if let Some(pred) = &settings.scope {
            scope = Some(pred.clone());
        }

        // Layer 3: per-association override.
        match settings.override_for(def) {
            Some(AssociationOverride::Enabled(false)) => {
                tracing::debug!(
                    "Association {} is explicitly disabled, skipping",
                    def.name
                );
                continue;
            }
            Some(AssociationOverride::Enabled(true)) | None => {}
            Some(AssociationOverride::DirectField(name)) => {
                direct = Some(name.clone());
            }
            Some(AssociationOverride::Settings(assoc_settings)) => {
                if let Some(setting) = &assoc_settings.direct_field {
                    direct = setting.apply(direct, &default_direct);
                }
                if let Some(setting) = &assoc_settings.under_field {
                    under = setting.apply(under, &default_under);
                }
                if let Some(pred) = &assoc_settings.scope {
                    scope = Some(pred.clone());
                }
            }
        }

        // Validation: a field survives only if its column exists; the under
        // count additionally requires the nested-set hierarchy columns.
        if let Some(field) = &direct {
            if !introspector.has_column(&def.related_table, field).await? {
                tracing::warn!(
                    "Direct count field {}.{} does not exist, disabling it for \
                     association {}",
                    def.related_table,
                    field,
                    def.name
                );
                direct = None;
            }
        }
        if let Some(field) = &under {
            let column_ok = introspector.has_column(&def.related_table, field).await?;
            let hierarchy_ok = column_ok
                && introspector
                    .hierarchy_columns_present(&def.related_table)
                    .await?;
            if !column_ok {
                tracing::warn!(
                    "Under count field {}.{} does not exist, disabling it for \
                     association {}",
                    def.related_table,
                    field,
                    def.name
                );
                under = None;
            } else if !hierarchy_ok {
                tracing::warn!(
                    "Table {} has no nested-set hierarchy columns, disabling \
                     under count for association {}",
                    def.related_table,
                    def.name
                );
                under = None;
            }
        }

        if direct.is_none() && under.is_none() {
            tracing::warn!(
                "Association {} has no enabled counter field, dropping it from \
                 the active configuration",
                def.name
            );
            continue;
        }

        let config = AssociationConfig {
            name: def.name.clone(),
            owner_table: owner.table.clone(),
            owner_primary_key: owner.primary_key.clone(),
            related_table: def.related_table.clone(),
            related_primary_key: def.related_primary_key.clone(),
            join_table: def.join_table.clone(),
            owner_key: def.owner_key.clone(),
            related_key: def.related_key.clone(),
            direct_field: direct,
            under_field: under,
            scope,
        };
        config.validate_identifiers()?;
        resolved.insert(def.name.clone(), config);
    }

    tracing::debug!(
        "Resolved {} active association(s) for owner type {}",
        resolved.len(),
        owner.name
    );
    Ok(resolved)
}

/// Process-wide cache of resolved configurations, keyed by owning-entity-type
/// name. Resolution runs once per owner type and the result is shared for the
/// cache's lifetime.
#[derive(Debug, Default)]
pub struct SettingsCache {
    inner: RwLock<BTreeMap<String, Arc<BTreeMap<String, AssociationConfig>>>>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve_for<S: SchemaIntrospector>(
        &self,
        introspector: &S,
        owner: &OwnerSpec,
        settings: &CountSettings,
    ) -> Result<Arc<BTreeMap<String, AssociationConfig>>, TallyError> {
        if let Some(cached) = self.inner.read().get(&owner.name) {
            return Ok(cached.clone());
        }
        let resolved = Arc::new(resolve(introspector, owner, settings).await?);
        self.inner
            .write()
            .entry(owner.name.clone())
            .or_insert_with(|| resolved.clone());
        Ok(resolved)
    }

    pub fn invalidate(&self, owner_name: &str) {
        self.inner.write().remove(owner_name);
    }
}

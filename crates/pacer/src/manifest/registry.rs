use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::entity::prelude::SyncCategory;

use super::Manifest;

/// Processor configuration values, keyed by the names manifests list in
/// `config_triggers`.
pub type ProcessorConfig = BTreeMap<String, serde_json::Value>;

/// Errors raised while building a registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Manifest already registered: {name}")]
    Duplicate { name: String },

    /// Dependencies must be registered before their dependents, which also rules
    /// out cycles.
    #[error("Manifest {name} depends on unregistered manifest {dependency}")]
    UnknownDependency { name: String, dependency: String },
}

/// Catalog of manifests in registration order.
#[derive(Debug, Clone, Default)]
pub struct ManifestRegistry {
    manifests: Vec<Arc<Manifest>>,
    index: HashMap<String, usize>,
}

/// Digest of the values of `triggers` in `config`. Missing keys hash as null.
pub(crate) fn config_hash(triggers: &[String], config: &ProcessorConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    for key in triggers {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        let value = config.get(key).unwrap_or(&serde_json::Value::Null);
        hasher.update(value.to_string().as_bytes());
        hasher.update(b";");
    }
    hasher.finalize().to_hex()[..16].to_string()
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manifest. Its dependencies must already be registered.
    pub fn register(&mut self, manifest: Manifest) -> Result<(), RegistryError> {
        if self.index.contains_key(&manifest.name) {
            return Err(RegistryError::Duplicate {
                name: manifest.name,
            });
        }
        if let Some(missing) = manifest
            .depends_on
            .iter()
            .find(|dep| !self.index.contains_key(dep.as_str()))
        {
            return Err(RegistryError::UnknownDependency {
                name: manifest.name.clone(),
                dependency: missing.clone(),
            });
        }

        let mut manifest = manifest;
        manifest.config_hash = config_hash(&manifest.config_triggers, &ProcessorConfig::default());
        self.index.insert(manifest.name.clone(), self.manifests.len());
        self.manifests.push(Arc::new(manifest));
        Ok(())
    }

    /// Copy of this registry with every `config_hash` recomputed from `config`.
    pub fn with_config(&self, config: &ProcessorConfig) -> Self {
        let manifests = self
            .manifests
            .iter()
            .map(|m| {
                let mut updated = Manifest::clone(m);
                updated.config_hash = config_hash(&updated.config_triggers, config);
                Arc::new(updated)
            })
            .collect();
        Self {
            manifests,
            index: self.index.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Manifest>> {
        self.index.get(name).map(|&i| &self.manifests[i])
    }

    pub fn all(&self) -> &[Arc<Manifest>] {
        &self.manifests
    }

    /// Manifests of one category in registration order.
    pub fn by_category(&self, category: SyncCategory) -> impl Iterator<Item = &Arc<Manifest>> {
        self.manifests.iter().filter(move |m| m.category == category)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Every manifest that depends on `name` directly or transitively, in
    /// registration order.
    pub fn dependents_of(&self, name: &str) -> Vec<Arc<Manifest>> {
        let mut reached: HashSet<&str> = HashSet::from([name]);
        let mut out = Vec::new();
        // Dependents are always registered after their dependencies, so one
        // forward pass reaches the full closure.
        for manifest in &self.manifests {
            if manifest
                .depends_on
                .iter()
                .any(|dep| reached.contains(dep.as_str()))
            {
                reached.insert(manifest.name.as_str());
                out.push(Arc::clone(manifest));
            }
        }
        out
    }

    /// Digest over every manifest's identity, version and config hash.
    ///
    /// A subject whose last applied hash differs needs a re-check.
    pub fn manifest_set_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for m in &self.manifests {
            hasher.update(m.category.to_string().as_bytes());
            hasher.update(b"/");
            hasher.update(m.name.as_bytes());
            hasher.update(b"@");
            hasher.update(&m.version.to_le_bytes());
            hasher.update(m.config_hash.as_bytes());
            hasher.update(b";");
        }
        hasher.finalize().to_hex()[..16].to_string()
    }
}

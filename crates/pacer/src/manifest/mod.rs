//! Manifest registry and sync-state tracker.
//!
//! A [`Manifest`] is a named, versioned unit of work with declared dependencies and a
//! backoff policy. The [`ManifestRegistry`] is built once at startup and passed
//! explicitly to the manager, jobs and schedulers. The tracker half of this module
//! (see [`tracker`]) decides per activity which manifests are satisfied, which are
//! dirty, and which one may run next.

mod processor;
mod registry;
pub mod tracker;

use std::sync::Arc;

use crate::entity::prelude::SyncCategory;
use crate::offload::OffloadFactory;

pub use processor::{InlineProcessor, ProcessorContext, ProcessorError};
pub use registry::{ManifestRegistry, ProcessorConfig, RegistryError};
pub use tracker::{NO_DATA_BACKOFF_MS, deferred_until};

/// How a manifest's work is executed.
#[derive(Clone)]
pub enum ManifestKind {
    /// Remote data acquisition handled by the stream-fetch stage.
    Remote { streams: Vec<String> },
    /// Run in the job's own task, one sub-batch at a time.
    Inline(Arc<dyn InlineProcessor>),
    /// Run on an offload processor instance created by the factory.
    Offloaded(Arc<dyn OffloadFactory>),
}

impl std::fmt::Debug for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestKind::Remote { streams } => f.debug_struct("Remote").field("streams", streams).finish(),
            ManifestKind::Inline(_) => f.write_str("Inline"),
            ManifestKind::Offloaded(_) => f.write_str("Offloaded"),
        }
    }
}

/// A registered unit of work.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub category: SyncCategory,
    pub name: String,
    /// Bumping the version forces reprocessing of every activity.
    pub version: u32,
    /// Names of manifests that must be satisfied first.
    pub depends_on: Vec<String>,
    /// Base of the exponential error backoff.
    pub error_backoff_ms: i64,
    /// Processor configuration keys whose values feed `config_hash`.
    pub config_triggers: Vec<String>,
    /// Digest of the current values of `config_triggers`.
    pub config_hash: String,
    pub kind: ManifestKind,
}

impl Manifest {
    pub fn new(category: SyncCategory, name: impl Into<String>, version: u32, kind: ManifestKind) -> Self {
        Self {
            category,
            name: name.into(),
            version,
            depends_on: Vec::new(),
            error_backoff_ms: tracker::DEFAULT_ERROR_BACKOFF_MS,
            config_triggers: Vec::new(),
            config_hash: registry::config_hash(&[], &ProcessorConfig::default()),
            kind,
        }
    }

    /// Remote manifest fetching the given stream names.
    pub fn remote(name: impl Into<String>, version: u32, streams: &[&str]) -> Self {
        Self::new(
            SyncCategory::Streams,
            name,
            version,
            ManifestKind::Remote {
                streams: streams.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn inline(name: impl Into<String>, version: u32, processor: Arc<dyn InlineProcessor>) -> Self {
        Self::new(SyncCategory::Local, name, version, ManifestKind::Inline(processor))
    }

    pub fn offloaded(name: impl Into<String>, version: u32, factory: Arc<dyn OffloadFactory>) -> Self {
        Self::new(SyncCategory::Local, name, version, ManifestKind::Offloaded(factory))
    }

    #[must_use]
    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|s| s.to_string()).collect();
        self
    }

    #[must_use]
    pub fn error_backoff_ms(mut self, ms: i64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    #[must_use]
    pub fn config_triggers(mut self, keys: &[&str]) -> Self {
        self.config_triggers = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Stream names for remote manifests, empty otherwise.
    pub fn streams(&self) -> &[String] {
        match &self.kind {
            ManifestKind::Remote { streams } => streams,
            _ => &[],
        }
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self.kind, ManifestKind::Offloaded(_))
    }
}

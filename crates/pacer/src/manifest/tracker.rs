//! Per-activity completion and error bookkeeping.
//!
//! An entry is *satisfied* for a manifest when its stored version and config hash
//! match the manifest, it holds no unexpired error, and every dependency is
//! satisfied too. Anything else is *dirty*.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entity::prelude::{SyncCategory, SyncEntry, SyncErrorInfo, SyncErrorKind, SyncStateMap};

use super::{Manifest, ManifestRegistry};

/// Default base backoff for manifests that do not set one (5 minutes).
pub const DEFAULT_ERROR_BACKOFF_MS: i64 = 5 * 60 * 1000;

/// Minimum backoff for definitive-absence errors (30 days).
pub const NO_DATA_BACKOFF_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Exponent cap so the multiplier stays in range.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// When an error stops blocking retries: `last_ts + base * 2^count`.
pub fn deferred_until(manifest: &Manifest, error: &SyncErrorInfo) -> i64 {
    let multiplier = 1i64 << error.count.min(MAX_BACKOFF_EXPONENT);
    let mut delay = manifest.error_backoff_ms.saturating_mul(multiplier);
    if error.kind == SyncErrorKind::NoData {
        delay = delay.max(NO_DATA_BACKOFF_MS);
    }
    error.last_ts.saturating_add(delay)
}

fn has_unexpired_error(manifest: &Manifest, entry: Option<&SyncEntry>, now: i64) -> bool {
    entry
        .and_then(|e| e.error.as_ref())
        .is_some_and(|err| now < deferred_until(manifest, err))
}

/// Version/config/error check for one manifest, ignoring dependencies.
fn is_current(manifest: &Manifest, state: &SyncStateMap, now: i64) -> bool {
    let entry = state.get(manifest.category, &manifest.name);
    let Some(e) = entry else {
        return false;
    };
    e.version == Some(manifest.version)
        && e.config_hash.as_deref() == Some(manifest.config_hash.as_str())
        && !has_unexpired_error(manifest, entry, now)
}

impl ManifestRegistry {
    /// Whether `manifest` and all of its dependencies are satisfied.
    pub fn is_satisfied(&self, state: &SyncStateMap, manifest: &Manifest, now: i64) -> bool {
        is_current(manifest, state, now)
            && manifest.depends_on.iter().all(|dep| {
                self.get(dep)
                    .is_some_and(|d| self.is_satisfied(state, d, now))
            })
    }

    pub fn is_dirty(&self, state: &SyncStateMap, manifest: &Manifest, now: i64) -> bool {
        !self.is_satisfied(state, manifest, now)
    }

    /// Whether an unexpired error currently blocks `manifest`.
    pub fn is_backoff_blocked(&self, state: &SyncStateMap, manifest: &Manifest, now: i64) -> bool {
        has_unexpired_error(manifest, state.get(manifest.category, &manifest.name), now)
    }

    /// Earliest time a blocked manifest becomes eligible again.
    pub fn blocked_until(&self, state: &SyncStateMap, manifest: &Manifest) -> Option<i64> {
        state
            .get(manifest.category, &manifest.name)
            .and_then(|e| e.error.as_ref())
            .map(|err| deferred_until(manifest, err))
    }

    /// The next manifest of `category` that may run for this activity.
    ///
    /// Pending manifests taint everything that depends on them (directly or through
    /// other tainted manifests) until a fixed point is reached; unsatisfied
    /// dependencies in other categories taint as well. The first untainted pending
    /// manifest, in registration order, whose backoff has expired is returned. With
    /// `enforce_backoff` unset, backoff is ignored.
    pub fn next_runnable(
        &self,
        state: &SyncStateMap,
        category: SyncCategory,
        enforce_backoff: bool,
        now: i64,
    ) -> Option<Arc<Manifest>> {
        self.next_runnable_excluding(state, category, enforce_backoff, now, &HashSet::new())
    }

    /// [`next_runnable`](Self::next_runnable), passing over the manifests named in
    /// `skip`. Skipped manifests still taint their dependents.
    pub fn next_runnable_excluding(
        &self,
        state: &SyncStateMap,
        category: SyncCategory,
        enforce_backoff: bool,
        now: i64,
        skip: &HashSet<String>,
    ) -> Option<Arc<Manifest>> {
        let manifests: Vec<&Arc<Manifest>> = self.by_category(category).collect();
        let pending: HashSet<&str> = manifests
            .iter()
            .filter(|m| !is_current(m, state, now))
            .map(|m| m.name.as_str())
            .collect();
        if pending.is_empty() {
            return None;
        }

        let mut tainted: HashSet<&str> = HashSet::new();
        loop {
            let mut spread = false;
            for m in &manifests {
                if tainted.contains(m.name.as_str()) {
                    continue;
                }
                let blocked = m.depends_on.iter().any(|dep| {
                    pending.contains(dep.as_str())
                        || tainted.contains(dep.as_str())
                        || self
                            .get(dep)
                            .is_some_and(|d| d.category != category && !self.is_satisfied(state, d, now))
                });
                if blocked {
                    tainted.insert(m.name.as_str());
                    spread = true;
                }
            }
            if !spread {
                break;
            }
        }

        manifests
            .into_iter()
            .filter(|m| pending.contains(m.name.as_str()) && !tainted.contains(m.name.as_str()))
            .filter(|m| !skip.contains(&m.name))
            .find(|m| !enforce_backoff || !self.is_backoff_blocked(state, m, now))
            .cloned()
    }

    /// Mark `manifest` done, then reset every transitive dependent that is not
    /// sitting in an unexpired error.
    pub fn record_success(&self, state: &mut SyncStateMap, manifest: &Manifest, now: i64) {
        let entry = state.entry_mut(manifest.category, &manifest.name);
        entry.version = Some(manifest.version);
        entry.config_hash = Some(manifest.config_hash.clone());
        entry.error = None;

        for dependent in self.dependents_of(&manifest.name) {
            if !self.is_backoff_blocked(state, &dependent, now) {
                state.clear(dependent.category, &dependent.name);
            }
        }
    }

    /// Count a failure. The stored version is left untouched.
    pub fn record_error(
        &self,
        state: &mut SyncStateMap,
        manifest: &Manifest,
        message: impl Into<String>,
        kind: SyncErrorKind,
        now: i64,
    ) {
        let entry = state.entry_mut(manifest.category, &manifest.name);
        let count = entry.error.as_ref().map_or(0, |e| e.count) + 1;
        entry.error = Some(SyncErrorInfo {
            count,
            last_ts: now,
            message: message.into(),
            kind,
        });
    }

    /// Clear state for one manifest (or a whole category when `name` is `None`)
    /// together with every transitive dependent. Returns whether anything changed.
    pub fn invalidate(&self, state: &mut SyncStateMap, category: SyncCategory, name: Option<&str>) -> bool {
        let targets: Vec<Arc<Manifest>> = match name {
            Some(name) => self
                .get(name)
                .filter(|m| m.category == category)
                .cloned()
                .into_iter()
                .collect(),
            None => self.by_category(category).cloned().collect(),
        };

        let mut changed = false;
        for target in &targets {
            changed |= state.clear(target.category, &target.name);
            for dependent in self.dependents_of(&target.name) {
                changed |= state.clear(dependent.category, &dependent.name);
            }
        }
        changed
    }
}

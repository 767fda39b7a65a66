//! TerritoryCache – process-wide registry of floors, lazy loading and
//! serialized write-through mutation.
//!
//! ## Locking
//!
//! | Lock                      | Guards                          | Held for                   |
//! |---------------------------|---------------------------------|----------------------------|
//! | registry `RwLock`         | territory id → `Arc<Territory>` | lookup / insert / evict    |
//! | per-territory `Mutex`     | that floor's `TerritoryState`   | load, mutation, batch      |
//!
//! The registry lock is never held while waiting for a territory lock, so
//! different floors never wait on each other. Eviction is the one place
//! that takes the registry write lock under a territory lock: the entry is
//! removed and the instance marked `Evicted` before anyone else can lock it,
//! and late holders of the old `Arc` go back to the registry.
//!
//! ## Write failures
//!
//! A failed storage write does not undo the in-memory merge. The record
//! stays in the territory's dirty set and every later mutation on that floor
//! (or an explicit [`TerritoryCache::flush`]) retries it once.

use crate::error::{MarkerError, MarkerResult};
use crate::marker::{Marker, Mutation};
use crate::matcher::PositionMatcher;
use crate::store::{MarkerStore, TerritoryLoader};
use crate::territory::{LoadPhase, MergeOutcome, Territory, TerritoryState};
use crate::types::{ImportId, MarkerKind, ServerId, TerritoryId, TerritoryStats, Vec3};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of a single [`TerritoryCache::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
    pub outcome: MergeOutcome,
    /// The record after the merge.
    pub marker: Option<Marker>,
    /// Set when the write-through failed; memory still holds the change.
    pub write_error: Option<MarkerError>,
}

/// Result of a [`TerritoryCache::apply_batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchApplied {
    pub outcomes: Vec<MergeOutcome>,
    /// Records that lost a superseded import id (import batches only).
    pub retired: usize,
    pub failed_writes: usize,
    pub write_error: Option<MarkerError>,
}

#[derive(Debug, Default)]
struct FlushReport {
    written: usize,
    failed: usize,
    error: Option<MarkerError>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct TerritoryCache {
    territories: RwLock<HashMap<TerritoryId, Arc<Territory>>>,
    loader: TerritoryLoader,
    matcher: PositionMatcher,
}

impl TerritoryCache {
    pub fn new(store: Arc<dyn MarkerStore>, matcher: PositionMatcher) -> Self {
        Self {
            territories: RwLock::new(HashMap::new()),
            loader: TerritoryLoader::new(store),
            matcher,
        }
    }

    pub fn matcher(&self) -> &PositionMatcher {
        &self.matcher
    }

    pub fn store(&self) -> &Arc<dyn MarkerStore> {
        self.loader.store()
    }

    /// Existing entry, if the floor was ever visited.
    pub fn get(&self, id: TerritoryId) -> Option<Arc<Territory>> {
        self.territories.read().get(&id).cloned()
    }

    /// Entry for `id`, created `Unloaded` on first visit.
    fn entry(&self, id: TerritoryId) -> Arc<Territory> {
        if let Some(t) = self.territories.read().get(&id) {
            return t.clone();
        }
        self.territories
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Territory::new(id)))
            .clone()
    }

    /// Ids of every floor currently held, loaded or not.
    pub fn territory_ids(&self) -> Vec<TerritoryId> {
        let mut ids: Vec<_> = self.territories.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn all(&self) -> Vec<Arc<Territory>> {
        self.territories.read().values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// A ready territory. The first caller loads it from storage; concurrent
    /// callers block on the territory lock until that load finishes.
    pub fn get_or_load(&self, id: TerritoryId) -> MarkerResult<Arc<Territory>> {
        self.with_ready(id, |territory, _| territory.clone())
    }

    /// Lock the current instance for `id`, load it if needed and run `f`.
    /// An instance evicted while we waited for its lock is skipped.
    fn with_ready<R>(
        &self,
        id: TerritoryId,
        f: impl FnOnce(&Arc<Territory>, &mut TerritoryState) -> R,
    ) -> MarkerResult<R> {
        loop {
            let territory = self.entry(id);
            let mut state = territory.lock();
            if state.phase() == LoadPhase::Evicted {
                continue;
            }
            self.ensure_loaded(id, &mut state)?;
            return Ok(f(&territory, &mut state));
        }
    }

    /// Must be called with the territory lock held.
    fn ensure_loaded(&self, id: TerritoryId, state: &mut TerritoryState) -> MarkerResult<()> {
        match state.phase() {
            LoadPhase::Ready => return Ok(()),
            LoadPhase::Loading => {
                // Only reachable if a previous loader unwound mid-load.
                state.reset();
                return Err(MarkerError::invalid_state(
                    id,
                    "found in Loading outside of a load",
                ));
            }
            LoadPhase::Evicted => {
                return Err(MarkerError::invalid_state(id, "instance was evicted"));
            }
            LoadPhase::Unloaded => {}
        }

        state.begin_loading();
        match self.loader.load(id) {
            Ok(rows) => {
                state.initialize(id, rows, &self.matcher);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load territory {}: {}", id, e);
                state.reset();
                Err(e)
            }
        }
    }

    /// Run `f` against a ready territory's state under its lock.
    ///
    /// For bookkeeping that doesn't touch persisted fields (request flags,
    /// visibility). Use [`apply`](Self::apply) for observations.
    pub fn with_state<R>(
        &self,
        id: TerritoryId,
        f: impl FnOnce(&mut TerritoryState) -> R,
    ) -> MarkerResult<R> {
        self.with_ready(id, |_, state| f(state))
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Merge one observation into `id` and write it through.
    ///
    /// Non-finite positions are rejected with `InvalidInput` before the
    /// floor is touched.
    pub fn apply(&self, id: TerritoryId, mutation: Mutation) -> MarkerResult<Applied> {
        check_positions(id, std::slice::from_ref(&mutation))?;
        self.with_ready(id, |_, state| {
            let outcome = state.merge(&self.matcher, &mutation);
            let report = self.flush_locked(id, state);
            Applied {
                outcome,
                marker: state.get(outcome.local_id).cloned(),
                write_error: report.error,
            }
        })
    }

    /// Merge every mutation in one critical section, then write through.
    /// No other operation on `id` observes a partially applied batch, and a
    /// batch holding any non-finite position is rejected whole.
    pub fn apply_batch(&self, id: TerritoryId, mutations: &[Mutation]) -> MarkerResult<BatchApplied> {
        self.merge_batch(id, mutations, |_| 0)
    }

    /// [`apply_batch`](Self::apply_batch) for one floor of an import: after
    /// merging, every record on the floor drops `server`'s import ids other
    /// than `import_id`, including records the new import no longer lists.
    pub fn apply_import(
        &self,
        id: TerritoryId,
        server: &ServerId,
        import_id: ImportId,
        mutations: &[Mutation],
    ) -> MarkerResult<BatchApplied> {
        self.merge_batch(id, mutations, |state| state.retire_imports(server, import_id))
    }

    fn merge_batch(
        &self,
        id: TerritoryId,
        mutations: &[Mutation],
        after: impl FnOnce(&mut TerritoryState) -> usize,
    ) -> MarkerResult<BatchApplied> {
        check_positions(id, mutations)?;
        self.with_ready(id, |_, state| {
            let outcomes = mutations
                .iter()
                .map(|m| state.merge(&self.matcher, m))
                .collect();
            let retired = after(state);
            let report = self.flush_locked(id, state);
            BatchApplied {
                outcomes,
                retired,
                failed_writes: report.failed,
                write_error: report.error,
            }
        })
    }

    /// Retry pending writes for `id`. Returns how many are still pending.
    pub fn flush(&self, id: TerritoryId) -> MarkerResult<usize> {
        let Some(territory) = self.get(id) else {
            return Ok(0);
        };
        let mut state = territory.lock();
        if state.phase() != LoadPhase::Ready {
            return Ok(0);
        }
        let report = self.flush_locked(id, &mut state);
        match report.error {
            Some(e) => Err(e),
            None => Ok(state.pending_writes()),
        }
    }

    fn flush_locked(&self, id: TerritoryId, state: &mut TerritoryState) -> FlushReport {
        let mut report = FlushReport::default();
        let dirty = state.dirty_markers();
        if dirty.is_empty() {
            return report;
        }
        match self.store().upsert_many(id, &dirty) {
            Ok(()) => {
                for marker in &dirty {
                    state.mark_clean(marker.local_id);
                }
                report.written = dirty.len();
                debug!("Wrote {} markers for territory {}", report.written, id);
            }
            Err(e) => {
                report.failed = dirty.len();
                warn!(
                    "{} writes failed for territory {}, keeping them pending: {}",
                    report.failed, id, e
                );
                report.error = Some(e);
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Floor lifecycle
    // -----------------------------------------------------------------------

    /// The player entered `id`: load it if needed and forget transient
    /// markers from the previous visit.
    pub fn enter(&self, id: TerritoryId) -> MarkerResult<Arc<Territory>> {
        self.with_ready(id, |territory, state| {
            state.clear_transient();
            territory.clone()
        })
    }

    /// Replace what is currently visible of a transient `kind`.
    pub fn set_visible(&self, id: TerritoryId, kind: MarkerKind, positions: &[Vec3]) -> MarkerResult<()> {
        if let Some(bad) = positions.iter().find(|p| !p.is_finite()) {
            return Err(MarkerError::invalid_input(
                id,
                format!("non-finite {} position {}", kind, bad),
            ));
        }
        let matcher = &self.matcher;
        self.with_state(id, |state| state.replace_visible(matcher, kind, positions))
    }

    /// Drop `id` from memory. Pending writes are retried first; if they still
    /// fail the territory stays cached and the error is returned.
    pub fn evict(&self, id: TerritoryId) -> MarkerResult<bool> {
        let Some(territory) = self.get(id) else {
            return Ok(false);
        };
        let mut state = territory.lock();
        match state.phase() {
            // Someone else evicted it while we waited.
            LoadPhase::Evicted => return Ok(false),
            LoadPhase::Ready => {
                if let Some(e) = self.flush_locked(id, &mut state).error {
                    return Err(e);
                }
            }
            LoadPhase::Unloaded | LoadPhase::Loading => {}
        }
        state.mark_evicted();
        {
            let mut territories = self.territories.write();
            if territories
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, &territory))
            {
                territories.remove(&id);
            }
        }
        drop(state);
        debug!("Evicted territory {}", id);
        Ok(true)
    }

    /// Forget network ids and in-flight flags everywhere, e.g. after
    /// reconnecting to a (possibly different) server.
    pub fn reset_network_state(&self) {
        for territory in self.all() {
            territory.lock().clear_network_state();
        }
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Consistent copy of a floor's current markers, loading it if needed.
    pub fn snapshot(&self, id: TerritoryId) -> MarkerResult<Vec<Marker>> {
        self.with_state(id, |state| state.snapshot())
    }

    pub fn stats(&self, id: TerritoryId) -> Option<TerritoryStats> {
        self.get(id).map(|t| t.stats())
    }
}

/// Reject mutations whose position can't be matched or stored.
fn check_positions(id: TerritoryId, mutations: &[Mutation]) -> MarkerResult<()> {
    match mutations.iter().find(|m| !m.position().is_finite()) {
        Some(m) => Err(MarkerError::invalid_input(
            id,
            format!("non-finite {} position {}", m.kind(), m.position()),
        )),
        None => Ok(()),
    }
}

//! One floor's in-memory state.
//!
//! A [`Territory`] owns a single mutex around its [`TerritoryState`]; the
//! cache holds it for the whole of a load, a mutation or a batch, so every
//! operation on one floor is totally ordered.

use crate::marker::{Marker, Mutation};
use crate::matcher::{PositionMatcher, SpatialGrid};
use crate::types::{
    AccountId, ImportId, LocalId, MarkerKind, ServerId, TerritoryId, TerritoryStats, Vec3,
};
use log::warn;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Unloaded,
    Loading,
    Ready,
    /// Dropped from the registry. Callers still holding this instance must
    /// fetch the replacement.
    Evicted,
}

// ---------------------------------------------------------------------------
// Merge outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    /// A persisted field changed.
    Updated,
    /// Nothing durable changed (connection-scoped fields may have).
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub local_id: LocalId,
    pub change: Change,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TerritoryState {
    phase: LoadPhase,
    /// Trap / hoard records, persisted.
    markers: BTreeMap<LocalId, Marker>,
    /// Currently visible transient objects, never persisted.
    transient: BTreeMap<LocalId, Marker>,
    grid: SpatialGrid,
    next_id: u64,
    /// Records whose latest version has not reached storage yet.
    dirty: BTreeSet<LocalId>,
}

impl TerritoryState {
    fn new() -> Self {
        Self {
            phase: LoadPhase::Unloaded,
            markers: BTreeMap::new(),
            transient: BTreeMap::new(),
            grid: SpatialGrid::new(),
            next_id: 1,
            dirty: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub(crate) fn begin_loading(&mut self) {
        self.phase = LoadPhase::Loading;
    }

    /// Back to a clean `Unloaded` after a failed or abandoned load.
    pub(crate) fn reset(&mut self) {
        *self = TerritoryState::new();
    }

    /// Drop everything and refuse further use of this instance.
    pub(crate) fn mark_evicted(&mut self) {
        *self = TerritoryState::new();
        self.phase = LoadPhase::Evicted;
    }

    /// Populate from persisted rows and mark ready.
    pub(crate) fn initialize(
        &mut self,
        territory: TerritoryId,
        rows: Vec<Marker>,
        matcher: &PositionMatcher,
    ) {
        self.markers.clear();
        self.transient.clear();
        self.grid.clear();
        self.dirty.clear();

        let mut max_id = 0;
        for marker in rows {
            if let Some(existing) = self.find(matcher, marker.kind, &marker.position) {
                warn!(
                    "Territory {} has overlapping persisted rows {} and {}",
                    territory, existing, marker.local_id
                );
            }
            max_id = max_id.max(marker.local_id.0);
            self.grid
                .insert(matcher.grid_key(marker.kind, &marker.position), marker.local_id);
            self.markers.insert(marker.local_id, marker);
        }
        self.next_id = max_id + 1;
        self.phase = LoadPhase::Ready;
    }

    fn allocate_id(&mut self) -> LocalId {
        let id = LocalId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The record `(kind, position)` refers to, if any.
    pub fn find(&self, matcher: &PositionMatcher, kind: MarkerKind, position: &Vec3) -> Option<LocalId> {
        if kind.is_permanent() {
            let ids = self.grid.neighbours(matcher.grid_key(kind, position));
            matcher.best_match(kind, position, ids.iter().filter_map(|id| self.markers.get(id)))
        } else {
            matcher.best_match(kind, position, self.transient.values())
        }
    }

    pub fn get(&self, id: LocalId) -> Option<&Marker> {
        self.markers.get(&id).or_else(|| self.transient.get(&id))
    }

    /// Create or update the record `mutation` refers to.
    pub fn merge(&mut self, matcher: &PositionMatcher, mutation: &Mutation) -> MergeOutcome {
        let kind = mutation.kind();
        let position = mutation.position();

        if let Some(id) = self.find(matcher, kind, &position) {
            let permanent = kind.is_permanent();
            let record = if permanent {
                self.markers.get_mut(&id)
            } else {
                self.transient.get_mut(&id)
            };
            let (changed, durable) = record
                .map(|m| (m.apply(mutation), m.has_provenance()))
                .unwrap_or((false, false));
            if changed && permanent && durable {
                self.dirty.insert(id);
            }
            return MergeOutcome {
                local_id: id,
                change: if changed {
                    Change::Updated
                } else {
                    Change::Unchanged
                },
            };
        }

        let id = self.allocate_id();
        let marker = Marker::from_mutation(id, mutation);
        if kind.is_permanent() {
            // Server-only records stay in memory until something vouches for them.
            if marker.has_provenance() {
                self.dirty.insert(id);
            }
            self.grid.insert(matcher.grid_key(kind, &position), id);
            self.markers.insert(id, marker);
        } else {
            self.transient.insert(id, marker);
        }
        MergeOutcome {
            local_id: id,
            change: Change::Created,
        }
    }

    /// Remove `server`'s import ids other than `keep` from every permanent
    /// record on the floor. Returns how many records changed.
    pub fn retire_imports(&mut self, server: &ServerId, keep: ImportId) -> usize {
        let mut changed = 0;
        for marker in self.markers.values_mut() {
            if marker.retire_imports(server, keep) {
                self.dirty.insert(marker.local_id);
                changed += 1;
            }
        }
        changed
    }

    /// Replace the visible transient objects of `kind` with `positions`.
    /// Objects still visible keep their record; the rest are dropped.
    pub fn replace_visible(&mut self, matcher: &PositionMatcher, kind: MarkerKind, positions: &[Vec3]) {
        if kind.is_permanent() {
            return;
        }
        let previous: Vec<Marker> = {
            let ids: Vec<LocalId> = self
                .transient
                .values()
                .filter(|m| m.kind == kind)
                .map(|m| m.local_id)
                .collect();
            ids.iter().filter_map(|id| self.transient.remove(id)).collect()
        };

        for position in positions {
            let kept = matcher
                .best_match(kind, position, previous.iter())
                .and_then(|id| previous.iter().find(|m| m.local_id == id));
            let mut marker = match kept {
                Some(m) if !self.transient.contains_key(&m.local_id) => m.clone(),
                _ => Marker::new(self.allocate_id(), kind, *position),
            };
            marker.seen = true;
            self.transient.insert(marker.local_id, marker);
        }
    }

    pub fn clear_transient(&mut self) {
        self.transient.clear();
    }

    /// Permanent records first, then transient ones, each by local id.
    pub fn snapshot(&self) -> Vec<Marker> {
        self.markers
            .values()
            .chain(self.transient.values())
            .cloned()
            .collect()
    }

    pub fn permanent(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    pub fn dirty_markers(&self) -> Vec<Marker> {
        self.dirty
            .iter()
            .filter_map(|id| self.markers.get(id))
            .cloned()
            .collect()
    }

    pub(crate) fn mark_clean(&mut self, id: LocalId) {
        self.dirty.remove(&id);
    }

    pub fn pending_writes(&self) -> usize {
        self.dirty.len()
    }

    pub fn clear_network_state(&mut self) {
        for marker in self.markers.values_mut().chain(self.transient.values_mut()) {
            marker.clear_network_state();
        }
    }

    // -----------------------------------------------------------------------
    // In-flight remote requests
    // -----------------------------------------------------------------------

    /// Seen permanent markers the server doesn't know yet. Marks them
    /// `upload_requested` so a second call won't return them again.
    pub fn claim_uploads(&mut self) -> Vec<Marker> {
        self.markers
            .values_mut()
            .filter(|m| m.seen && m.network_id.is_none() && !m.upload_requested)
            .map(|m| {
                m.upload_requested = true;
                m.clone()
            })
            .collect()
    }

    pub fn release_uploads(&mut self, ids: &[LocalId]) {
        for id in ids {
            if let Some(m) = self.markers.get_mut(id) {
                m.upload_requested = false;
            }
        }
    }

    /// Seen markers with a network id that `account` hasn't confirmed yet.
    pub fn claim_seen(&mut self, account: &AccountId) -> Vec<Marker> {
        self.markers
            .values_mut()
            .filter(|m| {
                m.seen
                    && m.network_id.is_some()
                    && !m.remote_seen_requested
                    && !m.remote_seen_on.contains(account)
            })
            .map(|m| {
                m.remote_seen_requested = true;
                m.clone()
            })
            .collect()
    }

    pub fn release_seen(&mut self, ids: &[LocalId]) {
        for id in ids {
            if let Some(m) = self.markers.get_mut(id) {
                m.remote_seen_requested = false;
            }
        }
    }

    pub fn stats(&self, territory: TerritoryId) -> TerritoryStats {
        let mut stats = TerritoryStats {
            territory: Some(territory),
            transient: self.transient.len(),
            pending_writes: self.dirty.len(),
            ..TerritoryStats::default()
        };
        for m in self.markers.values() {
            match m.kind {
                MarkerKind::Trap => stats.traps += 1,
                MarkerKind::Hoard => stats.hoards += 1,
                _ => {}
            }
            if m.seen {
                stats.seen += 1;
            }
            if m.was_imported {
                stats.imported += 1;
            }
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Territory
// ---------------------------------------------------------------------------

/// A floor, identified by its territory type.
#[derive(Debug)]
pub struct Territory {
    id: TerritoryId,
    state: Mutex<TerritoryState>,
}

impl Territory {
    pub fn new(id: TerritoryId) -> Self {
        Self {
            id,
            state: Mutex::new(TerritoryState::new()),
        }
    }

    pub fn id(&self) -> TerritoryId {
        self.id
    }

    pub fn phase(&self) -> LoadPhase {
        self.state.lock().phase()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == LoadPhase::Ready
    }

    /// Consistent copy of every current marker, for readers such as the
    /// renderer.
    pub fn snapshot(&self) -> Vec<Marker> {
        self.state.lock().snapshot()
    }

    pub fn stats(&self) -> TerritoryStats {
        self.state.lock().stats(self.id)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TerritoryState> {
        self.state.lock()
    }
}

//! Position matching: decides whether two observations are the same object.
//!
//! Two markers match iff their kinds are equal and their positions are closer
//! than the kind's tolerance. Lookups go through a [`SpatialGrid`] whose cell
//! size equals the tolerance, so only the 27 surrounding cells need checking.

use crate::marker::Marker;
use crate::types::{LocalId, MarkerKind, Vec3};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Tolerances
// ---------------------------------------------------------------------------

/// Matching radius per kind, in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub trap: f32,
    pub hoard: f32,
    pub silver_coffer: f32,
    pub unknown: f32,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            trap: 0.5,
            hoard: 0.5,
            silver_coffer: 0.25,
            unknown: 0.1,
        }
    }
}

impl Tolerances {
    pub fn for_kind(&self, kind: MarkerKind) -> f32 {
        match kind {
            MarkerKind::Trap => self.trap,
            MarkerKind::Hoard => self.hoard,
            MarkerKind::SilverCoffer => self.silver_coffer,
            MarkerKind::Unknown => self.unknown,
        }
    }

    /// Every tolerance must be a positive, finite distance.
    pub fn validate(&self) -> Result<(), String> {
        for kind in MarkerKind::ALL {
            let t = self.for_kind(kind);
            if !t.is_finite() || t <= 0.0 {
                return Err(format!("tolerance for {} must be > 0, got {}", kind, t));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PositionMatcher {
    tolerances: Tolerances,
}

impl PositionMatcher {
    pub fn new(tolerances: Tolerances) -> Self {
        Self { tolerances }
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    pub fn tolerance(&self, kind: MarkerKind) -> f32 {
        self.tolerances.for_kind(kind)
    }

    /// Symmetric match on kind and distance only. Provenance and network
    /// state never take part.
    pub fn matches(&self, a: &Marker, b: &Marker) -> bool {
        self.matches_at(a.kind, &a.position, b)
    }

    pub fn matches_at(&self, kind: MarkerKind, position: &Vec3, candidate: &Marker) -> bool {
        if kind != candidate.kind {
            return false;
        }
        let tol = self.tolerance(kind);
        position.distance_squared(&candidate.position) < tol * tol
    }

    /// Pick the record `(kind, position)` refers to among `candidates`.
    ///
    /// Nearest wins; equal distances fall back to the lowest local id.
    pub fn best_match<'a, I>(&self, kind: MarkerKind, position: &Vec3, candidates: I) -> Option<LocalId>
    where
        I: IntoIterator<Item = &'a Marker>,
    {
        let mut best: Option<(f32, LocalId)> = None;
        let mut in_range = 0usize;

        for candidate in candidates {
            if !self.matches_at(kind, position, candidate) {
                continue;
            }
            in_range += 1;
            let d = position.distance_squared(&candidate.position);
            let better = match best {
                None => true,
                Some((best_d, best_id)) => match d.total_cmp(&best_d) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => candidate.local_id < best_id,
                    std::cmp::Ordering::Greater => false,
                },
            };
            if better {
                best = Some((d, candidate.local_id));
            }
        }

        if in_range > 1 {
            if let Some((_, id)) = best {
                debug!(
                    "{} {} records within tolerance of {}, picked {}",
                    in_range, kind, position, id
                );
            }
        }
        best.map(|(_, id)| id)
    }

    pub fn grid_key(&self, kind: MarkerKind, position: &Vec3) -> GridKey {
        GridKey::quantize(kind, position, self.tolerance(kind))
    }
}

// ---------------------------------------------------------------------------
// Spatial grid
// ---------------------------------------------------------------------------

/// Rounded-coordinate bucket, one grid per kind.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct GridKey {
    pub kind: MarkerKind,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl GridKey {
    pub fn quantize(kind: MarkerKind, position: &Vec3, cell_size: f32) -> Self {
        Self {
            kind,
            x: (position.x / cell_size).floor() as i32,
            y: (position.y / cell_size).floor() as i32,
            z: (position.z / cell_size).floor() as i32,
        }
    }
}

/// Buckets local ids by [`GridKey`] so lookups don't scan the whole floor.
#[derive(Debug, Default)]
pub struct SpatialGrid {
    cells: HashMap<GridKey, Vec<LocalId>>,
}

impl SpatialGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: GridKey, id: LocalId) {
        self.cells.entry(key).or_default().push(id);
    }

    /// Ids in `key`'s cell and its 26 neighbours.
    pub fn neighbours(&self, key: GridKey) -> Vec<LocalId> {
        let mut ids = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell = GridKey {
                        kind: key.kind,
                        x: key.x.saturating_add(dx),
                        y: key.y.saturating_add(dy),
                        z: key.z.saturating_add(dz),
                    };
                    if let Some(bucket) = self.cells.get(&cell) {
                        ids.extend_from_slice(bucket);
                    }
                }
            }
        }
        ids
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

//! Persisted storage: the [`MarkerStore`] contract, an in-memory store, a
//! JSON-file store, and the [`TerritoryLoader`] that reads a floor back.
//!
//! Stores key records by `(territory, local_id)` and must accept repeated
//! upserts of the same record. Connection-scoped fields (`network_id`,
//! request flags) are never written.

use crate::error::{MarkerError, MarkerResult};
use crate::marker::Marker;
use crate::types::{LocalId, TerritoryId};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

pub trait MarkerStore: Send + Sync {
    /// Every record persisted for `territory`. Read-only.
    fn load(&self, territory: TerritoryId) -> MarkerResult<Vec<Marker>>;

    /// Insert or replace the record keyed by `marker.local_id`.
    fn upsert(&self, territory: TerritoryId, marker: &Marker) -> MarkerResult<()>;

    /// Insert or replace several records of one floor. Stores that rewrite
    /// a whole floor per write override this to write once.
    fn upsert_many(&self, territory: TerritoryId, markers: &[Marker]) -> MarkerResult<()> {
        for marker in markers {
            self.upsert(territory, marker)?;
        }
        Ok(())
    }

    /// Territories with at least one persisted record.
    fn territories(&self) -> MarkerResult<Vec<TerritoryId>>;
}

/// Copy of `marker` with connection-scoped state stripped.
fn persisted_copy(marker: &Marker) -> Marker {
    let mut copy = marker.clone();
    copy.clear_network_state();
    copy
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store, mainly for tests. Can be switched unavailable to exercise
/// failure paths, and slowed down to widen load races.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<TerritoryId, BTreeMap<LocalId, Marker>>>,
    unavailable: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    loads: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, territory: TerritoryId) -> usize {
        self.rows.lock().get(&territory).map(|r| r.len()).unwrap_or(0)
    }

    /// Seed a row directly, bypassing the cache.
    pub fn insert_row(&self, territory: TerritoryId, marker: Marker) {
        self.rows
            .lock()
            .entry(territory)
            .or_default()
            .insert(marker.local_id, persisted_copy(&marker));
    }

    fn check_available(&self, territory: TerritoryId) -> MarkerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MarkerError::storage(territory, "memory store switched off"));
        }
        Ok(())
    }
}

impl MarkerStore for MemoryStore {
    fn load(&self, territory: TerritoryId) -> MarkerResult<Vec<Marker>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.check_available(territory)?;
        Ok(self
            .rows
            .lock()
            .get(&territory)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert(&self, territory: TerritoryId, marker: &Marker) -> MarkerResult<()> {
        self.check_available(territory)?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .entry(territory)
            .or_default()
            .insert(marker.local_id, persisted_copy(marker));
        Ok(())
    }

    fn territories(&self) -> MarkerResult<Vec<TerritoryId>> {
        let mut ids: Vec<_> = self.rows.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TerritoryFile {
    territory: TerritoryId,
    #[serde(default)]
    markers: Vec<Marker>,
}

/// One `territory-<id>.json` file per floor under a directory.
///
/// Writes go to a temporary file which is then renamed over the old one, so
/// a crash mid-write leaves the previous version intact.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    file_writes: AtomicUsize,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> MarkerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            MarkerError::storage(TerritoryId(0), format!("create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            file_writes: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Floor files rewritten since the store was opened.
    pub fn file_writes(&self) -> usize {
        self.file_writes.load(Ordering::SeqCst)
    }

    fn path_for(&self, territory: TerritoryId) -> PathBuf {
        self.dir.join(format!("territory-{}.json", territory.0))
    }

    fn read_file(&self, territory: TerritoryId) -> MarkerResult<Vec<Marker>> {
        let path = self.path_for(territory);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MarkerError::storage(
                    territory,
                    format!("read {}: {}", path.display(), e),
                ))
            }
        };
        let file: TerritoryFile = serde_json::from_slice(&bytes).map_err(|e| {
            MarkerError::storage(territory, format!("parse {}: {}", path.display(), e))
        })?;
        if file.territory != territory {
            warn!(
                "{} claims territory {}, expected {}",
                path.display(),
                file.territory,
                territory
            );
        }
        Ok(file.markers)
    }

    fn write_file(&self, territory: TerritoryId, markers: Vec<Marker>) -> MarkerResult<()> {
        let path = self.path_for(territory);
        let tmp = path.with_extension("json.tmp");
        let file = TerritoryFile { territory, markers };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| MarkerError::storage(territory, format!("encode: {}", e)))?;
        fs::write(&tmp, bytes).map_err(|e| {
            MarkerError::storage(territory, format!("write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            MarkerError::storage(territory, format!("rename {}: {}", path.display(), e))
        })?;
        self.file_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MarkerStore for JsonFileStore {
    fn load(&self, territory: TerritoryId) -> MarkerResult<Vec<Marker>> {
        self.read_file(territory)
    }

    fn upsert(&self, territory: TerritoryId, marker: &Marker) -> MarkerResult<()> {
        self.upsert_many(territory, std::slice::from_ref(marker))
    }

    /// One read and one rewrite of the floor file, however many records.
    fn upsert_many(&self, territory: TerritoryId, markers: &[Marker]) -> MarkerResult<()> {
        if markers.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut rows: BTreeMap<LocalId, Marker> = self
            .read_file(territory)?
            .into_iter()
            .map(|m| (m.local_id, m))
            .collect();
        for marker in markers {
            rows.insert(marker.local_id, persisted_copy(marker));
        }
        self.write_file(territory, rows.into_values().collect())
    }

    fn territories(&self) -> MarkerResult<Vec<TerritoryId>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MarkerError::storage(TerritoryId(0), format!("list {}: {}", self.dir.display(), e))
        })?;
        let mut ids: Vec<TerritoryId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let id = name.strip_prefix("territory-")?.strip_suffix(".json")?;
                id.parse().ok().map(TerritoryId)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Reads a floor's persisted records for the cache.
#[derive(Clone)]
pub struct TerritoryLoader {
    store: Arc<dyn MarkerStore>,
}

impl TerritoryLoader {
    pub fn new(store: Arc<dyn MarkerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MarkerStore> {
        &self.store
    }

    /// Persisted permanent markers for `territory`, ordered by local id.
    ///
    /// Transient kinds are never expected on disk; stray rows are skipped.
    pub fn load(&self, territory: TerritoryId) -> MarkerResult<Vec<Marker>> {
        info!("Loading territory {}", territory);
        let mut markers = self.store.load(territory)?;

        let before = markers.len();
        markers.retain(|m| m.is_permanent());
        if markers.len() != before {
            warn!(
                "Skipped {} non-permanent rows in territory {}",
                before - markers.len(),
                territory
            );
        }
        markers.sort_by_key(|m| m.local_id);

        info!("Loaded {} markers for territory {}", markers.len(), territory);
        Ok(markers)
    }
}

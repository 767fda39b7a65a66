//! Palace Markers
//!
//! Tracks traps, hoard coffers and transient coffers on procedurally
//! regenerated dungeon floors, persists them locally and reconciles them
//! with a crowd-sourced remote catalog so every physical location ends up as
//! exactly one record.
//!
//! ## Architecture
//!
//! ```text
//! RemoteSync  (remote.rs)        ← remote catalog flows, timeouts, roles
//!   └── Reconciler  (reconcile.rs)   ← batches, export-file import
//!         └── TerritoryCache  (cache.rs)  ← registry, load-once, write-through
//!               ├── Territory  (territory.rs) ← per-floor lock + marker set
//!               │     └── PositionMatcher  (matcher.rs) ← tolerance + grid
//!               └── TerritoryLoader / MarkerStore  (store.rs)
//! ```
//!
//! Rendering (`render.rs`) only reads snapshots.

// Data model, protocol shapes and rendering are always available.
pub mod config;
pub mod error;
pub mod marker;
pub mod matcher;
pub mod protocol;
pub mod render;
pub mod types;

// Runtime modules require the `runtime` feature.
#[cfg(feature = "runtime")]
pub mod cache;
#[cfg(feature = "runtime")]
pub mod reconcile;
#[cfg(feature = "runtime")]
pub mod remote;
#[cfg(feature = "runtime")]
pub mod store;
#[cfg(feature = "runtime")]
pub mod territory;

// Convenience re-exports (runtime only)
#[cfg(feature = "runtime")]
pub use cache::{Applied, BatchApplied, TerritoryCache};
#[cfg(feature = "runtime")]
pub use reconcile::{ImportReport, ReconcileSummary, Reconciler};
#[cfg(feature = "runtime")]
pub use remote::{RemoteCatalog, RemoteOutcome, RemoteSync, SyncReport};
#[cfg(feature = "runtime")]
pub use store::{JsonFileStore, MarkerStore, MemoryStore, TerritoryLoader};
#[cfg(feature = "runtime")]
pub use territory::{Change, LoadPhase, MergeOutcome, Territory};

pub use config::PalConfig;
pub use error::{MarkerError, MarkerResult};
pub use marker::{ImportRef, Marker, MarkerConfig, Mutation};
pub use matcher::{PositionMatcher, Tolerances};
pub use types::{
    AccountId, ImportId, LocalId, MarkerKind, NetworkId, ServerId, TerritoryId, TerritoryStats,
    Vec3,
};

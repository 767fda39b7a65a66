//! Marker records and their merge rules.
//!
//! A [`Marker`] is the canonical record for one physical location on a floor.
//! Every change to it goes through [`Marker::apply`] with a [`Mutation`], so
//! provenance only ever grows (except for a re-import replacing one server's
//! earlier import).

use crate::types::{AccountId, ImportId, LocalId, MarkerKind, NetworkId, ServerId, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version stamped on records when they are first created.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Kind side table
// ---------------------------------------------------------------------------

/// Per-kind drawing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerConfig {
    pub radius: f32,
    pub offset_y: f32,
}

impl MarkerConfig {
    const EMPTY: MarkerConfig = MarkerConfig {
        radius: 0.25,
        offset_y: 0.0,
    };

    pub fn for_kind(kind: MarkerKind) -> MarkerConfig {
        match kind {
            MarkerKind::Trap => MarkerConfig {
                radius: 1.7,
                offset_y: 0.0,
            },
            MarkerKind::Hoard => MarkerConfig {
                radius: 1.7,
                offset_y: -0.03,
            },
            MarkerKind::SilverCoffer => MarkerConfig {
                radius: 1.0,
                offset_y: 0.0,
            },
            MarkerKind::Unknown => Self::EMPTY,
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// One export file that contributed a record, tagged with the server it was
/// exported from so a later import from the same server can replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRef {
    pub server: ServerId,
    pub id: ImportId,
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A single observation or reconciliation event for one location.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// The local player saw the object.
    ObserveLocal { kind: MarkerKind, position: Vec3 },
    /// A remote account has confirmed seeing the object.
    ConfirmRemote {
        kind: MarkerKind,
        position: Vec3,
        account: AccountId,
    },
    /// The object is part of an imported export file.
    Import {
        kind: MarkerKind,
        position: Vec3,
        server: ServerId,
        import_id: ImportId,
    },
    /// The connected server knows the object under `network_id`.
    RemoteSync {
        kind: MarkerKind,
        position: Vec3,
        network_id: NetworkId,
        seen_by: Option<AccountId>,
    },
}

impl Mutation {
    pub fn observe_local(kind: MarkerKind, position: Vec3) -> Self {
        Mutation::ObserveLocal { kind, position }
    }

    pub fn confirm_remote(kind: MarkerKind, position: Vec3, account: AccountId) -> Self {
        Mutation::ConfirmRemote {
            kind,
            position,
            account,
        }
    }

    pub fn import(kind: MarkerKind, position: Vec3, server: ServerId, import_id: ImportId) -> Self {
        Mutation::Import {
            kind,
            position,
            server,
            import_id,
        }
    }

    pub fn kind(&self) -> MarkerKind {
        match self {
            Mutation::ObserveLocal { kind, .. }
            | Mutation::ConfirmRemote { kind, .. }
            | Mutation::Import { kind, .. }
            | Mutation::RemoteSync { kind, .. } => *kind,
        }
    }

    pub fn position(&self) -> Vec3 {
        match self {
            Mutation::ObserveLocal { position, .. }
            | Mutation::ConfirmRemote { position, .. }
            | Mutation::Import { position, .. }
            | Mutation::RemoteSync { position, .. } => *position,
        }
    }
}

// ---------------------------------------------------------------------------
// Marker record
// ---------------------------------------------------------------------------

/// Canonical record for one location.
///
/// Identity is `(kind, position)` under the matcher's tolerance; the
/// `local_id` only exists to key storage writes and break ties. No
/// `PartialEq`: compare through [`crate::matcher::PositionMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub local_id: LocalId,
    pub kind: MarkerKind,
    pub position: Vec3,

    /// Encountered by the local player at this location.
    #[serde(default)]
    pub seen: bool,

    /// Id on the server we're currently connected to.
    #[serde(skip)]
    pub network_id: Option<NetworkId>,

    /// Submitted for creation on the server; response pending.
    #[serde(skip)]
    pub upload_requested: bool,

    /// Account ids that confirmed this marker, one per remote endpoint.
    #[serde(default)]
    pub remote_seen_on: BTreeSet<AccountId>,

    /// Seen-confirmation submitted; response pending.
    #[serde(skip)]
    pub remote_seen_requested: bool,

    #[serde(default)]
    pub imports: Vec<ImportRef>,

    #[serde(default)]
    pub was_imported: bool,

    #[serde(default)]
    pub since_version: Option<String>,
}

impl Marker {
    pub fn new(local_id: LocalId, kind: MarkerKind, position: Vec3) -> Self {
        Self {
            local_id,
            kind,
            position,
            seen: false,
            network_id: None,
            upload_requested: false,
            remote_seen_on: BTreeSet::new(),
            remote_seen_requested: false,
            imports: Vec::new(),
            was_imported: false,
            since_version: Some(SCHEMA_VERSION.to_string()),
        }
    }

    /// Build a fresh record from the mutation that first observed it.
    pub fn from_mutation(local_id: LocalId, mutation: &Mutation) -> Self {
        let mut marker = Marker::new(local_id, mutation.kind(), mutation.position());
        marker.apply(mutation);
        marker
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }

    pub fn config(&self) -> MarkerConfig {
        MarkerConfig::for_kind(self.kind)
    }

    pub fn import_ids(&self) -> Vec<ImportId> {
        self.imports.iter().map(|i| i.id).collect()
    }

    /// Seen by us or by any remote account.
    pub fn is_seen_anywhere(&self) -> bool {
        self.seen || !self.remote_seen_on.is_empty()
    }

    /// Merge `mutation` into this record.
    ///
    /// Returns `true` when a persisted field changed. Applying the same
    /// mutation again is a no-op and returns `false`.
    pub fn apply(&mut self, mutation: &Mutation) -> bool {
        match mutation {
            Mutation::ObserveLocal { .. } => {
                let changed = !self.seen;
                self.seen = true;
                changed
            }
            Mutation::ConfirmRemote { account, .. } => {
                self.remote_seen_requested = false;
                self.remote_seen_on.insert(account.clone())
            }
            Mutation::Import {
                server, import_id, ..
            } => {
                let mut changed = self.retire_imports(server, *import_id);
                if !self.imports.iter().any(|i| i.id == *import_id) {
                    self.imports.push(ImportRef {
                        server: server.clone(),
                        id: *import_id,
                    });
                    changed = true;
                }
                if !self.was_imported {
                    self.was_imported = true;
                    changed = true;
                }
                changed
            }
            Mutation::RemoteSync {
                network_id,
                seen_by,
                ..
            } => {
                self.network_id = Some(*network_id);
                self.upload_requested = false;
                match seen_by {
                    Some(account) => self.remote_seen_on.insert(account.clone()),
                    None => false,
                }
            }
        }
    }

    /// Drop `server`'s import entries other than `keep`. `was_imported`
    /// stays set: the record was imported once and keeps counting as such.
    pub fn retire_imports(&mut self, server: &ServerId, keep: ImportId) -> bool {
        let before = self.imports.len();
        self.imports.retain(|i| i.server != *server || i.id == keep);
        self.imports.len() != before
    }

    /// Anything vouching for this record: our own sighting, a remote
    /// account's confirmation, or an import. Only such records are persisted.
    pub fn has_provenance(&self) -> bool {
        self.is_seen_anywhere() || self.was_imported
    }

    /// Forget everything tied to the current server connection.
    pub fn clear_network_state(&mut self) {
        self.network_id = None;
        self.upload_requested = false;
        self.remote_seen_requested = false;
    }
}

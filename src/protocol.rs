//! Shapes that cross the core's boundaries.
//!
//! This module owns every message exchanged with the remote catalog and the
//! layout of downloadable export files. How those bytes travel is the
//! transport's business; the core only produces and consumes these structs.
//!
//! ## Boundaries
//!
//! | Shape              | Direction            | Used by                      |
//! |--------------------|----------------------|------------------------------|
//! | `RemoteMarker`     | server → core        | download / upload reply      |
//! | `MarkerUpload`     | core → server        | upload of local-only markers |
//! | `FloorStatistics`  | server → core        | statistics view              |
//! | `ExportFile`       | file → core          | import                       |
//!
//! ## Design rules
//!
//! 1. Every struct is `Serialize + Deserialize` with snake_case JSON.
//! 2. Marker kinds travel as numeric codes (`type`), see [`MarkerKind::code`].
//! 3. Network ids only appear in server replies; they are never written to
//!    local storage.

use crate::marker::Marker;
use crate::types::{MarkerKind, NetworkId, TerritoryId, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Remote markers
// ---------------------------------------------------------------------------

/// A marker as the connected server knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMarker {
    pub network_id: Uuid,
    #[serde(rename = "type")]
    pub kind_code: u16,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Whether the requesting account has already confirmed it.
    #[serde(default)]
    pub seen: bool,
}

impl RemoteMarker {
    pub fn kind(&self) -> MarkerKind {
        MarkerKind::from_code(self.kind_code)
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn network_id(&self) -> NetworkId {
        NetworkId(self.network_id)
    }
}

/// A locally observed marker submitted for creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerUpload {
    #[serde(rename = "type")]
    pub kind_code: u16,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<&Marker> for MarkerUpload {
    fn from(marker: &Marker) -> Self {
        Self {
            kind_code: marker.kind.code(),
            x: marker.position.x,
            y: marker.position.y,
            z: marker.position.z,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregate counts for one floor across all contributors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorStatistics {
    pub territory_type: u16,
    pub trap_count: u32,
    pub hoard_count: u32,
}

impl FloorStatistics {
    pub fn territory(&self) -> TerritoryId {
        TerritoryId(self.territory_type)
    }
}

// ---------------------------------------------------------------------------
// Export files
// ---------------------------------------------------------------------------

/// A downloadable snapshot of a server's catalog.
///
/// Importing a second file from the same `server_url` replaces the first
/// file's provenance on every record it touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub server_url: String,
    pub export_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub floors: Vec<ExportFloor>,
}

impl ExportFile {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn object_count(&self) -> usize {
        self.floors.iter().map(|f| f.objects.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFloor {
    pub territory_type: u16,
    #[serde(default)]
    pub objects: Vec<ExportObject>,
}

impl ExportFloor {
    pub fn territory(&self) -> TerritoryId {
        TerritoryId(self.territory_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportObject {
    #[serde(rename = "type")]
    pub kind_code: u16,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl ExportObject {
    pub fn kind(&self) -> MarkerKind {
        MarkerKind::from_code(self.kind_code)
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

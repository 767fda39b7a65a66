//! Layered configuration: serde defaults, an optional file, then `PAL__*`
//! environment variables (`PAL__REMOTE__MODE=offline`, …).

use crate::error::{MarkerError, MarkerResult};
use crate::matcher::Tolerances;
use crate::types::{AccountId, MarkerKind};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Role required to view aggregate floor statistics.
pub const ROLE_STATISTICS_VIEW: &str = "statistics:view";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON file per territory.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("palace-markers"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub mode: RemoteMode,
    pub url: String,
    /// Upper bound for any single remote call.
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mode: RemoteMode::Online,
            url: "http://localhost:5415".into(),
            timeout_ms: 10_000,
        }
    }
}

/// What we know about our account on one remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAccount {
    pub account_id: Option<String>,
    pub roles: Vec<String>,
    /// Submit seen-confirmations for markers we encounter.
    pub share_seen: bool,
}

impl Default for ServerAccount {
    fn default() -> Self {
        Self {
            account_id: None,
            roles: Vec::new(),
            share_seen: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerDisplay {
    pub show: bool,
    /// Hide markers nobody has confirmed yet.
    pub only_visible_after_pull: bool,
    /// ABGR, as the overlay expects.
    pub color: u32,
    pub fill: bool,
}

impl Default for MarkerDisplay {
    fn default() -> Self {
        Self {
            show: true,
            only_visible_after_pull: true,
            color: 0x6600_00FF,
            fill: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub trap: MarkerDisplay,
    pub hoard: MarkerDisplay,
    pub silver_coffer: MarkerDisplay,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            trap: MarkerDisplay::default(),
            hoard: MarkerDisplay {
                color: 0x6600_FFFF,
                ..MarkerDisplay::default()
            },
            silver_coffer: MarkerDisplay {
                show: false,
                only_visible_after_pull: false,
                color: 0x66FF_FFFF,
                fill: true,
            },
        }
    }
}

impl DisplayConfig {
    /// `None` for kinds that are never drawn.
    pub fn for_kind(&self, kind: MarkerKind) -> Option<&MarkerDisplay> {
        match kind {
            MarkerKind::Trap => Some(&self.trap),
            MarkerKind::Hoard => Some(&self.hoard),
            MarkerKind::SilverCoffer => Some(&self.silver_coffer),
            MarkerKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalConfig {
    pub storage: StorageConfig,
    pub matching: Tolerances,
    pub remote: RemoteConfig,
    /// Keyed by server url.
    pub servers: HashMap<String, ServerAccount>,
    pub display: DisplayConfig,
}

impl PalConfig {
    /// Load defaults, then `path` (format by extension) if given, then env.
    pub fn load(path: Option<&Path>) -> MarkerResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("PAL")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: PalConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> MarkerResult<()> {
        self.matching.validate().map_err(MarkerError::config)?;
        if self.remote.timeout_ms == 0 {
            return Err(MarkerError::config("remote.timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.remote.mode == RemoteMode::Online
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }

    pub fn has_role(&self, server: &str, role: &str) -> bool {
        self.servers
            .get(server)
            .map(|s| s.roles.iter().any(|r| r == role))
            .unwrap_or(false)
    }

    pub fn account_for(&self, server: &str) -> Option<AccountId> {
        self.servers
            .get(server)
            .and_then(|s| s.account_id.clone())
            .map(AccountId)
    }

    pub fn shares_seen(&self, server: &str) -> bool {
        self.servers.get(server).map(|s| s.share_seen).unwrap_or(false)
    }
}

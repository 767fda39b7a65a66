//! Remote catalog boundary and the sync flows built on it.
//!
//! The transport lives behind [`RemoteCatalog`]. [`RemoteSync`] decides
//! whether a call may be attempted at all (mode, account, roles), bounds it
//! with the configured timeout, and hands results back through the
//! [`Reconciler`] – never holding a territory lock across an `.await`.
//!
//! | Flow                  | Claim flag              | On success                      |
//! |-----------------------|-------------------------|---------------------------------|
//! | `download_floor`      | –                       | network ids + remote seen merge |
//! | `upload_pending`      | `upload_requested`      | network ids, seen by us         |
//! | `confirm_seen`        | `remote_seen_requested` | account added to seen set       |
//! | `fetch_statistics`    | –                       | returned to caller              |

use crate::config::{PalConfig, ROLE_STATISTICS_VIEW};
use crate::error::{MarkerError, MarkerResult};
use crate::marker::Mutation;
use crate::protocol::{FloorStatistics, MarkerUpload, RemoteMarker};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::types::{LocalId, NetworkId, TerritoryId};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Client for one remote server. Rejections by server policy must come back
/// as [`MarkerError::PermissionDenied`].
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Base url, used to look up our account and roles in the config.
    fn server_url(&self) -> &str;

    async fn download_floor(&self, territory: TerritoryId) -> MarkerResult<Vec<RemoteMarker>>;

    /// Returns the created markers with their new network ids.
    async fn upload_markers(
        &self,
        territory: TerritoryId,
        markers: Vec<MarkerUpload>,
    ) -> MarkerResult<Vec<RemoteMarker>>;

    async fn mark_seen(&self, territory: TerritoryId, markers: Vec<NetworkId>) -> MarkerResult<()>;

    async fn fetch_statistics(&self) -> MarkerResult<Vec<FloorStatistics>>;
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome<T> {
    Completed(T),
    /// Not attempted (offline, no account, sharing disabled).
    Skipped(&'static str),
    /// Refused by policy. Show `notice` to the user; don't retry.
    Denied { notice: String },
}

impl<T> RemoteOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RemoteOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, RemoteOutcome::Denied { .. })
    }
}

/// What one [`RemoteSync::sync_floor`] pass did.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub downloaded: RemoteOutcome<ReconcileSummary>,
    pub uploaded: RemoteOutcome<usize>,
    pub confirmed: RemoteOutcome<usize>,
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

pub struct RemoteSync {
    catalog: Arc<dyn RemoteCatalog>,
    reconciler: Reconciler,
    config: Arc<PalConfig>,
}

impl RemoteSync {
    pub fn new(catalog: Arc<dyn RemoteCatalog>, reconciler: Reconciler, config: Arc<PalConfig>) -> Self {
        Self {
            catalog,
            reconciler,
            config,
        }
    }

    fn server(&self) -> &str {
        self.catalog.server_url()
    }

    /// Run `fut` under the configured timeout.
    async fn call<T, F>(&self, operation: &str, fut: F) -> MarkerResult<T>
    where
        F: Future<Output = MarkerResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout(), fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} against {} timed out", operation, self.server());
                Err(MarkerError::timeout(operation))
            }
        }
    }

    fn denied<T>(&self, operation: &str, err: MarkerError) -> MarkerResult<RemoteOutcome<T>> {
        if err.is_permission_denied() {
            warn!("{} denied by {}: {}", operation, self.server(), err);
            Ok(RemoteOutcome::Denied {
                notice: format!("{} is not permitted on {}", operation, self.server()),
            })
        } else {
            Err(err)
        }
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Merge the server's markers for `territory` into the cache.
    pub async fn download_floor(&self, territory: TerritoryId) -> MarkerResult<RemoteOutcome<ReconcileSummary>> {
        if !self.config.is_online() {
            return Ok(RemoteOutcome::Skipped("offline"));
        }

        let markers = match self
            .call("download", self.catalog.download_floor(territory))
            .await
        {
            Ok(markers) => markers,
            Err(e) => return self.denied("download", e),
        };
        debug!(
            "Downloaded {} markers for territory {} from {}",
            markers.len(),
            territory,
            self.server()
        );

        let account = self.config.account_for(self.server());
        let summary = self
            .reconciler
            .merge_remote(territory, &markers, account.as_ref())?;
        Ok(RemoteOutcome::Completed(summary))
    }

    /// Submit locally seen markers the server doesn't know yet.
    pub async fn upload_pending(&self, territory: TerritoryId) -> MarkerResult<RemoteOutcome<usize>> {
        if !self.config.is_online() {
            return Ok(RemoteOutcome::Skipped("offline"));
        }

        let cache = self.reconciler.cache();
        let claimed = cache.with_state(territory, |s| s.claim_uploads())?;
        if claimed.is_empty() {
            return Ok(RemoteOutcome::Completed(0));
        }
        let ids: Vec<LocalId> = claimed.iter().map(|m| m.local_id).collect();
        let uploads: Vec<MarkerUpload> = claimed.iter().map(MarkerUpload::from).collect();

        let result = self
            .call("upload", self.catalog.upload_markers(territory, uploads))
            .await;
        let created = match result {
            Ok(created) => created,
            Err(e) => {
                cache.with_state(territory, |s| s.release_uploads(&ids))?;
                return self.denied("upload", e);
            }
        };

        // Everything we upload is something we have seen ourselves.
        let created: Vec<RemoteMarker> = created
            .into_iter()
            .map(|mut m| {
                m.seen = true;
                m
            })
            .collect();
        let account = self.config.account_for(self.server());
        let merged = self
            .reconciler
            .merge_remote(territory, &created, account.as_ref());
        let released = cache.with_state(territory, |s| s.release_uploads(&ids));
        merged?;
        released?;

        info!(
            "Uploaded {} markers for territory {} to {}",
            created.len(),
            territory,
            self.server()
        );
        Ok(RemoteOutcome::Completed(created.len()))
    }

    /// Tell the server which of its markers we have encountered.
    pub async fn confirm_seen(&self, territory: TerritoryId) -> MarkerResult<RemoteOutcome<usize>> {
        if !self.config.is_online() {
            return Ok(RemoteOutcome::Skipped("offline"));
        }
        let Some(account) = self.config.account_for(self.server()) else {
            return Ok(RemoteOutcome::Skipped("no account on server"));
        };
        if !self.config.shares_seen(self.server()) {
            return Ok(RemoteOutcome::Skipped("seen sharing disabled"));
        }

        let cache = self.reconciler.cache();
        let claimed = cache.with_state(territory, |s| s.claim_seen(&account))?;
        if claimed.is_empty() {
            return Ok(RemoteOutcome::Completed(0));
        }
        let ids: Vec<LocalId> = claimed.iter().map(|m| m.local_id).collect();
        let network_ids: Vec<NetworkId> = claimed.iter().filter_map(|m| m.network_id).collect();

        if let Err(e) = self
            .call("mark seen", self.catalog.mark_seen(territory, network_ids))
            .await
        {
            cache.with_state(territory, |s| s.release_seen(&ids))?;
            return self.denied("mark seen", e);
        }

        let batch: Vec<Mutation> = claimed
            .iter()
            .map(|m| Mutation::confirm_remote(m.kind, m.position, account.clone()))
            .collect();
        let summary = self.reconciler.reconcile(territory, &batch)?;
        Ok(RemoteOutcome::Completed(summary.updated + summary.created))
    }

    /// Aggregate floor counts, if our account may view them.
    pub async fn fetch_statistics(&self) -> MarkerResult<RemoteOutcome<Vec<FloorStatistics>>> {
        if !self.config.is_online() {
            return Ok(RemoteOutcome::Skipped("offline"));
        }
        if !self.config.has_role(self.server(), ROLE_STATISTICS_VIEW) {
            return Ok(RemoteOutcome::Denied {
                notice: format!("statistics are not available on {}", self.server()),
            });
        }

        match self
            .call("statistics", self.catalog.fetch_statistics())
            .await
        {
            Ok(stats) => Ok(RemoteOutcome::Completed(stats)),
            Err(e) => self.denied("statistics", e),
        }
    }

    /// Download, then upload, then confirm, for one floor.
    ///
    /// A denied or skipped step doesn't stop the next one; an error does.
    pub async fn sync_floor(&self, territory: TerritoryId) -> MarkerResult<SyncReport> {
        let downloaded = self.download_floor(territory).await?;
        let uploaded = self.upload_pending(territory).await?;
        let confirmed = self.confirm_seen(territory).await?;
        Ok(SyncReport {
            downloaded,
            uploaded,
            confirmed,
        })
    }
}

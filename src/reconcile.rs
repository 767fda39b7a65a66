//! Reconciliation – merging externally sourced markers into the cache.
//!
//! Every batch goes through [`TerritoryCache::apply_batch`], so it is applied
//! atomically with respect to local observations on the same floor. Merges
//! are idempotent per record: replaying a batch only reports `unchanged`.

use crate::cache::{BatchApplied, TerritoryCache};
use crate::error::{MarkerError, MarkerResult};
use crate::marker::Mutation;
use crate::protocol::{ExportFile, RemoteMarker};
use crate::territory::Change;
use crate::types::{AccountId, ImportId, ServerId, TerritoryId};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records that lost a superseded import id from the same server.
    pub retired: usize,
    /// Entries dropped before merging (non-finite positions).
    pub skipped: usize,
    /// Records merged in memory whose write is still pending.
    pub failed_writes: usize,
}

impl ReconcileSummary {
    fn from_batch(batch: &BatchApplied) -> Self {
        let mut summary = ReconcileSummary {
            retired: batch.retired,
            failed_writes: batch.failed_writes,
            ..Default::default()
        };
        for outcome in &batch.outcomes {
            match outcome.change {
                Change::Created => summary.created += 1,
                Change::Updated => summary.updated += 1,
                Change::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }

    pub fn absorb(&mut self, other: &ReconcileSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.retired += other.retired;
        self.skipped += other.skipped;
        self.failed_writes += other.failed_writes;
    }
}

/// Outcome of importing one export file.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub server: ServerId,
    pub import_id: ImportId,
    pub floors: BTreeMap<TerritoryId, ReconcileSummary>,
    /// Floors that could not be merged (e.g. storage unavailable on load).
    pub failed: Vec<(TerritoryId, MarkerError)>,
    /// Objects skipped: kind not importable or position non-finite.
    pub skipped: usize,
}

impl ImportReport {
    pub fn totals(&self) -> ReconcileSummary {
        self.floors
            .values()
            .fold(ReconcileSummary::default(), |mut acc, s| {
                acc.absorb(s);
                acc
            })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<TerritoryCache>,
}

impl Reconciler {
    pub fn new(cache: Arc<TerritoryCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<TerritoryCache> {
        &self.cache
    }

    /// Merge `batch` into `territory` and report what changed.
    pub fn reconcile(&self, territory: TerritoryId, batch: &[Mutation]) -> MarkerResult<ReconcileSummary> {
        let applied = self.cache.apply_batch(territory, batch)?;
        let summary = ReconcileSummary::from_batch(&applied);
        info!(
            "Reconciled {} markers into territory {} ({} created, {} updated, {} unchanged)",
            summary.total(),
            territory,
            summary.created,
            summary.updated,
            summary.unchanged
        );
        Ok(summary)
    }

    /// Merge the connected server's view of `territory`. Markers the server
    /// reports as seen are credited to `account`.
    pub fn merge_remote(
        &self,
        territory: TerritoryId,
        markers: &[RemoteMarker],
        account: Option<&AccountId>,
    ) -> MarkerResult<ReconcileSummary> {
        let (valid, invalid): (Vec<&RemoteMarker>, Vec<&RemoteMarker>) =
            markers.iter().partition(|m| m.position().is_finite());
        if !invalid.is_empty() {
            warn!(
                "Dropping {} remote markers with non-finite positions for territory {}",
                invalid.len(),
                territory
            );
        }
        let batch: Vec<Mutation> = valid
            .into_iter()
            .map(|m| Mutation::RemoteSync {
                kind: m.kind(),
                position: m.position(),
                network_id: m.network_id(),
                seen_by: if m.seen { account.cloned() } else { None },
            })
            .collect();
        let mut summary = self.reconcile(territory, &batch)?;
        summary.skipped = invalid.len();
        Ok(summary)
    }

    /// Import a downloaded export file, one atomic batch per floor.
    ///
    /// A floor that fails is recorded in the report and the rest continue.
    pub fn import_export(&self, file: &ExportFile) -> ImportReport {
        let server = ServerId::new(file.server_url.clone());
        let import_id = ImportId(file.export_id);
        info!(
            "Importing {} objects from {} (export {})",
            file.object_count(),
            server,
            import_id
        );

        let mut report = ImportReport {
            server: server.clone(),
            import_id,
            floors: BTreeMap::new(),
            failed: Vec::new(),
            skipped: 0,
        };

        for floor in &file.floors {
            let territory = floor.territory();
            let mut batch = Vec::with_capacity(floor.objects.len());
            for object in &floor.objects {
                let kind = object.kind();
                if !kind.is_permanent() {
                    debug!("Skipping {} in export for territory {}", kind, territory);
                    report.skipped += 1;
                    continue;
                }
                if !object.position().is_finite() {
                    warn!(
                        "Skipping {} with non-finite position in export for territory {}",
                        kind, territory
                    );
                    report.skipped += 1;
                    continue;
                }
                batch.push(Mutation::import(
                    kind,
                    object.position(),
                    server.clone(),
                    import_id,
                ));
            }

            let applied = self
                .cache
                .apply_import(territory, &server, import_id, &batch)
                .map(|applied| ReconcileSummary::from_batch(&applied));
            match applied {
                Ok(summary) => {
                    debug!(
                        "Import into territory {}: {} created, {} updated, {} retired",
                        territory, summary.created, summary.updated, summary.retired
                    );
                    report.floors.entry(territory).or_default().absorb(&summary)
                }
                Err(e) => {
                    warn!("Import into territory {} failed: {}", territory, e);
                    report.failed.push((territory, e));
                }
            }
        }

        self.retire_elsewhere(file, &server, import_id, &mut report);
        report
    }

    /// Floors the new file doesn't mention can still carry this server's
    /// older import ids; strip them there too.
    fn retire_elsewhere(
        &self,
        file: &ExportFile,
        server: &ServerId,
        import_id: ImportId,
        report: &mut ImportReport,
    ) {
        let listed: BTreeSet<TerritoryId> = file.floors.iter().map(|f| f.territory()).collect();
        let mut others: BTreeSet<TerritoryId> = self.cache.territory_ids().into_iter().collect();
        match self.cache.store().territories() {
            Ok(stored) => others.extend(stored),
            Err(e) => warn!("Could not list stored territories for import cleanup: {}", e),
        }

        for territory in others.difference(&listed) {
            match self.cache.apply_import(*territory, server, import_id, &[]) {
                Ok(applied) if applied.retired > 0 => {
                    let summary = ReconcileSummary::from_batch(&applied);
                    report.floors.entry(*territory).or_default().absorb(&summary);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Import cleanup of territory {} failed: {}", territory, e);
                    report.failed.push((*territory, e));
                }
            }
        }
    }
}

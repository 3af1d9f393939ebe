//! Reconciliation sweep for one owner.
//!
//! Partial failures in the transaction managers leave two kinds of debris:
//! objects with no record (ledger insert failed after the write) and records
//! with no object (ledger delete failed after the object delete). The sweep
//! finds both by diffing the owner's object namespace against their ledger
//! entries; `repair` removes them.

use crate::{
    errors::VaultResult,
    models::file_record::{FileRecord, Locator},
    services::{
        ledger::{FileLedger, LedgerError},
        object_store::{ObjectStore, ObjectStoreError, owner_namespace},
    },
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Serialize, Debug, Clone, Default)]
pub struct ReconcileReport {
    pub owner_id: Uuid,
    pub orphan_objects: Vec<Locator>,
    pub orphan_records: Vec<FileRecord>,
    /// Unreferenced objects younger than the grace period, likely uploads
    /// whose ledger insert has not landed yet.
    pub skipped_recent: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_objects.is_empty() && self.orphan_records.is_empty()
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RepairSummary {
    pub objects_removed: usize,
    pub records_removed: usize,
    pub failures: Vec<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn FileLedger>,
    grace: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, ledger: Arc<dyn FileLedger>, grace: Duration) -> Self {
        Self {
            store,
            ledger,
            grace,
        }
    }

    pub async fn sweep(&self, owner: Uuid) -> VaultResult<ReconcileReport> {
        let records = self.ledger.list_for(owner).await?;
        let objects = self.store.list_namespace(&owner_namespace(owner)).await?;

        let referenced: HashSet<&Locator> = records.iter().map(|r| &r.locator).collect();
        let present: HashSet<&Locator> = objects.iter().map(|o| &o.locator).collect();
        let cutoff = Utc::now() - self.grace;

        let mut report = ReconcileReport {
            owner_id: owner,
            ..Default::default()
        };

        for object in &objects {
            if referenced.contains(&object.locator) {
                continue;
            }
            if object.modified > cutoff {
                report.skipped_recent += 1;
            } else {
                report.orphan_objects.push(object.locator.clone());
            }
        }

        for record in &records {
            if present.contains(&record.locator) {
                continue;
            }
            // The listing is a snapshot; confirm before calling it an orphan.
            if self.store.content_length(&record.locator).await?.is_none() {
                report.orphan_records.push(record.clone());
            }
        }

        info!(
            owner = %owner,
            orphan_objects = report.orphan_objects.len(),
            orphan_records = report.orphan_records.len(),
            skipped_recent = report.skipped_recent,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Remove what `report` found. Individual failures are collected rather
    /// than aborting the pass.
    pub async fn repair(&self, report: &ReconcileReport) -> RepairSummary {
        let mut summary = RepairSummary::default();

        for locator in &report.orphan_objects {
            match self.store.delete_by_locator(locator).await {
                Ok(()) => summary.objects_removed += 1,
                Err(ObjectStoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(locator = %locator, error = %err, "could not remove orphan object");
                    summary.failures.push(format!("object {}: {}", locator, err));
                }
            }
        }

        for record in &report.orphan_records {
            if record.owner_id != report.owner_id {
                continue;
            }
            match self.ledger.delete_by_id(record.owner_id, record.id).await {
                Ok(()) => summary.records_removed += 1,
                Err(LedgerError::NotFound(_)) => {}
                Err(err) => {
                    warn!(record_id = %record.id, error = %err, "could not remove orphan record");
                    summary.failures.push(format!("record {}: {}", record.id, err));
                }
            }
        }

        info!(
            owner = %report.owner_id,
            objects_removed = summary.objects_removed,
            records_removed = summary.records_removed,
            failures = summary.failures.len(),
            "reconciliation repair finished"
        );
        summary
    }
}

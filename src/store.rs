//! The observation store: the operation set transports call.
//!
//! Write path: codec, dedup guard, table insert, backup append, commit.
//! Read path: aggregator or listing on a per-call read connection.
//! Every internal failure is translated into [`StoreError`] here.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use serde_json::Value;

use crate::{
    aggregate::{UnitCount, UnitFilter},
    backup::{self, BackupLog, LogEntry, ReconcileReport, VoidedKind},
    codec,
    db::{
        models::{HealthReport, ListOrder, Observation, SaveOutcome},
        Database,
    },
    error::{StoreError, StoreResult},
    log_error, log_info, log_warn,
    settings::{AuditSettings, CategoryRule, SettingsStore},
};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::store";

/// Where the store keeps its state.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub backup_log_path: PathBuf,
    pub settings_path: PathBuf,
}

impl StoreConfig {
    /// All three files side by side in `dir`, with the default names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join("data.db"),
            backup_log_path: dir.join("observations.log.jsonl"),
            settings_path: dir.join("settings.json"),
        }
    }
}

#[derive(Clone)]
pub struct ObservationStore {
    db: Database,
    log: Arc<BackupLog>,
    settings: Arc<SettingsStore>,
}

impl ObservationStore {
    /// Opens the database (running migrations), the backup log and the
    /// settings. Does not reconcile; callers do that before serving.
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        let settings = SettingsStore::new(config.settings_path.clone())?;
        let log = BackupLog::open(config.backup_log_path.clone())?;
        let db = Database::open(config.db_path.clone())?;

        Ok(Self {
            db,
            log: Arc::new(log),
            settings: Arc::new(settings),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn backup_log(&self) -> &BackupLog {
        &self.log
    }

    /// Releases the handles. The writer thread stops once every clone of the
    /// store has been closed or dropped.
    pub fn close(self) {
        self.db.close();
    }

    /// Validates, deduplicates and persists one raw record.
    ///
    /// The backup entry is written inside the insert transaction, so a failed
    /// append leaves no row behind. Duplicates return the existing id.
    pub async fn save(&self, raw: &Value) -> StoreResult<SaveOutcome> {
        let record = codec::decode(raw)?;
        let fingerprint =
            codec::fingerprint(&record).map_err(|err| StoreError::storage("save", err))?;

        let log = Arc::clone(&self.log);
        let void_log = Arc::clone(&self.log);
        let outcome = self
            .db
            .insert_observation(
                record,
                fingerprint,
                move |id, record, fingerprint| {
                    log.append(&LogEntry::observation(id, record, fingerprint))
                },
                move |id, fingerprint| {
                    void_entry(&void_log, VoidedKind::Observation, id, fingerprint)
                },
            )
            .await
            .map_err(|err| StoreError::storage("save", err))?;

        match outcome {
            SaveOutcome::Inserted { id } => log_info!("Saved observation {id}"),
            SaveOutcome::Duplicate { id } => {
                log_info!("Duplicate submission suppressed; returning observation {id}")
            }
        }

        Ok(outcome)
    }

    pub async fn list(&self, order: ListOrder) -> StoreResult<Vec<Observation>> {
        self.db
            .list_observations(order)
            .await
            .map_err(|err| StoreError::storage("list", err))
    }

    /// Sum of `pickingFound` for the filter, grouped per the category table.
    pub async fn count_units(&self, mut filter: UnitFilter) -> StoreResult<UnitCount> {
        // Identity fields are stored trimmed.
        filter.store_name = filter.store_name.trim().to_string();
        filter.product = filter.product.trim().to_string();
        if filter.store_name.is_empty() {
            return Err(StoreError::validation("storeName", "is required"));
        }
        if filter.product.is_empty() {
            return Err(StoreError::validation("product", "is required"));
        }

        let grouping = self.settings.category_rules().grouping_for(&filter.product);
        let total_units = self
            .db
            .count_units(filter.clone(), grouping)
            .await
            .map_err(|err| StoreError::storage("count_units", err))?;

        Ok(UnitCount {
            store: filter.store_name,
            product: filter.product,
            product_type: filter.product_type.unwrap_or_else(|| "N/A".into()),
            section: filter.section.unwrap_or_else(|| "N/A".into()),
            grouping,
            total_units,
        })
    }

    /// Marks an observation as flagged and records why in the backup log.
    pub async fn flag_observation(&self, id: i64, reason: &str) -> StoreResult<Observation> {
        self.set_flag(id, true, reason).await
    }

    pub async fn set_flag(&self, id: i64, flagged: bool, reason: &str) -> StoreResult<Observation> {
        let log = Arc::clone(&self.log);
        let void_log = Arc::clone(&self.log);
        let reason_for_log = reason.to_string();
        let updated = self
            .db
            .set_flag(
                id,
                flagged,
                move |observation| {
                    let fingerprint = codec::fingerprint(&observation.record)?;
                    log.append(&LogEntry::flag(observation, &fingerprint, &reason_for_log))
                },
                move |observation| match codec::fingerprint(&observation.record) {
                    Ok(fingerprint) => {
                        void_entry(&void_log, VoidedKind::Flag, observation.id, &fingerprint)
                    }
                    Err(err) => log_error!(
                        "Cannot void flag entry for observation {}: {err:#}",
                        observation.id
                    ),
                },
            )
            .await
            .map_err(|err| StoreError::storage("flag_observation", err))?;

        match updated {
            Some(observation) => {
                log_info!("Observation {id} flagged={flagged}: {reason}");
                Ok(observation)
            }
            None => {
                log_warn!("Flag requested for unknown observation {id}");
                Err(StoreError::NotFound { id })
            }
        }
    }

    pub async fn check_health(&self) -> StoreResult<HealthReport> {
        self.db
            .check_health()
            .await
            .map_err(|err| StoreError::storage("check_health", err))
    }

    pub async fn reconcile(&self) -> StoreResult<ReconcileReport> {
        backup::reconcile(&self.db, Arc::clone(&self.log))
            .await
            .map_err(|err| StoreError::storage("reconcile", err))
    }

    /// Drops and recreates the table, then restores it from the backup log.
    pub async fn rebuild(&self) -> StoreResult<ReconcileReport> {
        log_warn!("Rebuilding observation table from {}", self.log.path().display());
        self.db
            .rebuild()
            .await
            .context("rebuild failed")
            .map_err(|err| StoreError::storage("rebuild", err))?;
        self.reconcile().await
    }

    pub fn settings(&self) -> AuditSettings {
        self.settings.snapshot()
    }

    pub fn upsert_category(&self, rule: CategoryRule) -> StoreResult<AuditSettings> {
        if rule.name.trim().is_empty() {
            return Err(StoreError::validation("name", "must not be blank"));
        }
        self.settings
            .upsert_category(rule)
            .map_err(|err| StoreError::storage("upsert_category", err))
    }
}

/// Cancels a backup entry whose table write did not commit. If this append
/// fails too, reconcile restores the entry; the log stays a superset of the
/// table.
fn void_entry(log: &BackupLog, voids: VoidedKind, id: i64, fingerprint: &str) {
    match log.append(&LogEntry::void(voids, id, fingerprint)) {
        Ok(()) => log_warn!("Commit failed; voided {voids:?} entry for observation {id}"),
        Err(err) => log_error!("Commit failed and void of observation {id} not written: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> ObservationStore {
        ObservationStore::open(&StoreConfig::in_dir(dir)).unwrap()
    }

    #[tokio::test]
    async fn save_is_idempotent_for_identical_records() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let raw = json!({
            "storeName": "Madrid-1",
            "product": "Shoes",
            "startTime": "09:00",
            "pickingFound": 12
        });

        let first = store.save(&raw).await.unwrap();
        let second = store.save(&raw).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());

        let rows = store.list(ListOrder::Asc).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.picking_found, 12);

        let count = store
            .count_units(UnitFilter {
                store_name: "Madrid-1".into(),
                product: "Shoes".into(),
                ..UnitFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(count.total_units, 12);

        let padded = store
            .count_units(UnitFilter {
                store_name: "Madrid-1 ".into(),
                product: " Shoes".into(),
                ..UnitFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(padded.total_units, 12);
        assert_eq!(padded.store, "Madrid-1");

        // One backup entry, not two.
        assert_eq!(store.backup_log().read_entries().unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn invalid_records_are_neither_stored_nor_logged() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let err = store
            .save(&json!({ "product": "Shoes", "pickingFound": 3 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = store
            .save(&json!({ "storeName": "A", "product": "Shoes", "pickingFound": "lots" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(store.list(ListOrder::Asc).await.unwrap().is_empty());
        assert!(store.backup_log().read_entries().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn flagging_unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let err = store.flag_observation(42, "wrong shelf").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 42 }));
        assert!(store.backup_log().read_entries().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn category_table_drives_grouping() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for (section, found) in [("Entrance", 2), ("Exit", 3)] {
            store
                .save(&json!({
                    "storeName": "A",
                    "product": "Bolsos",
                    "productType": "Leather",
                    "section": section,
                    "pickingFound": found
                }))
                .await
                .unwrap();
        }
        let filter = UnitFilter {
            store_name: "A".into(),
            product: "Bolsos".into(),
            product_type: Some("Leather".into()),
            section: Some("Entrance".into()),
        };

        assert_eq!(store.count_units(filter.clone()).await.unwrap().total_units, 2);

        store
            .upsert_category(CategoryRule {
                name: "bolsos".into(),
                section_insensitive: true,
            })
            .unwrap();
        assert_eq!(store.count_units(filter).await.unwrap().total_units, 5);
    }

    #[tokio::test]
    async fn count_requires_store_and_product() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let err = store
            .count_units(UnitFilter {
                store_name: "A".into(),
                ..UnitFilter::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

//! Replays the backup log into the observation table.
//!
//! Runs once at startup, before any request is served, and from the admin
//! CLI after a rebuild. The whole replay is a single write transaction: it
//! either tops up the table completely or leaves it as it was.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Context, Result};
use rusqlite::TransactionBehavior;
use serde::Serialize;

use crate::{
    db::{
        repositories::{
            dedup::find_by_natural_key,
            observations::{get_row, id_exists, insert_row, update_flag},
        },
        Database,
    },
    log_debug, log_info,
};

use super::{BackupLog, LogEntry, ObservationEntry};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::reconcile";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub scanned: usize,
    pub inserted: usize,
    /// Inserted under a new id because the logged one was taken.
    pub renumbered: usize,
    pub skipped: usize,
    pub flags_applied: usize,
    /// Entries cancelled by a later void.
    pub voided: usize,
    pub malformed: usize,
}

impl ReconcileReport {
    pub fn changed_table(&self) -> bool {
        self.inserted > 0 || self.flags_applied > 0
    }
}

/// Inserts every logged observation that has no row with the same natural
/// key and payload, then replays flag changes onto their rows.
///
/// Idempotent: a second run over the same log finds every record present and
/// every flag already applied, and writes nothing.
pub async fn reconcile(db: &Database, log: Arc<BackupLog>) -> Result<ReconcileReport> {
    let report = db
        .execute(move |conn| {
            let scan = log.read_entries()?;
            let mut report = ReconcileReport {
                scanned: scan.entries.len(),
                malformed: scan.malformed,
                ..ReconcileReport::default()
            };

            let (live, voided) = live_entries(&scan.entries);
            report.voided = voided;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin reconcile transaction")?;

            let logged_observations: Vec<&ObservationEntry> = live
                .iter()
                .filter_map(|entry| match entry {
                    LogEntry::Observation(logged) => Some(logged),
                    _ => None,
                })
                .collect();

            // When several entries claim one id, the latest was the one the
            // caller was told about.
            let mut claimant = HashMap::new();
            for (index, logged) in logged_observations.iter().enumerate() {
                claimant.insert(logged.id, index);
            }

            // Logged ids go back first so renumbered rows cannot take an id
            // a later entry still owns.
            let mut displaced = Vec::new();
            for (index, logged) in logged_observations.iter().enumerate() {
                if find_by_natural_key(&tx, &logged.key, &logged.fingerprint)?.is_some() {
                    report.skipped += 1;
                    continue;
                }
                if claimant.get(&logged.id) != Some(&index) {
                    displaced.push(*logged);
                    continue;
                }
                if id_exists(&tx, logged.id)? {
                    displaced.push(*logged);
                    continue;
                }
                insert_row(&tx, &logged.record, &logged.fingerprint, Some(logged.id))?;
                report.inserted += 1;
                log_debug!("Restored observation {}", logged.id);
            }
            for logged in displaced {
                if find_by_natural_key(&tx, &logged.key, &logged.fingerprint)?.is_some() {
                    report.skipped += 1;
                    continue;
                }
                let id = insert_row(&tx, &logged.record, &logged.fingerprint, None)?;
                report.inserted += 1;
                report.renumbered += 1;
                log_debug!("Restored observation {} as {}", logged.id, id);
            }

            // Last flag entry per row wins.
            let mut flags = BTreeMap::new();
            for entry in &live {
                let LogEntry::Flag(flag) = entry else {
                    continue;
                };
                if let Some(id) = find_by_natural_key(&tx, &flag.key, &flag.fingerprint)? {
                    flags.insert(id, flag.flagged);
                }
            }
            for (id, flagged) in flags {
                let current = get_row(&tx, id)?.map(|row| row.flagged_observation);
                if current == Some(flagged) {
                    continue;
                }
                update_flag(&tx, id, flagged)?;
                report.flags_applied += 1;
            }

            tx.commit().context("failed to commit reconcile")?;
            Ok(report)
        })
        .await?;

    log_info!(
        "Reconciled backup log: {} entries, {} inserted ({} renumbered), {} skipped, {} flags applied, {} voided, {} malformed",
        report.scanned,
        report.inserted,
        report.renumbered,
        report.skipped,
        report.flags_applied,
        report.voided,
        report.malformed
    );

    Ok(report)
}

/// Drops void entries together with the entries they cancel.
fn live_entries(entries: &[LogEntry]) -> (Vec<&LogEntry>, usize) {
    let mut live: Vec<Option<&LogEntry>> = Vec::with_capacity(entries.len());
    let mut voided = 0;

    for entry in entries {
        let LogEntry::Void(void) = entry else {
            live.push(Some(entry));
            continue;
        };
        let target = live
            .iter()
            .rposition(|candidate| candidate.is_some_and(|earlier| void.cancels(earlier)));
        if let Some(index) = target {
            live[index] = None;
            voided += 1;
        }
    }

    (live.into_iter().flatten().collect(), voided)
}

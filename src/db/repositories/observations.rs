use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::{
    aggregate::{self, Grouping, UnitFilter},
    db::{
        connection::Database,
        helpers::{column_bool, column_int, column_text, parse_status},
        migrations::schema_version,
        models::{HealthReport, ListOrder, NewObservation, Observation, SaveOutcome},
        repositories::dedup::find_duplicate,
    },
};

pub(crate) fn row_to_record(row: &Row) -> Result<NewObservation> {
    let defaults = NewObservation::default();
    let status = column_text(row, "status", "")?;

    Ok(NewObservation {
        store_name: column_text(row, "storeName", &defaults.store_name)?,
        product: column_text(row, "product", &defaults.product)?,
        product_type: column_text(row, "productType", &defaults.product_type)?,
        section: column_text(row, "section", &defaults.section)?,
        space_pass: column_text(row, "spacePass", &defaults.space_pass)?,
        ladder_required: column_text(row, "ladderRequired", &defaults.ladder_required)?,
        size25: column_int(row, "size25")?,
        not_located_units: column_int(row, "notLocatedUnits")?,
        observations: column_text(row, "observations", &defaults.observations)?,
        start_time: column_text(row, "startTime", &defaults.start_time)?,
        end_time: column_text(row, "endTime", &defaults.end_time)?,
        picking_time: column_int(row, "pickingTime")?,
        picking_found: column_int(row, "pickingFound")?,
        picking_not_found: column_int(row, "pickingNotFound")?,
        reoperating_time: column_int(row, "reoperatingTime")?,
        reoperating_manipulated: column_int(row, "reoperatingManipulated")?,
        shopfloor_time: column_int(row, "shopfloorTime")?,
        shopfloor_manipulated: column_int(row, "shopfloorManipulated")?,
        transits_time: column_int(row, "transitsTime")?,
        devices_failures_time: column_int(row, "devicesFailuresTime")?,
        status: parse_status(Some(status.as_str())),
        receiving_requests: column_text(row, "receivingRequests", &defaults.receiving_requests)?,
    })
}

fn row_to_observation(row: &Row) -> Result<Observation> {
    Ok(Observation {
        id: row.get("id")?,
        record: row_to_record(row)?,
        flagged_observation: column_bool(row, "flaggedObservation")?,
    })
}

/// Inserts one row. `id` of `None` lets SQLite assign the next id; reconcile
/// passes the id the row had when it was first accepted.
pub(crate) fn insert_row(
    conn: &Connection,
    record: &NewObservation,
    fingerprint: &str,
    id: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO observations (
            id, storeName, product, productType, section, spacePass, ladderRequired,
            size25, notLocatedUnits, observations, startTime, endTime,
            pickingTime, pickingFound, pickingNotFound, reoperatingTime,
            reoperatingManipulated, shopfloorTime, shopfloorManipulated,
            transitsTime, devicesFailuresTime, status, receivingRequests,
            flaggedObservation, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                  ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, 0, ?24)",
        params![
            id,
            record.store_name,
            record.product,
            record.product_type,
            record.section,
            record.space_pass,
            record.ladder_required,
            record.size25,
            record.not_located_units,
            record.observations,
            record.start_time,
            record.end_time,
            record.picking_time,
            record.picking_found,
            record.picking_not_found,
            record.reoperating_time,
            record.reoperating_manipulated,
            record.shopfloor_time,
            record.shopfloor_manipulated,
            record.transits_time,
            record.devices_failures_time,
            record.status.as_str(),
            record.receiving_requests,
            fingerprint,
        ],
    )
    .context("failed to insert observation")?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_row(conn: &Connection, id: i64) -> Result<Option<Observation>> {
    let mut stmt = conn.prepare("SELECT * FROM observations WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_observation(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn id_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM observations WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn update_flag(conn: &Connection, id: i64, flagged: bool) -> Result<usize> {
    conn.execute(
        "UPDATE observations SET flaggedObservation = ?1 WHERE id = ?2",
        params![flagged as i64, id],
    )
    .context("failed to update flaggedObservation")
}

impl Database {
    /// Inserts `record` unless an identical row already exists.
    ///
    /// `before_commit` runs inside the write transaction after the row is
    /// written; if it fails the row is rolled back. Duplicates skip it.
    /// `after_failed_commit` runs only when `before_commit` succeeded but the
    /// commit itself did not, so whatever the hook wrote can be cancelled.
    pub async fn insert_observation<F, R>(
        &self,
        record: NewObservation,
        fingerprint: String,
        before_commit: F,
        after_failed_commit: R,
    ) -> Result<SaveOutcome>
    where
        F: FnOnce(i64, &NewObservation, &str) -> Result<()> + Send + 'static,
        R: FnOnce(i64, &str) + Send + 'static,
    {
        self.execute(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin insert transaction")?;

            if let Some(id) = find_duplicate(&tx, &record, &fingerprint)? {
                return Ok(SaveOutcome::Duplicate { id });
            }

            let id = insert_row(&tx, &record, &fingerprint, None)?;
            before_commit(id, &record, &fingerprint)?;
            if let Err(err) = tx.commit() {
                after_failed_commit(id, &fingerprint);
                return Err(anyhow::Error::new(err).context("failed to commit observation"));
            }

            Ok(SaveOutcome::Inserted { id })
        })
        .await
    }

    pub async fn list_observations(&self, order: ListOrder) -> Result<Vec<Observation>> {
        self.read(move |conn| {
            let query = match order {
                ListOrder::Asc => "SELECT * FROM observations ORDER BY id ASC",
                ListOrder::Desc => "SELECT * FROM observations ORDER BY id DESC",
            };
            let mut stmt = conn.prepare(query)?;

            let mut rows = stmt.query([])?;
            let mut observations = Vec::new();
            while let Some(row) = rows.next()? {
                observations.push(row_to_observation(row)?);
            }

            Ok(observations)
        })
        .await
    }

    /// Sets `flaggedObservation` on one row and leaves every other column
    /// untouched. Returns the updated row, or `None` if `id` does not exist.
    pub async fn set_flag<F, R>(
        &self,
        id: i64,
        flagged: bool,
        before_commit: F,
        after_failed_commit: R,
    ) -> Result<Option<Observation>>
    where
        F: FnOnce(&Observation) -> Result<()> + Send + 'static,
        R: FnOnce(&Observation) + Send + 'static,
    {
        self.execute(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin flag transaction")?;

            if update_flag(&tx, id, flagged)? == 0 {
                return Ok(None);
            }
            let updated = get_row(&tx, id)?
                .with_context(|| format!("observation {id} vanished during flag update"))?;

            before_commit(&updated)?;
            if let Err(err) = tx.commit() {
                after_failed_commit(&updated);
                return Err(anyhow::Error::new(err).context("failed to commit flag update"));
            }

            Ok(Some(updated))
        })
        .await
    }

    pub async fn count_units(&self, filter: UnitFilter, grouping: Grouping) -> Result<i64> {
        self.read(move |conn| aggregate::sum_picking_found(conn, &filter, grouping))
            .await
    }

    pub async fn check_health(&self) -> Result<HealthReport> {
        self.read(|conn| {
            let table_exists: bool = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'observations'",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .is_some();

            let row_count = if table_exists {
                conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?
            } else {
                0
            };

            Ok(HealthReport {
                table_exists,
                row_count,
                schema_version: schema_version(conn)?,
            })
        })
        .await
    }

    /// Drops the observations table and recreates it at the current schema.
    /// Administrative only; never called on the normal startup path.
    pub async fn rebuild(&self) -> Result<()> {
        self.execute(|conn| {
            let tx = conn.transaction().context("failed to begin rebuild")?;
            tx.execute_batch("DROP TABLE IF EXISTS observations")
                .context("failed to drop observations")?;
            tx.pragma_update(None, "user_version", 0)
                .context("failed to reset user_version pragma")?;
            tx.commit().context("failed to commit rebuild")?;

            crate::db::migrations::run_migrations(conn)
        })
        .await
    }
}

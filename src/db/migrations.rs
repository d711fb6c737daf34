use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, Transaction};

use crate::{codec, log_info, log_warn};

use super::repositories::observations::row_to_record;

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::migrations";

pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// A physical column of the `observations` table with its declaration.
/// Every declaration carries a default so `ADD COLUMN` backfills old rows.
pub struct ColumnSpec {
    pub name: &'static str,
    pub declaration: &'static str,
}

const fn column(name: &'static str, declaration: &'static str) -> ColumnSpec {
    ColumnSpec { name, declaration }
}

impl ColumnSpec {
    /// The SQL literal after `DEFAULT`, if the declaration has one.
    pub fn default_sql(&self) -> Option<&'static str> {
        self.declaration
            .split_once("DEFAULT ")
            .map(|(_, literal)| literal.trim())
    }
}

/// Canonical column set, excluding the `id` primary key.
pub const OBSERVATION_COLUMNS: &[ColumnSpec] = &[
    column("storeName", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("product", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("productType", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("section", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("spacePass", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("ladderRequired", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("size25", "INTEGER NOT NULL DEFAULT 0"),
    column("notLocatedUnits", "INTEGER NOT NULL DEFAULT 0"),
    column("observations", "TEXT NOT NULL DEFAULT ''"),
    column("startTime", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("endTime", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("pickingTime", "INTEGER NOT NULL DEFAULT 0"),
    column("pickingFound", "INTEGER NOT NULL DEFAULT 0"),
    column("pickingNotFound", "INTEGER NOT NULL DEFAULT 0"),
    column("reoperatingTime", "INTEGER NOT NULL DEFAULT 0"),
    column("reoperatingManipulated", "INTEGER NOT NULL DEFAULT 0"),
    column("shopfloorTime", "INTEGER NOT NULL DEFAULT 0"),
    column("shopfloorManipulated", "INTEGER NOT NULL DEFAULT 0"),
    column("transitsTime", "INTEGER NOT NULL DEFAULT 0"),
    column("devicesFailuresTime", "INTEGER NOT NULL DEFAULT 0"),
    column("status", "TEXT NOT NULL DEFAULT 'synced'"),
    column("flaggedObservation", "INTEGER NOT NULL DEFAULT 0"),
    column("receivingRequests", "TEXT NOT NULL DEFAULT 'N/A'"),
    column("payload", "TEXT NOT NULL DEFAULT ''"),
];

pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version = schema_version(conn)?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version < CURRENT_SCHEMA_VERSION {
        let starting_version = version;
        let tx = conn
            .transaction()
            .context("failed to open migration transaction")?;

        while version < CURRENT_SCHEMA_VERSION {
            let next_version = version + 1;
            apply_migration(&tx, next_version)
                .with_context(|| format!("migration to version {next_version} failed"))?;
            version = next_version;
        }

        tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
            .context("failed to update user_version pragma")?;
        tx.commit().context("failed to commit migrations")?;

        log_info!(
            "Migrated observation schema from v{} to v{}",
            starting_version,
            CURRENT_SCHEMA_VERSION
        );
    }

    // Columns dropped or never created by hand-managed databases come back
    // with their defaults even when user_version claims to be current.
    let restored = add_missing_columns(conn, OBSERVATION_COLUMNS)?;
    if !restored.is_empty() {
        log_warn!("Restored missing observation columns: {}", restored.join(", "));
        backfill_payloads(conn)?;
    }

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(include_str!("schemas/schema_v1.sql"))
                .context("failed to execute schema_v1.sql")?;
            Ok(())
        }
        2 => {
            add_missing_columns(tx, &[column("flaggedObservation", "INTEGER NOT NULL DEFAULT 0")])?;
            Ok(())
        }
        3 => {
            // receivingRequests and payload, plus anything a legacy table
            // never had, since the backfill reads every column.
            add_missing_columns(tx, OBSERVATION_COLUMNS)?;
            fill_null_cells(tx)?;
            backfill_payloads(tx)?;
            tx.execute_batch(include_str!("schemas/schema_v3.sql"))
                .context("failed to execute schema_v3.sql")?;
            Ok(())
        }
        4 => {
            tx.execute_batch(include_str!("schemas/schema_v4.sql"))
                .context("failed to execute schema_v4.sql")?;
            Ok(())
        }
        _ => bail!("unknown migration target version: {version}"),
    }
}

fn existing_columns(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('observations')")
        .context("failed to inspect observations columns")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// Adds each column the physical table lacks. Returns the names added.
fn add_missing_columns(conn: &Connection, columns: &[ColumnSpec]) -> Result<Vec<&'static str>> {
    let existing = existing_columns(conn)?;
    if existing.is_empty() {
        bail!("observations table does not exist");
    }

    let mut added = Vec::new();
    for spec in columns {
        if existing.contains(spec.name) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE observations ADD COLUMN {} {}",
            spec.name, spec.declaration
        ))
        .with_context(|| format!("failed to add column {}", spec.name))?;
        added.push(spec.name);
    }

    Ok(added)
}

/// Replaces NULL cells with the column default before fingerprints are
/// computed, so natural-key lookups see the same values as the payload.
fn fill_null_cells(conn: &Connection) -> Result<()> {
    let mut filled = 0;
    for spec in OBSERVATION_COLUMNS {
        let Some(default) = spec.default_sql() else {
            continue;
        };
        filled += conn
            .execute(
                &format!(
                    "UPDATE observations SET {name} = {default} WHERE {name} IS NULL",
                    name = spec.name
                ),
                [],
            )
            .with_context(|| format!("failed to fill NULL cells in {}", spec.name))?;
    }

    if filled > 0 {
        log_info!("Filled {filled} NULL cells with column defaults");
    }

    Ok(())
}

/// Computes the dedup fingerprint for rows written before it was stored.
fn backfill_payloads(conn: &Connection) -> Result<()> {
    let pending = {
        let mut stmt = conn.prepare("SELECT * FROM observations WHERE payload = ''")?;
        let mut rows = stmt.query([])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get("id")?;
            let record = row_to_record(row)?;
            pending.push((id, codec::fingerprint(&record)?));
        }
        pending
    };

    for (id, payload) in &pending {
        conn.execute(
            "UPDATE observations SET payload = ?1 WHERE id = ?2",
            params![payload, id],
        )
        .with_context(|| format!("failed to backfill payload for observation {id}"))?;
    }

    if !pending.is_empty() {
        log_info!("Backfilled payload fingerprints for {} observations", pending.len());
    }

    Ok(())
}

//! Duplicate detection ahead of inserts.
//!
//! A submission is a duplicate only when a stored row has the same
//! `storeName`, `startTime` and byte-identical payload fingerprint. A resend
//! with any field corrected is a new observation.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::models::{NaturalKey, NewObservation};

/// Returns the id of the earliest stored row identical to `record`.
pub fn find_duplicate(
    conn: &Connection,
    record: &NewObservation,
    fingerprint: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM observations
         WHERE storeName = ?1 AND startTime = ?2 AND payload = ?3
         ORDER BY id ASC
         LIMIT 1",
        params![record.store_name, record.start_time, fingerprint],
        |row| row.get(0),
    )
    .optional()
    .context("failed to look up duplicate observation")
}

/// Returns the earliest row sharing the full natural key and fingerprint.
pub fn find_by_natural_key(
    conn: &Connection,
    key: &NaturalKey,
    fingerprint: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM observations
         WHERE storeName = ?1 AND startTime = ?2 AND payload = ?3
           AND product = ?4 AND productType = ?5 AND section = ?6
         ORDER BY id ASC
         LIMIT 1",
        params![
            key.store_name,
            key.start_time,
            fingerprint,
            key.product,
            key.product_type,
            key.section,
        ],
        |row| row.get(0),
    )
    .optional()
    .context("failed to look up observation by natural key")
}

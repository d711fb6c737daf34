//! Tolerant column readers.
//!
//! Older deployments stored counts as TEXT (often `"N/A"`) and left columns
//! NULL. Reads coerce those values to the canonical defaults instead of
//! failing the whole listing.

use anyhow::{Context, Result};
use rusqlite::{types::ValueRef, Row};

use crate::{db::models::ObservationStatus, log_warn};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::db";

pub fn column_text(row: &Row, column: &str, default: &str) -> Result<String> {
    let value = row
        .get_ref(column)
        .with_context(|| format!("missing column {column}"))?;
    Ok(match value {
        ValueRef::Null | ValueRef::Blob(_) => default.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Integer(number) => number.to_string(),
        ValueRef::Real(number) => number.to_string(),
    })
}

pub fn column_int(row: &Row, column: &str) -> Result<i64> {
    let value = row
        .get_ref(column)
        .with_context(|| format!("missing column {column}"))?;
    Ok(match value {
        ValueRef::Integer(number) => number,
        ValueRef::Real(number) if number.is_finite() => number as i64,
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0),
        _ => 0,
    })
}

pub fn column_bool(row: &Row, column: &str) -> Result<bool> {
    let value = row
        .get_ref(column)
        .with_context(|| format!("missing column {column}"))?;
    Ok(match value {
        ValueRef::Integer(number) => number != 0,
        ValueRef::Text(bytes) => {
            let raw = String::from_utf8_lossy(bytes);
            let raw = raw.trim();
            raw == "1" || raw.eq_ignore_ascii_case("true")
        }
        _ => false,
    })
}

/// Unknown values read back as `Synced`: a row only reaches the table once
/// the device has synced it.
pub fn parse_status(value: Option<&str>) -> ObservationStatus {
    match value.map(str::trim) {
        None | Some("") => ObservationStatus::Synced,
        Some(raw) if raw.eq_ignore_ascii_case("synced") => ObservationStatus::Synced,
        Some(raw) if raw.eq_ignore_ascii_case("awaiting") => ObservationStatus::Awaiting,
        Some(other) => {
            log_warn!("Unknown observation status {other:?}; reading as synced");
            ObservationStatus::Synced
        }
    }
}

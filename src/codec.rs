//! Record codec: loosely-typed device input to canonical observations.
//!
//! Devices send JSON objects whose shape drifted across app releases: numbers
//! arrive as strings, counts arrive as `"N/A"`, and some deployments group the
//! non-identity fields under a single `payload` (or `data`) object. Decoding
//! flattens that object, fills every omitted field with its documented
//! default, and rejects only unusable identity fields or non-numeric metrics.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::{
    db::models::{NewObservation, ObservationStatus, NOT_APPLICABLE},
    error::{StoreError, StoreResult},
};

/// Keys under which a nested structured payload may appear.
pub const PAYLOAD_KEYS: [&str; 2] = ["payload", "data"];

/// Decodes a raw JSON value into a canonical record.
pub fn decode(raw: &Value) -> StoreResult<NewObservation> {
    let object = raw
        .as_object()
        .ok_or_else(|| StoreError::validation("record", "expected a JSON object"))?;
    let fields = flatten(object)?;
    let defaults = NewObservation::default();

    Ok(NewObservation {
        store_name: identity(&fields, "storeName")?,
        product: identity(&fields, "product")?,
        product_type: text(&fields, "productType", &defaults.product_type)?,
        section: text(&fields, "section", &defaults.section)?,
        space_pass: text(&fields, "spacePass", &defaults.space_pass)?,
        ladder_required: text(&fields, "ladderRequired", &defaults.ladder_required)?,
        size25: integer(&fields, "size25")?,
        not_located_units: integer(&fields, "notLocatedUnits")?,
        observations: text(&fields, "observations", &defaults.observations)?,
        start_time: text(&fields, "startTime", &defaults.start_time)?,
        end_time: text(&fields, "endTime", &defaults.end_time)?,
        picking_time: integer(&fields, "pickingTime")?,
        picking_found: integer(&fields, "pickingFound")?,
        picking_not_found: integer(&fields, "pickingNotFound")?,
        reoperating_time: integer(&fields, "reoperatingTime")?,
        reoperating_manipulated: integer(&fields, "reoperatingManipulated")?,
        shopfloor_time: integer(&fields, "shopfloorTime")?,
        shopfloor_manipulated: integer(&fields, "shopfloorManipulated")?,
        transits_time: integer(&fields, "transitsTime")?,
        devices_failures_time: integer(&fields, "devicesFailuresTime")?,
        // Anything reaching the store has been synced by definition.
        status: ObservationStatus::Synced,
        receiving_requests: text(&fields, "receivingRequests", &defaults.receiving_requests)?,
    })
}

/// Canonical serialization of a record, compared by the dedup guard and by
/// reconcile. Stable as long as `NewObservation`'s field order is.
pub fn fingerprint(record: &NewObservation) -> Result<String> {
    serde_json::to_string(record).context("failed to serialize observation payload")
}

/// Merges the optional nested payload into the top level. Top-level keys win.
fn flatten(object: &Map<String, Value>) -> StoreResult<Map<String, Value>> {
    let mut merged = Map::new();

    for key in PAYLOAD_KEYS {
        match object.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(nested)) => {
                for (name, value) in nested {
                    merged.insert(name.clone(), value.clone());
                }
            }
            Some(_) => return Err(StoreError::validation(key, "expected a nested object")),
        }
    }

    for (name, value) in object {
        if PAYLOAD_KEYS.contains(&name.as_str()) {
            continue;
        }
        merged.insert(name.clone(), value.clone());
    }

    Ok(merged)
}

fn identity(fields: &Map<String, Value>, name: &str) -> StoreResult<String> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(StoreError::validation(name, "is required")),
        Some(Value::String(value)) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(StoreError::validation(name, "must not be blank"))
            } else {
                Ok(trimmed.to_string())
            }
        }
        Some(_) => Err(StoreError::validation(name, "expected a string")),
    }
}

fn text(fields: &Map<String, Value>, name: &str, default: &str) -> StoreResult<String> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Bool(value)) => Ok(value.to_string()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        Some(_) => Err(StoreError::validation(name, "expected text")),
    }
}

fn integer(fields: &Map<String, Value>, name: &str) -> StoreResult<i64> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_i64() {
                return Ok(value);
            }
            match number.as_f64() {
                Some(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
                    Ok(value as i64)
                }
                _ => Err(StoreError::validation(name, format!("{number} is not an integer"))),
            }
        }
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NOT_APPLICABLE) {
                return Ok(0);
            }
            trimmed
                .parse::<i64>()
                .map_err(|_| StoreError::validation(name, format!("'{raw}' is not an integer")))
        }
        Some(_) => Err(StoreError::validation(name, "expected an integer")),
    }
}

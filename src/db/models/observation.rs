//! Observation data models.
//!
//! `NewObservation` is the canonical record produced by the codec and written
//! to both the table and the backup log. `Observation` is a stored row.

use serde::{Deserialize, Serialize};

/// Sentinel used by devices for classification fields that do not apply.
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Awaiting,
    #[default]
    Synced,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Awaiting => "awaiting",
            ObservationStatus::Synced => "synced",
        }
    }
}

/// Canonical observation content, everything except the storage-assigned
/// `id` and the `flaggedObservation` marker.
///
/// Field order is part of the payload fingerprint; append new fields at the
/// end so fingerprints of existing rows stay stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NewObservation {
    pub store_name: String,
    pub product: String,
    pub product_type: String,
    pub section: String,
    pub space_pass: String,
    pub ladder_required: String,
    pub size25: i64,
    pub not_located_units: i64,
    pub observations: String,
    pub start_time: String,
    pub end_time: String,
    pub picking_time: i64,
    pub picking_found: i64,
    pub picking_not_found: i64,
    pub reoperating_time: i64,
    pub reoperating_manipulated: i64,
    pub shopfloor_time: i64,
    pub shopfloor_manipulated: i64,
    pub transits_time: i64,
    pub devices_failures_time: i64,
    pub status: ObservationStatus,
    pub receiving_requests: String,
}

impl Default for NewObservation {
    fn default() -> Self {
        Self {
            store_name: String::new(),
            product: String::new(),
            product_type: NOT_APPLICABLE.into(),
            section: NOT_APPLICABLE.into(),
            space_pass: NOT_APPLICABLE.into(),
            ladder_required: NOT_APPLICABLE.into(),
            size25: 0,
            not_located_units: 0,
            observations: String::new(),
            start_time: NOT_APPLICABLE.into(),
            end_time: NOT_APPLICABLE.into(),
            picking_time: 0,
            picking_found: 0,
            picking_not_found: 0,
            reoperating_time: 0,
            reoperating_manipulated: 0,
            shopfloor_time: 0,
            shopfloor_manipulated: 0,
            transits_time: 0,
            devices_failures_time: 0,
            status: ObservationStatus::Synced,
            receiving_requests: NOT_APPLICABLE.into(),
        }
    }
}

impl NewObservation {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            store_name: self.store_name.clone(),
            product: self.product.clone(),
            product_type: self.product_type.clone(),
            section: self.section.clone(),
            start_time: self.start_time.clone(),
        }
    }
}

/// A stored observation row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewObservation,
    pub flagged_observation: bool,
}

/// Classification fields plus `startTime`; identifies a submission
/// independently of the storage id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NaturalKey {
    pub store_name: String,
    pub product: String,
    pub product_type: String,
    pub section: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOrder {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted { id: i64 },
    Duplicate { id: i64 },
}

impl SaveOutcome {
    pub fn id(&self) -> i64 {
        match self {
            SaveOutcome::Inserted { id } | SaveOutcome::Duplicate { id } => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SaveOutcome::Duplicate { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub table_exists: bool,
    pub row_count: i64,
    pub schema_version: i32,
}

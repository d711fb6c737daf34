//! Unit counts behind the client progress indicators.
//!
//! Some product categories (footwear, perfumery) are audited as one block per
//! store, so their totals ignore `productType` and `section`. Which categories
//! behave that way is configuration, see [`crate::settings::CategoryRules`].

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::db::models::NOT_APPLICABLE;

/// How rows are grouped for a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Grouping {
    /// Match on store and product only.
    SectionInsensitive,
    /// Match on store, product, product type and section.
    FullTuple,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFilter {
    pub store_name: String,
    pub product: String,
    pub product_type: Option<String>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitCount {
    pub store: String,
    pub product: String,
    #[serde(rename = "productType")]
    pub product_type: String,
    pub section: String,
    pub grouping: Grouping,
    pub total_units: i64,
}

/// `None`, blank and `N/A` are one equivalence class.
pub fn is_not_applicable(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None => true,
        Some(raw) => raw.is_empty() || raw.eq_ignore_ascii_case(NOT_APPLICABLE),
    }
}

/// SQL condition for one classification column: the not-applicable class
/// matches NULL, blank or `N/A` cells; anything else matches exactly.
fn classification_clause(
    column: &str,
    value: Option<&str>,
    params: &mut Vec<String>,
) -> String {
    if is_not_applicable(value) {
        format!("({column} IS NULL OR TRIM({column}) = '' OR UPPER(TRIM({column})) = 'N/A')")
    } else {
        params.push(value.unwrap_or_default().to_string());
        format!("{column} = ?{}", params.len())
    }
}

pub(crate) fn count_statement(filter: &UnitFilter, grouping: Grouping) -> (String, Vec<String>) {
    let mut params = vec![filter.store_name.clone(), filter.product.clone()];
    let mut sql = String::from(
        "SELECT COALESCE(SUM(pickingFound), 0) FROM observations \
         WHERE storeName = ?1 AND product = ?2",
    );

    if grouping == Grouping::FullTuple {
        let type_clause =
            classification_clause("productType", filter.product_type.as_deref(), &mut params);
        let section_clause =
            classification_clause("section", filter.section.as_deref(), &mut params);
        sql.push_str(" AND ");
        sql.push_str(&type_clause);
        sql.push_str(" AND ");
        sql.push_str(&section_clause);
    }

    (sql, params)
}

pub(crate) fn sum_picking_found(
    conn: &Connection,
    filter: &UnitFilter,
    grouping: Grouping,
) -> Result<i64> {
    let (sql, params) = count_statement(filter, grouping);
    conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
        .context("failed to sum pickingFound")
}

use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::Grouping;

/// One row of the category table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRule {
    pub name: String,
    pub section_insensitive: bool,
}

impl CategoryRule {
    fn new(name: &str, section_insensitive: bool) -> Self {
        Self {
            name: name.into(),
            section_insensitive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditSettings {
    pub categories: Vec<CategoryRule>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        // English and Spanish labels used by the store fleet today.
        Self {
            categories: vec![
                CategoryRule::new("Shoes", true),
                CategoryRule::new("Calzado", true),
                CategoryRule::new("Perfumery", true),
                CategoryRule::new("Perfumeria", true),
            ],
        }
    }
}

/// Snapshot of section-insensitive categories, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct CategoryRules {
    section_insensitive: HashSet<String>,
}

impl CategoryRules {
    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self {
            section_insensitive: settings
                .categories
                .iter()
                .filter(|rule| rule.section_insensitive)
                .map(|rule| normalize(&rule.name))
                .collect(),
        }
    }

    pub fn grouping_for(&self, product: &str) -> Grouping {
        if self.section_insensitive.contains(&normalize(product)) {
            Grouping::SectionInsensitive
        } else {
            Grouping::FullTuple
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AuditSettings>,
}

impl SettingsStore {
    /// Loads settings from `path`, or defaults when the file does not exist.
    /// A file that exists but does not parse is an error.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            AuditSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn snapshot(&self) -> AuditSettings {
        self.read().clone()
    }

    pub fn category_rules(&self) -> CategoryRules {
        CategoryRules::from_settings(&self.read())
    }

    /// Adds or replaces the rule for `rule.name` (case-insensitive) and
    /// writes the file.
    pub fn upsert_category(&self, rule: CategoryRule) -> Result<AuditSettings> {
        let mut guard = self.write();
        let mut updated = guard.clone();
        let key = normalize(&rule.name);
        match updated
            .categories
            .iter()
            .position(|existing| normalize(&existing.name) == key)
        {
            Some(index) => updated.categories[index] = rule,
            None => updated.categories.push(rule),
        }
        // Only a rule that reached the file takes effect.
        self.persist(&updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    fn persist(&self, data: &AuditSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, AuditSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, AuditSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//! Typed ledger payloads carried in a record's data object

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity::{EntityKind, OwnerId, SyncRecord};
use crate::error::{Error, Result};

/// A domain shape that lives in the data object of a [`SyncRecord`]
pub trait EntityPayload: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    /// Serialize into the record data object
    fn to_data(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::InvalidInput(format!(
                "{} payload must serialize to an object, got {other}",
                Self::KIND
            ))),
        }
    }

    /// Read back from a record of the matching kind
    fn from_record(record: &SyncRecord) -> Result<Self> {
        if record.kind != Self::KIND {
            return Err(Error::InvalidInput(format!(
                "expected a {} record, got {}",
                Self::KIND,
                record.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(record.data.clone()))?)
    }

    /// Build a new local-only record owned by `owner_id`
    fn into_record(&self, owner_id: OwnerId) -> Result<SyncRecord> {
        let record = SyncRecord::new_local(Self::KIND, owner_id, self.to_data()?);
        record.validate()?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    Income,
    Expense,
}

/// A single income or expense line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub amount_cents: i64,
    pub direction: EntryDirection,
    pub occurred_on: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl EntityPayload for LedgerEntry {
    const KIND: EntityKind = EntityKind::Entry;
}

/// Money owed to or by a counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debt {
    pub counterparty: String,
    pub amount_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub settled: bool,
}

impl EntityPayload for Debt {
    const KIND: EntityKind = EntityKind::Debt;
}

/// Savings goal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub name: String,
    pub target_cents: i64,
    #[serde(default)]
    pub saved_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDate>,
}

impl EntityPayload for Goal {
    const KIND: EntityKind = EntityKind::Goal;
}

/// User-defined category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCategory {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl EntityPayload for CustomCategory {
    const KIND: EntityKind = EntityKind::Category;
}

/// Marker hiding a category from pickers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenCategory {
    pub category_id: String,
}

impl EntityPayload for HiddenCategory {
    const KIND: EntityKind = EntityKind::HiddenCategory;
}

/// Display position of a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOrder {
    pub category_id: String,
    pub position: i64,
}

impl EntityPayload for CategoryOrder {
    const KIND: EntityKind = EntityKind::CategoryOrder;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner() -> OwnerId {
        "0192f0c1-7a4e-7cc2-9a51-3f1f2b9d6e10".parse().unwrap()
    }

    #[test]
    fn entry_record_indexes_date_and_category() {
        let entry = LedgerEntry {
            amount_cents: 1250,
            direction: EntryDirection::Expense,
            occurred_on: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            category_id: Some("cat-1".to_string()),
            note: None,
        };
        let record = entry.into_record(owner()).unwrap();

        assert_eq!(record.kind, EntityKind::Entry);
        assert_eq!(record.index_value("occurred_on").as_deref(), Some("2026-10-01"));
        assert_eq!(record.index_value("category_id").as_deref(), Some("cat-1"));
        assert!(!record.data.contains_key("note"));

        let back = LedgerEntry::from_record(&record).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn from_record_rejects_other_kinds() {
        let goal = Goal {
            name: "Bike".to_string(),
            target_cents: 50_000,
            saved_cents: 0,
            target_date: None,
        };
        let record = goal.into_record(owner()).unwrap();
        assert!(Debt::from_record(&record).is_err());
    }
}

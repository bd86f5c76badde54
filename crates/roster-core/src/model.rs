use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ReconcileError;

/// Primary key of an identity (employee) row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    /// Build an identity id from operator input.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the id is empty after trimming.
    pub fn parse(raw: &str) -> Result<Self, ReconcileError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReconcileError::Validation("identity id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityId {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityId> for String {
    fn from(value: IdentityId) -> Self {
        value.0
    }
}

impl Display for IdentityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One employee row as stored in the identity table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
    pub email: Option<String>,
    pub role: String,
    pub archived: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl IdentityRecord {
    /// Lowercased, trimmed name used for duplicate grouping.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_key(&self.name)
    }

    #[must_use]
    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().map(normalize_key).filter(|email| !email.is_empty())
    }
}

pub(crate) fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Tables whose rows reference an identity through `employee_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependentTable {
    MileageEntry,
    Receipt,
    TimeEntry,
    DailyDescription,
    ExpenseReport,
}

impl DependentTable {
    /// Fixed re-key order shared by merges and id migrations.
    pub const ALL: [Self; 5] = [
        Self::MileageEntry,
        Self::Receipt,
        Self::TimeEntry,
        Self::DailyDescription,
        Self::ExpenseReport,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MileageEntry => "mileage_entry",
            Self::Receipt => "receipt",
            Self::TimeEntry => "time_entry",
            Self::DailyDescription => "daily_description",
            Self::ExpenseReport => "expense_report",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mileage_entry" => Some(Self::MileageEntry),
            "receipt" => Some(Self::Receipt),
            "time_entry" => Some(Self::TimeEntry),
            "daily_description" => Some(Self::DailyDescription),
            "expense_report" => Some(Self::ExpenseReport),
            _ => None,
        }
    }

    /// Table name in the relational store.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::MileageEntry => "mileage_entries",
            Self::Receipt => "receipts",
            Self::TimeEntry => "time_entries",
            Self::DailyDescription => "daily_descriptions",
            Self::ExpenseReport => "expense_reports",
        }
    }

    /// Entity type name exposed by the remote entity API.
    #[must_use]
    pub fn entity_name(self) -> &'static str {
        match self {
            Self::MileageEntry => "MileageEntry",
            Self::Receipt => "Receipt",
            Self::TimeEntry => "TimeEntry",
            Self::DailyDescription => "DailyDescription",
            Self::ExpenseReport => "ExpenseReport",
        }
    }
}

impl Display for DependentTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const IDENTITY_TABLE: &str = "employees";
pub const IDENTITY_ENTITY: &str = "Employee";
pub const FOREIGN_KEY_COLUMN: &str = "employee_id";

/// A dependent row reduced to what re-keying needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependentRow {
    pub id: String,
    pub employee_id: IdentityId,
}

/// Per-table row counts for one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts(BTreeMap<DependentTable, u64>);

impl TableCounts {
    #[must_use]
    pub fn get(&self, table: DependentTable) -> u64 {
        self.0.get(&table).copied().unwrap_or(0)
    }

    pub fn set(&mut self, table: DependentTable, count: u64) {
        self.0.insert(table, count);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DependentTable, u64)> + '_ {
        self.0.iter().map(|(table, count)| (*table, *count))
    }
}

impl FromIterator<(DependentTable, u64)> for TableCounts {
    fn from_iter<I: IntoIterator<Item = (DependentTable, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

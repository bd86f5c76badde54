use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::{DependentRow, DependentTable, IdentityId, IdentityRecord, TableCounts};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// In-place access to the local store file.
    Direct,
    /// Per-entity requests against the remote entity API.
    Remote,
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Move every dependent row from `from` to `to`, then drop the `from` identity.
///
/// When `create_target` is set the target identity row is inserted first (id migration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyPlan {
    pub from: IdentityId,
    pub to: IdentityId,
    pub create_target: Option<IdentityRecord>,
}

impl RekeyPlan {
    #[must_use]
    pub fn merge(source: IdentityId, target: IdentityId) -> Self {
        Self { from: source, to: target, create_target: None }
    }

    #[must_use]
    pub fn migration(old_id: IdentityId, new_record: IdentityRecord) -> Self {
        Self { from: old_id, to: new_record.id.clone(), create_target: Some(new_record) }
    }

    pub fn tables(&self) -> impl Iterator<Item = DependentTable> {
        DependentTable::ALL.into_iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowFailure {
    pub row_id: String,
    pub error: String,
}

/// Outcome of re-keying one dependent table.
///
/// `moved_rows` and `failed_rows` are itemized in remote mode only; a direct-mode
/// re-key is a single statement and reports counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableRekey {
    pub table: DependentTable,
    pub expected: u64,
    pub moved: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub moved_rows: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_rows: Vec<RowFailure>,
}

impl TableRekey {
    #[must_use]
    pub fn counted(table: DependentTable, expected: u64, moved: u64) -> Self {
        Self { table, expected, moved, moved_rows: Vec::new(), failed_rows: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RekeyReport {
    pub mode: AccessMode,
    pub from: IdentityId,
    pub to: IdentityId,
    pub target_created: bool,
    pub tables: Vec<TableRekey>,
    pub source_deleted: bool,
    pub rolled_back: bool,
}

impl RekeyReport {
    #[must_use]
    pub fn new(mode: AccessMode, plan: &RekeyPlan) -> Self {
        Self {
            mode,
            from: plan.from.clone(),
            to: plan.to.clone(),
            target_created: false,
            tables: Vec::new(),
            source_deleted: false,
            rolled_back: false,
        }
    }

    #[must_use]
    pub fn moved_counts(&self) -> TableCounts {
        self.tables.iter().map(|entry| (entry.table, entry.moved)).collect()
    }

    #[must_use]
    pub fn failed_rows(&self) -> usize {
        self.tables.iter().map(|entry| entry.failed_rows.len()).sum()
    }
}

/// Uniform row access over either the local store file or the remote entity API.
pub trait StoreAccessor {
    fn mode(&self) -> AccessMode;

    /// # Errors
    /// Returns an error when the identity table cannot be read.
    fn list_identities(&self) -> Result<Vec<IdentityRecord>, ReconcileError>;

    /// # Errors
    /// Returns an error when the lookup fails; a missing row is `Ok(None)`.
    fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, ReconcileError>;

    /// # Errors
    /// Returns an error when the dependent table cannot be read.
    fn list_dependents(
        &self,
        table: DependentTable,
        employee_id: &IdentityId,
    ) -> Result<Vec<DependentRow>, ReconcileError>;

    /// # Errors
    /// Returns an error when the dependent table cannot be read.
    fn count_dependents(
        &self,
        table: DependentTable,
        employee_id: &IdentityId,
    ) -> Result<u64, ReconcileError> {
        let rows = self.list_dependents(table, employee_id)?;
        Ok(rows.len() as u64)
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    fn insert_identity(&mut self, record: &IdentityRecord) -> Result<(), ReconcileError>;

    /// # Errors
    /// Returns [`ReconcileError::NotFound`] when no such identity exists.
    fn delete_identity(&mut self, id: &IdentityId) -> Result<(), ReconcileError>;

    /// Point every row of `table` referencing `old` at `new`; returns rows changed.
    ///
    /// # Errors
    /// Returns an error when the update fails; in remote mode a partial update is
    /// reported as [`ReconcileError::PartialFailure`].
    fn bulk_update_foreign_key(
        &mut self,
        table: DependentTable,
        old: &IdentityId,
        new: &IdentityId,
    ) -> Result<u64, ReconcileError>;

    /// Execute a full re-key plan as one logical operation.
    ///
    /// # Errors
    /// Direct stores roll back and report [`ReconcileError::PartialFailure`] on any
    /// statement failure; remote stores return the itemized report in the same variant
    /// and leave the source identity in place.
    fn apply_rekey(&mut self, plan: &RekeyPlan) -> Result<RekeyReport, ReconcileError>;

    /// Per-table counts of rows referencing `employee_id`.
    ///
    /// # Errors
    /// Returns an error when any dependent table cannot be read.
    fn dependent_counts(&self, employee_id: &IdentityId) -> Result<TableCounts, ReconcileError> {
        DependentTable::ALL
            .into_iter()
            .map(|table| -> Result<(DependentTable, u64), ReconcileError> {
                Ok((table, self.count_dependents(table, employee_id)?))
            })
            .collect()
    }
}

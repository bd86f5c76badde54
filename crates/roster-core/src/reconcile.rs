//! Merge and id-migration engines.
//!
//! Both move every dependent row from one identity to another and delete the old
//! identity row. The store decides how that is made atomic (see
//! [`StoreAccessor::apply_rekey`]); this module validates inputs, captures
//! before/after counts, and checks row conservation.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::accessor::{AccessMode, RekeyPlan, RekeyReport, StoreAccessor};
use crate::model::{DependentTable, IdentityId, IdentityRecord, TableCounts};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOperation {
    Merge,
    MigrateId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub source: IdentityId,
    pub target: IdentityId,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityOverrides {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub old_id: IdentityId,
    pub new_id: IdentityId,
    pub overrides: IdentityOverrides,
    pub dry_run: bool,
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub operation: ReconcileOperation,
    pub mode: AccessMode,
    pub dry_run: bool,
    pub from: IdentityId,
    pub to: IdentityId,
    pub from_before: TableCounts,
    pub to_before: TableCounts,
    /// Rows that move (or, in a dry run, would move) per table.
    pub planned: TableCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_identity: Option<IdentityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rekey: Option<RekeyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_after: Option<TableCounts>,
    pub verified: bool,
}

/// Fold `source` into `target`: re-key all dependents, then delete `source`.
///
/// # Errors
/// `Validation` when the ids are equal, `NotFound` when either identity is missing,
/// `PartialFailure` from the store, and `Integrity` when the post-merge counts do not
/// add up.
pub fn merge_identities<S: StoreAccessor + ?Sized>(
    store: &mut S,
    request: &MergeRequest,
) -> Result<ReconcileReport, ReconcileError> {
    if request.source == request.target {
        return Err(ReconcileError::Validation(format!(
            "source and target must differ: {}",
            request.source
        )));
    }
    require_identity(store, &request.source, "source")?;
    require_identity(store, &request.target, "target")?;

    let plan = RekeyPlan::merge(request.source.clone(), request.target.clone());
    execute(store, ReconcileOperation::Merge, plan, request.dry_run)
}

/// Rotate an identity's key: create `new_id`, re-key all dependents, delete `old_id`.
///
/// The new row copies the old row's attributes (with `overrides` applied) and gets
/// fresh `created_at`/`updated_at` timestamps.
///
/// # Errors
/// `Validation` when the ids are equal or `new_id` already exists, `NotFound` when
/// `old_id` is missing, plus the store and verification errors of
/// [`merge_identities`].
pub fn migrate_identity<S: StoreAccessor + ?Sized>(
    store: &mut S,
    request: &MigrationRequest,
) -> Result<ReconcileReport, ReconcileError> {
    if request.old_id == request.new_id {
        return Err(ReconcileError::Validation(format!(
            "old and new id must differ: {}",
            request.old_id
        )));
    }
    let old = require_identity(store, &request.old_id, "old")?;
    if store.get_identity(&request.new_id)?.is_some() {
        return Err(ReconcileError::Validation(format!(
            "new identity already exists: {}",
            request.new_id
        )));
    }

    let overrides = &request.overrides;
    let new_record = IdentityRecord {
        id: request.new_id.clone(),
        name: overrides.name.clone().unwrap_or(old.name),
        email: overrides.email.clone().or(old.email),
        role: overrides.role.clone().unwrap_or(old.role),
        archived: old.archived,
        created_at: request.now,
        updated_at: request.now,
    };

    let plan = RekeyPlan::migration(request.old_id.clone(), new_record);
    execute(store, ReconcileOperation::MigrateId, plan, request.dry_run)
}

fn require_identity<S: StoreAccessor + ?Sized>(
    store: &S,
    id: &IdentityId,
    role: &str,
) -> Result<IdentityRecord, ReconcileError> {
    store
        .get_identity(id)?
        .ok_or_else(|| ReconcileError::NotFound(format!("{role} identity {id}")))
}

fn execute<S: StoreAccessor + ?Sized>(
    store: &mut S,
    operation: ReconcileOperation,
    plan: RekeyPlan,
    dry_run: bool,
) -> Result<ReconcileReport, ReconcileError> {
    let from_before = store.dependent_counts(&plan.from)?;
    let to_before = store.dependent_counts(&plan.to)?;

    let mut report = ReconcileReport {
        operation,
        mode: store.mode(),
        dry_run,
        from: plan.from.clone(),
        to: plan.to.clone(),
        planned: from_before.clone(),
        from_before,
        to_before,
        new_identity: plan.create_target.clone(),
        rekey: None,
        to_after: None,
        verified: false,
    };

    if dry_run {
        tracing::info!(
            ?operation,
            from = %plan.from,
            to = %plan.to,
            rows = report.planned.total(),
            "dry run, no rows changed"
        );
        return Ok(report);
    }

    tracing::info!(?operation, from = %plan.from, to = %plan.to, mode = %report.mode, "re-keying identity");
    let rekey = store.apply_rekey(&plan)?;
    report.rekey = Some(rekey);

    let from_after = store.dependent_counts(&plan.from)?;
    let to_after = store.dependent_counts(&plan.to)?;
    let source_gone = store.get_identity(&plan.from)?.is_none();
    report.to_after = Some(to_after.clone());

    verify_conservation(&report.from_before, &report.to_before, &from_after, &to_after)?;
    if !source_gone {
        return Err(ReconcileError::Integrity(format!(
            "identity {} still present after re-key",
            plan.from
        )));
    }

    report.verified = true;
    tracing::info!(?operation, from = %plan.from, to = %plan.to, rows = report.planned.total(), "re-key verified");
    Ok(report)
}

/// Check row conservation and absence of dangling references for every table.
///
/// # Errors
/// Returns [`ReconcileError::Integrity`] naming every table that does not balance.
pub fn verify_conservation(
    from_before: &TableCounts,
    to_before: &TableCounts,
    from_after: &TableCounts,
    to_after: &TableCounts,
) -> Result<(), ReconcileError> {
    let mut problems = Vec::new();
    for table in DependentTable::ALL {
        let dangling = from_after.get(table);
        if dangling != 0 {
            problems.push(format!("{table}: {dangling} rows still reference the removed id"));
        }
        let expected = from_before.get(table) + to_before.get(table);
        let actual = to_after.get(table);
        if actual != expected {
            problems.push(format!("{table}: expected {expected} rows on target, found {actual}"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::Integrity(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::accessor::TableRekey;
    use crate::model::DependentRow;

    #[derive(Default)]
    struct MemoryStore {
        identities: Vec<IdentityRecord>,
        rows: BTreeMap<DependentTable, Vec<DependentRow>>,
        fail_on: Option<DependentTable>,
    }

    impl MemoryStore {
        fn add_identity(&mut self, id: &str, name: &str) -> Result<(), ReconcileError> {
            self.identities.push(IdentityRecord {
                id: IdentityId::parse(id)?,
                name: name.to_string(),
                email: Some(format!("{id}@example.com")),
                role: "employee".to_string(),
                archived: false,
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            });
            Ok(())
        }

        fn add_rows(&mut self, table: DependentTable, owner: &str, count: usize) -> Result<(), ReconcileError> {
            let owner = IdentityId::parse(owner)?;
            let rows = self.rows.entry(table).or_default();
            for _ in 0..count {
                let id = format!("{table}-{}", rows.len());
                rows.push(DependentRow { id, employee_id: owner.clone() });
            }
            Ok(())
        }
    }

    impl StoreAccessor for MemoryStore {
        fn mode(&self) -> AccessMode {
            AccessMode::Direct
        }

        fn list_identities(&self) -> Result<Vec<IdentityRecord>, ReconcileError> {
            Ok(self.identities.clone())
        }

        fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, ReconcileError> {
            Ok(self.identities.iter().find(|identity| &identity.id == id).cloned())
        }

        fn list_dependents(
            &self,
            table: DependentTable,
            employee_id: &IdentityId,
        ) -> Result<Vec<DependentRow>, ReconcileError> {
            Ok(self
                .rows
                .get(&table)
                .map(|rows| rows.iter().filter(|row| &row.employee_id == employee_id).cloned().collect())
                .unwrap_or_default())
        }

        fn insert_identity(&mut self, record: &IdentityRecord) -> Result<(), ReconcileError> {
            self.identities.push(record.clone());
            Ok(())
        }

        fn delete_identity(&mut self, id: &IdentityId) -> Result<(), ReconcileError> {
            let before = self.identities.len();
            self.identities.retain(|identity| &identity.id != id);
            if self.identities.len() == before {
                return Err(ReconcileError::NotFound(format!("identity {id}")));
            }
            Ok(())
        }

        fn bulk_update_foreign_key(
            &mut self,
            table: DependentTable,
            old: &IdentityId,
            new: &IdentityId,
        ) -> Result<u64, ReconcileError> {
            if self.fail_on == Some(table) {
                return Err(ReconcileError::Store(format!("{table} is read-only")));
            }
            let mut moved = 0;
            for row in self.rows.entry(table).or_default() {
                if &row.employee_id == old {
                    row.employee_id = new.clone();
                    moved += 1;
                }
            }
            Ok(moved)
        }

        fn apply_rekey(&mut self, plan: &RekeyPlan) -> Result<RekeyReport, ReconcileError> {
            let checkpoint = (self.identities.clone(), self.rows.clone());
            let mut report = RekeyReport::new(self.mode(), plan);
            let outcome = (|| -> Result<(), ReconcileError> {
                if let Some(record) = &plan.create_target {
                    self.insert_identity(record)?;
                    report.target_created = true;
                }
                for table in plan.tables() {
                    let expected = self.count_dependents(table, &plan.from)?;
                    let moved = self.bulk_update_foreign_key(table, &plan.from, &plan.to)?;
                    report.tables.push(TableRekey::counted(table, expected, moved));
                }
                self.delete_identity(&plan.from)?;
                report.source_deleted = true;
                Ok(())
            })();

            match outcome {
                Ok(()) => Ok(report),
                Err(err) => {
                    (self.identities, self.rows) = checkpoint;
                    report.rolled_back = true;
                    report.source_deleted = false;
                    Err(ReconcileError::PartialFailure { message: err.to_string(), report: Box::new(report) })
                }
            }
        }
    }

    fn id(raw: &str) -> Result<IdentityId, ReconcileError> {
        IdentityId::parse(raw)
    }

    #[test]
    fn merge_moves_all_rows_and_removes_source() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("A", "Dana Smith")?;
        store.add_identity("B", "dana smith")?;
        store.add_rows(DependentTable::MileageEntry, "B", 50)?;
        store.add_rows(DependentTable::Receipt, "B", 10)?;

        let report = merge_identities(
            &mut store,
            &MergeRequest { source: id("B")?, target: id("A")?, dry_run: false },
        )?;

        assert!(report.verified);
        assert_eq!(store.count_dependents(DependentTable::MileageEntry, &id("A")?)?, 50);
        assert_eq!(store.count_dependents(DependentTable::Receipt, &id("A")?)?, 10);
        assert!(store.get_identity(&id("B")?)?.is_none());
        let moved = report.rekey.map(|rekey| rekey.moved_counts()).unwrap_or_default();
        assert_eq!(moved.total(), 60);
        Ok(())
    }

    #[test]
    fn merge_dry_run_reports_without_mutating() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("A", "Dana")?;
        store.add_identity("B", "Dana")?;
        store.add_rows(DependentTable::TimeEntry, "B", 3)?;

        let report = merge_identities(
            &mut store,
            &MergeRequest { source: id("B")?, target: id("A")?, dry_run: true },
        )?;

        assert!(report.dry_run);
        assert_eq!(report.planned.get(DependentTable::TimeEntry), 3);
        assert!(report.rekey.is_none());
        assert_eq!(store.count_dependents(DependentTable::TimeEntry, &id("B")?)?, 3);
        assert!(store.get_identity(&id("B")?)?.is_some());
        Ok(())
    }

    #[test]
    fn merge_rejects_missing_or_identical_ids() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("A", "Dana")?;

        let same = merge_identities(
            &mut store,
            &MergeRequest { source: id("A")?, target: id("A")?, dry_run: false },
        );
        assert!(matches!(same, Err(ReconcileError::Validation(_))));

        let missing = merge_identities(
            &mut store,
            &MergeRequest { source: id("Z")?, target: id("A")?, dry_run: false },
        );
        assert!(matches!(missing, Err(ReconcileError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn failed_rekey_leaves_store_untouched() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("A", "Dana")?;
        store.add_identity("B", "Dana")?;
        store.add_rows(DependentTable::MileageEntry, "B", 4)?;
        store.add_rows(DependentTable::TimeEntry, "B", 2)?;
        store.fail_on = Some(DependentTable::TimeEntry);

        let result = merge_identities(
            &mut store,
            &MergeRequest { source: id("B")?, target: id("A")?, dry_run: false },
        );

        let Err(err) = result else {
            return Err(ReconcileError::Validation("expected partial failure".to_string()));
        };
        assert_eq!(err.kind(), "partial_failure");
        assert!(err.report().is_some_and(|report| report.rolled_back));
        assert_eq!(store.count_dependents(DependentTable::MileageEntry, &id("B")?)?, 4);
        assert!(store.get_identity(&id("B")?)?.is_some());
        Ok(())
    }

    #[test]
    fn migration_moves_rows_to_fresh_identity() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("old-1", "Dana")?;
        store.add_rows(DependentTable::MileageEntry, "old-1", 3)?;
        store.add_rows(DependentTable::ExpenseReport, "old-1", 1)?;
        let now = OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000);

        let report = migrate_identity(
            &mut store,
            &MigrationRequest {
                old_id: id("old-1")?,
                new_id: id("new-1")?,
                overrides: IdentityOverrides { role: Some("manager".to_string()), ..IdentityOverrides::default() },
                dry_run: false,
                now,
            },
        )?;

        assert!(report.verified);
        let new_id = id("new-1")?;
        assert_eq!(store.count_dependents(DependentTable::MileageEntry, &new_id)?, 3);
        assert_eq!(store.count_dependents(DependentTable::ExpenseReport, &new_id)?, 1);
        assert_eq!(store.dependent_counts(&id("old-1")?)?.total(), 0);
        assert!(store.get_identity(&id("old-1")?)?.is_none());

        let Some(created) = store.get_identity(&new_id)? else {
            return Err(ReconcileError::NotFound("new-1".to_string()));
        };
        assert_eq!(created.name, "Dana");
        assert_eq!(created.role, "manager");
        assert_eq!(created.created_at, now);
        Ok(())
    }

    #[test]
    fn migration_refuses_existing_target_id() -> Result<(), ReconcileError> {
        let mut store = MemoryStore::default();
        store.add_identity("old-1", "Dana")?;
        store.add_identity("new-1", "Dana")?;

        let result = migrate_identity(
            &mut store,
            &MigrationRequest {
                old_id: id("old-1")?,
                new_id: id("new-1")?,
                overrides: IdentityOverrides::default(),
                dry_run: false,
                now: OffsetDateTime::UNIX_EPOCH,
            },
        );
        assert!(matches!(result, Err(ReconcileError::Validation(_))));
        Ok(())
    }

    #[test]
    fn conservation_flags_dangling_and_missing_rows() {
        let from_before: TableCounts = [(DependentTable::Receipt, 2)].into_iter().collect();
        let to_before = TableCounts::default();
        let from_after: TableCounts = [(DependentTable::Receipt, 1)].into_iter().collect();
        let to_after: TableCounts = [(DependentTable::Receipt, 1)].into_iter().collect();

        let Err(ReconcileError::Integrity(message)) =
            verify_conservation(&from_before, &to_before, &from_after, &to_after)
        else {
            panic!("expected integrity error");
        };
        assert!(message.contains("still reference"));
        assert!(message.contains("expected 2 rows"));
    }
}

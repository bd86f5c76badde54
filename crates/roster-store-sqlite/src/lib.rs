use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roster_core::{
    AccessMode, DependentRow, DependentTable, IdentityId, IdentityRecord, ReconcileError,
    RekeyPlan, RekeyReport, StoreAccessor, TableRekey, FOREIGN_KEY_COLUMN, IDENTITY_TABLE,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use time::OffsetDateTime;

pub mod backup;
pub mod restore;

pub use backup::{
    cleanup_snapshots, compress_snapshot, create_snapshot, decompress_snapshot, list_snapshots,
    raw_copy, verify_snapshot, CleanupEntry, CleanupReport, CompressReport, SnapshotEntry,
    SnapshotError, SnapshotInfo, TableRowCount, VerifyReport,
};
pub use restore::{
    restore_from_source, GitRevision, RestoreReport, RestoreScope, RestoreSource, RevisionSource,
    TableRestore,
};

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS employees (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT,
  role TEXT NOT NULL DEFAULT 'employee',
  archived INTEGER NOT NULL DEFAULT 0 CHECK (archived IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mileage_entries (
  id TEXT PRIMARY KEY,
  employee_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  start_location TEXT,
  end_location TEXT,
  miles REAL NOT NULL DEFAULT 0,
  purpose TEXT,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS receipts (
  id TEXT PRIMARY KEY,
  employee_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  vendor TEXT,
  amount_cents INTEGER NOT NULL DEFAULT 0,
  category TEXT,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS time_entries (
  id TEXT PRIMARY KEY,
  employee_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  hours REAL NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS daily_descriptions (
  id TEXT PRIMARY KEY,
  employee_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS expense_reports (
  id TEXT PRIMARY KEY,
  employee_id TEXT NOT NULL,
  entry_date TEXT NOT NULL,
  period_end TEXT,
  status TEXT NOT NULL DEFAULT 'draft',
  total_cents INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_employees_name ON employees(name COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_mileage_entries_employee ON mileage_entries(employee_id);
CREATE INDEX IF NOT EXISTS idx_receipts_employee ON receipts(employee_id);
CREATE INDEX IF NOT EXISTS idx_time_entries_employee ON time_entries(employee_id);
CREATE INDEX IF NOT EXISTS idx_daily_descriptions_employee ON daily_descriptions(employee_id);
CREATE INDEX IF NOT EXISTS idx_expense_reports_employee ON expense_reports(employee_id);
";

/// Direct access to the local expense store file.
///
/// Dependent tables reference `employees.id` without a foreign-key constraint; keeping
/// those references valid is the job of the reconciliation operations.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    /// Open the store file and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// Open an existing store; unlike [`SqliteStore::open`] a missing file is an error.
    ///
    /// The file's journal mode is left as the other clients of the store configured it.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotFound`] when the file does not exist.
    pub fn open_existing(path: &Path) -> Result<Self, ReconcileError> {
        if !path.exists() {
            return Err(ReconcileError::NotFound(format!("store file {}", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(store_error("failed to open store file"))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(store_error("failed to configure sqlite pragmas"))?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the identity and dependent tables when absent.
    ///
    /// # Errors
    /// Returns an error when any DDL statement fails.
    pub fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).context("failed to create store schema")
    }

    /// Insert a dependent row with only its key, owner and date populated.
    ///
    /// # Errors
    /// Returns an error when the insert fails (for example a duplicate row id).
    pub fn insert_dependent(
        &self,
        table: DependentTable,
        row_id: &str,
        employee_id: &IdentityId,
        entry_date: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(id, {FOREIGN_KEY_COLUMN}, entry_date) VALUES (?1, ?2, ?3)",
                    table.table_name()
                ),
                params![row_id, employee_id.as_str(), entry_date],
            )
            .with_context(|| format!("failed to insert {table} row {row_id}"))?;
        Ok(())
    }

    /// Fold the write-ahead log into the main database file.
    ///
    /// # Errors
    /// Returns an error when the checkpoint cannot run.
    pub fn checkpoint(&self) -> Result<()> {
        checkpoint_connection(&self.conn)
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

pub(crate) fn checkpoint_connection(conn: &Connection) -> Result<()> {
    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
        .context("failed to checkpoint write-ahead log")?;
    if busy != 0 {
        anyhow::bail!("write-ahead log checkpoint was blocked by another connection");
    }
    Ok(())
}

fn store_error(context: &str) -> impl FnOnce(rusqlite::Error) -> ReconcileError + '_ {
    move |err| match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => {
            ReconcileError::Integrity(format!("{context}: {err}"))
        }
        _ => ReconcileError::Store(format!("{context}: {err}")),
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String, ReconcileError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ReconcileError::Store(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, ReconcileError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ReconcileError::Store(format!("invalid RFC3339 timestamp {value}: {err}")))
}

struct IdentityRow {
    id: String,
    name: String,
    email: Option<String>,
    role: String,
    archived: bool,
    created_at: String,
    updated_at: String,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            archived: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord, ReconcileError> {
        Ok(IdentityRecord {
            id: IdentityId::parse(&self.id)?,
            name: self.name,
            email: self.email,
            role: self.role,
            archived: self.archived,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

const SELECT_IDENTITY_SQL: &str =
    "SELECT id, name, email, role, archived, created_at, updated_at FROM employees";

fn insert_identity_row(conn: &Connection, record: &IdentityRecord) -> Result<(), ReconcileError> {
    conn.execute(
        "INSERT INTO employees(id, name, email, role, archived, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id.as_str(),
            record.name,
            record.email,
            record.role,
            record.archived,
            rfc3339(record.created_at)?,
            rfc3339(record.updated_at)?,
        ],
    )
    .map_err(store_error("failed to insert identity"))?;
    Ok(())
}

fn identity_exists(conn: &Connection, id: &IdentityId) -> Result<bool, ReconcileError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM employees WHERE id = ?1)",
        params![id.as_str()],
        |row| row.get::<_, bool>(0),
    )
    .map_err(store_error("failed to look up identity"))
}

fn count_rows(
    conn: &Connection,
    table: DependentTable,
    employee_id: &IdentityId,
) -> Result<u64, ReconcileError> {
    let count: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {FOREIGN_KEY_COLUMN} = ?1",
                table.table_name()
            ),
            params![employee_id.as_str()],
            |row| row.get(0),
        )
        .map_err(store_error("failed to count dependent rows"))?;
    u64::try_from(count)
        .map_err(|_| ReconcileError::Store(format!("negative row count for {table}")))
}

fn update_foreign_key(
    conn: &Connection,
    table: DependentTable,
    old: &IdentityId,
    new: &IdentityId,
) -> Result<u64, ReconcileError> {
    let changed = conn
        .execute(
            &format!(
                "UPDATE {} SET {FOREIGN_KEY_COLUMN} = ?1 WHERE {FOREIGN_KEY_COLUMN} = ?2",
                table.table_name()
            ),
            params![new.as_str(), old.as_str()],
        )
        .map_err(store_error("failed to re-key dependent rows"))?;
    Ok(changed as u64)
}

fn delete_identity_row(conn: &Connection, id: &IdentityId) -> Result<(), ReconcileError> {
    let deleted = conn
        .execute("DELETE FROM employees WHERE id = ?1", params![id.as_str()])
        .map_err(store_error("failed to delete identity"))?;
    if deleted == 0 {
        return Err(ReconcileError::NotFound(format!("identity {id}")));
    }
    Ok(())
}

fn rekey_in_transaction(
    tx: &Transaction<'_>,
    plan: &RekeyPlan,
    report: &mut RekeyReport,
) -> Result<(), ReconcileError> {
    match &plan.create_target {
        Some(record) => {
            insert_identity_row(tx, record)?;
            report.target_created = true;
        }
        None => {
            if !identity_exists(tx, &plan.to)? {
                return Err(ReconcileError::NotFound(format!("target identity {}", plan.to)));
            }
        }
    }

    for table in plan.tables() {
        let expected = count_rows(tx, table, &plan.from)?;
        let moved = update_foreign_key(tx, table, &plan.from, &plan.to)?;
        if moved != expected {
            return Err(ReconcileError::Integrity(format!(
                "{table}: re-keyed {moved} rows but {expected} referenced {}",
                plan.from
            )));
        }
        tracing::info!(%table, from = %plan.from, to = %plan.to, moved, "re-keyed table");
        report.tables.push(TableRekey::counted(table, expected, moved));
    }

    delete_identity_row(tx, &plan.from)?;
    report.source_deleted = true;
    Ok(())
}

impl StoreAccessor for SqliteStore {
    fn mode(&self) -> AccessMode {
        AccessMode::Direct
    }

    fn list_identities(&self) -> Result<Vec<IdentityRecord>, ReconcileError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_IDENTITY_SQL} ORDER BY id ASC"))
            .map_err(store_error("failed to prepare identity scan"))?;
        let rows = stmt
            .query_map([], IdentityRow::from_row)
            .map_err(store_error("failed to scan identities"))?;

        let mut identities = Vec::new();
        for row in rows {
            let row = row.map_err(store_error("failed to read identity row"))?;
            identities.push(row.into_record()?);
        }
        Ok(identities)
    }

    fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, ReconcileError> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_IDENTITY_SQL} WHERE id = ?1"),
                params![id.as_str()],
                IdentityRow::from_row,
            )
            .optional()
            .map_err(store_error("failed to load identity"))?;
        row.map(IdentityRow::into_record).transpose()
    }

    fn list_dependents(
        &self,
        table: DependentTable,
        employee_id: &IdentityId,
    ) -> Result<Vec<DependentRow>, ReconcileError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id FROM {} WHERE {FOREIGN_KEY_COLUMN} = ?1 ORDER BY id ASC",
                table.table_name()
            ))
            .map_err(store_error("failed to prepare dependent scan"))?;
        let ids = stmt
            .query_map(params![employee_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(store_error("failed to scan dependent rows"))?;

        let mut rows = Vec::new();
        for id in ids {
            let id = id.map_err(store_error("failed to read dependent row"))?;
            rows.push(DependentRow { id, employee_id: employee_id.clone() });
        }
        Ok(rows)
    }

    fn count_dependents(
        &self,
        table: DependentTable,
        employee_id: &IdentityId,
    ) -> Result<u64, ReconcileError> {
        count_rows(&self.conn, table, employee_id)
    }

    fn insert_identity(&mut self, record: &IdentityRecord) -> Result<(), ReconcileError> {
        insert_identity_row(&self.conn, record)
    }

    fn delete_identity(&mut self, id: &IdentityId) -> Result<(), ReconcileError> {
        delete_identity_row(&self.conn, id)
    }

    fn bulk_update_foreign_key(
        &mut self,
        table: DependentTable,
        old: &IdentityId,
        new: &IdentityId,
    ) -> Result<u64, ReconcileError> {
        update_foreign_key(&self.conn, table, old, new)
    }

    fn apply_rekey(&mut self, plan: &RekeyPlan) -> Result<RekeyReport, ReconcileError> {
        let mut report = RekeyReport::new(AccessMode::Direct, plan);
        let tx = self.conn.transaction().map_err(store_error("failed to start transaction"))?;

        match rekey_in_transaction(&tx, plan, &mut report) {
            Ok(()) => {
                tx.commit().map_err(store_error("failed to commit re-key transaction"))?;
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, "rollback of re-key transaction failed");
                }
                let mutated = report.target_created || !report.tables.is_empty();
                report.rolled_back = true;
                report.target_created = false;
                report.source_deleted = false;
                tracing::warn!(from = %plan.from, to = %plan.to, error = %err, "re-key rolled back");
                if mutated {
                    Err(ReconcileError::PartialFailure {
                        message: format!("re-key rolled back: {err}"),
                        report: Box::new(report),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }
}

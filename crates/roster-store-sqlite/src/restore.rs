//! Upsert identity (and optionally dependent) rows from a historical snapshot into the
//! live store.
//!
//! Restoring is keyed by primary id, so replaying the same source leaves the live store
//! unchanged.

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use roster_core::{DependentTable, IDENTITY_TABLE};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::backup::{decompress_to_temp, is_compressed, open_read_only, quote_identifier};
use crate::{SnapshotError, SqliteStore};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreScope {
    IdentitiesOnly,
    AllTables,
}

impl RestoreScope {
    #[must_use]
    pub fn tables(self) -> Vec<&'static str> {
        let mut tables = vec![IDENTITY_TABLE];
        if self == Self::AllTables {
            tables.extend(DependentTable::ALL.iter().map(|table| table.table_name()));
        }
        tables
    }
}

/// A prior state of the store that can be written out as a database file.
pub trait RevisionSource {
    fn describe(&self) -> String;

    /// Write the store file as it was at this revision to `dest`.
    ///
    /// # Errors
    /// `NotFound` when the revision or path does not exist.
    fn materialize(&self, dest: &Path) -> Result<(), SnapshotError>;
}

/// Store file committed to a git repository, read with `git show <revision>:<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRevision {
    pub repo: PathBuf,
    pub revision: String,
    pub path_in_repo: String,
}

impl RevisionSource for GitRevision {
    fn describe(&self) -> String {
        format!("{}:{} in {}", self.revision, self.path_in_repo, self.repo.display())
    }

    fn materialize(&self, dest: &Path) -> Result<(), SnapshotError> {
        if !self.repo.is_dir() {
            return Err(SnapshotError::NotFound(format!("repository {}", self.repo.display())));
        }
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .arg("show")
            .arg(format!("{}:{}", self.revision, self.path_in_repo))
            .output()?;
        if !output.status.success() {
            return Err(SnapshotError::NotFound(format!(
                "revision {}: {}",
                self.describe(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        fs::write(dest, &output.stdout)?;
        Ok(())
    }
}

pub enum RestoreSource {
    /// Snapshot file, plain or gzip-compressed.
    File(PathBuf),
    Revision(Box<dyn RevisionSource>),
}

impl RestoreSource {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Revision(revision) => revision.describe(),
        }
    }
}

impl Debug for RestoreSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RestoreSource").field(&self.describe()).finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableRestore {
    pub table: String,
    pub columns: Vec<String>,
    /// Rows upserted, or that would be upserted in a dry run.
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RestoreReport {
    pub source: String,
    pub scope: RestoreScope,
    pub dry_run: bool,
    pub tables: Vec<TableRestore>,
    pub total_rows: u64,
}

struct LiveColumn {
    name: String,
    required: bool,
}

struct StagedTable {
    table: &'static str,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Keeps any temporary file alive while the source connection is in use.
enum Materialized {
    InPlace(PathBuf),
    Temp(tempfile::NamedTempFile),
}

impl Materialized {
    fn path(&self) -> &Path {
        match self {
            Self::InPlace(path) => path,
            Self::Temp(file) => file.path(),
        }
    }
}

fn materialize(source: &RestoreSource) -> Result<Materialized, SnapshotError> {
    match source {
        RestoreSource::File(path) => {
            if !path.is_file() {
                return Err(SnapshotError::NotFound(format!("snapshot {}", path.display())));
            }
            if is_compressed(path) {
                Ok(Materialized::Temp(decompress_to_temp(path)?))
            } else {
                Ok(Materialized::InPlace(path.clone()))
            }
        }
        RestoreSource::Revision(revision) => {
            let temp = tempfile::Builder::new()
                .prefix("roster-revision-")
                .suffix(".sqlite3")
                .tempfile()?;
            revision.materialize(temp.path())?;
            Ok(Materialized::Temp(temp))
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, SnapshotError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn live_columns(conn: &Connection, table: &str) -> Result<Vec<LiveColumn>, SnapshotError> {
    let mut stmt = conn.prepare(
        "SELECT name, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map(params![table], |row| {
            let not_null: bool = row.get(1)?;
            let default: Option<String> = row.get(2)?;
            let pk: i64 = row.get(3)?;
            Ok(LiveColumn { name: row.get(0)?, required: pk > 0 || (not_null && default.is_none()) })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn source_columns(conn: &Connection, table: &str) -> Result<BTreeSet<String>, SnapshotError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(columns)
}

fn stage_table(
    source: &Connection,
    live: &Connection,
    table: &'static str,
) -> Result<StagedTable, SnapshotError> {
    if !table_exists(source, table)? {
        return Err(SnapshotError::NotFound(format!("table {table} in restore source")));
    }
    if !table_exists(live, table)? {
        return Err(SnapshotError::NotFound(format!("table {table} in live store")));
    }

    let available = source_columns(source, table)?;
    let live = live_columns(live, table)?;
    if let Some(missing) =
        live.iter().find(|column| column.required && !available.contains(&column.name))
    {
        return Err(SnapshotError::Validation(format!(
            "restore source table {table} is missing required column {}",
            missing.name
        )));
    }

    let shared = live.iter().filter(|column| available.contains(&column.name)).collect::<Vec<_>>();
    let select = format!(
        "SELECT {} FROM {}",
        shared.iter().map(|column| quote_identifier(&column.name)).collect::<Vec<_>>().join(", "),
        quote_identifier(table)
    );
    let mut stmt = source.prepare(&select)?;
    let width = shared.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width).map(|index| row.get::<_, Value>(index)).collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<Result<Vec<Vec<Value>>, _>>()?;

    for (row_index, row) in rows.iter().enumerate() {
        for (column, value) in shared.iter().zip(row) {
            if column.required && *value == Value::Null {
                return Err(SnapshotError::Validation(format!(
                    "row {} of {table} has no value for required column {}",
                    row_index + 1,
                    column.name
                )));
            }
        }
    }

    Ok(StagedTable {
        table,
        columns: shared.into_iter().map(|column| column.name.clone()).collect(),
        rows,
    })
}

/// Upsert rows from `source` into the live store, one transaction for all tables.
///
/// Every table in `scope` is read and validated before anything is written.
///
/// # Errors
/// `NotFound` when the source or a table is missing, `Validation` when the source lacks
/// a column the live schema requires, and SQLite errors from the upsert (rolled back).
pub fn restore_from_source(
    store: &mut SqliteStore,
    source: &RestoreSource,
    scope: RestoreScope,
    dry_run: bool,
) -> Result<RestoreReport, SnapshotError> {
    let materialized = materialize(source)?;
    let source_conn = open_read_only(materialized.path())?;
    source_conn
        .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|err| {
            SnapshotError::Integrity(format!("restore source {}: {err}", source.describe()))
        })?;

    let live = store.connection_mut();
    let staged = scope
        .tables()
        .into_iter()
        .map(|table| stage_table(&source_conn, &*live, table))
        .collect::<Result<Vec<_>, _>>()?;

    if !dry_run {
        let tx = live.transaction()?;
        for table in &staged {
            let sql = format!(
                "INSERT OR REPLACE INTO {}({}) VALUES ({})",
                quote_identifier(table.table),
                table.columns.iter().map(|column| quote_identifier(column)).collect::<Vec<_>>().join(", "),
                (1..=table.columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
            );
            let mut insert = tx.prepare(&sql)?;
            for row in &table.rows {
                insert.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
    }

    let tables = staged
        .into_iter()
        .map(|table| TableRestore {
            table: table.table.to_string(),
            columns: table.columns,
            rows: table.rows.len() as u64,
        })
        .collect::<Vec<_>>();
    let total_rows = tables.iter().map(|table| table.rows).sum();
    for table in &tables {
        tracing::info!(table = %table.table, rows = table.rows, dry_run, "restored table");
    }

    Ok(RestoreReport { source: source.describe(), scope, dry_run, tables, total_rows })
}

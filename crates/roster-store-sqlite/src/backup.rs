//! Snapshot lifecycle for the store file: create, verify, compress, retention sweep.
//!
//! Every step is sequential and none of them deletes data until the step that replaces
//! it has fully completed.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use roster_core::{SnapshotName, COMPRESSED_EXTENSION};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use time::OffsetDateTime;

use crate::checkpoint_connection;

const PARTIAL_SUFFIX: &str = "partial";
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SnapshotError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Integrity(_) => "integrity",
            Self::Validation(_) => "validation",
            Self::Io(_) => "io",
            Self::Sqlite(_) => "store",
        }
    }
}

/// Result of [`create_snapshot`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub source: PathBuf,
    pub bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableRowCount {
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub path: PathBuf,
    pub table_count: usize,
    pub quick_check: String,
    pub tables: Vec<TableRowCount>,
    pub total_rows: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompressReport {
    pub source: PathBuf,
    pub compressed_path: PathBuf,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    /// `compressed_bytes / original_bytes`; lower is better.
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupEntry {
    pub file_name: String,
    pub bytes: u64,
    pub age_seconds: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dir: PathBuf,
    pub retention_days: u32,
    pub dry_run: bool,
    pub deleted: Vec<CleanupEntry>,
    pub kept: Vec<CleanupEntry>,
    /// Files that do not follow the snapshot naming convention; never touched.
    pub skipped: Vec<String>,
    pub deleted_count: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub name: SnapshotName,
    pub bytes: u64,
}

/// Byte-for-byte copy of `source` to `dest`.
///
/// # Errors
/// `Validation` when `dest` already exists, `Integrity` when the copied size differs
/// from the source size (the partial copy is removed).
pub fn raw_copy(source: &Path, dest: &Path) -> Result<u64, SnapshotError> {
    if !source.exists() {
        return Err(SnapshotError::NotFound(format!("store file {}", source.display())));
    }
    if dest.exists() {
        return Err(SnapshotError::Validation(format!(
            "refusing to overwrite existing file {}",
            dest.display()
        )));
    }

    let copied = fs::copy(source, dest)?;
    let source_bytes = fs::metadata(source)?.len();
    let dest_bytes = fs::metadata(dest)?.len();
    if copied != source_bytes || dest_bytes != source_bytes {
        fs::remove_file(dest)?;
        return Err(SnapshotError::Integrity(format!(
            "snapshot size {dest_bytes} does not match store size {source_bytes}"
        )));
    }
    Ok(copied)
}

/// Checkpoint the store's write-ahead log and copy the main file into `output_dir`.
///
/// # Errors
/// `NotFound` when the store file is missing, `Validation` for a bad prefix or name
/// collision, `Integrity` when the checkpoint is blocked or the copy size differs.
pub fn create_snapshot(
    db_path: &Path,
    output_dir: &Path,
    prefix: &str,
    now: OffsetDateTime,
) -> Result<SnapshotInfo, SnapshotError> {
    if !db_path.is_file() {
        return Err(SnapshotError::NotFound(format!("store file {}", db_path.display())));
    }
    let name = SnapshotName::new(prefix, now)
        .map_err(|err| SnapshotError::Validation(err.to_string()))?;
    fs::create_dir_all(output_dir)?;
    let dest = output_dir.join(name.file_name());

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    checkpoint_connection(&conn).map_err(|err| SnapshotError::Integrity(format!("{err:#}")))?;
    let bytes = raw_copy(db_path, &dest)?;
    drop(conn);

    tracing::info!(source = %db_path.display(), snapshot = %dest.display(), bytes, "created snapshot");
    Ok(SnapshotInfo {
        path: dest,
        file_name: name.file_name(),
        source: db_path.to_path_buf(),
        bytes,
        taken_at: name.taken_at,
    })
}

/// Open a snapshot without touching it: no journal, no `-shm`/`-wal` side files.
pub(crate) fn open_read_only(path: &Path) -> Result<Connection, SnapshotError> {
    if !path.is_file() {
        return Err(SnapshotError::NotFound(format!("snapshot {}", path.display())));
    }
    let uri = format!("file:{}?mode=ro&immutable=1", encode_uri_path(&path.to_string_lossy()));
    Ok(Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

fn encode_uri_path(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => encoded.push_str("%25"),
            '?' => encoded.push_str("%3F"),
            '#' => encoded.push_str("%23"),
            _ => encoded.push(ch),
        }
    }
    encoded
}

pub(crate) fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == COMPRESSED_EXTENSION)
}

/// Decompress a `.gz` snapshot into a temporary file that lives as long as the handle.
pub(crate) fn decompress_to_temp(path: &Path) -> Result<tempfile::NamedTempFile, SnapshotError> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let mut temp = tempfile::Builder::new().prefix("roster-snapshot-").suffix(".sqlite3").tempfile()?;
    io::copy(&mut decoder, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Open a snapshot read-only and check its catalog, page structure and row counts.
///
/// Compressed snapshots are decompressed into a temporary file first.
///
/// # Errors
/// `NotFound` when the file is missing; `Integrity` when it cannot be read as a
/// database, has no tables, or fails `quick_check`.
pub fn verify_snapshot(path: &Path) -> Result<VerifyReport, SnapshotError> {
    if !path.is_file() {
        return Err(SnapshotError::NotFound(format!("snapshot {}", path.display())));
    }
    let unreadable = |err: SnapshotError| match err {
        SnapshotError::NotFound(_) => err,
        other => SnapshotError::Integrity(format!("snapshot {} cannot be read: {other}", path.display())),
    };
    let temp = if is_compressed(path) {
        Some(decompress_to_temp(path).map_err(unreadable)?)
    } else {
        None
    };
    let readable = temp.as_ref().map_or(path, tempfile::NamedTempFile::path);

    let integrity =
        |err: rusqlite::Error| SnapshotError::Integrity(format!("{}: {err}", path.display()));
    let conn = open_read_only(readable).map_err(unreadable)?;

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )
        .map_err(integrity)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(integrity)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(integrity)?;
    if names.is_empty() {
        return Err(SnapshotError::Integrity(format!(
            "snapshot {} contains no tables",
            path.display()
        )));
    }

    let quick_check: String =
        conn.query_row("PRAGMA quick_check", [], |row| row.get(0)).map_err(integrity)?;
    if quick_check != "ok" {
        return Err(SnapshotError::Integrity(format!(
            "snapshot {} failed quick_check: {quick_check}",
            path.display()
        )));
    }

    let mut tables = Vec::with_capacity(names.len());
    let mut total_rows = 0_u64;
    for table in names {
        let rows: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_identifier(&table)), [], |row| {
                row.get(0)
            })
            .map_err(integrity)?;
        let rows = u64::try_from(rows).unwrap_or_default();
        total_rows += rows;
        tables.push(TableRowCount { table, rows });
    }

    tracing::info!(snapshot = %path.display(), tables = tables.len(), total_rows, "verified snapshot");
    Ok(VerifyReport {
        path: path.to_path_buf(),
        table_count: tables.len(),
        quick_check,
        tables,
        total_rows,
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".");
    raw.push(suffix);
    PathBuf::from(raw)
}

fn write_compressed(source: &Path, partial: &Path) -> Result<u64, SnapshotError> {
    let mut input = BufReader::new(File::open(source)?);
    let output = BufWriter::new(File::create(partial)?);
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    let output = encoder.finish()?;
    let file = output.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;

    let mut decoder = GzDecoder::new(BufReader::new(File::open(partial)?));
    Ok(io::copy(&mut decoder, &mut io::sink())?)
}

/// Gzip `path` into `<path>.gz`, then delete `path`.
///
/// The compressed stream is written to `<path>.gz.partial`, synced and read back before
/// it is renamed into place; the original is only removed after the rename.
///
/// # Errors
/// `NotFound` when `path` is missing, `Validation` when it is already compressed or the
/// destination exists, `Integrity` when the read-back length differs.
pub fn compress_snapshot(path: &Path) -> Result<CompressReport, SnapshotError> {
    if !path.is_file() {
        return Err(SnapshotError::NotFound(format!("snapshot {}", path.display())));
    }
    if is_compressed(path) {
        return Err(SnapshotError::Validation(format!(
            "snapshot is already compressed: {}",
            path.display()
        )));
    }
    let dest = with_suffix(path, COMPRESSED_EXTENSION);
    if dest.exists() {
        return Err(SnapshotError::Validation(format!(
            "refusing to overwrite existing file {}",
            dest.display()
        )));
    }
    let partial = with_suffix(&dest, PARTIAL_SUFFIX);
    let original_bytes = fs::metadata(path)?.len();

    let written = match write_compressed(path, &partial) {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
    };
    if written != original_bytes {
        fs::remove_file(&partial)?;
        return Err(SnapshotError::Integrity(format!(
            "compressed snapshot expands to {written} bytes, expected {original_bytes}"
        )));
    }

    fs::rename(&partial, &dest)?;
    fs::remove_file(path)?;
    let compressed_bytes = fs::metadata(&dest)?.len();
    #[allow(clippy::cast_precision_loss)]
    let ratio = if original_bytes == 0 {
        0.0
    } else {
        compressed_bytes as f64 / original_bytes as f64
    };

    tracing::info!(
        snapshot = %dest.display(),
        original_bytes,
        compressed_bytes,
        ratio,
        "compressed snapshot"
    );
    Ok(CompressReport {
        source: path.to_path_buf(),
        compressed_path: dest,
        original_bytes,
        compressed_bytes,
        ratio,
    })
}

/// Expand a `.gz` snapshot into `dest`; returns the number of bytes written.
///
/// # Errors
/// `NotFound` when the archive is missing, `Validation` when `dest` exists, and I/O
/// errors for corrupt archives.
pub fn decompress_snapshot(compressed: &Path, dest: &Path) -> Result<u64, SnapshotError> {
    if !compressed.is_file() {
        return Err(SnapshotError::NotFound(format!("snapshot {}", compressed.display())));
    }
    if dest.exists() {
        return Err(SnapshotError::Validation(format!(
            "refusing to overwrite existing file {}",
            dest.display()
        )));
    }

    let mut decoder = GzDecoder::new(BufReader::new(File::open(compressed)?));
    let mut output = BufWriter::new(File::create(dest)?);
    let written = match io::copy(&mut decoder, &mut output) {
        Ok(written) => written,
        Err(err) => {
            drop(output);
            let _ = fs::remove_file(dest);
            return Err(err.into());
        }
    };
    output.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()?;
    Ok(written)
}

/// Snapshots in `dir` for `prefix`, oldest first.
///
/// # Errors
/// `NotFound` when `dir` does not exist.
pub fn list_snapshots(dir: &Path, prefix: &str) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    if !dir.is_dir() {
        return Err(SnapshotError::NotFound(format!("snapshot directory {}", dir.display())));
    }
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(name) = SnapshotName::parse(prefix, &file_name) {
            snapshots.push(SnapshotEntry { path: entry.path(), name, bytes: entry.metadata()?.len() });
        }
    }
    snapshots.sort_by(|a, b| {
        a.name.taken_at.cmp(&b.name.taken_at).then(a.name.compressed.cmp(&b.name.compressed))
    });
    Ok(snapshots)
}

/// Delete snapshots in `dir` whose modification time is older than `retention_days`.
///
/// Only files that parse as snapshot names for `prefix` are considered; anything else
/// lands in `skipped` whatever its age.
///
/// # Errors
/// `NotFound` when `dir` does not exist; I/O errors from listing or deleting.
pub fn cleanup_snapshots(
    dir: &Path,
    prefix: &str,
    retention_days: u32,
    now: OffsetDateTime,
    dry_run: bool,
) -> Result<CleanupReport, SnapshotError> {
    if !dir.is_dir() {
        return Err(SnapshotError::NotFound(format!("snapshot directory {}", dir.display())));
    }
    let horizon = u64::from(retention_days) * SECONDS_PER_DAY;

    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    let mut report = CleanupReport {
        dir: dir.to_path_buf(),
        retention_days,
        dry_run,
        deleted: Vec::new(),
        kept: Vec::new(),
        skipped: Vec::new(),
        deleted_count: 0,
        freed_bytes: 0,
    };

    for entry in entries {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_file() || SnapshotName::parse(prefix, &file_name).is_none() {
            report.skipped.push(file_name);
            continue;
        }

        let metadata = entry.metadata()?;
        let modified = OffsetDateTime::from(metadata.modified()?);
        let age_seconds = u64::try_from((now - modified).whole_seconds()).unwrap_or(0);
        let item = CleanupEntry { file_name, bytes: metadata.len(), age_seconds };

        if age_seconds > horizon {
            if !dry_run {
                fs::remove_file(entry.path())?;
            }
            tracing::info!(snapshot = %item.file_name, age_seconds, dry_run, "expired snapshot");
            report.freed_bytes += item.bytes;
            report.deleted.push(item);
        } else {
            report.kept.push(item);
        }
    }
    report.deleted_count = report.deleted.len();
    Ok(report)
}

//! Snapshot file naming: `<prefix>_<YYYY-MM-DD>T<HH-MM-SS-mmm>Z.sqlite3[.gz]`.
//!
//! Retention and discovery only ever act on names this module parses.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::ReconcileError;

pub const SNAPSHOT_EXTENSION: &str = "sqlite3";
pub const COMPRESSED_EXTENSION: &str = "gz";
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "roster";

const TIMESTAMP_LEN: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotName {
    pub prefix: String,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub compressed: bool,
}

impl SnapshotName {
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the prefix is empty or contains a path
    /// separator.
    pub fn new(prefix: &str, taken_at: OffsetDateTime) -> Result<Self, ReconcileError> {
        validate_prefix(prefix)?;
        Ok(Self {
            prefix: prefix.to_string(),
            taken_at: truncate_to_millis(taken_at.to_offset(UtcOffset::UTC)),
            compressed: false,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        let base = format!(
            "{}_{}.{SNAPSHOT_EXTENSION}",
            self.prefix,
            format_timestamp(self.taken_at)
        );
        if self.compressed {
            format!("{base}.{COMPRESSED_EXTENSION}")
        } else {
            base
        }
    }

    #[must_use]
    pub fn with_compression(&self) -> Self {
        Self { compressed: true, ..self.clone() }
    }

    /// Parse a file name that follows the convention for `prefix`.
    #[must_use]
    pub fn parse(prefix: &str, file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
        let (rest, compressed) = match rest.strip_suffix(&format!(".{COMPRESSED_EXTENSION}")) {
            Some(stripped) => (stripped, true),
            None => (rest, false),
        };
        let stamp = rest.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}"))?;
        let taken_at = parse_timestamp(stamp)?;
        Some(Self { prefix: prefix.to_string(), taken_at, compressed })
    }
}

impl Display for SnapshotName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name())
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ReconcileError> {
    if prefix.is_empty() {
        return Err(ReconcileError::Validation("snapshot prefix must not be empty".to_string()));
    }
    if prefix.contains(['/', '\\']) {
        return Err(ReconcileError::Validation(format!(
            "snapshot prefix must not contain path separators: {prefix}"
        )));
    }
    Ok(())
}

fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond() - value.nanosecond() % 1_000_000;
    value.replace_nanosecond(nanos).unwrap_or(value)
}

fn format_timestamp(value: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}-{:02}-{:02}-{:03}Z",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second(),
        value.millisecond()
    )
}

fn digits<T: std::str::FromStr>(raw: &str, start: usize, len: usize) -> Option<T> {
    let field = raw.get(start..start + len)?;
    if !field.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if raw.len() != TIMESTAMP_LEN {
        return None;
    }
    let bytes = raw.as_bytes();
    for (position, expected) in
        [(4, b'-'), (7, b'-'), (10, b'T'), (13, b'-'), (16, b'-'), (19, b'-'), (23, b'Z')]
    {
        if bytes[position] != expected {
            return None;
        }
    }

    let year: i32 = digits(raw, 0, 4)?;
    let month: u8 = digits(raw, 5, 2)?;
    let day: u8 = digits(raw, 8, 2)?;
    let hour: u8 = digits(raw, 11, 2)?;
    let minute: u8 = digits(raw, 14, 2)?;
    let second: u8 = digits(raw, 17, 2)?;
    let millis: u16 = digits(raw, 20, 3)?;

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms_milli(hour, minute, second, millis).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(unix_millis: i64) -> Result<OffsetDateTime, ReconcileError> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(unix_millis) * 1_000_000)
            .map_err(|err| ReconcileError::Validation(err.to_string()))
    }

    #[test]
    fn file_name_uses_filesystem_safe_timestamp() -> Result<(), ReconcileError> {
        let name = SnapshotName::new("roster", at(1_760_796_202_123)?)?;
        assert_eq!(name.file_name(), "roster_2025-10-18T14-03-22-123Z.sqlite3");
        assert_eq!(name.with_compression().file_name(), "roster_2025-10-18T14-03-22-123Z.sqlite3.gz");
        Ok(())
    }

    #[test]
    fn parse_accepts_both_plain_and_compressed_names() -> Result<(), ReconcileError> {
        let name = SnapshotName::new("roster", at(1_760_796_202_123)?)?;
        assert_eq!(SnapshotName::parse("roster", &name.file_name()), Some(name.clone()));
        let compressed = name.with_compression();
        assert_eq!(SnapshotName::parse("roster", &compressed.file_name()), Some(compressed));
        Ok(())
    }

    #[test]
    fn parse_rejects_foreign_and_malformed_names() {
        for candidate in [
            "notes.txt",
            "roster.sqlite3",
            "other_2025-10-18T14-03-22-123Z.sqlite3",
            "roster_2025-10-18T14:03:22.123Z.sqlite3",
            "roster_2025-13-18T14-03-22-123Z.sqlite3",
            "roster_2025-10-18T14-03-22-123Z.db",
            "roster_2025-10-18T14-03-22-123Z.sqlite3.gz.partial",
            "roster_extra_2025-10-18T14-03-22-123Z.sqlite3",
        ] {
            assert_eq!(SnapshotName::parse("roster", candidate), None, "{candidate}");
        }
    }

    #[test]
    fn prefix_must_be_a_plain_file_name_fragment() {
        assert!(SnapshotName::new("", OffsetDateTime::UNIX_EPOCH).is_err());
        assert!(SnapshotName::new("../roster", OffsetDateTime::UNIX_EPOCH).is_err());
    }
}

mod config;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_core::{
    find_duplicates, merge_identities, migrate_identity, IdentityId, IdentityOverrides,
    MergeRequest, MigrationRequest, ReconcileError, ReconcileReport, ResolverOptions,
    SnapshotName, StoreAccessor,
};
use roster_remote::{RemoteConfig, RemoteStore};
use roster_store_sqlite::{
    cleanup_snapshots, compress_snapshot, create_snapshot, list_snapshots, restore_from_source,
    verify_snapshot, GitRevision, RestoreScope, RestoreSource, SnapshotError, SqliteStore,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use crate::config::{RosterConfig, DEFAULT_DB_PATH, DEFAULT_RETENTION_DAYS};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "roster")]
#[command(about = "Identity reconciliation and backup tooling for the expense store")]
struct Cli {
    /// Store file for direct mode and backups [default: ./roster.sqlite3]
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// YAML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the remote entity API; switches reconciliation to remote mode.
    #[arg(long, global = true)]
    remote_url: Option<String>,

    #[arg(long, global = true, env = "ROSTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Log filter, e.g. `debug` or `roster_remote=debug` [default: $RUST_LOG or info]
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report identities that look like duplicates, with dependent row counts.
    CheckDuplicates(CheckDuplicatesArgs),
    /// Fold one identity into another.
    Merge(MergeArgs),
    /// Rotate an identity to a new id.
    MigrateId(MigrateIdArgs),
    /// Snapshot the store file, then optionally verify, compress and sweep old snapshots.
    Backup(BackupArgs),
    /// Delete snapshots older than the retention window.
    Cleanup(CleanupArgs),
    /// List snapshots in the output directory.
    Snapshots(SnapshotsArgs),
    /// Check a snapshot file.
    Verify(VerifyArgs),
    /// Upsert rows from a snapshot file or a historical revision into the store.
    Restore(RestoreArgs),
}

#[derive(Debug, Args)]
struct CheckDuplicatesArgs {
    /// Only consider identities whose name or email contains this text.
    #[arg(long)]
    search: Option<String>,
    /// Also group identities that share an email address.
    #[arg(long, default_value_t = false)]
    match_email: bool,
    #[arg(long, default_value_t = false)]
    exclude_archived: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Identity to fold away; deleted after its rows move.
    #[arg(long)]
    source: String,
    /// Identity that keeps all rows.
    #[arg(long)]
    target: String,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct MigrateIdArgs {
    #[arg(long)]
    old: String,
    #[arg(long)]
    new: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long, default_value_t = false)]
    verify: bool,
    #[arg(long, default_value_t = false)]
    compress: bool,
    /// Sweep snapshots older than this many days after the backup.
    #[arg(long)]
    retention: Option<u32>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long)]
    retention: Option<u32>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct SnapshotsArgs {
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    prefix: Option<String>,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    path: PathBuf,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Snapshot file to restore from (plain or .gz).
    #[arg(long, conflicts_with = "revision", required_unless_present = "revision")]
    from_file: Option<PathBuf>,
    /// Git revision holding the historical store file.
    #[arg(long, requires_all = ["repo", "path_in_repo"])]
    revision: Option<String>,
    #[arg(long)]
    repo: Option<PathBuf>,
    #[arg(long)]
    path_in_repo: Option<String>,
    /// Restore only the identity table.
    #[arg(long, default_value_t = false)]
    identities_only: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Flags layered over the config file.
struct Settings {
    db: PathBuf,
    snapshot_prefix: String,
    output_dir: PathBuf,
    retention_days: Option<u32>,
    remote: RemoteConfig,
}

impl Settings {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config = RosterConfig::load(cli.config.as_deref())?;
        let mut remote = config.remote;
        if let Some(url) = &cli.remote_url {
            remote.base_url = Some(url.clone());
        }
        if let Some(key) = &cli.api_key {
            remote.api_key = Some(key.clone());
        }
        remote.base_url = remote.base_url.filter(|url| !url.trim().is_empty());

        Ok(Self {
            db: cli
                .db
                .clone()
                .or(config.db_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            snapshot_prefix: config.snapshot_prefix,
            output_dir: config.output_dir,
            retention_days: config.retention_days,
            remote,
        })
    }

    fn open_accessor(&self) -> Result<Box<dyn StoreAccessor>> {
        if self.remote.base_url.is_some() {
            Ok(Box::new(RemoteStore::from_config(&self.remote)?))
        } else {
            Ok(Box::new(SqliteStore::open_existing(&self.db)?))
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn status(dry_run: bool) -> &'static str {
    if dry_run {
        "dry_run"
    } else {
        "ok"
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return usage_exit(&err),
    };
    init_tracing(cli.log_level.as_deref());
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            if let Err(print_err) = emit_json(failure_payload(&err)) {
                eprintln!("failed to print error report: {print_err}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Help and version output succeed; every other parse error is a fatal error.
fn usage_exit(err: &clap::Error) -> ExitCode {
    let _ = err.print();
    if err.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn failure_payload(err: &anyhow::Error) -> Value {
    let (kind, report) = if let Some(reconcile) = err.downcast_ref::<ReconcileError>() {
        let report = reconcile.report().and_then(|report| serde_json::to_value(report).ok());
        (reconcile.kind(), report)
    } else if let Some(snapshot) = err.downcast_ref::<SnapshotError>() {
        (snapshot.kind(), None)
    } else {
        ("error", None)
    };

    let mut payload = json!({
        "status": "failed",
        "error": {
            "kind": kind,
            "message": format!("{err:#}"),
        },
    });
    if let (Some(report), Value::Object(object)) = (report, &mut payload) {
        object.insert("report".to_string(), report);
    }
    payload
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(&cli)?;
    match cli.command {
        Command::CheckDuplicates(args) => run_check_duplicates(&args, &settings),
        Command::Merge(args) => run_merge(&args, &settings),
        Command::MigrateId(args) => run_migrate_id(&args, &settings),
        Command::Backup(args) => run_backup(&args, &settings),
        Command::Cleanup(args) => run_cleanup(&args, &settings),
        Command::Snapshots(args) => run_snapshots(&args, &settings),
        Command::Verify(args) => run_verify(&args),
        Command::Restore(args) => run_restore(&args, &settings),
    }
}

fn run_check_duplicates(args: &CheckDuplicatesArgs, settings: &Settings) -> Result<()> {
    let store = settings.open_accessor()?;
    let options = ResolverOptions {
        search: args.search.clone(),
        match_email: args.match_email,
        include_archived: !args.exclude_archived,
    };
    let report = find_duplicates(store.as_ref(), &options)?;
    emit_json(json!({
        "status": "ok",
        "mode": store.mode(),
        "summary": format!(
            "{} duplicate groups among {} identities",
            report.groups.len(),
            report.scanned
        ),
        "report": report,
    }))
}

fn reconcile_summary(verb: &str, report: &ReconcileReport) -> String {
    let rows = report.planned.total();
    if report.dry_run {
        format!("would {verb} {} into {}, moving {rows} rows", report.from, report.to)
    } else {
        format!("{verb}d {} into {}, moved {rows} rows", report.from, report.to)
    }
}

fn emit_reconcile(verb: &str, report: &ReconcileReport) -> Result<()> {
    emit_json(json!({
        "status": status(report.dry_run),
        "summary": reconcile_summary(verb, report),
        "report": serde_json::to_value(report).context("failed to serialize reconcile report")?,
    }))
}

fn run_merge(args: &MergeArgs, settings: &Settings) -> Result<()> {
    let request = MergeRequest {
        source: IdentityId::parse(&args.source)?,
        target: IdentityId::parse(&args.target)?,
        dry_run: args.dry_run,
    };
    let mut store = settings.open_accessor()?;
    let report = merge_identities(store.as_mut(), &request)?;
    emit_reconcile("merge", &report)
}

fn run_migrate_id(args: &MigrateIdArgs, settings: &Settings) -> Result<()> {
    let request = MigrationRequest {
        old_id: IdentityId::parse(&args.old)?,
        new_id: IdentityId::parse(&args.new)?,
        overrides: IdentityOverrides {
            name: args.name.clone(),
            email: args.email.clone(),
            role: args.role.clone(),
        },
        dry_run: args.dry_run,
        now: OffsetDateTime::now_utc(),
    };
    let mut store = settings.open_accessor()?;
    let report = migrate_identity(store.as_mut(), &request)?;
    emit_reconcile("migrate", &report)
}

fn run_backup(args: &BackupArgs, settings: &Settings) -> Result<()> {
    let prefix = args.prefix.as_deref().unwrap_or(&settings.snapshot_prefix);
    let output_dir = args.output_dir.as_ref().unwrap_or(&settings.output_dir);
    let retention = args.retention.or(settings.retention_days);
    let now = OffsetDateTime::now_utc();

    if args.dry_run {
        if !settings.db.is_file() {
            return Err(SnapshotError::NotFound(format!("store file {}", settings.db.display())).into());
        }
        let name = SnapshotName::new(prefix, now)?;
        let bytes = fs::metadata(&settings.db)
            .with_context(|| format!("failed to stat {}", settings.db.display()))?
            .len();
        let cleanup = match retention {
            Some(days) if output_dir.is_dir() => {
                Some(cleanup_snapshots(output_dir, prefix, days, now, true)?)
            }
            _ => None,
        };
        return emit_json(json!({
            "status": "dry_run",
            "summary": format!("would create snapshot {} ({bytes} bytes)", name.file_name()),
            "snapshot": {
                "path": output_dir.join(name.file_name()),
                "bytes": bytes,
            },
            "verify": args.verify,
            "compress": args.compress,
            "cleanup": cleanup,
        }));
    }

    let snapshot = create_snapshot(&settings.db, output_dir, prefix, now)?;
    let verification = if args.verify { Some(verify_snapshot(&snapshot.path)?) } else { None };
    let compression = if args.compress { Some(compress_snapshot(&snapshot.path)?) } else { None };
    let cleanup = retention
        .map(|days| cleanup_snapshots(output_dir, prefix, days, now, false))
        .transpose()?;

    let final_path =
        compression.as_ref().map_or(&snapshot.path, |compressed| &compressed.compressed_path);
    emit_json(json!({
        "status": "ok",
        "summary": format!("created snapshot {}", final_path.display()),
        "snapshot": snapshot,
        "path": final_path,
        "verification": verification,
        "compression": compression,
        "cleanup": cleanup,
    }))
}

fn run_cleanup(args: &CleanupArgs, settings: &Settings) -> Result<()> {
    let prefix = args.prefix.as_deref().unwrap_or(&settings.snapshot_prefix);
    let output_dir = args.output_dir.as_ref().unwrap_or(&settings.output_dir);
    let days = args.retention.or(settings.retention_days).unwrap_or(DEFAULT_RETENTION_DAYS);

    let report = cleanup_snapshots(output_dir, prefix, days, OffsetDateTime::now_utc(), args.dry_run)?;
    let verb = if args.dry_run { "would delete" } else { "deleted" };
    emit_json(json!({
        "status": status(args.dry_run),
        "summary": format!(
            "{verb} {} snapshots older than {days} days ({} bytes)",
            report.deleted_count,
            report.freed_bytes
        ),
        "report": report,
    }))
}

fn run_snapshots(args: &SnapshotsArgs, settings: &Settings) -> Result<()> {
    let prefix = args.prefix.as_deref().unwrap_or(&settings.snapshot_prefix);
    let output_dir = args.output_dir.as_ref().unwrap_or(&settings.output_dir);
    let snapshots = list_snapshots(output_dir, prefix)?;
    emit_json(json!({
        "status": "ok",
        "count": snapshots.len(),
        "snapshots": snapshots,
    }))
}

fn run_verify(args: &VerifyArgs) -> Result<()> {
    let report = verify_snapshot(&args.path)?;
    emit_json(json!({
        "status": "ok",
        "summary": format!("{} tables, {} rows", report.table_count, report.total_rows),
        "report": report,
    }))
}

fn run_restore(args: &RestoreArgs, settings: &Settings) -> Result<()> {
    let source = match (&args.from_file, &args.revision) {
        (Some(path), _) => RestoreSource::File(path.clone()),
        (None, Some(revision)) => RestoreSource::Revision(Box::new(GitRevision {
            repo: args.repo.clone().context("--revision requires --repo")?,
            revision: revision.clone(),
            path_in_repo: args.path_in_repo.clone().context("--revision requires --path-in-repo")?,
        })),
        (None, None) => anyhow::bail!("either --from-file or --revision is required"),
    };
    let scope =
        if args.identities_only { RestoreScope::IdentitiesOnly } else { RestoreScope::AllTables };

    let mut store = SqliteStore::open_existing(&settings.db)?;
    let report = restore_from_source(&mut store, &source, scope, args.dry_run)?;
    let verb = if args.dry_run { "would upsert" } else { "upserted" };
    emit_json(json!({
        "status": status(args.dry_run),
        "summary": format!("{verb} {} rows from {}", report.total_rows, report.source),
        "report": report,
    }))
}

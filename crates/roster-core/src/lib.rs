//! Identity reconciliation for the expense and mileage store.
//!
//! Duplicate detection, merges and id migrations run against any [`StoreAccessor`],
//! either the local store file or the remote entity API.

pub mod accessor;
mod error;
pub mod model;
pub mod reconcile;
pub mod resolver;
pub mod retry;
pub mod snapshot;

pub use accessor::{AccessMode, RekeyPlan, RekeyReport, RowFailure, StoreAccessor, TableRekey};
pub use error::ReconcileError;
pub use model::{
    DependentRow, DependentTable, IdentityId, IdentityRecord, TableCounts, FOREIGN_KEY_COLUMN,
    IDENTITY_ENTITY, IDENTITY_TABLE,
};
pub use reconcile::{
    merge_identities, migrate_identity, verify_conservation, IdentityOverrides, MergeRequest,
    MigrationRequest, ReconcileOperation, ReconcileReport,
};
pub use resolver::{
    find_duplicates, group_duplicates, DuplicateCandidate, DuplicateGroup, DuplicateReport,
    MatchReason, ResolverOptions,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use snapshot::{SnapshotName, COMPRESSED_EXTENSION, DEFAULT_SNAPSHOT_PREFIX, SNAPSHOT_EXTENSION};

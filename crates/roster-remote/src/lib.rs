//! Remote mode: a [`StoreAccessor`] over the per-entity HTTP API.
//!
//! The API has no transactions. Re-keys are a sequence of per-row updates, each retried
//! with backoff; failures are collected per row and reported, and the source identity is
//! kept until every row has moved.

mod transport;

use roster_core::{
    retry_with_backoff, AccessMode, DependentRow, DependentTable, IdentityId, IdentityRecord,
    ReconcileError, RekeyPlan, RekeyReport, RetryPolicy, RowFailure, StoreAccessor, TableRekey,
    IDENTITY_ENTITY,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

pub use transport::{EntityTransport, RemoteConfig, TransportError, UreqTransport};

const FOREIGN_KEY_FIELD: &str = "employeeId";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIdentity {
    id: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    archived: bool,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

fn default_role() -> String {
    "employee".to_string()
}

impl WireIdentity {
    fn from_record(record: &IdentityRecord) -> Self {
        Self {
            id: record.id.as_str().to_string(),
            name: record.name.clone(),
            email: record.email.clone(),
            role: record.role.clone(),
            archived: record.archived,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self) -> Result<IdentityRecord, ReconcileError> {
        Ok(IdentityRecord {
            id: IdentityId::parse(&self.id)?,
            name: self.name,
            email: self.email,
            role: self.role,
            archived: self.archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn decode_identity(value: Value) -> Result<IdentityRecord, ReconcileError> {
    serde_json::from_value::<WireIdentity>(value)
        .map_err(|err| ReconcileError::Network(format!("malformed {IDENTITY_ENTITY} entity: {err}")))?
        .into_record()
}

fn field_as_string(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn to_reconcile_error(context: &str, err: &TransportError) -> ReconcileError {
    match err {
        TransportError::Status { code: 404, .. } => ReconcileError::NotFound(format!("{context}: {err}")),
        TransportError::Status { code: 400 | 409 | 422, .. } => {
            ReconcileError::Validation(format!("{context}: {err}"))
        }
        _ => ReconcileError::Network(format!("{context}: {err}")),
    }
}

/// Store accessor backed by an [`EntityTransport`].
pub struct RemoteStore<T> {
    transport: T,
    retry: RetryPolicy,
}

impl RemoteStore<UreqTransport> {
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when no base URL is configured.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, ReconcileError> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ReconcileError::Validation("remote base_url is not configured".into()))?;
        let transport = UreqTransport::new(base_url, config.api_key.clone(), config.timeout_secs);
        Ok(Self::new(transport, config.retry))
    }
}

impl<T: EntityTransport> RemoteStore<T> {
    pub fn new(transport: T, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn call<R>(
        &self,
        label: &str,
        op: impl FnMut() -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        retry_with_backoff(&self.retry, label, op, TransportError::is_retryable)
    }

    /// Move every row of `table` from `from` to `to`, one update per row.
    ///
    /// Listing failures are returned as errors; per-row failures are recorded in the
    /// returned [`TableRekey`].
    fn rekey_table(
        &self,
        table: DependentTable,
        from: &IdentityId,
        to: &IdentityId,
    ) -> Result<TableRekey, ReconcileError> {
        let rows = self.list_dependents(table, from)?;
        let body = json!({ FOREIGN_KEY_FIELD: to.as_str() });
        let entity = table.entity_name();

        let outcomes = rows
            .iter()
            .map(|row| {
                tracing::debug!(entity, row = %row.id, from = %from, to = %to, "updating row");
                let result = self.call("update", || self.transport.update(entity, &row.id, &body));
                (row.id.clone(), result)
            })
            .collect::<Vec<_>>();

        let mut rekey = TableRekey::counted(table, rows.len() as u64, 0);
        for (row_id, result) in outcomes {
            match result {
                Ok(_) => rekey.moved_rows.push(row_id),
                Err(err) => {
                    tracing::warn!(entity, row = %row_id, error = %err, "row re-key failed");
                    rekey.failed_rows.push(RowFailure { row_id, error: err.to_string() });
                }
            }
        }
        rekey.moved = rekey.moved_rows.len() as u64;
        tracing::info!(
            %table,
            from = %from,
            to = %to,
            moved = rekey.moved,
            failed = rekey.failed_rows.len(),
            "re-keyed table"
        );
        Ok(rekey)
    }
}

/// Server-assigned timestamps are not compared.
fn same_attributes(stored: &IdentityRecord, expected: &IdentityRecord) -> bool {
    stored.id == expected.id
        && stored.name == expected.name
        && stored.email == expected.email
        && stored.role == expected.role
        && stored.archived == expected.archived
}

fn partial_failure(message: String, report: RekeyReport) -> ReconcileError {
    ReconcileError::PartialFailure { message, report: Box::new(report) }
}

impl<T: EntityTransport> StoreAccessor for RemoteStore<T> {
    fn mode(&self) -> AccessMode {
        AccessMode::Remote
    }

    fn list_identities(&self) -> Result<Vec<IdentityRecord>, ReconcileError> {
        let values = self
            .call("list", || self.transport.list(IDENTITY_ENTITY, &[]))
            .map_err(|err| to_reconcile_error("list identities", &err))?;
        let mut identities = values.into_iter().map(decode_identity).collect::<Result<Vec<_>, _>>()?;
        identities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(identities)
    }

    fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, ReconcileError> {
        self.call("get", || self.transport.get(IDENTITY_ENTITY, id.as_str()))
            .map_err(|err| to_reconcile_error("get identity", &err))?
            .map(decode_identity)
            .transpose()
    }

    fn list_dependents(
        &self,
        table: DependentTable,
        employee_id: &IdentityId,
    ) -> Result<Vec<DependentRow>, ReconcileError> {
        let entity = table.entity_name();
        let values = self
            .call("list", || {
                self.transport.list(entity, &[(FOREIGN_KEY_FIELD, employee_id.as_str())])
            })
            .map_err(|err| to_reconcile_error(&format!("list {entity}"), &err))?;

        let mut rows = Vec::with_capacity(values.len());
        for value in values {
            // Some deployments ignore unknown filters; only keep rows that really match.
            if field_as_string(&value, FOREIGN_KEY_FIELD).as_deref() != Some(employee_id.as_str()) {
                continue;
            }
            let id = field_as_string(&value, "id").ok_or_else(|| {
                ReconcileError::Network(format!("{entity} entity without an id: {value}"))
            })?;
            rows.push(DependentRow { id, employee_id: employee_id.clone() });
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    fn insert_identity(&mut self, record: &IdentityRecord) -> Result<(), ReconcileError> {
        let body = serde_json::to_value(WireIdentity::from_record(record))
            .map_err(|err| ReconcileError::Validation(format!("unencodable identity: {err}")))?;
        // A conflict on a retry usually means the earlier create landed and only its
        // response was lost.
        let mut attempt = 0_u32;
        let conflicted_on_retry = self
            .call("create", || {
                attempt += 1;
                match self.transport.create(IDENTITY_ENTITY, &body) {
                    Ok(_) => Ok(false),
                    Err(err) if attempt > 1 && err.is_conflict() => Ok(true),
                    Err(err) => Err(err),
                }
            })
            .map_err(|err| to_reconcile_error("create identity", &err))?;

        if conflicted_on_retry {
            let stored = self.get_identity(&record.id)?;
            if !stored.as_ref().is_some_and(|stored| same_attributes(stored, record)) {
                return Err(ReconcileError::Validation(format!(
                    "identity {} already exists with different attributes",
                    record.id
                )));
            }
            tracing::info!(id = %record.id, "create response lost; identity already stored");
        }
        tracing::info!(id = %record.id, "created identity");
        Ok(())
    }

    fn delete_identity(&mut self, id: &IdentityId) -> Result<(), ReconcileError> {
        let mut attempt = 0_u32;
        self.call("delete", || {
            attempt += 1;
            match self.transport.delete(IDENTITY_ENTITY, id.as_str()) {
                Err(err) if attempt > 1 && err.is_not_found() => {
                    tracing::info!(%id, "delete response lost; identity already gone");
                    Ok(())
                }
                other => other,
            }
        })
        .map_err(|err| to_reconcile_error(&format!("delete identity {id}"), &err))?;
        tracing::info!(%id, "deleted identity");
        Ok(())
    }

    fn bulk_update_foreign_key(
        &mut self,
        table: DependentTable,
        old: &IdentityId,
        new: &IdentityId,
    ) -> Result<u64, ReconcileError> {
        let rekey = self.rekey_table(table, old, new)?;
        if rekey.failed_rows.is_empty() {
            return Ok(rekey.moved);
        }
        let mut report = RekeyReport::new(AccessMode::Remote, &RekeyPlan::merge(old.clone(), new.clone()));
        let failed = rekey.failed_rows.len();
        report.tables.push(rekey);
        Err(partial_failure(format!("{failed} {table} rows could not be re-keyed"), report))
    }

    fn apply_rekey(&mut self, plan: &RekeyPlan) -> Result<RekeyReport, ReconcileError> {
        let mut report = RekeyReport::new(AccessMode::Remote, plan);

        match &plan.create_target {
            Some(record) => {
                self.insert_identity(record)?;
                report.target_created = true;
            }
            None => {
                if self.get_identity(&plan.to)?.is_none() {
                    return Err(ReconcileError::NotFound(format!("target identity {}", plan.to)));
                }
            }
        }

        for table in plan.tables() {
            match self.rekey_table(table, &plan.from, &plan.to) {
                Ok(rekey) => report.tables.push(rekey),
                Err(err)
                    if report.target_created
                        || report.moved_counts().total() > 0
                        || report.failed_rows() > 0 =>
                {
                    return Err(partial_failure(
                        format!("re-key stopped at {table}: {err}"),
                        report,
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        let failed = report.failed_rows();
        if failed > 0 {
            return Err(partial_failure(
                format!("{failed} rows could not be re-keyed; identity {} was kept", plan.from),
                report,
            ));
        }

        if let Err(err) = self.delete_identity(&plan.from) {
            return Err(partial_failure(
                format!("all rows moved but identity {} could not be deleted: {err}", plan.from),
                report,
            ));
        }
        report.source_deleted = true;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};

    use roster_core::{merge_identities, migrate_identity, IdentityOverrides, MergeRequest, MigrationRequest};

    use super::*;

    /// How a scripted create or delete call goes wrong.
    enum Scripted {
        /// Fails before the server applies anything.
        Fail(TransportError),
        /// The server applies the call, then the response is lost.
        LoseResponse(TransportError),
    }

    /// In-memory entity API with scripted failures.
    #[derive(Default)]
    struct FakeApi {
        entities: RefCell<BTreeMap<String, Vec<Value>>>,
        update_failures: RefCell<BTreeMap<String, VecDeque<TransportError>>>,
        list_failures: RefCell<BTreeMap<String, VecDeque<TransportError>>>,
        scripted: RefCell<BTreeMap<&'static str, VecDeque<Scripted>>>,
        update_calls: RefCell<u32>,
    }

    impl FakeApi {
        fn seed(&self, entity: &str, value: Value) {
            self.entities.borrow_mut().entry(entity.to_string()).or_default().push(value);
        }

        fn fail_updates(&self, row_id: &str, errors: Vec<TransportError>) {
            self.update_failures.borrow_mut().insert(row_id.to_string(), errors.into());
        }

        fn fail_lists(&self, entity: &str, errors: Vec<TransportError>) {
            self.list_failures.borrow_mut().insert(entity.to_string(), errors.into());
        }

        fn script(&self, call: &'static str, outcomes: Vec<Scripted>) {
            self.scripted.borrow_mut().insert(call, outcomes.into());
        }

        fn next_scripted(&self, call: &'static str) -> Option<Scripted> {
            self.scripted.borrow_mut().get_mut(call).and_then(VecDeque::pop_front)
        }

        fn ids(&self, entity: &str) -> Vec<String> {
            self.entities
                .borrow()
                .get(entity)
                .map(|rows| rows.iter().filter_map(|row| field_as_string(row, "id")).collect())
                .unwrap_or_default()
        }

        fn owners(&self, entity: &str) -> Vec<(String, String)> {
            self.entities
                .borrow()
                .get(entity)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            Some((field_as_string(row, "id")?, field_as_string(row, FOREIGN_KEY_FIELD)?))
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    fn not_found() -> TransportError {
        TransportError::Status { code: 404, body: "not found".into() }
    }

    impl EntityTransport for &FakeApi {
        fn list(&self, entity: &str, filter: &[(&str, &str)]) -> Result<Vec<Value>, TransportError> {
            if let Some(err) = self.list_failures.borrow_mut().get_mut(entity).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            let entities = self.entities.borrow();
            let rows = entities.get(entity).cloned().unwrap_or_default();
            Ok(rows
                .into_iter()
                .filter(|row| {
                    filter.iter().all(|(key, value)| field_as_string(row, key).as_deref() == Some(*value))
                })
                .collect())
        }

        fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, TransportError> {
            let entities = self.entities.borrow();
            Ok(entities
                .get(entity)
                .and_then(|rows| rows.iter().find(|row| field_as_string(row, "id").as_deref() == Some(id)))
                .cloned())
        }

        fn create(&self, entity: &str, body: &Value) -> Result<Value, TransportError> {
            let lost = match self.next_scripted("create") {
                Some(Scripted::Fail(err)) => return Err(err),
                Some(Scripted::LoseResponse(err)) => Some(err),
                None => None,
            };
            let id = field_as_string(body, "id").unwrap_or_default();
            if self.ids(entity).contains(&id) {
                return Err(TransportError::Status { code: 409, body: format!("{id} exists") });
            }
            self.seed(entity, body.clone());
            match lost {
                Some(err) => Err(err),
                None => Ok(body.clone()),
            }
        }

        fn update(&self, entity: &str, id: &str, body: &Value) -> Result<Value, TransportError> {
            *self.update_calls.borrow_mut() += 1;
            if let Some(err) = self.update_failures.borrow_mut().get_mut(id).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            let mut entities = self.entities.borrow_mut();
            let row = entities
                .get_mut(entity)
                .and_then(|rows| rows.iter_mut().find(|row| field_as_string(row, "id").as_deref() == Some(id)))
                .ok_or_else(not_found)?;
            if let (Value::Object(target), Value::Object(patch)) = (row, body) {
                for (key, value) in patch {
                    target.insert(key.clone(), value.clone());
                }
            }
            Ok(body.clone())
        }

        fn delete(&self, entity: &str, id: &str) -> Result<(), TransportError> {
            let lost = match self.next_scripted("delete") {
                Some(Scripted::Fail(err)) => return Err(err),
                Some(Scripted::LoseResponse(err)) => Some(err),
                None => None,
            };
            let mut entities = self.entities.borrow_mut();
            let rows = entities.get_mut(entity).ok_or_else(not_found)?;
            let before = rows.len();
            rows.retain(|row| field_as_string(row, "id").as_deref() != Some(id));
            if rows.len() == before {
                return Err(not_found());
            }
            lost.map_or(Ok(()), Err)
        }
    }

    fn id(raw: &str) -> Result<IdentityId, ReconcileError> {
        IdentityId::parse(raw)
    }

    fn seeded_api() -> FakeApi {
        let api = FakeApi::default();
        for (id, name) in [("A", "Dana Smith"), ("B", "dana smith")] {
            api.seed(
                IDENTITY_ENTITY,
                json!({
                    "id": id,
                    "name": name,
                    "email": null,
                    "role": "employee",
                    "archived": false,
                    "createdAt": "2026-01-01T00:00:00Z",
                    "updatedAt": "2026-01-01T00:00:00Z",
                }),
            );
        }
        for index in 0..3 {
            api.seed("MileageEntry", json!({"id": format!("m-{index}"), "employeeId": "B", "miles": 12.5}));
        }
        for index in 0..2 {
            api.seed("Receipt", json!({"id": format!("r-{index}"), "employeeId": "B"}));
        }
        api.seed("Receipt", json!({"id": "r-other", "employeeId": "A"}));
        api
    }

    fn merge_b_into_a() -> Result<MergeRequest, ReconcileError> {
        Ok(MergeRequest { source: id("B")?, target: id("A")?, dry_run: false })
    }

    #[test]
    fn merge_moves_rows_one_by_one_and_deletes_source() -> Result<(), ReconcileError> {
        let api = seeded_api();
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let report = merge_identities(&mut store, &merge_b_into_a()?)?;
        assert!(report.verified);
        assert_eq!(report.mode, AccessMode::Remote);
        let Some(rekey) = report.rekey else {
            return Err(ReconcileError::Store("missing rekey report".into()));
        };
        assert_eq!(rekey.tables[0].moved_rows, vec!["m-0", "m-1", "m-2"]);
        assert!(api.owners("Receipt").iter().all(|(_, owner)| owner == "A"));
        assert!(store.get_identity(&id("B")?)?.is_none());
        assert_eq!(*api.update_calls.borrow(), 5);
        Ok(())
    }

    #[test]
    fn failed_rows_are_itemized_and_source_is_kept() -> Result<(), ReconcileError> {
        let api = seeded_api();
        api.fail_updates("r-1", vec![TransportError::Status { code: 422, body: "locked".into() }]);
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let Err(err) = merge_identities(&mut store, &merge_b_into_a()?) else {
            return Err(ReconcileError::Store("merge should report a partial failure".into()));
        };
        assert_eq!(err.kind(), "partial_failure");
        let Some(report) = err.report() else {
            return Err(ReconcileError::Store("partial failure without report".into()));
        };
        assert!(!report.rolled_back);
        assert!(!report.source_deleted);
        let receipts = &report.tables[1];
        assert_eq!(receipts.moved_rows, vec!["r-0"]);
        assert_eq!(receipts.failed_rows.len(), 1);
        assert_eq!(receipts.failed_rows[0].row_id, "r-1");
        assert!(store.get_identity(&id("B")?)?.is_some());

        // Re-running picks up only the row that is still under the old id.
        let report = merge_identities(&mut store, &merge_b_into_a()?)?;
        assert!(report.verified);
        assert_eq!(report.planned.total(), 1);
        assert!(store.get_identity(&id("B")?)?.is_none());
        Ok(())
    }

    #[test]
    fn transient_errors_are_retried() -> Result<(), ReconcileError> {
        let api = seeded_api();
        let unavailable = TransportError::Status { code: 503, body: "busy".into() };
        api.fail_updates("m-1", vec![unavailable.clone(), unavailable]);
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let report = merge_identities(&mut store, &merge_b_into_a()?)?;
        assert!(report.verified);
        assert_eq!(*api.update_calls.borrow(), 7);
        Ok(())
    }

    #[test]
    fn exhausted_retries_surface_the_last_error() -> Result<(), ReconcileError> {
        let api = seeded_api();
        api.fail_updates("m-0", vec![TransportError::Transport("connection reset".into()); 5]);
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(2));

        let Err(err) = merge_identities(&mut store, &merge_b_into_a()?) else {
            return Err(ReconcileError::Store("merge should fail".into()));
        };
        let failures = err.report().map(|report| report.tables[0].failed_rows.clone()).unwrap_or_default();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("connection reset"));
        Ok(())
    }

    #[test]
    fn migration_creates_identity_with_wire_field_names() -> Result<(), ReconcileError> {
        let api = seeded_api();
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(1));
        let now = OffsetDateTime::UNIX_EPOCH;

        let report = migrate_identity(
            &mut store,
            &MigrationRequest {
                old_id: id("B")?,
                new_id: id("emp-0002")?,
                overrides: IdentityOverrides { role: Some("manager".into()), ..IdentityOverrides::default() },
                dry_run: false,
                now,
            },
        )?;
        assert!(report.verified);

        let created = (&api).get(IDENTITY_ENTITY, "emp-0002").map_err(|err| to_reconcile_error("get", &err))?;
        let created = created.ok_or_else(|| ReconcileError::NotFound("emp-0002".into()))?;
        assert_eq!(created["role"], "manager");
        assert_eq!(created["createdAt"], "1970-01-01T00:00:00Z");
        assert_eq!(store.list_dependents(DependentTable::MileageEntry, &id("emp-0002")?)?.len(), 3);
        Ok(())
    }

    #[test]
    fn lost_delete_response_still_completes_the_merge() -> Result<(), ReconcileError> {
        let api = seeded_api();
        api.script(
            "delete",
            vec![Scripted::LoseResponse(TransportError::Transport("connection reset after delete".into()))],
        );
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let report = merge_identities(&mut store, &merge_b_into_a()?)?;
        assert!(report.verified);
        assert!(report.rekey.is_some_and(|rekey| rekey.source_deleted));
        assert!(store.get_identity(&id("B")?)?.is_none());
        Ok(())
    }

    #[test]
    fn lost_create_response_still_completes_the_migration() -> Result<(), ReconcileError> {
        let api = seeded_api();
        api.script(
            "create",
            vec![Scripted::LoseResponse(TransportError::Status { code: 502, body: "bad gateway".into() })],
        );
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let report = migrate_identity(
            &mut store,
            &MigrationRequest {
                old_id: id("B")?,
                new_id: id("emp-0002")?,
                overrides: IdentityOverrides::default(),
                dry_run: false,
                now: OffsetDateTime::UNIX_EPOCH,
            },
        )?;
        assert!(report.verified);
        assert_eq!(api.ids(IDENTITY_ENTITY), vec!["A", "emp-0002"]);
        assert_eq!(store.list_dependents(DependentTable::Receipt, &id("emp-0002")?)?.len(), 2);
        Ok(())
    }

    #[test]
    fn retried_create_rejects_a_different_existing_identity() -> Result<(), ReconcileError> {
        let api = seeded_api();
        api.script("create", vec![Scripted::Fail(TransportError::Transport("timed out".into()))]);
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let mut record = store.get_identity(&id("A")?)?.ok_or_else(|| ReconcileError::NotFound("A".into()))?;
        record.name = "Someone Else".into();
        let err = store.insert_identity(&record).err();
        assert!(matches!(err, Some(ReconcileError::Validation(_))));

        // The same attributes are accepted as an already-applied create.
        record.name = "Dana Smith".into();
        api.script("create", vec![Scripted::Fail(TransportError::Transport("timed out".into()))]);
        store.insert_identity(&record)?;
        assert_eq!(api.ids(IDENTITY_ENTITY), vec!["A", "B"]);
        Ok(())
    }

    #[test]
    fn listing_failure_keeps_earlier_row_failures() -> Result<(), ReconcileError> {
        let api = seeded_api();
        for row in ["m-0", "m-1", "m-2"] {
            api.fail_updates(row, vec![TransportError::Status { code: 422, body: "locked".into() }]);
        }
        api.fail_lists("Receipt", vec![TransportError::Status { code: 400, body: "bad filter".into() }]);
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(3));

        let Err(err) = store.apply_rekey(&RekeyPlan::merge(id("B")?, id("A")?)) else {
            return Err(ReconcileError::Store("re-key should fail".into()));
        };
        assert_eq!(err.kind(), "partial_failure");
        let failed = err.report().map(RekeyReport::failed_rows).unwrap_or_default();
        assert_eq!(failed, 3);
        assert!(store.get_identity(&id("B")?)?.is_some());
        Ok(())
    }

    #[test]
    fn missing_identity_maps_to_not_found() -> Result<(), ReconcileError> {
        let api = seeded_api();
        let mut store = RemoteStore::new(&api, RetryPolicy::immediate(1));
        assert_eq!(store.get_identity(&id("ghost")?)?, None);
        assert!(matches!(store.delete_identity(&id("ghost")?), Err(ReconcileError::NotFound(_))));
        Ok(())
    }
}

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use apptrack_core::{
    to_canonical, to_external, CatalogEntry, CatalogError, RawRecord, RunId, SyncDirection,
    SyncRun, SyncStatus, FIELD_ALIASES,
};
use apptrack_store_sqlite::SqliteCatalogStore;
use serde_json::Value;

/// One side of the sync: the spreadsheet-shaped store records are pulled
/// from and pushed to. Implementations exchange raw records; all coercion to
/// and from the canonical shape happens in the engine.
pub trait ExternalStore {
    fn store_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_records(&self) -> Result<Vec<RawRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn write_record(&mut self, record: &RawRecord) -> Result<()>;

    /// Current external state for push-side merging. Defaults to
    /// `fetch_records`; stores where absence is a valid starting state (a
    /// not-yet-created export file) override this to return empty instead.
    #[allow(clippy::missing_errors_doc)]
    fn current_records(&self) -> Result<Vec<RawRecord>> {
        self.fetch_records()
    }

    /// Buffering stores persist here once per run; write-through stores keep
    /// the no-op default.
    #[allow(clippy::missing_errors_doc)]
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockExternalStore {
    records: Vec<RawRecord>,
    written: Vec<RawRecord>,
    fail_fetch: bool,
    failing_products: BTreeSet<String>,
}

impl MockExternalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn set_fail_fetch(&mut self, fail: bool) {
        self.fail_fetch = fail;
    }

    /// Makes every write for the named product fail, to exercise per-record
    /// containment on the push side.
    pub fn fail_writes_for(&mut self, product: &str) {
        self.failing_products.insert(product.to_string());
    }

    #[must_use]
    pub fn written(&self) -> &[RawRecord] {
        &self.written
    }
}

impl ExternalStore for MockExternalStore {
    fn store_name(&self) -> &'static str {
        "mock"
    }

    fn fetch_records(&self) -> Result<Vec<RawRecord>> {
        if self.fail_fetch {
            return Err(anyhow!(CatalogError::TransientIo(
                "external store unavailable".to_string()
            )));
        }
        Ok(self.records.clone())
    }

    fn write_record(&mut self, record: &RawRecord) -> Result<()> {
        let product = record
            .get("product")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if self.failing_products.contains(product) {
            return Err(anyhow!(CatalogError::TransientIo(format!(
                "write rejected for '{product}'"
            ))));
        }
        self.written.push(record.clone());
        Ok(())
    }
}

/// JSON-array file store, the spreadsheet-export stand-in the CLI uses.
/// Pushed records are staged in memory and written out on flush, so a failed
/// flush leaves the previous file intact.
pub struct FileExternalStore {
    path: PathBuf,
    staged: Vec<RawRecord>,
}

impl FileExternalStore {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            staged: Vec::new(),
        }
    }
}

impl ExternalStore for FileExternalStore {
    fn store_name(&self) -> &'static str {
        "file"
    }

    fn fetch_records(&self) -> Result<Vec<RawRecord>> {
        let raw = std::fs::read_to_string(&self.path).with_context(|| {
            format!(
                "failed to read external records file {}",
                self.path.display()
            )
        })?;
        let records: Vec<RawRecord> = serde_json::from_str(&raw).with_context(|| {
            format!(
                "external records file {} is not a JSON array of objects",
                self.path.display()
            )
        })?;
        Ok(records)
    }

    fn write_record(&mut self, record: &RawRecord) -> Result<()> {
        self.staged.push(record.clone());
        Ok(())
    }

    fn current_records(&self) -> Result<Vec<RawRecord>> {
        if self.path.exists() {
            self.fetch_records()
        } else {
            Ok(Vec::new())
        }
    }

    fn flush(&mut self) -> Result<()> {
        let body = serde_json::to_string_pretty(&self.staged)
            .context("failed to serialize external records")?;
        std::fs::write(&self.path, body).with_context(|| {
            format!(
                "failed to write external records file {}",
                self.path.display()
            )
        })?;
        self.staged.clear();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub auth_bearer_env: Option<String>,
}

impl HttpStoreConfig {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms: 30_000,
            auth_bearer_env: None,
        }
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        match &self.auth_bearer_env {
            Some(env_name) => {
                let token = std::env::var(env_name).map_err(|_| {
                    anyhow!("missing env var '{env_name}' named by auth_bearer_env")
                })?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }
}

pub struct HttpExternalStore {
    config: HttpStoreConfig,
}

impl HttpExternalStore {
    #[must_use]
    pub fn new(config: HttpStoreConfig) -> Self {
        Self { config }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build()
    }

    fn records_url(&self) -> String {
        format!("{}/records", self.config.base_url)
    }

    fn apply_auth(&self, request: ureq::Request) -> Result<ureq::Request> {
        match self.config.bearer_token()? {
            Some(token) => Ok(request.set("authorization", &format!("Bearer {token}"))),
            None => Ok(request),
        }
    }
}

impl ExternalStore for HttpExternalStore {
    fn store_name(&self) -> &'static str {
        "http"
    }

    fn fetch_records(&self) -> Result<Vec<RawRecord>> {
        let request = self
            .agent()
            .get(&self.records_url())
            .set("accept", "application/json");
        let request = self.apply_auth(request)?;

        match request.call() {
            Ok(response) => response
                .into_json::<Vec<RawRecord>>()
                .context("external store returned malformed records"),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(CatalogError::TransientIo(format!(
                "external store returned http status {code}"
            )))),
            Err(ureq::Error::Transport(err)) => Err(anyhow!(CatalogError::TransientIo(format!(
                "external store transport failure: {err}"
            )))),
        }
    }

    fn write_record(&mut self, record: &RawRecord) -> Result<()> {
        let request = self
            .agent()
            .post(&self.records_url())
            .set("content-type", "application/json");
        let request = self.apply_auth(request)?;

        match request.send_json(Value::Object(record.clone())) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(CatalogError::TransientIo(format!(
                "external store returned http status {code}"
            )))),
            Err(ureq::Error::Transport(err)) => Err(anyhow!(CatalogError::TransientIo(format!(
                "external store transport failure: {err}"
            )))),
        }
    }
}

/// Drives one reconciliation run against the canonical store. Per-record
/// failures are recorded on the run and the loop continues; only
/// infrastructure failures (fetch, list, flush, the log itself) seal the run
/// as failed.
pub struct SyncEngine<'a> {
    external: &'a mut dyn ExternalStore,
}

impl<'a> SyncEngine<'a> {
    pub fn new(external: &'a mut dyn ExternalStore) -> Self {
        Self { external }
    }

    /// Runs one sync in the given direction and returns the sealed run
    /// record. Bidirectional is pull then push under a single run.
    ///
    /// # Errors
    /// Returns an error only when the run log itself cannot be written; a
    /// failed sync still comes back as `Ok` with a sealed failed run.
    pub fn run_sync(
        &mut self,
        store: &mut SqliteCatalogStore,
        direction: SyncDirection,
        triggered_by: &str,
    ) -> Result<SyncRun> {
        let run = store.create_sync_run(direction, triggered_by)?;
        store.mark_run_in_progress(run.run_id)?;

        let mut synced = 0_u64;
        let mut failed = 0_u64;
        let infra_error =
            match self.run_phases(store, run.run_id, direction, &mut synced, &mut failed) {
                Ok(()) => None,
                Err(err) => Some(format!("{err:#}")),
            };

        let status = if infra_error.is_some() {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        };
        store.seal_sync_run(run.run_id, status, synced, failed, infra_error.as_deref())
    }

    fn run_phases(
        &mut self,
        store: &mut SqliteCatalogStore,
        run_id: RunId,
        direction: SyncDirection,
        synced: &mut u64,
        failed: &mut u64,
    ) -> Result<()> {
        if matches!(direction, SyncDirection::Pull | SyncDirection::Bidirectional) {
            self.pull_phase(store, run_id, synced, failed)?;
        }
        if matches!(direction, SyncDirection::Push | SyncDirection::Bidirectional) {
            self.push_phase(store, run_id, synced, failed)?;
        }
        Ok(())
    }

    fn pull_phase(
        &mut self,
        store: &mut SqliteCatalogStore,
        run_id: RunId,
        synced: &mut u64,
        failed: &mut u64,
    ) -> Result<()> {
        let records = self.external.fetch_records().with_context(|| {
            format!(
                "failed to fetch records from {} store",
                self.external.store_name()
            )
        })?;

        for raw in &records {
            let draft = to_canonical(raw);
            let label = draft.record_label();

            // Unresolvable records never reach the canonical store: inserting
            // them would mint rows the identity matcher can never find again.
            if !draft.identity().is_resolvable() {
                let err = CatalogError::DataIntegrity(format!(
                    "identity unresolvable for record '{label}'; flagged for manual review"
                ));
                store.record_sync_failure(run_id, &label, err.kind(), &err.to_string())?;
                *failed += 1;
                continue;
            }

            match store.upsert_by_identity(&draft) {
                Ok(_) => *synced += 1,
                Err(err) => {
                    store.record_sync_failure(
                        run_id,
                        &label,
                        failure_kind(&err),
                        &format!("{err:#}"),
                    )?;
                    *failed += 1;
                }
            }
        }

        Ok(())
    }

    fn push_phase(
        &mut self,
        store: &mut SqliteCatalogStore,
        run_id: RunId,
        synced: &mut u64,
        failed: &mut u64,
    ) -> Result<()> {
        let entries = store
            .list_entries()
            .context("failed to list canonical entries for push")?;
        let existing = self.external.current_records().with_context(|| {
            format!(
                "failed to read current records from {} store",
                self.external.store_name()
            )
        })?;

        let mut by_identity: BTreeMap<String, &RawRecord> = BTreeMap::new();
        for raw in &existing {
            if let Some(key) = to_canonical(raw).identity().match_key() {
                by_identity.entry(key).or_insert(raw);
            }
        }

        for entry in &entries {
            let record = match entry
                .identity()
                .match_key()
                .and_then(|key| by_identity.get(&key))
            {
                Some(external_row) => merge_over_external(entry, external_row),
                None => to_external(entry),
            };

            match self.external.write_record(&record) {
                Ok(()) => *synced += 1,
                Err(err) => {
                    store.record_sync_failure(
                        run_id,
                        &entry.record_label(),
                        failure_kind(&err),
                        &format!("{err:#}"),
                    )?;
                    *failed += 1;
                }
            }
        }

        self.external.flush().with_context(|| {
            format!(
                "failed to flush records to {} store",
                self.external.store_name()
            )
        })?;
        Ok(())
    }
}

/// Lays the canonical row over its external counterpart: every alias
/// spelling of a canonical field is dropped first, then the primary headers
/// are written, so external-only columns survive while no stale alias copy
/// of a canonical field is left behind.
fn merge_over_external(entry: &CatalogEntry, external_row: &RawRecord) -> RawRecord {
    let mut merged = external_row.clone();
    for (_, aliases) in FIELD_ALIASES.iter().copied() {
        for alias in aliases {
            merged.remove(*alias);
        }
    }
    for (key, value) in to_external(entry) {
        merged.insert(key, value);
    }
    merged
}

fn failure_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<CatalogError>()
        .map_or("transient_io", CatalogError::kind)
}

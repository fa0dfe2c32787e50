#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use apptrack_core::{
    aggregate_assessments, format_date, format_rfc3339, merge_external, new_entry_from_draft,
    now_utc, parse_date_str, parse_rfc3339_utc, Assessment, AssessmentId, AssessmentInput,
    AssessmentStatus, AssessmentTally, CatalogDraft, CatalogEntry, CatalogError, DecisionId,
    DecisionStage, EntryId, Recommendation, RenewalDecision, RunId, SyncDirection, SyncFailure,
    SyncRun, SyncStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const CATALOG_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CATALOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS catalog_entries (
  entry_id TEXT PRIMARY KEY,
  product_id TEXT,
  product TEXT NOT NULL,
  identity_key TEXT NOT NULL,
  category TEXT,
  department TEXT,
  divisions_json TEXT NOT NULL DEFAULT '[]',
  audience_json TEXT NOT NULL DEFAULT '[]',
  license_terms TEXT,
  annual_cost REAL CHECK (annual_cost >= 0.0 OR annual_cost IS NULL),
  license_count INTEGER CHECK (license_count >= 0 OR license_count IS NULL),
  renewal_date TEXT,
  sso_enabled INTEGER NOT NULL DEFAULT 0 CHECK (sso_enabled IN (0, 1)),
  mobile_app INTEGER NOT NULL DEFAULT 0 CHECK (mobile_app IN (0, 1)),
  enterprise INTEGER NOT NULL DEFAULT 0 CHECK (enterprise IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_catalog_entries_identity
  ON catalog_entries(identity_key, created_at, entry_id);

CREATE TABLE IF NOT EXISTS sync_runs (
  run_id TEXT PRIMARY KEY,
  direction TEXT NOT NULL CHECK (direction IN ('pull', 'push', 'bidirectional')),
  status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
  records_synced INTEGER NOT NULL DEFAULT 0 CHECK (records_synced >= 0),
  records_failed INTEGER NOT NULL DEFAULT 0 CHECK (records_failed >= 0),
  error_message TEXT,
  triggered_by TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_sync_runs_sealed
BEFORE UPDATE ON sync_runs
WHEN OLD.status IN ('completed', 'failed')
BEGIN
  SELECT RAISE(FAIL, 'sync run is sealed');
END;

CREATE TRIGGER IF NOT EXISTS trg_sync_runs_no_delete
BEFORE DELETE ON sync_runs
BEGIN
  SELECT RAISE(FAIL, 'sync log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_sync_runs_started
  ON sync_runs(started_at DESC, run_id);

CREATE TABLE IF NOT EXISTS sync_failures (
  failure_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  record_label TEXT NOT NULL,
  error_kind TEXT NOT NULL,
  message TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES sync_runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_sync_failures_no_update
BEFORE UPDATE ON sync_failures
BEGIN
  SELECT RAISE(FAIL, 'sync_failures is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_sync_failures_no_delete
BEFORE DELETE ON sync_failures
BEGIN
  SELECT RAISE(FAIL, 'sync_failures is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_sync_failures_run
  ON sync_failures(run_id, failure_seq);

CREATE TABLE IF NOT EXISTS assessments (
  assessment_id TEXT PRIMARY KEY,
  entry_id TEXT NOT NULL,
  cycle_year INTEGER NOT NULL CHECK (cycle_year BETWEEN 1900 AND 9999),
  submitter TEXT NOT NULL,
  recommendation TEXT NOT NULL CHECK (
    recommendation IN ('renew', 'renew_with_changes', 'replace', 'retire')
  ),
  justification TEXT,
  usage_notes TEXT,
  snapshot_license_terms TEXT,
  snapshot_annual_cost REAL,
  snapshot_license_count INTEGER,
  snapshot_renewal_date TEXT,
  status TEXT NOT NULL DEFAULT 'submitted' CHECK (
    status IN ('submitted', 'in_review', 'approved', 'rejected', 'completed')
  ),
  submitted_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (entry_id) REFERENCES catalog_entries(entry_id)
);

CREATE INDEX IF NOT EXISTS idx_assessments_entry_cycle
  ON assessments(entry_id, cycle_year, submitted_at);

CREATE TRIGGER IF NOT EXISTS trg_assessments_frozen
BEFORE UPDATE ON assessments
WHEN OLD.recommendation <> NEW.recommendation
  OR OLD.submitter <> NEW.submitter
  OR OLD.submitted_at <> NEW.submitted_at
  OR OLD.snapshot_license_terms IS NOT NEW.snapshot_license_terms
  OR OLD.snapshot_annual_cost IS NOT NEW.snapshot_annual_cost
  OR OLD.snapshot_license_count IS NOT NEW.snapshot_license_count
  OR OLD.snapshot_renewal_date IS NOT NEW.snapshot_renewal_date
BEGIN
  SELECT RAISE(FAIL, 'assessment snapshot fields are frozen after submission');
END;

CREATE TABLE IF NOT EXISTS renewal_decisions (
  decision_id TEXT PRIMARY KEY,
  entry_id TEXT NOT NULL,
  cycle_year INTEGER NOT NULL CHECK (cycle_year BETWEEN 1900 AND 9999),
  stage TEXT NOT NULL DEFAULT 'collecting' CHECK (
    stage IN ('collecting', 'summarizing', 'assessor_review', 'final_review', 'decided', 'implemented')
  ),
  version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
  tally_renew INTEGER NOT NULL DEFAULT 0 CHECK (tally_renew >= 0),
  tally_renew_with_changes INTEGER NOT NULL DEFAULT 0 CHECK (tally_renew_with_changes >= 0),
  tally_replace INTEGER NOT NULL DEFAULT 0 CHECK (tally_replace >= 0),
  tally_retire INTEGER NOT NULL DEFAULT 0 CHECK (tally_retire >= 0),
  tally_total INTEGER NOT NULL DEFAULT 0 CHECK (tally_total >= 0),
  summary_text TEXT,
  summary_generated_at TEXT,
  assessor_recommendation TEXT CHECK (
    assessor_recommendation IN ('renew', 'renew_with_changes', 'replace', 'retire')
    OR assessor_recommendation IS NULL
  ),
  assessor_comment TEXT,
  assessor_reviewed_at TEXT,
  final_decision TEXT CHECK (
    final_decision IN ('renew', 'renew_with_changes', 'replace', 'retire')
    OR final_decision IS NULL
  ),
  approver_comment TEXT,
  decided_at TEXT,
  new_annual_cost REAL,
  new_license_count INTEGER,
  new_renewal_date TEXT,
  implementation_notes TEXT,
  implemented_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (entry_id, cycle_year),
  FOREIGN KEY (entry_id) REFERENCES catalog_entries(entry_id)
);

CREATE TRIGGER IF NOT EXISTS trg_renewal_decisions_final_frozen
BEFORE UPDATE ON renewal_decisions
WHEN OLD.stage = 'implemented' AND OLD.final_decision IS NOT NEW.final_decision
BEGIN
  SELECT RAISE(FAIL, 'final decision is immutable once implemented');
END;
";

pub struct SqliteCatalogStore {
    conn: Connection,
}

/// Outcome of one upsert-by-identity. All three count as synced; only the
/// first two change descriptive fields.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub identity_key: String,
    pub product: String,
    pub count: usize,
    pub ids: Vec<EntryId>,
    pub keep_id: EntryId,
    pub remove_ids: Vec<EntryId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DuplicateReport {
    pub total_apps: usize,
    pub duplicate_groups: usize,
    pub total_duplicates: usize,
    pub unresolvable_count: usize,
    pub unresolvable_labels: Vec<String>,
    pub duplicates: Vec<DuplicateGroup>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RemovalError {
    pub identity_key: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RemovalReport {
    pub message: String,
    pub groups_processed: usize,
    pub removed_count: usize,
    pub group_errors: Vec<RemovalError>,
}

impl SqliteCatalogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CATALOG_V1)
            .context("failed to apply catalog schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CATALOG_MIGRATION_VERSION, now],
            )
            .context("failed to register catalog schema migration")?;

        Ok(())
    }

    /// Highest applied migration version; 0 before `migrate` has run.
    pub fn schema_version(&self) -> Result<i64> {
        let table: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to inspect schema_migrations")?;
        if table.is_none() {
            return Ok(0);
        }

        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .context("failed to read schema version")?;
        Ok(version.unwrap_or(0))
    }

    // ----- catalog entries -------------------------------------------------

    /// Manual add path. The record must carry a resolvable identity.
    pub fn insert_entry(&mut self, draft: &CatalogDraft) -> Result<CatalogEntry> {
        let identity = draft.identity();
        if !identity.is_resolvable() {
            return Err(anyhow!(CatalogError::DataIntegrity(format!(
                "identity unresolvable for record '{}'; provide a product name or product_id",
                draft.record_label()
            ))));
        }

        let now = now_utc();
        let entry = new_entry_from_draft(EntryId(Ulid::new()), draft, now);
        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;
        insert_entry_row(&tx, &entry)?;
        tx.commit().context("failed to commit entry insert")?;
        Ok(entry)
    }

    pub fn get_entry(&self, entry_id: EntryId) -> Result<Option<CatalogEntry>> {
        self.conn
            .query_row(
                "SELECT entry_id, product_id, product, category, department, divisions_json,
                        audience_json, license_terms, annual_cost, license_count, renewal_date,
                        sso_enabled, mobile_app, enterprise, created_at, updated_at, synced_at
                 FROM catalog_entries
                 WHERE entry_id = ?1",
                params![entry_id.to_string()],
                parse_entry_row,
            )
            .optional()
            .context("failed to load catalog entry")
    }

    pub fn list_entries(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, product_id, product, category, department, divisions_json,
                    audience_json, license_terms, annual_cost, license_count, renewal_date,
                    sso_enabled, mobile_app, enterprise, created_at, updated_at, synced_at
             FROM catalog_entries
             ORDER BY product COLLATE NOCASE ASC, entry_id ASC",
        )?;

        let rows = stmt.query_map([], parse_entry_row)?;
        collect_rows(rows)
    }

    pub fn count_entries(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM catalog_entries", [], |row| row.get(0))
            .context("failed to count catalog entries")?;
        usize::try_from(count).context("entry count out of range")
    }

    /// Insert-or-merge keyed by identity. When several rows already share
    /// the key (a transient duplicate state) the earliest-created row is the
    /// one updated, matching the duplicate resolver's survivor rule.
    pub fn upsert_by_identity(
        &mut self,
        draft: &CatalogDraft,
    ) -> Result<(CatalogEntry, UpsertOutcome)> {
        let identity = draft.identity();
        let Some(match_key) = identity.match_key() else {
            return Err(anyhow!(CatalogError::DataIntegrity(format!(
                "identity unresolvable for record '{}'; flagged for manual review",
                draft.record_label()
            ))));
        };

        let now = now_utc();
        let tx = self
            .conn
            .transaction()
            .context("failed to start upsert transaction")?;

        let existing = tx
            .query_row(
                "SELECT entry_id, product_id, product, category, department, divisions_json,
                        audience_json, license_terms, annual_cost, license_count, renewal_date,
                        sso_enabled, mobile_app, enterprise, created_at, updated_at, synced_at
                 FROM catalog_entries
                 WHERE identity_key = ?1
                 ORDER BY created_at ASC, entry_id ASC
                 LIMIT 1",
                params![match_key],
                parse_entry_row,
            )
            .optional()
            .context("failed to match record by identity")?;

        let (entry, outcome) = match existing {
            None => {
                let mut entry = new_entry_from_draft(EntryId(Ulid::new()), draft, now);
                entry.synced_at = Some(now);
                insert_entry_row(&tx, &entry)?;
                (entry, UpsertOutcome::Inserted)
            }
            Some(current) => {
                let (mut merged, changed) = merge_external(&current, draft, now);
                merged.synced_at = Some(now);
                if changed {
                    update_entry_row(&tx, &merged)?;
                    (merged, UpsertOutcome::Updated)
                } else {
                    tx.execute(
                        "UPDATE catalog_entries SET synced_at = ?1 WHERE entry_id = ?2",
                        params![
                            format_rfc3339(now).map_err(|err| anyhow!(err))?,
                            merged.entry_id.to_string()
                        ],
                    )
                    .context("failed to refresh synced_at")?;
                    (merged, UpsertOutcome::Unchanged)
                }
            }
        };

        tx.commit().context("failed to commit upsert")?;
        Ok((entry, outcome))
    }

    /// Full-row update for manual edits; recomputes the identity key.
    pub fn update_entry(&mut self, entry: &CatalogEntry) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;
        let updated = update_entry_row(&tx, entry)?;
        if updated == 0 {
            return Err(anyhow!(CatalogError::Validation(format!(
                "catalog entry {} not found",
                entry.entry_id
            ))));
        }
        tx.commit().context("failed to commit entry update")?;
        Ok(())
    }

    // ----- duplicate detection and removal ---------------------------------

    pub fn find_duplicate_groups(&self) -> Result<DuplicateReport> {
        let total_apps = self.count_entries()?;

        let mut keys_stmt = self.conn.prepare(
            "SELECT identity_key
             FROM catalog_entries
             WHERE identity_key NOT LIKE 'unresolved:%'
             GROUP BY identity_key
             HAVING COUNT(*) > 1
             ORDER BY identity_key ASC",
        )?;
        let keys = keys_stmt.query_map([], |row| row.get::<_, String>(0))?;
        let keys = collect_rows(keys)?;

        let mut duplicates = Vec::new();
        let mut total_duplicates = 0_usize;
        for identity_key in keys {
            let members = self.group_members(&identity_key)?;
            if members.len() < 2 {
                continue;
            }

            let keep = &members[0];
            let remove_ids: Vec<EntryId> =
                members.iter().skip(1).map(|member| member.0).collect();
            total_duplicates += remove_ids.len();
            duplicates.push(DuplicateGroup {
                identity_key,
                product: keep.1.clone(),
                count: members.len(),
                ids: members.iter().map(|member| member.0).collect(),
                keep_id: keep.0,
                remove_ids,
            });
        }

        let mut unresolved_stmt = self.conn.prepare(
            "SELECT entry_id, product
             FROM catalog_entries
             WHERE identity_key LIKE 'unresolved:%'
             ORDER BY entry_id ASC",
        )?;
        let unresolved = unresolved_stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let product: String = row.get(1)?;
            Ok(if product.trim().is_empty() {
                format!("entry_id={id}")
            } else {
                product
            })
        })?;
        let unresolvable_labels = collect_rows(unresolved)?;

        Ok(DuplicateReport {
            total_apps,
            duplicate_groups: duplicates.len(),
            total_duplicates,
            unresolvable_count: unresolvable_labels.len(),
            unresolvable_labels,
            duplicates,
        })
    }

    /// Deletes every non-survivor per group, one transaction per group so a
    /// failed group rolls back alone and the rest still proceed.
    pub fn remove_duplicates(&mut self) -> Result<RemovalReport> {
        let report = self.find_duplicate_groups()?;

        let mut groups_processed = 0_usize;
        let mut removed_count = 0_usize;
        let mut group_errors = Vec::new();

        for group in &report.duplicates {
            match self.remove_group(&group.identity_key) {
                Ok(removed) => {
                    groups_processed += 1;
                    removed_count += removed;
                }
                Err(err) => group_errors.push(RemovalError {
                    identity_key: group.identity_key.clone(),
                    message: format!("{err:#}"),
                }),
            }
        }

        let message = if group_errors.is_empty() {
            format!("removed {removed_count} duplicate entries across {groups_processed} groups")
        } else {
            format!(
                "removed {removed_count} duplicate entries across {groups_processed} groups; {} groups failed",
                group_errors.len()
            )
        };

        Ok(RemovalReport {
            message,
            groups_processed,
            removed_count,
            group_errors,
        })
    }

    fn remove_group(&mut self, identity_key: &str) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start removal for group {identity_key}"))?;

        // Survivor recomputed inside the transaction in case membership
        // changed since the scan.
        let keep_id: Option<String> = tx
            .query_row(
                "SELECT entry_id
                 FROM catalog_entries
                 WHERE identity_key = ?1
                 ORDER BY created_at ASC, entry_id ASC
                 LIMIT 1",
                params![identity_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to pick group survivor")?;

        let Some(keep_id) = keep_id else {
            tx.commit().ok();
            return Ok(0);
        };

        let removed = tx
            .execute(
                "DELETE FROM catalog_entries WHERE identity_key = ?1 AND entry_id <> ?2",
                params![identity_key, keep_id],
            )
            .with_context(|| format!("failed to delete duplicates for group {identity_key}"))?;

        tx.commit()
            .with_context(|| format!("failed to commit removal for group {identity_key}"))?;
        Ok(removed)
    }

    fn group_members(&self, identity_key: &str) -> Result<Vec<(EntryId, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, product
             FROM catalog_entries
             WHERE identity_key = ?1
             ORDER BY created_at ASC, entry_id ASC",
        )?;
        let rows = stmt.query_map(params![identity_key], |row| {
            let id_raw: String = row.get(0)?;
            let product: String = row.get(1)?;
            let id = Ulid::from_string(&id_raw).map_err(|_| {
                column_error(0, format!("invalid entry_id ULID: {id_raw}"))
            })?;
            Ok((EntryId(id), product))
        })?;
        collect_rows(rows)
    }

    // ----- sync runs -------------------------------------------------------

    pub fn create_sync_run(
        &mut self,
        direction: SyncDirection,
        triggered_by: &str,
    ) -> Result<SyncRun> {
        if triggered_by.trim().is_empty() {
            return Err(anyhow!(CatalogError::Validation(
                "triggered_by MUST be provided".to_string()
            )));
        }

        let run = SyncRun {
            run_id: RunId(Ulid::new()),
            direction,
            status: SyncStatus::Pending,
            records_synced: 0,
            records_failed: 0,
            error_message: None,
            triggered_by: triggered_by.trim().to_string(),
            started_at: now_utc(),
            completed_at: None,
        };

        self.conn
            .execute(
                "INSERT INTO sync_runs(
                    run_id, direction, status, records_synced, records_failed,
                    error_message, triggered_by, started_at, completed_at
                 ) VALUES (?1, ?2, ?3, 0, 0, NULL, ?4, ?5, NULL)",
                params![
                    run.run_id.to_string(),
                    run.direction.as_str(),
                    run.status.as_str(),
                    run.triggered_by,
                    format_rfc3339(run.started_at).map_err(|err| anyhow!(err))?,
                ],
            )
            .context("failed to create sync run")?;

        Ok(run)
    }

    pub fn mark_run_in_progress(&mut self, run_id: RunId) -> Result<()> {
        self.transition_run_status(run_id, SyncStatus::InProgress, 0, 0, None)
    }

    /// Seals a run with its final status and counts. Sealed runs are frozen
    /// by both this status check and the sqlite trigger.
    pub fn seal_sync_run(
        &mut self,
        run_id: RunId,
        status: SyncStatus,
        records_synced: u64,
        records_failed: u64,
        error_message: Option<&str>,
    ) -> Result<SyncRun> {
        if !status.is_sealed() {
            return Err(anyhow!(CatalogError::Validation(format!(
                "sync run can only be sealed as completed or failed, not {}",
                status.as_str()
            ))));
        }

        self.transition_run_status(run_id, status, records_synced, records_failed, error_message)?;
        self.get_sync_run(run_id)?
            .ok_or_else(|| anyhow!("sync run {run_id} disappeared after seal"))
    }

    fn transition_run_status(
        &mut self,
        run_id: RunId,
        next: SyncStatus,
        records_synced: u64,
        records_failed: u64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let current = self
            .get_sync_run(run_id)?
            .ok_or_else(|| anyhow!(CatalogError::Validation(format!("sync run {run_id} not found"))))?;

        if !current.status.can_transition_to(next) {
            return Err(anyhow!(CatalogError::Conflict(format!(
                "sync run {} cannot move from {} to {}",
                run_id,
                current.status.as_str(),
                next.as_str()
            ))));
        }

        let completed_at = if next.is_sealed() {
            Some(format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?)
        } else {
            None
        };

        self.conn
            .execute(
                "UPDATE sync_runs
                 SET status = ?1, records_synced = ?2, records_failed = ?3,
                     error_message = ?4, completed_at = ?5
                 WHERE run_id = ?6",
                params![
                    next.as_str(),
                    i64::try_from(records_synced).context("records_synced out of range")?,
                    i64::try_from(records_failed).context("records_failed out of range")?,
                    error_message,
                    completed_at,
                    run_id.to_string(),
                ],
            )
            .context("failed to update sync run status")?;

        Ok(())
    }

    pub fn get_sync_run(&self, run_id: RunId) -> Result<Option<SyncRun>> {
        self.conn
            .query_row(
                "SELECT run_id, direction, status, records_synced, records_failed,
                        error_message, triggered_by, started_at, completed_at
                 FROM sync_runs
                 WHERE run_id = ?1",
                params![run_id.to_string()],
                parse_run_row,
            )
            .optional()
            .context("failed to load sync run")
    }

    pub fn list_sync_runs(&self, limit: Option<usize>) -> Result<Vec<SyncRun>> {
        let mut query = "SELECT run_id, direction, status, records_synced, records_failed,
                    error_message, triggered_by, started_at, completed_at
             FROM sync_runs
             ORDER BY started_at DESC, run_id DESC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_run_row)?;
        collect_rows(rows)
    }

    pub fn record_sync_failure(
        &mut self,
        run_id: RunId,
        record_label: &str,
        error_kind: &str,
        message: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_failures(run_id, record_label, error_kind, message, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    record_label,
                    error_kind,
                    message,
                    format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?,
                ],
            )
            .context("failed to record sync failure")?;
        Ok(())
    }

    pub fn list_sync_failures(&self, run_id: RunId) -> Result<Vec<SyncFailure>> {
        let mut stmt = self.conn.prepare(
            "SELECT failure_seq, run_id, record_label, error_kind, message, occurred_at
             FROM sync_failures
             WHERE run_id = ?1
             ORDER BY failure_seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], parse_failure_row)?;
        collect_rows(rows)
    }

    // ----- assessments -----------------------------------------------------

    /// Inserts a submission, snapshotting the entry's terms as they stand
    /// right now. The snapshot columns are frozen by trigger afterwards.
    pub fn insert_assessment(&mut self, input: &AssessmentInput) -> Result<Assessment> {
        input.validate().map_err(|err| anyhow!(err))?;

        let entry = self
            .get_entry(input.entry_id)?
            .ok_or_else(|| {
                anyhow!(CatalogError::Validation(format!(
                    "catalog entry {} not found",
                    input.entry_id
                )))
            })?;

        let now = now_utc();
        let assessment = Assessment {
            assessment_id: AssessmentId(Ulid::new()),
            entry_id: input.entry_id,
            cycle_year: input.cycle_year,
            submitter: input.submitter.trim().to_string(),
            recommendation: input.recommendation,
            justification: input.justification.clone(),
            usage_notes: input.usage_notes.clone(),
            snapshot_license_terms: entry.license_terms.clone(),
            snapshot_annual_cost: entry.annual_cost,
            snapshot_license_count: entry.license_count,
            snapshot_renewal_date: entry.renewal_date,
            status: AssessmentStatus::Submitted,
            submitted_at: now,
            updated_at: now,
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start assessment transaction")?;
        tx.execute(
            "INSERT INTO assessments(
                assessment_id, entry_id, cycle_year, submitter, recommendation,
                justification, usage_notes, snapshot_license_terms, snapshot_annual_cost,
                snapshot_license_count, snapshot_renewal_date, status, submitted_at, updated_at
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14
             )",
            params![
                assessment.assessment_id.to_string(),
                assessment.entry_id.to_string(),
                i64::from(assessment.cycle_year),
                assessment.submitter,
                assessment.recommendation.as_str(),
                assessment.justification,
                assessment.usage_notes,
                assessment.snapshot_license_terms,
                assessment.snapshot_annual_cost,
                assessment.snapshot_license_count,
                assessment.snapshot_renewal_date.map(format_date),
                assessment.status.as_str(),
                format_rfc3339(assessment.submitted_at).map_err(|err| anyhow!(err))?,
                format_rfc3339(assessment.updated_at).map_err(|err| anyhow!(err))?,
            ],
        )
        .context("failed to insert assessment")?;
        tx.commit().context("failed to commit assessment")?;

        Ok(assessment)
    }

    pub fn update_assessment_status(
        &mut self,
        assessment_id: AssessmentId,
        status: AssessmentStatus,
    ) -> Result<Assessment> {
        let updated = self
            .conn
            .execute(
                "UPDATE assessments SET status = ?1, updated_at = ?2 WHERE assessment_id = ?3",
                params![
                    status.as_str(),
                    format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?,
                    assessment_id.to_string(),
                ],
            )
            .context("failed to update assessment status")?;

        if updated == 0 {
            return Err(anyhow!(CatalogError::Validation(format!(
                "assessment {assessment_id} not found"
            ))));
        }

        self.get_assessment(assessment_id)?
            .ok_or_else(|| anyhow!("assessment {assessment_id} disappeared after update"))
    }

    pub fn get_assessment(&self, assessment_id: AssessmentId) -> Result<Option<Assessment>> {
        self.conn
            .query_row(
                "SELECT assessment_id, entry_id, cycle_year, submitter, recommendation,
                        justification, usage_notes, snapshot_license_terms, snapshot_annual_cost,
                        snapshot_license_count, snapshot_renewal_date, status, submitted_at, updated_at
                 FROM assessments
                 WHERE assessment_id = ?1",
                params![assessment_id.to_string()],
                parse_assessment_row,
            )
            .optional()
            .context("failed to load assessment")
    }

    pub fn list_assessments(&self, entry_id: EntryId, cycle_year: i32) -> Result<Vec<Assessment>> {
        let mut stmt = self.conn.prepare(
            "SELECT assessment_id, entry_id, cycle_year, submitter, recommendation,
                    justification, usage_notes, snapshot_license_terms, snapshot_annual_cost,
                    snapshot_license_count, snapshot_renewal_date, status, submitted_at, updated_at
             FROM assessments
             WHERE entry_id = ?1 AND cycle_year = ?2
             ORDER BY submitted_at ASC, assessment_id ASC",
        )?;
        let rows = stmt.query_map(
            params![entry_id.to_string(), i64::from(cycle_year)],
            parse_assessment_row,
        )?;
        collect_rows(rows)
    }

    // ----- renewal decisions ------------------------------------------------

    /// Lazily creates the (entry, cycle) decision on first use; the UNIQUE
    /// constraint makes concurrent creation collapse to one row.
    pub fn ensure_decision(&mut self, entry_id: EntryId, cycle_year: i32) -> Result<RenewalDecision> {
        if self.get_entry(entry_id)?.is_none() {
            return Err(anyhow!(CatalogError::Validation(format!(
                "catalog entry {entry_id} not found"
            ))));
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?;
        self.conn
            .execute(
                "INSERT INTO renewal_decisions(decision_id, entry_id, cycle_year, stage, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'collecting', 1, ?4, ?5)
                 ON CONFLICT(entry_id, cycle_year) DO NOTHING",
                params![
                    DecisionId(Ulid::new()).to_string(),
                    entry_id.to_string(),
                    i64::from(cycle_year),
                    now,
                    now,
                ],
            )
            .context("failed to create renewal decision")?;

        self.get_decision_for(entry_id, cycle_year)?
            .ok_or_else(|| anyhow!("renewal decision missing after ensure"))
    }

    pub fn get_decision(&self, decision_id: DecisionId) -> Result<Option<RenewalDecision>> {
        self.conn
            .query_row(
                &format!("{DECISION_SELECT} WHERE decision_id = ?1"),
                params![decision_id.to_string()],
                parse_decision_row,
            )
            .optional()
            .context("failed to load renewal decision")
    }

    pub fn get_decision_for(
        &self,
        entry_id: EntryId,
        cycle_year: i32,
    ) -> Result<Option<RenewalDecision>> {
        self.conn
            .query_row(
                &format!("{DECISION_SELECT} WHERE entry_id = ?1 AND cycle_year = ?2"),
                params![entry_id.to_string(), i64::from(cycle_year)],
                parse_decision_row,
            )
            .optional()
            .context("failed to load renewal decision")
    }

    /// Recomputes the tallies from the assessments table. Idempotent; does
    /// not bump the optimistic version because no stage field changes.
    pub fn refresh_decision_tally(&mut self, decision_id: DecisionId) -> Result<RenewalDecision> {
        let decision = self
            .get_decision(decision_id)?
            .ok_or_else(|| {
                anyhow!(CatalogError::Validation(format!(
                    "renewal decision {decision_id} not found"
                )))
            })?;

        let assessments = self.list_assessments(decision.entry_id, decision.cycle_year)?;
        let tally = aggregate_assessments(&assessments);

        self.conn
            .execute(
                "UPDATE renewal_decisions
                 SET tally_renew = ?1, tally_renew_with_changes = ?2, tally_replace = ?3,
                     tally_retire = ?4, tally_total = ?5, updated_at = ?6
                 WHERE decision_id = ?7",
                params![
                    i64::try_from(tally.renew).context("tally out of range")?,
                    i64::try_from(tally.renew_with_changes).context("tally out of range")?,
                    i64::try_from(tally.replace).context("tally out of range")?,
                    i64::try_from(tally.retire).context("tally out of range")?,
                    i64::try_from(tally.total).context("tally out of range")?,
                    format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?,
                    decision_id.to_string(),
                ],
            )
            .context("failed to refresh decision tallies")?;

        self.get_decision(decision_id)?
            .ok_or_else(|| anyhow!("renewal decision disappeared after tally refresh"))
    }

    /// Writes one transition under optimistic concurrency: the UPDATE is
    /// guarded by the expected version and bumps it by one. When
    /// `implement_terms` is set the linked entry is updated in the same
    /// transaction, so a conflict rolls both back together.
    pub fn persist_transition(
        &mut self,
        updated: &RenewalDecision,
        expected_version: i64,
        implement_terms: bool,
    ) -> Result<RenewalDecision> {
        if updated.version != expected_version + 1 {
            return Err(anyhow!(
                "transition version must advance by exactly one (expected {}, got {})",
                expected_version + 1,
                updated.version
            ));
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start transition transaction")?;

        let changed = tx
            .execute(
                "UPDATE renewal_decisions
                 SET stage = ?1, version = ?2,
                     tally_renew = ?3, tally_renew_with_changes = ?4, tally_replace = ?5,
                     tally_retire = ?6, tally_total = ?7,
                     summary_text = ?8, summary_generated_at = ?9,
                     assessor_recommendation = ?10, assessor_comment = ?11, assessor_reviewed_at = ?12,
                     final_decision = ?13, approver_comment = ?14, decided_at = ?15,
                     new_annual_cost = ?16, new_license_count = ?17, new_renewal_date = ?18,
                     implementation_notes = ?19, implemented_at = ?20, updated_at = ?21
                 WHERE decision_id = ?22 AND version = ?23",
                params![
                    updated.stage.as_str(),
                    updated.version,
                    i64::try_from(updated.tally.renew).context("tally out of range")?,
                    i64::try_from(updated.tally.renew_with_changes).context("tally out of range")?,
                    i64::try_from(updated.tally.replace).context("tally out of range")?,
                    i64::try_from(updated.tally.retire).context("tally out of range")?,
                    i64::try_from(updated.tally.total).context("tally out of range")?,
                    updated.summary_text,
                    opt_rfc3339(updated.summary_generated_at)?,
                    updated.assessor_recommendation.map(Recommendation::as_str),
                    updated.assessor_comment,
                    opt_rfc3339(updated.assessor_reviewed_at)?,
                    updated.final_decision.map(Recommendation::as_str),
                    updated.approver_comment,
                    opt_rfc3339(updated.decided_at)?,
                    updated.new_annual_cost,
                    updated.new_license_count,
                    updated.new_renewal_date.map(format_date),
                    updated.implementation_notes,
                    opt_rfc3339(updated.implemented_at)?,
                    opt_rfc3339(Some(updated.updated_at))?,
                    updated.decision_id.to_string(),
                    expected_version,
                ],
            )
            .context("failed to write decision transition")?;

        if changed == 0 {
            drop(tx);
            let stored = self.get_decision(updated.decision_id)?.ok_or_else(|| {
                anyhow!(CatalogError::Validation(format!(
                    "renewal decision {} not found",
                    updated.decision_id
                )))
            })?;
            return Err(anyhow!(CatalogError::Conflict(format!(
                "stale decision version: expected {}, stored {}",
                expected_version, stored.version
            ))));
        }

        if implement_terms {
            let entry = tx
                .query_row(
                    "SELECT entry_id, product_id, product, category, department, divisions_json,
                            audience_json, license_terms, annual_cost, license_count, renewal_date,
                            sso_enabled, mobile_app, enterprise, created_at, updated_at, synced_at
                     FROM catalog_entries
                     WHERE entry_id = ?1",
                    params![updated.entry_id.to_string()],
                    parse_entry_row,
                )
                .optional()
                .context("failed to load entry for terms implementation")?
                .ok_or_else(|| {
                    anyhow!(CatalogError::DataIntegrity(format!(
                        "decision {} references missing entry {}",
                        updated.decision_id, updated.entry_id
                    )))
                })?;

            let applied = apptrack_core::apply_terms(&entry, updated, now_utc());
            update_entry_row(&tx, &applied)?;
        }

        tx.commit().context("failed to commit decision transition")?;

        self.get_decision(updated.decision_id)?
            .ok_or_else(|| anyhow!("renewal decision disappeared after transition"))
    }
}

const DECISION_SELECT: &str = "SELECT decision_id, entry_id, cycle_year, stage, version,
        tally_renew, tally_renew_with_changes, tally_replace, tally_retire, tally_total,
        summary_text, summary_generated_at,
        assessor_recommendation, assessor_comment, assessor_reviewed_at,
        final_decision, approver_comment, decided_at,
        new_annual_cost, new_license_count, new_renewal_date,
        implementation_notes, implemented_at, created_at, updated_at
 FROM renewal_decisions";

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn insert_entry_row(conn: &Connection, entry: &CatalogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO catalog_entries(
            entry_id, product_id, product, identity_key, category, department,
            divisions_json, audience_json, license_terms, annual_cost, license_count,
            renewal_date, sso_enabled, mobile_app, enterprise,
            created_at, updated_at, synced_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15,
            ?16, ?17, ?18
         )",
        params![
            entry.entry_id.to_string(),
            entry.product_id,
            entry.product,
            entry.identity().storage_key(entry.entry_id),
            entry.category,
            entry.department,
            serde_json::to_string(&entry.divisions).context("failed to serialize divisions")?,
            serde_json::to_string(&entry.audience).context("failed to serialize audience")?,
            entry.license_terms,
            entry.annual_cost,
            entry.license_count,
            entry.renewal_date.map(format_date),
            bool_to_sql(entry.sso_enabled),
            bool_to_sql(entry.mobile_app),
            bool_to_sql(entry.enterprise),
            format_rfc3339(entry.created_at).map_err(|err| anyhow!(err))?,
            format_rfc3339(entry.updated_at).map_err(|err| anyhow!(err))?,
            opt_rfc3339(entry.synced_at)?,
        ],
    )
    .context("failed to insert catalog entry")?;
    Ok(())
}

fn update_entry_row(conn: &Connection, entry: &CatalogEntry) -> Result<usize> {
    conn.execute(
        "UPDATE catalog_entries
         SET product_id = ?1, product = ?2, identity_key = ?3, category = ?4,
             department = ?5, divisions_json = ?6, audience_json = ?7, license_terms = ?8,
             annual_cost = ?9, license_count = ?10, renewal_date = ?11,
             sso_enabled = ?12, mobile_app = ?13, enterprise = ?14,
             updated_at = ?15, synced_at = ?16
         WHERE entry_id = ?17",
        params![
            entry.product_id,
            entry.product,
            entry.identity().storage_key(entry.entry_id),
            entry.category,
            entry.department,
            serde_json::to_string(&entry.divisions).context("failed to serialize divisions")?,
            serde_json::to_string(&entry.audience).context("failed to serialize audience")?,
            entry.license_terms,
            entry.annual_cost,
            entry.license_count,
            entry.renewal_date.map(format_date),
            bool_to_sql(entry.sso_enabled),
            bool_to_sql(entry.mobile_app),
            bool_to_sql(entry.enterprise),
            format_rfc3339(entry.updated_at).map_err(|err| anyhow!(err))?,
            opt_rfc3339(entry.synced_at)?,
            entry.entry_id.to_string(),
        ],
    )
    .context("failed to update catalog entry")
}

fn opt_rfc3339(value: Option<time::OffsetDateTime>) -> Result<Option<String>> {
    match value {
        Some(inner) => Ok(Some(format_rfc3339(inner).map_err(|err| anyhow!(err))?)),
        None => Ok(None),
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn column_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn parse_ulid_column(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| column_error(index, format!("invalid ULID: {raw}")))
}

fn parse_utc_column(index: usize, raw: &str) -> rusqlite::Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| column_error(index, err.to_string()))
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let entry_id_raw: String = row.get(0)?;
    let divisions_json: String = row.get(5)?;
    let audience_json: String = row.get(6)?;
    let renewal_date_raw: Option<String> = row.get(10)?;
    let created_at_raw: String = row.get(14)?;
    let updated_at_raw: String = row.get(15)?;
    let synced_at_raw: Option<String> = row.get(16)?;

    let divisions: Vec<String> = serde_json::from_str(&divisions_json)
        .map_err(|err| column_error(5, format!("invalid divisions_json: {err}")))?;
    let audience: Vec<String> = serde_json::from_str(&audience_json)
        .map_err(|err| column_error(6, format!("invalid audience_json: {err}")))?;
    let renewal_date = renewal_date_raw
        .as_deref()
        .map(|raw| parse_date_str(raw).map_err(|err| column_error(10, err.to_string())))
        .transpose()?;
    let synced_at = synced_at_raw
        .as_deref()
        .map(|raw| parse_utc_column(16, raw))
        .transpose()?;

    Ok(CatalogEntry {
        entry_id: EntryId(parse_ulid_column(0, &entry_id_raw)?),
        product_id: row.get(1)?,
        product: row.get(2)?,
        category: row.get(3)?,
        department: row.get(4)?,
        divisions,
        audience,
        license_terms: row.get(7)?,
        annual_cost: row.get(8)?,
        license_count: row.get(9)?,
        renewal_date,
        sso_enabled: row.get::<_, i64>(11)? != 0,
        mobile_app: row.get::<_, i64>(12)? != 0,
        enterprise: row.get::<_, i64>(13)? != 0,
        created_at: parse_utc_column(14, &created_at_raw)?,
        updated_at: parse_utc_column(15, &updated_at_raw)?,
        synced_at,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    let run_id_raw: String = row.get(0)?;
    let direction_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let records_synced: i64 = row.get(3)?;
    let records_failed: i64 = row.get(4)?;
    let started_at_raw: String = row.get(7)?;
    let completed_at_raw: Option<String> = row.get(8)?;

    let direction = SyncDirection::parse(&direction_raw)
        .ok_or_else(|| column_error(1, format!("invalid direction: {direction_raw}")))?;
    let status = SyncStatus::parse(&status_raw)
        .ok_or_else(|| column_error(2, format!("invalid status: {status_raw}")))?;
    let completed_at = completed_at_raw
        .as_deref()
        .map(|raw| parse_utc_column(8, raw))
        .transpose()?;

    Ok(SyncRun {
        run_id: RunId(parse_ulid_column(0, &run_id_raw)?),
        direction,
        status,
        records_synced: u64::try_from(records_synced)
            .map_err(|_| column_error(3, format!("invalid records_synced: {records_synced}")))?,
        records_failed: u64::try_from(records_failed)
            .map_err(|_| column_error(4, format!("invalid records_failed: {records_failed}")))?,
        error_message: row.get(5)?,
        triggered_by: row.get(6)?,
        started_at: parse_utc_column(7, &started_at_raw)?,
        completed_at,
    })
}

fn parse_failure_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncFailure> {
    let run_id_raw: String = row.get(1)?;
    let occurred_at_raw: String = row.get(5)?;

    Ok(SyncFailure {
        failure_seq: row.get(0)?,
        run_id: RunId(parse_ulid_column(1, &run_id_raw)?),
        record_label: row.get(2)?,
        error_kind: row.get(3)?,
        message: row.get(4)?,
        occurred_at: parse_utc_column(5, &occurred_at_raw)?,
    })
}

fn parse_assessment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assessment> {
    let assessment_id_raw: String = row.get(0)?;
    let entry_id_raw: String = row.get(1)?;
    let cycle_year: i64 = row.get(2)?;
    let recommendation_raw: String = row.get(4)?;
    let snapshot_renewal_date_raw: Option<String> = row.get(10)?;
    let status_raw: String = row.get(11)?;
    let submitted_at_raw: String = row.get(12)?;
    let updated_at_raw: String = row.get(13)?;

    let recommendation = Recommendation::parse(&recommendation_raw)
        .ok_or_else(|| column_error(4, format!("invalid recommendation: {recommendation_raw}")))?;
    let status = AssessmentStatus::parse(&status_raw)
        .ok_or_else(|| column_error(11, format!("invalid status: {status_raw}")))?;
    let snapshot_renewal_date = snapshot_renewal_date_raw
        .as_deref()
        .map(|raw| parse_date_str(raw).map_err(|err| column_error(10, err.to_string())))
        .transpose()?;

    Ok(Assessment {
        assessment_id: AssessmentId(parse_ulid_column(0, &assessment_id_raw)?),
        entry_id: EntryId(parse_ulid_column(1, &entry_id_raw)?),
        cycle_year: i32::try_from(cycle_year)
            .map_err(|_| column_error(2, format!("invalid cycle_year: {cycle_year}")))?,
        submitter: row.get(3)?,
        recommendation,
        justification: row.get(5)?,
        usage_notes: row.get(6)?,
        snapshot_license_terms: row.get(7)?,
        snapshot_annual_cost: row.get(8)?,
        snapshot_license_count: row.get(9)?,
        snapshot_renewal_date,
        status,
        submitted_at: parse_utc_column(12, &submitted_at_raw)?,
        updated_at: parse_utc_column(13, &updated_at_raw)?,
    })
}

fn parse_decision_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RenewalDecision> {
    let decision_id_raw: String = row.get(0)?;
    let entry_id_raw: String = row.get(1)?;
    let cycle_year: i64 = row.get(2)?;
    let stage_raw: String = row.get(3)?;
    let summary_generated_at_raw: Option<String> = row.get(11)?;
    let assessor_recommendation_raw: Option<String> = row.get(12)?;
    let assessor_reviewed_at_raw: Option<String> = row.get(14)?;
    let final_decision_raw: Option<String> = row.get(15)?;
    let decided_at_raw: Option<String> = row.get(17)?;
    let new_renewal_date_raw: Option<String> = row.get(20)?;
    let implemented_at_raw: Option<String> = row.get(22)?;
    let created_at_raw: String = row.get(23)?;
    let updated_at_raw: String = row.get(24)?;

    let stage = DecisionStage::parse(&stage_raw)
        .ok_or_else(|| column_error(3, format!("invalid stage: {stage_raw}")))?;
    let assessor_recommendation = assessor_recommendation_raw
        .as_deref()
        .map(|raw| {
            Recommendation::parse(raw)
                .ok_or_else(|| column_error(12, format!("invalid assessor_recommendation: {raw}")))
        })
        .transpose()?;
    let final_decision = final_decision_raw
        .as_deref()
        .map(|raw| {
            Recommendation::parse(raw)
                .ok_or_else(|| column_error(15, format!("invalid final_decision: {raw}")))
        })
        .transpose()?;
    let new_renewal_date = new_renewal_date_raw
        .as_deref()
        .map(|raw| parse_date_str(raw).map_err(|err| column_error(20, err.to_string())))
        .transpose()?;

    let tally = AssessmentTally {
        renew: get_tally(row, 5)?,
        renew_with_changes: get_tally(row, 6)?,
        replace: get_tally(row, 7)?,
        retire: get_tally(row, 8)?,
        total: get_tally(row, 9)?,
    };

    Ok(RenewalDecision {
        decision_id: DecisionId(parse_ulid_column(0, &decision_id_raw)?),
        entry_id: EntryId(parse_ulid_column(1, &entry_id_raw)?),
        cycle_year: i32::try_from(cycle_year)
            .map_err(|_| column_error(2, format!("invalid cycle_year: {cycle_year}")))?,
        stage,
        version: row.get(4)?,
        tally,
        summary_text: row.get(10)?,
        summary_generated_at: summary_generated_at_raw
            .as_deref()
            .map(|raw| parse_utc_column(11, raw))
            .transpose()?,
        assessor_recommendation,
        assessor_comment: row.get(13)?,
        assessor_reviewed_at: assessor_reviewed_at_raw
            .as_deref()
            .map(|raw| parse_utc_column(14, raw))
            .transpose()?,
        final_decision,
        approver_comment: row.get(16)?,
        decided_at: decided_at_raw
            .as_deref()
            .map(|raw| parse_utc_column(17, raw))
            .transpose()?,
        new_annual_cost: row.get(18)?,
        new_license_count: row.get(19)?,
        new_renewal_date,
        implementation_notes: row.get(21)?,
        implemented_at: implemented_at_raw
            .as_deref()
            .map(|raw| parse_utc_column(22, raw))
            .transpose()?,
        created_at: parse_utc_column(23, &created_at_raw)?,
        updated_at: parse_utc_column(24, &updated_at_raw)?,
    })
}

fn get_tally(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    u64::try_from(value).map_err(|_| column_error(index, format!("invalid tally: {value}")))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrack_core::IdentityKey;

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:?}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_store() -> SqliteCatalogStore {
        let store = must(SqliteCatalogStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn fixture_draft(product: &str, product_id: Option<&str>) -> CatalogDraft {
        CatalogDraft {
            product_id: product_id.map(ToString::to_string),
            product: Some(product.to_string()),
            category: Some("Curriculum".to_string()),
            department: Some("Mathematics".to_string()),
            annual_cost: Some(5000.0),
            license_count: Some(250),
            sso_enabled: Some(true),
            ..CatalogDraft::default()
        }
    }

    fn seed_entry_row(
        store: &SqliteCatalogStore,
        entry_id: &str,
        product: &str,
        product_id: Option<&str>,
        created_at: &str,
    ) {
        let parsed = must(Ulid::from_string(entry_id));
        let identity = IdentityKey::resolve(product_id, product);
        let storage_key = identity.storage_key(EntryId(parsed));
        let inserted = store.connection().execute(
            "INSERT INTO catalog_entries(
                entry_id, product_id, product, identity_key,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![entry_id, product_id, product, storage_key, created_at],
        );
        must(inserted);
    }

    #[test]
    fn upsert_inserts_then_updates_then_reports_unchanged() {
        let mut store = fixture_store();

        let (first, outcome) = must(store.upsert_by_identity(&fixture_draft("Math Blaster", Some("APP-001"))));
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert!(first.synced_at.is_some());

        let mut changed = fixture_draft("Math Blaster", Some("APP-001"));
        changed.annual_cost = Some(6000.0);
        let (second, outcome) = must(store.upsert_by_identity(&changed));
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(second.entry_id, first.entry_id);
        assert_eq!(second.annual_cost, Some(6000.0));

        let (third, outcome) = must(store.upsert_by_identity(&changed));
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(third.entry_id, first.entry_id);
        assert_eq!(third.updated_at, second.updated_at);
        assert_eq!(must(store.count_entries()), 1);
    }

    #[test]
    fn upsert_keeps_canonical_values_when_draft_is_sparse() {
        let mut store = fixture_store();
        let (first, _) = must(store.upsert_by_identity(&fixture_draft("Math Blaster", Some("APP-001"))));

        let sparse = CatalogDraft {
            product_id: Some("APP-001".to_string()),
            license_count: Some(300),
            ..CatalogDraft::default()
        };
        let (second, outcome) = must(store.upsert_by_identity(&sparse));
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(second.product, first.product);
        assert_eq!(second.annual_cost, first.annual_cost);
        assert_eq!(second.license_count, Some(300));
    }

    #[test]
    fn upsert_rejects_unresolvable_records() {
        let mut store = fixture_store();
        let blank = CatalogDraft::default();
        let err = match store.upsert_by_identity(&blank) {
            Ok(_) => panic!("expected unresolvable record to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("data integrity"));
    }

    #[test]
    fn upsert_targets_earliest_created_row_when_key_is_duplicated() {
        let mut store = fixture_store();
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "Math Blaster",
            None,
            "2026-01-05T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "math blaster",
            None,
            "2026-01-01T00:00:00Z",
        );

        let draft = CatalogDraft {
            product: Some("Math Blaster".to_string()),
            annual_cost: Some(750.0),
            ..CatalogDraft::default()
        };
        let (entry, outcome) = must(store.upsert_by_identity(&draft));
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(entry.entry_id.to_string(), "01J0SQQP7M70P6Y3R4T8D8G8M3");
        assert_eq!(must(store.count_entries()), 2);
    }

    #[test]
    fn duplicate_scan_picks_earliest_survivor_regardless_of_insert_order() {
        let store = fixture_store();
        // Inserted newest-first to show ordering comes from created_at.
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M4",
            "Reading Eggs",
            None,
            "2026-03-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "Reading  Eggs",
            None,
            "2026-01-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "reading eggs",
            None,
            "2026-02-01T00:00:00Z",
        );

        let report = must(store.find_duplicate_groups());
        assert_eq!(report.total_apps, 3);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.total_duplicates, 2);

        let group = &report.duplicates[0];
        assert_eq!(group.keep_id.to_string(), "01J0SQQP7M70P6Y3R4T8D8G8M2");
        assert_eq!(group.count, 3);
        assert_eq!(group.remove_ids.len(), 2);
        assert!(!group.remove_ids.contains(&group.keep_id));
    }

    #[test]
    fn duplicate_survivor_ties_break_on_lowest_entry_id() {
        let store = fixture_store();
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M9",
            "Typing Club",
            None,
            "2026-01-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M1",
            "Typing Club",
            None,
            "2026-01-01T00:00:00Z",
        );

        let report = must(store.find_duplicate_groups());
        assert_eq!(report.duplicates[0].keep_id.to_string(), "01J0SQQP7M70P6Y3R4T8D8G8M1");
    }

    #[test]
    fn unresolvable_rows_are_reported_not_grouped() {
        let store = fixture_store();
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "  ",
            None,
            "2026-01-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "",
            None,
            "2026-01-02T00:00:00Z",
        );

        let report = must(store.find_duplicate_groups());
        assert_eq!(report.duplicate_groups, 0);
        assert_eq!(report.unresolvable_count, 2);
        assert_eq!(report.unresolvable_labels.len(), 2);
    }

    #[test]
    fn remove_duplicates_isolates_group_failures() {
        let mut store = fixture_store();
        // Group one: removable.
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "Reading Eggs",
            None,
            "2026-01-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "reading eggs",
            None,
            "2026-02-01T00:00:00Z",
        );
        // Group two: the non-survivor carries an assessment, so the foreign
        // key blocks its deletion and the group must fail alone.
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M4",
            "Typing Club",
            None,
            "2026-01-01T00:00:00Z",
        );
        seed_entry_row(
            &store,
            "01J0SQQP7M70P6Y3R4T8D8G8M5",
            "typing club",
            None,
            "2026-02-01T00:00:00Z",
        );
        let blocked = must(store.insert_assessment(&AssessmentInput {
            entry_id: EntryId(must(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M5"))),
            cycle_year: 2026,
            submitter: "li.chen".to_string(),
            recommendation: Recommendation::Renew,
            justification: None,
            usage_notes: None,
        }));
        assert_eq!(blocked.status, AssessmentStatus::Submitted);

        let report = must(store.remove_duplicates());
        assert_eq!(report.groups_processed, 1);
        assert_eq!(report.removed_count, 1);
        assert_eq!(report.group_errors.len(), 1);
        assert!(report.message.contains("1 groups failed"));

        // The failed group kept both rows, survivor included.
        assert_eq!(must(store.count_entries()), 3);
        let remaining = must(store.find_duplicate_groups());
        assert_eq!(remaining.duplicate_groups, 1);
    }

    #[test]
    fn sync_run_lifecycle_seals_and_freezes() {
        let mut store = fixture_store();
        let run = must(store.create_sync_run(SyncDirection::Pull, "scheduler"));
        assert_eq!(run.status, SyncStatus::Pending);

        must(store.mark_run_in_progress(run.run_id));
        let sealed = must(store.seal_sync_run(run.run_id, SyncStatus::Completed, 48, 2, None));
        assert_eq!(sealed.status, SyncStatus::Completed);
        assert_eq!(sealed.records_synced, 48);
        assert_eq!(sealed.records_failed, 2);
        assert!(sealed.completed_at.is_some());

        let reseal = store.seal_sync_run(run.run_id, SyncStatus::Failed, 0, 0, Some("late"));
        let err = match reseal {
            Ok(_) => panic!("expected sealed run to reject another seal"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("conflict"));

        let direct = store.connection().execute(
            "UPDATE sync_runs SET records_synced = 99 WHERE run_id = ?1",
            params![run.run_id.to_string()],
        );
        let err = match direct {
            Ok(_) => panic!("expected sealed-run trigger to fire"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("sealed"));

        let delete = store
            .connection()
            .execute("DELETE FROM sync_runs WHERE run_id = ?1", params![run.run_id.to_string()]);
        let err = match delete {
            Ok(_) => panic!("expected append-only trigger to fire"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("append-only"));
    }

    #[test]
    fn sync_failures_are_append_only_and_listable() {
        let mut store = fixture_store();
        let run = must(store.create_sync_run(SyncDirection::Pull, "tester"));
        must(store.record_sync_failure(run.run_id, "Math Blaster", "data_integrity", "identity unresolvable"));
        must(store.record_sync_failure(run.run_id, "Typing Club", "transient_io", "write timed out"));

        let failures = must(store.list_sync_failures(run.run_id));
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].record_label, "Math Blaster");
        assert_eq!(failures[0].error_kind, "data_integrity");
        assert!(failures[0].failure_seq < failures[1].failure_seq);

        let tamper = store.connection().execute(
            "UPDATE sync_failures SET message = 'edited' WHERE failure_seq = ?1",
            params![failures[0].failure_seq],
        );
        let err = match tamper {
            Ok(_) => panic!("expected append-only trigger to fire"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("append-only"));
    }

    #[test]
    fn assessment_snapshot_survives_later_entry_edits() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));

        let assessment = must(store.insert_assessment(&AssessmentInput {
            entry_id: entry.entry_id,
            cycle_year: 2026,
            submitter: "li.chen".to_string(),
            recommendation: Recommendation::Renew,
            justification: Some("used weekly".to_string()),
            usage_notes: None,
        }));
        assert_eq!(assessment.snapshot_annual_cost, Some(5000.0));

        let mut edited = entry.clone();
        edited.annual_cost = Some(9000.0);
        must(store.update_entry(&edited));

        let reloaded = must_some(must(store.get_assessment(assessment.assessment_id)));
        assert_eq!(reloaded.snapshot_annual_cost, Some(5000.0));
    }

    #[test]
    fn assessment_snapshot_columns_are_frozen_by_trigger() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));
        let assessment = must(store.insert_assessment(&AssessmentInput {
            entry_id: entry.entry_id,
            cycle_year: 2026,
            submitter: "li.chen".to_string(),
            recommendation: Recommendation::Renew,
            justification: None,
            usage_notes: None,
        }));

        let tamper = store.connection().execute(
            "UPDATE assessments SET recommendation = 'retire' WHERE assessment_id = ?1",
            params![assessment.assessment_id.to_string()],
        );
        let err = match tamper {
            Ok(_) => panic!("expected frozen-snapshot trigger to fire"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("frozen"));

        let updated = must(store.update_assessment_status(
            assessment.assessment_id,
            AssessmentStatus::InReview,
        ));
        assert_eq!(updated.status, AssessmentStatus::InReview);
    }

    #[test]
    fn ensure_decision_is_lazy_and_unique_per_cycle() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));

        let first = must(store.ensure_decision(entry.entry_id, 2026));
        let second = must(store.ensure_decision(entry.entry_id, 2026));
        assert_eq!(first.decision_id, second.decision_id);
        assert_eq!(first.stage, DecisionStage::Collecting);
        assert_eq!(first.version, 1);

        let other_cycle = must(store.ensure_decision(entry.entry_id, 2027));
        assert_ne!(other_cycle.decision_id, first.decision_id);
    }

    #[test]
    fn tally_refresh_recomputes_from_assessments() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));
        let decision = must(store.ensure_decision(entry.entry_id, 2026));

        for (submitter, recommendation) in [
            ("a", Recommendation::Renew),
            ("b", Recommendation::Renew),
            ("c", Recommendation::Replace),
        ] {
            let _ = must(store.insert_assessment(&AssessmentInput {
                entry_id: entry.entry_id,
                cycle_year: 2026,
                submitter: submitter.to_string(),
                recommendation,
                justification: None,
                usage_notes: None,
            }));
        }

        let refreshed = must(store.refresh_decision_tally(decision.decision_id));
        assert_eq!(refreshed.tally.renew, 2);
        assert_eq!(refreshed.tally.replace, 1);
        assert_eq!(refreshed.tally.total, 3);
        assert_eq!(refreshed.version, 1);

        // Refreshing again changes nothing: the tallies are recomputed, not
        // incremented.
        let again = must(store.refresh_decision_tally(decision.decision_id));
        assert_eq!(again.tally, refreshed.tally);
    }

    #[test]
    fn persist_transition_bumps_version_and_rejects_stale_writers() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));
        let decision = must(store.ensure_decision(entry.entry_id, 2026));

        let mut advanced = decision.clone();
        advanced.stage = DecisionStage::AssessorReview;
        advanced.version = decision.version + 1;
        advanced.updated_at = now_utc();
        let stored = must(store.persist_transition(&advanced, decision.version, false));
        assert_eq!(stored.stage, DecisionStage::AssessorReview);
        assert_eq!(stored.version, 2);

        // A second writer still holding version 1 must lose.
        let mut rival = decision.clone();
        rival.stage = DecisionStage::AssessorReview;
        rival.version = decision.version + 1;
        rival.updated_at = now_utc();
        let err = match store.persist_transition(&rival, decision.version, false) {
            Ok(_) => panic!("expected stale transition to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("stale decision version"));

        let unchanged = must_some(must(store.get_decision(decision.decision_id)));
        assert_eq!(unchanged.version, 2);
        assert_eq!(unchanged.stage, DecisionStage::AssessorReview);
    }

    #[test]
    fn implement_applies_terms_to_entry_in_same_transaction() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));
        let decision = must(store.ensure_decision(entry.entry_id, 2026));

        let mut implemented = decision.clone();
        implemented.stage = DecisionStage::Implemented;
        implemented.version = decision.version + 1;
        implemented.final_decision = Some(Recommendation::RenewWithChanges);
        implemented.new_annual_cost = Some(12000.0);
        implemented.implementation_notes = Some("po issued".to_string());
        implemented.implemented_at = Some(now_utc());
        implemented.updated_at = now_utc();

        let stored = must(store.persist_transition(&implemented, decision.version, true));
        assert_eq!(stored.stage, DecisionStage::Implemented);

        let updated_entry = must_some(must(store.get_entry(entry.entry_id)));
        assert_eq!(updated_entry.annual_cost, Some(12000.0));
        assert_eq!(updated_entry.license_count, entry.license_count);
        assert!(updated_entry.updated_at > entry.updated_at);
    }

    #[test]
    fn final_decision_is_frozen_once_implemented() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));
        let decision = must(store.ensure_decision(entry.entry_id, 2026));

        let mut implemented = decision.clone();
        implemented.stage = DecisionStage::Implemented;
        implemented.version = decision.version + 1;
        implemented.final_decision = Some(Recommendation::Renew);
        implemented.implementation_notes = Some("done".to_string());
        implemented.implemented_at = Some(now_utc());
        implemented.updated_at = now_utc();
        let _ = must(store.persist_transition(&implemented, decision.version, false));

        let tamper = store.connection().execute(
            "UPDATE renewal_decisions SET final_decision = 'retire' WHERE decision_id = ?1",
            params![decision.decision_id.to_string()],
        );
        let err = match tamper {
            Ok(_) => panic!("expected final-decision trigger to fire"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn schema_contract_contains_expected_tables_columns_and_triggers() {
        let store = fixture_store();

        for table in [
            "catalog_entries",
            "sync_runs",
            "sync_failures",
            "assessments",
            "renewal_decisions",
            "schema_migrations",
        ] {
            let exists: Option<i64> = must(
                store
                    .connection()
                    .query_row(
                        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        params![table],
                        |row| row.get(0),
                    )
                    .optional(),
            );
            assert!(exists.is_some(), "missing table {table}");
        }

        let triggers: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'trigger'
               AND name IN (
                 'trg_sync_runs_sealed',
                 'trg_sync_runs_no_delete',
                 'trg_sync_failures_no_update',
                 'trg_sync_failures_no_delete',
                 'trg_assessments_frozen',
                 'trg_renewal_decisions_final_frozen'
               )",
            [],
            |row| row.get(0),
        ));
        assert_eq!(triggers, 6);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let entry = must(store.insert_entry(&fixture_draft("Math Blaster", Some("APP-001"))));

        must(store.migrate());
        let reloaded = must_some(must(store.get_entry(entry.entry_id)));
        assert_eq!(reloaded.product, "Math Blaster");
        assert_eq!(must(store.count_entries()), 1);
    }

    #[test]
    fn schema_version_tracks_applied_migrations() {
        let store = must(SqliteCatalogStore::open_in_memory());
        assert_eq!(must(store.schema_version()), 0);

        must(store.migrate());
        assert_eq!(must(store.schema_version()), CATALOG_MIGRATION_VERSION);

        must(store.migrate());
        assert_eq!(must(store.schema_version()), CATALOG_MIGRATION_VERSION);
    }

    #[test]
    fn sqlite_busy_timeout_allows_write_after_lock_release() {
        let db_path = std::env::temp_dir().join(format!("apptrack-lock-test-{}.sqlite3", Ulid::new()));

        let setup = must(SqliteCatalogStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = must(Connection::open(&db_path));
        must(lock_conn.execute_batch("BEGIN IMMEDIATE;"));

        let write_path = db_path.clone();
        let handle = std::thread::spawn(move || {
            let mut store = match SqliteCatalogStore::open(&write_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open writer store: {err}"),
            };
            store.upsert_by_identity(&CatalogDraft {
                product: Some("Lock Test".to_string()),
                ..CatalogDraft::default()
            })
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        must(lock_conn.execute_batch("COMMIT;"));

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("writer thread join failed: {err:?}"),
        };
        assert!(result.is_ok(), "write should succeed after lock release: {:?}", result.err());

        let _ = std::fs::remove_file(&db_path);
    }
}

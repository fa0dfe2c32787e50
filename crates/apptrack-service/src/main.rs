use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use apptrack_core::{
    parse_date_str, ActorRole, Assessment, AssessmentInput, CatalogDraft, CatalogEntry,
    CatalogError, DecisionAction, EntryId, Recommendation, RenewalDecision, RunId, SyncDirection,
    SyncFailure, SyncRun, TransitionInput,
};
use apptrack_renewal::{
    decision_view, submit_assessment, DecisionView, HttpSummaryConfig, HttpSummaryProvider,
    MockSummaryProvider, RenewalWorkflow,
};
use apptrack_store_sqlite::{DuplicateReport, RemovalReport, SqliteCatalogStore};
use apptrack_sync::{
    ExternalStore, FileExternalStore, HttpExternalStore, HttpStoreConfig, SyncEngine,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DEFAULT_SYNC_RUN_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    kind: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct SyncTriggerRequest {
    direction: SyncDirection,
    source_file: Option<PathBuf>,
    source_url: Option<String>,
    source_timeout_ms: Option<u64>,
    source_bearer_env: Option<String>,
    triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SyncRunView {
    run: SyncRun,
    failures: Vec<SyncFailure>,
}

#[derive(Debug, Clone, Deserialize)]
struct AdvanceRequest {
    action: DecisionAction,
    actor: String,
    actor_role: ActorRole,
    expected_version: i64,
    assessor_recommendation: Option<Recommendation>,
    assessor_comment: Option<String>,
    final_decision: Option<Recommendation>,
    approver_comment: Option<String>,
    new_annual_cost: Option<f64>,
    new_license_count: Option<i64>,
    new_renewal_date: Option<String>,
    implementation_notes: Option<String>,
    summary_url: Option<String>,
    summary_timeout_ms: Option<u64>,
    summary_bearer_env: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AssessmentSubmitView {
    assessment: Assessment,
    decision: RenewalDecision,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    sync_runs_total: AtomicU64,
    decision_transitions_total: AtomicU64,
    request_invalid_total: AtomicU64,
    validation_error_total: AtomicU64,
    authorization_error_total: AtomicU64,
    write_conflict_total: AtomicU64,
    not_found_total: AtomicU64,
    transient_io_total: AtomicU64,
    data_integrity_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    sync_runs_total: u64,
    decision_transitions_total: u64,
    request_invalid_total: u64,
    validation_error_total: u64,
    authorization_error_total: u64,
    write_conflict_total: u64,
    not_found_total: u64,
    transient_io_total: u64,
    data_integrity_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    schema_version: i64,
    entries: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "apptrack-service")]
#[command(about = "Local HTTP service for the school application catalog")]
struct Args {
    #[arg(long, default_value = "./apptrack.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4015")]
    bind: SocketAddr,
    /// Ceiling for one store operation. Sync sources and summary providers
    /// may hold a slow upstream for up to their own 30s default, so this
    /// leaves headroom above that.
    #[arg(long, default_value_t = 35_000)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                kind: self.kind,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        kind: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, kind, message: message.into(), details }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("request_invalid", false);
        Self::failure(
            rejection.status(),
            "request_invalid",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn classify_store_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_kind: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("validation error") {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }
        if normalized.contains("authorization error") {
            return Self::failure(StatusCode::FORBIDDEN, "authorization_error", message, None);
        }
        if normalized.contains("conflict error")
            || normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }
        if normalized.contains("data integrity error") {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "data_integrity",
                message,
                None,
            );
        }
        if normalized.contains("not found") {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }
        if normalized.contains("transient io error")
            || normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("schema")
        {
            return Self::failure(StatusCode::SERVICE_UNAVAILABLE, "transient_io", message, None);
        }

        Self::failure(default_status, default_kind, message, None)
    }

    /// Runs one store operation on the blocking pool under the service
    /// timeout. Every request opens its own connection; the migration is
    /// idempotent, so a fresh database is provisioned on first touch.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_kind: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteCatalogStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut store = SqliteCatalogStore::open(&db_path)?;
            store.migrate()?;
            op(&mut store)
        });
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_kind, true);
                Self::failure(
                    default_status,
                    default_kind,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_store_error(&err, default_status, default_kind);
                self.telemetry.record_failure(failure.kind, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, kind: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match kind {
            "request_invalid" => {
                self.request_invalid_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "authorization_error" => {
                self.authorization_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "transient_io" => {
                self.transient_io_total.fetch_add(1, Ordering::Relaxed);
            }
            "data_integrity" => {
                self.data_integrity_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            sync_runs_total: self.sync_runs_total.load(Ordering::Relaxed),
            decision_transitions_total: self.decision_transitions_total.load(Ordering::Relaxed),
            request_invalid_total: self.request_invalid_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            authorization_error_total: self.authorization_error_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            transient_io_total: self.transient_io_total.load(Ordering::Relaxed),
            data_integrity_total: self.data_integrity_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/readyz", get(readyz))
        .route("/v1/telemetry", get(telemetry))
        .route("/v1/entries", post(entries_create).get(entries_list))
        .route("/v1/entries/:entry_id", get(entries_show))
        .route("/v1/sync/runs", post(sync_trigger).get(sync_runs_list))
        .route("/v1/sync/runs/:run_id/failures", get(sync_run_failures))
        .route("/v1/duplicates", get(duplicates_check))
        .route("/v1/duplicates/remove", post(duplicates_remove))
        .route("/v1/assessments", post(assessments_submit))
        .route("/v1/decisions/:entry_id/:cycle_year", get(decisions_show))
        .route("/v1/decisions/:entry_id/:cycle_year/advance", post(decisions_advance))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState {
        db_path: args.db,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse { status: "ok", timeout_ms }))
}

async fn readyz(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let checks = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "transient_io",
            "readiness_probe",
            |store| {
                Ok(ReadinessChecks {
                    schema_version: store.schema_version()?,
                    entries: store.count_entries()?,
                })
            },
        )
        .await?;
    Ok(Json(envelope(ReadinessResponse { status: "ready", checks })))
}

async fn telemetry(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<ServiceTelemetrySnapshot>> {
    Json(envelope(state.telemetry.snapshot()))
}

async fn entries_create(
    State(state): State<ServiceState>,
    payload: Result<Json<CatalogDraft>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CatalogEntry>>, ServiceFailure> {
    let Json(draft) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let entry = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "entry_create",
            move |store| store.insert_entry(&draft),
        )
        .await?;
    Ok(Json(envelope(entry)))
}

async fn entries_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<CatalogEntry>>>, ServiceFailure> {
    let entries = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "entry_list",
            move |store| {
                let mut entries = store.list_entries()?;
                if let Some(limit) = query.limit {
                    entries.truncate(limit);
                }
                Ok(entries)
            },
        )
        .await?;
    Ok(Json(envelope(entries)))
}

async fn entries_show(
    State(state): State<ServiceState>,
    Path(entry_id): Path<String>,
) -> Result<Json<ServiceEnvelope<CatalogEntry>>, ServiceFailure> {
    let entry = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "entry_show",
            move |store| {
                let parsed = EntryId(parse_ulid(&entry_id, "entry id")?);
                store
                    .get_entry(parsed)?
                    .ok_or_else(|| anyhow!("catalog entry not found: {entry_id}"))
            },
        )
        .await?;
    Ok(Json(envelope(entry)))
}

async fn sync_trigger(
    State(state): State<ServiceState>,
    payload: Result<Json<SyncTriggerRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SyncRunView>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let view = state
        .run_blocking(StatusCode::SERVICE_UNAVAILABLE, "transient_io", "sync_run", move |store| {
            let mut external = build_external_store(&request)?;
            let triggered_by = request.triggered_by.as_deref().unwrap_or("service");
            let run =
                SyncEngine::new(external.as_mut()).run_sync(store, request.direction, triggered_by)?;
            let failures = store.list_sync_failures(run.run_id)?;
            Ok(SyncRunView { run, failures })
        })
        .await?;
    state.telemetry.sync_runs_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(envelope(view)))
}

async fn sync_runs_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<SyncRun>>>, ServiceFailure> {
    let runs = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "sync_run_list",
            move |store| store.list_sync_runs(Some(query.limit.unwrap_or(DEFAULT_SYNC_RUN_LIMIT))),
        )
        .await?;
    Ok(Json(envelope(runs)))
}

async fn sync_run_failures(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<SyncFailure>>>, ServiceFailure> {
    let failures = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "sync_failure_list",
            move |store| {
                let parsed = RunId(parse_ulid(&run_id, "run id")?);
                store.list_sync_failures(parsed)
            },
        )
        .await?;
    Ok(Json(envelope(failures)))
}

async fn duplicates_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DuplicateReport>>, ServiceFailure> {
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "duplicate_check",
            |store| store.find_duplicate_groups(),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn duplicates_remove(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RemovalReport>>, ServiceFailure> {
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "duplicate_remove",
            |store| store.remove_duplicates(),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn assessments_submit(
    State(state): State<ServiceState>,
    payload: Result<Json<AssessmentInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AssessmentSubmitView>>, ServiceFailure> {
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "assessment_submit",
            move |store| {
                let (assessment, decision) = submit_assessment(store, &input)?;
                Ok(AssessmentSubmitView { assessment, decision })
            },
        )
        .await?;
    Ok(Json(envelope(view)))
}

async fn decisions_show(
    State(state): State<ServiceState>,
    Path((entry_id, cycle_year)): Path<(String, i32)>,
) -> Result<Json<ServiceEnvelope<DecisionView>>, ServiceFailure> {
    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "decision_show",
            move |store| {
                let parsed = EntryId(parse_ulid(&entry_id, "entry id")?);
                decision_view(store, parsed, cycle_year)
            },
        )
        .await?;
    Ok(Json(envelope(view)))
}

async fn decisions_advance(
    State(state): State<ServiceState>,
    Path((entry_id, cycle_year)): Path<(String, i32)>,
    payload: Result<Json<AdvanceRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RenewalDecision>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let decision = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "decision_advance",
            move |store| apply_transition(store, &entry_id, cycle_year, request),
        )
        .await?;
    state.telemetry.decision_transitions_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(envelope(decision)))
}

fn parse_ulid(raw: &str, label: &str) -> Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| {
        anyhow!(CatalogError::Validation(format!("invalid {label} '{raw}': {err}")))
    })
}

fn build_external_store(request: &SyncTriggerRequest) -> Result<Box<dyn ExternalStore>> {
    match (&request.source_file, &request.source_url) {
        (Some(path), None) => Ok(Box::new(FileExternalStore::new(path))),
        (None, Some(url)) => {
            let mut config = HttpStoreConfig::new(url);
            if let Some(timeout_ms) = request.source_timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            config.auth_bearer_env = request.source_bearer_env.clone();
            Ok(Box::new(HttpExternalStore::new(config)))
        }
        _ => Err(anyhow!(CatalogError::Validation(
            "exactly one of source_file or source_url must be set".to_string()
        ))),
    }
}

fn apply_transition(
    store: &mut SqliteCatalogStore,
    entry_id: &str,
    cycle_year: i32,
    request: AdvanceRequest,
) -> Result<RenewalDecision> {
    let AdvanceRequest {
        action,
        actor,
        actor_role,
        expected_version,
        assessor_recommendation,
        assessor_comment,
        final_decision,
        approver_comment,
        new_annual_cost,
        new_license_count,
        new_renewal_date,
        implementation_notes,
        summary_url,
        summary_timeout_ms,
        summary_bearer_env,
    } = request;

    let entry_id = EntryId(parse_ulid(entry_id, "entry id")?);
    let new_renewal_date = new_renewal_date
        .as_deref()
        .map(parse_date_str)
        .transpose()
        .map_err(|err| anyhow!(err))?;
    let input = TransitionInput {
        action,
        actor,
        actor_role,
        expected_version,
        assessor_recommendation,
        assessor_comment,
        final_decision,
        approver_comment,
        new_annual_cost,
        new_license_count,
        new_renewal_date,
        implementation_notes,
    };

    match summary_url.as_deref() {
        Some(url) => {
            let mut config = HttpSummaryConfig::new(url);
            if let Some(timeout_ms) = summary_timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            config.auth_bearer_env = summary_bearer_env;
            let provider = HttpSummaryProvider::new(config);
            RenewalWorkflow::new(&provider).advance(store, entry_id, cycle_year, &input)
        }
        None => {
            let provider = MockSummaryProvider::new();
            RenewalWorkflow::new(&provider).advance(store, entry_id, cycle_year, &input)
        }
    }
}

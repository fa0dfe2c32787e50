#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use apptrack_core::{
    aggregate_assessments, now_utc, plan_transition, Assessment, AssessmentInput, AssessmentTally,
    CatalogError, DecisionAction, DecisionStage, EntryId, RenewalDecision, TransitionInput,
};
use apptrack_store_sqlite::SqliteCatalogStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MOCK_PROVIDER_VERSION: &str = "mock.v1";

/// Everything a provider needs to write the review summary for one decision:
/// the product, the cycle, and the raw assessments with their tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub product: String,
    pub cycle_year: i32,
    pub tally: AssessmentTally,
    pub assessments: Vec<Assessment>,
}

/// Generates the narrative summary shown to the assessor. Implementations
/// must be side-effect free from the workflow's point of view: the caller
/// persists nothing until `summarize` returns `Ok`.
pub trait SummaryProvider {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn summarize(&self, request: &SummaryRequest) -> Result<String>;
}

/// Offline provider for tests and air-gapped installs. Output is a pure
/// function of the request, so retried summary requests produce identical
/// text.
#[derive(Debug, Default)]
pub struct MockSummaryProvider {
    fail: bool,
}

impl MockSummaryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that refuses every request, for exercising the
    /// nothing-persisted-on-failure path.
    #[must_use]
    pub fn failing() -> Self {
        Self { fail: true }
    }

    fn deterministic_token(request: &SummaryRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.product.as_bytes());
        hasher.update(request.cycle_year.to_le_bytes());
        for assessment in &request.assessments {
            hasher.update(assessment.submitter.as_bytes());
            hasher.update(assessment.recommendation.as_str().as_bytes());
        }
        hasher.update(MOCK_PROVIDER_VERSION.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest.chars().take(16).collect()
    }
}

impl SummaryProvider for MockSummaryProvider {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        if self.fail {
            return Err(anyhow!(CatalogError::TransientIo(
                "summary provider unavailable".to_string()
            )));
        }

        let token = Self::deterministic_token(request);
        Ok(format!(
            "{} {}: {} assessments (renew {}, renew_with_changes {}, replace {}, retire {}). [{token}]",
            request.product,
            request.cycle_year,
            request.tally.total,
            request.tally.renew,
            request.tally.renew_with_changes,
            request.tally.replace,
            request.tally.retire,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct HttpSummaryConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Name of the environment variable holding the bearer token. The token
    /// itself never appears in config files.
    pub auth_bearer_env: Option<String>,
}

impl HttpSummaryConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: 30_000,
            auth_bearer_env: None,
        }
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        let Some(env_name) = self.auth_bearer_env.as_deref() else {
            return Ok(None);
        };
        let token = std::env::var(env_name).map_err(|_| {
            anyhow!(CatalogError::Validation(format!(
                "missing env var '{env_name}' named by auth_bearer_env"
            )))
        })?;
        Ok(Some(token))
    }
}

/// POSTs the request as JSON and expects `{"summary": "..."}` back. Any
/// HTTP-level failure maps to a transient error so the decision stays in
/// collecting and the request can be retried.
pub struct HttpSummaryProvider {
    config: HttpSummaryConfig,
}

impl HttpSummaryProvider {
    #[must_use]
    pub fn new(config: HttpSummaryConfig) -> Self {
        Self { config }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build()
    }
}

impl SummaryProvider for HttpSummaryProvider {
    fn provider_name(&self) -> &'static str {
        "http"
    }

    fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        // Resolve credentials before the request so a misconfigured install
        // fails loudly instead of sending unauthenticated calls.
        let token = self.config.bearer_token()?;
        let payload =
            serde_json::to_value(request).context("failed to encode summary request as json")?;

        let mut http_request = self
            .agent()
            .post(&self.config.url)
            .set("content-type", "application/json");
        if let Some(token) = token.as_deref() {
            http_request = http_request.set("authorization", &format!("Bearer {token}"));
        }

        let response = match http_request.send_json(payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!(CatalogError::TransientIo(format!(
                    "summary endpoint returned http status {code}"
                ))))
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!(CatalogError::TransientIo(format!(
                    "summary endpoint transport failure: {err}"
                ))))
            }
        };

        let body: serde_json::Value = response
            .into_json()
            .context("failed to decode summary response as json")?;
        let summary = body
            .get("summary")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                anyhow!(CatalogError::DataIntegrity(
                    "summary response missing string field 'summary'".to_string()
                ))
            })?;
        Ok(summary.to_string())
    }
}

/// One decision with the assessments behind it, for display surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionView {
    pub decision: RenewalDecision,
    pub assessments: Vec<Assessment>,
}

/// Records one staff assessment for the entry's renewal cycle. Creates the
/// cycle's decision record on first submission; later submissions join it.
/// The decision's tally is recomputed from the stored rows, never
/// incremented, so a retried submission cannot skew it.
///
/// # Errors
/// Returns [`CatalogError::Validation`] for bad input or an unknown entry and
/// [`CatalogError::Conflict`] once the decision has left the collecting
/// stage.
pub fn submit_assessment(
    store: &mut SqliteCatalogStore,
    input: &AssessmentInput,
) -> Result<(Assessment, RenewalDecision)> {
    input.validate().map_err(|err| anyhow!(err))?;

    let decision = store.ensure_decision(input.entry_id, input.cycle_year)?;
    if decision.stage != DecisionStage::Collecting {
        return Err(anyhow!(CatalogError::Conflict(format!(
            "assessment window for cycle {} closed at stage {}",
            input.cycle_year,
            decision.stage.as_str()
        ))));
    }

    let assessment = store.insert_assessment(input)?;
    let decision = store.refresh_decision_tally(decision.decision_id)?;
    Ok((assessment, decision))
}

/// The decision with a fresh tally and its assessments.
///
/// # Errors
/// Returns [`CatalogError::Validation`] when no decision exists for the
/// entry and cycle.
pub fn decision_view(
    store: &mut SqliteCatalogStore,
    entry_id: EntryId,
    cycle_year: i32,
) -> Result<DecisionView> {
    let decision = store
        .get_decision_for(entry_id, cycle_year)?
        .ok_or_else(|| {
            anyhow!(CatalogError::Validation(format!(
                "no renewal decision for entry {entry_id} in cycle {cycle_year}"
            )))
        })?;
    let decision = store.refresh_decision_tally(decision.decision_id)?;
    let assessments = store.list_assessments(entry_id, cycle_year)?;
    Ok(DecisionView {
        decision,
        assessments,
    })
}

/// Drives renewal decisions through their stages against a store, with the
/// summary provider injected so the review pipeline runs the same against
/// the mock and a real endpoint.
pub struct RenewalWorkflow<'a> {
    summary_provider: &'a dyn SummaryProvider,
}

impl<'a> RenewalWorkflow<'a> {
    pub fn new(summary_provider: &'a dyn SummaryProvider) -> Self {
        Self { summary_provider }
    }

    /// Applies one transition and returns the decision as stored afterwards.
    ///
    /// A retry of an already-applied action is answered with the stored
    /// decision when its recorded values match the input, and a conflict
    /// when they do not; nothing is written either way. A fresh action with
    /// a version other than the stored one is a conflict.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] for bad input or a missing
    /// decision, [`CatalogError::Authorization`] when the actor's role does
    /// not satisfy the action's gate, [`CatalogError::Conflict`] for a stage
    /// or version mismatch, and [`CatalogError::TransientIo`] when the
    /// summary provider is unavailable.
    pub fn advance(
        &self,
        store: &mut SqliteCatalogStore,
        entry_id: EntryId,
        cycle_year: i32,
        input: &TransitionInput,
    ) -> Result<RenewalDecision> {
        input.validate().map_err(|err| anyhow!(err))?;

        let decision = store
            .get_decision_for(entry_id, cycle_year)?
            .ok_or_else(|| {
                anyhow!(CatalogError::Validation(format!(
                    "no renewal decision for entry {entry_id} in cycle {cycle_year}"
                )))
            })?;

        let plan = plan_transition(decision.stage, input.action, input.actor_role)
            .map_err(|err| anyhow!(err))?;

        if plan.replay {
            return replay_result(&decision, input);
        }

        if input.expected_version != decision.version {
            return Err(anyhow!(CatalogError::Conflict(format!(
                "stale decision version: expected {}, stored {}",
                input.expected_version, decision.version
            ))));
        }

        match input.action {
            DecisionAction::RequestSummary => self.request_summary(store, &decision, input),
            // Only the request_summary pipeline reaches the summarizing
            // stage, so a direct record_summary never has a stage to land on.
            DecisionAction::RecordSummary => Err(anyhow!(CatalogError::Conflict(
                "record_summary is applied as part of request_summary".to_string(),
            ))),
            DecisionAction::SkipSummary => skip_summary(store, &decision, plan.target),
            DecisionAction::AssessorReview => assessor_review(store, &decision, input, plan.target),
            DecisionAction::DirectorDecision => {
                director_decision(store, &decision, input, plan.target)
            }
            DecisionAction::Implement => implement(store, &decision, input, plan.target),
        }
    }

    /// Generates the summary, then advances collecting through summarizing
    /// to assessor review in one persisted write. The provider runs first:
    /// if it fails, the decision has not moved and the request can simply be
    /// retried.
    fn request_summary(
        &self,
        store: &mut SqliteCatalogStore,
        decision: &RenewalDecision,
        input: &TransitionInput,
    ) -> Result<RenewalDecision> {
        let entry = store.get_entry(decision.entry_id)?.ok_or_else(|| {
            anyhow!(CatalogError::DataIntegrity(format!(
                "decision {} references missing entry {}",
                decision.decision_id, decision.entry_id
            )))
        })?;
        let assessments = store.list_assessments(decision.entry_id, decision.cycle_year)?;
        let tally = aggregate_assessments(&assessments);

        let request = SummaryRequest {
            product: entry.product.clone(),
            cycle_year: decision.cycle_year,
            tally,
            assessments,
        };
        let summary = self.summary_provider.summarize(&request).with_context(|| {
            format!(
                "summary provider '{}' failed for decision {}",
                self.summary_provider.provider_name(),
                decision.decision_id
            )
        })?;

        let plan = plan_transition(
            DecisionStage::Summarizing,
            DecisionAction::RecordSummary,
            input.actor_role,
        )
        .map_err(|err| anyhow!(err))?;

        let now = now_utc();
        let mut updated = decision.clone();
        updated.stage = plan.target;
        updated.version = decision.version + 1;
        updated.tally = tally;
        updated.summary_text = Some(summary);
        updated.summary_generated_at = Some(now);
        updated.updated_at = now;
        store.persist_transition(&updated, decision.version, false)
    }
}

/// Replay acceptance per action: the stored record must already carry the
/// values this input would have written.
fn replay_matches(decision: &RenewalDecision, input: &TransitionInput) -> bool {
    match input.action {
        DecisionAction::RequestSummary | DecisionAction::RecordSummary => {
            decision.summary_text.is_some()
        }
        DecisionAction::SkipSummary => decision.summary_text.is_none(),
        DecisionAction::AssessorReview => {
            decision.assessor_recommendation == input.assessor_recommendation
                && decision.assessor_comment == input.assessor_comment
        }
        DecisionAction::DirectorDecision => {
            decision.final_decision == input.final_decision
                && decision.approver_comment == input.approver_comment
                && decision.new_annual_cost == input.new_annual_cost
                && decision.new_license_count == input.new_license_count
                && decision.new_renewal_date == input.new_renewal_date
        }
        DecisionAction::Implement => decision.implementation_notes == input.implementation_notes,
    }
}

fn replay_result(decision: &RenewalDecision, input: &TransitionInput) -> Result<RenewalDecision> {
    if replay_matches(decision, input) {
        return Ok(decision.clone());
    }
    Err(anyhow!(CatalogError::Conflict(format!(
        "decision {} already records different values for {}",
        decision.decision_id,
        input.action.as_str()
    ))))
}

/// Assessments are frozen once collecting ends, so the tally written here is
/// the one every later stage reads.
fn skip_summary(
    store: &mut SqliteCatalogStore,
    decision: &RenewalDecision,
    target: DecisionStage,
) -> Result<RenewalDecision> {
    let assessments = store.list_assessments(decision.entry_id, decision.cycle_year)?;

    let now = now_utc();
    let mut updated = decision.clone();
    updated.stage = target;
    updated.version = decision.version + 1;
    updated.tally = aggregate_assessments(&assessments);
    updated.updated_at = now;
    store.persist_transition(&updated, decision.version, false)
}

fn assessor_review(
    store: &mut SqliteCatalogStore,
    decision: &RenewalDecision,
    input: &TransitionInput,
    target: DecisionStage,
) -> Result<RenewalDecision> {
    let now = now_utc();
    let mut updated = decision.clone();
    updated.stage = target;
    updated.version = decision.version + 1;
    updated.assessor_recommendation = input.assessor_recommendation;
    updated.assessor_comment = input.assessor_comment.clone();
    updated.assessor_reviewed_at = Some(now);
    updated.updated_at = now;
    store.persist_transition(&updated, decision.version, false)
}

/// New terms are recorded here but only copied onto the entry at implement,
/// and only when the final decision keeps the application.
fn director_decision(
    store: &mut SqliteCatalogStore,
    decision: &RenewalDecision,
    input: &TransitionInput,
    target: DecisionStage,
) -> Result<RenewalDecision> {
    let now = now_utc();
    let mut updated = decision.clone();
    updated.stage = target;
    updated.version = decision.version + 1;
    updated.final_decision = input.final_decision;
    updated.approver_comment = input.approver_comment.clone();
    updated.decided_at = Some(now);
    updated.new_annual_cost = input.new_annual_cost;
    updated.new_license_count = input.new_license_count;
    updated.new_renewal_date = input.new_renewal_date;
    updated.updated_at = now;
    store.persist_transition(&updated, decision.version, false)
}

fn implement(
    store: &mut SqliteCatalogStore,
    decision: &RenewalDecision,
    input: &TransitionInput,
    target: DecisionStage,
) -> Result<RenewalDecision> {
    let final_decision = decision.final_decision.ok_or_else(|| {
        anyhow!(CatalogError::DataIntegrity(format!(
            "decision {} reached decided without a final decision",
            decision.decision_id
        )))
    })?;

    let now = now_utc();
    let mut updated = decision.clone();
    updated.stage = target;
    updated.version = decision.version + 1;
    updated.implementation_notes = input.implementation_notes.clone();
    updated.implemented_at = Some(now);
    updated.updated_at = now;
    store.persist_transition(&updated, decision.version, final_decision.implies_continuation())
}

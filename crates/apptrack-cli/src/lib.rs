#![forbid(unsafe_code)]

//! Catalog command surface for operators and host scripts.
//!
//! Embed through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteCatalogStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use apptrack_core::{
    format_date, parse_date_str, ActorRole, Assessment, AssessmentId, AssessmentInput,
    AssessmentStatus, CatalogDraft, CatalogEntry, DecisionAction, EntryId, Recommendation,
    RenewalDecision, RunId, SyncDirection, SyncFailure, SyncRun, SyncStatus, TransitionInput,
};
use apptrack_renewal::{
    DecisionView, HttpSummaryConfig, HttpSummaryProvider, MockSummaryProvider, RenewalWorkflow,
};
use apptrack_store_sqlite::{DuplicateReport, RemovalReport, SqliteCatalogStore};
use apptrack_sync::{
    ExternalStore, FileExternalStore, HttpExternalStore, HttpStoreConfig, SyncEngine,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "apptrack")]
#[command(about = "School application catalog, sync, and renewal CLI")]
pub struct Cli {
    #[arg(long, default_value = "./apptrack.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates the database file and applies the schema.
    Init,
    Entry {
        #[command(subcommand)]
        command: Box<EntryCommand>,
    },
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
    Duplicates {
        #[command(subcommand)]
        command: Box<DuplicatesCommand>,
    },
    Assessment {
        #[command(subcommand)]
        command: Box<AssessmentCommand>,
    },
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EntryCommand {
    Add(EntryAddArgs),
    List(EntryListArgs),
    Show(EntryShowArgs),
}

#[derive(Debug, Args)]
pub struct EntryAddArgs {
    #[arg(long)]
    product: String,
    #[arg(long)]
    product_id: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long = "division")]
    divisions: Vec<String>,
    #[arg(long = "audience")]
    audience: Vec<String>,
    #[arg(long)]
    license_terms: Option<String>,
    #[arg(long)]
    annual_cost: Option<f64>,
    #[arg(long)]
    license_count: Option<i64>,
    #[arg(long)]
    renewal_date: Option<String>,
    #[arg(long)]
    sso_enabled: Option<bool>,
    #[arg(long)]
    mobile_app: Option<bool>,
    #[arg(long)]
    enterprise: Option<bool>,
}

#[derive(Debug, Args)]
pub struct EntryListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EntryShowArgs {
    #[arg(long)]
    entry_id: String,
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    Run(SyncRunArgs),
    Runs(SyncRunsArgs),
    Failures(SyncFailuresArgs),
}

#[derive(Debug, Args)]
pub struct SyncRunArgs {
    #[arg(long)]
    direction: DirectionArg,
    #[arg(long)]
    source_file: Option<PathBuf>,
    #[arg(long)]
    source_url: Option<String>,
    #[arg(long, default_value_t = 30_000)]
    source_timeout_ms: u64,
    #[arg(long)]
    source_bearer_env: Option<String>,
    #[arg(long, default_value = "cli")]
    triggered_by: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SyncRunsArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct SyncFailuresArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
pub enum DuplicatesCommand {
    Check(DuplicatesCheckArgs),
    Remove(DuplicatesRemoveArgs),
}

#[derive(Debug, Args)]
pub struct DuplicatesCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DuplicatesRemoveArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AssessmentCommand {
    Submit(AssessmentSubmitArgs),
    List(AssessmentListArgs),
    SetStatus(AssessmentSetStatusArgs),
}

#[derive(Debug, Args)]
pub struct AssessmentSubmitArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    cycle_year: i32,
    #[arg(long)]
    submitter: String,
    #[arg(long)]
    recommendation: RecommendationArg,
    #[arg(long)]
    justification: Option<String>,
    #[arg(long)]
    usage_notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct AssessmentListArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    cycle_year: i32,
}

#[derive(Debug, Args)]
pub struct AssessmentSetStatusArgs {
    #[arg(long)]
    assessment_id: String,
    #[arg(long)]
    status: StatusArg,
}

#[derive(Debug, Subcommand)]
pub enum DecisionCommand {
    Show(DecisionShowArgs),
    Advance(DecisionAdvanceArgs),
}

#[derive(Debug, Args)]
pub struct DecisionShowArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    cycle_year: i32,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DecisionAdvanceArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    cycle_year: i32,
    #[arg(long)]
    action: ActionArg,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    role: RoleArg,
    #[arg(long)]
    expected_version: i64,
    #[arg(long)]
    assessor_recommendation: Option<RecommendationArg>,
    #[arg(long)]
    assessor_comment: Option<String>,
    #[arg(long)]
    final_decision: Option<RecommendationArg>,
    #[arg(long)]
    approver_comment: Option<String>,
    #[arg(long)]
    new_annual_cost: Option<f64>,
    #[arg(long)]
    new_license_count: Option<i64>,
    #[arg(long)]
    new_renewal_date: Option<String>,
    #[arg(long)]
    implementation_notes: Option<String>,
    #[arg(long, default_value = "mock")]
    summary_provider: SummaryProviderArg,
    #[arg(long)]
    summary_url: Option<String>,
    #[arg(long, default_value_t = 30_000)]
    summary_timeout_ms: u64,
    #[arg(long)]
    summary_bearer_env: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Pull,
    Push,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RecommendationArg {
    Renew,
    RenewWithChanges,
    Replace,
    Retire,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Submitter,
    Assessor,
    Approver,
    Admin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    RequestSummary,
    RecordSummary,
    SkipSummary,
    AssessorReview,
    DirectorDecision,
    Implement,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Submitted,
    InReview,
    Approved,
    Rejected,
    Completed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SummaryProviderArg {
    Mock,
    Http,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteCatalogStore::open(db_path)?;
    store.migrate()?;

    if matches!(command, Command::Init) {
        println!("database ready at {}", db_path.display());
        return Ok(());
    }

    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when command validation, persistence, or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        Command::Init => Err(anyhow!(
            "internal dispatch error: init is completed during store open"
        )),
        Command::Entry { command } => run_entry(*command, store),
        Command::Sync { command } => run_sync(*command, store),
        Command::Duplicates { command } => run_duplicates(*command, store),
        Command::Assessment { command } => run_assessment(*command, store),
        Command::Decision { command } => run_decision(*command, store),
    }
}

fn run_entry(command: EntryCommand, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        EntryCommand::Add(args) => {
            let renewal_date = args
                .renewal_date
                .as_deref()
                .map(parse_date_str)
                .transpose()
                .map_err(|err| anyhow!(err))?;
            let draft = CatalogDraft {
                product_id: args.product_id,
                product: Some(args.product),
                category: args.category,
                department: args.department,
                divisions: if args.divisions.is_empty() {
                    None
                } else {
                    Some(args.divisions)
                },
                audience: if args.audience.is_empty() {
                    None
                } else {
                    Some(args.audience)
                },
                license_terms: args.license_terms,
                annual_cost: args.annual_cost,
                license_count: args.license_count,
                renewal_date,
                sso_enabled: args.sso_enabled,
                mobile_app: args.mobile_app,
                enterprise: args.enterprise,
            };

            let entry = store.insert_entry(&draft)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        EntryCommand::List(args) => {
            let mut entries = store.list_entries()?;
            if let Some(limit) = args.limit {
                entries.truncate(limit);
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entry_table(&entries);
            }
            Ok(())
        }
        EntryCommand::Show(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            let Some(entry) = store.get_entry(entry_id)? else {
                return Err(anyhow!("catalog entry not found: {}", args.entry_id));
            };
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
    }
}

fn run_sync(command: SyncCommand, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        SyncCommand::Run(args) => {
            let direction = map_direction(args.direction);
            let mut external = build_external_store(&args)?;
            let run = SyncEngine::new(external.as_mut()).run_sync(
                store,
                direction,
                &args.triggered_by,
            )?;
            let failures = store.list_sync_failures(run.run_id)?;

            if args.json {
                let payload = SyncRunJsonPayload {
                    contract_version: "sync_run.v1".to_string(),
                    run: run.clone(),
                    failures,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_sync_run(&run);
                if !failures.is_empty() {
                    print_sync_failures(&failures);
                }
            }

            if run.status == SyncStatus::Failed {
                return Err(anyhow!(
                    "sync run {} failed: {}",
                    run.run_id,
                    run.error_message.as_deref().unwrap_or("unknown error")
                ));
            }
            Ok(())
        }
        SyncCommand::Runs(args) => {
            let runs = store.list_sync_runs(Some(args.limit))?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
        SyncCommand::Failures(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let failures = store.list_sync_failures(run_id)?;
            println!("{}", serde_json::to_string_pretty(&failures)?);
            Ok(())
        }
    }
}

fn run_duplicates(command: DuplicatesCommand, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        DuplicatesCommand::Check(args) => {
            let report = store.find_duplicate_groups()?;
            if args.json {
                let payload = DuplicateReportJsonPayload {
                    contract_version: "duplicate_report.v1".to_string(),
                    report,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_duplicate_report(&report);
            }
            Ok(())
        }
        DuplicatesCommand::Remove(args) => {
            let report = store.remove_duplicates()?;
            let group_errors = report.group_errors.len();

            if args.json {
                let payload = RemovalReportJsonPayload {
                    contract_version: "removal_report.v1".to_string(),
                    report,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_removal_report(&report);
            }

            if group_errors > 0 {
                return Err(anyhow!(
                    "duplicate removal completed with {group_errors} group errors"
                ));
            }
            Ok(())
        }
    }
}

fn run_assessment(command: AssessmentCommand, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        AssessmentCommand::Submit(args) => {
            let input = AssessmentInput {
                entry_id: parse_entry_id(&args.entry_id)?,
                cycle_year: args.cycle_year,
                submitter: args.submitter,
                recommendation: map_recommendation(args.recommendation),
                justification: args.justification,
                usage_notes: args.usage_notes,
            };

            let (assessment, decision) = apptrack_renewal::submit_assessment(store, &input)?;
            let payload = AssessmentSubmitJsonPayload {
                contract_version: "assessment_submit.v1".to_string(),
                assessment,
                decision,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        AssessmentCommand::List(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            let assessments = store.list_assessments(entry_id, args.cycle_year)?;
            println!("{}", serde_json::to_string_pretty(&assessments)?);
            Ok(())
        }
        AssessmentCommand::SetStatus(args) => {
            let assessment_id = parse_assessment_id(&args.assessment_id)?;
            let updated = store.update_assessment_status(assessment_id, map_status(args.status))?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
            Ok(())
        }
    }
}

fn run_decision(command: DecisionCommand, store: &mut SqliteCatalogStore) -> Result<()> {
    match command {
        DecisionCommand::Show(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            let view = apptrack_renewal::decision_view(store, entry_id, args.cycle_year)?;

            if args.json {
                let payload = DecisionViewJsonPayload {
                    contract_version: "decision_view.v1".to_string(),
                    decision: view.decision,
                    assessments: view.assessments,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_decision_view(&view);
            }
            Ok(())
        }
        DecisionCommand::Advance(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            let new_renewal_date = args
                .new_renewal_date
                .as_deref()
                .map(parse_date_str)
                .transpose()
                .map_err(|err| anyhow!(err))?;
            let input = TransitionInput {
                action: map_action(args.action),
                actor: args.actor,
                actor_role: map_role(args.role),
                expected_version: args.expected_version,
                assessor_recommendation: args.assessor_recommendation.map(map_recommendation),
                assessor_comment: args.assessor_comment,
                final_decision: args.final_decision.map(map_recommendation),
                approver_comment: args.approver_comment,
                new_annual_cost: args.new_annual_cost,
                new_license_count: args.new_license_count,
                new_renewal_date,
                implementation_notes: args.implementation_notes,
            };

            let decision = match args.summary_provider {
                SummaryProviderArg::Mock => {
                    let provider = MockSummaryProvider::new();
                    RenewalWorkflow::new(&provider).advance(
                        store,
                        entry_id,
                        args.cycle_year,
                        &input,
                    )?
                }
                SummaryProviderArg::Http => {
                    let url = args.summary_url.as_deref().ok_or_else(|| {
                        anyhow!("--summary-url is required when --summary-provider is http")
                    })?;
                    let mut config = HttpSummaryConfig::new(url);
                    config.timeout_ms = args.summary_timeout_ms;
                    config.auth_bearer_env = args.summary_bearer_env;
                    let provider = HttpSummaryProvider::new(config);
                    RenewalWorkflow::new(&provider).advance(
                        store,
                        entry_id,
                        args.cycle_year,
                        &input,
                    )?
                }
            };

            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
    }
}

fn build_external_store(args: &SyncRunArgs) -> Result<Box<dyn ExternalStore>> {
    match (&args.source_file, &args.source_url) {
        (Some(path), None) => Ok(Box::new(FileExternalStore::new(path))),
        (None, Some(url)) => {
            let mut config = HttpStoreConfig::new(url);
            config.timeout_ms = args.source_timeout_ms;
            config.auth_bearer_env = args.source_bearer_env.clone();
            Ok(Box::new(HttpExternalStore::new(config)))
        }
        _ => Err(anyhow!(
            "exactly one of --source-file or --source-url is required"
        )),
    }
}

fn parse_entry_id(raw: &str) -> Result<EntryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EntryId(parsed))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(RunId(parsed))
}

fn parse_assessment_id(raw: &str) -> Result<AssessmentId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(AssessmentId(parsed))
}

fn map_direction(value: DirectionArg) -> SyncDirection {
    match value {
        DirectionArg::Pull => SyncDirection::Pull,
        DirectionArg::Push => SyncDirection::Push,
        DirectionArg::Bidirectional => SyncDirection::Bidirectional,
    }
}

fn map_recommendation(value: RecommendationArg) -> Recommendation {
    match value {
        RecommendationArg::Renew => Recommendation::Renew,
        RecommendationArg::RenewWithChanges => Recommendation::RenewWithChanges,
        RecommendationArg::Replace => Recommendation::Replace,
        RecommendationArg::Retire => Recommendation::Retire,
    }
}

fn map_role(value: RoleArg) -> ActorRole {
    match value {
        RoleArg::Submitter => ActorRole::Submitter,
        RoleArg::Assessor => ActorRole::Assessor,
        RoleArg::Approver => ActorRole::Approver,
        RoleArg::Admin => ActorRole::Admin,
    }
}

fn map_action(value: ActionArg) -> DecisionAction {
    match value {
        ActionArg::RequestSummary => DecisionAction::RequestSummary,
        ActionArg::RecordSummary => DecisionAction::RecordSummary,
        ActionArg::SkipSummary => DecisionAction::SkipSummary,
        ActionArg::AssessorReview => DecisionAction::AssessorReview,
        ActionArg::DirectorDecision => DecisionAction::DirectorDecision,
        ActionArg::Implement => DecisionAction::Implement,
    }
}

fn map_status(value: StatusArg) -> AssessmentStatus {
    match value {
        StatusArg::Submitted => AssessmentStatus::Submitted,
        StatusArg::InReview => AssessmentStatus::InReview,
        StatusArg::Approved => AssessmentStatus::Approved,
        StatusArg::Rejected => AssessmentStatus::Rejected,
        StatusArg::Completed => AssessmentStatus::Completed,
    }
}

fn print_entry_table(entries: &[CatalogEntry]) {
    println!(
        "{:<26} {:<28} {:<16} {:>12} {:>6} renewal",
        "entry_id", "product", "category", "annual_cost", "seats"
    );
    println!("{}", "-".repeat(104));

    for entry in entries {
        println!(
            "{:<26} {:<28} {:<16} {:>12} {:>6} {}",
            entry.entry_id,
            entry.product,
            entry.category.as_deref().unwrap_or("-"),
            entry
                .annual_cost
                .map_or_else(|| "-".to_string(), |value| format!("{value:.2}")),
            entry
                .license_count
                .map_or_else(|| "-".to_string(), |value| value.to_string()),
            entry.renewal_date.map_or_else(|| "-".to_string(), format_date),
        );
    }
}

fn print_sync_run(run: &SyncRun) {
    println!(
        "run={} direction={} status={} synced={} failed={} triggered_by={}",
        run.run_id,
        run.direction.as_str(),
        run.status.as_str(),
        run.records_synced,
        run.records_failed,
        run.triggered_by
    );
    if let Some(message) = run.error_message.as_deref() {
        println!("error={message}");
    }
}

fn print_sync_failures(failures: &[SyncFailure]) {
    println!("{:<6} {:<18} {:<28} message", "seq", "kind", "record");
    println!("{}", "-".repeat(90));
    for failure in failures {
        println!(
            "{:<6} {:<18} {:<28} {}",
            failure.failure_seq, failure.error_kind, failure.record_label, failure.message
        );
    }
}

fn print_duplicate_report(report: &DuplicateReport) {
    println!(
        "total_apps={} duplicate_groups={} total_duplicates={} unresolvable={}",
        report.total_apps, report.duplicate_groups, report.total_duplicates,
        report.unresolvable_count
    );
    for group in &report.duplicates {
        println!(
            "{:<28} count={} keep={} remove={}",
            group.product,
            group.count,
            group.keep_id,
            group
                .remove_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    if !report.unresolvable_labels.is_empty() {
        println!(
            "unresolvable_labels={}",
            report.unresolvable_labels.join(", ")
        );
        println!("hint=give these records a product name or product_id, then re-run the scan");
    }
}

fn print_removal_report(report: &RemovalReport) {
    println!("{}", report.message);
    println!(
        "groups_processed={} removed_count={} group_errors={}",
        report.groups_processed,
        report.removed_count,
        report.group_errors.len()
    );
    for error in &report.group_errors {
        println!("{}: {}", error.identity_key, error.message);
    }
}

fn print_decision_view(view: &DecisionView) {
    let decision = &view.decision;
    println!(
        "decision={} entry={} cycle={} stage={} version={}",
        decision.decision_id,
        decision.entry_id,
        decision.cycle_year,
        decision.stage.as_str(),
        decision.version
    );
    println!(
        "tally renew={} renew_with_changes={} replace={} retire={} total={}",
        decision.tally.renew,
        decision.tally.renew_with_changes,
        decision.tally.replace,
        decision.tally.retire,
        decision.tally.total
    );
    if let Some(recommendation) = decision.assessor_recommendation {
        println!("assessor_recommendation={}", recommendation.as_str());
    }
    if let Some(final_decision) = decision.final_decision {
        println!("final_decision={}", final_decision.as_str());
    }
    if let Some(summary) = decision.summary_text.as_deref() {
        println!("summary={summary}");
    }
    println!("assessments={}", view.assessments.len());
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SyncRunJsonPayload {
    contract_version: String,
    run: SyncRun,
    failures: Vec<SyncFailure>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DuplicateReportJsonPayload {
    contract_version: String,
    report: DuplicateReport,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RemovalReportJsonPayload {
    contract_version: String,
    report: RemovalReport,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AssessmentSubmitJsonPayload {
    contract_version: String,
    assessment: Assessment,
    decision: RenewalDecision,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DecisionViewJsonPayload {
    contract_version: String,
    decision: RenewalDecision,
    assessments: Vec<Assessment>,
}

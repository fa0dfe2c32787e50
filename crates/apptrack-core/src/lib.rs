#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// External records as received from the spreadsheet side: one loose
/// key/value map per row, key order preserved.
pub type RawRecord = serde_json::Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("transient io error: {0}")]
    TransientIo(String),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
}

impl CatalogError {
    /// Stable machine-readable kind, used in sync failure rows and by the
    /// HTTP surface when mapping errors to status codes.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Authorization(_) => "authorization_error",
            Self::Conflict(_) => "write_conflict",
            Self::TransientIo(_) => "transient_io",
            Self::DataIntegrity(_) => "data_integrity",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AssessmentId(pub Ulid);

impl Display for AssessmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
    Bidirectional,
}

impl SyncDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Bidirectional => "bidirectional",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            "bidirectional" => Some(Self::Bidirectional),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Run statuses only move forward; sealed runs accept nothing.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Failed)
                | (Self::InProgress, Self::Completed | Self::Failed)
        )
    }

    #[must_use]
    pub fn is_sealed(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Renew,
    RenewWithChanges,
    Replace,
    Retire,
}

impl Recommendation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Renew => "renew",
            Self::RenewWithChanges => "renew_with_changes",
            Self::Replace => "replace",
            Self::Retire => "retire",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "renew" => Some(Self::Renew),
            "renew_with_changes" => Some(Self::RenewWithChanges),
            "replace" => Some(Self::Replace),
            "retire" => Some(Self::Retire),
            _ => None,
        }
    }

    /// True when the decision keeps the application in service, which is
    /// what makes new contract terms applicable.
    #[must_use]
    pub fn implies_continuation(self) -> bool {
        matches!(self, Self::Renew | Self::RenewWithChanges)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Submitted,
    InReview,
    Approved,
    Rejected,
    Completed,
}

impl AssessmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(Self::Submitted),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Collecting,
    Summarizing,
    AssessorReview,
    FinalReview,
    Decided,
    Implemented,
}

impl DecisionStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Summarizing => "summarizing",
            Self::AssessorReview => "assessor_review",
            Self::FinalReview => "final_review",
            Self::Decided => "decided",
            Self::Implemented => "implemented",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "collecting" => Some(Self::Collecting),
            "summarizing" => Some(Self::Summarizing),
            "assessor_review" => Some(Self::AssessorReview),
            "final_review" => Some(Self::FinalReview),
            "decided" => Some(Self::Decided),
            "implemented" => Some(Self::Implemented),
            _ => None,
        }
    }

    /// Position in the stage order; transitions may only increase it.
    #[must_use]
    pub fn order(self) -> u8 {
        match self {
            Self::Collecting => 0,
            Self::Summarizing => 1,
            Self::AssessorReview => 2,
            Self::FinalReview => 3,
            Self::Decided => 4,
            Self::Implemented => 5,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Implemented)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Submitter,
    Assessor,
    Approver,
    Admin,
}

impl ActorRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitter => "submitter",
            Self::Assessor => "assessor",
            Self::Approver => "approver",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitter" => Some(Self::Submitter),
            "assessor" => Some(Self::Assessor),
            "approver" => Some(Self::Approver),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Admin satisfies every gate; other roles only their own.
    #[must_use]
    pub fn satisfies(self, required: Self) -> bool {
        self == required || matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    RequestSummary,
    RecordSummary,
    SkipSummary,
    AssessorReview,
    DirectorDecision,
    Implement,
}

impl DecisionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestSummary => "request_summary",
            Self::RecordSummary => "record_summary",
            Self::SkipSummary => "skip_summary",
            Self::AssessorReview => "assessor_review",
            Self::DirectorDecision => "director_decision",
            Self::Implement => "implement",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "request_summary" => Some(Self::RequestSummary),
            "record_summary" => Some(Self::RecordSummary),
            "skip_summary" => Some(Self::SkipSummary),
            "assessor_review" => Some(Self::AssessorReview),
            "director_decision" => Some(Self::DirectorDecision),
            "implement" => Some(Self::Implement),
            _ => None,
        }
    }

    #[must_use]
    pub fn required_role(self) -> ActorRole {
        match self {
            Self::RequestSummary | Self::RecordSummary | Self::SkipSummary | Self::AssessorReview => {
                ActorRole::Assessor
            }
            Self::DirectorDecision | Self::Implement => ActorRole::Approver,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// The join key used to match one real-world application across the two
/// stores and to detect duplicates inside the canonical store.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum IdentityKey {
    External(String),
    Name(String),
    Unresolvable,
}

impl IdentityKey {
    /// Derives the identity for a record. A non-blank durable external
    /// identifier wins; otherwise the normalized display name; a record with
    /// neither is unresolvable and is excluded from all auto-matching.
    #[must_use]
    pub fn resolve(product_id: Option<&str>, product: &str) -> Self {
        if let Some(id) = product_id {
            let trimmed = id.trim();
            if !trimmed.is_empty() {
                return Self::External(trimmed.to_string());
            }
        }

        let normalized = normalize_product_name(product);
        if normalized.is_empty() {
            return Self::Unresolvable;
        }

        Self::Name(normalized)
    }

    /// Key used for matching. `None` for unresolvable records so they can
    /// never silently collide with each other or with anything else.
    #[must_use]
    pub fn match_key(&self) -> Option<String> {
        match self {
            Self::External(id) => Some(format!("ext:{id}")),
            Self::Name(name) => Some(format!("name:{name}")),
            Self::Unresolvable => None,
        }
    }

    /// Key persisted on a canonical row. Unresolvable rows embed their own
    /// entry id, which keeps every unresolvable key distinct.
    #[must_use]
    pub fn storage_key(&self, entry_id: EntryId) -> String {
        match self.match_key() {
            Some(key) => key,
            None => format!("unresolved:{entry_id}"),
        }
    }

    #[must_use]
    pub fn is_resolvable(&self) -> bool {
        !matches!(self, Self::Unresolvable)
    }
}

/// Case-folds and collapses internal whitespace so spelling variants of the
/// same display name agree.
#[must_use]
pub fn normalize_product_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when a stored identity key belongs to the reserved unresolvable
/// space, which the duplicate scan and upsert matching must skip.
#[must_use]
pub fn is_unresolved_key(storage_key: &str) -> bool {
    storage_key.starts_with("unresolved:")
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub entry_id: EntryId,
    pub product_id: Option<String>,
    pub product: String,
    pub category: Option<String>,
    pub department: Option<String>,
    pub divisions: Vec<String>,
    pub audience: Vec<String>,
    pub license_terms: Option<String>,
    pub annual_cost: Option<f64>,
    pub license_count: Option<i64>,
    pub renewal_date: Option<Date>,
    pub sso_enabled: bool,
    pub mobile_app: bool,
    pub enterprise: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub synced_at: Option<OffsetDateTime>,
}

impl CatalogEntry {
    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::resolve(self.product_id.as_deref(), &self.product)
    }

    /// Label used in sync failure rows and duplicate reports so a human can
    /// find the record again.
    #[must_use]
    pub fn record_label(&self) -> String {
        if self.product.trim().is_empty() {
            match &self.product_id {
                Some(id) => format!("product_id={id}"),
                None => format!("entry_id={}", self.entry_id),
            }
        } else {
            self.product.clone()
        }
    }
}

/// The transform layer's output: every field optional, `None` meaning the
/// external record did not carry a usable value for it. Merging a draft over
/// an existing entry therefore never clobbers canonical data with blanks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogDraft {
    pub product_id: Option<String>,
    pub product: Option<String>,
    pub category: Option<String>,
    pub department: Option<String>,
    pub divisions: Option<Vec<String>>,
    pub audience: Option<Vec<String>>,
    pub license_terms: Option<String>,
    pub annual_cost: Option<f64>,
    pub license_count: Option<i64>,
    pub renewal_date: Option<Date>,
    pub sso_enabled: Option<bool>,
    pub mobile_app: Option<bool>,
    pub enterprise: Option<bool>,
}

impl CatalogDraft {
    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::resolve(
            self.product_id.as_deref(),
            self.product.as_deref().unwrap_or(""),
        )
    }

    #[must_use]
    pub fn record_label(&self) -> String {
        match (&self.product, &self.product_id) {
            (Some(product), _) if !product.trim().is_empty() => product.clone(),
            (_, Some(id)) => format!("product_id={id}"),
            _ => "<unlabelled record>".to_string(),
        }
    }
}

/// Materializes a brand-new entry from a draft. Identity must be checked by
/// the caller first; unresolvable records are rejected upstream.
#[must_use]
pub fn new_entry_from_draft(entry_id: EntryId, draft: &CatalogDraft, now: OffsetDateTime) -> CatalogEntry {
    CatalogEntry {
        entry_id,
        product_id: draft.product_id.clone(),
        product: draft.product.clone().unwrap_or_default(),
        category: draft.category.clone(),
        department: draft.department.clone(),
        divisions: draft.divisions.clone().unwrap_or_default(),
        audience: draft.audience.clone().unwrap_or_default(),
        license_terms: draft.license_terms.clone(),
        annual_cost: draft.annual_cost,
        license_count: draft.license_count,
        renewal_date: draft.renewal_date,
        sso_enabled: draft.sso_enabled.unwrap_or(false),
        mobile_app: draft.mobile_app.unwrap_or(false),
        enterprise: draft.enterprise.unwrap_or(false),
        created_at: now,
        updated_at: now,
        synced_at: None,
    }
}

/// Field-level pull merge: a draft value that is present overwrites, an
/// absent one keeps the canonical value. Returns the merged entry and
/// whether any descriptive field actually changed; `updated_at` bumps only
/// in that case.
#[must_use]
pub fn merge_external(existing: &CatalogEntry, draft: &CatalogDraft, now: OffsetDateTime) -> (CatalogEntry, bool) {
    let mut merged = existing.clone();

    if let Some(product_id) = &draft.product_id {
        merged.product_id = Some(product_id.clone());
    }
    if let Some(product) = &draft.product {
        if !product.trim().is_empty() {
            merged.product.clone_from(product);
        }
    }
    if let Some(category) = &draft.category {
        merged.category = Some(category.clone());
    }
    if let Some(department) = &draft.department {
        merged.department = Some(department.clone());
    }
    if let Some(divisions) = &draft.divisions {
        merged.divisions.clone_from(divisions);
    }
    if let Some(audience) = &draft.audience {
        merged.audience.clone_from(audience);
    }
    if let Some(license_terms) = &draft.license_terms {
        merged.license_terms = Some(license_terms.clone());
    }
    if let Some(annual_cost) = draft.annual_cost {
        merged.annual_cost = Some(annual_cost);
    }
    if let Some(license_count) = draft.license_count {
        merged.license_count = Some(license_count);
    }
    if let Some(renewal_date) = draft.renewal_date {
        merged.renewal_date = Some(renewal_date);
    }
    if let Some(sso_enabled) = draft.sso_enabled {
        merged.sso_enabled = sso_enabled;
    }
    if let Some(mobile_app) = draft.mobile_app {
        merged.mobile_app = mobile_app;
    }
    if let Some(enterprise) = draft.enterprise {
        merged.enterprise = enterprise;
    }

    let changed = merged.product_id != existing.product_id
        || merged.product != existing.product
        || merged.category != existing.category
        || merged.department != existing.department
        || merged.divisions != existing.divisions
        || merged.audience != existing.audience
        || merged.license_terms != existing.license_terms
        || merged.annual_cost != existing.annual_cost
        || merged.license_count != existing.license_count
        || merged.renewal_date != existing.renewal_date
        || merged.sso_enabled != existing.sso_enabled
        || merged.mobile_app != existing.mobile_app
        || merged.enterprise != existing.enterprise;

    if changed {
        merged.updated_at = now;
    }

    (merged, changed)
}

// ---------------------------------------------------------------------------
// Transform layer
// ---------------------------------------------------------------------------

/// Canonical field name to the ordered list of accepted source spellings.
/// The first alias is also the header emitted on push. Adding a legacy
/// spelling means adding it here; no transform code changes.
pub const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("product_id", &["product_id", "productId", "app_id", "appId", "id"]),
    (
        "product",
        &["product", "productName", "product_name", "application", "app_name", "name"],
    ),
    ("category", &["category", "appType", "app_type", "type"]),
    (
        "department",
        &["department", "dept", "ownerDepartment", "owner_department"],
    ),
    (
        "divisions",
        &["divisions", "division", "schoolDivisions", "school_divisions"],
    ),
    (
        "audience",
        &["audience", "audiences", "userGroups", "user_groups", "users"],
    ),
    (
        "license_terms",
        &["license_terms", "licenseTerms", "licenseType", "license_type", "terms"],
    ),
    (
        "annual_cost",
        &["annual_cost", "annualCost", "annualPrice", "annual_price", "cost", "price"],
    ),
    (
        "license_count",
        &["license_count", "licenseCount", "licenses", "seats", "quantity"],
    ),
    (
        "renewal_date",
        &["renewal_date", "renewalDate", "expirationDate", "expiration_date", "renewal"],
    ),
    (
        "sso_enabled",
        &["sso_enabled", "ssoEnabled", "sso", "singleSignOn", "single_sign_on"],
    ),
    (
        "mobile_app",
        &["mobile_app", "mobileApp", "hasMobileApp", "has_mobile_app", "mobile"],
    ),
    (
        "enterprise",
        &["enterprise", "isEnterprise", "is_enterprise", "enterpriseWide", "enterprise_wide"],
    ),
];

fn aliases_for(canonical: &str) -> &'static [&'static str] {
    for (field, aliases) in FIELD_ALIASES.iter().copied() {
        if field == canonical {
            return aliases;
        }
    }
    &[]
}

fn value_is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Walks a field's aliases in precedence order and returns the first value
/// that is present and non-blank.
#[must_use]
pub fn first_alias_value<'a>(raw: &'a RawRecord, canonical: &str) -> Option<&'a Value> {
    for alias in aliases_for(canonical) {
        if let Some(value) = raw.get(*alias) {
            if !value_is_blank(value) {
                return Some(value);
            }
        }
    }
    None
}

/// Boolean coercion: literal booleans pass through; the strings "true" and
/// "yes" (case-insensitive) are true; everything else, including absent, is
/// false.
#[must_use]
pub fn parse_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("yes")
        }
        _ => false,
    }
}

/// Money coercion: strips currency symbols and thousands separators before
/// parsing. A value that still fails to parse is `None`, never zero; a
/// non-finite parse ("inf", overflowing exponents) counts as failed.
#[must_use]
pub fn parse_money(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => {
            let stripped: String = text
                .chars()
                .filter(|c| !matches!(c, '$' | '€' | '£' | ',') && !c.is_whitespace())
                .collect();
            if stripped.is_empty() {
                return None;
            }
            stripped.parse::<f64>().ok().filter(|parsed| parsed.is_finite())
        }
        _ => None,
    }
}

/// Count coercion, same shape as [`parse_money`] but integral.
#[must_use]
pub fn parse_count(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => {
            let stripped: String = text
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            if stripped.is_empty() {
                return None;
            }
            stripped.parse::<i64>().ok()
        }
        _ => None,
    }
}

/// List coercion: native arrays or comma-separated strings, trimmed, with
/// empty segments dropped.
#[must_use]
pub fn parse_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(scalar_to_string)
            .filter(|item| !item.is_empty())
            .collect(),
        Some(Value::String(text)) => text
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Date coercion: `YYYY-MM-DD` or an RFC3339 timestamp (date part taken);
/// anything else is `None`.
#[must_use]
pub fn parse_date_value(value: Option<&Value>) -> Option<Date> {
    let Some(Value::String(text)) = value else {
        return None;
    };
    let trimmed = text.trim();

    let plain = time::macros::format_description!("[year]-[month]-[day]");
    if let Ok(date) = Date::parse(trimmed, plain) {
        return Some(date);
    }

    OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(OffsetDateTime::date)
}

/// String coercion for identifier-like fields; numeric cells become their
/// decimal spelling, which is how spreadsheet ids often arrive.
#[must_use]
pub fn parse_text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// External record to canonical draft. Pure: same input, same output.
#[must_use]
pub fn to_canonical(raw: &RawRecord) -> CatalogDraft {
    CatalogDraft {
        product_id: parse_text(first_alias_value(raw, "product_id")),
        product: parse_text(first_alias_value(raw, "product")),
        category: parse_text(first_alias_value(raw, "category")),
        department: parse_text(first_alias_value(raw, "department")),
        divisions: first_alias_value(raw, "divisions").map(|value| parse_list(Some(value))),
        audience: first_alias_value(raw, "audience").map(|value| parse_list(Some(value))),
        license_terms: parse_text(first_alias_value(raw, "license_terms")),
        annual_cost: parse_money(first_alias_value(raw, "annual_cost")),
        license_count: parse_count(first_alias_value(raw, "license_count")),
        renewal_date: parse_date_value(first_alias_value(raw, "renewal_date")),
        sso_enabled: first_alias_value(raw, "sso_enabled").map(|value| parse_flag(Some(value))),
        mobile_app: first_alias_value(raw, "mobile_app").map(|value| parse_flag(Some(value))),
        enterprise: first_alias_value(raw, "enterprise").map(|value| parse_flag(Some(value))),
    }
}

/// Canonical entry to the external (spreadsheet) shape using the primary
/// headers. Flags render as "Yes"/"No"; unknown numerics and dates render as
/// null so the external side keeps zero and unknown distinguishable.
#[must_use]
pub fn to_external(entry: &CatalogEntry) -> RawRecord {
    let mut record = RawRecord::new();
    record.insert(
        "product_id".to_string(),
        entry
            .product_id
            .as_ref()
            .map_or(Value::Null, |id| Value::String(id.clone())),
    );
    record.insert("product".to_string(), Value::String(entry.product.clone()));
    record.insert(
        "category".to_string(),
        option_text(entry.category.as_deref()),
    );
    record.insert(
        "department".to_string(),
        option_text(entry.department.as_deref()),
    );
    record.insert(
        "divisions".to_string(),
        Value::String(entry.divisions.join(", ")),
    );
    record.insert(
        "audience".to_string(),
        Value::String(entry.audience.join(", ")),
    );
    record.insert(
        "license_terms".to_string(),
        option_text(entry.license_terms.as_deref()),
    );
    record.insert(
        "annual_cost".to_string(),
        entry.annual_cost.map_or(Value::Null, |cost| {
            serde_json::Number::from_f64(cost).map_or(Value::Null, Value::Number)
        }),
    );
    record.insert(
        "license_count".to_string(),
        entry
            .license_count
            .map_or(Value::Null, |count| Value::Number(count.into())),
    );
    record.insert(
        "renewal_date".to_string(),
        entry
            .renewal_date
            .map_or(Value::Null, |date| Value::String(format_date(date))),
    );
    record.insert("sso_enabled".to_string(), flag_text(entry.sso_enabled));
    record.insert("mobile_app".to_string(), flag_text(entry.mobile_app));
    record.insert("enterprise".to_string(), flag_text(entry.enterprise));
    record
}

fn option_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::String(text.to_string()))
}

fn flag_text(flag: bool) -> Value {
    Value::String(if flag { "Yes" } else { "No" }.to_string())
}

// ---------------------------------------------------------------------------
// Sync runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub run_id: RunId,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub records_synced: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// One per-record failure inside a run; append-only alongside the run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncFailure {
    pub failure_seq: i64,
    pub run_id: RunId,
    pub record_label: String,
    pub error_kind: String,
    pub message: String,
    pub occurred_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Assessments and aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assessment {
    pub assessment_id: AssessmentId,
    pub entry_id: EntryId,
    pub cycle_year: i32,
    pub submitter: String,
    pub recommendation: Recommendation,
    pub justification: Option<String>,
    pub usage_notes: Option<String>,
    pub snapshot_license_terms: Option<String>,
    pub snapshot_annual_cost: Option<f64>,
    pub snapshot_license_count: Option<i64>,
    pub snapshot_renewal_date: Option<Date>,
    pub status: AssessmentStatus,
    pub submitted_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentInput {
    pub entry_id: EntryId,
    pub cycle_year: i32,
    pub submitter: String,
    pub recommendation: Recommendation,
    pub justification: Option<String>,
    pub usage_notes: Option<String>,
}

impl AssessmentInput {
    /// Validates a submission before any state change.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] when required fields are missing
    /// or out of range.
    pub fn validate(&self) -> Result<(), CatalogError> {
        ensure_non_empty(&self.submitter, "submitter")?;

        if !(1900..=9999).contains(&self.cycle_year) {
            return Err(CatalogError::Validation(
                "cycle_year MUST be a four-digit year".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssessmentTally {
    pub renew: u64,
    pub renew_with_changes: u64,
    pub replace: u64,
    pub retire: u64,
    pub total: u64,
}

impl AssessmentTally {
    pub fn record(&mut self, recommendation: Recommendation) {
        match recommendation {
            Recommendation::Renew => self.renew += 1,
            Recommendation::RenewWithChanges => self.renew_with_changes += 1,
            Recommendation::Replace => self.replace += 1,
            Recommendation::Retire => self.retire += 1,
        }
        self.total += 1;
    }
}

/// Pure read-side tally over the assessments of one (entry, cycle) pair.
/// Recomputed, never incremented, so refreshing it is idempotent.
#[must_use]
pub fn aggregate_assessments(assessments: &[Assessment]) -> AssessmentTally {
    let mut tally = AssessmentTally::default();
    for assessment in assessments {
        tally.record(assessment.recommendation);
    }
    tally
}

// ---------------------------------------------------------------------------
// Renewal decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenewalDecision {
    pub decision_id: DecisionId,
    pub entry_id: EntryId,
    pub cycle_year: i32,
    pub stage: DecisionStage,
    pub version: i64,
    pub tally: AssessmentTally,
    pub summary_text: Option<String>,
    pub summary_generated_at: Option<OffsetDateTime>,
    pub assessor_recommendation: Option<Recommendation>,
    pub assessor_comment: Option<String>,
    pub assessor_reviewed_at: Option<OffsetDateTime>,
    pub final_decision: Option<Recommendation>,
    pub approver_comment: Option<String>,
    pub decided_at: Option<OffsetDateTime>,
    pub new_annual_cost: Option<f64>,
    pub new_license_count: Option<i64>,
    pub new_renewal_date: Option<Date>,
    pub implementation_notes: Option<String>,
    pub implemented_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionInput {
    pub action: DecisionAction,
    pub actor: String,
    pub actor_role: ActorRole,
    pub expected_version: i64,
    pub assessor_recommendation: Option<Recommendation>,
    pub assessor_comment: Option<String>,
    pub final_decision: Option<Recommendation>,
    pub approver_comment: Option<String>,
    pub new_annual_cost: Option<f64>,
    pub new_license_count: Option<i64>,
    pub new_renewal_date: Option<Date>,
    pub implementation_notes: Option<String>,
}

impl TransitionInput {
    /// Validates stage-specific required fields before any gate is checked
    /// or any state changes.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] on missing actor, bad version, or
    /// a missing stage field for the requested action.
    pub fn validate(&self) -> Result<(), CatalogError> {
        ensure_non_empty(&self.actor, "actor")?;

        if self.expected_version < 1 {
            return Err(CatalogError::Validation(
                "expected_version MUST be >= 1".to_string(),
            ));
        }

        match self.action {
            DecisionAction::AssessorReview => {
                if self.assessor_recommendation.is_none() {
                    return Err(CatalogError::Validation(
                        "assessor_recommendation MUST be provided for assessor_review".to_string(),
                    ));
                }
            }
            DecisionAction::DirectorDecision => {
                if self.final_decision.is_none() {
                    return Err(CatalogError::Validation(
                        "final_decision MUST be one of renew, renew_with_changes, replace, retire"
                            .to_string(),
                    ));
                }
            }
            DecisionAction::Implement => {
                let notes = self.implementation_notes.as_deref().unwrap_or("");
                if notes.trim().is_empty() {
                    return Err(CatalogError::Validation(
                        "implementation_notes MUST be provided for implement".to_string(),
                    ));
                }
            }
            DecisionAction::RequestSummary
            | DecisionAction::RecordSummary
            | DecisionAction::SkipSummary => {}
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransitionPlan {
    pub target: DecisionStage,
    /// True when the record already sits in the action's target stage: the
    /// caller treats it as a retry and overwrites the stage fields instead
    /// of rejecting, provided the fields match.
    pub replay: bool,
}

/// The transition table: from-stage and action to target stage, with the
/// role gate checked first so a wrong actor is an authorization error even
/// when the stage would also have been wrong.
///
/// # Errors
/// Returns [`CatalogError::Authorization`] for a role that does not satisfy
/// the action's gate and [`CatalogError::Conflict`] for a stage that does
/// not accept the action.
pub fn plan_transition(
    current: DecisionStage,
    action: DecisionAction,
    actor_role: ActorRole,
) -> Result<TransitionPlan, CatalogError> {
    let required = action.required_role();
    if !actor_role.satisfies(required) {
        return Err(CatalogError::Authorization(format!(
            "role {} cannot perform {}; requires {}",
            actor_role.as_str(),
            action.as_str(),
            required.as_str()
        )));
    }

    let plan = match (current, action) {
        (DecisionStage::Collecting, DecisionAction::RequestSummary) => TransitionPlan {
            target: DecisionStage::Summarizing,
            replay: false,
        },
        (DecisionStage::Summarizing, DecisionAction::RecordSummary) => TransitionPlan {
            target: DecisionStage::AssessorReview,
            replay: false,
        },
        (DecisionStage::Collecting | DecisionStage::Summarizing, DecisionAction::SkipSummary) => {
            TransitionPlan {
                target: DecisionStage::AssessorReview,
                replay: false,
            }
        }
        (DecisionStage::AssessorReview, DecisionAction::AssessorReview) => TransitionPlan {
            target: DecisionStage::FinalReview,
            replay: false,
        },
        (DecisionStage::FinalReview, DecisionAction::DirectorDecision) => TransitionPlan {
            target: DecisionStage::Decided,
            replay: false,
        },
        (DecisionStage::Decided, DecisionAction::Implement) => TransitionPlan {
            target: DecisionStage::Implemented,
            replay: false,
        },
        (DecisionStage::Summarizing, DecisionAction::RequestSummary)
        | (
            DecisionStage::AssessorReview,
            DecisionAction::RequestSummary
            | DecisionAction::RecordSummary
            | DecisionAction::SkipSummary,
        )
        | (DecisionStage::FinalReview, DecisionAction::AssessorReview)
        | (DecisionStage::Decided, DecisionAction::DirectorDecision)
        | (DecisionStage::Implemented, DecisionAction::Implement) => TransitionPlan {
            target: current,
            replay: true,
        },
        _ => {
            return Err(CatalogError::Conflict(format!(
                "stage {} does not accept action {}",
                current.as_str(),
                action.as_str()
            )))
        }
    };

    Ok(plan)
}

/// Terms implementer: copies the decision's new terms onto the entry,
/// falling back to the entry's current values for fields left unset, and
/// bumps `updated_at` so the next push propagates the change.
#[must_use]
pub fn apply_terms(
    entry: &CatalogEntry,
    decision: &RenewalDecision,
    now: OffsetDateTime,
) -> CatalogEntry {
    let mut updated = entry.clone();
    updated.annual_cost = decision.new_annual_cost.or(entry.annual_cost);
    updated.license_count = decision.new_license_count.or(entry.license_count);
    updated.renewal_date = decision.new_renewal_date.or(entry.renewal_date);
    updated.updated_at = now;
    updated
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// # Errors
/// Returns [`CatalogError::Validation`] when the value is blank.
pub fn ensure_non_empty(value: &str, field: &str) -> Result<(), CatalogError> {
    if value.trim().is_empty() {
        return Err(CatalogError::Validation(format!(
            "{field} MUST be provided"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CatalogError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CatalogError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CatalogError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CatalogError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CatalogError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CatalogError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            CatalogError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// # Errors
/// Returns [`CatalogError::Validation`] when the value is not `YYYY-MM-DD`.
pub fn parse_date_str(value: &str) -> Result<Date, CatalogError> {
    let plain = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(value.trim(), plain)
        .map_err(|err| CatalogError::Validation(format!("invalid date (expected YYYY-MM-DD): {err}")))
}

#[must_use]
pub fn format_date(value: Date) -> String {
    let plain = time::macros::format_description!("[year]-[month]-[day]");
    value.format(plain).unwrap_or_else(|_| value.to_string())
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn must_date(value: &str) -> Date {
        must_ok(parse_date_str(value))
    }

    fn fixture_entry_id() -> EntryId {
        EntryId(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2")))
    }

    fn fixture_entry() -> CatalogEntry {
        CatalogEntry {
            entry_id: fixture_entry_id(),
            product_id: Some("APP-001".to_string()),
            product: "Math Blaster".to_string(),
            category: Some("Curriculum".to_string()),
            department: Some("Mathematics".to_string()),
            divisions: vec!["Upper".to_string()],
            audience: vec!["Students".to_string(), "Teachers".to_string()],
            license_terms: Some("Annual site license".to_string()),
            annual_cost: Some(5000.0),
            license_count: Some(250),
            renewal_date: Some(must_date("2026-06-30")),
            sso_enabled: true,
            mobile_app: false,
            enterprise: false,
            created_at: must_utc("2026-01-10T00:00:00Z"),
            updated_at: must_utc("2026-01-10T00:00:00Z"),
            synced_at: None,
        }
    }

    fn fixture_assessment(recommendation: Recommendation) -> Assessment {
        Assessment {
            assessment_id: AssessmentId(Ulid::new()),
            entry_id: fixture_entry_id(),
            cycle_year: 2026,
            submitter: "li.chen".to_string(),
            recommendation,
            justification: Some("used weekly".to_string()),
            usage_notes: None,
            snapshot_license_terms: Some("Annual site license".to_string()),
            snapshot_annual_cost: Some(5000.0),
            snapshot_license_count: Some(250),
            snapshot_renewal_date: Some(must_date("2026-06-30")),
            status: AssessmentStatus::Submitted,
            submitted_at: must_utc("2026-02-01T00:00:00Z"),
            updated_at: must_utc("2026-02-01T00:00:00Z"),
        }
    }

    fn fixture_decision(stage: DecisionStage) -> RenewalDecision {
        RenewalDecision {
            decision_id: DecisionId(Ulid::new()),
            entry_id: fixture_entry_id(),
            cycle_year: 2026,
            stage,
            version: 1,
            tally: AssessmentTally::default(),
            summary_text: None,
            summary_generated_at: None,
            assessor_recommendation: None,
            assessor_comment: None,
            assessor_reviewed_at: None,
            final_decision: None,
            approver_comment: None,
            decided_at: None,
            new_annual_cost: None,
            new_license_count: None,
            new_renewal_date: None,
            implementation_notes: None,
            implemented_at: None,
            created_at: must_utc("2026-02-01T00:00:00Z"),
            updated_at: must_utc("2026-02-01T00:00:00Z"),
        }
    }

    fn raw_snake() -> RawRecord {
        let value = json!({
            "product_id": "APP-001",
            "product_name": "Math Blaster",
            "annual_cost": "$5,000.00",
            "license_count": "250",
            "renewal_date": "2026-06-30",
            "sso_enabled": "Yes",
            "audience": "Students, Teachers",
        });
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    fn raw_camel() -> RawRecord {
        let value = json!({
            "productId": "APP-001",
            "productName": "Math Blaster",
            "annualCost": 5000.0,
            "licenseCount": 250,
            "renewalDate": "2026-06-30T00:00:00Z",
            "ssoEnabled": true,
            "audience": ["Students", "Teachers"],
        });
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn external_identifier_wins_over_name() {
        let key = IdentityKey::resolve(Some("APP-001"), "Math Blaster");
        assert_eq!(key, IdentityKey::External("APP-001".to_string()));
        assert_eq!(must_some(key.match_key()), "ext:APP-001");
    }

    #[test]
    fn blank_identifier_falls_back_to_normalized_name() {
        let key = IdentityKey::resolve(Some("   "), "  Math   BLASTER ");
        assert_eq!(key, IdentityKey::Name("math blaster".to_string()));
        assert_eq!(must_some(key.match_key()), "name:math blaster");
    }

    #[test]
    fn unresolvable_records_never_share_a_storage_key() {
        let key = IdentityKey::resolve(None, "   ");
        assert!(!key.is_resolvable());
        assert!(key.match_key().is_none());

        let first = key.storage_key(EntryId(Ulid::new()));
        let second = key.storage_key(EntryId(Ulid::new()));
        assert_ne!(first, second);
        assert!(is_unresolved_key(&first));
    }

    #[test]
    fn aliased_records_resolve_to_the_same_identity() {
        let snake = to_canonical(&raw_snake());
        let camel = to_canonical(&raw_camel());
        assert_eq!(snake.identity(), camel.identity());
        assert_eq!(
            must_some(snake.identity().match_key()),
            "ext:APP-001".to_string()
        );
    }

    #[test]
    fn alias_precedence_takes_first_non_empty() {
        let value = json!({
            "annual_cost": "",
            "annualCost": "$1,200",
            "cost": "9999",
        });
        let raw = match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        };
        let draft = to_canonical(&raw);
        assert_eq!(draft.annual_cost, Some(1200.0));
    }

    #[test]
    fn boolean_coercion_table_holds() {
        assert!(parse_flag(Some(&json!("Yes"))));
        assert!(!parse_flag(Some(&json!("no"))));
        assert!(parse_flag(Some(&json!(true))));
        assert!(!parse_flag(Some(&json!(""))));
        assert!(!parse_flag(None));
        assert!(parse_flag(Some(&json!("TRUE"))));
        assert!(!parse_flag(Some(&json!("1"))));
        assert!(!parse_flag(Some(&json!(1))));
    }

    #[test]
    fn money_parsing_strips_currency_and_separators() {
        assert_eq!(parse_money(Some(&json!("$12,000.50"))), Some(12000.50));
        assert_eq!(parse_money(Some(&json!("€1,000"))), Some(1000.0));
        assert_eq!(parse_money(Some(&json!(250))), Some(250.0));
        assert_eq!(parse_money(Some(&json!("0"))), Some(0.0));
    }

    #[test]
    fn unparseable_money_is_null_not_zero() {
        assert_eq!(parse_money(Some(&json!("call us"))), None);
        assert_eq!(parse_money(Some(&json!(""))), None);
        assert_eq!(parse_money(None), None);
        assert_ne!(parse_money(Some(&json!("free"))), Some(0.0));
    }

    #[test]
    fn count_parsing_handles_numbers_and_strings() {
        assert_eq!(parse_count(Some(&json!("1,250"))), Some(1250));
        assert_eq!(parse_count(Some(&json!(42))), Some(42));
        assert_eq!(parse_count(Some(&json!("unlimited"))), None);
    }

    #[test]
    fn list_accepts_native_and_comma_separated() {
        assert_eq!(
            parse_list(Some(&json!("Students, , Teachers ,"))),
            vec!["Students".to_string(), "Teachers".to_string()]
        );
        assert_eq!(
            parse_list(Some(&json!(["Lower", " Upper "]))),
            vec!["Lower".to_string(), "Upper".to_string()]
        );
        assert!(parse_list(None).is_empty());
    }

    #[test]
    fn date_accepts_plain_and_rfc3339() {
        assert_eq!(
            parse_date_value(Some(&json!("2026-06-30"))),
            Some(must_date("2026-06-30"))
        );
        assert_eq!(
            parse_date_value(Some(&json!("2026-06-30T12:30:00Z"))),
            Some(must_date("2026-06-30"))
        );
        assert_eq!(parse_date_value(Some(&json!("June 30"))), None);
    }

    #[test]
    fn draft_merge_never_clobbers_with_blank() {
        let existing = fixture_entry();
        let draft = CatalogDraft {
            annual_cost: Some(6000.0),
            ..CatalogDraft::default()
        };
        let now = must_utc("2026-03-01T00:00:00Z");

        let (merged, changed) = merge_external(&existing, &draft, now);
        assert!(changed);
        assert_eq!(merged.annual_cost, Some(6000.0));
        assert_eq!(merged.product, existing.product);
        assert_eq!(merged.license_count, existing.license_count);
        assert_eq!(merged.updated_at, now);
    }

    #[test]
    fn identical_draft_merge_reports_unchanged() {
        let existing = fixture_entry();
        let draft = CatalogDraft {
            product_id: existing.product_id.clone(),
            product: Some(existing.product.clone()),
            annual_cost: existing.annual_cost,
            license_count: existing.license_count,
            renewal_date: existing.renewal_date,
            sso_enabled: Some(existing.sso_enabled),
            ..CatalogDraft::default()
        };
        let now = must_utc("2026-03-01T00:00:00Z");

        let (merged, changed) = merge_external(&existing, &draft, now);
        assert!(!changed);
        assert_eq!(merged.updated_at, existing.updated_at);
    }

    #[test]
    fn external_shape_keeps_zero_and_unknown_distinct() {
        let mut entry = fixture_entry();
        entry.annual_cost = Some(0.0);
        let zero = to_external(&entry);
        assert_eq!(zero.get("annual_cost"), Some(&json!(0.0)));

        entry.annual_cost = None;
        let unknown = to_external(&entry);
        assert_eq!(unknown.get("annual_cost"), Some(&Value::Null));
        assert_eq!(unknown.get("sso_enabled"), Some(&json!("Yes")));
        assert_eq!(unknown.get("mobile_app"), Some(&json!("No")));
    }

    #[test]
    fn external_shape_round_trips_through_transform() {
        let entry = fixture_entry();
        let raw = to_external(&entry);
        let draft = to_canonical(&raw);

        assert_eq!(draft.product_id, entry.product_id);
        assert_eq!(draft.product, Some(entry.product.clone()));
        assert_eq!(draft.annual_cost, entry.annual_cost);
        assert_eq!(draft.license_count, entry.license_count);
        assert_eq!(draft.renewal_date, entry.renewal_date);
        assert_eq!(draft.sso_enabled, Some(true));
        assert_eq!(draft.audience, Some(entry.audience.clone()));
    }

    #[test]
    fn aggregator_counts_per_recommendation() {
        let assessments = vec![
            fixture_assessment(Recommendation::Renew),
            fixture_assessment(Recommendation::Renew),
            fixture_assessment(Recommendation::Renew),
            fixture_assessment(Recommendation::Replace),
            fixture_assessment(Recommendation::Retire),
        ];

        let tally = aggregate_assessments(&assessments);
        assert_eq!(tally.renew, 3);
        assert_eq!(tally.renew_with_changes, 0);
        assert_eq!(tally.replace, 1);
        assert_eq!(tally.retire, 1);
        assert_eq!(tally.total, 5);
    }

    #[test]
    fn transition_chain_reaches_implemented() {
        let steps = [
            (DecisionStage::Collecting, DecisionAction::RequestSummary, DecisionStage::Summarizing),
            (DecisionStage::Summarizing, DecisionAction::RecordSummary, DecisionStage::AssessorReview),
            (DecisionStage::AssessorReview, DecisionAction::AssessorReview, DecisionStage::FinalReview),
            (DecisionStage::FinalReview, DecisionAction::DirectorDecision, DecisionStage::Decided),
            (DecisionStage::Decided, DecisionAction::Implement, DecisionStage::Implemented),
        ];

        for (from, action, to) in steps {
            let plan = must_ok(plan_transition(from, action, ActorRole::Admin));
            assert_eq!(plan.target, to);
            assert!(!plan.replay);
            assert!(to.order() > from.order());
        }
    }

    #[test]
    fn implement_from_final_review_is_rejected() {
        let err = must_err(plan_transition(
            DecisionStage::FinalReview,
            DecisionAction::Implement,
            ActorRole::Approver,
        ));
        assert_eq!(err.kind(), "write_conflict");
        assert!(err.to_string().contains("final_review"));
    }

    #[test]
    fn assessor_action_requires_assessor_role() {
        let err = must_err(plan_transition(
            DecisionStage::AssessorReview,
            DecisionAction::AssessorReview,
            ActorRole::Submitter,
        ));
        assert_eq!(err.kind(), "authorization_error");

        let allowed = must_ok(plan_transition(
            DecisionStage::AssessorReview,
            DecisionAction::AssessorReview,
            ActorRole::Admin,
        ));
        assert_eq!(allowed.target, DecisionStage::FinalReview);
    }

    #[test]
    fn wrong_role_beats_wrong_stage() {
        let err = must_err(plan_transition(
            DecisionStage::Collecting,
            DecisionAction::DirectorDecision,
            ActorRole::Submitter,
        ));
        assert_eq!(err.kind(), "authorization_error");
    }

    #[test]
    fn replay_targets_current_stage() {
        let plan = must_ok(plan_transition(
            DecisionStage::Decided,
            DecisionAction::DirectorDecision,
            ActorRole::Approver,
        ));
        assert!(plan.replay);
        assert_eq!(plan.target, DecisionStage::Decided);
    }

    #[test]
    fn director_decision_requires_final_decision_value() {
        let input = TransitionInput {
            action: DecisionAction::DirectorDecision,
            actor: "dana".to_string(),
            actor_role: ActorRole::Approver,
            expected_version: 1,
            assessor_recommendation: None,
            assessor_comment: None,
            final_decision: None,
            approver_comment: None,
            new_annual_cost: None,
            new_license_count: None,
            new_renewal_date: None,
            implementation_notes: None,
        };

        let err = must_err(input.validate());
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("final_decision"));
    }

    #[test]
    fn apply_terms_overwrites_and_falls_back() {
        let entry = fixture_entry();
        let mut decision = fixture_decision(DecisionStage::Decided);
        decision.final_decision = Some(Recommendation::RenewWithChanges);
        decision.new_annual_cost = Some(12000.0);
        decision.new_renewal_date = Some(must_date("2027-06-30"));
        let now = must_utc("2026-05-01T00:00:00Z");

        let updated = apply_terms(&entry, &decision, now);
        assert_eq!(updated.annual_cost, Some(12000.0));
        assert_eq!(updated.license_count, entry.license_count);
        assert_eq!(updated.renewal_date, Some(must_date("2027-06-30")));
        assert_eq!(updated.updated_at, now);
    }

    #[test]
    fn continuation_follows_the_decision_value() {
        assert!(Recommendation::Renew.implies_continuation());
        assert!(Recommendation::RenewWithChanges.implies_continuation());
        assert!(!Recommendation::Replace.implies_continuation());
        assert!(!Recommendation::Retire.implies_continuation());
    }

    #[test]
    fn sync_status_transitions_are_monotonic() {
        assert!(SyncStatus::Pending.can_transition_to(SyncStatus::InProgress));
        assert!(SyncStatus::InProgress.can_transition_to(SyncStatus::Completed));
        assert!(SyncStatus::InProgress.can_transition_to(SyncStatus::Failed));
        assert!(!SyncStatus::Completed.can_transition_to(SyncStatus::InProgress));
        assert!(!SyncStatus::Failed.can_transition_to(SyncStatus::Completed));
        assert!(SyncStatus::Completed.is_sealed());
    }

    #[test]
    fn rfc3339_parsing_requires_utc() {
        let err = must_err(parse_rfc3339_utc("2026-02-07T00:00:00+02:00"));
        assert!(err.to_string().contains("UTC"));
        let parsed = must_utc("2026-02-07T00:00:00Z");
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T00:00:00Z");
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            CatalogError::Validation(String::new()).kind(),
            "validation_error"
        );
        assert_eq!(
            CatalogError::Authorization(String::new()).kind(),
            "authorization_error"
        );
        assert_eq!(CatalogError::Conflict(String::new()).kind(), "write_conflict");
        assert_eq!(
            CatalogError::TransientIo(String::new()).kind(),
            "transient_io"
        );
        assert_eq!(
            CatalogError::DataIntegrity(String::new()).kind(),
            "data_integrity"
        );
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(name in ".{0,48}") {
            let once = normalize_product_name(&name);
            let twice = normalize_product_name(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn money_parsing_is_total(text in ".{0,32}") {
            let parsed = parse_money(Some(&Value::String(text)));
            if let Some(value) = parsed {
                prop_assert!(value.is_finite());
            }
        }

        #[test]
        fn resolvable_identities_have_prefixed_match_keys(
            id in "[A-Za-z0-9-]{1,12}",
            name in "[A-Za-z ]{1,24}",
        ) {
            let key = IdentityKey::resolve(Some(&id), &name);
            let match_key = key.match_key();
            prop_assert!(match_key.is_some());
            if let Some(text) = match_key {
                prop_assert!(text.starts_with("ext:"));
            }
        }
    }
}

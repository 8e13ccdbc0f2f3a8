//! USPTO Open Data Portal API client.
//!
//! Seven endpoints hang off one application resource: the core file-wrapper
//! endpoint (required for a sync) and six supplemental ones (term
//! adjustment, continuity, documents, assignment, attorney, foreign
//! priority). A 404 from a supplemental endpoint means "no data for this
//! application" and is returned as an empty payload, not an error.

use std::future::Future;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::credentials::{Credentials, CredentialsError};

pub const USPTO_API_BASE: &str = "https://api.uspto.gov/api/v1/patent/applications";

#[derive(Debug, Error)]
pub enum UsptoError {
    #[error("no API key configured - add your USPTO API key first")]
    MissingKey,
    #[error("credential store error: {0}")]
    Credential(String),
    #[error("invalid API key - check your USPTO API key")]
    AuthFailed,
    #[error("application {0} not found")]
    NotFound(String),
    #[error("USPTO API error: HTTP {0}")]
    Status(StatusCode),
    #[error("USPTO API request timed out")]
    Timeout,
    #[error("could not connect to the USPTO API")]
    Connection,
    #[error("request error: {0}")]
    Request(String),
    #[error("unexpected response shape: {0}")]
    Parse(String),
    #[error("malformed application number: {0:?}")]
    InvalidAppNumber(String),
}

impl From<CredentialsError> for UsptoError {
    fn from(e: CredentialsError) -> Self {
        Self::Credential(e.to_string())
    }
}

fn transport_error(e: reqwest::Error) -> UsptoError {
    if e.is_timeout() {
        UsptoError::Timeout
    } else if e.is_connect() {
        UsptoError::Connection
    } else {
        UsptoError::Request(e.to_string())
    }
}

// ---- Application numbers ----

/// Strip the separators users paste in ("17/940,142" -> "17940142").
pub fn normalize_app_number(app_number: &str) -> String {
    app_number
        .chars()
        .filter(|c| !matches!(c, '/' | ' ' | ','))
        .collect()
}

/// Format a normalized application number for display (e.g. 17/940,142).
/// Anything that is not a plain ASCII identifier passes through untouched.
pub fn format_app_number(app_number: &str) -> String {
    let norm = normalize_app_number(app_number);
    if norm.len() >= 8 && norm.is_ascii() {
        format!("{}/{},{}", &norm[..2], &norm[2..5], &norm[5..])
    } else {
        norm
    }
}

/// Normalize and reject identifiers that cannot be an application number.
pub fn validate_app_number(app_number: &str) -> Result<String, UsptoError> {
    let norm = normalize_app_number(app_number);
    if norm.is_empty() || !norm.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(UsptoError::InvalidAppNumber(app_number.to_string()));
    }
    Ok(norm)
}

/// Patent Center URL for an application.
pub fn patent_center_url(app_number: &str) -> String {
    format!(
        "https://patentcenter.uspto.gov/applications/{}",
        normalize_app_number(app_number)
    )
}

/// Patent Center documents URL (often more reliable than the landing page).
pub fn patent_center_documents_url(app_number: &str) -> String {
    format!(
        "https://patentcenter.uspto.gov/applications/{}/ifw/docs",
        normalize_app_number(app_number)
    )
}

/// Public PAIR URL for an application.
pub fn public_pair_url(app_number: &str) -> String {
    format!(
        "https://portal.uspto.gov/pair/PublicPair?appNumber={}",
        normalize_app_number(app_number)
    )
}

// ---- Typed payloads ----

/// One prosecution event from the file wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFact {
    pub code: String,
    pub description: String,
    pub date: String,
}

/// Flattened application metadata from the required endpoint.
///
/// Scalar fields are empty strings when the response omits them; the
/// `*_bag` fields hold the raw nested lists re-serialized as JSON for
/// storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetadata {
    pub app_number: String,
    pub title: String,
    pub applicant: String,
    pub inventor: String,
    pub filing_date: String,
    pub current_status: String,
    pub status_date: String,
    pub examiner: String,
    pub art_unit: String,
    pub customer_number: String,
    // Grant & publication
    pub patent_number: String,
    pub grant_date: String,
    pub publication_number: String,
    pub publication_date: String,
    pub publication_date_bag: String,
    pub publication_sequence_number_bag: String,
    pub publication_category_bag: String,
    // PCT / international
    pub pct_publication_number: String,
    pub pct_publication_date: String,
    pub international_registration_number: String,
    pub international_registration_publication_date: String,
    pub national_stage_indicator: i64,
    // Application type & classification
    pub application_type_code: String,
    pub application_type_label: String,
    pub application_type_category: String,
    pub uspc_class: String,
    pub uspc_subclass: String,
    pub uspc_symbol: String,
    pub cpc_classification_bag: String,
    // Filing & docket
    pub docket_number: String,
    pub confirmation_number: String,
    pub effective_filing_date: String,
    pub first_inventor_to_file: String,
    // Entity status
    pub entity_status: String,
    pub small_entity_indicator: i64,
    pub status_code: Option<i64>,
    // Raw nested lists for storage
    pub applicant_bag: String,
    pub inventor_bag: String,
}

/// Parsed required-endpoint response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationData {
    pub metadata: ApplicationMetadata,
    pub events: Vec<EventFact>,
}

/// Patent term adjustment figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentData {
    pub total_days: i64,
    pub a_delay: i64,
    pub b_delay: i64,
    pub c_delay: i64,
    pub applicant_delay: i64,
    pub overlap_delay: i64,
    pub non_overlap_delay: i64,
    /// Raw adjustment history entries, re-serialized for storage.
    pub history_json: String,
}

/// Whether a continuity entry points at a parent or a child application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContinuityRelation {
    Parent,
    Child,
}

impl std::fmt::Display for ContinuityRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parent => write!(f, "parent"),
            Self::Child => write!(f, "child"),
        }
    }
}

/// One parent or child application in the continuity chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityEntry {
    pub app_number: String,
    pub patent_number: String,
    pub filing_date: String,
    pub status: String,
    pub status_code: i64,
    pub continuity_type: String,
    pub continuity_description: String,
    pub first_inventor_to_file: bool,
}

/// Parsed continuity endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityData {
    pub parents: Vec<ContinuityEntry>,
    pub children: Vec<ContinuityEntry>,
}

/// One file-wrapper document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub document_id: String,
    pub document_code: String,
    pub description: String,
    /// Official date with any time component stripped.
    pub date: String,
    pub direction: String,
    pub page_count: i64,
    /// Raw download option entries, re-serialized for storage.
    pub download_options_json: String,
}

/// A named party on an assignment (assignor or assignee).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyName {
    pub name: String,
    #[serde(default)]
    pub execution_date: String,
}

/// One recorded assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub reel_number: String,
    pub frame_number: String,
    pub reel_frame: String,
    pub page_count: i64,
    pub received_date: String,
    pub recorded_date: String,
    pub mailed_date: String,
    pub conveyance_text: String,
    pub assignors: Vec<PartyName>,
    pub assignees: Vec<PartyName>,
    pub document_url: String,
}

/// One attorney or agent of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttorneyRecord {
    pub registration_number: String,
    pub name: String,
    pub phone: String,
    pub category: String,
}

/// One foreign priority claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignPriorityClaim {
    pub office: String,
    pub application_number: String,
    pub filing_date: String,
}

// ---- Parsing helpers ----

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// String-or-number fields (customer numbers come back as either).
fn str_or_num_field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn i64_field(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn bool_flag(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn bag_json(v: &Value, key: &str) -> String {
    let bag = v.get(key).cloned().unwrap_or_else(|| Value::Array(vec![]));
    serde_json::to_string(&bag).unwrap_or_else(|_| "[]".to_string())
}

/// Parse the required-endpoint response.
///
/// Returns `None` when the top-level `patentFileWrapperDataBag` is missing
/// or empty - the caller treats that the same as a fetch failure.
pub fn parse_application_data(raw: &Value) -> Option<ApplicationData> {
    let wrapper = raw.get("patentFileWrapperDataBag")?.as_array()?.first()?;
    let meta = wrapper.get("applicationMetaData").cloned().unwrap_or(Value::Null);

    let inventors: Vec<String> = meta
        .get("inventorBag")
        .and_then(Value::as_array)
        .map(|bag| {
            bag.iter()
                .map(|inv| str_field(inv, "inventorNameText"))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let applicants: Vec<String> = meta
        .get("applicantBag")
        .and_then(Value::as_array)
        .map(|bag| {
            bag.iter()
                .map(|app| str_field(app, "applicantNameText"))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let entity = meta.get("entityStatusData").cloned().unwrap_or(Value::Null);

    let events = wrapper
        .get("eventDataBag")
        .and_then(Value::as_array)
        .map(|bag| {
            bag.iter()
                .map(|ev| EventFact {
                    code: str_field(ev, "eventCode"),
                    description: str_field(ev, "eventDescriptionText"),
                    date: str_field(ev, "eventDate"),
                })
                .collect()
        })
        .unwrap_or_default();

    let metadata = ApplicationMetadata {
        app_number: str_field(wrapper, "applicationNumberText"),
        title: str_field(&meta, "inventionTitle"),
        applicant: applicants.first().cloned().unwrap_or_default(),
        inventor: inventors.join(", "),
        filing_date: str_field(&meta, "filingDate"),
        current_status: str_field(&meta, "applicationStatusDescriptionText"),
        status_date: str_field(&meta, "applicationStatusDate"),
        examiner: str_field(&meta, "examinerNameText"),
        art_unit: str_field(&meta, "groupArtUnitNumber"),
        customer_number: str_or_num_field(&meta, "customerNumber"),
        patent_number: str_field(&meta, "patentNumber"),
        grant_date: str_field(&meta, "grantDate"),
        publication_number: str_field(&meta, "earliestPublicationNumber"),
        publication_date: str_field(&meta, "earliestPublicationDate"),
        publication_date_bag: bag_json(&meta, "publicationDateBag"),
        publication_sequence_number_bag: bag_json(&meta, "publicationSequenceNumberBag"),
        publication_category_bag: bag_json(&meta, "publicationCategoryBag"),
        pct_publication_number: str_field(&meta, "pctPublicationNumber"),
        pct_publication_date: str_field(&meta, "pctPublicationDate"),
        international_registration_number: str_field(&meta, "internationalRegistrationNumber"),
        international_registration_publication_date: str_field(
            &meta,
            "internationalRegistrationPublicationDate",
        ),
        national_stage_indicator: i64::from(bool_flag(&meta, "nationalStageIndicator")),
        application_type_code: str_field(&meta, "applicationTypeCode"),
        application_type_label: str_field(&meta, "applicationTypeLabelName"),
        application_type_category: str_field(&meta, "applicationTypeCategory"),
        uspc_class: str_field(&meta, "class"),
        uspc_subclass: str_field(&meta, "subclass"),
        uspc_symbol: str_field(&meta, "uspcSymbolText"),
        cpc_classification_bag: bag_json(&meta, "cpcClassificationBag"),
        docket_number: str_field(&meta, "docketNumber"),
        confirmation_number: str_or_num_field(&meta, "applicationConfirmationNumber"),
        effective_filing_date: str_field(&meta, "effectiveFilingDate"),
        first_inventor_to_file: str_field(&meta, "firstInventorToFileIndicator"),
        entity_status: str_field(&entity, "businessEntityStatusCategory"),
        small_entity_indicator: i64::from(bool_flag(&entity, "smallEntityStatusIndicator")),
        status_code: meta.get("applicationStatusCode").and_then(Value::as_i64),
        applicant_bag: bag_json(&meta, "applicantBag"),
        inventor_bag: bag_json(&meta, "inventorBag"),
    };

    Some(ApplicationData { metadata, events })
}

/// Parse the term-adjustment response.
pub fn parse_adjustment_data(raw: &Value) -> AdjustmentData {
    AdjustmentData {
        total_days: i64_field(raw, "adjustmentTotalQuantity"),
        a_delay: i64_field(raw, "aDelayQuantity"),
        b_delay: i64_field(raw, "bDelayQuantity"),
        c_delay: i64_field(raw, "cDelayQuantity"),
        applicant_delay: i64_field(raw, "applicantDayDelayQuantity"),
        overlap_delay: i64_field(raw, "overlappingDayQuantity"),
        non_overlap_delay: i64_field(raw, "nonOverlappingDayQuantity"),
        history_json: bag_json(raw, "patentTermAdjustmentHistoryDataBag"),
    }
}

fn parse_continuity_entry(v: &Value, prefix: &str) -> ContinuityEntry {
    let key = |suffix: &str| format!("{prefix}{suffix}");
    ContinuityEntry {
        app_number: str_field(v, &key("ApplicationNumberText")),
        patent_number: str_field(v, &key("PatentNumber")),
        filing_date: str_field(v, &key("ApplicationFilingDate")),
        status: str_field(v, &key("ApplicationStatusDescriptionText")),
        status_code: i64_field(v, &key("ApplicationStatusCode")),
        continuity_type: str_field(v, "claimParentageTypeCode"),
        continuity_description: str_field(v, "claimParentageTypeCodeDescriptionText"),
        first_inventor_to_file: bool_flag(v, "firstInventorToFileIndicator"),
    }
}

/// Parse the continuity response into parent and child chains.
pub fn parse_continuity_data(raw: &Value) -> ContinuityData {
    let entries = |bag_key: &str, prefix: &str| {
        raw.get(bag_key)
            .and_then(Value::as_array)
            .map(|bag| bag.iter().map(|v| parse_continuity_entry(v, prefix)).collect())
            .unwrap_or_default()
    };
    ContinuityData {
        parents: entries("parentContinuityBag", "parent"),
        children: entries("childContinuityBag", "child"),
    }
}

/// Parse the documents response.
pub fn parse_documents_data(raw: &Value) -> Vec<DocumentInfo> {
    let Some(bag) = raw.get("documentBag").and_then(Value::as_array) else {
        return Vec::new();
    };

    bag.iter()
        .map(|doc| {
            let options = doc
                .get("downloadOptionBag")
                .cloned()
                .unwrap_or_else(|| Value::Array(vec![]));

            // First option that reports a page total wins.
            let page_count = options
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|o| o.get("pageTotalQuantity").and_then(Value::as_i64))
                .find(|&n| n > 0)
                .unwrap_or(0);

            let official_date = str_field(doc, "officialDate");
            let date = official_date
                .split_once('T')
                .map(|(d, _)| d.to_string())
                .unwrap_or(official_date);

            DocumentInfo {
                document_id: str_field(doc, "documentIdentifier"),
                document_code: str_field(doc, "documentCode"),
                description: str_field(doc, "documentCodeDescriptionText"),
                date,
                direction: str_field(doc, "documentDirectionCategory"),
                page_count,
                download_options_json: serde_json::to_string(&options)
                    .unwrap_or_else(|_| "[]".to_string()),
            }
        })
        .collect()
}

fn parse_parties(v: &Value, bag_key: &str, name_keys: &[&str]) -> Vec<PartyName> {
    v.get(bag_key)
        .and_then(Value::as_array)
        .map(|bag| {
            bag.iter()
                .map(|p| PartyName {
                    name: name_keys
                        .iter()
                        .map(|k| str_field(p, k))
                        .find(|n| !n.is_empty())
                        .unwrap_or_default(),
                    execution_date: str_field(p, "executionDate"),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the assignment response.
pub fn parse_assignment_data(raw: &Value) -> Vec<AssignmentRecord> {
    let Some(bag) = raw.get("patentAssignmentBag").and_then(Value::as_array) else {
        return Vec::new();
    };

    bag.iter()
        .map(|a| AssignmentRecord {
            reel_number: str_or_num_field(a, "reelNumber"),
            frame_number: str_or_num_field(a, "frameNumber"),
            reel_frame: str_field(a, "reelAndFrameNumber"),
            page_count: i64_field(a, "pageTotalQuantity"),
            received_date: str_field(a, "assignmentReceivedDate"),
            recorded_date: str_field(a, "assignmentRecordedDate"),
            mailed_date: str_field(a, "assignmentMailedDate"),
            conveyance_text: str_field(a, "conveyanceText"),
            assignors: parse_parties(a, "assignorBag", &["assignorName", "name"]),
            assignees: parse_parties(a, "assigneeBag", &["assigneeNameText", "name"]),
            document_url: str_field(a, "assignmentDocumentLocationURI"),
        })
        .collect()
}

/// Parse the attorney response.
pub fn parse_attorney_data(raw: &Value) -> Vec<AttorneyRecord> {
    let Some(bag) = raw.get("attorneyBag").and_then(Value::as_array) else {
        return Vec::new();
    };

    bag.iter()
        .map(|a| {
            let name = {
                let full = str_field(a, "attorneyNameText");
                if full.is_empty() {
                    let first = str_field(a, "firstName");
                    let last = str_field(a, "lastName");
                    [first, last]
                        .iter()
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(" ")
                } else {
                    full
                }
            };
            AttorneyRecord {
                registration_number: str_or_num_field(a, "registrationNumber"),
                name,
                phone: str_field(a, "telephoneNumber"),
                category: str_field(a, "practitionerCategory"),
            }
        })
        .collect()
}

/// Parse the foreign-priority response.
pub fn parse_foreign_priority_data(raw: &Value) -> Vec<ForeignPriorityClaim> {
    raw.get("foreignPriorityBag")
        .and_then(Value::as_array)
        .map(|bag| {
            bag.iter()
                .map(|c| ForeignPriorityClaim {
                    office: str_field(c, "ipOfficeName"),
                    application_number: str_field(c, "applicationNumberText"),
                    filing_date: str_field(c, "filingDate"),
                })
                .collect()
        })
        .unwrap_or_default()
}

// ---- Expiration ----

/// Patent expiration: filing date + 20 years + term adjustment days.
///
/// A Feb 29 filing whose 20-year anniversary lands in a non-leap year is
/// clamped to Feb 28 before the adjustment days are added. An absent or
/// unparsable filing date yields `None`, never an error.
pub fn calculate_expiration_date(filing_date: &str, pta_days: i64) -> Option<String> {
    let filing = NaiveDate::parse_from_str(filing_date.trim(), "%Y-%m-%d").ok()?;
    let anniversary = filing
        .with_year(filing.year() + 20)
        .or_else(|| NaiveDate::from_ymd_opt(filing.year() + 20, 2, 28))?;
    let expiration = anniversary + chrono::Duration::days(pta_days);
    Some(expiration.format("%Y-%m-%d").to_string())
}

// ---- Significant events ----

/// Event codes that indicate significant prosecution milestones.
pub const SIGNIFICANT_EVENT_CODES: &[(&str, &str)] = &[
    ("CTNF", "Non-Final Rejection"),
    ("CTFR", "Final Rejection"),
    ("NOA", "Notice of Allowance"),
    ("IEXX", "Initial Examination"),
    ("DOCK", "Docketed to Examiner"),
    ("ABN", "Abandonment"),
    ("ISSUE", "Patent Issued"),
    ("RCE", "RCE Filed"),
    ("BRCE", "RCE - Begin"),
    ("IDSC", "IDS Considered"),
    ("WIDS", "IDS Filed"),
    ("RESP", "Response Filed"),
    ("A...", "Amendment/Response"),
];

const SIGNIFICANT_PREFIXES: &[&str] = &["CT", "NOA", "ABN", "ISSUE", "RCE", "MAIL"];

/// Whether an event code represents a significant status change.
pub fn is_significant_event(event_code: &str) -> bool {
    SIGNIFICANT_EVENT_CODES.iter().any(|(c, _)| *c == event_code)
        || SIGNIFICANT_PREFIXES.iter().any(|p| event_code.starts_with(p))
}

// ---- Data source seam ----

/// The remote endpoints the reconciliation engine consumes.
///
/// `UsptoClient` is the production implementation; tests substitute stubs.
/// All operations take a normalized application number.
pub trait PatentDataSource: Send + Sync {
    /// Required endpoint. Any failure here aborts the sync for the record.
    fn fetch_application(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<ApplicationData, UsptoError>> + Send;

    /// Optional. `Ok(None)` means the application has no adjustment data.
    fn fetch_adjustment(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<Option<AdjustmentData>, UsptoError>> + Send;

    fn fetch_continuity(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<ContinuityData, UsptoError>> + Send;

    fn fetch_documents(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<Vec<DocumentInfo>, UsptoError>> + Send;

    fn fetch_assignment(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<Vec<AssignmentRecord>, UsptoError>> + Send;

    fn fetch_attorney(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<Vec<AttorneyRecord>, UsptoError>> + Send;

    fn fetch_foreign_priority(
        &self,
        app_number: &str,
    ) -> impl Future<Output = Result<Vec<ForeignPriorityClaim>, UsptoError>> + Send;
}

// ---- HTTP client ----

/// Request configuration for the USPTO client.
#[derive(Debug, Clone)]
pub struct UsptoClientConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Timeout for the lightweight key-validation probe.
    pub probe_timeout_secs: u64,
    pub base_url: String,
}

impl Default for UsptoClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            probe_timeout_secs: 15,
            base_url: USPTO_API_BASE.to_string(),
        }
    }
}

/// USPTO Open Data Portal client.
///
/// The API key is read from the credential store per request, so a key
/// updated in Settings takes effect without rebuilding the client. A
/// missing key fails before any network access.
pub struct UsptoClient {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl UsptoClient {
    pub fn new(config: UsptoClientConfig) -> Result<Self, UsptoError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UsptoError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    fn api_key() -> Result<Zeroizing<String>, UsptoError> {
        Credentials::get_api_key()?.ok_or(UsptoError::MissingKey)
    }

    /// GET a JSON endpoint. `Ok(None)` is a 404; auth failures and other
    /// non-success statuses are typed errors.
    async fn get_json(&self, url: &str) -> Result<Option<Value>, UsptoError> {
        let key = Self::api_key()?;
        let resp = self
            .client
            .get(url)
            .header("X-API-Key", key.as_str())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            s if s.is_success() => {
                let value = resp.json().await.map_err(transport_error)?;
                Ok(Some(value))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UsptoError::AuthFailed),
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                // Log size only, response bodies can carry account details.
                if let Ok(body) = resp.text().await {
                    tracing::debug!(%status, bytes = body.len(), "USPTO API error response");
                }
                Err(UsptoError::Status(status))
            }
        }
    }

    fn endpoint(&self, app_number: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/{}", self.base_url, app_number)
        } else {
            format!("{}/{}/{}", self.base_url, app_number, suffix)
        }
    }

    /// Validate an API key with a lightweight probe against a known
    /// application. Returns false for any failure.
    pub async fn validate_api_key(&self, api_key: &str) -> bool {
        let url = self.endpoint("17940142", "");
        let probe = match Client::builder().timeout(self.probe_timeout).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        match probe
            .get(&url)
            .header("X-API-Key", api_key)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

impl PatentDataSource for UsptoClient {
    async fn fetch_application(&self, app_number: &str) -> Result<ApplicationData, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "");
        let raw = self
            .get_json(&url)
            .await?
            .ok_or_else(|| UsptoError::NotFound(format_app_number(&app)))?;

        if raw.get("count").and_then(Value::as_i64).unwrap_or(0) == 0 {
            return Err(UsptoError::NotFound(format_app_number(&app)));
        }

        parse_application_data(&raw)
            .ok_or_else(|| UsptoError::Parse("missing patentFileWrapperDataBag".to_string()))
    }

    async fn fetch_adjustment(&self, app_number: &str) -> Result<Option<AdjustmentData>, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "adjustment");
        Ok(self.get_json(&url).await?.map(|raw| parse_adjustment_data(&raw)))
    }

    async fn fetch_continuity(&self, app_number: &str) -> Result<ContinuityData, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "continuity");
        Ok(self
            .get_json(&url)
            .await?
            .map(|raw| parse_continuity_data(&raw))
            .unwrap_or_default())
    }

    async fn fetch_documents(&self, app_number: &str) -> Result<Vec<DocumentInfo>, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "documents");
        Ok(self
            .get_json(&url)
            .await?
            .map(|raw| parse_documents_data(&raw))
            .unwrap_or_default())
    }

    async fn fetch_assignment(&self, app_number: &str) -> Result<Vec<AssignmentRecord>, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "assignment");
        Ok(self
            .get_json(&url)
            .await?
            .map(|raw| parse_assignment_data(&raw))
            .unwrap_or_default())
    }

    async fn fetch_attorney(&self, app_number: &str) -> Result<Vec<AttorneyRecord>, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "attorney");
        Ok(self
            .get_json(&url)
            .await?
            .map(|raw| parse_attorney_data(&raw))
            .unwrap_or_default())
    }

    async fn fetch_foreign_priority(
        &self,
        app_number: &str,
    ) -> Result<Vec<ForeignPriorityClaim>, UsptoError> {
        let app = normalize_app_number(app_number);
        let url = self.endpoint(&app, "foreign-priority");
        Ok(self
            .get_json(&url)
            .await?
            .map(|raw| parse_foreign_priority_data(&raw))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_app_number("17/940,142"), "17940142");
        assert_eq!(normalize_app_number(" 17 940 142 "), "17940142");
        assert_eq!(normalize_app_number("17940142"), "17940142");
    }

    #[test]
    fn format_round_trips_through_normalize() {
        let norm = normalize_app_number("17/940,142");
        assert_eq!(format_app_number(&norm), "17/940,142");
        assert_eq!(normalize_app_number(&format_app_number(&norm)), norm);
    }

    #[test]
    fn format_leaves_short_numbers_alone() {
        assert_eq!(format_app_number("1234567"), "1234567");
    }

    #[test]
    fn format_passes_non_ascii_input_through() {
        // Raw user input reaches this in error messages before any
        // validation; it must never panic on multi-byte text.
        assert_eq!(format_app_number("日本語の出願"), "日本語の出願");
        assert_eq!(format_app_number("17/940,142é"), "17940142é");
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(validate_app_number("17/940,142").is_ok());
        assert!(validate_app_number("").is_err());
        assert!(validate_app_number("  / , ").is_err());
        assert!(validate_app_number("17-940").is_err());
    }

    #[test]
    fn expiration_adds_twenty_years_and_pta() {
        assert_eq!(
            calculate_expiration_date("2020-03-15", 0).as_deref(),
            Some("2040-03-15")
        );
        assert_eq!(
            calculate_expiration_date("2020-03-15", 100).as_deref(),
            Some("2040-06-23")
        );
    }

    #[test]
    fn expiration_clamps_leap_day_to_feb_28() {
        // 2080 is a leap year; 2100 is not.
        assert_eq!(
            calculate_expiration_date("2080-02-29", 0).as_deref(),
            Some("2100-02-28")
        );
        // 2000 -> 2020 are both leap years, no clamp.
        assert_eq!(
            calculate_expiration_date("2000-02-29", 0).as_deref(),
            Some("2020-02-29")
        );
    }

    #[test]
    fn expiration_undefined_for_bad_filing_date() {
        assert_eq!(calculate_expiration_date("", 0), None);
        assert_eq!(calculate_expiration_date("not-a-date", 45), None);
    }

    #[test]
    fn parse_application_rejects_missing_wrapper() {
        assert!(parse_application_data(&json!({})).is_none());
        assert!(parse_application_data(&json!({ "patentFileWrapperDataBag": [] })).is_none());
        assert!(parse_application_data(&json!({ "patentFileWrapperDataBag": "bogus" })).is_none());
    }

    #[test]
    fn parse_application_extracts_metadata_and_events() {
        let raw = json!({
            "count": 1,
            "patentFileWrapperDataBag": [{
                "applicationNumberText": "17940142",
                "applicationMetaData": {
                    "inventionTitle": "Widget",
                    "filingDate": "2022-09-07",
                    "applicationStatusDescriptionText": "Docketed",
                    "applicationStatusDate": "2023-01-10",
                    "examinerNameText": "SMITH, JANE",
                    "groupArtUnitNumber": "2876",
                    "customerNumber": 12345,
                    "applicationStatusCode": 30,
                    "applicantBag": [{ "applicantNameText": "Acme Corp" }],
                    "inventorBag": [
                        { "inventorNameText": "Ada Lovelace" },
                        { "inventorNameText": "Charles Babbage" }
                    ],
                    "entityStatusData": {
                        "businessEntityStatusCategory": "SMALL",
                        "smallEntityStatusIndicator": true
                    }
                },
                "eventDataBag": [
                    { "eventCode": "CTNF", "eventDescriptionText": "Non-Final Rejection", "eventDate": "2023-01-10" },
                    { "eventCode": "DOCK", "eventDescriptionText": "Docketed", "eventDate": "2022-11-02" }
                ]
            }]
        });

        let parsed = parse_application_data(&raw).unwrap();
        assert_eq!(parsed.metadata.app_number, "17940142");
        assert_eq!(parsed.metadata.title, "Widget");
        assert_eq!(parsed.metadata.applicant, "Acme Corp");
        assert_eq!(parsed.metadata.inventor, "Ada Lovelace, Charles Babbage");
        assert_eq!(parsed.metadata.customer_number, "12345");
        assert_eq!(parsed.metadata.entity_status, "SMALL");
        assert_eq!(parsed.metadata.small_entity_indicator, 1);
        assert_eq!(parsed.metadata.status_code, Some(30));
        assert_eq!(parsed.events.len(), 2);
        assert_eq!(parsed.events[0].code, "CTNF");
    }

    #[test]
    fn parse_adjustment_defaults_missing_fields_to_zero() {
        let parsed = parse_adjustment_data(&json!({ "adjustmentTotalQuantity": 154 }));
        assert_eq!(parsed.total_days, 154);
        assert_eq!(parsed.b_delay, 0);
        assert_eq!(parsed.history_json, "[]");
    }

    #[test]
    fn parse_continuity_splits_parents_and_children() {
        let raw = json!({
            "parentContinuityBag": [{
                "parentApplicationNumberText": "16111222",
                "parentApplicationStatusCode": 150,
                "claimParentageTypeCode": "CON",
                "firstInventorToFileIndicator": true
            }],
            "childContinuityBag": [{
                "childApplicationNumberText": "18333444",
                "claimParentageTypeCode": "DIV"
            }]
        });
        let parsed = parse_continuity_data(&raw);
        assert_eq!(parsed.parents.len(), 1);
        assert_eq!(parsed.parents[0].app_number, "16111222");
        assert_eq!(parsed.parents[0].status_code, 150);
        assert!(parsed.parents[0].first_inventor_to_file);
        assert_eq!(parsed.children.len(), 1);
        assert_eq!(parsed.children[0].continuity_type, "DIV");
    }

    #[test]
    fn parse_documents_strips_time_and_finds_page_count() {
        let raw = json!({
            "documentBag": [{
                "documentIdentifier": "DOC-1",
                "documentCode": "CTNF",
                "documentCodeDescriptionText": "Non-Final Rejection",
                "officialDate": "2023-01-10T05:00:00Z",
                "documentDirectionCategory": "OUTGOING",
                "downloadOptionBag": [
                    { "mimeTypeIdentifier": "XML" },
                    { "mimeTypeIdentifier": "PDF", "pageTotalQuantity": 12 }
                ]
            }]
        });
        let docs = parse_documents_data(&raw);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].date, "2023-01-10");
        assert_eq!(docs[0].page_count, 12);
    }

    #[test]
    fn parse_assignment_collects_parties() {
        let raw = json!({
            "patentAssignmentBag": [{
                "reelNumber": 60123,
                "frameNumber": 777,
                "conveyanceText": "ASSIGNMENT OF ASSIGNORS INTEREST",
                "assignorBag": [{ "assignorName": "Ada Lovelace", "executionDate": "2022-10-01" }],
                "assigneeBag": [{ "assigneeNameText": "Acme Corp" }]
            }]
        });
        let parsed = parse_assignment_data(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].reel_number, "60123");
        assert_eq!(parsed[0].assignors[0].name, "Ada Lovelace");
        assert_eq!(parsed[0].assignors[0].execution_date, "2022-10-01");
        assert_eq!(parsed[0].assignees[0].name, "Acme Corp");
    }

    #[test]
    fn parse_attorney_joins_split_names() {
        let raw = json!({
            "attorneyBag": [
                { "registrationNumber": 54321, "firstName": "Grace", "lastName": "Hopper" },
                { "attorneyNameText": "Turing, Alan", "practitionerCategory": "AGENT" }
            ]
        });
        let parsed = parse_attorney_data(&raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].registration_number, "54321");
        assert_eq!(parsed[0].name, "Grace Hopper");
        assert_eq!(parsed[1].category, "AGENT");
    }

    #[test]
    fn parse_foreign_priority_handles_missing_bag() {
        assert!(parse_foreign_priority_data(&json!({})).is_empty());
        let raw = json!({
            "foreignPriorityBag": [{
                "ipOfficeName": "JAPAN",
                "applicationNumberText": "2021-123456",
                "filingDate": "2021-06-30"
            }]
        });
        let claims = parse_foreign_priority_data(&raw);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].office, "JAPAN");
    }

    #[test]
    fn significant_events_match_codes_and_prefixes() {
        assert!(is_significant_event("CTNF"));
        assert!(is_significant_event("NOA"));
        assert!(is_significant_event("MAIL.NOA"));
        assert!(!is_significant_event("WIDTS"));
        assert!(!is_significant_event("XYZ"));
    }
}

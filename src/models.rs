use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            other => Err(ParseEnumError::new("role", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    #[default]
    Campus,
    Remote,
    Quarantined,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Campus => "campus",
            LocationStatus::Remote => "remote",
            LocationStatus::Quarantined => "quarantined",
        }
    }

    /// Locations that keep a member off campus regardless of health.
    pub fn blocks_entry(&self) -> bool {
        matches!(self, LocationStatus::Remote | LocationStatus::Quarantined)
    }
}

impl FromStr for LocationStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "campus" => Ok(LocationStatus::Campus),
            "remote" => Ok(LocationStatus::Remote),
            "quarantined" => Ok(LocationStatus::Quarantined),
            other => Err(ParseEnumError::new("location", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VaccinationStatus {
    Vaccinated,
    #[default]
    NotVaccinated,
}

impl VaccinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VaccinationStatus::Vaccinated => "vaccinated",
            VaccinationStatus::NotVaccinated => "not_vaccinated",
        }
    }
}

impl FromStr for VaccinationStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "vaccinated" => Ok(VaccinationStatus::Vaccinated),
            "not_vaccinated" => Ok(VaccinationStatus::NotVaccinated),
            other => Err(ParseEnumError::new("vaccination", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Inactive,
    Active,
    SchoolSwitched,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Inactive => "inactive",
            MemberStatus::Active => "active",
            MemberStatus::SchoolSwitched => "school_switched",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inactive" => Ok(MemberStatus::Inactive),
            "active" => Ok(MemberStatus::Active),
            "school_switched" => Ok(MemberStatus::SchoolSwitched),
            other => Err(ParseEnumError::new("member status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Positive,
    Negative,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Positive => "positive",
            TestType::Negative => "negative",
        }
    }
}

impl FromStr for TestType {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "positive" => Ok(TestType::Positive),
            "negative" => Ok(TestType::Negative),
            other => Err(ParseEnumError::new("test type", other)),
        }
    }
}

/// Who filed a report. Admin reports may overwrite a member's report for the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportProvenance {
    #[default]
    Member,
    Admin,
}

impl ReportProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportProvenance::Member => "member",
            ReportProvenance::Admin => "admin",
        }
    }
}

impl FromStr for ReportProvenance {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "member" => Ok(ReportProvenance::Member),
            "admin" => Ok(ReportProvenance::Admin),
            other => Err(ParseEnumError::new("report provenance", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub email: String,
    pub school: String,
    pub first_name: String,
    pub last_name: String,
    pub cohort: Option<String>,
    pub role: Role,
    pub location: LocationStatus,
    pub vaccination: VaccinationStatus,
    pub status: MemberStatus,
    pub disabled: bool,
}

impl Member {
    pub fn display_name(&self) -> String {
        display_name(&self.first_name, &self.last_name, &self.email)
    }
}

pub fn display_name(first_name: &str, last_name: &str, email: &str) -> String {
    let full = format!("{} {}", first_name.trim(), last_name.trim());
    let full = full.trim();
    if full.is_empty() {
        email.to_string()
    } else {
        full.to_string()
    }
}

/// Emails are matched case-insensitively; stored and looked-up addresses go through this.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn normalized_email<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(|email| normalize_email(&email))
}

pub(crate) fn normalized_emails<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let emails = Vec::<String>::deserialize(deserializer)?;
    Ok(emails.iter().map(|email| normalize_email(email)).collect())
}

/// Enrollment payload. Existing (email, school) pairs are refreshed, not duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMember {
    #[serde(deserialize_with = "normalized_email")]
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub cohort: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub location: LocationStatus,
    #[serde(default)]
    pub vaccination: VaccinationStatus,
}

/// Partial property update applied to one or all campus copies of a member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub location: Option<LocationStatus>,
    pub vaccination: Option<VaccinationStatus>,
    pub status: Option<MemberStatus>,
    pub disabled: Option<bool>,
}

impl MemberUpdate {
    pub fn apply(&self, member: &mut Member) {
        if let Some(location) = self.location {
            member.location = location;
        }
        if let Some(vaccination) = self.vaccination {
            member.vaccination = vaccination;
        }
        if let Some(status) = self.status {
            member.status = status;
        }
        if let Some(disabled) = self.disabled {
            member.disabled = disabled;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberScope {
    /// Only the copy at the given school.
    School,
    /// Every campus copy sharing the email.
    AllCampuses,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub num_symptoms: Option<u32>,
    #[serde(default)]
    pub proximity: Option<bool>,
    #[serde(default)]
    pub test_type: Option<TestType>,
    #[serde(default)]
    pub commercial_flight: Option<bool>,
}

/// Upper bound on `num_symptoms`; the symptom checklist is far shorter.
pub const MAX_REPORTED_SYMPTOMS: u32 = 100;

impl HealthReport {
    pub fn validate(&self) -> Result<(), String> {
        match self.num_symptoms {
            Some(count) if count > MAX_REPORTED_SYMPTOMS => Err(format!(
                "num_symptoms must be at most {MAX_REPORTED_SYMPTOMS}, got {count}"
            )),
            _ => Ok(()),
        }
    }

    /// A report that only records a test result; these may update a locked day.
    pub fn is_test_only(&self) -> bool {
        self.test_type.is_some()
            && self.num_symptoms.is_none()
            && self.proximity.is_none()
            && self.commercial_flight.is_none()
    }

    /// Overwrite fields with the non-null fields of `other`.
    pub fn merge_from(&mut self, other: &HealthReport) {
        if other.num_symptoms.is_some() {
            self.num_symptoms = other.num_symptoms;
        }
        if other.proximity.is_some() {
            self.proximity = other.proximity;
        }
        if other.test_type.is_some() {
            self.test_type = other.test_type;
        }
        if other.commercial_flight.is_some() {
            self.commercial_flight = other.commercial_flight;
        }
    }
}

/// The `reported` edge between a member and a school's daily report node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub email: String,
    pub school: String,
    pub day: NaiveDate,
    pub report: HealthReport,
    pub risk_score: i32,
    pub provenance: ReportProvenance,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Created,
    Updated,
    Locked,
}

/// Decide how an incoming report lands on the member's day.
pub fn resolve_report_write(
    existing: Option<&HealthReport>,
    incoming: &HealthReport,
    provenance: ReportProvenance,
) -> (ReportOutcome, Option<HealthReport>) {
    match existing {
        None => (ReportOutcome::Created, Some(incoming.clone())),
        Some(current) if provenance == ReportProvenance::Admin || incoming.is_test_only() => {
            let mut merged = current.clone();
            merged.merge_from(incoming);
            (ReportOutcome::Updated, Some(merged))
        }
        Some(_) => (ReportOutcome::Locked, None),
    }
}

/// An `interacted_with` edge. Undirected; endpoints are stored in no particular order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub email_a: String,
    pub email_b: String,
    pub interacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionUpsert {
    Created,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// Detach-delete every campus copy of the member.
    AllCampuses,
    /// Detach-delete only the copy at one school.
    SchoolCopy,
}

/// Calendar day of a school report, shifted by the configured UTC offset.
pub fn report_day(now: DateTime<Utc>, utc_offset_hours: i32) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_hours * 3600) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use serde::{Deserialize, Serialize};

use crate::models::{HealthReport, LocationStatus, TestType, VaccinationStatus};
use crate::secrets::lenient;

/// Per-school thresholds and weights used to classify a daily health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomCriteria {
    #[serde(deserialize_with = "lenient::as_u32")]
    pub minimum_symptoms: u32,
    #[serde(default, deserialize_with = "lenient::as_i32")]
    pub score_per_symptom: i32,
    #[serde(default, deserialize_with = "lenient::as_i32")]
    pub score_positive_test: i32,
    #[serde(default, deserialize_with = "lenient::as_i32")]
    pub score_proximity: i32,
    #[serde(default, deserialize_with = "lenient::as_i32")]
    pub score_commercial_travel: i32,
    #[serde(default, deserialize_with = "lenient::as_bool")]
    pub ignore_vaccine: bool,
}

impl Default for SymptomCriteria {
    fn default() -> Self {
        Self {
            minimum_symptoms: 2,
            score_per_symptom: 1,
            score_positive_test: 10,
            score_proximity: 5,
            score_commercial_travel: 3,
            ignore_vaccine: false,
        }
    }
}

/// Ordered by severity: a later variant always wins when factors are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    Healthy,
    Incomplete,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskFactor {
    Incomplete,
    Healthy,
    Symptomatic { count: u32 },
    PositiveTest,
    NegativeTest,
    Proximity,
    CommercialTravel,
    Vaccinated,
    Blocked { location: LocationStatus },
}

impl RiskFactor {
    pub fn color(&self) -> StatusColor {
        match self {
            RiskFactor::Incomplete => StatusColor::Incomplete,
            RiskFactor::Healthy | RiskFactor::NegativeTest | RiskFactor::Vaccinated => {
                StatusColor::Healthy
            }
            RiskFactor::Symptomatic { .. }
            | RiskFactor::PositiveTest
            | RiskFactor::Proximity
            | RiskFactor::CommercialTravel
            | RiskFactor::Blocked { .. } => StatusColor::Unhealthy,
        }
    }

    pub fn label(&self) -> String {
        match self {
            RiskFactor::Incomplete => "No Report".to_string(),
            RiskFactor::Healthy => "Healthy".to_string(),
            RiskFactor::Symptomatic { count } => format!("{count} symptoms"),
            RiskFactor::PositiveTest => "Positive Test".to_string(),
            RiskFactor::NegativeTest => "Negative Test".to_string(),
            RiskFactor::Proximity => "COVID Proximity".to_string(),
            RiskFactor::CommercialTravel => "Commercial Travel".to_string(),
            RiskFactor::Vaccinated => "Fully Vaccinated".to_string(),
            RiskFactor::Blocked { location } => format!("Location: {location}"),
        }
    }
}

pub fn format_criteria(factors: &[RiskFactor], joiner: &str) -> String {
    factors
        .iter()
        .map(RiskFactor::label)
        .collect::<Vec<_>>()
        .join(joiner)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub color: StatusColor,
    pub factors: Vec<RiskFactor>,
    pub risk_score: i32,
    pub vaccinated: bool,
    #[serde(skip)]
    downgrade_unhealthy: bool,
}

impl HealthAssessment {
    fn empty() -> Self {
        Self {
            color: StatusColor::Healthy,
            factors: Vec::new(),
            risk_score: 0,
            vaccinated: false,
            downgrade_unhealthy: false,
        }
    }

    pub fn incomplete() -> Self {
        let mut assessment = Self::empty();
        assessment.push(RiskFactor::Incomplete);
        assessment
    }

    /// Assessment for a reported day; `None` means the member has not reported.
    pub fn from_daily(report: Option<&HealthReport>, criteria: &SymptomCriteria) -> Self {
        match report {
            Some(report) => Self::from_report(report, criteria),
            None => Self::incomplete(),
        }
    }

    pub fn from_report(report: &HealthReport, criteria: &SymptomCriteria) -> Self {
        let mut assessment = Self::empty();

        if let Some(count) = report.num_symptoms {
            if count > 0 && count >= criteria.minimum_symptoms {
                assessment.push(RiskFactor::Symptomatic { count });
                let count = i32::try_from(count).unwrap_or(i32::MAX);
                assessment.add_score(criteria.score_per_symptom.saturating_mul(count));
            }
        }
        match report.test_type {
            Some(TestType::Positive) => {
                assessment.push(RiskFactor::PositiveTest);
                assessment.add_score(criteria.score_positive_test);
            }
            Some(TestType::Negative) => assessment.push(RiskFactor::NegativeTest),
            None => {}
        }
        if report.proximity == Some(true) {
            assessment.push(RiskFactor::Proximity);
            assessment.add_score(criteria.score_proximity);
        }
        if report.commercial_flight == Some(true) {
            assessment.push(RiskFactor::CommercialTravel);
            assessment.add_score(criteria.score_commercial_travel);
        }
        if assessment.factors.is_empty() {
            assessment.push(RiskFactor::Healthy);
        }

        assessment
    }

    fn add_score(&mut self, points: i32) {
        self.risk_score = self.risk_score.saturating_add(points);
    }

    /// Vaccination can soften unhealthy to warning; it never clears a status.
    pub fn with_vaccination(
        mut self,
        status: VaccinationStatus,
        criteria: &SymptomCriteria,
    ) -> Self {
        if status != VaccinationStatus::Vaccinated {
            return self;
        }

        self.vaccinated = true;
        self.factors.push(RiskFactor::Vaccinated);
        if !criteria.ignore_vaccine {
            self.downgrade_unhealthy = true;
            if self.color == StatusColor::Unhealthy {
                self.color = StatusColor::Warning;
            }
        }
        self
    }

    pub fn push(&mut self, factor: RiskFactor) {
        let mut color = factor.color();
        if self.downgrade_unhealthy && color == StatusColor::Unhealthy {
            color = StatusColor::Warning;
        }
        self.color = self.color.max(color);
        self.factors.push(factor);
    }

    pub fn is_incomplete(&self) -> bool {
        self.color == StatusColor::Incomplete
    }

    pub fn at_risk(&self, include_warning: bool) -> bool {
        self.color == StatusColor::Unhealthy
            || (include_warning && self.color == StatusColor::Warning)
    }

    pub fn criteria(&self) -> String {
        format_criteria(&self.factors, " & ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationAssessment {
    pub location: LocationStatus,
    pub color: StatusColor,
}

impl LocationAssessment {
    pub fn new(location: LocationStatus) -> Self {
        let color = if location.blocks_entry() {
            StatusColor::Unhealthy
        } else {
            StatusColor::Healthy
        };
        Self { location, color }
    }

    pub fn entry_blocked(&self) -> bool {
        self.color == StatusColor::Unhealthy
    }

    pub fn factor(&self) -> RiskFactor {
        if self.entry_blocked() {
            RiskFactor::Blocked {
                location: self.location,
            }
        } else {
            RiskFactor::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    Health,
    Location,
}

/// Whether a member may enter school today, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryDecision {
    pub name: String,
    pub entry: bool,
    pub reason: EntryReason,
    pub health: HealthAssessment,
    pub location: LocationAssessment,
}

impl EntryDecision {
    pub fn evaluate(name: String, health: HealthAssessment, location: LocationAssessment) -> Self {
        let (entry, reason) = if location.entry_blocked() {
            (false, EntryReason::Location)
        } else if health.is_incomplete() || health.at_risk(true) {
            (false, EntryReason::Health)
        } else {
            (true, EntryReason::Health)
        };

        Self {
            name,
            entry,
            reason,
            health,
            location,
        }
    }
}

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    resolve_report_write, DailyReport, HealthReport, Interaction, InteractionUpsert, Member,
    MemberScope, MemberStatus, MemberUpdate, NewMember, RemovalMode, ReportOutcome,
    ReportProvenance,
};

/// The property graph of members, interactions and daily reports.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn find_member(&self, school: &str, email: &str) -> anyhow::Result<Option<Member>>;

    /// All copies of a member across campuses.
    async fn member_copies(&self, email: &str) -> anyhow::Result<Vec<Member>>;

    async fn members(&self, school: &str) -> anyhow::Result<Vec<Member>>;

    async fn upsert_member(&self, school: &str, member: &NewMember) -> anyhow::Result<Member>;

    async fn update_members(
        &self,
        school: &str,
        email: &str,
        scope: MemberScope,
        update: &MemberUpdate,
    ) -> anyhow::Result<u64>;

    /// Set `school_switched` on every copy of `email` outside `keep_school`.
    async fn mark_switched_except(&self, email: &str, keep_school: &str) -> anyhow::Result<u64>;

    async fn remove_member(&self, school: &str, email: &str, mode: RemovalMode)
        -> anyhow::Result<u64>;

    async fn record_interaction(
        &self,
        school: &str,
        email: &str,
        target: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<InteractionUpsert>;

    async fn interactions_since(
        &self,
        school: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Interaction>>;

    #[allow(clippy::too_many_arguments)]
    async fn save_health_report(
        &self,
        school: &str,
        email: &str,
        day: NaiveDate,
        report: &HealthReport,
        provenance: ReportProvenance,
        risk_score: i32,
        at: DateTime<Utc>,
    ) -> anyhow::Result<ReportOutcome>;

    async fn daily_report(
        &self,
        school: &str,
        email: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Option<DailyReport>>;

    /// Enabled, non-switched members with no report on `day`.
    async fn members_without_report(
        &self,
        school: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<Member>>;
}

#[derive(Default)]
struct MemoryGraph {
    members: Vec<Member>,
    interactions: Vec<(String, Interaction)>,
    reports: Vec<DailyReport>,
}

/// In-process graph used by tests and dry runs.
#[derive(Default)]
pub struct MemoryGraphStore {
    graph: Mutex<MemoryGraph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemoryGraph>> {
        self.graph
            .lock()
            .map_err(|_| anyhow::anyhow!("memory graph lock poisoned"))
    }
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn find_member(&self, school: &str, email: &str) -> anyhow::Result<Option<Member>> {
        let graph = self.lock()?;
        Ok(graph
            .members
            .iter()
            .find(|m| m.school == school && m.email == email)
            .cloned())
    }

    async fn member_copies(&self, email: &str) -> anyhow::Result<Vec<Member>> {
        let graph = self.lock()?;
        Ok(graph
            .members
            .iter()
            .filter(|m| m.email == email)
            .cloned()
            .collect())
    }

    async fn members(&self, school: &str) -> anyhow::Result<Vec<Member>> {
        let graph = self.lock()?;
        let mut members: Vec<Member> = graph
            .members
            .iter()
            .filter(|m| m.school == school)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(members)
    }

    async fn upsert_member(&self, school: &str, member: &NewMember) -> anyhow::Result<Member> {
        let mut graph = self.lock()?;
        if let Some(existing) = graph
            .members
            .iter_mut()
            .find(|m| m.school == school && m.email == member.email)
        {
            existing.first_name = member.first_name.clone();
            existing.last_name = member.last_name.clone();
            existing.cohort = member.cohort.clone();
            existing.role = member.role;
            existing.location = member.location;
            existing.vaccination = member.vaccination;
            existing.status = MemberStatus::Inactive;
            existing.disabled = false;
            return Ok(existing.clone());
        }

        let created = Member {
            id: Uuid::new_v4(),
            email: member.email.clone(),
            school: school.to_string(),
            first_name: member.first_name.clone(),
            last_name: member.last_name.clone(),
            cohort: member.cohort.clone(),
            role: member.role,
            location: member.location,
            vaccination: member.vaccination,
            status: MemberStatus::Inactive,
            disabled: false,
        };
        graph.members.push(created.clone());
        Ok(created)
    }

    async fn update_members(
        &self,
        school: &str,
        email: &str,
        scope: MemberScope,
        update: &MemberUpdate,
    ) -> anyhow::Result<u64> {
        let mut graph = self.lock()?;
        let mut changed = 0;
        for member in graph.members.iter_mut().filter(|m| {
            m.email == email && (scope == MemberScope::AllCampuses || m.school == school)
        }) {
            update.apply(member);
            changed += 1;
        }
        Ok(changed)
    }

    async fn mark_switched_except(&self, email: &str, keep_school: &str) -> anyhow::Result<u64> {
        let mut graph = self.lock()?;
        let mut changed = 0;
        for member in graph
            .members
            .iter_mut()
            .filter(|m| m.email == email && m.school != keep_school)
        {
            member.status = MemberStatus::SchoolSwitched;
            changed += 1;
        }
        Ok(changed)
    }

    async fn remove_member(
        &self,
        school: &str,
        email: &str,
        mode: RemovalMode,
    ) -> anyhow::Result<u64> {
        let mut graph = self.lock()?;
        let doomed = |member_school: &str, member_email: &str| {
            member_email == email && (mode == RemovalMode::AllCampuses || member_school == school)
        };

        let before = graph.members.len();
        graph.members.retain(|m| !doomed(&m.school, &m.email));
        let removed = (before - graph.members.len()) as u64;

        graph.interactions.retain(|(edge_school, edge)| {
            !(doomed(edge_school, &edge.email_a) || doomed(edge_school, &edge.email_b))
        });
        graph.reports.retain(|r| !doomed(&r.school, &r.email));
        Ok(removed)
    }

    async fn record_interaction(
        &self,
        school: &str,
        email: &str,
        target: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<InteractionUpsert> {
        let mut graph = self.lock()?;
        let (a, b) = pair(email, target);
        if let Some((_, edge)) = graph
            .interactions
            .iter_mut()
            .find(|(s, e)| s == school && e.email_a == a && e.email_b == b)
        {
            edge.interacted_at = at;
            return Ok(InteractionUpsert::Refreshed);
        }

        graph.interactions.push((
            school.to_string(),
            Interaction {
                email_a: a,
                email_b: b,
                interacted_at: at,
            },
        ));
        Ok(InteractionUpsert::Created)
    }

    async fn interactions_since(
        &self,
        school: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Interaction>> {
        let graph = self.lock()?;
        Ok(graph
            .interactions
            .iter()
            .filter(|(s, e)| s == school && e.interacted_at >= since)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn save_health_report(
        &self,
        school: &str,
        email: &str,
        day: NaiveDate,
        report: &HealthReport,
        provenance: ReportProvenance,
        risk_score: i32,
        at: DateTime<Utc>,
    ) -> anyhow::Result<ReportOutcome> {
        let mut graph = self.lock()?;
        let position = graph
            .reports
            .iter()
            .position(|r| r.school == school && r.email == email && r.day == day);
        let existing = position.map(|index| graph.reports[index].report.clone());
        let (outcome, written) = resolve_report_write(existing.as_ref(), report, provenance);

        if let Some(written) = written {
            let stored = DailyReport {
                email: email.to_string(),
                school: school.to_string(),
                day,
                report: written,
                risk_score,
                provenance,
                reported_at: at,
            };
            match position {
                Some(index) => graph.reports[index] = stored,
                None => graph.reports.push(stored),
            }
        }

        Ok(outcome)
    }

    async fn daily_report(
        &self,
        school: &str,
        email: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Option<DailyReport>> {
        let graph = self.lock()?;
        Ok(graph
            .reports
            .iter()
            .find(|r| r.school == school && r.email == email && r.day == day)
            .cloned())
    }

    async fn members_without_report(
        &self,
        school: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<Member>> {
        let graph = self.lock()?;
        let reported: HashSet<&str> = graph
            .reports
            .iter()
            .filter(|r| r.school == school && r.day == day)
            .map(|r| r.email.as_str())
            .collect();

        let mut missing: Vec<Member> = graph
            .members
            .iter()
            .filter(|m| {
                m.school == school
                    && !m.disabled
                    && m.status != MemberStatus::SchoolSwitched
                    && !reported.contains(m.email.as_str())
            })
            .cloned()
            .collect();
        missing.sort_by(|a, b| a.last_name.cmp(&b.last_name).then(a.first_name.cmp(&b.first_name)));
        Ok(missing)
    }
}

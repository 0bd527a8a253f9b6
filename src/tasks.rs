use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::models::{
    normalize_email, normalized_email, normalized_emails, report_day, HealthReport,
    LocationStatus, MemberScope, MemberStatus, MemberUpdate, NewMember, RemovalMode,
    ReportOutcome, ReportProvenance, Role, VaccinationStatus,
};
use crate::notify::Mailer;
use crate::queue::TaskQueue;
use crate::report;
use crate::risk::HealthAssessment;
use crate::secrets::{school_path, SecretCache};
use crate::store::GraphStore;
use crate::traversal::{calculate_interaction_risks, lookback_cutoff, TierPlan};
use crate::worker::{run_group, RetryPolicy};

/// Identity a task runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(deserialize_with = "normalized_email")]
    pub email: String,
    pub school: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: Role,
    /// Admin acting on the member's behalf.
    #[serde(default)]
    pub impersonator: Option<String>,
}

impl Sender {
    pub fn impersonated_by(mut self, admin: &Sender) -> Self {
        self.impersonator = Some(admin.email.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum Task {
    #[serde(rename = "tasks.notify_risk")]
    NotifyRisk { criteria: String },
    #[serde(rename = "tasks.report_health")]
    ReportHealth {
        report: HealthReport,
        #[serde(default)]
        provenance: ReportProvenance,
    },
    #[serde(rename = "tasks.report_interaction")]
    ReportInteraction {
        #[serde(deserialize_with = "normalized_emails")]
        targets: Vec<String>,
    },
    #[serde(rename = "tasks.report_vaccination")]
    ReportVaccination { status: VaccinationStatus },
    #[serde(rename = "tasks.report_location_status")]
    ReportLocationStatus { location: LocationStatus },
    #[serde(rename = "tasks.report_active_user")]
    ReportActiveUser,
    #[serde(rename = "tasks.daily_digest")]
    DailyDigest,
    #[serde(rename = "tasks.admin_create_user")]
    AdminCreateUser { member: NewMember },
    #[serde(rename = "tasks.admin_switch_report_node")]
    AdminSwitchReportNode {
        #[serde(deserialize_with = "normalized_email")]
        email: String,
        target_campus: String,
        #[serde(default = "default_merge_existing")]
        merge_existing: bool,
    },
    #[serde(rename = "tasks.admin_delete_user")]
    AdminDeleteUser {
        #[serde(deserialize_with = "normalized_email")]
        email: String,
    },
    #[serde(rename = "tasks.admin_delete_user_copy")]
    AdminDeleteUserCopy {
        #[serde(deserialize_with = "normalized_email")]
        email: String,
    },
    #[serde(rename = "tasks.admin_toggle_access")]
    AdminToggleAccess {
        #[serde(deserialize_with = "normalized_email")]
        email: String,
        disabled: bool,
    },
    #[serde(rename = "tasks.admin_bulk")]
    AdminBulk { tasks: Vec<Task> },
}

fn default_merge_existing() -> bool {
    true
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::NotifyRisk { .. } => "tasks.notify_risk",
            Task::ReportHealth { .. } => "tasks.report_health",
            Task::ReportInteraction { .. } => "tasks.report_interaction",
            Task::ReportVaccination { .. } => "tasks.report_vaccination",
            Task::ReportLocationStatus { .. } => "tasks.report_location_status",
            Task::ReportActiveUser => "tasks.report_active_user",
            Task::DailyDigest => "tasks.daily_digest",
            Task::AdminCreateUser { .. } => "tasks.admin_create_user",
            Task::AdminSwitchReportNode { .. } => "tasks.admin_switch_report_node",
            Task::AdminDeleteUser { .. } => "tasks.admin_delete_user",
            Task::AdminDeleteUserCopy { .. } => "tasks.admin_delete_user_copy",
            Task::AdminToggleAccess { .. } => "tasks.admin_toggle_access",
            Task::AdminBulk { .. } => "tasks.admin_bulk",
        }
    }

    pub fn is_admin(&self) -> bool {
        self.name().starts_with("tasks.admin_")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub sender: Sender,
    pub task: Task,
}

impl TaskEnvelope {
    pub fn new(sender: Sender, task: Task) -> Self {
        Self { sender, task }
    }
}

/// Everything a task handler touches. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<dyn GraphStore>,
    pub secrets: Arc<SecretCache>,
    pub mailer: Arc<dyn Mailer>,
    pub queue: Arc<dyn TaskQueue>,
    pub retry: RetryPolicy,
    pub utc_offset_hours: i32,
}

pub async fn execute(ctx: &TaskContext, envelope: &TaskEnvelope) -> anyhow::Result<()> {
    match &envelope.task {
        Task::AdminBulk { tasks } => admin_bulk(ctx, &envelope.sender, tasks).await,
        task => execute_single(ctx, &envelope.sender, task).await,
    }
}

/// Run one non-bulk task. Bulk children go through here so groups never nest.
pub async fn execute_single(ctx: &TaskContext, sender: &Sender, task: &Task) -> anyhow::Result<()> {
    if task.is_admin() {
        require_admin(sender, task.name())?;
    }

    match task {
        Task::NotifyRisk { criteria } => notify_risk(ctx, sender, criteria).await,
        Task::ReportHealth { report, provenance } => {
            report_health(ctx, sender, report, *provenance).await
        }
        Task::ReportInteraction { targets } => report_interaction(ctx, sender, targets).await,
        Task::ReportVaccination { status } => report_vaccination(ctx, sender, *status).await,
        Task::ReportLocationStatus { location } => {
            set_location(ctx, &sender.school, &sender.email, *location).await
        }
        Task::ReportActiveUser => report_active_user(ctx, sender).await,
        Task::DailyDigest => daily_digest(ctx, sender).await,
        Task::AdminCreateUser { member } => {
            let member = NewMember {
                email: normalize_email(&member.email),
                ..member.clone()
            };
            let created = ctx.store.upsert_member(&sender.school, &member).await?;
            info!("Enrolled {} at {}", created.email, created.school);
            Ok(())
        }
        Task::AdminSwitchReportNode {
            email,
            target_campus,
            merge_existing,
        } => switch_report_node(ctx, sender, email, target_campus, *merge_existing).await,
        Task::AdminDeleteUser { email } => {
            let removed = ctx
                .store
                .remove_member(&sender.school, email, RemovalMode::AllCampuses)
                .await?;
            info!("Deleted {removed} copies of {email}");
            Ok(())
        }
        Task::AdminDeleteUserCopy { email } => {
            let removed = ctx
                .store
                .remove_member(&sender.school, email, RemovalMode::SchoolCopy)
                .await?;
            info!("Deleted {removed} copy of {email} at {}", sender.school);
            Ok(())
        }
        Task::AdminToggleAccess { email, disabled } => {
            let update = MemberUpdate {
                disabled: Some(*disabled),
                ..MemberUpdate::default()
            };
            ctx.store
                .update_members(&sender.school, email, MemberScope::School, &update)
                .await?;
            info!("Set disabled={disabled} for {email} at {}", sender.school);
            Ok(())
        }
        Task::AdminBulk { .. } => bail!("bulk tasks cannot be nested"),
    }
}

fn require_admin(sender: &Sender, task_name: &str) -> anyhow::Result<()> {
    if sender.role != Role::Admin {
        warn!(
            target: "security",
            "{} ({}) attempted {task_name} without admin role",
            sender.email,
            sender.school
        );
        bail!("{} is not an administrator", sender.email);
    }
    Ok(())
}

async fn report_health(
    ctx: &TaskContext,
    sender: &Sender,
    report: &HealthReport,
    provenance: ReportProvenance,
) -> anyhow::Result<()> {
    let member = ctx
        .store
        .find_member(&sender.school, &sender.email)
        .await?
        .with_context(|| format!("{} is not enrolled at {}", sender.email, sender.school))?;

    if member.status == MemberStatus::SchoolSwitched {
        warn!(
            "{} switched away from {}, ignoring health report",
            member.email, member.school
        );
        return Ok(());
    }

    report.validate().map_err(anyhow::Error::msg)?;
    let criteria = ctx.secrets.symptom_criteria(&sender.school).await?;
    let assessment = HealthAssessment::from_report(report, &criteria);

    let now = Utc::now();
    let day = report_day(now, ctx.utc_offset_hours);
    let outcome = ctx
        .store
        .save_health_report(
            &sender.school,
            &sender.email,
            day,
            report,
            provenance,
            assessment.risk_score,
            now,
        )
        .await
        .context("failed to save health report")?;

    match outcome {
        ReportOutcome::Created => info!("Recorded report for {} on {day}", member.email),
        ReportOutcome::Updated => info!("Merged report for {} on {day}", member.email),
        ReportOutcome::Locked => info!(
            "Report for {} on {day} is locked, keeping the existing one",
            member.email
        ),
    }

    if assessment.at_risk(false) {
        let envelope = TaskEnvelope::new(
            sender.clone(),
            Task::NotifyRisk {
                criteria: assessment.criteria(),
            },
        );
        let id = ctx.queue.enqueue(&envelope).await?;
        warn!(
            "Report for {} indicates possible COVID-19 ({}), queued notification {id}",
            member.email,
            assessment.criteria()
        );
    }

    Ok(())
}

async fn notify_risk(ctx: &TaskContext, sender: &Sender, criteria: &str) -> anyhow::Result<()> {
    let settings = ctx.secrets.risk_notification(&sender.school).await?;
    let member = ctx
        .store
        .find_member(&sender.school, &sender.email)
        .await?
        .with_context(|| format!("{} is not enrolled at {}", sender.email, sender.school))?;

    let path = school_path(&sender.school, "risk_notification")?;
    let plan = match settings.tiers.clone() {
        Some(tiers) => match TierPlan::new(tiers) {
            Ok(plan) => plan,
            Err(e) => {
                ctx.secrets.invalidate(&path);
                return Err(e).context("invalid risk tier configuration");
            }
        },
        None => TierPlan::default(),
    };

    let now = Utc::now();
    if let Err(e) = lookback_cutoff(now, settings.lookback_days) {
        ctx.secrets.invalidate(&path);
        return Err(e).context("invalid risk notification lookback");
    }

    let tiers = calculate_interaction_risks(
        ctx.store.as_ref(),
        &member,
        settings.lookback_days,
        &plan,
        settings.cohort_policy,
        now,
    )
    .await?;

    let email =
        report::build_risk_notification(&member, criteria, settings.lookback_days, &tiers);
    ctx.mailer
        .send(&settings.recipients, &email)
        .await
        .context("failed to send risk notification")?;

    info!(
        "Sent risk notification for {} covering {} contacts",
        member.email,
        tiers.total_contacts()
    );
    Ok(())
}

async fn report_interaction(
    ctx: &TaskContext,
    sender: &Sender,
    targets: &[String],
) -> anyhow::Result<()> {
    let member = ctx
        .store
        .find_member(&sender.school, &sender.email)
        .await?
        .with_context(|| format!("{} is not enrolled at {}", sender.email, sender.school))?;

    if member.status == MemberStatus::SchoolSwitched {
        warn!(
            "{} switched away from {}, ignoring interactions",
            member.email, member.school
        );
        return Ok(());
    }

    let now = Utc::now();
    for target in targets {
        if target == &member.email {
            info!("Skipping self-interaction for {}", member.email);
            continue;
        }
        if ctx.store.find_member(&sender.school, target).await?.is_none() {
            error!("Interaction target {target} is not enrolled at {}", sender.school);
            continue;
        }

        let upsert = ctx
            .store
            .record_interaction(&sender.school, &member.email, target, now)
            .await?;
        info!("Interaction {} <-> {target}: {upsert:?}", member.email);
    }

    Ok(())
}

async fn report_vaccination(
    ctx: &TaskContext,
    sender: &Sender,
    status: VaccinationStatus,
) -> anyhow::Result<()> {
    let update = MemberUpdate {
        vaccination: Some(status),
        ..MemberUpdate::default()
    };
    let updated = ctx
        .store
        .update_members(&sender.school, &sender.email, MemberScope::AllCampuses, &update)
        .await?;
    info!(
        "Set vaccination {} on {updated} copies of {}",
        status.as_str(),
        sender.email
    );
    Ok(())
}

pub async fn set_location(
    ctx: &TaskContext,
    school: &str,
    email: &str,
    location: LocationStatus,
) -> anyhow::Result<()> {
    let update = MemberUpdate {
        location: Some(location),
        ..MemberUpdate::default()
    };
    let updated = ctx
        .store
        .update_members(school, email, MemberScope::School, &update)
        .await?;
    if updated == 0 {
        bail!("{email} is not enrolled at {school}");
    }
    info!("Set location {location} for {email} at {school}");
    Ok(())
}

async fn report_active_user(ctx: &TaskContext, sender: &Sender) -> anyhow::Result<()> {
    let Some(member) = ctx.store.find_member(&sender.school, &sender.email).await? else {
        bail!("{} is not enrolled at {}", sender.email, sender.school);
    };
    if member.status == MemberStatus::SchoolSwitched {
        info!("{} switched away from {}, leaving status", member.email, member.school);
        return Ok(());
    }

    let update = MemberUpdate {
        status: Some(MemberStatus::Active),
        ..MemberUpdate::default()
    };
    ctx.store
        .update_members(&sender.school, &sender.email, MemberScope::School, &update)
        .await?;
    Ok(())
}

async fn daily_digest(ctx: &TaskContext, sender: &Sender) -> anyhow::Result<()> {
    let settings = ctx.secrets.daily_digest(&sender.school).await?;
    let day = report_day(Utc::now(), ctx.utc_offset_hours);
    let missing = ctx
        .store
        .members_without_report(&sender.school, day)
        .await?;

    let email = report::build_daily_digest(&sender.school, day, &missing);
    ctx.mailer
        .send(&settings.recipients, &email)
        .await
        .context("failed to send daily digest")?;

    info!(
        "Sent daily digest for {} listing {} members",
        sender.school,
        missing.len()
    );
    Ok(())
}

async fn switch_report_node(
    ctx: &TaskContext,
    sender: &Sender,
    email: &str,
    target_campus: &str,
    merge_existing: bool,
) -> anyhow::Result<()> {
    if target_campus != sender.school {
        warn!(
            target: "security",
            "{} ({}) attempted to switch {email} into {target_campus}",
            sender.email,
            sender.school
        );
        bail!(
            "{} is not permitted to administrate over {target_campus}",
            sender.email
        );
    }

    let copies = ctx.store.member_copies(email).await?;
    let existing_target = copies.iter().find(|m| m.school == target_campus);
    let source = copies.iter().find(|m| m.school != target_campus);

    match (merge_existing, source) {
        (true, Some(source)) => {
            let profile = NewMember {
                email: source.email.clone(),
                first_name: source.first_name.clone(),
                last_name: source.last_name.clone(),
                cohort: source.cohort.clone(),
                role: source.role,
                location: source.location,
                vaccination: source.vaccination,
            };
            ctx.store.upsert_member(target_campus, &profile).await?;
            let update = MemberUpdate {
                disabled: Some(source.disabled),
                ..MemberUpdate::default()
            };
            ctx.store
                .update_members(target_campus, email, MemberScope::School, &update)
                .await?;
        }
        _ if existing_target.is_none() => {
            bail!("no member record for {email} to switch into {target_campus}");
        }
        _ => {}
    }

    let switched = ctx.store.mark_switched_except(email, target_campus).await?;
    info!("Switched {email} to {target_campus}, {switched} other copies marked");

    let notice = report::build_campus_switch(target_campus);
    ctx.mailer
        .send(&[email.to_string()], &notice)
        .await
        .context("failed to send campus switch notice")?;
    Ok(())
}

async fn admin_bulk(ctx: &TaskContext, sender: &Sender, tasks: &[Task]) -> anyhow::Result<()> {
    require_admin(sender, "tasks.admin_bulk")?;

    let report = run_group(ctx, sender, tasks.to_vec()).await;
    info!(
        "Bulk admin group finished: {} completed, {} abandoned",
        report.completed, report.abandoned
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::models::TestType;
    use crate::notify::RecordingMailer;
    use crate::queue::MemoryTaskQueue;
    use crate::secrets::MemorySecretStore;
    use crate::store::MemoryGraphStore;

    struct Harness {
        ctx: TaskContext,
        store: Arc<MemoryGraphStore>,
        mailer: Arc<RecordingMailer>,
        queue: Arc<MemoryTaskQueue>,
        secrets: Arc<MemorySecretStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryGraphStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert(
            "schools/ridge/symptom_criteria",
            json!({ "minimum_symptoms": "2" }),
        );
        secrets.insert(
            "schools/ridge/risk_notification",
            json!({ "lookback_days": "14", "recipients": "nurse@ridge.edu" }),
        );
        secrets.insert(
            "schools/ridge/daily_digest",
            json!({ "recipients": ["office@ridge.edu"] }),
        );

        let ctx = TaskContext {
            store: store.clone(),
            secrets: Arc::new(SecretCache::new(secrets.clone())),
            mailer: mailer.clone(),
            queue: queue.clone(),
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            utc_offset_hours: 0,
        };
        Harness {
            ctx,
            store,
            mailer,
            queue,
            secrets,
        }
    }

    fn sender(email: &str, role: Role) -> Sender {
        Sender {
            email: email.to_string(),
            school: "ridge".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            role,
            impersonator: None,
        }
    }

    async fn enroll(store: &MemoryGraphStore, school: &str, email: &str, first: &str) {
        store
            .upsert_member(
                school,
                &NewMember {
                    email: email.to_string(),
                    first_name: first.to_string(),
                    last_name: "Test".to_string(),
                    cohort: None,
                    role: Role::Student,
                    location: LocationStatus::Campus,
                    vaccination: VaccinationStatus::NotVaccinated,
                },
            )
            .await
            .unwrap();
    }

    #[test]
    fn envelopes_use_dotted_task_names() {
        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::ReportVaccination {
                status: VaccinationStatus::Vaccinated,
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["task"]["name"], "tasks.report_vaccination");
        assert_eq!(value["task"]["data"]["status"], "vaccinated");

        let decoded: TaskEnvelope = serde_json::from_value(json!({
            "sender": { "email": "a@ridge.edu", "school": "ridge" },
            "task": { "name": "tasks.report_active_user" }
        }))
        .unwrap();
        assert_eq!(decoded.task, Task::ReportActiveUser);
        assert_eq!(decoded.sender.role, Role::Student);
    }

    #[tokio::test]
    async fn positive_report_queues_a_notification() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;

        let report = HealthReport {
            test_type: Some(TestType::Positive),
            ..HealthReport::default()
        };
        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::ReportHealth {
                report,
                provenance: ReportProvenance::Member,
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let pending = h.queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].task,
            Task::NotifyRisk {
                criteria: "Positive Test".to_string()
            }
        );
    }

    #[tokio::test]
    async fn healthy_report_does_not_notify() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::ReportHealth {
                report: HealthReport {
                    num_symptoms: Some(1),
                    ..HealthReport::default()
                },
                provenance: ReportProvenance::Member,
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();
        assert!(h.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn notify_with_no_contacts_still_mails() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::NotifyRisk {
                criteria: "Positive Test".to_string(),
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["nurse@ridge.edu".to_string()]);
        assert!(sent[0].email.body.contains("No contacts in this tier."));
    }

    #[tokio::test]
    async fn notify_without_recipients_fails() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;
        h.secrets.insert(
            "schools/ridge/risk_notification",
            json!({ "lookback_days": 14, "recipients": "" }),
        );

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::NotifyRisk {
                criteria: "Positive Test".to_string(),
            },
        );
        assert!(execute(&h.ctx, &envelope).await.is_err());
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn impossible_lookback_fails_and_evicts_the_settings() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;
        h.secrets.insert(
            "schools/ridge/risk_notification",
            json!({ "lookback_days": 200_000_000, "recipients": "nurse@ridge.edu" }),
        );

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::NotifyRisk {
                criteria: "Positive Test".to_string(),
            },
        );
        let err = execute(&h.ctx, &envelope).await.unwrap_err();
        assert!(format!("{err:#}").contains("lookback"));
        assert!(!h.ctx.secrets.is_cached("schools/ridge/risk_notification"));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn interactions_skip_self_and_unknown_targets() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;
        enroll(&h.store, "ridge", "b@ridge.edu", "Ben").await;

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::ReportInteraction {
                targets: vec![
                    "a@ridge.edu".to_string(),
                    "b@ridge.edu".to_string(),
                    "ghost@ridge.edu".to_string(),
                ],
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let edges = h
            .store
            .interactions_since("ridge", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn vaccination_applies_to_every_campus_copy() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;
        enroll(&h.store, "valley", "a@ridge.edu", "Ana").await;

        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::ReportVaccination {
                status: VaccinationStatus::Vaccinated,
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let copies = h.store.member_copies("a@ridge.edu").await.unwrap();
        assert_eq!(copies.len(), 2);
        assert!(copies
            .iter()
            .all(|m| m.vaccination == VaccinationStatus::Vaccinated));
    }

    #[tokio::test]
    async fn admin_tasks_require_the_admin_role() {
        let h = harness();
        let envelope = TaskEnvelope::new(
            sender("a@ridge.edu", Role::Student),
            Task::AdminDeleteUser {
                email: "b@ridge.edu".to_string(),
            },
        );
        assert!(execute(&h.ctx, &envelope).await.is_err());
    }

    #[tokio::test]
    async fn switching_copies_the_profile_and_marks_other_campuses() {
        let h = harness();
        enroll(&h.store, "valley", "a@ridge.edu", "Ana").await;

        let envelope = TaskEnvelope::new(
            sender("admin@ridge.edu", Role::Admin),
            Task::AdminSwitchReportNode {
                email: "a@ridge.edu".to_string(),
                target_campus: "ridge".to_string(),
                merge_existing: true,
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let ridge = h
            .store
            .find_member("ridge", "a@ridge.edu")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ridge.first_name, "Ana");
        assert_eq!(ridge.status, MemberStatus::Inactive);

        let valley = h
            .store
            .find_member("valley", "a@ridge.edu")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(valley.status, MemberStatus::SchoolSwitched);

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["a@ridge.edu".to_string()]);
        assert!(sent[0].email.body.contains("moved to ridge"));
    }

    #[tokio::test]
    async fn enrollment_lowercases_the_email() {
        let h = harness();
        let envelope = TaskEnvelope::new(
            sender("admin@ridge.edu", Role::Admin),
            Task::AdminCreateUser {
                member: NewMember {
                    email: "Ana.Lee@Ridge.edu".to_string(),
                    first_name: "Ana".to_string(),
                    last_name: "Lee".to_string(),
                    cohort: None,
                    role: Role::Student,
                    location: LocationStatus::Campus,
                    vaccination: VaccinationStatus::NotVaccinated,
                },
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        assert!(h
            .store
            .find_member("ridge", "ana.lee@ridge.edu")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn queued_task_emails_are_lowercased() {
        let decoded: TaskEnvelope = serde_json::from_value(json!({
            "sender": { "email": "Admin@Ridge.edu", "school": "ridge", "role": "admin" },
            "task": {
                "name": "tasks.admin_toggle_access",
                "data": { "email": "Ana.Lee@Ridge.edu", "disabled": true }
            }
        }))
        .unwrap();
        assert_eq!(decoded.sender.email, "admin@ridge.edu");
        assert_eq!(
            decoded.task,
            Task::AdminToggleAccess {
                email: "ana.lee@ridge.edu".to_string(),
                disabled: true
            }
        );
    }

    #[tokio::test]
    async fn switching_into_another_campus_is_refused() {
        let h = harness();
        enroll(&h.store, "valley", "a@ridge.edu", "Ana").await;

        let envelope = TaskEnvelope::new(
            sender("admin@ridge.edu", Role::Admin),
            Task::AdminSwitchReportNode {
                email: "a@ridge.edu".to_string(),
                target_campus: "valley".to_string(),
                merge_existing: true,
            },
        );
        assert!(execute(&h.ctx, &envelope).await.is_err());
    }

    #[tokio::test]
    async fn bulk_runs_every_child() {
        let h = harness();
        enroll(&h.store, "ridge", "a@ridge.edu", "Ana").await;
        enroll(&h.store, "ridge", "b@ridge.edu", "Ben").await;

        let envelope = TaskEnvelope::new(
            sender("admin@ridge.edu", Role::Admin),
            Task::AdminBulk {
                tasks: vec![
                    Task::AdminToggleAccess {
                        email: "a@ridge.edu".to_string(),
                        disabled: true,
                    },
                    Task::AdminDeleteUserCopy {
                        email: "b@ridge.edu".to_string(),
                    },
                ],
            },
        );
        execute(&h.ctx, &envelope).await.unwrap();

        let a = h
            .store
            .find_member("ridge", "a@ridge.edu")
            .await
            .unwrap()
            .unwrap();
        assert!(a.disabled);
        assert!(h
            .store
            .find_member("ridge", "b@ridge.edu")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn digest_mails_even_when_everyone_reported() {
        let h = harness();
        let envelope = TaskEnvelope::new(sender("admin@ridge.edu", Role::Admin), Task::DailyDigest);
        execute(&h.ctx, &envelope).await.unwrap();

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].email.body.contains("Everyone has reported today."));
    }
}

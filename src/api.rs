use std::future::Future;

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    normalize_email, normalized_email, report_day, HealthReport, LocationStatus, Member,
    ReportProvenance, Role, VaccinationStatus,
};
use crate::risk::{EntryDecision, HealthAssessment, LocationAssessment};
use crate::secrets::{school_path, SecretError};
use crate::tasks::{Sender, Task, TaskContext, TaskEnvelope};
use crate::traversal::{calculate_interaction_risks, lookback_cutoff, RiskTiers, TierPlan};

/// Identity forwarded by the authenticating proxy.
pub struct AuthUser(pub Sender);

/// An [`AuthUser`] with the admin role.
pub struct AdminUser(pub Sender);

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let (Some(email), Some(school)) = (
            header(headers, "x-auth-email"),
            header(headers, "x-auth-school"),
        ) else {
            warn!(target: "security", "Rejected {} {}: missing identity", parts.method, parts.uri);
            return Err(AppError::Unauthorized);
        };

        let role = match header(headers, "x-auth-role") {
            Some(role) => role.parse::<Role>().map_err(|e| {
                warn!(target: "security", "Rejected {email}: {e}");
                AppError::Unauthorized
            })?,
            None => Role::default(),
        };

        Ok(AuthUser(Sender {
            email: normalize_email(&email),
            school,
            first_name: header(headers, "x-auth-first-name").unwrap_or_default(),
            last_name: header(headers, "x-auth-last-name").unwrap_or_default(),
            role,
            impersonator: None,
        }))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser(sender) = AuthUser::from_request_parts(parts, state).await?;
        if sender.role != Role::Admin {
            warn!(
                target: "security",
                "{} ({}) denied admin route {}",
                sender.email,
                sender.school,
                parts.uri
            );
            return Err(AppError::Forbidden(format!(
                "{} is not an administrator",
                sender.email
            )));
        }
        Ok(AdminUser(sender))
    }
}

fn payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|e| AppError::Malformed(e.body_text()))
}

fn checked_report(report: HealthReport) -> Result<HealthReport, AppError> {
    report.validate().map_err(AppError::Malformed)?;
    Ok(report)
}

async fn enqueue(
    ctx: &TaskContext,
    sender: Sender,
    task: Task,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let name = task.name();
    let id: Uuid = ctx.queue.enqueue(&TaskEnvelope::new(sender, task)).await?;
    info!("Queued {name} as {id}");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "QUEUED", "task_id": id })),
    ))
}

async fn find_member(ctx: &TaskContext, school: &str, email: &str) -> Result<Member, AppError> {
    ctx.store
        .find_member(school, email)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{email} is not enrolled at {school}")))
}

fn acting_as(member: &Member, admin: &Sender) -> Sender {
    Sender {
        email: member.email.clone(),
        school: member.school.clone(),
        first_name: member.first_name.clone(),
        last_name: member.last_name.clone(),
        role: member.role,
        impersonator: None,
    }
    .impersonated_by(admin)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "SUCCESS" }))
}

async fn report_health(
    State(ctx): State<TaskContext>,
    AuthUser(sender): AuthUser,
    body: Result<Json<HealthReport>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let report = checked_report(payload(body)?)?;
    enqueue(
        &ctx,
        sender,
        Task::ReportHealth {
            report,
            provenance: ReportProvenance::Member,
        },
    )
    .await
}

#[derive(Deserialize)]
struct InteractionBody {
    targets: Vec<String>,
}

async fn report_interaction(
    State(ctx): State<TaskContext>,
    AuthUser(sender): AuthUser,
    body: Result<Json<InteractionBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let body = payload(body)?;
    let targets: Vec<String> = body
        .targets
        .iter()
        .map(|t| normalize_email(t))
        .filter(|t| !t.is_empty())
        .collect();
    if targets.is_empty() {
        return Err(AppError::Malformed("targets must not be empty".to_string()));
    }
    enqueue(&ctx, sender, Task::ReportInteraction { targets }).await
}

#[derive(Deserialize)]
struct VaccinationBody {
    status: VaccinationStatus,
}

async fn report_vaccination(
    State(ctx): State<TaskContext>,
    AuthUser(sender): AuthUser,
    body: Result<Json<VaccinationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let VaccinationBody { status } = payload(body)?;
    enqueue(&ctx, sender, Task::ReportVaccination { status }).await
}

async fn report_active(
    State(ctx): State<TaskContext>,
    AuthUser(sender): AuthUser,
) -> Result<(StatusCode, Json<Value>), AppError> {
    enqueue(&ctx, sender, Task::ReportActiveUser).await
}

/// Today's entry decision: the day's report, vaccination and location combined.
pub async fn entry_decision(ctx: &TaskContext, member: &Member) -> anyhow::Result<EntryDecision> {
    let criteria = ctx.secrets.symptom_criteria(&member.school).await?;

    let day = report_day(Utc::now(), ctx.utc_offset_hours);
    let daily = ctx
        .store
        .daily_report(&member.school, &member.email, day)
        .await?;

    let health = HealthAssessment::from_daily(daily.as_ref().map(|d| &d.report), &criteria)
        .with_vaccination(member.vaccination, &criteria);
    let location = LocationAssessment::new(member.location);

    Ok(EntryDecision::evaluate(
        member.display_name(),
        health,
        location,
    ))
}

async fn entry(
    State(ctx): State<TaskContext>,
    AuthUser(sender): AuthUser,
) -> Result<Json<EntryDecision>, AppError> {
    let member = find_member(&ctx, &sender.school, &sender.email).await?;
    Ok(Json(entry_decision(&ctx, &member).await?))
}

async fn members(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
) -> Result<Json<Vec<Member>>, AppError> {
    Ok(Json(ctx.store.members(&admin.school).await?))
}

#[derive(Deserialize)]
struct RiskTierQuery {
    #[serde(deserialize_with = "normalized_email")]
    email: String,
    lookback_days: Option<u32>,
}

async fn risk_tiers(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
    Query(query): Query<RiskTierQuery>,
) -> Result<Json<RiskTiers>, AppError> {
    let member = find_member(&ctx, &admin.school, &query.email).await?;
    let path = school_path(&admin.school, "risk_notification")
        .map_err(|e| AppError::Misconfigured(e.to_string()))?;
    let settings = ctx
        .secrets
        .risk_notification(&admin.school)
        .await
        .map_err(|e| match e {
            SecretError::Invalid { .. } | SecretError::Malformed { .. } => {
                AppError::Misconfigured(e.to_string())
            }
            other => AppError::Internal(other.into()),
        })?;

    let plan = match settings.tiers {
        Some(tiers) => TierPlan::new(tiers).map_err(|e| {
            ctx.secrets.invalidate(&path);
            AppError::Misconfigured(format!("invalid risk tier configuration: {e}"))
        })?,
        None => TierPlan::default(),
    };

    let now = Utc::now();
    let lookback_days = match query.lookback_days {
        Some(days) => {
            lookback_cutoff(now, days).map_err(|e| AppError::Malformed(e.to_string()))?;
            days
        }
        None => {
            lookback_cutoff(now, settings.lookback_days).map_err(|e| {
                ctx.secrets.invalidate(&path);
                AppError::Misconfigured(e.to_string())
            })?;
            settings.lookback_days
        }
    };

    let tiers = calculate_interaction_risks(
        ctx.store.as_ref(),
        &member,
        lookback_days,
        &plan,
        settings.cohort_policy,
        now,
    )
    .await?;

    Ok(Json(tiers))
}

#[derive(Deserialize)]
struct NotifyRiskBody {
    #[serde(deserialize_with = "normalized_email")]
    email: String,
    criteria: String,
}

async fn notify_risk(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
    body: Result<Json<NotifyRiskBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let NotifyRiskBody { email, criteria } = payload(body)?;
    let member = find_member(&ctx, &admin.school, &email).await?;
    enqueue(&ctx, acting_as(&member, &admin), Task::NotifyRisk { criteria }).await
}

#[derive(Deserialize)]
struct LocationBody {
    #[serde(deserialize_with = "normalized_email")]
    email: String,
    location: LocationStatus,
}

async fn update_location(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
    body: Result<Json<LocationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let LocationBody { email, location } = payload(body)?;
    let member = find_member(&ctx, &admin.school, &email).await?;
    enqueue(
        &ctx,
        acting_as(&member, &admin),
        Task::ReportLocationStatus { location },
    )
    .await
}

#[derive(Deserialize)]
struct AdminReportBody {
    #[serde(deserialize_with = "normalized_email")]
    email: String,
    report: HealthReport,
}

async fn admin_report(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
    body: Result<Json<AdminReportBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let AdminReportBody { email, report } = payload(body)?;
    let report = checked_report(report)?;
    let member = find_member(&ctx, &admin.school, &email).await?;
    enqueue(
        &ctx,
        acting_as(&member, &admin),
        Task::ReportHealth {
            report,
            provenance: ReportProvenance::Admin,
        },
    )
    .await
}

#[derive(Deserialize)]
struct BulkBody {
    tasks: Vec<Task>,
}

async fn bulk(
    State(ctx): State<TaskContext>,
    AdminUser(admin): AdminUser,
    body: Result<Json<BulkBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let BulkBody { tasks } = payload(body)?;
    if tasks.is_empty() {
        return Err(AppError::Malformed("tasks must not be empty".to_string()));
    }
    if let Some(task) = tasks
        .iter()
        .find(|t| !t.is_admin() || matches!(t, Task::AdminBulk { .. }))
    {
        return Err(AppError::Malformed(format!(
            "{} cannot be part of a bulk request",
            task.name()
        )));
    }
    enqueue(&ctx, admin, Task::AdminBulk { tasks }).await
}

pub fn router(ctx: TaskContext) -> Router {
    let member_routes = Router::new()
        .route("/report/health", post(report_health))
        .route("/report/interaction", post(report_interaction))
        .route("/report/vaccination", post(report_vaccination))
        .route("/report/active", post(report_active))
        .route("/entry", get(entry));

    let admin_routes = Router::new()
        .route("/members", get(members))
        .route("/risk-tiers", get(risk_tiers))
        .route("/notify-risk", post(notify_risk))
        .route("/location", post(update_location))
        .route("/report", post(admin_report))
        .route("/bulk", post(bulk));

    Router::new()
        .route("/health", get(health))
        .nest("/api", member_routes)
        .nest("/user", admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn serve(
    ctx: TaskContext,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let address = format!("0.0.0.0:{port}");
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::models::NewMember;
    use crate::tasks::execute;
    use crate::notify::RecordingMailer;
    use crate::queue::MemoryTaskQueue;
    use crate::secrets::{MemorySecretStore, SecretCache};
    use crate::store::{GraphStore, MemoryGraphStore};
    use crate::worker::RetryPolicy;

    struct TestApp {
        ctx: TaskContext,
        store: Arc<MemoryGraphStore>,
        queue: Arc<MemoryTaskQueue>,
        secrets: Arc<MemorySecretStore>,
    }

    async fn app() -> TestApp {
        let store = Arc::new(MemoryGraphStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert(
            "schools/ridge/symptom_criteria",
            json!({ "minimum_symptoms": 2 }),
        );

        store
            .upsert_member(
                "ridge",
                &NewMember {
                    email: "a@ridge.edu".to_string(),
                    first_name: "Ana".to_string(),
                    last_name: "Alvarez".to_string(),
                    cohort: None,
                    role: Role::Student,
                    location: LocationStatus::Campus,
                    vaccination: VaccinationStatus::NotVaccinated,
                },
            )
            .await
            .unwrap();

        let ctx = TaskContext {
            store: store.clone(),
            secrets: Arc::new(SecretCache::new(secrets.clone())),
            mailer: Arc::new(RecordingMailer::new()),
            queue: queue.clone(),
            retry: RetryPolicy::default(),
            utc_offset_hours: 0,
        };
        TestApp {
            ctx,
            store,
            queue,
            secrets,
        }
    }

    const STUDENT: Option<(&str, &str)> = Some(("a@ridge.edu", "student"));
    const ADMIN: Option<(&str, &str)> = Some(("admin@ridge.edu", "admin"));

    fn request(
        method: &str,
        uri: &str,
        identity: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((email, role)) = identity {
            builder = builder
                .header("x-auth-email", email)
                .header("x-auth-school", "ridge")
                .header("x-auth-role", role);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_is_public() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/api/report/health",
                None,
                Some(json!({ "num_symptoms": 1 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["status"], "ACCESS_DENIED");
        assert!(app.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn health_report_is_queued() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/api/report/health",
                STUDENT,
                Some(json!({ "num_symptoms": 3, "test_type": "negative" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "QUEUED");

        let pending = app.queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task.name(), "tasks.report_health");
        assert_eq!(pending[0].sender.email, "a@ridge.edu");
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/api/report/vaccination",
                STUDENT,
                Some(json!({ "status": "maybe" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "MALFORMED");
    }

    #[tokio::test]
    async fn admin_routes_require_the_admin_role() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request("GET", "/user/members", STUDENT, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_location_update_impersonates_the_member() {
        let app = app().await;
        let response = router(app.ctx.clone())
            .oneshot(request(
                "POST",
                "/user/location",
                ADMIN,
                Some(json!({ "email": "a@ridge.edu", "location": "quarantined" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let pending = app.queue.pending();
        assert_eq!(
            pending[0].task,
            Task::ReportLocationStatus {
                location: LocationStatus::Quarantined
            }
        );
        assert_eq!(pending[0].sender.email, "a@ridge.edu");
        assert_eq!(
            pending[0].sender.impersonator.as_deref(),
            Some("admin@ridge.edu")
        );
    }

    #[tokio::test]
    async fn bulk_rejects_member_tasks() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/user/bulk",
                ADMIN,
                Some(json!({ "tasks": [{ "name": "tasks.report_active_user" }] })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn entry_without_a_report_is_denied() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request("GET", "/api/entry", STUDENT, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let decision = body_json(response).await;
        assert_eq!(decision["entry"], false);
        assert_eq!(decision["reason"], "health");
        assert_eq!(decision["name"], "Ana Alvarez");
    }

    #[tokio::test]
    async fn entry_is_blocked_by_location() {
        let app = app().await;
        app.store
            .update_members(
                "ridge",
                "a@ridge.edu",
                crate::models::MemberScope::School,
                &crate::models::MemberUpdate {
                    location: Some(LocationStatus::Quarantined),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let response = router(app.ctx)
            .oneshot(request("GET", "/api/entry", STUDENT, None))
            .await
            .unwrap();
        let decision = body_json(response).await;
        assert_eq!(decision["entry"], false);
        assert_eq!(decision["reason"], "location");
    }

    #[tokio::test]
    async fn mixed_case_enrollment_can_use_the_api() {
        let app = app().await;
        let enroll = TaskEnvelope::new(
            Sender {
                email: "admin@ridge.edu".to_string(),
                school: "ridge".to_string(),
                first_name: String::new(),
                last_name: String::new(),
                role: Role::Admin,
                impersonator: None,
            },
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
        execute(&app.ctx, &enroll).await.unwrap();

        let response = router(app.ctx.clone())
            .oneshot(request(
                "GET",
                "/api/entry",
                Some(("Ana.Lee@Ridge.edu", "student")),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "Ana Lee");

        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/user/location",
                ADMIN,
                Some(json!({ "email": "ANA.LEE@ridge.edu", "location": "remote" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(app.queue.pending()[0].sender.email, "ana.lee@ridge.edu");
    }

    #[tokio::test]
    async fn implausible_symptom_counts_are_rejected() {
        let app = app().await;
        let response = router(app.ctx)
            .oneshot(request(
                "POST",
                "/api/report/health",
                STUDENT,
                Some(json!({ "num_symptoms": 3_000_000_000u64 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "MALFORMED");
        assert!(app.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn risk_tier_lookback_out_of_range_is_malformed() {
        let app = app().await;
        app.secrets.insert(
            "schools/ridge/risk_notification",
            json!({ "lookback_days": 14, "recipients": "nurse@ridge.edu" }),
        );

        let response = router(app.ctx)
            .oneshot(request(
                "GET",
                "/user/risk-tiers?email=a@ridge.edu&lookback_days=200000000",
                ADMIN,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_tier_settings_are_reported_and_evicted() {
        let app = app().await;
        app.secrets.insert(
            "schools/ridge/risk_notification",
            json!({
                "lookback_days": 14,
                "recipients": "nurse@ridge.edu",
                "tiers": [{ "name": "near", "label": "Near", "depth": 0 }]
            }),
        );

        let response = router(app.ctx.clone())
            .oneshot(request(
                "GET",
                "/user/risk-tiers?email=a@ridge.edu",
                ADMIN,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["status"], "MISCONFIGURED");
        assert!(!app
            .ctx
            .secrets
            .is_cached("schools/ridge/risk_notification"));
    }

    #[tokio::test]
    async fn missing_recipients_are_a_configuration_error() {
        let app = app().await;
        app.secrets.insert(
            "schools/ridge/risk_notification",
            json!({ "lookback_days": 14, "recipients": "" }),
        );

        let response = router(app.ctx)
            .oneshot(request(
                "GET",
                "/user/risk-tiers?email=a@ridge.edu",
                ADMIN,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}

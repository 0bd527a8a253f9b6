use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    resolve_report_write, DailyReport, HealthReport, Interaction, InteractionUpsert,
    LocationStatus, Member, MemberScope, MemberUpdate, NewMember, RemovalMode, ReportOutcome,
    ReportProvenance, Role, VaccinationStatus,
};
use crate::store::GraphStore;

const MEMBER_COLUMNS: &str = "id, email, school, first_name, last_name, cohort, role, \
     location, vaccination, status, disabled";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let store = PgGraphStore::new(pool.clone());
    let school = "ridge";
    let members = vec![
        ("avery.lee@ridge.edu", "Avery", "Lee", Some("7A")),
        ("jules.moreno@ridge.edu", "Jules", "Moreno", Some("7A")),
        ("kiara.patel@ridge.edu", "Kiara", "Patel", Some("7B")),
        ("sam.okafor@ridge.edu", "Sam", "Okafor", Some("7B")),
        ("noor.haddad@ridge.edu", "Noor", "Haddad", None),
    ];

    for (email, first_name, last_name, cohort) in members {
        store
            .upsert_member(
                school,
                &NewMember {
                    email: email.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    cohort: cohort.map(str::to_string),
                    role: Role::Student,
                    location: LocationStatus::Campus,
                    vaccination: VaccinationStatus::NotVaccinated,
                },
            )
            .await
            .with_context(|| format!("failed to seed member {email}"))?;
    }

    let interactions = vec![
        ("avery.lee@ridge.edu", "jules.moreno@ridge.edu", 1),
        ("avery.lee@ridge.edu", "kiara.patel@ridge.edu", 2),
        ("kiara.patel@ridge.edu", "sam.okafor@ridge.edu", 3),
        ("sam.okafor@ridge.edu", "noor.haddad@ridge.edu", 4),
    ];

    for (email, target, days_ago) in interactions {
        store
            .record_interaction(school, email, target, Utc::now() - Duration::days(days_ago))
            .await?;
    }

    Ok(())
}

/// Postgres-backed member/interaction/report graph.
#[derive(Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn member_from_row(row: &PgRow) -> anyhow::Result<Member> {
    Ok(Member {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        school: row.try_get("school")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        cohort: row.try_get("cohort")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        location: row.try_get::<String, _>("location")?.parse()?,
        vaccination: row.try_get::<String, _>("vaccination")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        disabled: row.try_get("disabled")?,
    })
}

fn report_from_row(row: &PgRow) -> anyhow::Result<HealthReport> {
    let num_symptoms: Option<i32> = row.try_get("num_symptoms")?;
    let test_type: Option<String> = row.try_get("test_type")?;
    Ok(HealthReport {
        num_symptoms: num_symptoms.map(u32::try_from).transpose()?,
        proximity: row.try_get("proximity")?,
        test_type: test_type.map(|t| t.parse()).transpose()?,
        commercial_flight: row.try_get("commercial_flight")?,
    })
}

fn scope_school(school: &str, scope: MemberScope) -> Option<&str> {
    match scope {
        MemberScope::School => Some(school),
        MemberScope::AllCampuses => None,
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn find_member(&self, school: &str, email: &str) -> anyhow::Result<Option<Member>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM contact_tracing.members WHERE school = $1 AND email = $2"
        ))
        .bind(school)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(member_from_row).transpose()
    }

    async fn member_copies(&self, email: &str) -> anyhow::Result<Vec<Member>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM contact_tracing.members WHERE email = $1 ORDER BY school"
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    async fn members(&self, school: &str) -> anyhow::Result<Vec<Member>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM contact_tracing.members WHERE school = $1 ORDER BY email"
        ))
        .bind(school)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    async fn upsert_member(&self, school: &str, member: &NewMember) -> anyhow::Result<Member> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO contact_tracing.members
            (id, email, school, first_name, last_name, cohort, role, location, vaccination)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (email, school) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name,
                cohort = EXCLUDED.cohort, role = EXCLUDED.role,
                location = EXCLUDED.location, vaccination = EXCLUDED.vaccination,
                status = 'inactive', disabled = FALSE
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&member.email)
        .bind(school)
        .bind(&member.first_name)
        .bind(&member.last_name)
        .bind(&member.cohort)
        .bind(member.role.as_str())
        .bind(member.location.as_str())
        .bind(member.vaccination.as_str())
        .fetch_one(&self.pool)
        .await?;

        member_from_row(&row)
    }

    async fn update_members(
        &self,
        school: &str,
        email: &str,
        scope: MemberScope,
        update: &MemberUpdate,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE contact_tracing.members
            SET location = COALESCE($3, location),
                vaccination = COALESCE($4, vaccination),
                status = COALESCE($5, status),
                disabled = COALESCE($6, disabled)
            WHERE email = $1 AND ($2::TEXT IS NULL OR school = $2)
            "#,
        )
        .bind(email)
        .bind(scope_school(school, scope))
        .bind(update.location.map(|l| l.as_str()))
        .bind(update.vaccination.map(|v| v.as_str()))
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.disabled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_switched_except(&self, email: &str, keep_school: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE contact_tracing.members
            SET status = 'school_switched'
            WHERE email = $1 AND school <> $2
            "#,
        )
        .bind(email)
        .bind(keep_school)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn remove_member(
        &self,
        school: &str,
        email: &str,
        mode: RemovalMode,
    ) -> anyhow::Result<u64> {
        let school = match mode {
            RemovalMode::SchoolCopy => Some(school),
            RemovalMode::AllCampuses => None,
        };
        // reports and interactions cascade with the member row
        let result = sqlx::query(
            "DELETE FROM contact_tracing.members \
             WHERE email = $1 AND ($2::TEXT IS NULL OR school = $2)",
        )
        .bind(email)
        .bind(school)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_interaction(
        &self,
        school: &str,
        email: &str,
        target: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<InteractionUpsert> {
        let rows = sqlx::query(
            "SELECT id, email FROM contact_tracing.members WHERE school = $1 AND email = ANY($2)",
        )
        .bind(school)
        .bind(vec![email.to_string(), target.to_string()])
        .fetch_all(&self.pool)
        .await?;

        let mut source_id = None;
        let mut target_id = None;
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let row_email: String = row.try_get("email")?;
            if row_email == email {
                source_id = Some(id);
            }
            if row_email == target {
                target_id = Some(id);
            }
        }
        let source_id = source_id.with_context(|| format!("member {email} not found in {school}"))?;
        let target_id =
            target_id.with_context(|| format!("member {target} not found in {school}"))?;
        let (member_a, member_b) = if source_id < target_id {
            (source_id, target_id)
        } else {
            (target_id, source_id)
        };

        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO contact_tracing.interactions (member_a, member_b, school, interacted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (member_a, member_b) DO UPDATE
            SET interacted_at = EXCLUDED.interacted_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(member_a)
        .bind(member_b)
        .bind(school)
        .bind(at)
        .fetch_one(&self.pool)
        .await?
        .try_get("inserted")?;

        Ok(if inserted {
            InteractionUpsert::Created
        } else {
            InteractionUpsert::Refreshed
        })
    }

    async fn interactions_since(
        &self,
        school: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Interaction>> {
        let rows = sqlx::query(
            r#"
            SELECT ma.email AS email_a, mb.email AS email_b, i.interacted_at
            FROM contact_tracing.interactions i
            JOIN contact_tracing.members ma ON ma.id = i.member_a
            JOIN contact_tracing.members mb ON mb.id = i.member_b
            WHERE i.school = $1 AND i.interacted_at >= $2
            "#,
        )
        .bind(school)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut interactions = Vec::with_capacity(rows.len());
        for row in rows {
            interactions.push(Interaction {
                email_a: row.try_get("email_a")?,
                email_b: row.try_get("email_b")?,
                interacted_at: row.try_get("interacted_at")?,
            });
        }

        Ok(interactions)
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
        let mut tx = self.pool.begin().await?;

        // Lock the member row: unlike the day's report, it always exists.
        let member_id: Uuid = sqlx::query(
            "SELECT id FROM contact_tracing.members WHERE school = $1 AND email = $2 FOR UPDATE",
        )
        .bind(school)
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?
        .with_context(|| format!("member {email} not found in {school}"))?
        .try_get("id")?;

        sqlx::query(
            "INSERT INTO contact_tracing.daily_report_nodes (school, day) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(school)
        .bind(day)
        .execute(&mut *tx)
        .await?;

        let existing = sqlx::query(
            r#"
            SELECT num_symptoms, proximity, test_type, commercial_flight
            FROM contact_tracing.reports
            WHERE member_id = $1 AND day = $2
            FOR UPDATE
            "#,
        )
        .bind(member_id)
        .bind(day)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(report_from_row)
        .transpose()?;

        let (outcome, written) = resolve_report_write(existing.as_ref(), report, provenance);
        if let Some(written) = written {
            let num_symptoms = written.num_symptoms.map(i32::try_from).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO contact_tracing.reports
                (member_id, school, day, num_symptoms, proximity, test_type, commercial_flight,
                 risk_score, provenance, reported_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (member_id, day) DO UPDATE
                SET num_symptoms = EXCLUDED.num_symptoms, proximity = EXCLUDED.proximity,
                    test_type = EXCLUDED.test_type, commercial_flight = EXCLUDED.commercial_flight,
                    risk_score = EXCLUDED.risk_score, provenance = EXCLUDED.provenance,
                    reported_at = EXCLUDED.reported_at
                "#,
            )
            .bind(member_id)
            .bind(school)
            .bind(day)
            .bind(num_symptoms)
            .bind(written.proximity)
            .bind(written.test_type.map(|t| t.as_str()))
            .bind(written.commercial_flight)
            .bind(risk_score)
            .bind(provenance.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn daily_report(
        &self,
        school: &str,
        email: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Option<DailyReport>> {
        let row = sqlx::query(
            r#"
            SELECT r.num_symptoms, r.proximity, r.test_type, r.commercial_flight,
                   r.risk_score, r.provenance, r.reported_at
            FROM contact_tracing.reports r
            JOIN contact_tracing.members m ON m.id = r.member_id
            WHERE m.school = $1 AND m.email = $2 AND r.day = $3
            "#,
        )
        .bind(school)
        .bind(email)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DailyReport {
            email: email.to_string(),
            school: school.to_string(),
            day,
            report: report_from_row(&row)?,
            risk_score: row.try_get("risk_score")?,
            provenance: row.try_get::<String, _>("provenance")?.parse()?,
            reported_at: row.try_get("reported_at")?,
        }))
    }

    async fn members_without_report(
        &self,
        school: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<Member>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MEMBER_COLUMNS}
            FROM contact_tracing.members m
            WHERE m.school = $1
              AND NOT m.disabled
              AND m.status <> 'school_switched'
              AND NOT EXISTS (
                  SELECT 1 FROM contact_tracing.reports r
                  WHERE r.member_id = m.id AND r.day = $2
              )
            ORDER BY m.last_name, m.first_name
            "#
        ))
        .bind(school)
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }
}

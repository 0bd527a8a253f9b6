use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

use crate::tasks::TaskEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Revoked,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Revoked => "revoked",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "done" => Some(TaskState::Done),
            "failed" => Some(TaskState::Failed),
            "revoked" => Some(TaskState::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: Uuid,
    /// Failed executions so far.
    pub attempts: u32,
    pub envelope: TaskEnvelope,
}

/// Broker the API publishes to and workers consume from.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> anyhow::Result<Uuid>;

    /// Claim the next task that is ready to run, if any.
    async fn dequeue(&self) -> anyhow::Result<Option<QueuedTask>>;

    async fn complete(&self, id: Uuid) -> anyhow::Result<()>;

    /// Put a failed task back with a delay before it becomes visible again.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> anyhow::Result<()>;

    async fn fail(&self, id: Uuid, error: &str) -> anyhow::Result<()>;

    /// Revoke a task that has not started yet. Returns whether anything was revoked.
    async fn revoke(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn state(&self, id: Uuid) -> anyhow::Result<Option<TaskState>>;
}

/// How long a claimed task may stay `running` before another worker reclaims it.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

/// `contact_tracing.task_queue`, claimed with `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(envelope)?;

        sqlx::query(
            r#"
            INSERT INTO contact_tracing.task_queue (id, name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(envelope.task.name())
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("failed to enqueue task")?;

        Ok(id)
    }

    async fn dequeue(&self) -> anyhow::Result<Option<QueuedTask>> {
        // A reclaimed `running` row counts its lost run as a failed attempt.
        let row = sqlx::query(
            r#"
            UPDATE contact_tracing.task_queue
            SET status = 'running',
                attempts = attempts + CASE WHEN status = 'running' THEN 1 ELSE 0 END,
                updated_at = now()
            WHERE id = (
                SELECT id FROM contact_tracing.task_queue
                WHERE (status = 'queued' AND available_at <= now())
                   OR (status = 'running' AND updated_at <= now() - make_interval(secs => $1))
                ORDER BY available_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, attempts, payload
            "#,
        )
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let attempts: i32 = row.try_get("attempts")?;
        let payload: serde_json::Value = row.try_get("payload")?;

        match serde_json::from_value::<TaskEnvelope>(payload) {
            Ok(envelope) => Ok(Some(QueuedTask {
                id,
                attempts: u32::try_from(attempts).unwrap_or(0),
                envelope,
            })),
            Err(e) => {
                error!("Task {id} has an undecodable payload, failing it: {e}");
                self.fail(id, &format!("undecodable payload: {e}")).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE contact_tracing.task_queue SET status = 'done', updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> anyhow::Result<()> {
        let available_at = Utc::now() + chrono::Duration::from_std(delay)?;
        sqlx::query(
            r#"
            UPDATE contact_tracing.task_queue
            SET status = 'queued', attempts = attempts + 1, available_at = $2,
                last_error = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(available_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE contact_tracing.task_queue
            SET status = 'failed', attempts = attempts + 1, last_error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contact_tracing.task_queue
            SET status = 'revoked', updated_at = now()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn state(&self, id: Uuid) -> anyhow::Result<Option<TaskState>> {
        let status: Option<String> =
            sqlx::query("SELECT status FROM contact_tracing.task_queue WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get("status"))
                .transpose()?;

        Ok(status.as_deref().and_then(TaskState::parse))
    }
}

struct MemoryEntry {
    task: QueuedTask,
    state: TaskState,
    available_at: Instant,
    claimed_at: Option<Instant>,
    last_error: Option<String>,
}

impl MemoryEntry {
    fn claimable(&self, now: Instant, lease: Duration) -> bool {
        match self.state {
            TaskState::Queued => self.available_at <= now,
            TaskState::Running => self
                .claimed_at
                .is_some_and(|claimed| claimed + lease <= now),
            _ => false,
        }
    }
}

/// In-process queue for tests and one-shot CLI runs.
pub struct MemoryTaskQueue {
    entries: Mutex<Vec<MemoryEntry>>,
    lease: Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            lease: DEFAULT_LEASE,
        }
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut Vec<MemoryEntry>) -> T) -> anyhow::Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory queue lock poisoned"))?;
        Ok(f(&mut entries))
    }

    /// Envelopes waiting to run, in enqueue order.
    pub fn pending(&self) -> Vec<TaskEnvelope> {
        self.with_entries(|entries| {
            entries
                .iter()
                .filter(|e| e.state == TaskState::Queued)
                .map(|e| e.task.envelope.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn last_error(&self, id: Uuid) -> Option<String> {
        self.with_entries(|entries| {
            entries
                .iter()
                .find(|e| e.task.id == id)
                .and_then(|e| e.last_error.clone())
        })
        .ok()
        .flatten()
    }

    fn set_state(&self, id: Uuid, state: TaskState, error: Option<&str>) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.task.id == id) {
                entry.state = state;
                if let Some(error) = error {
                    entry.last_error = Some(error.to_string());
                    entry.task.attempts += 1;
                }
            }
        })
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.with_entries(|entries| {
            entries.push(MemoryEntry {
                task: QueuedTask {
                    id,
                    attempts: 0,
                    envelope: envelope.clone(),
                },
                state: TaskState::Queued,
                available_at: Instant::now(),
                claimed_at: None,
                last_error: None,
            })
        })?;
        Ok(id)
    }

    async fn dequeue(&self) -> anyhow::Result<Option<QueuedTask>> {
        let now = Instant::now();
        let lease = self.lease;
        self.with_entries(|entries| {
            entries
                .iter_mut()
                .find(|e| e.claimable(now, lease))
                .map(|entry| {
                    if entry.state == TaskState::Running {
                        entry.task.attempts += 1;
                    }
                    entry.state = TaskState::Running;
                    entry.claimed_at = Some(now);
                    entry.task.clone()
                })
        })
    }

    async fn complete(&self, id: Uuid) -> anyhow::Result<()> {
        self.set_state(id, TaskState::Done, None)
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> anyhow::Result<()> {
        self.set_state(id, TaskState::Queued, Some(error))?;
        self.with_entries(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.task.id == id) {
                entry.available_at = Instant::now() + delay;
            }
        })
    }

    async fn fail(&self, id: Uuid, error: &str) -> anyhow::Result<()> {
        self.set_state(id, TaskState::Failed, Some(error))
    }

    async fn revoke(&self, id: Uuid) -> anyhow::Result<bool> {
        self.with_entries(|entries| {
            match entries
                .iter_mut()
                .find(|e| e.task.id == id && e.state == TaskState::Queued)
            {
                Some(entry) => {
                    entry.state = TaskState::Revoked;
                    true
                }
                None => false,
            }
        })
    }

    async fn state(&self, id: Uuid) -> anyhow::Result<Option<TaskState>> {
        self.with_entries(|entries| entries.iter().find(|e| e.task.id == id).map(|e| e.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::tasks::{Sender, Task};

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new(
            Sender {
                email: "a@ridge.edu".to_string(),
                school: "ridge".to_string(),
                first_name: String::new(),
                last_name: String::new(),
                role: Role::Student,
                impersonator: None,
            },
            Task::ReportActiveUser,
        )
    }

    #[tokio::test]
    async fn running_tasks_stay_claimed_within_the_lease() {
        let queue = MemoryTaskQueue::new();
        let id = queue.enqueue(&envelope()).await.unwrap();

        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.state(id).await.unwrap(), Some(TaskState::Running));
    }

    #[tokio::test]
    async fn abandoned_claims_are_reclaimed_after_the_lease() {
        let queue = MemoryTaskQueue::new().with_lease(Duration::ZERO);
        let id = queue.enqueue(&envelope()).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.attempts, 0);

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempts, 1);
    }

    #[tokio::test]
    async fn finished_tasks_are_never_reclaimed() {
        let queue = MemoryTaskQueue::new().with_lease(Duration::ZERO);
        let id = queue.enqueue(&envelope()).await.unwrap();

        queue.dequeue().await.unwrap().unwrap();
        queue.complete(id).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.state(id).await.unwrap(), Some(TaskState::Done));
    }
}

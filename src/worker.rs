use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::queue::QueuedTask;
use crate::tasks::{execute, execute_single, Sender, Task, TaskContext, TaskEnvelope};

/// Bounded exponential backoff applied to failed tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Full jitter: pick uniformly between zero and the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `failures` previous failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_retries {
            return None;
        }

        let delay = self.backoff(failures);
        if !self.jitter {
            return Some(delay);
        }

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Some(Duration::from_millis(rand::rng().random_range(0..=millis)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying { delay: Duration },
    Abandoned,
}

/// Pulls tasks from the queue and runs them against a [`TaskContext`].
pub struct Worker {
    ctx: TaskContext,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(ctx: TaskContext, poll_interval: Duration) -> Self {
        Self { ctx, poll_interval }
    }

    /// Claim and run a single task. Returns `None` when the queue is empty.
    pub async fn process_next(&self) -> anyhow::Result<Option<(Uuid, TaskOutcome)>> {
        let Some(task) = self.ctx.queue.dequeue().await? else {
            return Ok(None);
        };

        let span = info_span!("task", id = %task.id, name = task.envelope.task.name());
        let outcome = self.settle(&task).instrument(span).await?;
        Ok(Some((task.id, outcome)))
    }

    async fn settle(&self, task: &QueuedTask) -> anyhow::Result<TaskOutcome> {
        if task.attempts > self.ctx.retry.max_retries {
            let message = format!("lease expired {} times without finishing", task.attempts);
            error!("Task abandoned: {message}");
            self.ctx.queue.fail(task.id, &message).await?;
            return Ok(TaskOutcome::Abandoned);
        }

        let err = match self.run_isolated(&task.envelope).await {
            Ok(()) => {
                self.ctx.queue.complete(task.id).await?;
                info!("Task completed");
                return Ok(TaskOutcome::Completed);
            }
            Err(err) => err,
        };

        let message = format!("{err:#}");
        match self.ctx.retry.next_delay(task.attempts) {
            Some(delay) => {
                warn!(
                    "Task failed (attempt {}), retrying in {:?}: {message}",
                    task.attempts + 1,
                    delay
                );
                self.ctx.queue.retry(task.id, delay, &message).await?;
                Ok(TaskOutcome::Retrying { delay })
            }
            None => {
                error!(
                    "Task failed after {} attempts, giving up: {message}",
                    task.attempts + 1
                );
                self.ctx.queue.fail(task.id, &message).await?;
                Ok(TaskOutcome::Abandoned)
            }
        }
    }

    /// Run the handler on its own tokio task so a panic surfaces as a failed attempt.
    async fn run_isolated(&self, envelope: &TaskEnvelope) -> anyhow::Result<()> {
        let ctx = self.ctx.clone();
        let envelope = envelope.clone();
        let handle =
            tokio::spawn(async move { execute(&ctx, &envelope).await }.in_current_span());

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("task panicked: {e}")),
            Err(e) => Err(anyhow!("task was cancelled: {e}")),
        }
    }

    /// Drain everything that is ready now. Used by one-shot CLI runs and tests.
    pub async fn drain(&self) -> anyhow::Result<Vec<(Uuid, TaskOutcome)>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Run `concurrency` polling loops until `shutdown` fires.
    pub async fn run(self: Arc<Self>, concurrency: usize, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for slot in 0..concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.poll_loop(slot, shutdown).await });
        }
        info!("Started {} worker loops", concurrency.max(1));

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Worker loop panicked: {e}");
            }
        }
        info!("All worker loops stopped");
    }

    async fn poll_loop(&self, slot: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!("Worker {slot} failed to process a task: {e:#}");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!("Worker {slot} shutting down");
    }
}

/// Retry `op` in place until it succeeds or the policy gives up.
pub async fn retry_in_place<F, Fut>(policy: &RetryPolicy, mut op: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut failures = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => match policy.next_delay(failures) {
                Some(delay) => {
                    warn!("Attempt {} failed, retrying in {delay:?}: {err:#}", failures + 1);
                    tokio::time::sleep(delay).await;
                    failures += 1;
                }
                None => return Err(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub completed: usize,
    pub abandoned: usize,
}

/// Fan out independent child tasks and wait for all of them.
pub async fn run_group(ctx: &TaskContext, sender: &Sender, tasks: Vec<Task>) -> GroupReport {
    let mut set = JoinSet::new();
    for task in tasks {
        let ctx = ctx.clone();
        let sender = sender.clone();
        set.spawn(async move {
            let result =
                retry_in_place(&ctx.retry, || execute_single(&ctx, &sender, &task)).await;
            (task.name(), result)
        });
    }

    let mut report = GroupReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => report.completed += 1,
            Ok((name, Err(e))) => {
                error!("Group member {name} abandoned: {e:#}");
                report.abandoned += 1;
            }
            Err(e) => {
                error!("Group member panicked: {e}");
                report.abandoned += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(20);
        assert_eq!(p.next_delay(0), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay(1), Some(Duration::from_secs(4)));
        assert_eq!(p.next_delay(4), Some(Duration::from_secs(32)));
        assert_eq!(p.next_delay(9), Some(Duration::from_secs(600)));
        assert_eq!(p.next_delay(19), Some(Duration::from_secs(600)));
    }

    #[test]
    fn retries_are_bounded() {
        let p = policy(5);
        assert!(p.next_delay(4).is_some());
        assert_eq!(p.next_delay(5), None);
    }

    #[test]
    fn jitter_stays_within_the_backoff() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(5)
        };
        for failures in 0..5 {
            let delay = p.next_delay(failures).unwrap();
            assert!(delay <= p.backoff(failures));
        }
    }

    #[tokio::test]
    async fn retry_in_place_recovers_after_transient_failures() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..policy(3)
        };
        let calls = AtomicU32::new(0);
        let result = retry_in_place(&p, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient");
            }
            Ok(())
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_in_place_gives_up() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..policy(2)
        };
        let calls = AtomicU32::new(0);
        let result = retry_in_place(&p, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("down")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

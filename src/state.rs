use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Settings;
use crate::db::PgGraphStore;
use crate::queue::PgTaskQueue;
use crate::secrets::SecretCache;
use crate::tasks::TaskContext;

pub struct State {
    pub settings: Settings,
    pub pool: PgPool,
    pub tasks: TaskContext,
}

impl State {
    pub async fn new(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_max_connections)
            .connect(&settings.database_url)
            .await
            .context("failed to connect to database")?;

        let tasks = TaskContext {
            store: Arc::new(PgGraphStore::new(pool.clone())),
            secrets: Arc::new(SecretCache::new(settings.secret_store())),
            mailer: settings.mailer(),
            queue: Arc::new(PgTaskQueue::new(pool.clone()).with_lease(settings.task_lease)),
            retry: settings.retry.clone(),
            utc_offset_hours: settings.utc_offset_hours,
        };

        Ok(Arc::new(Self {
            settings,
            pool,
            tasks,
        }))
    }
}

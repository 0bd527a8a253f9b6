use std::{env, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use crate::notify::{LogMailer, Mailer, SendgridMailer};
use crate::secrets::{FileSecretStore, SecretStore, VaultSecretStore};
use crate::worker::RetryPolicy;

pub struct Settings {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub vault: Option<VaultSettings>,
    pub secrets_dir: String,
    pub sendgrid_api_key: Option<String>,
    pub mail_from: String,
    pub worker_concurrency: usize,
    pub worker_poll: Duration,
    pub task_lease: Duration,
    pub retry: RetryPolicy,
    pub utc_offset_hours: i32,
}

pub struct VaultSettings {
    pub address: String,
    pub token: String,
    pub mount: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let vault = match (optional("VAULT_ADDRESS"), optional("VAULT_TOKEN")) {
            (Some(address), Some(token)) => Some(VaultSettings {
                address,
                token,
                mount: try_load("VAULT_MOUNT", "secret")?,
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            port: try_load("RUST_PORT", "8000")?,
            db_max_connections: try_load("DB_MAX_CONNECTIONS", "5")?,
            vault,
            secrets_dir: try_load("SECRETS_DIR", "./secrets")?,
            sendgrid_api_key: optional("SENDGRID_API_KEY"),
            mail_from: try_load("MAIL_FROM", "noreply@contact-tracer.local")?,
            worker_concurrency: try_load("WORKER_CONCURRENCY", "4")?,
            worker_poll: Duration::from_millis(try_load("WORKER_POLL_MS", "500")?),
            task_lease: Duration::from_secs(try_load("TASK_LEASE_SECS", "600")?),
            retry: RetryPolicy {
                max_retries: try_load("TASK_MAX_RETRIES", "5")?,
                base_delay: Duration::from_secs(try_load("TASK_RETRY_BASE_SECS", "2")?),
                max_delay: Duration::from_secs(try_load("TASK_RETRY_MAX_SECS", "600")?),
                jitter: try_load("TASK_RETRY_JITTER", "false")?,
            },
            utc_offset_hours: try_load("REPORT_UTC_OFFSET_HOURS", "-8")?,
        })
    }

    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match &self.vault {
            Some(vault) => {
                info!("Reading secrets from Vault at {}", vault.address);
                Arc::new(VaultSecretStore::new(&vault.address, &vault.mount, &vault.token))
            }
            None => {
                info!("Reading secrets from {}", self.secrets_dir);
                Arc::new(FileSecretStore::new(&self.secrets_dir))
            }
        }
    }

    pub fn mailer(&self) -> Arc<dyn Mailer> {
        match &self.sendgrid_api_key {
            Some(key) => Arc::new(SendgridMailer::new(key, &self.mail_from)),
            None => {
                warn!("SENDGRID_API_KEY not set, outgoing mail will only be logged");
                Arc::new(LogMailer)
            }
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    optional(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| anyhow!("Invalid {key} value: {e}"))
}

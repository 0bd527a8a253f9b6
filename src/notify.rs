use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::report::RenderedEmail;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipients: &[String], email: &RenderedEmail) -> anyhow::Result<()>;
}

/// SendGrid v3 `mail/send` with a plain-text body.
pub struct SendgridMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl SendgridMailer {
    pub fn new(api_key: &str, from: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            from: from.to_string(),
            endpoint: "https://api.sendgrid.com/v3/mail/send".to_string(),
        }
    }
}

#[async_trait]
impl Mailer for SendgridMailer {
    async fn send(&self, recipients: &[String], email: &RenderedEmail) -> anyhow::Result<()> {
        let to: Vec<_> = recipients.iter().map(|r| json!({ "email": r })).collect();
        let payload = json!({
            "personalizations": [{ "to": to }],
            "from": { "email": self.from },
            "subject": email.subject,
            "content": [{ "type": "text/plain", "value": email.body }],
        });

        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("failed to reach SendGrid")?
            .error_for_status()
            .context("SendGrid rejected the message")?;

        info!("Sent '{}' to {} recipients", email.subject, recipients.len());
        Ok(())
    }
}

/// Logs messages instead of sending them. Used when no mail API key is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, recipients: &[String], email: &RenderedEmail) -> anyhow::Result<()> {
        info!(
            "Mail to {}: {}\n{}",
            recipients.join(","),
            email.subject,
            email.body
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub recipients: Vec<String>,
    pub email: RenderedEmail,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, recipients: &[String], email: &RenderedEmail) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("mailer lock poisoned"))?
            .push(SentEmail {
                recipients: recipients.to_vec(),
                email: email.clone(),
            });
        Ok(())
    }
}

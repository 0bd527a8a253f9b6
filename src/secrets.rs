//! Runtime school configuration pulled from a secret store.
//!
//! Everything a task needs to know about a school (symptom thresholds, who gets
//! risk notifications, how far back to look) lives under `schools/{school}/...`.
//! Values are read lazily through [`SecretCache`] and evicted when they fail to
//! decode, so a corrected secret is picked up on the next retry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::risk::SymptomCriteria;
use crate::traversal::{CohortPolicy, TierSpec};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret '{path}' is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("secret '{path}' is invalid: {reason}")]
    Invalid { path: String, reason: String },
    #[error("secret store request for '{path}' failed: {source}")]
    Backend {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SecretError {
    fn backend(path: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        SecretError::Backend {
            path: path.to_string(),
            source: Box::new(source),
        }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Value, SecretError>;
}

/// HashiCorp Vault KV v2 reader.
pub struct VaultSecretStore {
    client: reqwest::Client,
    address: String,
    mount: String,
    token: String,
}

impl VaultSecretStore {
    pub fn new(address: &str, mount: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct VaultEnvelope {
    data: VaultData,
}

#[derive(Deserialize)]
struct VaultData {
    data: Value,
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn read(&self, path: &str) -> Result<Value, SecretError> {
        let url = format!("{}/v1/{}/data/{}", self.address, self.mount, path);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretError::backend(path, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(path.to_string()));
        }

        let envelope: VaultEnvelope = response
            .error_for_status()
            .map_err(|e| SecretError::backend(path, e))?
            .json()
            .await
            .map_err(|e| SecretError::backend(path, e))?;

        Ok(envelope.data.data)
    }
}

/// Reads `{root}/{path}.json`. Used for local development in place of Vault.
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn read(&self, path: &str) -> Result<Value, SecretError> {
        let file = self.root.join(format!("{path}.json"));
        let raw = match tokio::fs::read_to_string(&file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(path.to_string()))
            }
            Err(e) => return Err(SecretError::backend(path, e)),
        };

        serde_json::from_str(&raw).map_err(|source| SecretError::Malformed {
            path: path.to_string(),
            source,
        })
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, value: Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert(path.to_string(), value);
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn read(&self, path: &str) -> Result<Value, SecretError> {
        let values = self.values.read().map_err(|_| SecretError::Invalid {
            path: path.to_string(),
            reason: "secret map poisoned".to_string(),
        })?;
        values
            .get(path)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(path.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskNotificationSettings {
    #[serde(deserialize_with = "lenient::as_u32")]
    pub lookback_days: u32,
    #[serde(deserialize_with = "lenient::as_list")]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub tiers: Option<Vec<TierSpec>>,
    #[serde(default)]
    pub cohort_policy: CohortPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSettings {
    #[serde(deserialize_with = "lenient::as_list")]
    pub recipients: Vec<String>,
}

pub fn school_path(school: &str, leaf: &str) -> Result<String, SecretError> {
    let school = school.trim();
    if school.is_empty() || school.contains('/') || school.contains("..") {
        return Err(SecretError::Invalid {
            path: format!("schools/{school}/{leaf}"),
            reason: "school name is not a valid path segment".to_string(),
        });
    }
    Ok(format!("schools/{school}/{leaf}"))
}

/// Keyed, lazily populated cache in front of a [`SecretStore`].
pub struct SecretCache {
    store: Arc<dyn SecretStore>,
    entries: RwLock<HashMap<String, Value>>,
}

impl SecretCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, path: &str) -> Option<Value> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(path).cloned())
    }

    pub async fn get(&self, path: &str) -> Result<Value, SecretError> {
        if let Some(value) = self.cached(path) {
            return Ok(value);
        }

        info!("Secret '{path}' not cached, reading from store");
        let value = self.store.read(path).await?;
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(path.to_string(), value.clone());
        }
        Ok(value)
    }

    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, SecretError> {
        let value = self.get(path).await?;
        serde_json::from_value(value).map_err(|source| {
            warn!("Secret '{path}' failed to decode, evicting: {source}");
            self.invalidate(path);
            SecretError::Malformed {
                path: path.to_string(),
                source,
            }
        })
    }

    pub fn invalidate(&self, path: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(path);
        }
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.cached(path).is_some()
    }

    pub async fn symptom_criteria(&self, school: &str) -> Result<SymptomCriteria, SecretError> {
        self.get_as(&school_path(school, "symptom_criteria")?).await
    }

    pub async fn risk_notification(
        &self,
        school: &str,
    ) -> Result<RiskNotificationSettings, SecretError> {
        let path = school_path(school, "risk_notification")?;
        let settings: RiskNotificationSettings = self.get_as(&path).await?;
        self.require_recipients(&path, &settings.recipients)?;
        Ok(settings)
    }

    pub async fn daily_digest(&self, school: &str) -> Result<DigestSettings, SecretError> {
        let path = school_path(school, "daily_digest")?;
        let settings: DigestSettings = self.get_as(&path).await?;
        self.require_recipients(&path, &settings.recipients)?;
        Ok(settings)
    }

    fn require_recipients(&self, path: &str, recipients: &[String]) -> Result<(), SecretError> {
        if recipients.is_empty() {
            self.invalidate(path);
            return Err(SecretError::Invalid {
                path: path.to_string(),
                reason: "recipient list is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Deserializers for values stored as strings in a KV secret engine.
pub mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrText {
        Bool(bool),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrText {
        List(Vec<String>),
        Text(String),
    }

    fn as_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(n) => Ok(n),
            NumberOrText::Text(text) => text.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn as_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let n = as_i64(deserializer)?;
        u32::try_from(n).map_err(D::Error::custom)
    }

    pub fn as_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        let n = as_i64(deserializer)?;
        i32::try_from(n).map_err(D::Error::custom)
    }

    pub fn as_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match BoolOrText::deserialize(deserializer)? {
            BoolOrText::Bool(b) => Ok(b),
            BoolOrText::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" | "" => Ok(false),
                other => Err(D::Error::custom(format!("not a boolean: {other}"))),
            },
        }
    }

    pub fn as_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let items = match ListOrText::deserialize(deserializer)? {
            ListOrText::List(items) => items,
            ListOrText::Text(text) => text.split(',').map(str::to_string).collect(),
        };
        Ok(items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cache_with(path: &str, value: Value) -> (Arc<MemorySecretStore>, SecretCache) {
        let store = Arc::new(MemorySecretStore::new());
        store.insert(path, value);
        let cache = SecretCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn risk_notification_accepts_comma_separated_recipients() {
        let (_, cache) = cache_with(
            "schools/ridge/risk_notification",
            json!({"lookback_days": "14", "recipients": "nurse@ridge.edu, dean@ridge.edu"}),
        );

        let settings = cache.risk_notification("ridge").await.unwrap();
        assert_eq!(settings.lookback_days, 14);
        assert_eq!(settings.recipients, vec!["nurse@ridge.edu", "dean@ridge.edu"]);
        assert_eq!(settings.cohort_policy, CohortPolicy::Exclude);
        assert!(settings.tiers.is_none());
    }

    #[tokio::test]
    async fn missing_lookback_is_a_hard_failure_and_evicts() {
        let path = "schools/ridge/risk_notification";
        let (store, cache) = cache_with(path, json!({"recipients": ["nurse@ridge.edu"]}));

        let err = cache.risk_notification("ridge").await.unwrap_err();
        assert!(matches!(err, SecretError::Malformed { .. }));
        assert!(!cache.is_cached(path));

        store.insert(
            path,
            json!({"lookback_days": 7, "recipients": ["nurse@ridge.edu"]}),
        );
        let settings = cache.risk_notification("ridge").await.unwrap();
        assert_eq!(settings.lookback_days, 7);
    }

    #[tokio::test]
    async fn empty_recipients_are_rejected() {
        let (_, cache) = cache_with(
            "schools/ridge/daily_digest",
            json!({"recipients": " , "}),
        );
        let err = cache.daily_digest("ridge").await.unwrap_err();
        assert!(matches!(err, SecretError::Invalid { .. }));
    }

    #[tokio::test]
    async fn values_are_served_from_cache_after_first_read() {
        let path = "schools/ridge/symptom_criteria";
        let (store, cache) = cache_with(path, json!({"minimum_symptoms": 2}));

        assert_eq!(cache.symptom_criteria("ridge").await.unwrap().minimum_symptoms, 2);
        store.insert(path, json!({"minimum_symptoms": 5}));
        assert_eq!(cache.symptom_criteria("ridge").await.unwrap().minimum_symptoms, 2);

        cache.invalidate(path);
        assert_eq!(cache.symptom_criteria("ridge").await.unwrap().minimum_symptoms, 5);
    }

    #[tokio::test]
    async fn school_names_cannot_escape_their_prefix() {
        let cache = SecretCache::new(Arc::new(MemorySecretStore::new()));
        let err = cache.symptom_criteria("../admin").await.unwrap_err();
        assert!(matches!(err, SecretError::Invalid { .. }));
    }

    #[tokio::test]
    async fn file_store_reads_json_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let school_dir = dir.path().join("schools").join("ridge");
        std::fs::create_dir_all(&school_dir).unwrap();
        std::fs::write(
            school_dir.join("daily_digest.json"),
            r#"{"recipients": ["office@ridge.edu"]}"#,
        )
        .unwrap();

        let store = FileSecretStore::new(dir.path());
        let value = store.read("schools/ridge/daily_digest").await.unwrap();
        assert_eq!(value["recipients"][0], "office@ridge.edu");

        let missing = store.read("schools/ridge/risk_notification").await;
        assert!(matches!(missing, Err(SecretError::NotFound(_))));
    }
}

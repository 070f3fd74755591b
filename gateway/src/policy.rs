use std::time::Duration;

use serde::Serialize;

use crate::auth::AuthenticatedUser;
use crate::cache::TtlCache;
use crate::config::Settings;
use crate::entity::dataset_entry;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum PolicyError {
    Unavailable(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Unavailable(msg) => write!(f, "Policy engine unavailable: {msg}"),
        }
    }
}

impl std::error::Error for PolicyError {}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySubject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub groups: Vec<String>,
    pub scopes: Vec<String>,
    pub claims: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyAction {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyEnvironment {
    pub timestamp: String,
    pub source_service: String,
}

/// Structured input document sent to the policy engine.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub subject: PolicySubject,
    pub resource: PolicyResource,
    pub action: PolicyAction,
    pub environment: PolicyEnvironment,
}

impl PolicyInput {
    /// Stable cache key. The environment (timestamp) is deliberately
    /// excluded, otherwise no two evaluations would ever share a key.
    pub fn cache_key(&self) -> String {
        let mut groups = self.subject.groups.clone();
        groups.sort();
        let mut scopes = self.subject.scopes.clone();
        scopes.sort();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.subject.id,
            self.subject.kind,
            groups.join(","),
            scopes.join(","),
            self.resource.id,
            self.action.name,
        )
    }
}

/// Build the policy input for a dataset read.
pub fn dataset_read_input(
    entry: &dataset_entry::Model,
    user: Option<&AuthenticatedUser>,
) -> PolicyInput {
    let subject = match user {
        None => PolicySubject {
            id: "anonymous".to_string(),
            kind: "anonymous".to_string(),
            groups: Vec::new(),
            scopes: Vec::new(),
            claims: serde_json::Map::new(),
        },
        Some(user) => {
            // Client-credential tokens carry scopes but no groups.
            let kind = if !user.scopes.is_empty() && user.groups.is_empty() {
                "service"
            } else {
                "user"
            };
            PolicySubject {
                id: user.sub.clone(),
                kind: kind.to_string(),
                groups: user.groups.clone(),
                scopes: user.scopes.clone(),
                claims: user.claims.clone(),
            }
        }
    };

    let mut attributes = serde_json::Map::new();
    attributes.insert(
        "access_level".to_string(),
        entry
            .access_level
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    );
    attributes.insert(
        "backend_type".to_string(),
        serde_json::Value::String(entry.backend_type.clone()),
    );
    if let Some(namespace) = entry.namespace() {
        attributes.insert(
            "namespace".to_string(),
            serde_json::Value::String(namespace.to_string()),
        );
    }
    if let Some(governance) = entry.governance() {
        let visible: serde_json::Map<String, serde_json::Value> = governance
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !visible.is_empty() {
            attributes.insert(
                "governance".to_string(),
                serde_json::Value::Object(visible),
            );
        }
    }

    PolicyInput {
        subject,
        resource: PolicyResource {
            kind: "dataset".to_string(),
            id: entry.dataset_id.clone(),
            attributes: serde_json::Value::Object(attributes),
        },
        action: PolicyAction {
            name: "read".to_string(),
        },
        environment: PolicyEnvironment {
            timestamp: chrono::Utc::now().to_rfc3339(),
            source_service: "dataset-gateway".to_string(),
        },
    }
}

/// HTTP client for an OPA-style decision endpoint, with a bounded TTL
/// decision cache. The engine is a black box: `POST {url}/v1/data/{package}`
/// with `{"input": ...}` returning `{"result": {"allow": bool, "reason"?}}`.
pub struct PolicyClient {
    http: reqwest::Client,
    enabled: bool,
    decision_url: Option<String>,
    cache: TtlCache<PolicyDecision>,
    cache_ttl: Duration,
}

impl PolicyClient {
    pub fn from_settings(settings: &Settings) -> Self {
        let decision_url = settings.policy_url.as_ref().map(|base| {
            format!(
                "{}/v1/data/{}",
                base.trim_end_matches('/'),
                settings.policy_package.replace('.', "/")
            )
        });
        Self {
            http: reqwest::Client::new(),
            enabled: settings.policy_enabled,
            decision_url,
            cache: TtlCache::new(settings.policy_cache_size),
            cache_ttl: settings.policy_cache_ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        let key = input.cache_key();
        if let Some(decision) = self.cache.get(&key) {
            tracing::debug!(resource = %input.resource.id, allow = decision.allow, "Policy decision (cached)");
            return Ok(decision);
        }

        let url = self
            .decision_url
            .as_ref()
            .ok_or_else(|| PolicyError::Unavailable("no policy URL configured".to_string()))?;

        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "input": input }))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(error = %e, "Policy engine request failed");
                PolicyError::Unavailable(e.to_string())
            })?;

        let body: serde_json::Value = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Policy engine returned invalid JSON");
            PolicyError::Unavailable(e.to_string())
        })?;

        let result = body.get("result").and_then(|r| r.as_object());
        let allow = result.and_then(|r| r.get("allow")).and_then(|a| a.as_bool());
        let Some(allow) = allow else {
            tracing::warn!(body = %body, "Policy response missing boolean result.allow");
            return Err(PolicyError::Unavailable(
                "malformed policy response".to_string(),
            ));
        };
        let reason = result
            .and_then(|r| r.get("reason"))
            .and_then(|r| r.as_str())
            .map(|r| r.to_string());

        let decision = PolicyDecision { allow, reason };
        self.cache.insert(key, decision.clone(), self.cache_ttl);
        Ok(decision)
    }
}

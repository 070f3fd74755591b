use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::error::GatewayError;

type Claims = serde_json::Map<String, serde_json::Value>;

/// Normalized authenticated identity extracted from a validated JWT.
/// Issuer-agnostic and policy-engine friendly. The raw token is kept for
/// forwarding to row-filter upstreams and is excluded from Debug output.
#[derive(Clone)]
pub struct AuthenticatedUser {
    pub sub: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub scopes: Vec<String>,
    pub issuer: Option<String>,
    pub audiences: Vec<String>,
    pub claims: Claims,
    token: String,
}

impl AuthenticatedUser {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Remaining lifetime of the bearer token, from the `exp` claim.
    pub fn token_remaining_ttl(&self) -> Option<Duration> {
        let exp = self.claims.get("exp")?.as_i64()?;
        let remaining = exp - chrono::Utc::now().timestamp();
        Some(Duration::from_secs(remaining.max(0) as u64))
    }

    #[cfg(test)]
    pub fn for_tests(sub: &str, groups: &[&str], scopes: &[&str]) -> Self {
        Self {
            sub: sub.to_string(),
            username: Some(sub.to_string()),
            email: None,
            roles: Vec::new(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            issuer: None,
            audiences: Vec::new(),
            claims: Claims::new(),
            token: format!("test-token-{sub}"),
        }
    }
}

impl std::fmt::Debug for AuthenticatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedUser")
            .field("sub", &self.sub)
            .field("username", &self.username)
            .field("roles", &self.roles)
            .field("groups", &self.groups)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Validates bearer tokens against the issuer's JWKS and produces
/// `AuthenticatedUser`. Keys are cached and refreshed on TTL expiry or when
/// an unknown `kid` shows up.
pub struct TokenVerifier {
    http: reqwest::Client,
    jwks_uri: Option<String>,
    issuer: Option<String>,
    audiences: Vec<String>,
    client_id: Option<String>,
    cache_ttl: Duration,
    keys: RwLock<KeySet>,
}

impl TokenVerifier {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_uri: settings.oidc_jwks_uri.clone(),
            issuer: settings.oidc_issuer.clone(),
            audiences: expected_audiences(
                settings.oidc_audience.as_deref(),
                settings.oidc_client_id.as_deref(),
            ),
            client_id: settings.oidc_client_id.clone(),
            cache_ttl: settings.jwks_cache_ttl,
            keys: RwLock::new(KeySet {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// Verify a bearer token. Every failure mode collapses to a single 401;
    /// the underlying error goes to the debug log only.
    pub async fn verify(&self, token: &str) -> Result<AuthenticatedUser, GatewayError> {
        let header = decode_header(token).map_err(invalid_token)?;
        if header.alg != Algorithm::RS256 {
            tracing::debug!(alg = ?header.alg, "Rejected token with unexpected algorithm");
            return Err(GatewayError::Unauthenticated("Invalid token".to_string()));
        }
        let kid = header
            .kid
            .ok_or_else(|| GatewayError::Unauthenticated("Invalid token".to_string()))?;

        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        // Audience is always required: a token without `aud` is rejected.
        validation.set_audience(&self.audiences);

        let data = decode::<Claims>(token, &key, &validation).map_err(invalid_token)?;
        Ok(self.normalize(data.claims, token))
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, GatewayError> {
        {
            let set = self.keys.read().await;
            let fresh = set
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.cache_ttl);
            if fresh {
                if let Some(key) = set.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        self.refresh_keys().await?;

        let set = self.keys.read().await;
        set.keys.get(kid).cloned().ok_or_else(|| {
            tracing::debug!(kid = %kid, "No JWKS key for token kid");
            GatewayError::Unauthenticated("Invalid token".to_string())
        })
    }

    async fn refresh_keys(&self) -> Result<(), GatewayError> {
        let uri = self.jwks_uri.as_ref().ok_or_else(|| {
            tracing::debug!("Bearer token presented but no JWKS URI is configured");
            GatewayError::Unauthenticated("Invalid token".to_string())
        })?;

        let document: JwksDocument = self
            .http
            .get(uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::error!(error = %e, "JWKS fetch failed");
                GatewayError::Unauthenticated("Invalid token".to_string())
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "JWKS document is not valid JSON");
                GatewayError::Unauthenticated("Invalid token".to_string())
            })?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    tracing::warn!(kid = %kid, error = %err, "Skipping malformed JWKS key");
                }
            }
        }

        let mut set = self.keys.write().await;
        set.keys = keys;
        set.fetched_at = Some(Instant::now());
        Ok(())
    }

    fn normalize(&self, claims: Claims, token: &str) -> AuthenticatedUser {
        let sub = string_claim(&claims, "sub").unwrap_or_default();
        let username = string_claim(&claims, "preferred_username")
            .or_else(|| string_claim(&claims, "email"));
        let email = string_claim(&claims, "email");

        let mut roles = string_list(claims.get("realm_access").and_then(|v| v.get("roles")));
        if let Some(client_id) = &self.client_id {
            roles.extend(string_list(
                claims
                    .get("resource_access")
                    .and_then(|v| v.get(client_id))
                    .and_then(|v| v.get("roles")),
            ));
        }
        roles.sort();
        roles.dedup();

        let groups = string_list(claims.get("groups"));

        let scopes = string_claim(&claims, "scope")
            .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
            .unwrap_or_default();

        let audiences = match claims.get("aud") {
            Some(serde_json::Value::String(aud)) => vec![aud.clone()],
            aud => string_list(aud),
        };

        AuthenticatedUser {
            sub,
            username,
            email,
            roles,
            groups,
            scopes,
            issuer: string_claim(&claims, "iss"),
            audiences,
            claims,
            token: token.to_string(),
        }
    }
}

fn invalid_token(e: jsonwebtoken::errors::Error) -> GatewayError {
    tracing::debug!(error = %e, "JWT validation failed");
    GatewayError::Unauthenticated("Invalid token".to_string())
}

/// Accepted audiences: the configured audience, the client id, and the
/// Keycloak default `account`, deduplicated.
fn expected_audiences(audience: Option<&str>, client_id: Option<&str>) -> Vec<String> {
    let mut audiences = Vec::new();
    for candidate in [audience, client_id, Some("account")].into_iter().flatten() {
        if !candidate.is_empty() && !audiences.iter().any(|a| a == candidate) {
            audiences.push(candidate.to_string());
        }
    }
    audiences
}

fn string_claim(claims: &Claims, key: &str) -> Option<String> {
    claims.get(key)?.as_str().map(|s| s.to_string())
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Strip the `Bearer ` prefix from an Authorization header value.
pub fn extract_bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(|t| t.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verifier() -> TokenVerifier {
        let mut settings = Settings::defaults("postgres://localhost/db");
        settings.oidc_audience = Some("svc-gateway".to_string());
        settings.oidc_client_id = Some("gateway-client".to_string());
        settings.oidc_issuer = Some("https://idp.example/realms/main".to_string());
        TokenVerifier::from_settings(&settings)
    }

    fn claims(value: serde_json::Value) -> Claims {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn expected_audiences_dedup_and_order() {
        assert_eq!(
            expected_audiences(Some("svc"), Some("client")),
            vec!["svc", "client", "account"]
        );
        assert_eq!(
            expected_audiences(Some("account"), None),
            vec!["account"]
        );
        assert_eq!(expected_audiences(None, None), vec!["account"]);
    }

    #[test]
    fn normalize_merges_realm_and_client_roles() {
        let user = verifier().normalize(
            claims(json!({
                "sub": "u-1",
                "realm_access": {"roles": ["reader", "shared"]},
                "resource_access": {
                    "gateway-client": {"roles": ["writer", "shared"]},
                    "other-client": {"roles": ["ignored"]}
                }
            })),
            "tok",
        );
        assert_eq!(user.roles, vec!["reader", "shared", "writer"]);
    }

    #[test]
    fn normalize_splits_scopes_and_reads_groups() {
        let user = verifier().normalize(
            claims(json!({
                "sub": "u-1",
                "scope": "openid profile datasets:read",
                "groups": ["admins", "analysts"]
            })),
            "tok",
        );
        assert_eq!(user.scopes, vec!["openid", "profile", "datasets:read"]);
        assert_eq!(user.groups, vec!["admins", "analysts"]);
    }

    #[test]
    fn normalize_handles_string_and_array_audiences() {
        let v = verifier();
        let single = v.normalize(claims(json!({"sub": "s", "aud": "svc"})), "tok");
        assert_eq!(single.audiences, vec!["svc"]);
        let multi = v.normalize(claims(json!({"sub": "s", "aud": ["a", "b"]})), "tok");
        assert_eq!(multi.audiences, vec!["a", "b"]);
    }

    #[test]
    fn normalize_prefers_preferred_username_then_email() {
        let v = verifier();
        let u = v.normalize(
            claims(json!({"sub": "s", "preferred_username": "alice", "email": "a@x"})),
            "tok",
        );
        assert_eq!(u.username.as_deref(), Some("alice"));
        let u = v.normalize(claims(json!({"sub": "s", "email": "a@x"})), "tok");
        assert_eq!(u.username.as_deref(), Some("a@x"));
    }

    #[test]
    fn debug_output_never_contains_the_token() {
        let user = verifier().normalize(claims(json!({"sub": "s"})), "super-secret-token");
        let debug = format!("{user:?}");
        assert!(!debug.contains("super-secret-token"), "{debug}");
    }

    #[test]
    fn token_remaining_ttl_from_exp_claim() {
        let future = chrono::Utc::now().timestamp() + 120;
        let user = verifier().normalize(claims(json!({"sub": "s", "exp": future})), "tok");
        let ttl = user.token_remaining_ttl().unwrap();
        assert!(ttl <= Duration::from_secs(120) && ttl > Duration::from_secs(100));

        let expired = verifier().normalize(claims(json!({"sub": "s", "exp": 1})), "tok");
        assert_eq!(expired.token_remaining_ttl(), Some(Duration::ZERO));

        let none = verifier().normalize(claims(json!({"sub": "s"})), "tok");
        assert_eq!(none.token_remaining_ttl(), None);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthenticated() {
        let err = verifier().verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated(_)));
        assert_eq!(err.message(), "Invalid token");
    }

    #[test]
    fn extract_bearer_requires_prefix() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("bearer abc"), None);
    }
}

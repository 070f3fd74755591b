use crate::auth::AuthenticatedUser;
use crate::entity::dataset_entry;
use crate::error::GatewayError;
use crate::policy::{PolicyClient, dataset_read_input};

/// Disclosure level of a dataset. Absent means open; an unrecognised value
/// is a configuration error, never silently downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Open,
    Internal,
    Restricted,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    pub requires_auth: bool,
    pub requires_policy: bool,
}

impl AccessLevel {
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value {
            None => Ok(AccessLevel::Open),
            Some(raw) if raw.trim().is_empty() => Ok(AccessLevel::Open),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "open" => Ok(AccessLevel::Open),
                "internal" => Ok(AccessLevel::Internal),
                "restricted" => Ok(AccessLevel::Restricted),
                other => Err(format!("invalid access level: {other}")),
            },
        }
    }

    pub fn policy(&self) -> AccessPolicy {
        match self {
            AccessLevel::Open => AccessPolicy {
                requires_auth: false,
                requires_policy: false,
            },
            AccessLevel::Internal | AccessLevel::Restricted => AccessPolicy {
                requires_auth: true,
                requires_policy: true,
            },
        }
    }
}

/// Final access-control gate for dataset usage.
///
/// The authentication check always runs before any policy call, so an
/// anonymous request against a protected dataset never reaches the engine.
pub async fn enforce_dataset_access(
    entry: &dataset_entry::Model,
    user: Option<&AuthenticatedUser>,
    policy: &PolicyClient,
) -> Result<(), GatewayError> {
    let level = AccessLevel::parse(entry.access_level.as_deref()).map_err(|e| {
        tracing::warn!(dataset = %entry.dataset_id, error = %e, "Unparseable access level");
        GatewayError::Config("Invalid dataset access level configuration".to_string())
    })?;
    let access = level.policy();

    if access.requires_auth && user.is_none() {
        return Err(GatewayError::Unauthenticated(
            "Authentication required for this dataset".to_string(),
        ));
    }

    if access.requires_policy {
        if !policy.enabled() {
            tracing::warn!(
                dataset = %entry.dataset_id,
                "Policies disabled, allowing access"
            );
            return Ok(());
        }

        let input = dataset_read_input(entry, user);
        let decision = policy.decide(&input).await.map_err(|e| {
            tracing::error!(dataset = %entry.dataset_id, error = %e, "Policy evaluation failed");
            GatewayError::Upstream("Policy engine unavailable".to_string())
        })?;

        if !decision.allow {
            tracing::info!(
                dataset = %entry.dataset_id,
                user = %input.subject.id,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Access denied by policy"
            );
            return Err(GatewayError::Forbidden(
                decision
                    .reason
                    .unwrap_or_else(|| "Access denied by policy".to_string()),
            ));
        }

        tracing::debug!(
            dataset = %entry.dataset_id,
            user = %input.subject.id,
            "Access allowed by policy"
        );
    }

    Ok(())
}

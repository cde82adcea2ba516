//! Type definitions for the trust store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    /// Service account exists; roles or key still missing.
    Pending,
    Active,
    /// Deregistered. The record is kept.
    Revoked,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Pending => "pending",
            TrustStatus::Active => "active",
            TrustStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct RoleBinding {
    pub role: String,
    /// IAM member string, e.g. `serviceAccount:orchestrate@p1.iam.gserviceaccount.com`
    pub principal: String,
}

/// Trust relationship between the orchestrate project and one tenant project.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantTrust {
    pub project_id: String,
    pub service_account_email: String,
    pub role_bindings: Vec<RoleBinding>,
    pub key_fingerprint: Option<String>,
    pub status: TrustStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Freshly minted API key. The secret is never logged.
#[derive(Clone)]
pub struct KeyMaterial {
    pub fingerprint: String,
    secret: String,
}

impl KeyMaterial {
    pub fn new(fingerprint: String, secret: String) -> Self {
        Self {
            fingerprint,
            secret,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn into_secret(self) -> String {
        self.secret
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Operator,
    ServiceAccount { project_id: String, email: String },
}

impl Principal {
    /// IAM member string used in role bindings.
    pub fn member(&self) -> String {
        match self {
            Principal::Operator => "operator".to_string(),
            Principal::ServiceAccount { email, .. } => service_account_member(email),
        }
    }

    /// Project the caller is confined to, `None` for the operator.
    pub fn project(&self) -> Option<&str> {
        match self {
            Principal::Operator => None,
            Principal::ServiceAccount { project_id, .. } => Some(project_id),
        }
    }
}

pub fn service_account_member(email: &str) -> String {
    format!("serviceAccount:{}", email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Submit,
    ReadStatus,
    Cancel,
    FetchArtifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Result of `register`. `api_key` is only present when a key was minted by
/// this call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Registration {
    #[serde(flatten)]
    pub trust: TenantTrust,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub created: bool,
}

/// What a worker needs to act inside a tenant project.
#[derive(Clone)]
pub struct Credentials {
    pub project_id: String,
    pub service_account_email: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("project_id", &self.project_id)
            .field("service_account_email", &self.service_account_email)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let key = KeyMaterial::new("abc123".to_string(), "super-secret".to_string());
        let credentials = Credentials {
            project_id: "tenant-p1".to_string(),
            service_account_email: "orchestrate@tenant-p1.iam.gserviceaccount.com".to_string(),
            api_key: "super-secret".to_string(),
        };

        assert!(!format!("{:?}", key).contains("super-secret"));
        assert!(!format!("{:?}", credentials).contains("super-secret"));
    }

    #[test]
    fn test_principal_member() {
        let principal = Principal::ServiceAccount {
            project_id: "tenant-p1".to_string(),
            email: "orchestrate@tenant-p1.iam.gserviceaccount.com".to_string(),
        };

        assert_eq!(
            principal.member(),
            "serviceAccount:orchestrate@tenant-p1.iam.gserviceaccount.com"
        );
        assert_eq!(principal.project(), Some("tenant-p1"));
        assert_eq!(Principal::Operator.project(), None);
    }
}

//! Persistent trust records, role bindings and encrypted key material

use crate::crypto::{fingerprint, generate_salt, EncryptionKey};
use crate::error::{IdentityError, Result};
use crate::iam::IamBackend;
use crate::policy::AccessPolicy;
use crate::types::{
    service_account_member, Action, Credentials, Decision, KeyMaterial, Principal, Registration,
    RoleBinding, TenantTrust, TrustStatus,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use orchestrate_engine::validation::validate_project_id;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// identity_settings row holding the key derivation salt
const SALT_SETTING: &str = "key_encryption_salt";

/// Trust store manager
pub struct TrustStore {
    pool: SqlitePool,
    iam: Arc<dyn IamBackend>,
    encryption_key: EncryptionKey,
    policy: AccessPolicy,
    operator_fingerprint: String,
    /// Serializes register, revoke and rotate within this process.
    lifecycle: Mutex<()>,
}

impl TrustStore {
    /// Open the store, creating the key derivation salt on first use.
    pub async fn open(
        pool: SqlitePool,
        iam: Arc<dyn IamBackend>,
        passphrase: &str,
        orchestrate_project: &str,
        operator_key: &str,
    ) -> Result<Self> {
        sqlx::query("INSERT OR IGNORE INTO identity_settings (name, value) VALUES (?, ?)")
            .bind(SALT_SETTING)
            .bind(STANDARD.encode(generate_salt()))
            .execute(&pool)
            .await?;

        let salt: String = sqlx::query_scalar("SELECT value FROM identity_settings WHERE name = ?")
            .bind(SALT_SETTING)
            .fetch_one(&pool)
            .await?;
        let salt_bytes = STANDARD
            .decode(salt)
            .map_err(|e| IdentityError::Crypto(format!("Failed to decode salt: {}", e)))?;

        let encryption_key = EncryptionKey::derive_from_password(passphrase, &salt_bytes)?;

        Ok(Self {
            pool,
            iam,
            encryption_key,
            policy: AccessPolicy::new(orchestrate_project),
            operator_fingerprint: fingerprint(operator_key),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Create the tenant's service account and a `pending` trust record.
    #[instrument(skip(self))]
    pub async fn create_service_account(&self, project_id: &str) -> Result<String> {
        validate_project_id(project_id)
            .map_err(|_| IdentityError::InvalidProject(project_id.to_string()))?;

        if self.get_trust(project_id).await?.is_some() {
            return Err(IdentityError::AlreadyExists(project_id.to_string()));
        }

        let email = self.iam.create_service_account(project_id).await?;
        let now = Utc::now().timestamp();

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tenant_trust (project_id, service_account_email, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(&email)
        .bind(TrustStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(IdentityError::AlreadyExists(project_id.to_string()));
        }

        info!(project_id, email = %email, "Created service account");
        Ok(email)
    }

    /// Grant `roles` to the service account in its project. Re-binding is a
    /// no-op.
    #[instrument(skip(self, roles))]
    pub async fn bind_roles(
        &self,
        project_id: &str,
        service_account_email: &str,
        roles: &[String],
    ) -> Result<()> {
        if self.get_trust(project_id).await?.is_none() {
            return Err(IdentityError::NotFound(project_id.to_string()));
        }

        let principal = service_account_member(service_account_email);
        for role in roles {
            self.iam.add_binding(project_id, role, &principal).await?;

            sqlx::query(
                "INSERT OR IGNORE INTO role_bindings (project_id, role, principal, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(role)
            .bind(&principal)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Mint a new key. The previous key stops authenticating as soon as this
    /// returns.
    #[instrument(skip(self))]
    pub async fn issue_key(&self, project_id: &str) -> Result<KeyMaterial> {
        let trust = self
            .get_trust(project_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(project_id.to_string()))?;
        if trust.status == TrustStatus::Revoked {
            return Err(IdentityError::NotRegistered(project_id.to_string()));
        }

        let secret = self.iam.create_key(&trust.service_account_email).await?;
        let key_fingerprint = fingerprint(&secret);
        let encrypted = self.encryption_key.encrypt(&secret)?;

        sqlx::query(
            "UPDATE tenant_trust SET key_fingerprint = ?, encrypted_key = ?, updated_at = ?
             WHERE project_id = ?",
        )
        .bind(&key_fingerprint)
        .bind(&encrypted)
        .bind(Utc::now().timestamp())
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        info!(project_id, fingerprint = %key_fingerprint, "Issued service account key");
        Ok(KeyMaterial::new(key_fingerprint, secret))
    }

    /// Decide whether `principal` may perform `action` against
    /// `target_project`. Unregistered targets are denied.
    pub async fn authorize(
        &self,
        principal: &Principal,
        target_project: &str,
        action: Action,
    ) -> Result<Decision> {
        if *principal == Principal::Operator {
            return Ok(Decision::Allow);
        }

        match self.get_trust(target_project).await? {
            Some(trust) if trust.status == TrustStatus::Active => {
                Ok(self.policy.authorize(principal, &trust.role_bindings, action))
            }
            _ => Ok(Decision::Deny),
        }
    }

    /// Resolve an API key to the caller it belongs to.
    pub async fn authenticate(&self, api_key: &str) -> Result<Principal> {
        let key_fingerprint = fingerprint(api_key);
        if key_fingerprint == self.operator_fingerprint {
            return Ok(Principal::Operator);
        }

        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT project_id, service_account_email FROM tenant_trust
             WHERE key_fingerprint = ? AND status = ?",
        )
        .bind(&key_fingerprint)
        .bind(TrustStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((project_id, email)) => Ok(Principal::ServiceAccount { project_id, email }),
            None => Err(IdentityError::Unauthenticated),
        }
    }

    /// Register a tenant project: service account, role bindings, key.
    ///
    /// An active registration is returned unchanged. A pending one left by an
    /// earlier failure is resumed, and a revoked one is re-activated with a
    /// fresh key.
    #[instrument(skip(self))]
    pub async fn register(&self, project_id: &str) -> Result<Registration> {
        let _lifecycle = self.lifecycle.lock().await;

        let email = match self.get_trust(project_id).await? {
            Some(trust) if trust.status == TrustStatus::Active => {
                return Ok(Registration {
                    trust,
                    api_key: None,
                    created: false,
                });
            }
            Some(trust) if trust.status == TrustStatus::Revoked => {
                self.set_status(project_id, TrustStatus::Pending).await?;
                info!(project_id, "Re-activating revoked project");
                trust.service_account_email
            }
            Some(trust) => {
                info!(project_id, "Resuming pending registration");
                trust.service_account_email
            }
            None => match self.create_service_account(project_id).await {
                Ok(email) => email,
                // Another process created the record first; leave key issuance to it.
                Err(IdentityError::AlreadyExists(_)) => {
                    let trust = self
                        .get_trust(project_id)
                        .await?
                        .ok_or_else(|| IdentityError::NotFound(project_id.to_string()))?;
                    info!(project_id, status = %trust.status, "Project registered concurrently");
                    return Ok(Registration {
                        trust,
                        api_key: None,
                        created: false,
                    });
                }
                Err(e) => return Err(e),
            },
        };

        self.bind_roles(project_id, &email, &self.policy.tenant_roles())
            .await?;
        let key = self.issue_key(project_id).await?;
        self.set_status(project_id, TrustStatus::Active).await?;

        let trust = self
            .get_trust(project_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(project_id.to_string()))?;

        info!(project_id, email = %trust.service_account_email, "Registered project");
        Ok(Registration {
            trust,
            api_key: Some(key.into_secret()),
            created: true,
        })
    }

    /// Revoke a registration: remove its bindings and key, keep the record.
    #[instrument(skip(self))]
    pub async fn revoke(&self, project_id: &str) -> Result<TenantTrust> {
        let _lifecycle = self.lifecycle.lock().await;

        let trust = self
            .get_trust(project_id)
            .await?
            .ok_or_else(|| IdentityError::NotRegistered(project_id.to_string()))?;

        if trust.status == TrustStatus::Revoked {
            return Ok(trust);
        }

        for binding in &trust.role_bindings {
            self.iam
                .remove_binding(project_id, &binding.role, &binding.principal)
                .await?;
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM role_bindings WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE tenant_trust
             SET status = ?, key_fingerprint = NULL, encrypted_key = NULL, revoked_at = ?, updated_at = ?
             WHERE project_id = ?",
        )
        .bind(TrustStatus::Revoked)
        .bind(now)
        .bind(now)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        warn!(project_id, "Revoked project registration");
        self.get_trust(project_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(project_id.to_string()))
    }

    /// Replace the key of an active registration.
    pub async fn rotate_key(&self, project_id: &str) -> Result<KeyMaterial> {
        let _lifecycle = self.lifecycle.lock().await;

        self.require_active(project_id).await?;
        self.issue_key(project_id).await
    }

    /// Decrypted credentials for acting inside `project_id`.
    pub async fn credentials(&self, project_id: &str) -> Result<Credentials> {
        let trust = self.require_active(project_id).await?;

        let encrypted: Option<String> =
            sqlx::query_scalar("SELECT encrypted_key FROM tenant_trust WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        let encrypted =
            encrypted.ok_or_else(|| IdentityError::NotRegistered(project_id.to_string()))?;

        Ok(Credentials {
            project_id: trust.project_id,
            service_account_email: trust.service_account_email,
            api_key: self.encryption_key.decrypt(&encrypted)?,
        })
    }

    pub async fn get_trust(&self, project_id: &str) -> Result<Option<TenantTrust>> {
        let row = sqlx::query_as::<_, TrustRow>(
            "SELECT project_id, service_account_email, key_fingerprint, status, created_at, updated_at, revoked_at
             FROM tenant_trust WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role_bindings = sqlx::query_as::<_, (String, String)>(
            "SELECT role, principal FROM role_bindings WHERE project_id = ? ORDER BY role, principal",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(role, principal)| RoleBinding { role, principal })
        .collect();

        Ok(Some(row.into_trust(role_bindings)))
    }

    /// The project's trust record, if it is active.
    pub async fn require_active(&self, project_id: &str) -> Result<TenantTrust> {
        match self.get_trust(project_id).await? {
            Some(trust) if trust.status == TrustStatus::Active => Ok(trust),
            _ => Err(IdentityError::NotRegistered(project_id.to_string())),
        }
    }

    async fn set_status(&self, project_id: &str, status: TrustStatus) -> Result<()> {
        sqlx::query(
            "UPDATE tenant_trust SET status = ?, revoked_at = NULL, updated_at = ? WHERE project_id = ?",
        )
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TrustRow {
    project_id: String,
    service_account_email: String,
    key_fingerprint: Option<String>,
    status: TrustStatus,
    created_at: i64,
    updated_at: i64,
    revoked_at: Option<i64>,
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

impl TrustRow {
    fn into_trust(self, role_bindings: Vec<RoleBinding>) -> TenantTrust {
        TenantTrust {
            project_id: self.project_id,
            service_account_email: self.service_account_email,
            role_bindings,
            key_fingerprint: self.key_fingerprint,
            status: self.status,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
            revoked_at: self.revoked_at.map(timestamp),
        }
    }
}

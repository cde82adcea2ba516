//! Boundary to the cloud IAM service.

use crate::crypto::generate_api_key;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

/// Account id of the service account created in every tenant project.
pub const SERVICE_ACCOUNT_ID: &str = "orchestrate";

pub fn service_account_email(project_id: &str) -> String {
    format!("{}@{}.iam.gserviceaccount.com", SERVICE_ACCOUNT_ID, project_id)
}

#[async_trait]
pub trait IamBackend: Send + Sync {
    /// Create the service account and return its email. Creating one that
    /// already exists is not an error.
    async fn create_service_account(&self, project_id: &str) -> Result<String>;

    /// Additive: binding an existing `(role, principal)` pair is a no-op.
    async fn add_binding(&self, project_id: &str, role: &str, principal: &str) -> Result<()>;

    async fn remove_binding(&self, project_id: &str, role: &str, principal: &str) -> Result<()>;

    /// Mint a new key for the service account.
    async fn create_key(&self, service_account_email: &str) -> Result<String>;
}

#[derive(Default)]
struct LocalIamState {
    accounts: HashSet<String>,
    bindings: BTreeSet<(String, String, String)>,
    keys_minted: usize,
}

/// In-process IAM used by the binaries in dry-run mode and by tests.
#[derive(Default)]
pub struct LocalIam {
    state: Mutex<LocalIamState>,
}

impl LocalIam {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(role, principal)` pairs bound in `project_id`
    pub async fn bindings(&self, project_id: &str) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .bindings
            .iter()
            .filter(|(project, _, _)| project == project_id)
            .map(|(_, role, principal)| (role.clone(), principal.clone()))
            .collect()
    }

    pub async fn keys_minted(&self) -> usize {
        self.state.lock().await.keys_minted
    }
}

#[async_trait]
impl IamBackend for LocalIam {
    async fn create_service_account(&self, project_id: &str) -> Result<String> {
        let email = service_account_email(project_id);
        self.state.lock().await.accounts.insert(email.clone());
        debug!(project_id, email = %email, "Created service account");
        Ok(email)
    }

    async fn add_binding(&self, project_id: &str, role: &str, principal: &str) -> Result<()> {
        self.state.lock().await.bindings.insert((
            project_id.to_string(),
            role.to_string(),
            principal.to_string(),
        ));
        Ok(())
    }

    async fn remove_binding(&self, project_id: &str, role: &str, principal: &str) -> Result<()> {
        self.state.lock().await.bindings.remove(&(
            project_id.to_string(),
            role.to_string(),
            principal.to_string(),
        ));
        Ok(())
    }

    async fn create_key(&self, service_account_email: &str) -> Result<String> {
        self.state.lock().await.keys_minted += 1;
        debug!(email = service_account_email, "Minted service account key");
        Ok(generate_api_key())
    }
}

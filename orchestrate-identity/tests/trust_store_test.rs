//! Integration tests for the trust store
//!
//! Registration, key rotation, revocation and authorization against an
//! in-memory database and the local IAM backend.

use async_trait::async_trait;
use orchestrate_engine::test_utils::create_test_db;
use orchestrate_identity::{
    Action, Decision, IamBackend, IdentityError, LocalIam, Principal, TrustStatus, TrustStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const OPERATOR_KEY: &str = "operator-test-key";

async fn open_store() -> (TrustStore, Arc<LocalIam>) {
    let iam = Arc::new(LocalIam::new());
    let store = TrustStore::open(
        create_test_db().await,
        iam.clone(),
        "test-passphrase",
        "orchestrate-main",
        OPERATOR_KEY,
    )
    .await
    .expect("Failed to open trust store");
    (store, iam)
}

/// Fails the first key creation, then behaves like the local backend.
struct FlakyKeyIam {
    inner: LocalIam,
    failed_once: AtomicBool,
}

#[async_trait]
impl IamBackend for FlakyKeyIam {
    async fn create_service_account(&self, project_id: &str) -> orchestrate_identity::Result<String> {
        self.inner.create_service_account(project_id).await
    }

    async fn add_binding(
        &self,
        project_id: &str,
        role: &str,
        principal: &str,
    ) -> orchestrate_identity::Result<()> {
        self.inner.add_binding(project_id, role, principal).await
    }

    async fn remove_binding(
        &self,
        project_id: &str,
        role: &str,
        principal: &str,
    ) -> orchestrate_identity::Result<()> {
        self.inner.remove_binding(project_id, role, principal).await
    }

    async fn create_key(&self, email: &str) -> orchestrate_identity::Result<String> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(IdentityError::Backend("key quota exceeded".to_string()));
        }
        self.inner.create_key(email).await
    }
}

#[tokio::test]
async fn test_register_creates_active_trust() {
    let (store, iam) = open_store().await;

    let registration = store.register("tenant-p1").await.unwrap();

    assert!(registration.created);
    assert!(registration.api_key.is_some());
    let trust = registration.trust;
    assert_eq!(trust.status, TrustStatus::Active);
    assert_eq!(
        trust.service_account_email,
        "orchestrate@tenant-p1.iam.gserviceaccount.com"
    );
    assert!(trust.key_fingerprint.is_some());
    assert_eq!(trust.role_bindings.len(), 2);
    assert_eq!(iam.bindings("tenant-p1").await.len(), 2);
}

#[tokio::test]
async fn test_register_twice_mints_one_key() {
    let (store, iam) = open_store().await;

    let first = store.register("tenant-p1").await.unwrap();
    let second = store.register("tenant-p1").await.unwrap();

    assert!(!second.created);
    assert!(second.api_key.is_none());
    assert_eq!(
        first.trust.service_account_email,
        second.trust.service_account_email
    );
    assert_eq!(first.trust.key_fingerprint, second.trust.key_fingerprint);
    assert_eq!(iam.keys_minted().await, 1);
}

#[tokio::test]
async fn test_concurrent_registrations_share_one_record() {
    let (store, iam) = open_store().await;

    let (a, b) = tokio::join!(store.register("tenant-p1"), store.register("tenant-p1"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.trust.service_account_email, b.trust.service_account_email);
    assert_eq!(u32::from(a.created) + u32::from(b.created), 1);
    assert_eq!(iam.keys_minted().await, 1);

    // The one key handed out is the one that authenticates
    let key = a.api_key.or(b.api_key).unwrap();
    assert!(store.authenticate(&key).await.is_ok());
}

#[tokio::test]
async fn test_register_resumes_after_partial_failure() {
    let iam = Arc::new(FlakyKeyIam {
        inner: LocalIam::new(),
        failed_once: AtomicBool::new(false),
    });
    let store = TrustStore::open(
        create_test_db().await,
        iam.clone(),
        "test-passphrase",
        "orchestrate-main",
        OPERATOR_KEY,
    )
    .await
    .unwrap();

    let err = store.register("tenant-p1").await.unwrap_err();
    assert!(matches!(err, IdentityError::Backend(_)));

    let trust = store.get_trust("tenant-p1").await.unwrap().unwrap();
    assert_eq!(trust.status, TrustStatus::Pending);
    assert!(matches!(
        store.credentials("tenant-p1").await,
        Err(IdentityError::NotRegistered(_))
    ));

    let registration = store.register("tenant-p1").await.unwrap();
    assert!(registration.created);
    assert_eq!(registration.trust.status, TrustStatus::Active);
    assert_eq!(registration.trust.role_bindings.len(), 2);
    assert_eq!(iam.inner.keys_minted().await, 1);
}

#[tokio::test]
async fn test_create_service_account_rejects_existing() {
    let (store, _) = open_store().await;

    store.create_service_account("tenant-p1").await.unwrap();
    let err = store.create_service_account("tenant-p1").await.unwrap_err();

    assert!(matches!(err, IdentityError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_create_service_account_validates_project() {
    let (store, _) = open_store().await;

    let err = store.create_service_account("Bad_Project").await.unwrap_err();
    assert!(matches!(err, IdentityError::InvalidProject(_)));
}

#[tokio::test]
async fn test_bind_roles_is_additive() {
    let (store, _) = open_store().await;
    let email = store.create_service_account("tenant-p1").await.unwrap();
    let roles = vec!["roles/storage.objectViewer".to_string()];

    store.bind_roles("tenant-p1", &email, &roles).await.unwrap();
    store.bind_roles("tenant-p1", &email, &roles).await.unwrap();

    let trust = store.get_trust("tenant-p1").await.unwrap().unwrap();
    assert_eq!(trust.role_bindings.len(), 1);

    let err = store
        .bind_roles("tenant-p9", &email, &roles)
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::NotFound(_)));
}

#[tokio::test]
async fn test_authenticate_keys() {
    let (store, _) = open_store().await;
    let key = store.register("tenant-p1").await.unwrap().api_key.unwrap();

    assert_eq!(store.authenticate(OPERATOR_KEY).await.unwrap(), Principal::Operator);
    assert_eq!(
        store.authenticate(&key).await.unwrap(),
        Principal::ServiceAccount {
            project_id: "tenant-p1".to_string(),
            email: "orchestrate@tenant-p1.iam.gserviceaccount.com".to_string(),
        }
    );
    assert!(matches!(
        store.authenticate("not-a-key").await,
        Err(IdentityError::Unauthenticated)
    ));
}

#[tokio::test]
async fn test_rotated_key_stops_authenticating() {
    let (store, _) = open_store().await;
    let old_key = store.register("tenant-p1").await.unwrap().api_key.unwrap();

    let new_key = store.rotate_key("tenant-p1").await.unwrap();

    assert!(matches!(
        store.authenticate(&old_key).await,
        Err(IdentityError::Unauthenticated)
    ));
    assert!(store.authenticate(new_key.secret()).await.is_ok());

    let credentials = store.credentials("tenant-p1").await.unwrap();
    assert_eq!(credentials.api_key, new_key.secret());
}

#[tokio::test]
async fn test_authorize_confines_tenants_to_their_project() {
    let (store, _) = open_store().await;
    let p1_key = store.register("tenant-p1").await.unwrap().api_key.unwrap();
    store.register("tenant-p2").await.unwrap();
    let p1 = store.authenticate(&p1_key).await.unwrap();

    for action in [Action::Submit, Action::ReadStatus, Action::Cancel, Action::FetchArtifacts] {
        assert_eq!(
            store.authorize(&p1, "tenant-p1", action).await.unwrap(),
            Decision::Allow
        );
    }
    assert_eq!(
        store.authorize(&p1, "tenant-p2", Action::Submit).await.unwrap(),
        Decision::Deny
    );
    assert_eq!(
        store.authorize(&p1, "unknown-project", Action::Submit).await.unwrap(),
        Decision::Deny
    );
    assert_eq!(
        store
            .authorize(&Principal::Operator, "tenant-p2", Action::Cancel)
            .await
            .unwrap(),
        Decision::Allow
    );
}

#[tokio::test]
async fn test_revoke_and_reactivate() {
    let (store, iam) = open_store().await;
    let key = store.register("tenant-p1").await.unwrap().api_key.unwrap();

    let trust = store.revoke("tenant-p1").await.unwrap();
    assert_eq!(trust.status, TrustStatus::Revoked);
    assert!(trust.revoked_at.is_some());
    assert!(trust.role_bindings.is_empty());
    assert!(trust.key_fingerprint.is_none());
    assert!(iam.bindings("tenant-p1").await.is_empty());

    assert!(matches!(
        store.authenticate(&key).await,
        Err(IdentityError::Unauthenticated)
    ));
    assert!(matches!(
        store.credentials("tenant-p1").await,
        Err(IdentityError::NotRegistered(_))
    ));
    assert!(matches!(
        store.rotate_key("tenant-p1").await,
        Err(IdentityError::NotRegistered(_))
    ));

    // Revoking again is harmless
    store.revoke("tenant-p1").await.unwrap();

    let registration = store.register("tenant-p1").await.unwrap();
    assert!(registration.created);
    assert_eq!(registration.trust.status, TrustStatus::Active);
    assert!(registration.trust.revoked_at.is_none());
    assert_eq!(iam.keys_minted().await, 2);
}

#[tokio::test]
async fn test_revoke_unknown_project() {
    let (store, _) = open_store().await;

    assert!(matches!(
        store.revoke("tenant-p1").await,
        Err(IdentityError::NotRegistered(_))
    ));
}

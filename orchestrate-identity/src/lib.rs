//! # Orchestrate Identity
//!
//! Trust boundary between the orchestrate project and its tenant projects.
//! Each registered tenant gets a service account, a fixed set of role
//! bindings and an API key. Keys are stored AES-256-GCM encrypted and looked
//! up by SHA-256 fingerprint.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orchestrate_identity::{LocalIam, TrustStore};
//! use std::sync::Arc;
//!
//! # async fn example(pool: sqlx::SqlitePool) -> orchestrate_identity::Result<()> {
//! let store = TrustStore::open(pool, Arc::new(LocalIam::new()), "passphrase", "orchestrate-main", "operator-key").await?;
//! let registration = store.register("tenant-p1").await?;
//! println!("{}", registration.trust.service_account_email);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod iam;
pub mod policy;
pub mod store;
pub mod types;

pub use error::{IdentityError, Result};
pub use iam::{service_account_email, IamBackend, LocalIam};
pub use policy::AccessPolicy;
pub use store::TrustStore;
pub use types::{
    Action, Credentials, Decision, KeyMaterial, Principal, Registration, RoleBinding,
    TenantTrust, TrustStatus,
};

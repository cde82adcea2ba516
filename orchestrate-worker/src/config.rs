use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_orchestrate_project")]
    pub orchestrate_project: String,

    #[serde(default = "default_operator_key")]
    pub operator_key: String,

    #[serde(default = "default_secret_passphrase")]
    pub secret_passphrase: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ORCHESTRATE_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".orchestrate").join("orchestrate.db")
}

fn default_orchestrate_project() -> String {
    std::env::var("ORCHESTRATE_PROJECT").unwrap_or_else(|_| "orchestrate".to_string())
}

fn default_operator_key() -> String {
    std::env::var("ORCHESTRATE_OPERATOR_KEY").unwrap_or_default()
}

fn default_secret_passphrase() -> String {
    std::env::var("ORCHESTRATE_SECRET_PASSPHRASE").unwrap_or_default()
}

fn default_poll_interval() -> u64 {
    std::env::var("ORCHESTRATE_POLL_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: default_db_path(),
            orchestrate_project: default_orchestrate_project(),
            operator_key: default_operator_key(),
            secret_passphrase: default_secret_passphrase(),
            poll_interval_ms: default_poll_interval(),
        }
    }

    /// Workers decrypt tenant keys, so they need the same passphrase as the API.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secret_passphrase.is_empty() {
            anyhow::bail!("ORCHESTRATE_SECRET_PASSPHRASE must be set");
        }
        if self.operator_key.is_empty() {
            anyhow::bail!("ORCHESTRATE_OPERATOR_KEY must be set");
        }
        Ok(())
    }
}

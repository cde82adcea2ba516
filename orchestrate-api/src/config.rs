use orchestrate_engine::policy::{
    RetryPolicy, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_CAP_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_STAGE_TIMEOUT_SECS, MAX_DELAY_SECS,
};
use orchestrate_engine::RequestKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Project hosting the orchestrate control plane and its custom role.
    #[serde(default = "default_orchestrate_project")]
    pub orchestrate_project: String,

    #[serde(default = "default_operator_key")]
    pub operator_key: String,

    /// Passphrase the key encryption key is derived from.
    #[serde(default = "default_secret_passphrase")]
    pub secret_passphrase: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long acknowledged bus messages and dedup rows of settled
    /// requests are kept.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Request kinds accepted for submission; the ones workers are deployed for.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<RequestKind>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("ORCHESTRATE_BIND").unwrap_or_else(|_| "0.0.0.0:3140".to_string())
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

fn default_max_attempts() -> u32 {
    env_or("ORCHESTRATE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)
}

fn default_backoff_base() -> u64 {
    env_or("ORCHESTRATE_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE_SECS)
}

fn default_backoff_cap() -> u64 {
    env_or("ORCHESTRATE_BACKOFF_CAP_SECS", DEFAULT_BACKOFF_CAP_SECS)
}

fn default_stage_timeout() -> u64 {
    env_or("ORCHESTRATE_STAGE_TIMEOUT_SECS", DEFAULT_STAGE_TIMEOUT_SECS)
}

fn default_watchdog_interval() -> u64 {
    env_or("ORCHESTRATE_WATCHDOG_INTERVAL", 30)
}

fn default_poll_interval() -> u64 {
    env_or("ORCHESTRATE_POLL_INTERVAL_MS", 500)
}

fn default_kinds() -> Vec<RequestKind> {
    match std::env::var("ORCHESTRATE_KINDS") {
        Ok(kinds) => parse_kinds(&kinds),
        Err(_) => vec![RequestKind::Image, RequestKind::Template, RequestKind::Instance],
    }
}

/// `image,template` -> kinds; unknown names are skipped.
fn parse_kinds(kinds: &str) -> Vec<RequestKind> {
    kinds
        .split(',')
        .filter_map(|kind| kind.trim().parse().ok())
        .collect()
}

fn default_retention() -> u64 {
    env_or("ORCHESTRATE_RETENTION_SECS", 7 * 24 * 3600)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            orchestrate_project: default_orchestrate_project(),
            operator_key: default_operator_key(),
            secret_passphrase: default_secret_passphrase(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            stage_timeout_secs: default_stage_timeout(),
            watchdog_interval_secs: default_watchdog_interval(),
            poll_interval_ms: default_poll_interval(),
            retention_secs: default_retention(),
            kinds: default_kinds(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base_secs: self.backoff_base_secs,
            backoff_cap_secs: self.backoff_cap_secs,
            stage_timeout_secs: self.stage_timeout_secs,
        }
    }

    /// Settings without a usable default.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.operator_key.is_empty() {
            anyhow::bail!("ORCHESTRATE_OPERATOR_KEY must be set");
        }
        if self.secret_passphrase.is_empty() {
            anyhow::bail!("ORCHESTRATE_SECRET_PASSPHRASE must be set");
        }
        for (name, secs) in [
            ("ORCHESTRATE_BACKOFF_BASE_SECS", self.backoff_base_secs),
            ("ORCHESTRATE_BACKOFF_CAP_SECS", self.backoff_cap_secs),
            ("ORCHESTRATE_STAGE_TIMEOUT_SECS", self.stage_timeout_secs),
        ] {
            if secs > MAX_DELAY_SECS {
                anyhow::bail!("{} must be at most {} seconds", name, MAX_DELAY_SECS);
            }
        }
        if self.kinds.is_empty() {
            anyhow::bail!("ORCHESTRATE_KINDS must name at least one request kind");
        }
        if self.stage_timeout_secs == 0 {
            anyhow::bail!("ORCHESTRATE_STAGE_TIMEOUT_SECS must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_never_allows_zero_attempts() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };

        assert_eq!(config.retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_validate_requires_secrets() {
        let config = Config {
            operator_key: String::new(),
            secret_passphrase: "passphrase".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            operator_key: "operator".to_string(),
            secret_passphrase: "passphrase".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(
            parse_kinds("image, instance,bogus"),
            vec![RequestKind::Image, RequestKind::Instance]
        );
        assert!(parse_kinds("").is_empty());
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let base = Config {
            operator_key: "operator".to_string(),
            secret_passphrase: "passphrase".to_string(),
            ..Config::default()
        };

        let config = Config {
            stage_timeout_secs: u64::MAX,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            backoff_cap_secs: 100_000_000_000_000_000,
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            stage_timeout_secs: 0,
            ..base
        };
        assert!(config.validate().is_err());
    }
}

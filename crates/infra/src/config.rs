//! Configuration loading and representation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use cabinet_booking::catalog::{CatalogError, StatusCatalog};
use cabinet_booking::flags::FeatureFlags;
use cabinet_booking::meeting::MeetingStrategyKind;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_JOB_CONCURRENCY: usize = 4;
const DEV_WEBHOOK_SECRET: &str = "dev-webhook-secret";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl ConfigError {
    fn invalid(var: &'static str, message: impl ToString) -> Self {
        Self::Invalid {
            var,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub webhook_secret: String,
    /// In-memory stores when unset.
    pub database_url: Option<String>,
    /// In-process sweep lock when unset.
    pub redis_url: Option<String>,
    /// Built-in catalog when unset.
    pub status_catalog: Option<PathBuf>,
    pub meeting_strategy: MeetingStrategyKind,
    pub feature_flags: FeatureFlags,
    pub sweep_interval: Duration,
    pub job_concurrency: usize,
    /// Addresses that receive blocked-regression reports.
    pub alert_recipients: Vec<String>,
}

impl AppConfig {
    /// Reads the process environment after loading an optional `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind_addr = get("CABINET_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e| ConfigError::invalid("CABINET_BIND_ADDR", e))?;

        let webhook_secret = get("AMOCRM_WEBHOOK_SECRET").unwrap_or_else(|| {
            warn!("AMOCRM_WEBHOOK_SECRET is not set, using the development secret");
            DEV_WEBHOOK_SECRET.to_string()
        });

        let meeting_strategy = match get("CABINET_MEETING_STRATEGY") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid("CABINET_MEETING_STRATEGY", e))?,
            None => MeetingStrategyKind::default(),
        };

        let feature_flags = match get("CABINET_FEATURE_FLAGS") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid("CABINET_FEATURE_FLAGS", e))?,
            None => FeatureFlags::default(),
        };

        let sweep_secs = match get("CABINET_SWEEP_INTERVAL_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid("CABINET_SWEEP_INTERVAL_SECS", e))?,
            None => DEFAULT_SWEEP_INTERVAL_SECS,
        };
        if sweep_secs == 0 {
            return Err(ConfigError::invalid("CABINET_SWEEP_INTERVAL_SECS", "must be positive"));
        }

        let job_concurrency = match get("CABINET_JOB_CONCURRENCY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| ConfigError::invalid("CABINET_JOB_CONCURRENCY", e))?
                .max(1),
            None => DEFAULT_JOB_CONCURRENCY,
        };

        let alert_recipients = get("CABINET_ALERT_EMAILS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            webhook_secret,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            status_catalog: get("CABINET_STATUS_CATALOG").map(PathBuf::from),
            meeting_strategy,
            feature_flags,
            sweep_interval: Duration::from_secs(sweep_secs),
            job_concurrency,
            alert_recipients,
        })
    }

    pub fn load_catalog(&self) -> Result<StatusCatalog, ConfigError> {
        Ok(match &self.status_catalog {
            Some(path) => StatusCatalog::from_path(path)?,
            None => StatusCatalog::builtin()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(cfg.webhook_secret, DEV_WEBHOOK_SECRET);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.meeting_strategy, MeetingStrategyKind::StatusId);
        assert_eq!(cfg.feature_flags, FeatureFlags::default());
        assert_eq!(cfg.sweep_interval, Duration::from_secs(600));
        assert!(cfg.alert_recipients.is_empty());
        assert!(cfg.load_catalog().is_ok());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("CABINET_BIND_ADDR", "127.0.0.1:9000"),
            ("AMOCRM_WEBHOOK_SECRET", "s3cret"),
            ("DATABASE_URL", "postgres://localhost/cabinet"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("CABINET_MEETING_STRATEGY", "dual_write"),
            ("CABINET_FEATURE_FLAGS", "update_contact_webhook, regression_alerts"),
            ("CABINET_SWEEP_INTERVAL_SECS", "30"),
            ("CABINET_JOB_CONCURRENCY", "8"),
            ("CABINET_ALERT_EMAILS", "ops@example.com, dev@example.com"),
        ])
        .unwrap();

        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.webhook_secret, "s3cret");
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(cfg.meeting_strategy, MeetingStrategyKind::DualWrite);
        assert!(cfg.feature_flags.update_contact_webhook);
        assert!(cfg.feature_flags.regression_alerts);
        assert!(!cfg.feature_flags.check_pinning_webhook);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.job_concurrency, 8);
        assert_eq!(cfg.alert_recipients, vec!["ops@example.com", "dev@example.com"]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("CABINET_FEATURE_FLAGS", "teleport")]),
            Err(ConfigError::Invalid { var: "CABINET_FEATURE_FLAGS", .. })
        ));
        assert!(matches!(
            config(&[("CABINET_SWEEP_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { var: "CABINET_SWEEP_INTERVAL_SECS", .. })
        ));
        assert!(config(&[("CABINET_BIND_ADDR", "nowhere")]).is_err());
    }

    #[test]
    fn missing_catalog_file_is_an_error() {
        let cfg = config(&[("CABINET_STATUS_CATALOG", "/nonexistent/catalog.json")]).unwrap();
        assert!(matches!(cfg.load_catalog(), Err(ConfigError::Catalog(_))));
    }
}

//! Feature flags read once at startup.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use cabinet_core::DomainError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Create bookings for unknown leads entering the booking group.
    pub update_contact_webhook: bool,
    /// Run the client pinning check after status or pipeline moves.
    pub check_pinning_webhook: bool,
    /// Import the lead's agent on update webhooks.
    pub import_agent_webhook: bool,
    /// Report dropped regressions out of band.
    pub regression_alerts: bool,
}

impl FeatureFlags {
    pub const NAMES: [&'static str; 4] = [
        "update_contact_webhook",
        "check_pinning_webhook",
        "import_agent_webhook",
        "regression_alerts",
    ];

    pub fn all() -> Self {
        Self {
            update_contact_webhook: true,
            check_pinning_webhook: true,
            import_agent_webhook: true,
            regression_alerts: true,
        }
    }

    /// Parses a comma-separated list, logging and skipping unknown names.
    pub fn parse_lenient(list: &str) -> Self {
        let mut flags = Self::default();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if let Err(err) = flags.enable(name) {
                warn!(flag = name, error = %err, "ignoring unknown feature flag");
            }
        }
        flags
    }

    pub fn enable(&mut self, name: &str) -> Result<(), DomainError> {
        match name {
            "update_contact_webhook" => self.update_contact_webhook = true,
            "check_pinning_webhook" => self.check_pinning_webhook = true,
            "import_agent_webhook" => self.import_agent_webhook = true,
            "regression_alerts" => self.regression_alerts = true,
            other => {
                return Err(DomainError::validation(format!(
                    "unknown feature flag: {other}"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for FeatureFlags {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = Self::default();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            flags.enable(name)?;
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_names() {
        let flags: FeatureFlags = "update_contact_webhook, regression_alerts".parse().unwrap();
        assert!(flags.update_contact_webhook);
        assert!(flags.regression_alerts);
        assert!(!flags.check_pinning_webhook);
        assert_eq!("".parse::<FeatureFlags>().unwrap(), FeatureFlags::default());
    }

    #[test]
    fn strict_parse_rejects_unknown_names() {
        assert!("update_contact_webhook,bogus".parse::<FeatureFlags>().is_err());
        let lenient = FeatureFlags::parse_lenient("bogus,import_agent_webhook");
        assert!(lenient.import_agent_webhook);
    }
}

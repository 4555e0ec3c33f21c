//! Operator settings
//!
//! Durations are plain milliseconds in the YAML file so it stays readable:
//!
//! ```yaml
//! namespace: redis-database
//! tick_interval_ms: 1000
//! restart_threshold_ms: 20000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WardenError};
use crate::reconcile::Backoff;
use crate::wire::ConnectSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSettings {
    /// Namespace to watch; empty watches all namespaces
    pub namespace: String,
    /// Fixed requeue after a successful reconcile
    pub tick_interval_ms: u64,
    /// Per-connection and per-command timeout towards members
    pub probe_timeout_ms: u64,
    /// Requeue delay for deferred (non-critical) conditions
    pub deferred_delay_ms: u64,
    /// Sentinels subjectively down for longer than this get their pod deleted
    pub restart_threshold_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// How often the controller lists objects to pick up new ones
    pub resync_interval_ms: u64,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            tick_interval_ms: 1_000,
            probe_timeout_ms: 1_000,
            deferred_delay_ms: 1_000,
            restart_threshold_ms: 20_000,
            backoff_base_ms: 5,
            backoff_cap_ms: 1_000_000,
            resync_interval_ms: 10_000,
        }
    }
}

impl OperatorSettings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(WardenError::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(WardenError::InvalidConfig("probe_timeout_ms must be > 0".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(WardenError::InvalidConfig("backoff_base_ms must be > 0".into()));
        }
        if self.deferred_delay_ms == 0 {
            return Err(WardenError::InvalidConfig("deferred_delay_ms must be > 0".into()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(WardenError::InvalidConfig(
                "backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn deferred_delay(&self) -> Duration {
        Duration::from_millis(self.deferred_delay_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
        .with_jitter(0.1)
    }

    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings::new(self.probe_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = OperatorSettings::default();
        assert_eq!(settings.tick_interval(), Duration::from_secs(1));
        assert_eq!(settings.restart_threshold_ms, 20_000);
        assert_eq!(settings.backoff_cap_ms, 1_000_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = OperatorSettings::from_yaml("namespace: redis\nprobe_timeout_ms: 250\n").unwrap();
        assert_eq!(settings.namespace, "redis");
        assert_eq!(settings.probe_timeout(), Duration::from_millis(250));
        assert_eq!(settings.deferred_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = OperatorSettings::from_yaml("tick_interval_ms: 0").unwrap_err();
        assert_eq!(err.severity(), crate::errors::Severity::Critical);
        assert!(OperatorSettings::from_yaml("tick_interval_ms: [").is_err());
    }

    #[test]
    fn test_zero_backoff_base_rejected() {
        let err = OperatorSettings::from_yaml("backoff_base_ms: 0").unwrap_err();
        assert!(matches!(err, WardenError::InvalidConfig(ref m) if m.contains("backoff_base_ms")));
    }

    #[test]
    fn test_zero_deferred_delay_rejected() {
        let err = OperatorSettings::from_yaml("deferred_delay_ms: 0").unwrap_err();
        assert!(matches!(err, WardenError::InvalidConfig(ref m) if m.contains("deferred_delay_ms")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "restart_threshold_ms: 5000").unwrap();
        let settings = OperatorSettings::load(file.path()).unwrap();
        assert_eq!(settings.restart_threshold_ms, 5000);
    }
}

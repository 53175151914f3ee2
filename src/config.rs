use crate::bridge::BridgeConfig;
use crate::bus::MessageBusConfig;
use crate::emergency::EmergencyConfig;
use crate::monitoring::MonitoringConfig;
use crate::supervisor::SupervisorConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub bus: MessageBusConfig,
    pub monitoring: MonitoringConfig,
    pub emergency: EmergencyConfig,
    pub supervisor: SupervisorConfig,
    pub bridge: BridgeConfig,
    /// Health/status HTTP port; the server is off when unset
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info,hivectl=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HIVE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HIVE_SUPERVISOR__DECISION_TTL_SECS, etc.)
            .add_source(
                Environment::with_prefix("HIVE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Message bus
        if self.bus.history_max_size == 0 {
            errors.push("bus.history_max_size must be positive".to_string());
        }
        if self.bus.dead_letter_max_size == 0 {
            errors.push("bus.dead_letter_max_size must be positive".to_string());
        }
        if self.bus.delivery_timeout_ms == 0 {
            errors.push("bus.delivery_timeout_ms must be positive".to_string());
        }
        errors.extend(self.bus.retry.validate("bus.retry"));
        errors.extend(
            self.bus
                .subscriber_breaker
                .validate("bus.subscriber_breaker"),
        );

        // Monitoring
        if self.monitoring.monitoring_interval_secs == 0 {
            errors.push("monitoring.monitoring_interval_secs must be positive".to_string());
        }
        if self.monitoring.heartbeat_timeout_secs == 0 {
            errors.push("monitoring.heartbeat_timeout_secs must be positive".to_string());
        }
        if self.monitoring.metrics_history_size == 0 {
            errors.push("monitoring.metrics_history_size must be positive".to_string());
        }

        // Emergency thresholds
        let mut names = HashSet::new();
        for threshold in &self.emergency.thresholds {
            if !names.insert(threshold.name.as_str()) {
                errors.push(format!(
                    "emergency.thresholds: duplicate threshold name '{}'",
                    threshold.name
                ));
            }
            if !threshold.threshold_value.is_finite() {
                errors.push(format!(
                    "emergency.thresholds.{}: threshold_value must be finite",
                    threshold.name
                ));
            }
        }
        if self.emergency.history_size == 0 {
            errors.push("emergency.history_size must be positive".to_string());
        }

        // Supervisor
        if self.supervisor.coordination_interval_ms == 0 {
            errors.push("supervisor.coordination_interval_ms must be positive".to_string());
        }
        if self.supervisor.decision_timeout_ms == 0 {
            errors.push("supervisor.decision_timeout_ms must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.supervisor.urgent_confidence_threshold) {
            errors.push("supervisor.urgent_confidence_threshold must be within [0, 1]".to_string());
        }
        if self.supervisor.improvement_window == 0 {
            errors.push("supervisor.improvement_window must be positive".to_string());
        }
        if self.supervisor.history_size == 0 {
            errors.push("supervisor.history_size must be positive".to_string());
        }

        // Bridge
        errors.extend(self.bridge.validate());
        if self.bridge.handler_timeout_ms >= self.bus.delivery_timeout_ms {
            errors.push(format!(
                "bridge.handler_timeout_ms ({}) must be less than bus.delivery_timeout_ms ({})",
                self.bridge.handler_timeout_ms, self.bus.delivery_timeout_ms
            ));
        }

        if self.health_port == Some(0) {
            errors.push("health_port must not be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::HiveError::Internal(format!("config serialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::{EmergencyThreshold, EmergencyType, Severity};

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.health_port.is_none());
        assert_eq!(config.logging.level, "info,hivectl=debug");
    }

    #[test]
    fn test_missing_directory_yields_defaults() {
        let config = AppConfig::load_from("/nonexistent/hivectl-config").unwrap();
        assert_eq!(config.supervisor.decision_ttl_secs, 300);
        assert_eq!(config.bridge.dead_letter_max_size, 1000);
        assert!(!config.emergency.thresholds.is_empty());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = AppConfig::default();
        config.bus.dead_letter_max_size = 0;
        config.monitoring.monitoring_interval_secs = 0;
        config.bridge.circuit_breaker.half_open_max_calls = 1;
        config.bridge.circuit_breaker.success_threshold = 2;
        config.bridge.retry.max_delay_secs = 0.5;
        config.emergency.thresholds.push(EmergencyThreshold::new(
            "response_time",
            "avg_response_time_ms",
            1.0,
            Severity::Low,
            EmergencyType::ResponseTimeDegradation,
        ));

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("bus.dead_letter_max_size")));
        assert!(errors.iter().any(|e| e.contains("monitoring_interval_secs")));
        assert!(errors.iter().any(|e| e.contains("half_open_max_calls")));
        assert!(errors.iter().any(|e| e.contains("bridge.retry.max_delay_secs")));
        assert!(errors.iter().any(|e| e.contains("duplicate threshold name")));
    }

    #[test]
    fn test_bridge_timeout_must_fit_inside_bus_delivery() {
        let mut config = AppConfig::default();
        config.bus.delivery_timeout_ms = 3000;
        config.bridge.handler_timeout_ms = 3000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("bridge.handler_timeout_ms"));

        config.bridge.handler_timeout_ms = 2500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_config_renders_as_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[supervisor]"));
        assert!(rendered.contains("[[emergency.thresholds]]"));
    }
}

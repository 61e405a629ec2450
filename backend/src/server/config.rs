use std::fs;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notifications::senders::webhook::WebhookConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// Empty disables the legacy gRPC listener.
    pub legacy_grpc_listen: String,
    pub database_url: String,
    pub log_dir: String,
    pub api_key: Option<String>,
    pub admin_session_tokens: Vec<String>,
    pub short_term_window_hours: i64,
    pub compaction_bucket_minutes: i64,
    pub maintenance_interval_seconds: u64,
    pub lifetime_billing_threshold_days: i64,
    /// Registers the `webhook` sender when present.
    pub webhook: Option<WebhookConfig>,
    pub settings: RuntimeSettings,
}

/// Operator-tunable values read by the workers at every use.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub notification_enabled: bool,
    pub notification_method: String,
    pub expire_notification_enabled: bool,
    pub expire_notification_lead_days: i64,
    pub record_preserve_hours: i64,
    pub ping_record_preserve_hours: i64,
    /// Percent of the traffic limit that triggers an alert.
    pub traffic_limit_percentage: f64,
    pub geo_ip_enabled: bool,
    pub allow_cors: bool,
    pub private_site: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            notification_enabled: true,
            notification_method: "empty".to_owned(),
            expire_notification_enabled: false,
            expire_notification_lead_days: 7,
            record_preserve_hours: 720,
            ping_record_preserve_hours: 24,
            traffic_limit_percentage: 80.0,
            geo_ip_enabled: false,
            allow_cors: false,
            private_site: false,
        }
    }
}

/// Partial update sent by `admin:updateSettings`.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct RuntimeSettingsPatch {
    pub notification_enabled: Option<bool>,
    pub notification_method: Option<String>,
    pub expire_notification_enabled: Option<bool>,
    pub expire_notification_lead_days: Option<i64>,
    pub record_preserve_hours: Option<i64>,
    pub ping_record_preserve_hours: Option<i64>,
    pub traffic_limit_percentage: Option<f64>,
    pub geo_ip_enabled: Option<bool>,
    pub allow_cors: Option<bool>,
    pub private_site: Option<bool>,
}

impl RuntimeSettings {
    /// Applies every field of `patch` or none of them.
    pub fn apply(&mut self, patch: RuntimeSettingsPatch) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(hours) = patch.record_preserve_hours {
            if hours <= 0 {
                return Err(ConfigError::Invalid {
                    field: "record_preserve_hours",
                    reason: "must be positive".to_owned(),
                });
            }
            next.record_preserve_hours = hours;
        }
        if let Some(hours) = patch.ping_record_preserve_hours {
            if hours <= 0 {
                return Err(ConfigError::Invalid {
                    field: "ping_record_preserve_hours",
                    reason: "must be positive".to_owned(),
                });
            }
            next.ping_record_preserve_hours = hours;
        }
        if let Some(pct) = patch.traffic_limit_percentage {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(ConfigError::Invalid {
                    field: "traffic_limit_percentage",
                    reason: "must be in (0, 100]".to_owned(),
                });
            }
            next.traffic_limit_percentage = pct;
        }
        if let Some(v) = patch.notification_enabled {
            next.notification_enabled = v;
        }
        if let Some(v) = patch.notification_method {
            next.notification_method = v;
        }
        if let Some(v) = patch.expire_notification_enabled {
            next.expire_notification_enabled = v;
        }
        if let Some(v) = patch.expire_notification_lead_days {
            next.expire_notification_lead_days = v.max(0);
        }
        if let Some(v) = patch.geo_ip_enabled {
            next.geo_ip_enabled = v;
        }
        if let Some(v) = patch.allow_cors {
            next.allow_cors = v;
        }
        if let Some(v) = patch.private_site {
            next.private_site = v;
        }
        *self = next;
        Ok(())
    }
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    listen: Option<String>,
    legacy_grpc_listen: Option<String>,
    database_url: Option<String>,
    log_dir: Option<String>,
    api_key: Option<String>,
    admin_session_tokens: Option<Vec<String>>,
    short_term_window_hours: Option<i64>,
    compaction_bucket_minutes: Option<i64>,
    maintenance_interval_seconds: Option<u64>,
    lifetime_billing_threshold_days: Option<i64>,
    // Only read from the file; nested tables do not map onto env vars.
    #[serde(default)]
    settings: Option<RuntimeSettings>,
    #[serde(default)]
    webhook: Option<WebhookConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:25774".to_string()
}

fn default_legacy_grpc_listen() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_database_url() -> String {
    "sqlite://data/nodewatch.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialServerConfig = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str).map_err(|source| ConfigError::Read {
                    path: path_str.to_owned(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path_str.to_owned(),
                    source,
                })?
            }
            _ => PartialServerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialServerConfig =
            envy::prefixed("NODEWATCH_").from_env::<PartialServerConfig>()?;

        // 3. Merge: environment overrides file
        let config = Self::merge(env_config, file_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Self {
        ServerConfig {
            listen: env.listen.or(file.listen).unwrap_or_else(default_listen),
            legacy_grpc_listen: env
                .legacy_grpc_listen
                .or(file.legacy_grpc_listen)
                .unwrap_or_else(default_legacy_grpc_listen),
            database_url: env
                .database_url
                .or(file.database_url)
                .unwrap_or_else(default_database_url),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            api_key: env.api_key.or(file.api_key).filter(|k| !k.is_empty()),
            admin_session_tokens: env
                .admin_session_tokens
                .or(file.admin_session_tokens)
                .unwrap_or_default(),
            short_term_window_hours: env
                .short_term_window_hours
                .or(file.short_term_window_hours)
                .unwrap_or(4),
            compaction_bucket_minutes: env
                .compaction_bucket_minutes
                .or(file.compaction_bucket_minutes)
                .unwrap_or(60),
            maintenance_interval_seconds: env
                .maintenance_interval_seconds
                .or(file.maintenance_interval_seconds)
                .unwrap_or(3600),
            lifetime_billing_threshold_days: env
                .lifetime_billing_threshold_days
                .or(file.lifetime_billing_threshold_days)
                .unwrap_or(36500),
            webhook: file.webhook,
            settings: file.settings.unwrap_or_default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.short_term_window_hours <= 0 {
            return Err(ConfigError::Invalid {
                field: "short_term_window_hours",
                reason: "must be positive".to_owned(),
            });
        }
        if self.compaction_bucket_minutes <= 0 {
            return Err(ConfigError::Invalid {
                field: "compaction_bucket_minutes",
                reason: "must be positive".to_owned(),
            });
        }
        if self.maintenance_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "maintenance_interval_seconds",
                reason: "must be positive".to_owned(),
            });
        }
        Ok(())
    }

    pub fn short_term_window(&self) -> Duration {
        Duration::hours(self.short_term_window_hours)
    }

    pub fn compaction_bucket(&self) -> Duration {
        Duration::minutes(self.compaction_bucket_minutes)
    }

    pub fn lifetime_threshold(&self) -> Duration {
        Duration::days(self.lifetime_billing_threshold_days)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::merge(PartialServerConfig::default(), PartialServerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "0.0.0.0:25774");
        assert_eq!(config.legacy_grpc_listen, "0.0.0.0:5555");
        assert_eq!(config.short_term_window(), Duration::hours(4));
        assert_eq!(config.lifetime_threshold(), Duration::days(36500));
        assert_eq!(config.settings, RuntimeSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_wins_over_file() {
        let file: PartialServerConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:1"
            api_key = "file-key"
            [settings]
            allow_cors = true
            [webhook]
            url = "http://127.0.0.1:9/hook"
            "#,
        )
        .unwrap();
        let env = PartialServerConfig {
            listen: Some("127.0.0.1:2".into()),
            ..Default::default()
        };
        let config = ServerConfig::merge(env, file);
        assert_eq!(config.listen, "127.0.0.1:2");
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
        assert!(config.settings.allow_cors);
        assert_eq!(config.settings.notification_method, "empty");
        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.method, "POST");
        assert!(webhook.body_template.is_none());
    }

    #[test]
    fn settings_patch_validates_before_applying() {
        let mut settings = RuntimeSettings::default();
        let err = settings.apply(RuntimeSettingsPatch {
            traffic_limit_percentage: Some(150.0),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(settings.traffic_limit_percentage, 80.0);

        settings
            .apply(RuntimeSettingsPatch {
                notification_method: Some("webhook".into()),
                private_site: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(settings.notification_method, "webhook");
        assert!(settings.private_site);
    }
}

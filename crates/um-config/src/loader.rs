//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "user-management.toml",
    "./config/config.toml",
    "/etc/user-management/config.toml",
];

const ENV_PREFIX: &str = "USER_MANAGEMENT_";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());

        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("USER_MANAGEMENT_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

/// Apply `USER_MANAGEMENT_*` overrides. Unparseable numbers and booleans are ignored.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    macro_rules! set_string {
        ($name:expr, $field:expr) => {
            if let Some(val) = var($name) {
                $field = val;
            }
        };
    }

    macro_rules! set_parsed {
        ($name:expr, $field:expr) => {
            if let Some(val) = var($name) {
                if let Ok(parsed) = val.trim().parse() {
                    $field = parsed;
                }
            }
        };
    }

    set_parsed!("DEBUG", config.debug);

    // Broker
    set_string!("BROKER_TYPE", config.broker.broker_type);
    set_string!("BROKER_URI", config.broker.uri);
    set_string!("USER_TOPIC", config.broker.user_topic);
    set_string!("CONSUMER_GROUP", config.broker.consumer_group);
    set_parsed!("INIT_TOPICS", config.broker.init_topics);
    set_parsed!("PREFETCH_COUNT", config.broker.prefetch_count);
    set_parsed!("RECONNECT_INTERVAL_SECS", config.broker.reconnect_interval_secs);
    set_parsed!("FAILURE_BACKOFF_SECS", config.broker.failure_backoff_secs);
    set_parsed!("PUBLISH_MAX_ATTEMPTS", config.broker.publish_max_attempts);
    set_parsed!("PUBLISH_TIMEOUT_SECS", config.broker.publish_timeout_secs);

    // Keycloak
    set_string!("KEYCLOAK_URL", config.keycloak.url);
    set_string!("KEYCLOAK_REALM", config.keycloak.realm);
    set_string!("KEYCLOAK_CLIENT_ID", config.keycloak.client_id);
    set_string!("KEYCLOAK_CLIENT_SECRET", config.keycloak.client_secret);
    set_parsed!(
        "KEYCLOAK_EXPIRATION_BUFFER_SECS",
        config.keycloak.expiration_buffer_secs
    );

    // Cleanup
    set_parsed!("BATCH_SIZE", config.cleanup.batch_size);
    set_parsed!("LOOP_LIMIT", config.cleanup.loop_limit);
    set_parsed!("HTTP_TIMEOUT_MS", config.cleanup.http_timeout_ms);
    set_parsed!("HTTP_RETRY_ATTEMPTS", config.cleanup.http_retry_attempts);
    set_parsed!("HTTP_RETRY_DELAY_MS", config.cleanup.http_retry_delay_ms);
    set_string!("TOKEN_ISSUER", config.cleanup.token_issuer);
    set_parsed!("TOKEN_LIFETIME_SECS", config.cleanup.token_lifetime_secs);
    set_string!("SIGNING_KEY_PATH", config.cleanup.signing_key_path);
    set_parsed!(
        "REMOVE_EXPORT_DATABASE_METADATA",
        config.cleanup.remove_export_database_metadata
    );

    // Downstream services
    set_string!("WAITING_ROOM_URL", config.services.waiting_room_url);
    set_string!("DASHBOARD_URL", config.services.dashboard_url);
    set_string!("PROCESS_SCHEDULER_URL", config.services.process_scheduler_url);
    set_string!("IMPORTS_DEPLOYMENT_URL", config.services.imports_deployment_url);
    set_string!("BROKER_EXPORTS_URL", config.services.broker_exports_url);
    set_string!("DATABASE_EXPORTS_URL", config.services.database_exports_url);
    set_string!(
        "ANALYTICS_OPERATOR_REPO_URL",
        config.services.analytics_operator_repo_url
    );
    set_string!("ANALYTICS_FLOW_REPO_URL", config.services.analytics_flow_repo_url);
    set_string!("NOTIFIER_URL", config.services.notifier_url);
    set_string!("DEVICE_REPOSITORY_URL", config.services.device_repository_url);
}

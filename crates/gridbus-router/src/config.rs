//! Configuration loading with defaults.
//!
//! A missing config file is normal (defaults apply); an unreadable or
//! unparsable one is logged and also falls back to defaults. The
//! protected-topics document is stricter: it guards publishes, so a broken
//! file is an error rather than a silent empty table.

use gridbus_types::capability::{ProtectedTopics, ProtectedTopicsConfig};
use gridbus_types::config::RouterConfig;
use gridbus_types::error::{GridBusError, GridBusResult};
use std::path::Path;
use tracing::{info, warn};

/// Load router configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> RouterConfig {
    let Some(config_path) = path else {
        info!("no config path given, using defaults");
        return RouterConfig::default();
    };

    if !config_path.exists() {
        info!(path = %config_path.display(), "config file not found, using defaults");
        return RouterConfig::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<RouterConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "failed to parse config, using defaults"
                );
                RouterConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "failed to read config file, using defaults"
            );
            RouterConfig::default()
        }
    }
}

/// Load and compile the protected-topics JSON document.
pub fn load_protected_topics(path: &Path) -> GridBusResult<ProtectedTopics> {
    let contents = std::fs::read_to_string(path)?;
    let config: ProtectedTopicsConfig = serde_json::from_str(&contents).map_err(|e| {
        GridBusError::Config(format!(
            "invalid protected-topics file {}: {e}",
            path.display()
        ))
    })?;
    ProtectedTopics::compile(&config)
}

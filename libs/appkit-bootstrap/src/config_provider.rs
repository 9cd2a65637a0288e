use crate::config::AppConfig;
use std::sync::Arc;

/// Read access to the per-module configuration bag and the global sections.
pub trait ConfigProvider: Send + Sync {
    /// Get the configuration for a specific module
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;

    /// Get a global section (`server`, `database`, `event_bus`, ...) as JSON
    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value>;
}

/// Implementation of ConfigProvider that uses AppConfig
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_name)
    }

    fn get_config_raw(&self, key: &str) -> Option<serde_json::Value> {
        let cfg = &self.0;
        match key {
            "server" => serde_json::to_value(&cfg.server).ok(),
            "database" => cfg
                .database
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "event_bus" => serde_json::to_value(&cfg.event_bus).ok(),
            "runtime" => serde_json::to_value(&cfg.runtime).ok(),
            "shutdown" => serde_json::to_value(&cfg.shutdown).ok(),
            "logging" => cfg
                .logging
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            _ => None,
        }
    }
}

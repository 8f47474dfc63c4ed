//! Node and model-cache configuration.
//!
//! ```text
//! NodeConfig
//! ├── max_frame_bytes: usize        # largest accepted packet body
//! ├── reconnect_interval_ms: u64    # registry re-dial delay
//! ├── heartbeat_interval_ms: u64    # 0 disables keep-alive
//! └── model: ModelCacheConfig
//!     ├── root_cache_size: usize    # resident rows per level
//!     ├── initial_action            # FetchRootSize | PrefetchData
//!     ├── prefetch_roles: [i32]     # empty = all available roles
//!     └── max_pushed_cells: usize   # dataChanged push threshold
//! ```
//!
//! Every field has a default, so `{}` is a valid JSON configuration.

use crate::error::{RemoteObjectsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`ModelCacheConfig::root_cache_size`].
pub const CACHE_SIZE_ENV: &str = "REMOTE_OBJECTS_CACHE_SIZE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default)]
    pub heartbeat_interval_ms: u64,

    #[serde(default)]
    pub model: ModelCacheConfig,
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_reconnect_interval_ms() -> u64 {
    500
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat_interval_ms: 0,
            model: ModelCacheConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)
            .map_err(|e| RemoteObjectsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < 64 {
            return Err(RemoteObjectsError::Config(format!(
                "max_frame_bytes must be at least 64, got {}",
                self.max_frame_bytes
            )));
        }
        self.model.validate()
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// What a model replica loads before announcing itself initialized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InitialAction {
    /// Only the root row/column counts.
    #[default]
    FetchRootSize,
    /// The root counts plus the first page of rows (bounded by the cache size).
    PrefetchData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCacheConfig {
    #[serde(default = "default_root_cache_size")]
    pub root_cache_size: usize,

    #[serde(default)]
    pub initial_action: InitialAction,

    #[serde(default)]
    pub prefetch_roles: Vec<i32>,

    #[serde(default = "default_max_pushed_cells")]
    pub max_pushed_cells: usize,
}

fn default_root_cache_size() -> usize {
    1000
}

fn default_max_pushed_cells() -> usize {
    256
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            root_cache_size: default_root_cache_size(),
            initial_action: InitialAction::default(),
            prefetch_roles: Vec::new(),
            max_pushed_cells: default_max_pushed_cells(),
        }
    }
}

impl ModelCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root_cache_size == 0 {
            return Err(RemoteObjectsError::Config(
                "root_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_prefetch(mut self, roles: Vec<i32>) -> Self {
        self.initial_action = InitialAction::PrefetchData;
        self.prefetch_roles = roles;
        self
    }

    pub fn with_cache_size(mut self, rows: usize) -> Self {
        self.root_cache_size = rows;
        self
    }

    /// Applies `REMOTE_OBJECTS_CACHE_SIZE` when set to a positive integer.
    pub fn with_env_overrides(self) -> Self {
        match std::env::var(CACHE_SIZE_ENV) {
            Ok(raw) => self.with_cache_size_override(&raw),
            Err(_) => self,
        }
    }

    fn with_cache_size_override(mut self, raw: &str) -> Self {
        match raw.trim().parse::<usize>() {
            Ok(rows) if rows > 0 => self.root_cache_size = rows,
            _ => tracing::warn!(
                target: "remote_objects::models",
                value = raw,
                "ignoring invalid {CACHE_SIZE_ENV}"
            ),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = NodeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.model.root_cache_size, 1000);
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.reconnect_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_model_section() {
        let config = NodeConfig::from_json_str(
            r#"{"heartbeat_interval_ms": 250, "model": {"root_cache_size": 50, "initial_action": "PrefetchData"}}"#,
        )
        .unwrap();
        assert_eq!(config.model.root_cache_size, 50);
        assert_eq!(config.model.initial_action, InitialAction::PrefetchData);
        assert_eq!(config.model.max_pushed_cells, 256);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = NodeConfig::from_json_str(r#"{"model": {"root_cache_size": 0}}"#).unwrap_err();
        assert!(matches!(err, RemoteObjectsError::Config(_)));
        let err = NodeConfig::from_json_str(r#"{"max_frame_bytes": 8}"#).unwrap_err();
        assert!(matches!(err, RemoteObjectsError::Config(_)));
        assert!(NodeConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_cache_size_override() {
        let config = ModelCacheConfig::default().with_cache_size_override("75");
        assert_eq!(config.root_cache_size, 75);
        let config = ModelCacheConfig::default().with_cache_size_override("zero");
        assert_eq!(config.root_cache_size, 1000);
        let config = ModelCacheConfig::default().with_cache_size_override("0");
        assert_eq!(config.root_cache_size, 1000);
    }
}

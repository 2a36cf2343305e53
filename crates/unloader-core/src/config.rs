#![forbid(unsafe_code)]

//! Engine tuning loaded as data.
//!
//! [`UnloaderConfig`] groups every constant the engine uses so a host can
//! override them from TOML or JSON without recompiling. Every field defaults
//! to the value the engine ships with, so `UnloaderConfig::default()` is the
//! stock behavior.
//!
//! ```toml
//! chunk_size = 20
//! strategy = "detach"
//!
//! [codec]
//! compress_min_bytes = 256
//! ```
//!
//! User-facing toggles (enabled, buffer size) live in [`crate::settings`].

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How a collapsed entry leaves the render tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollapseStrategy {
    /// Children are replaced by a sized placeholder; the entry node stays.
    InPlace,
    /// The entry node is swapped for a sized sibling placeholder and kept
    /// off-tree until restored.
    #[default]
    Detach,
}

/// Content codec parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Sanitized markup shorter than this is stored uncompressed.
    pub compress_min_bytes: usize,
    /// `<pre>` blocks with a body at least this long are replaced by a stub.
    pub large_code_block_bytes: usize,
    /// Per-node bookkeeping cost used by the size estimate.
    pub node_overhead_bytes: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compress_min_bytes: 256,
            large_code_block_bytes: 2000,
            node_overhead_bytes: 200,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloaderConfig {
    /// Entries ingested per idle slot.
    pub chunk_size: usize,
    /// Viewport window margin per buffer-size step, in CSS pixels.
    pub margin_per_buffer_px: f64,
    /// Period of the advisory maintenance tick, in milliseconds.
    pub maintenance_interval_ms: u64,
    /// Memory history samples retained (oldest evicted first).
    pub history_capacity: usize,
    pub strategy: CollapseStrategy,
    /// Attribute carrying the entry role; its presence marks an entry.
    pub role_attribute: String,
    /// Selector matching entry nodes.
    pub entry_selector: String,
    /// Container selectors, tried in order.
    pub container_selectors: Vec<String>,
    pub codec: CodecConfig,
}

impl Default for UnloaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            margin_per_buffer_px: 400.0,
            maintenance_interval_ms: 30_000,
            history_capacity: 20,
            strategy: CollapseStrategy::default(),
            role_attribute: "data-message-author-role".to_owned(),
            entry_selector: "[data-message-author-role]".to_owned(),
            container_selectors: vec!["main".to_owned(), "[role=\"main\"]".to_owned(), "body".to_owned()],
            codec: CodecConfig::default(),
        }
    }
}

impl UnloaderConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(ConfigError::Toml)?;
        config.checked()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(ConfigError::Json)?;
        config.checked()
    }

    /// Validate parameter ranges. An empty list means the config is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.chunk_size == 0 {
            errors.push("chunk_size must be > 0".into());
        }
        if !(self.margin_per_buffer_px.is_finite() && self.margin_per_buffer_px >= 0.0) {
            errors.push(format!(
                "margin_per_buffer_px must be a finite value >= 0, got {}",
                self.margin_per_buffer_px
            ));
        }
        if self.maintenance_interval_ms == 0 {
            errors.push("maintenance_interval_ms must be > 0".into());
        }
        if self.history_capacity == 0 {
            errors.push("history_capacity must be > 0".into());
        }
        if self.role_attribute.trim().is_empty() {
            errors.push("role_attribute must not be empty".into());
        }
        if self.entry_selector.trim().is_empty() {
            errors.push("entry_selector must not be empty".into());
        }
        if self.container_selectors.is_empty() {
            errors.push("container_selectors must list at least one selector".into());
        }
        errors
    }

    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    fn checked(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Failure to load an [`UnloaderConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Json(serde_json::Error),
    Validation(Vec<String>),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Toml(e) => write!(f, "config TOML error: {e}"),
            Self::Json(e) => write!(f, "config JSON error: {e}"),
            Self::Validation(errors) => write!(f, "invalid config: {}", errors.join("; ")),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Toml(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(UnloaderConfig::default().validate().is_empty());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = UnloaderConfig::from_toml_str(
            "chunk_size = 50\nstrategy = \"in_place\"\n\n[codec]\ncompress_min_bytes = 0\n",
        )
        .unwrap();
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.strategy, CollapseStrategy::InPlace);
        assert_eq!(config.codec.compress_min_bytes, 0);
        assert_eq!(config.codec.node_overhead_bytes, 200);
        assert_eq!(config.history_capacity, 20);
    }

    #[test]
    fn json_loading_validates() {
        let err = UnloaderConfig::from_json_str(r#"{"chunk_size": 0, "history_capacity": 0}"#)
            .unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = UnloaderConfig::from_toml_str("chunk_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
        assert!(err.to_string().starts_with("config TOML error"));
    }

    #[test]
    fn maintenance_interval_from_millis() {
        assert_eq!(
            UnloaderConfig::default().maintenance_interval(),
            Duration::from_secs(30)
        );
    }
}

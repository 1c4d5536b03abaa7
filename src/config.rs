//! Capture worker configuration.
//!
//! Built either programmatically via [`SaverConfig::builder`] or from a TOML
//! document. Validation happens once, before the worker starts; the loop
//! itself never re-checks these invariants.

use crate::error::{Result, SaverError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default sleep between empty polls.
const DEFAULT_POLL_BACKOFF: Duration = Duration::from_millis(5);

fn default_poll_backoff() -> Duration {
    DEFAULT_POLL_BACKOFF
}

fn default_bus_url() -> String {
    "inproc://camera-frames".to_string()
}

/// Constructor inputs for a capture run.
#[derive(Debug, Clone, Deserialize)]
pub struct SaverConfig {
    /// Store file to create.
    pub output_path: PathBuf,

    /// Staging budget in bytes; block capacity is `budget / frame_bytes`.
    pub memory_budget_bytes: u64,

    /// Nominal camera frame rate, used for the metadata record and the
    /// loss detector's expected inter-frame interval.
    pub frame_rate: f64,

    /// Bus address the subscription is opened against. The in-process
    /// source carries it for logging only.
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Topic prefix filter; empty subscribes to everything.
    #[serde(default)]
    pub topic: String,

    /// Caller-supplied metadata persisted into the store record. Values are
    /// normalized to JSON primitives at store creation.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    /// Sleep between empty polls (e.g. `"5ms"` in TOML).
    #[serde(default = "default_poll_backoff", with = "humantime_serde")]
    pub poll_backoff: Duration,

    /// Loss threshold override in picoseconds; defaults to twice the
    /// nominal inter-frame interval.
    #[serde(default)]
    pub loss_threshold_ps: Option<u64>,
}

impl SaverConfig {
    /// Start building a config for the given output path.
    pub fn builder(output_path: impl Into<PathBuf>) -> SaverConfigBuilder {
        SaverConfigBuilder::new(output_path)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| SaverError::invalid_config(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML config file.
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check invariants the capture loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes == 0 {
            return Err(SaverError::invalid_config("memory budget must be non-zero"));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(SaverError::invalid_config(format!(
                "frame rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if self.loss_threshold_ps == Some(0) {
            return Err(SaverError::invalid_config(
                "loss threshold must be non-zero",
            ));
        }
        Ok(())
    }

    /// Expected inter-frame interval in picoseconds.
    pub fn nominal_interval_ps(&self) -> u64 {
        ((1e12 / self.frame_rate).round() as u64).max(1)
    }
}

/// Builder for [`SaverConfig`].
#[derive(Debug)]
pub struct SaverConfigBuilder {
    config: SaverConfig,
}

impl SaverConfigBuilder {
    fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            config: SaverConfig {
                output_path: output_path.into(),
                memory_budget_bytes: 256 * 1024 * 1024,
                frame_rate: 30.0,
                bus_url: default_bus_url(),
                topic: String::new(),
                metadata: BTreeMap::new(),
                poll_backoff: DEFAULT_POLL_BACKOFF,
                loss_threshold_ps: None,
            },
        }
    }

    pub fn memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_budget_bytes = bytes;
        self
    }

    pub fn frame_rate(mut self, fps: f64) -> Self {
        self.config.frame_rate = fps;
        self
    }

    pub fn bus_url(mut self, url: impl Into<String>) -> Self {
        self.config.bus_url = url.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    /// Add one metadata key to persist with the recording.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.metadata.insert(key.into(), value);
        self
    }

    pub fn poll_backoff(mut self, backoff: Duration) -> Self {
        self.config.poll_backoff = backoff;
        self
    }

    pub fn loss_threshold_ps(mut self, threshold: u64) -> Self {
        self.config.loss_threshold_ps = Some(threshold);
        self
    }

    /// Validate and return the finished config.
    pub fn build(self) -> Result<SaverConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults_and_validation() {
        let config = SaverConfig::builder("out.msv")
            .memory_budget_bytes(1024)
            .frame_rate(200.0)
            .topic("camera.frames")
            .metadata("camera", json!("basler-a2"))
            .build()
            .unwrap();

        assert_eq!(config.poll_backoff, Duration::from_millis(5));
        assert_eq!(config.nominal_interval_ps(), 5_000_000_000);
        assert_eq!(config.metadata.get("camera"), Some(&json!("basler-a2")));

        assert!(SaverConfig::builder("out.msv")
            .memory_budget_bytes(0)
            .build()
            .is_err());
        assert!(SaverConfig::builder("out.msv")
            .frame_rate(-1.0)
            .build()
            .is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = SaverConfig::from_toml_str(
            r#"
            output_path = "/data/run_042.msv"
            memory_budget_bytes = 67108864
            frame_rate = 120.0
            topic = "camera.frames"
            poll_backoff = "2ms"

            [metadata]
            exposure = "1 ms"
            binning = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.output_path, PathBuf::from("/data/run_042.msv"));
        assert_eq!(config.memory_budget_bytes, 67_108_864);
        assert_eq!(config.poll_backoff, Duration::from_millis(2));
        assert_eq!(config.metadata.get("binning"), Some(&json!(2)));
        assert_eq!(config.bus_url, "inproc://camera-frames");
    }

    #[test]
    fn test_bad_toml_is_invalid_config() {
        let err = SaverConfig::from_toml_str("output_path = 3").unwrap_err();
        assert!(matches!(err, SaverError::InvalidConfig { .. }));

        let err = SaverConfig::from_toml_str(
            r#"
            output_path = "x.msv"
            memory_budget_bytes = 0
            frame_rate = 100.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("memory budget"));
    }
}

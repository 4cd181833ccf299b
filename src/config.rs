//! Registry configuration.
//!
//! A [`LooperConfig`] decides how the main loop is driven, where the virtual
//! clock starts after each reset, and how frame clocks deliver ticks. It can
//! be built in code, overridden from `LOOPERLAB_*` environment variables, or
//! (with the `config-file` feature) loaded from TOML:
//!
//! ```toml
//! mode = "instrumentation_test"
//! initial_uptime_ms = 100
//! frame_interval_ms = 16
//! frame_delivery = "deferred"
//! frame_timing = "timeline"
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::types::Time;

/// How the main loop is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LooperMode {
    /// Manual advance: the main loop starts paused and only runs what the test drives.
    #[default]
    Paused,
    /// Interactive: the main loop runs freely and may be paused and unpaused by the test.
    InstrumentationTest,
}

/// When a frame clock delivers the tick it was asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDelivery {
    /// Deferred while the owning loop is paused, immediate otherwise.
    #[default]
    Auto,
    /// Advance the clock one frame interval and deliver straight away.
    Immediate,
    /// Record the next vsync time; deliver once the clock reaches it.
    Deferred,
}

/// Which per-frame metadata ticks carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTiming {
    /// Frame counter and timestamp only.
    #[default]
    Basic,
    /// Also a frame timeline (vsync id, expected present time, deadline, interval).
    Timeline,
}

/// Error loading or validating a [`LooperConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Setting name.
        key: &'static str,
        /// Offending text.
        value: String,
    },
    /// The settings are individually valid but not together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// Config file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Io {
        /// File path.
        path: String,
        /// OS error text.
        reason: String,
    },
}

/// Settings for a [`LooperRegistry`](crate::looper::LooperRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Main loop driving mode.
    pub mode: LooperMode,
    /// Clock value at creation and after every registry reset.
    pub initial_uptime_ms: u64,
    /// Time between frames.
    pub frame_interval_ms: u64,
    /// Frame tick delivery policy.
    pub frame_delivery: FrameDelivery,
    /// Frame metadata capability.
    pub frame_timing: FrameTiming,
    /// Name of the main loop thread.
    pub main_thread_name: String,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            mode: LooperMode::Paused,
            initial_uptime_ms: 100,
            frame_interval_ms: 1,
            frame_delivery: FrameDelivery::Auto,
            frame_timing: FrameTiming::Basic,
            main_thread_name: "main".to_owned(),
        }
    }
}

impl LooperConfig {
    /// Environment variable for [`mode`](Self::mode).
    pub const ENV_MODE: &'static str = "LOOPERLAB_MODE";
    /// Environment variable for [`initial_uptime_ms`](Self::initial_uptime_ms).
    pub const ENV_INITIAL_UPTIME_MS: &'static str = "LOOPERLAB_INITIAL_UPTIME_MS";
    /// Environment variable for [`frame_interval_ms`](Self::frame_interval_ms).
    pub const ENV_FRAME_INTERVAL_MS: &'static str = "LOOPERLAB_FRAME_INTERVAL_MS";
    /// Environment variable for [`frame_delivery`](Self::frame_delivery).
    pub const ENV_FRAME_DELIVERY: &'static str = "LOOPERLAB_FRAME_DELIVERY";
    /// Environment variable for [`frame_timing`](Self::frame_timing).
    pub const ENV_FRAME_TIMING: &'static str = "LOOPERLAB_FRAME_TIMING";

    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the main loop mode.
    #[must_use]
    pub fn with_mode(mut self, mode: LooperMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the clock start, truncated to whole milliseconds.
    #[must_use]
    pub fn with_initial_uptime(mut self, uptime: Duration) -> Self {
        self.initial_uptime_ms = duration_millis(uptime);
        self
    }

    /// Sets the frame interval, truncated to whole milliseconds.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval_ms = duration_millis(interval);
        self
    }

    /// Sets the frame delivery policy.
    #[must_use]
    pub fn with_frame_delivery(mut self, delivery: FrameDelivery) -> Self {
        self.frame_delivery = delivery;
        self
    }

    /// Sets the frame metadata capability.
    #[must_use]
    pub fn with_frame_timing(mut self, timing: FrameTiming) -> Self {
        self.frame_timing = timing;
        self
    }

    /// Sets the main loop thread name.
    #[must_use]
    pub fn with_main_thread_name(mut self, name: impl Into<String>) -> Self {
        self.main_thread_name = name.into();
        self
    }

    /// Clock value at creation and after reset.
    #[must_use]
    pub fn initial_uptime(&self) -> Time {
        Time::from_millis(self.initial_uptime_ms)
    }

    /// Time between frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "frame_interval_ms must be positive".to_owned(),
            ));
        }
        if self.main_thread_name.is_empty() {
            return Err(ConfigError::Invalid(
                "main_thread_name must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `LOOPERLAB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by the `ENV_*` names.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(Self::ENV_MODE) {
            self.mode = parse_enum(Self::ENV_MODE, &raw)?;
        }
        if let Some(raw) = lookup(Self::ENV_INITIAL_UPTIME_MS) {
            self.initial_uptime_ms = parse_number(Self::ENV_INITIAL_UPTIME_MS, &raw)?;
        }
        if let Some(raw) = lookup(Self::ENV_FRAME_INTERVAL_MS) {
            self.frame_interval_ms = parse_number(Self::ENV_FRAME_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(Self::ENV_FRAME_DELIVERY) {
            self.frame_delivery = parse_enum(Self::ENV_FRAME_DELIVERY, &raw)?;
        }
        if let Some(raw) = lookup(Self::ENV_FRAME_TIMING) {
            self.frame_timing = parse_enum(Self::ENV_FRAME_TIMING, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Parses a TOML document; missing keys keep their defaults.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_owned(),
    })
}

/// Parses a snake_case variant name through serde.
fn parse_enum<T: for<'de> Deserialize<'de>>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
    T::deserialize(serde::de::value::StrDeserializer::<serde::de::value::Error>::new(
        &normalized,
    ))
    .map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_owned(),
    })
}

impl FromStr for LooperMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_enum(LooperConfig::ENV_MODE, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_manual_advance() {
        let config = LooperConfig::default();
        assert_eq!(config.mode, LooperMode::Paused);
        assert_eq!(config.initial_uptime(), Time::from_millis(100));
        assert_eq!(config.frame_interval(), Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_apply_and_normalize() {
        let config = LooperConfig::default()
            .with_overrides(lookup(&[
                ("LOOPERLAB_MODE", "Instrumentation-Test"),
                ("LOOPERLAB_FRAME_INTERVAL_MS", " 16 "),
                ("LOOPERLAB_FRAME_TIMING", "timeline"),
            ]))
            .unwrap();
        assert_eq!(config.mode, LooperMode::InstrumentationTest);
        assert_eq!(config.frame_interval_ms, 16);
        assert_eq!(config.frame_timing, FrameTiming::Timeline);
        assert_eq!(config.frame_delivery, FrameDelivery::Auto);
    }

    #[test]
    fn bad_override_names_the_key() {
        let err = LooperConfig::default()
            .with_overrides(lookup(&[("LOOPERLAB_FRAME_DELIVERY", "sometimes")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "LOOPERLAB_FRAME_DELIVERY",
                value: "sometimes".to_owned()
            }
        );
    }

    #[test]
    fn zero_frame_interval_is_rejected() {
        let err = LooperConfig::default()
            .with_overrides(lookup(&[("LOOPERLAB_FRAME_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn builder_truncates_to_millis() {
        let config = LooperConfig::new()
            .with_initial_uptime(Duration::from_micros(2_500))
            .with_frame_interval(Duration::from_millis(16));
        assert_eq!(config.initial_uptime_ms, 2);
        assert_eq!(config.frame_interval_ms, 16);
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("paused".parse::<LooperMode>().unwrap(), LooperMode::Paused);
        assert!("legacy".parse::<LooperMode>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_value(LooperConfig::default()).unwrap();
        assert_eq!(json["mode"], "paused");
        assert_eq!(json["frame_delivery"], "auto");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_file_round_trip() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mode = \"instrumentation_test\"\nframe_interval_ms = 16\nmain_thread_name = \"ui\""
        )
        .unwrap();
        let config = LooperConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.mode, LooperMode::InstrumentationTest);
        assert_eq!(config.frame_interval_ms, 16);
        assert_eq!(config.main_thread_name, "ui");
        assert_eq!(config.initial_uptime_ms, 100, "missing keys keep defaults");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_parse_errors_are_reported() {
        let err = LooperConfig::from_toml_str("mode = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

//! Container configuration: presets, validation and loading.
//!
//! Sources, in increasing priority:
//! - built-in defaults / presets
//! - configuration files (TOML, JSON, YAML)
//! - `INJECTOR_*` environment variables

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};

use crate::{errors::DiError, logging::LogVerbosity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfiguration {
    /// Shows up in log fields and diagnostics.
    pub name: String,
    pub log_level: LogVerbosity,
    /// Enables the domain-hop optimizer and the fast-path cache.
    pub optimization_enabled: bool,
    /// Abort bootstrap when declared dependencies form a cycle.
    pub strict_cycles: bool,
    /// Warn once per type when a scoped registration falls back to transient.
    pub warn_on_scope_degradation: bool,
    /// How long a caller waits for another caller's in-flight construction.
    pub construction_timeout_ms: u64,
    pub hot_path: HotPathConfig,
    pub optimizer: OptimizerConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Fast-path cache limits for domain-pinned singletons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotPathConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Recent resolutions per type considered for domain dominance.
    pub window: usize,
    /// Minimum recent resolutions before any suggestion is made.
    pub min_samples: usize,
    /// Share of recent resolutions a domain needs to be dominant.
    pub dominance_ratio: f64,
    /// Average hop overhead above which pinning is suggested.
    pub hop_overhead_threshold_us: u64,
    /// Total resolutions after which a type counts as hot.
    pub hot_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Capacity of the resolution event channel; events beyond it are dropped.
    pub event_buffer: usize,
    pub max_reported_cycles: usize,
    /// Recent resolution latencies kept for percentiles.
    pub latency_window: usize,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            log_level: LogVerbosity::Errors,
            optimization_enabled: true,
            strict_cycles: false,
            warn_on_scope_degradation: true,
            construction_timeout_ms: 30_000,
            hot_path: HotPathConfig::default(),
            optimizer: OptimizerConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Default for HotPathConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl_ms: 600_000, // 10 minutes
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            window: 64,
            min_samples: 16,
            dominance_ratio: 0.8,
            hop_overhead_threshold_us: 50,
            hot_threshold: 100,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            event_buffer: 16_384,
            max_reported_cycles: 64,
            latency_window: 1_000,
        }
    }
}

impl ContainerConfiguration {
    pub fn production() -> Self {
        Self {
            name: "production".to_string(),
            log_level: LogVerbosity::Errors,
            optimization_enabled: true,
            strict_cycles: true,
            construction_timeout_ms: 10_000,
            hot_path: HotPathConfig {
                max_entries: 1_024,
                ttl_ms: 1_800_000,
            },
            diagnostics: DiagnosticsConfig {
                event_buffer: 65_536,
                ..DiagnosticsConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            name: "development".to_string(),
            log_level: LogVerbosity::All,
            construction_timeout_ms: 60_000,
            optimizer: OptimizerConfig {
                min_samples: 8,
                ..OptimizerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Small buffers and no optimizer, for tests.
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            log_level: LogVerbosity::Off,
            optimization_enabled: false,
            warn_on_scope_degradation: false,
            construction_timeout_ms: 5_000,
            hot_path: HotPathConfig {
                max_entries: 16,
                ttl_ms: 60_000,
            },
            diagnostics: DiagnosticsConfig {
                event_buffer: 1_024,
                max_reported_cycles: 16,
                latency_window: 100,
            },
            ..Self::default()
        }
    }

    /// Preset by name, as accepted by `INJECTOR_PRESET`.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Some(Self::production()),
            "development" | "dev" => Some(Self::development()),
            "minimal" | "test" => Some(Self::minimal()),
            "default" => Some(Self::default()),
            _ => None,
        }
    }

    pub fn construction_timeout(&self) -> Duration {
        Duration::from_millis(self.construction_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), DiError> {
        if self.construction_timeout_ms == 0 {
            return Err(DiError::configuration(
                "construction timeout must be positive",
                "construction_timeout_ms",
            ));
        }
        if self.diagnostics.event_buffer == 0 {
            return Err(DiError::configuration(
                "event buffer must hold at least one event",
                "diagnostics.event_buffer",
            ));
        }
        if self.diagnostics.latency_window == 0 {
            return Err(DiError::configuration(
                "latency window must be positive",
                "diagnostics.latency_window",
            ));
        }
        if !(self.optimizer.dominance_ratio > 0.0 && self.optimizer.dominance_ratio <= 1.0) {
            return Err(DiError::configuration(
                format!(
                    "dominance ratio must be in (0, 1], got {}",
                    self.optimizer.dominance_ratio
                ),
                "optimizer.dominance_ratio",
            ));
        }
        if self.optimizer.window == 0 || self.optimizer.min_samples > self.optimizer.window {
            return Err(DiError::configuration(
                "optimizer window must be positive and at least min_samples",
                "optimizer.window",
            ));
        }
        if self.hot_path.ttl_ms == 0 {
            return Err(DiError::configuration(
                "fast-path ttl must be positive",
                "hot_path.ttl_ms",
            ));
        }
        Ok(())
    }
}

impl HotPathConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl OptimizerConfig {
    pub fn hop_overhead_threshold(&self) -> Duration {
        Duration::from_micros(self.hop_overhead_threshold_us)
    }
}

/// Loads [`ContainerConfiguration`] from files and the environment.
pub struct ConfigurationLoader {
    env_prefix: String,
    validate_on_load: bool,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: "INJECTOR".to_string(),
            validate_on_load: true,
        }
    }

    pub fn env_prefix<S: Into<String>>(&mut self, prefix: S) -> &mut Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn validate(&mut self, enabled: bool) -> &mut Self {
        self.validate_on_load = enabled;
        self
    }

    /// Defaults (or `INJECTOR_PRESET`) overlaid with environment variables.
    pub fn load(&self) -> Result<ContainerConfiguration> {
        let preset_var = format!("{}_PRESET", self.env_prefix);
        let mut config = match env::var(&preset_var) {
            Ok(name) => ContainerConfiguration::preset(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown preset '{}' in {}", name, preset_var))?,
            Err(_) => ContainerConfiguration::default(),
        };
        self.apply_environment_variables(&mut config)?;
        self.finish(config)
    }

    /// File contents overlaid with environment variables.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<ContainerConfiguration> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let mut config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::parse_toml(&content)?,
            Some("json") => Self::parse_json(&content)?,
            Some("yaml") | Some("yml") => Self::parse_yaml(&content)?,
            _ => {
                return Err(anyhow::anyhow!(
                    "Unsupported configuration file format: {:?}",
                    path.extension()
                ))
            }
        };
        self.apply_environment_variables(&mut config)?;
        self.finish(config)
    }

    pub fn load_from_toml(&self, content: &str) -> Result<ContainerConfiguration> {
        self.finish(Self::parse_toml(content)?)
    }

    pub fn load_from_json(&self, content: &str) -> Result<ContainerConfiguration> {
        self.finish(Self::parse_json(content)?)
    }

    pub fn load_from_yaml(&self, content: &str) -> Result<ContainerConfiguration> {
        self.finish(Self::parse_yaml(content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(
        &self,
        config: &ContainerConfiguration,
        path: P,
    ) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(config)?,
            Some("json") => serde_json::to_string_pretty(config)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(config)?,
            _ => {
                return Err(anyhow::anyhow!(
                    "Unsupported configuration file format: {:?}",
                    path.extension()
                ))
            }
        };
        fs::write(path, content)?;
        Ok(())
    }

    fn parse_toml(content: &str) -> Result<ContainerConfiguration> {
        Ok(toml::from_str(content)?)
    }

    fn parse_json(content: &str) -> Result<ContainerConfiguration> {
        Ok(serde_json::from_str(content)?)
    }

    fn parse_yaml(content: &str) -> Result<ContainerConfiguration> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn finish(&self, config: ContainerConfiguration) -> Result<ContainerConfiguration> {
        if self.validate_on_load {
            config.validate()?;
        }
        Ok(config)
    }

    pub fn apply_environment_variables(&self, config: &mut ContainerConfiguration) -> Result<()> {
        let prefix = format!("{}_", self.env_prefix);

        for (key, value) in env::vars() {
            if let Some(config_key) = key.strip_prefix(&prefix) {
                self.apply_env_var(config, config_key, &value)?;
            }
        }

        Ok(())
    }

    fn apply_env_var(
        &self,
        config: &mut ContainerConfiguration,
        key: &str,
        value: &str,
    ) -> Result<()> {
        match key.to_uppercase().as_str() {
            "NAME" => config.name = value.to_string(),
            "LOG_LEVEL" => {
                config.log_level = value.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            }
            "OPTIMIZATION_ENABLED" => config.optimization_enabled = parse_bool(value)?,
            "STRICT_CYCLES" => config.strict_cycles = parse_bool(value)?,
            "WARN_ON_SCOPE_DEGRADATION" => config.warn_on_scope_degradation = parse_bool(value)?,
            "CONSTRUCTION_TIMEOUT_MS" => config.construction_timeout_ms = value.parse()?,
            "HOT_PATH_MAX_ENTRIES" => config.hot_path.max_entries = value.parse()?,
            "HOT_PATH_TTL_MS" => config.hot_path.ttl_ms = value.parse()?,
            "OPTIMIZER_WINDOW" => config.optimizer.window = value.parse()?,
            "OPTIMIZER_MIN_SAMPLES" => config.optimizer.min_samples = value.parse()?,
            "OPTIMIZER_DOMINANCE_RATIO" => config.optimizer.dominance_ratio = value.parse()?,
            "OPTIMIZER_HOP_THRESHOLD_US" => {
                config.optimizer.hop_overhead_threshold_us = value.parse()?
            }
            "OPTIMIZER_HOT_THRESHOLD" => config.optimizer.hot_threshold = value.parse()?,
            "EVENT_BUFFER" => config.diagnostics.event_buffer = value.parse()?,
            "MAX_REPORTED_CYCLES" => config.diagnostics.max_reported_cycles = value.parse()?,
            // Consumed by `load` before the overlay.
            "PRESET" => {}
            other => {
                tracing::debug!(key = other, "ignoring unknown configuration variable");
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn presets_are_valid() {
        for config in [
            ContainerConfiguration::default(),
            ContainerConfiguration::production(),
            ContainerConfiguration::development(),
            ContainerConfiguration::minimal(),
        ] {
            assert!(config.validate().is_ok(), "{} preset invalid", config.name);
        }
        assert!(ContainerConfiguration::production().strict_cycles);
        assert!(!ContainerConfiguration::minimal().optimization_enabled);
    }

    #[test]
    fn validation_rejects_bad_ratio() {
        let mut config = ContainerConfiguration::default();
        config.optimizer.dominance_ratio = 1.5;
        match config.validate() {
            Err(DiError::Configuration { field, .. }) => {
                assert_eq!(field.as_deref(), Some("optimizer.dominance_ratio"))
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn load_from_toml_keeps_defaults_for_missing_fields() -> Result<()> {
        let loader = ConfigurationLoader::new();
        let config = loader.load_from_toml(
            r#"
            name = "app"
            log_level = "optimizations"

            [hot_path]
            max_entries = 32

            [optimizer]
            dominance_ratio = 0.75
            "#,
        )?;

        assert_eq!(config.name, "app");
        assert_eq!(config.log_level, LogVerbosity::Optimizations);
        assert_eq!(config.hot_path.max_entries, 32);
        assert_eq!(config.hot_path.ttl_ms, HotPathConfig::default().ttl_ms);
        assert_eq!(config.optimizer.dominance_ratio, 0.75);
        assert_eq!(config.optimizer.window, OptimizerConfig::default().window);
        Ok(())
    }

    #[test]
    fn load_from_json() -> Result<()> {
        let loader = ConfigurationLoader::new();
        let config = loader.load_from_json(
            r#"{ "strict_cycles": true, "diagnostics": { "event_buffer": 8 } }"#,
        )?;
        assert!(config.strict_cycles);
        assert_eq!(config.diagnostics.event_buffer, 8);
        Ok(())
    }

    #[test]
    fn invalid_content_is_rejected_on_load() {
        let loader = ConfigurationLoader::new();
        assert!(loader.load_from_toml("construction_timeout_ms = 0").is_err());

        let mut lenient = ConfigurationLoader::new();
        lenient.validate(false);
        assert!(lenient.load_from_toml("construction_timeout_ms = 0").is_ok());
    }

    #[test]
    #[serial]
    fn save_and_reload_through_files() -> Result<()> {
        let dir = TempDir::new()?;
        let loader = ConfigurationLoader::new();
        let config = ContainerConfiguration::development();

        for file in ["di.toml", "di.json", "di.yaml"] {
            let path = dir.path().join(file);
            loader.save_to_file(&config, &path)?;
            assert_eq!(loader.load_from_file(&path)?, config);
        }

        assert!(loader.load_from_file(dir.path().join("di.ini")).is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn environment_variables_override_values() -> Result<()> {
        env::set_var("INJECTOR_TEST_LOG_LEVEL", "all");
        env::set_var("INJECTOR_TEST_STRICT_CYCLES", "yes");
        env::set_var("INJECTOR_TEST_HOT_PATH_MAX_ENTRIES", "7");

        let mut loader = ConfigurationLoader::new();
        loader.env_prefix("INJECTOR_TEST");
        let mut config = ContainerConfiguration::minimal();
        loader.apply_environment_variables(&mut config)?;

        assert_eq!(config.log_level, LogVerbosity::All);
        assert!(config.strict_cycles);
        assert_eq!(config.hot_path.max_entries, 7);

        env::remove_var("INJECTOR_TEST_LOG_LEVEL");
        env::remove_var("INJECTOR_TEST_STRICT_CYCLES");
        env::remove_var("INJECTOR_TEST_HOT_PATH_MAX_ENTRIES");
        Ok(())
    }

    #[test]
    #[serial]
    fn load_uses_preset_variable() -> Result<()> {
        env::set_var("INJECTOR_PRESETTEST_PRESET", "production");
        let mut loader = ConfigurationLoader::new();
        loader.env_prefix("INJECTOR_PRESETTEST");
        let config = loader.load()?;
        env::remove_var("INJECTOR_PRESETTEST_PRESET");

        assert_eq!(config.name, "production");
        Ok(())
    }
}

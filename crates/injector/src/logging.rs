//! Logging verbosity for engine events and a subscriber initializer.
//!
//! The engine always logs through `tracing`; [`LogVerbosity`] decides which
//! categories of engine events are emitted at all.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::Level;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, EnvFilter, Registry};

/// Which engine events are logged. Each level includes the previous ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Off,
    Errors,
    Registrations,
    Optimizations,
    All,
}

impl LogVerbosity {
    pub fn errors(self) -> bool {
        self >= LogVerbosity::Errors
    }

    pub fn registrations(self) -> bool {
        self >= LogVerbosity::Registrations
    }

    pub fn optimizations(self) -> bool {
        self >= LogVerbosity::Optimizations
    }

    /// Per-resolution events (cache hits, constructions).
    pub fn all(self) -> bool {
        self >= LogVerbosity::All
    }
}

impl Default for LogVerbosity {
    fn default() -> Self {
        LogVerbosity::Errors
    }
}

impl fmt::Display for LogVerbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogVerbosity::Off => "off",
            LogVerbosity::Errors => "errors",
            LogVerbosity::Registrations => "registrations",
            LogVerbosity::Optimizations => "optimizations",
            LogVerbosity::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for LogVerbosity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(LogVerbosity::Off),
            "errors" | "error" => Ok(LogVerbosity::Errors),
            "registrations" | "registration" => Ok(LogVerbosity::Registrations),
            "optimizations" | "optimization" => Ok(LogVerbosity::Optimizations),
            "all" => Ok(LogVerbosity::All),
            other => Err(format!("unknown log verbosity '{other}'")),
        }
    }
}

/// Subscriber settings for binaries and test harnesses embedding the engine.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: Level,
    pub json_output: bool,
    pub color_output: bool,
    pub include_thread_ids: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_thread_ids: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let subscriber = Registry::default().with(env_filter).with(
            fmt_layer::layer()
                .json()
                .with_current_span(false)
                .with_thread_ids(config.include_thread_ids),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(env_filter).with(
            fmt_layer::layer()
                .with_target(true)
                .with_thread_ids(config.include_thread_ids)
                .with_line_number(config.include_line_numbers)
                .with_ansi(config.color_output),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

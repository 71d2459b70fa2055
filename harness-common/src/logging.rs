//! Logging setup shared by the runner and bundle binaries.
//!
//! Both binaries reserve stdout for protocol traffic, so logs go to stderr
//! unless a caller explicitly asks for stdout.

use anyhow::{Context as _, Result};
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable overriding the log level.
pub const LOG_LEVEL_ENV: &str = "HARNESS_LOG_LEVEL";
/// Environment variable selecting the log format (`pretty` or `json`).
pub const LOG_FORMAT_ENV: &str = "HARNESS_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `harness=debug`.
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
}

impl LogConfig {
    /// Config from `HARNESS_LOG_LEVEL` / `HARNESS_LOG_FORMAT`, falling back to
    /// `default_level` and pretty output.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Self {
            level,
            format,
            stderr: true,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_stdout(mut self) -> Self {
        self.stderr = false;
        self
    }
}

/// Keeps the background log writer alive; dropping it flushes pending lines.
pub struct LoggingGuards {
    _writer: WorkerGuard,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let (writer, guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(writer).with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer).with_current_span(false))
            .try_init(),
    };
    result.context("failed to install tracing subscriber")?;

    Ok(LoggingGuards { _writer: guard })
}

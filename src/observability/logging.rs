//! Structured logging system using tracing crate
//!
//! ## Log Format Options
//!
//! Output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON, one object per line, for log shippers
//! - `pretty` - Multi-line colored output for development
//! - `compact` - Single-line colored output for a serial console or journal
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # On the device, shipped to a collector
//! LOG_FORMAT=json LOG_LEVEL=INFO coopwatch run
//!
//! # Bench debugging of reconnect behavior
//! LOG_FORMAT=compact RUST_LOG=coopwatch=debug,rumqttc=info coopwatch run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are chatty at INFO and below
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc=warn", "warp=warn", "hyper=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string, defaulting to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Full filter override, as `RUST_LOG` would supply it
    pub filter_override: Option<String>,
}

impl LogSettings {
    /// Build settings from raw variable values; missing or invalid values fall back to defaults
    pub fn from_vars(
        level: Option<&str>,
        format: Option<&str>,
        spans: Option<&str>,
        rust_log: Option<&str>,
    ) -> Self {
        Self {
            level: parse_level(level.unwrap_or("INFO")),
            format: LogFormat::parse(format.unwrap_or("json")),
            include_spans: spans.is_some_and(|s| s.trim().eq_ignore_ascii_case("true")),
            filter_override: rust_log
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok();
        Self::from_vars(
            var("LOG_LEVEL").as_deref(),
            var("LOG_FORMAT").as_deref(),
            var("LOG_SPANS").as_deref(),
            var("RUST_LOG").as_deref(),
        )
    }

    /// Filter directives this configuration installs
    pub fn filter_directives(&self) -> String {
        match &self.filter_override {
            Some(directives) => directives.clone(),
            None => std::iter::once(self.level.to_string().to_lowercase())
                .chain(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber; returns false if one was already installed
pub fn init_logging(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_new(settings.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string()));
    let span_events = if settings.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };
    installed.is_ok()
}

/// Initialize logging from environment variables
pub fn init_default_logging() -> bool {
    init_logging(&LogSettings::from_env())
}

/// Span around link bring-up and health checks
#[macro_export]
macro_rules! link_span {
    ($($field:tt)*) => {
        tracing::info_span!("network_link", $($field)*)
    };
}

/// Span around MQTT session operations
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_session", $($field)*)
    };
}

/// Span around sampling and flushing telemetry
#[macro_export]
macro_rules! telemetry_span {
    ($($field:tt)*) => {
        tracing::info_span!("telemetry", $($field)*)
    };
}

// Re-export macros for convenience
pub use {link_span, session_span, telemetry_span};

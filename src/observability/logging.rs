//! Structured logging on top of `tracing`
//!
//! Every long-lived task runs inside one of three spans: `client` (a
//! reconnecting client and its loops), `session` (one accepted stream) or
//! `lease` (a registrar lease and its watchdogs). Fields such as
//! `client_id` and `lease_id` therefore show up on every event below them.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO (default), DEBUG or TRACE
//! - `LOG_FORMAT`: `json` (default), `pretty` or `compact`
//! - `LOG_SPANS`: `true` to also log span open and close
//! - `RUST_LOG`: full filter directives; replaces the level-based filter
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG fleetwire agent -c agent.toml
//! RUST_LOG=fleetwire::discovery=trace,info fleetwire serve
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored, no target
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Dependencies that log too much at INFO
const NOISY_TARGETS: &[&str] = &["hyper", "warp", "tokio", "h2", "tonic"];

/// Resolved logging setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` directives, if any
    pub directives: Option<String>,
}

impl LogSettings {
    /// Settings from raw environment values; `None` means unset
    pub fn from_values(
        level: Option<&str>,
        format: Option<&str>,
        spans: Option<&str>,
        rust_log: Option<&str>,
    ) -> Self {
        Self {
            level: level.map(parse_level).unwrap_or(Level::INFO),
            format: format.map(LogFormat::parse).unwrap_or(LogFormat::Json),
            include_spans: spans.is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
            directives: rust_log
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        }
    }

    pub fn from_env() -> Self {
        let level = env::var("LOG_LEVEL").ok();
        let format = env::var("LOG_FORMAT").ok();
        let spans = env::var("LOG_SPANS").ok();
        let rust_log = env::var("RUST_LOG").ok();
        Self::from_values(
            level.as_deref(),
            format.as_deref(),
            spans.as_deref(),
            rust_log.as_deref(),
        )
    }

    pub fn filter(&self) -> EnvFilter {
        build_filter(self.level, self.directives.as_deref())
    }

    /// Install the global subscriber. Returns false when one was already set.
    pub fn install(&self) -> bool {
        let spans = if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let registry = tracing_subscriber::registry().with(self.filter());

        let installed = match self.format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_span_events(spans))
                .try_init(),
            LogFormat::Pretty => registry
                .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(true)
                        .with_target(false)
                        .with_span_events(spans),
                )
                .try_init(),
        };
        installed.is_ok()
    }
}

/// Filter for `level` with noisy dependencies capped at WARN.
///
/// `rust_log` replaces the whole filter when it parses.
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(filter) = rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return filter;
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

/// `LOG_LEVEL` value to a level; anything unknown is INFO
pub fn parse_level(value: &str) -> Level {
    value.trim().parse().unwrap_or(Level::INFO)
}

/// Install logging with an explicit level and format; `RUST_LOG` still applies
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let mut settings = LogSettings::from_env();
    settings.level = level;
    settings.format = format;
    settings.include_spans = include_spans;
    settings.install();
}

/// Install logging configured from the environment
pub fn init_default_logging() {
    LogSettings::from_env().install();
}

/// Span for one reconnecting client and the tasks it spawns
#[macro_export]
macro_rules! client_span {
    ($($field:tt)*) => {
        tracing::info_span!("client", $($field)*)
    };
}

/// Span for one server-side session
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("session", $($field)*)
    };
}

/// Span for a registrar lease and its watchdogs
#[macro_export]
macro_rules! lease_span {
    ($($field:tt)*) => {
        tracing::info_span!("lease", $($field)*)
    };
}

pub use {client_span, lease_span, session_span};

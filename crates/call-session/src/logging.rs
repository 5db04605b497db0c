//! Logging setup
//!
//! The crate only emits `tracing` events; installing a subscriber is left to
//! the host. [`setup_logging`] is a convenience for hosts that have no logging
//! of their own.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::EndpointConfig;
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
    /// Include source file and line
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "sipdesk".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        Self {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Log at the verbosity configured for the engine endpoint
    pub fn for_endpoint(endpoint: &EndpointConfig, app_name: impl Into<String>) -> Self {
        Self::new(level_for_engine_verbosity(endpoint.log_level), app_name)
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` directives are honoured in addition to `config.level`. Fails if
/// a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> SessionResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SessionError::configuration("logging", e.to_string()))?;

    tracing::info!("Starting {} v{}", config.app_name, crate::VERSION);
    Ok(())
}

pub fn parse_log_level(level: &str) -> SessionResult<Level> {
    Level::from_str(level)
        .map_err(|_| SessionError::configuration("logging.level", format!("invalid log level: {}", level)))
}

/// Map a SIP-stack verbosity (0 = fatal only, 6 = very detailed) onto a
/// `tracing` level
pub fn level_for_engine_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

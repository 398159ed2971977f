//! Logging configuration and setup.
//!
//! Filters come from, in order: an explicit [`LogConfig::with_filter`], the
//! `OFFLINE_LOG` environment variable, then the configured level applied to
//! the OfflineKit crates with HTTP client noise kept at `warn`. Output goes
//! to stderr so tools can print results on stdout.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "OFFLINE_LOG";

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "OFFLINE_LOG_FORMAT";

const CRATES: [&str; 5] = [
    "offline_common",
    "offline_net",
    "offline_sw",
    "offline_client",
    "offline_smoke",
];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the OfflineKit crates when no filter is given.
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line.
    pub include_location: bool,
    /// Log span enter/close.
    pub include_span_events: bool,
    /// Filter directives, e.g. "offline_sw=debug,reqwest=warn".
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Debug output with source locations and span events.
    pub fn debug() -> Self {
        Self::default().with_verbosity(1)
    }

    /// Defaults overridden by `OFFLINE_LOG_FORMAT`; unknown formats are ignored.
    pub fn from_env() -> Self {
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        Self::default().with_format(format)
    }

    /// Raise detail by `-v` count: 0 info, 1 debug, 2+ trace.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.level = match verbosity {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        self.include_location = verbosity > 0;
        self.include_span_events = verbosity > 0;
        self
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Directives used when neither a filter nor `OFFLINE_LOG` is set.
    pub fn default_directives(&self) -> String {
        let level = self.level.to_string().to_lowercase();
        let mut directives: Vec<String> = CRATES
            .iter()
            .map(|name| format!("{name}={level}"))
            .collect();
        directives.push("reqwest=warn".to_string());
        directives.push("hyper=warn".to_string());
        directives.join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directives());
        match &self.filter {
            Some(custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| fallback()),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(true)
                .with_span_events(span_events)
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(span_events)
                .with_writer(std::io::stderr)
                .boxed(),
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init_logging(config: LogConfig) {
    let result = tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init();

    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}
